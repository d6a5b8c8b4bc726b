use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use cmdgraph::backend::spec::{
    BackendError, BackendResult, DeviceBackend, DeviceCommand, DeviceMemory, KernelLaunch,
};
use cmdgraph::kernel::KernelContext;
use cmdgraph::memory::{AllocationId, Placement, UsmPtr};

/// Hook consulted before every command; returning `Some` replaces the default execution.
pub trait CommandInterceptor: Send + Sync {
    fn try_execute(&self, command: &DeviceCommand) -> Option<BackendResult<()>>;
}

#[derive(Default)]
pub struct NoopInterceptor;

impl CommandInterceptor for NoopInterceptor {
    fn try_execute(&self, _command: &DeviceCommand) -> Option<BackendResult<()>> {
        None
    }
}

struct CpuAllocation {
    placement: Placement,
    data: Vec<u8>,
}

impl CpuAllocation {
    fn bounds(&self, id: AllocationId, offset: u64, len: u64) -> BackendResult<std::ops::Range<usize>> {
        let end = offset.checked_add(len);
        match end {
            Some(end) if end <= self.data.len() as u64 => Ok(offset as usize..end as usize),
            _ => Err(BackendError::out_of_bounds(
                id,
                offset,
                len,
                self.data.len() as u64,
            )),
        }
    }
}

/// Host reference device: every allocation is a byte vector, kernels run work items in order.
pub struct GenericCpuDevice<I: CommandInterceptor> {
    interceptor: Arc<I>,
    allocations: RwLock<HashMap<AllocationId, Arc<Mutex<CpuAllocation>>>>,
}

impl<I: CommandInterceptor> GenericCpuDevice<I> {
    pub fn with_interceptor(interceptor: I) -> Self {
        Self::with_arc(Arc::new(interceptor))
    }

    pub fn with_arc(interceptor: Arc<I>) -> Self {
        Self {
            interceptor,
            allocations: RwLock::new(HashMap::new()),
        }
    }

    pub fn interceptor(&self) -> &I {
        self.interceptor.as_ref()
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations
            .read()
            .expect("cpu allocation table poisoned")
            .len()
    }

    pub fn placement_of(&self, id: AllocationId) -> Option<Placement> {
        let allocation = self.allocation(id).ok()?;
        let placement = allocation
            .lock()
            .expect("cpu allocation poisoned")
            .placement;
        Some(placement)
    }

    fn allocation(&self, id: AllocationId) -> BackendResult<Arc<Mutex<CpuAllocation>>> {
        self.allocations
            .read()
            .expect("cpu allocation table poisoned")
            .get(&id)
            .cloned()
            .ok_or(BackendError::UnknownAllocation(id))
    }

    fn copy(&self, src: &UsmPtr, dst: &UsmPtr, bytes: u64) -> BackendResult<()> {
        let mut staging = vec![0u8; bytes as usize];
        self.read_bytes(src.id(), src.offset(), &mut staging)?;
        self.write_bytes(dst.id(), dst.offset(), &staging)
    }

    fn copy_2d(
        &self,
        src: &UsmPtr,
        src_pitch: u64,
        dst: &UsmPtr,
        dst_pitch: u64,
        width: u64,
        height: u64,
    ) -> BackendResult<()> {
        let mut row = vec![0u8; width as usize];
        for y in 0..height {
            self.read_bytes(src.id(), src.offset() + y * src_pitch, &mut row)?;
            self.write_bytes(dst.id(), dst.offset() + y * dst_pitch, &row)?;
        }
        Ok(())
    }

    fn fill(&self, dst: &UsmPtr, pattern: &[u8], bytes: u64) -> BackendResult<()> {
        if pattern.is_empty() {
            return Err(BackendError::execution("fill pattern is empty"));
        }
        let data: Vec<u8> = pattern
            .iter()
            .copied()
            .cycle()
            .take(bytes as usize)
            .collect();
        self.write_bytes(dst.id(), dst.offset(), &data)
    }

    fn launch(&self, launch: &KernelLaunch) -> BackendResult<()> {
        log::trace!(
            "launching {} ({}) over {} work items",
            launch.kernel.name(),
            launch.image.image_id,
            launch.range.len()
        );
        let ctx = KernelContext::new(self, launch);
        for item in launch.range.iter() {
            launch.kernel.invoke(&ctx, item)?;
        }
        Ok(())
    }
}

impl GenericCpuDevice<NoopInterceptor> {
    pub fn new() -> Self {
        Self::with_interceptor(NoopInterceptor)
    }
}

impl Default for GenericCpuDevice<NoopInterceptor> {
    fn default() -> Self {
        Self::new()
    }
}

pub type CpuDevice = GenericCpuDevice<NoopInterceptor>;

impl<I: CommandInterceptor> DeviceMemory for GenericCpuDevice<I> {
    fn read_bytes(&self, allocation: AllocationId, offset: u64, out: &mut [u8]) -> BackendResult<()> {
        let handle = self.allocation(allocation)?;
        let guard = handle.lock().expect("cpu allocation poisoned");
        let range = guard.bounds(allocation, offset, out.len() as u64)?;
        out.copy_from_slice(&guard.data[range]);
        Ok(())
    }

    fn write_bytes(&self, allocation: AllocationId, offset: u64, data: &[u8]) -> BackendResult<()> {
        let handle = self.allocation(allocation)?;
        let mut guard = handle.lock().expect("cpu allocation poisoned");
        let range = guard.bounds(allocation, offset, data.len() as u64)?;
        guard.data[range].copy_from_slice(data);
        Ok(())
    }

    fn atomic_update(
        &self,
        allocation: AllocationId,
        offset: u64,
        update: &mut dyn FnMut(u32) -> BackendResult<u32>,
    ) -> BackendResult<u32> {
        let handle = self.allocation(allocation)?;
        let mut guard = handle.lock().expect("cpu allocation poisoned");
        let range = guard.bounds(allocation, offset, 4)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&guard.data[range.clone()]);
        let old = u32::from_le_bytes(word);
        let new = update(old)?;
        guard.data[range].copy_from_slice(&new.to_le_bytes());
        Ok(old)
    }
}

impl<I: CommandInterceptor> DeviceBackend for GenericCpuDevice<I> {
    fn backend_name(&self) -> &str {
        "cpu-reference"
    }

    fn supports_concurrent_execution(&self) -> bool {
        true
    }

    fn allocate(&self, allocation: AllocationId, bytes: u64, placement: Placement) -> BackendResult<()> {
        let mut table = self
            .allocations
            .write()
            .expect("cpu allocation table poisoned");
        if table.contains_key(&allocation) {
            return Err(BackendError::execution(format!(
                "allocation {allocation} already exists"
            )));
        }
        log::debug!("cpu device allocating {allocation}: {bytes} bytes ({placement:?})");
        table.insert(
            allocation,
            Arc::new(Mutex::new(CpuAllocation {
                placement,
                data: vec![0u8; bytes as usize],
            })),
        );
        Ok(())
    }

    fn free(&self, allocation: AllocationId) -> BackendResult<()> {
        self.allocations
            .write()
            .expect("cpu allocation table poisoned")
            .remove(&allocation)
            .map(|_| ())
            .ok_or(BackendError::UnknownAllocation(allocation))
    }

    fn execute(&self, command: &DeviceCommand) -> BackendResult<()> {
        if let Some(result) = self.interceptor.try_execute(command) {
            return result;
        }
        match command {
            DeviceCommand::Copy { src, dst, bytes } => self.copy(src, dst, *bytes),
            DeviceCommand::Copy2d {
                src,
                src_pitch,
                dst,
                dst_pitch,
                width,
                height,
            } => self.copy_2d(src, *src_pitch, dst, *dst_pitch, *width, *height),
            DeviceCommand::Fill {
                dst,
                pattern,
                bytes,
            } => self.fill(dst, pattern, *bytes),
            DeviceCommand::Kernel(launch) => self.launch(launch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_past_the_end_are_rejected() {
        let device = CpuDevice::new();
        device
            .allocate(AllocationId(1), 8, Placement::Device)
            .unwrap();
        let mut out = [0u8; 4];
        let err = device.read_bytes(AllocationId(1), 6, &mut out).unwrap_err();
        assert!(matches!(err, BackendError::OutOfBounds { capacity: 8, .. }));
    }

    #[test]
    fn atomic_update_returns_previous_word() {
        let device = CpuDevice::new();
        device
            .allocate(AllocationId(1), 8, Placement::Shared)
            .unwrap();
        device
            .write_bytes(AllocationId(1), 4, &7u32.to_le_bytes())
            .unwrap();
        let old = device
            .atomic_update(AllocationId(1), 4, &mut |v| Ok(v + 1))
            .unwrap();
        assert_eq!(old, 7);
        let mut out = [0u8; 4];
        device.read_bytes(AllocationId(1), 4, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 8);
    }

    #[test]
    fn freed_allocations_are_unknown() {
        let device = CpuDevice::new();
        device
            .allocate(AllocationId(3), 4, Placement::Host)
            .unwrap();
        assert_eq!(device.placement_of(AllocationId(3)), Some(Placement::Host));
        device.free(AllocationId(3)).unwrap();
        assert!(matches!(
            device.free(AllocationId(3)),
            Err(BackendError::UnknownAllocation(_))
        ));
        assert_eq!(device.allocation_count(), 0);
    }
}
