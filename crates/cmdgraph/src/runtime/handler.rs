use anyhow::{anyhow, bail, ensure, Result};
use bytemuck::Pod;
use smallvec::SmallVec;

use crate::graph::Payload;
use crate::kernel::{Kernel, NdRange};
use crate::memory::{byte_size, AccessMode, AccessRecord, UsmPtr};
use crate::specialization::{
    KernelBundle, SpecConstType, SpecializationConstantSet, SpecializationId,
};

use super::queue::Queue;

/// Builder for one command group: declared accesses, constant values and exactly one command.
pub struct CommandGroupHandler<'q> {
    queue: &'q Queue,
    accesses: SmallVec<[AccessRecord; 4]>,
    constants: SpecializationConstantSet,
    bundle: Option<KernelBundle>,
    payload: Option<Payload>,
}

impl<'q> CommandGroupHandler<'q> {
    pub(crate) fn new(queue: &'q Queue) -> Self {
        Self {
            queue,
            accesses: SmallVec::new(),
            constants: SpecializationConstantSet::new(),
            bundle: None,
            payload: None,
        }
    }

    pub fn queue(&self) -> &Queue {
        self.queue
    }

    /// Declares that the command accesses `ptr` with `mode`.
    pub fn access(&mut self, ptr: &UsmPtr, mode: AccessMode) -> Result<()> {
        self.queue.context().allocator().check(ptr)?;
        self.accesses.push(ptr.access(mode));
        Ok(())
    }

    pub fn read(&mut self, ptr: &UsmPtr) -> Result<()> {
        self.access(ptr, AccessMode::Read)
    }

    pub fn write(&mut self, ptr: &UsmPtr) -> Result<()> {
        self.access(ptr, AccessMode::Write)
    }

    pub fn read_write(&mut self, ptr: &UsmPtr) -> Result<()> {
        self.access(ptr, AccessMode::ReadWrite)
    }

    pub fn set_specialization_constant<T: SpecConstType>(
        &mut self,
        id: &SpecializationId<T>,
        value: T,
    ) -> Result<()> {
        if self.bundle.is_some() {
            bail!("cannot set specialization constant {} on a command group that uses a kernel bundle", id.id());
        }
        self.constants.set(id, value);
        Ok(())
    }

    pub fn use_kernel_bundle(&mut self, bundle: &KernelBundle) -> Result<()> {
        if !self.constants.is_empty() {
            bail!("cannot use a kernel bundle after setting specialization constants on the command group");
        }
        self.bundle = Some(bundle.clone());
        Ok(())
    }

    fn set_payload(&mut self, payload: Payload) -> Result<()> {
        if self.payload.is_some() {
            bail!("a command group may contain only one command");
        }
        self.payload = Some(payload);
        Ok(())
    }

    pub fn parallel_for(&mut self, range: impl Into<NdRange>, kernel: &Kernel) -> Result<()> {
        let constants = match &self.bundle {
            Some(bundle) => {
                ensure!(
                    bundle.contains(kernel),
                    "kernel {} is not part of the kernel bundle",
                    kernel.name()
                );
                bundle.constants().clone()
            }
            None => self.constants.clone(),
        };
        self.set_payload(Payload::Kernel {
            kernel: kernel.clone(),
            range: range.into(),
            constants,
        })
    }

    pub fn single_task(&mut self, kernel: &Kernel) -> Result<()> {
        self.parallel_for(NdRange::single(), kernel)
    }

    pub fn memcpy(&mut self, dst: &UsmPtr, src: &UsmPtr, bytes: u64) -> Result<()> {
        let src = src.slice(0, bytes)?;
        let dst = dst.slice(0, bytes)?;
        self.read(&src)?;
        self.write(&dst)?;
        self.set_payload(Payload::Copy { src, dst, bytes })
    }

    /// Copies `height` rows of `width` bytes between pitched regions.
    pub fn memcpy_2d(
        &mut self,
        dst: &UsmPtr,
        dst_pitch: u64,
        src: &UsmPtr,
        src_pitch: u64,
        width: u64,
        height: u64,
    ) -> Result<()> {
        ensure!(
            width <= src_pitch && width <= dst_pitch,
            "row width {width} exceeds pitch (src {src_pitch}, dst {dst_pitch})"
        );
        let extent = |pitch: u64| -> Result<u64> {
            if height == 0 {
                return Ok(0);
            }
            pitch
                .checked_mul(height - 1)
                .and_then(|rows| rows.checked_add(width))
                .ok_or_else(|| anyhow!("{height} rows of pitch {pitch} overflow the address space"))
        };
        let src = src.slice(0, extent(src_pitch)?)?;
        let dst = dst.slice(0, extent(dst_pitch)?)?;
        self.read(&src)?;
        self.write(&dst)?;
        self.set_payload(Payload::Copy2d {
            src,
            src_pitch,
            dst,
            dst_pitch,
            width,
            height,
        })
    }

    /// Fills `count` elements of `dst` with `value`.
    pub fn fill<T: Pod>(&mut self, dst: &UsmPtr, value: T, count: usize) -> Result<()> {
        let bytes = byte_size::<T>(count)?;
        let dst = dst.slice(0, bytes)?;
        self.write(&dst)?;
        self.set_payload(Payload::Fill {
            dst,
            pattern: SmallVec::from_slice(bytemuck::bytes_of(&value)),
            bytes,
        })
    }

    pub fn memset(&mut self, dst: &UsmPtr, value: u8, bytes: u64) -> Result<()> {
        self.fill(dst, value, bytes as usize)
    }

    pub(crate) fn finish(self) -> Result<(Payload, SmallVec<[AccessRecord; 4]>)> {
        let payload = match self.payload {
            Some(payload) => payload,
            None => bail!("command group did not enqueue a command"),
        };
        let accesses = self
            .accesses
            .into_iter()
            .filter(|access| !access.range.is_empty())
            .collect();
        Ok((payload, accesses))
    }
}
