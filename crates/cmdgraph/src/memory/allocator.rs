//! Unified shared memory front-end.
//!
//! The allocator assigns every allocation a fresh [`AllocationId`] and forwards the physical
//! reservation to the backend. Handles ([`UsmPtr`]) carry the id, a byte window and the
//! placement, so dependency tracking never has to compare raw addresses.

use std::collections::HashMap;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::spec::{BackendError, DeviceBackend};

use super::access::{AccessMode, AccessRecord, AllocationId, ByteRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placement {
    Device,
    Host,
    Shared,
}

impl Placement {
    /// Host and shared allocations may be read and written directly from the host.
    pub fn host_accessible(self) -> bool {
        matches!(self, Placement::Host | Placement::Shared)
    }
}

/// Byte size of `count` elements of `T`.
pub fn byte_size<T: Pod>(count: usize) -> Result<u64, MemoryError> {
    let element = size_of::<T>();
    count
        .checked_mul(element)
        .and_then(|bytes| u64::try_from(bytes).ok())
        .ok_or(MemoryError::SizeOverflow {
            count: count as u64,
            element,
        })
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("allocation {0} is not live")]
    UnknownAllocation(AllocationId),
    #[error("range [{offset}, {offset}+{len}) exceeds allocation {allocation} of {capacity} bytes")]
    OutOfBounds {
        allocation: AllocationId,
        offset: u64,
        len: u64,
        capacity: u64,
    },
    #[error("allocation {allocation} has {placement:?} placement and is not host accessible")]
    NotHostAccessible {
        allocation: AllocationId,
        placement: Placement,
    },
    #[error("zero-sized allocations are not supported")]
    ZeroSized,
    #[error("{bytes} bytes is not a whole number of {element}-byte elements")]
    Misaligned { bytes: u64, element: usize },
    #[error("{count} elements of {element} bytes overflow the address space")]
    SizeOverflow { count: u64, element: usize },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Handle to a window of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsmPtr {
    id: AllocationId,
    offset: u64,
    len: u64,
    placement: Placement,
}

impl UsmPtr {
    #[cfg(test)]
    pub(crate) fn from_raw_parts(id: AllocationId, offset: u64, len: u64, placement: Placement) -> Self {
        Self {
            id,
            offset,
            len,
            placement,
        }
    }

    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn byte_len(&self) -> u64 {
        self.len
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.offset, self.len)
    }

    pub fn access(&self, mode: AccessMode) -> AccessRecord {
        AccessRecord {
            allocation: self.id,
            range: self.range(),
            mode,
        }
    }

    /// Narrows the handle to `len` bytes starting `offset` bytes into the current window.
    pub fn slice(&self, offset: u64, len: u64) -> Result<UsmPtr, MemoryError> {
        let end = offset.checked_add(len);
        match end {
            Some(end) if end <= self.len => Ok(UsmPtr {
                id: self.id,
                offset: self.offset + offset,
                len,
                placement: self.placement,
            }),
            _ => Err(MemoryError::OutOfBounds {
                allocation: self.id,
                offset: self.offset.saturating_add(offset),
                len,
                capacity: self.offset + self.len,
            }),
        }
    }

    /// Element-typed view: `count` elements of `T` starting at element `first`.
    pub fn elements<T: Pod>(&self, first: usize, count: usize) -> Result<UsmPtr, MemoryError> {
        self.slice(byte_size::<T>(first)?, byte_size::<T>(count)?)
    }

    /// Number of whole `T` elements in the window.
    pub fn element_count<T: Pod>(&self) -> usize {
        (self.len / size_of::<T>() as u64) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocationInfo {
    pub bytes: u64,
    pub placement: Placement,
}

/// Allocation front-end shared by every queue and graph of a context.
pub struct UsmAllocator {
    backend: Arc<dyn DeviceBackend>,
    next_id: AtomicU64,
    live: Mutex<HashMap<AllocationId, AllocationInfo>>,
}

impl UsmAllocator {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            backend,
            next_id: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn allocate(&self, bytes: u64, placement: Placement) -> Result<UsmPtr, MemoryError> {
        if bytes == 0 {
            return Err(MemoryError::ZeroSized);
        }
        let id = AllocationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.backend.allocate(id, bytes, placement)?;
        self.live
            .lock()
            .expect("allocation table poisoned")
            .insert(id, AllocationInfo { bytes, placement });
        log::debug!("allocated {bytes} bytes ({placement:?}) as allocation {id}");
        Ok(UsmPtr {
            id,
            offset: 0,
            len: bytes,
            placement,
        })
    }

    pub fn malloc_device<T: Pod>(&self, count: usize) -> Result<UsmPtr, MemoryError> {
        self.allocate(byte_size::<T>(count)?, Placement::Device)
    }

    pub fn malloc_host<T: Pod>(&self, count: usize) -> Result<UsmPtr, MemoryError> {
        self.allocate(byte_size::<T>(count)?, Placement::Host)
    }

    pub fn malloc_shared<T: Pod>(&self, count: usize) -> Result<UsmPtr, MemoryError> {
        self.allocate(byte_size::<T>(count)?, Placement::Shared)
    }

    /// Releases the allocation behind `ptr`; any window of the allocation may be passed.
    pub fn free(&self, ptr: UsmPtr) -> Result<(), MemoryError> {
        let removed = self
            .live
            .lock()
            .expect("allocation table poisoned")
            .remove(&ptr.id);
        if removed.is_none() {
            return Err(MemoryError::UnknownAllocation(ptr.id));
        }
        self.backend.free(ptr.id)?;
        Ok(())
    }

    /// Verifies that `ptr` names a live allocation and that its window fits inside it.
    pub fn check(&self, ptr: &UsmPtr) -> Result<AllocationInfo, MemoryError> {
        let info = self
            .live
            .lock()
            .expect("allocation table poisoned")
            .get(&ptr.id)
            .copied()
            .ok_or(MemoryError::UnknownAllocation(ptr.id))?;
        if ptr.offset + ptr.len > info.bytes {
            return Err(MemoryError::OutOfBounds {
                allocation: ptr.id,
                offset: ptr.offset,
                len: ptr.len,
                capacity: info.bytes,
            });
        }
        Ok(info)
    }

    /// Reads a host-accessible window as typed elements.
    pub fn read_host<T: Pod>(&self, ptr: &UsmPtr) -> Result<Vec<T>, MemoryError> {
        let info = self.check(ptr)?;
        if !info.placement.host_accessible() {
            return Err(MemoryError::NotHostAccessible {
                allocation: ptr.id,
                placement: info.placement,
            });
        }
        self.read_elements(ptr)
    }

    /// Writes typed elements into a host-accessible window.
    pub fn write_host<T: Pod>(&self, ptr: &UsmPtr, data: &[T]) -> Result<(), MemoryError> {
        let info = self.check(ptr)?;
        if !info.placement.host_accessible() {
            return Err(MemoryError::NotHostAccessible {
                allocation: ptr.id,
                placement: info.placement,
            });
        }
        self.write_elements(ptr, data)
    }

    /// Snapshot of allocations that have not been freed, ordered by id.
    pub fn live_allocations(&self) -> Vec<(AllocationId, AllocationInfo)> {
        let mut live: Vec<_> = self
            .live
            .lock()
            .expect("allocation table poisoned")
            .iter()
            .map(|(id, info)| (*id, *info))
            .collect();
        live.sort_by_key(|(id, _)| *id);
        live
    }

    pub(crate) fn read_elements<T: Pod>(&self, ptr: &UsmPtr) -> Result<Vec<T>, MemoryError> {
        let element = size_of::<T>();
        if ptr.len % element as u64 != 0 {
            return Err(MemoryError::Misaligned {
                bytes: ptr.len,
                element,
            });
        }
        let mut out = vec![T::zeroed(); ptr.len as usize / element];
        self.backend
            .read_bytes(ptr.id, ptr.offset, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    pub(crate) fn write_elements<T: Pod>(&self, ptr: &UsmPtr, data: &[T]) -> Result<(), MemoryError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as u64 > ptr.len {
            return Err(MemoryError::OutOfBounds {
                allocation: ptr.id,
                offset: ptr.offset,
                len: bytes.len() as u64,
                capacity: ptr.offset + ptr.len,
            });
        }
        self.backend.write_bytes(ptr.id, ptr.offset, bytes)?;
        Ok(())
    }
}

impl Drop for UsmAllocator {
    fn drop(&mut self) {
        let live = match self.live.get_mut() {
            Ok(live) => std::mem::take(live),
            Err(_) => return,
        };
        if live.is_empty() {
            return;
        }
        let leaked: u64 = live.values().map(|info| info.bytes).sum();
        log::warn!(
            "LEAK: {} allocation(s) totalling {leaked} bytes were never freed",
            live.len()
        );
        for id in live.keys() {
            let _ = self.backend.free(*id);
        }
    }
}
