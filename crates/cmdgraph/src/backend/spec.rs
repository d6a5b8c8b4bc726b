//! Device contract consumed by the engine.
//!
//! A backend owns physical memory for every [`AllocationId`] handed out by the allocator and
//! executes lowered [`DeviceCommand`]s. Everything above this trait (recording, dependency
//! inference, scheduling, image selection) is backend-agnostic.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::kernel::{Kernel, NdRange};
use crate::memory::{AllocationId, Placement, UsmPtr};
use crate::specialization::{ConstantLayout, DeviceImageVariant};

/// Backend error surfaced to higher layers.
#[derive(Debug, Clone)]
pub enum BackendError {
    OutOfBounds {
        allocation: AllocationId,
        offset: u64,
        bytes: u64,
        capacity: u64,
    },
    UnknownAllocation(AllocationId),
    Unimplemented { op: &'static str, reason: String },
    Execution { message: String },
}

impl BackendError {
    pub fn out_of_bounds(allocation: AllocationId, offset: u64, bytes: u64, capacity: u64) -> Self {
        BackendError::OutOfBounds {
            allocation,
            offset,
            bytes,
            capacity,
        }
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::OutOfBounds {
                allocation,
                offset,
                bytes,
                capacity,
            } => write!(
                f,
                "out-of-bounds access to allocation {allocation}: {bytes} bytes at offset {offset} exceeds {capacity} bytes"
            ),
            BackendError::UnknownAllocation(id) => {
                write!(f, "allocation {id} is not live on this device")
            }
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Execution { message } => {
                write!(f, "device execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Byte-addressed view of device memory used by kernels while they run.
pub trait DeviceMemory: Send + Sync {
    /// Copies `out.len()` bytes starting at `offset` of `allocation` into `out`.
    fn read_bytes(&self, allocation: AllocationId, offset: u64, out: &mut [u8]) -> BackendResult<()>;

    /// Writes `data` at `offset` of `allocation`.
    fn write_bytes(&self, allocation: AllocationId, offset: u64, data: &[u8]) -> BackendResult<()>;

    /// Performs an indivisible read-modify-write of the dword at `offset` and returns the old value.
    ///
    /// `update` receives the current bits and returns the bits to store.
    fn atomic_update(
        &self,
        allocation: AllocationId,
        offset: u64,
        update: &mut dyn FnMut(u32) -> BackendResult<u32>,
    ) -> BackendResult<u32>;

    /// Returns the device-visible address of a pointer, as reported in API traces.
    fn device_address(&self, ptr: &UsmPtr) -> u64 {
        0x7f00_0000_0000u64 + (ptr.id().0 << 32) + ptr.offset()
    }
}

/// How the specialization-constant argument slot of a launch is bound.
#[derive(Debug, Clone)]
pub enum ConstantArgument {
    /// The kernel references no specialization constants.
    Unused,
    /// Defaults are baked into the selected image; the slot receives a null pointer.
    Null,
    /// The slot points at a device buffer laid out per `layout`.
    Buffer {
        ptr: UsmPtr,
        layout: Arc<ConstantLayout>,
    },
}

/// Fully resolved kernel launch handed to a backend.
#[derive(Clone)]
pub struct KernelLaunch {
    pub kernel: Kernel,
    pub range: NdRange,
    pub image: Arc<DeviceImageVariant>,
    pub constants: ConstantArgument,
}

impl fmt::Debug for KernelLaunch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelLaunch")
            .field("kernel", &self.kernel.name())
            .field("range", &self.range)
            .field("image", &self.image.image_id)
            .field("constants", &self.constants)
            .finish()
    }
}

/// Device-submittable form of one recorded operation.
#[derive(Debug, Clone)]
pub enum DeviceCommand {
    Copy {
        src: UsmPtr,
        dst: UsmPtr,
        bytes: u64,
    },
    Copy2d {
        src: UsmPtr,
        src_pitch: u64,
        dst: UsmPtr,
        dst_pitch: u64,
        width: u64,
        height: u64,
    },
    Fill {
        dst: UsmPtr,
        pattern: SmallVec<[u8; 16]>,
        bytes: u64,
    },
    Kernel(KernelLaunch),
}

impl DeviceCommand {
    pub fn label(&self) -> &'static str {
        match self {
            DeviceCommand::Copy { .. } => "memcpy",
            DeviceCommand::Copy2d { .. } => "memcpy_2d",
            DeviceCommand::Fill { .. } => "fill",
            DeviceCommand::Kernel(_) => "kernel",
        }
    }
}

/// Device trait that owns memory and executes lowered commands.
pub trait DeviceBackend: DeviceMemory {
    /// Returns a human-readable backend identifier (e.g., `"cpu-reference"`).
    fn backend_name(&self) -> &str;

    /// Returns true when commands without mutual dependencies may run on separate threads.
    fn supports_concurrent_execution(&self) -> bool {
        false
    }

    /// Reserves `bytes` of zeroed memory for `allocation`.
    fn allocate(&self, allocation: AllocationId, bytes: u64, placement: Placement)
        -> BackendResult<()>;

    /// Releases the memory behind `allocation`.
    fn free(&self, allocation: AllocationId) -> BackendResult<()>;

    /// Executes a single command to completion.
    fn execute(&self, command: &DeviceCommand) -> BackendResult<()>;
}
