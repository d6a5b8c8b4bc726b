pub mod backend;
mod config;
mod env;
pub mod graph;
pub mod kernel;
pub mod memory;
pub mod runtime;
pub mod specialization;
pub mod trace;

pub use backend::spec::{BackendError, BackendResult, DeviceBackend, DeviceCommand, DeviceMemory};
pub use config::RuntimeConfig;
pub use graph::{CommandGraph, ExecutableGraph, GraphError, OperationId, RecordingSession};
pub use kernel::{AtomicOp, Kernel, KernelContext, NdRange, WorkItem};
pub use memory::{AccessMode, MemoryError, Placement, UsmAllocator, UsmPtr};
pub use runtime::{CommandGroupHandler, Context, Event, EventStatus, Queue, QueueProperties};
pub use specialization::{
    DeviceImageVariant, ImageKind, InMemoryImageStore, KernelBundle, SpecializationId,
};
pub use trace::{ApiCallRecord, ApiTrace};
