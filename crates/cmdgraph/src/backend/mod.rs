//! Device-facing layer: the backend contract, the backend registry and graph topology checks.
pub mod hashing;
pub mod registry;
pub mod spec;
pub mod topology;

pub use spec::{
    BackendError, BackendResult, ConstantArgument, DeviceBackend, DeviceCommand, DeviceMemory,
    KernelLaunch,
};
