use std::sync::{Arc, Mutex};

use cmdgraph::backend::spec::{
    BackendError, BackendResult, DeviceBackend, DeviceCommand, DeviceMemory,
};
use cmdgraph::memory::{AllocationId, Placement, UsmPtr};

/// Test-only device wrapper that logs every executed command and can inject kernel failures.
pub struct RecordingDevice {
    inner: Arc<dyn DeviceBackend>,
    executed: Mutex<Vec<String>>,
    failing_kernel: Mutex<Option<String>>,
}

impl RecordingDevice {
    pub fn new(inner: Arc<dyn DeviceBackend>) -> Self {
        Self {
            inner,
            executed: Mutex::new(Vec::new()),
            failing_kernel: Mutex::new(None),
        }
    }

    /// Labels of executed commands in completion order (`"memcpy"`, `"kernel:<name>"`, ...).
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .expect("recording device mutex poisoned")
            .clone()
    }

    pub fn clear(&self) {
        self.executed
            .lock()
            .expect("recording device mutex poisoned")
            .clear();
    }

    /// Every later launch of `kernel` fails with an execution error.
    pub fn fail_kernel(&self, kernel: &str) {
        *self
            .failing_kernel
            .lock()
            .expect("recording device mutex poisoned") = Some(kernel.to_string());
    }

    fn label(command: &DeviceCommand) -> String {
        match command {
            DeviceCommand::Kernel(launch) => format!("kernel:{}", launch.kernel.name()),
            other => other.label().to_string(),
        }
    }
}

impl DeviceMemory for RecordingDevice {
    fn read_bytes(&self, allocation: AllocationId, offset: u64, out: &mut [u8]) -> BackendResult<()> {
        self.inner.read_bytes(allocation, offset, out)
    }

    fn write_bytes(&self, allocation: AllocationId, offset: u64, data: &[u8]) -> BackendResult<()> {
        self.inner.write_bytes(allocation, offset, data)
    }

    fn atomic_update(
        &self,
        allocation: AllocationId,
        offset: u64,
        update: &mut dyn FnMut(u32) -> BackendResult<u32>,
    ) -> BackendResult<u32> {
        self.inner.atomic_update(allocation, offset, update)
    }

    fn device_address(&self, ptr: &UsmPtr) -> u64 {
        self.inner.device_address(ptr)
    }
}

impl DeviceBackend for RecordingDevice {
    fn backend_name(&self) -> &str {
        "recording"
    }

    fn supports_concurrent_execution(&self) -> bool {
        self.inner.supports_concurrent_execution()
    }

    fn allocate(&self, allocation: AllocationId, bytes: u64, placement: Placement) -> BackendResult<()> {
        self.inner.allocate(allocation, bytes, placement)
    }

    fn free(&self, allocation: AllocationId) -> BackendResult<()> {
        self.inner.free(allocation)
    }

    fn execute(&self, command: &DeviceCommand) -> BackendResult<()> {
        if let DeviceCommand::Kernel(launch) = command {
            let failing = self
                .failing_kernel
                .lock()
                .expect("recording device mutex poisoned")
                .clone();
            if failing.as_deref() == Some(launch.kernel.name()) {
                return Err(BackendError::execution(format!(
                    "injected failure in kernel {}",
                    launch.kernel.name()
                )));
            }
        }
        let result = self.inner.execute(command);
        self.executed
            .lock()
            .expect("recording device mutex poisoned")
            .push(Self::label(command));
        result
    }
}
