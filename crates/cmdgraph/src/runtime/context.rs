use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytemuck::Pod;

use crate::backend::registry::create_backend;
use crate::backend::spec::DeviceBackend;
use crate::config::RuntimeConfig;
use crate::env;
use crate::graph::OperationId;
use crate::kernel::Kernel;
use crate::memory::{UsmAllocator, UsmPtr};
use crate::specialization::{ImageSelector, ImageStore, InMemoryImageStore, KernelBundle};
use crate::trace::ApiTrace;

use super::queue::QueueId;

struct ContextInner {
    config: RuntimeConfig,
    backend: Arc<dyn DeviceBackend>,
    allocator: UsmAllocator,
    selector: ImageSelector,
    trace: ApiTrace,
    next_operation: AtomicU64,
    next_queue: AtomicU64,
}

/// Device context: owns the backend, the allocator, the image selector and the API trace.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

pub struct ContextBuilder {
    backend: Arc<dyn DeviceBackend>,
    config: Option<RuntimeConfig>,
    images: Option<Arc<dyn ImageStore>>,
}

impl ContextBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn image_store(mut self, store: Arc<dyn ImageStore>) -> Self {
        self.images = Some(store);
        self
    }

    pub fn build(self) -> Context {
        let config = self.config.unwrap_or_else(RuntimeConfig::from_env);
        let images = self
            .images
            .unwrap_or_else(|| Arc::new(InMemoryImageStore::new()));
        let selector = ImageSelector::new(images, config.jit_fallback, config.image_cache_capacity);
        let trace = ApiTrace::new(config.api_trace, env::api_trace_enabled());
        log::debug!(
            "created context on backend {}",
            self.backend.backend_name()
        );
        Context {
            inner: Arc::new(ContextInner {
                allocator: UsmAllocator::new(Arc::clone(&self.backend)),
                backend: self.backend,
                config,
                selector,
                trace,
                next_operation: AtomicU64::new(1),
                next_queue: AtomicU64::new(1),
            }),
        }
    }
}

impl Context {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self::builder(backend).build()
    }

    pub fn with_config(backend: Arc<dyn DeviceBackend>, config: RuntimeConfig) -> Self {
        Self::builder(backend).config(config).build()
    }

    pub fn builder(backend: Arc<dyn DeviceBackend>) -> ContextBuilder {
        ContextBuilder {
            backend,
            config: None,
            images: None,
        }
    }

    /// Creates a context on the registered backend named by `config.backend`.
    pub fn from_config(config: RuntimeConfig) -> Result<Self> {
        let backend = create_backend(&config.backend)
            .ok_or_else(|| anyhow!("backend '{}' is not registered", config.backend))?;
        Ok(Self::with_config(backend, config))
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.inner.backend
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn allocator(&self) -> &UsmAllocator {
        &self.inner.allocator
    }

    pub fn selector(&self) -> &ImageSelector {
        &self.inner.selector
    }

    pub fn api_trace(&self) -> &ApiTrace {
        &self.inner.trace
    }

    pub fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn malloc_device<T: Pod>(&self, count: usize) -> Result<UsmPtr> {
        Ok(self.inner.allocator.malloc_device::<T>(count)?)
    }

    pub fn malloc_host<T: Pod>(&self, count: usize) -> Result<UsmPtr> {
        Ok(self.inner.allocator.malloc_host::<T>(count)?)
    }

    pub fn malloc_shared<T: Pod>(&self, count: usize) -> Result<UsmPtr> {
        Ok(self.inner.allocator.malloc_shared::<T>(count)?)
    }

    pub fn free(&self, ptr: UsmPtr) -> Result<()> {
        Ok(self.inner.allocator.free(ptr)?)
    }

    pub fn kernel_bundle(&self, kernels: &[&Kernel]) -> KernelBundle {
        KernelBundle::new(kernels)
    }

    pub(crate) fn next_operation_id(&self) -> OperationId {
        OperationId(self.inner.next_operation.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_queue_id(&self) -> QueueId {
        QueueId(self.inner.next_queue.fetch_add(1, Ordering::Relaxed))
    }
}
