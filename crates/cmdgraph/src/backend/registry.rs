//! Runtime backend registry for selecting a device by name.
//!
//! Backend crates register a constructor under one or more names; contexts built from a
//! [`RuntimeConfig`](crate::RuntimeConfig) look the configured name up here instead of naming a
//! concrete device type.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use super::spec::DeviceBackend;

/// Factory function that creates a new backend instance.
pub type BackendConstructor = Box<dyn Fn() -> Arc<dyn DeviceBackend> + Send + Sync>;

struct BackendRegistry {
    backends: RwLock<HashMap<String, BackendConstructor>>,
}

impl BackendRegistry {
    fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: String, constructor: BackendConstructor) {
        self.backends
            .write()
            .expect("backend registry poisoned")
            .insert(name, constructor);
    }

    fn create(&self, name: &str) -> Option<Arc<dyn DeviceBackend>> {
        let registry = self.backends.read().expect("backend registry poisoned");
        let constructor = registry.get(name)?;
        Some(constructor())
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .read()
            .expect("backend registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn contains(&self, name: &str) -> bool {
        self.backends
            .read()
            .expect("backend registry poisoned")
            .contains_key(name)
    }
}

static GLOBAL_REGISTRY: Lazy<BackendRegistry> = Lazy::new(BackendRegistry::new);

fn global_registry() -> &'static BackendRegistry {
    &GLOBAL_REGISTRY
}

/// Registers a backend constructor under `name`, replacing any previous registration.
///
/// The constructor runs each time the backend is requested via [`create_backend`].
pub fn register_backend<B, F>(name: impl Into<String>, constructor: F)
where
    B: DeviceBackend + 'static,
    F: Fn() -> B + Send + Sync + 'static,
{
    global_registry().register(
        name.into(),
        Box::new(move || Arc::new(constructor()) as Arc<dyn DeviceBackend>),
    );
}

/// Creates a backend instance by name, or `None` if nothing is registered under it.
pub fn create_backend(name: &str) -> Option<Arc<dyn DeviceBackend>> {
    global_registry().create(name)
}

/// Lists registered backend names in sorted order.
pub fn list_backends() -> Vec<String> {
    global_registry().list()
}

pub fn has_backend(name: &str) -> bool {
    global_registry().contains(name)
}
