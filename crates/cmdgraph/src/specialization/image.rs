use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::backend::hashing::Fingerprint;
use crate::kernel::Kernel;

use super::constants::ConstantDecl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageKind {
    /// Every referenced constant is compiled in at its default value.
    DefaultsBaked,
    /// Constants are read from a constant buffer bound at launch.
    Configurable,
}

/// Precompiled binary for one kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceImageVariant {
    pub image_id: String,
    pub kernel: String,
    pub kind: ImageKind,
    pub constants: Vec<ConstantDecl>,
    #[serde(default)]
    pub binary: Vec<u8>,
}

impl DeviceImageVariant {
    pub fn for_kernel(kernel: &Kernel, kind: ImageKind, binary: Vec<u8>) -> Self {
        let suffix = match kind {
            ImageKind::DefaultsBaked => "default",
            ImageKind::Configurable => "configurable",
        };
        Self {
            image_id: format!("{}.{suffix}", kernel.name()),
            kernel: kernel.name().to_string(),
            kind,
            constants: kernel.constants().to_vec(),
            binary,
        }
    }

    pub fn defaults_baked(kernel: &Kernel) -> Self {
        Self::for_kernel(kernel, ImageKind::DefaultsBaked, Vec::new())
    }

    pub fn configurable(kernel: &Kernel) -> Self {
        Self::for_kernel(kernel, ImageKind::Configurable, Vec::new())
    }

    /// Configurable image generated on demand when nothing was registered for the kernel.
    pub fn jit(kernel: &Kernel) -> Self {
        let mut image = Self::configurable(kernel);
        image.image_id = format!("{}.jit", kernel.name());
        image
    }

    pub fn constant(&self, id: u32) -> Option<&ConstantDecl> {
        self.constants.iter().find(|decl| decl.id == id)
    }

    pub fn fingerprint(&self) -> u64 {
        Fingerprint::new()
            .write_str(&self.image_id)
            .write_str(&self.kernel)
            .write_bytes(&self.binary)
            .finish()
    }
}

/// Source of precompiled images, keyed by kernel name.
pub trait ImageStore: Send + Sync {
    fn variants(&self, kernel: &str) -> Vec<Arc<DeviceImageVariant>>;

    /// Changes whenever the set of stored images changes. Lookups memoized under one
    /// generation are not reused under another.
    fn generation(&self) -> u64 {
        0
    }
}

#[derive(Default)]
pub struct InMemoryImageStore {
    images: RwLock<HashMap<String, Vec<Arc<DeviceImageVariant>>>>,
    generation: AtomicU64,
}

impl InMemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `variant`, replacing an earlier image with the same id.
    pub fn register(&self, variant: DeviceImageVariant) {
        let mut images = self.images.write().expect("image store poisoned");
        let entry = images.entry(variant.kernel.clone()).or_default();
        entry.retain(|existing| existing.image_id != variant.image_id);
        entry.push(Arc::new(variant));
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn remove_kernel(&self, kernel: &str) {
        let removed = self
            .images
            .write()
            .expect("image store poisoned")
            .remove(kernel);
        if removed.is_some() {
            self.generation.fetch_add(1, Ordering::Release);
        }
    }

    pub fn len(&self) -> usize {
        self.images
            .read()
            .expect("image store poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ImageStore for InMemoryImageStore {
    fn variants(&self, kernel: &str) -> Vec<Arc<DeviceImageVariant>> {
        self.images
            .read()
            .expect("image store poisoned")
            .get(kernel)
            .cloned()
            .unwrap_or_default()
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
