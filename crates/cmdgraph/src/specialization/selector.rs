//! Per-submission choice between defaults-baked and configurable device images.
//!
//! A kernel whose referenced constants are all left at their defaults runs the defaults-baked
//! image when one exists, and its constant-buffer argument is bound to a null pointer. Any
//! explicitly set constant forces the configurable image, and the effective values (explicit or
//! default) are encoded into a buffer laid out by [`ConstantLayout`]. Selection never depends on
//! earlier submissions; the LRU only memoizes image-store lookups.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use thiserror::Error;

use crate::backend::hashing::Fingerprint;
use crate::kernel::Kernel;

use super::constants::{
    ConstantDecl, SpecConstKind, SpecializationConstantSet, CONSTANT_SLOT_BYTES,
};
use super::image::{DeviceImageVariant, ImageKind, ImageStore};

pub const DEFAULT_IMAGE_CACHE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no device image is registered for kernel {kernel}")]
    NoVariants { kernel: String },
    #[error(
        "kernel {kernel} sets specialization constants {explicit:?} but has no configurable image"
    )]
    NoConfigurableVariant { kernel: String, explicit: Vec<u32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantSlot {
    pub id: u32,
    pub kind: SpecConstKind,
    pub offset: u64,
}

/// Byte layout of a constant buffer: one 8-byte slot per constant, ordered by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantLayout {
    slots: Vec<ConstantSlot>,
}

impl ConstantLayout {
    pub fn for_constants(decls: &[ConstantDecl]) -> Self {
        let mut ordered: Vec<&ConstantDecl> = decls.iter().collect();
        ordered.sort_by_key(|decl| decl.id);
        ordered.dedup_by_key(|decl| decl.id);
        let slots = ordered
            .into_iter()
            .enumerate()
            .map(|(index, decl)| ConstantSlot {
                id: decl.id,
                kind: decl.kind(),
                offset: index as u64 * CONSTANT_SLOT_BYTES,
            })
            .collect();
        Self { slots }
    }

    pub fn slots(&self) -> &[ConstantSlot] {
        &self.slots
    }

    pub fn slot(&self, id: u32) -> Option<&ConstantSlot> {
        self.slots.iter().find(|slot| slot.id == id)
    }

    pub fn byte_len(&self) -> u64 {
        self.slots.len() as u64 * CONSTANT_SLOT_BYTES
    }

    /// Encodes the effective value of every declared constant.
    pub fn encode(&self, decls: &[ConstantDecl], values: &SpecializationConstantSet) -> Vec<u8> {
        let mut bytes = vec![0u8; self.byte_len() as usize];
        for slot in &self.slots {
            if let Some(decl) = decls.iter().find(|decl| decl.id == slot.id) {
                let start = slot.offset as usize;
                bytes[start..start + CONSTANT_SLOT_BYTES as usize]
                    .copy_from_slice(&values.effective(decl).to_slot());
            }
        }
        bytes
    }
}

/// How the constant-buffer argument of a launch must be bound.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantBinding {
    Unused,
    Null,
    Buffer {
        layout: Arc<ConstantLayout>,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub image: Arc<DeviceImageVariant>,
    pub binding: ConstantBinding,
}

impl Selection {
    pub fn uses_defaults_image(&self) -> bool {
        self.image.kind == ImageKind::DefaultsBaked
    }
}

pub struct ImageSelector {
    store: Arc<dyn ImageStore>,
    jit_fallback: bool,
    cache: Mutex<LruCache<u64, Arc<[Arc<DeviceImageVariant>]>>>,
}

impl ImageSelector {
    pub fn new(store: Arc<dyn ImageStore>, jit_fallback: bool, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            jit_fallback,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn store(&self) -> &Arc<dyn ImageStore> {
        &self.store
    }

    /// Drops memoized lookups. Only needed for stores that do not report a generation.
    pub fn invalidate(&self) {
        self.cache.lock().expect("image cache poisoned").clear();
    }

    fn variants(&self, kernel: &Kernel) -> Arc<[Arc<DeviceImageVariant>]> {
        // Read the generation before the lookup so a concurrent registration can only make the
        // entry stale under the old generation.
        let key = Fingerprint::new()
            .write_u64(kernel.fingerprint())
            .write_u64(self.store.generation())
            .finish();
        if let Some(hit) = self.cache.lock().expect("image cache poisoned").get(&key) {
            return Arc::clone(hit);
        }
        let found: Arc<[Arc<DeviceImageVariant>]> = self.store.variants(kernel.name()).into();
        if !found.is_empty() {
            self.cache
                .lock()
                .expect("image cache poisoned")
                .put(key, Arc::clone(&found));
        }
        found
    }

    pub fn select(
        &self,
        kernel: &Kernel,
        constants: &SpecializationConstantSet,
    ) -> Result<Selection, SelectionError> {
        let mut variants: Vec<Arc<DeviceImageVariant>> = self.variants(kernel).to_vec();
        if variants.is_empty() {
            if !self.jit_fallback {
                return Err(SelectionError::NoVariants {
                    kernel: kernel.name().to_string(),
                });
            }
            log::debug!("generating configurable image for kernel {}", kernel.name());
            variants.push(Arc::new(DeviceImageVariant::jit(kernel)));
        }
        let find = |kind: ImageKind| {
            variants
                .iter()
                .find(|variant| variant.kind == kind)
                .cloned()
        };

        if !kernel.references_constants() {
            let image = find(ImageKind::DefaultsBaked)
                .or_else(|| find(ImageKind::Configurable))
                .ok_or_else(|| SelectionError::NoVariants {
                    kernel: kernel.name().to_string(),
                })?;
            return Ok(Selection {
                image,
                binding: ConstantBinding::Unused,
            });
        }

        let explicit: Vec<u32> = kernel
            .constants()
            .iter()
            .filter(|decl| constants.is_set(decl.id))
            .map(|decl| decl.id)
            .collect();

        if explicit.is_empty() {
            if let Some(image) = find(ImageKind::DefaultsBaked) {
                return Ok(Selection {
                    image,
                    binding: ConstantBinding::Null,
                });
            }
        }

        let image = find(ImageKind::Configurable).ok_or_else(|| {
            if explicit.is_empty() {
                SelectionError::NoVariants {
                    kernel: kernel.name().to_string(),
                }
            } else {
                SelectionError::NoConfigurableVariant {
                    kernel: kernel.name().to_string(),
                    explicit: explicit.clone(),
                }
            }
        })?;
        let layout = Arc::new(ConstantLayout::for_constants(kernel.constants()));
        let bytes = layout.encode(kernel.constants(), constants);
        Ok(Selection {
            image,
            binding: ConstantBinding::Buffer { layout, bytes },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specialization::image::InMemoryImageStore;
    use crate::specialization::SpecializationId;

    const INT_ID: SpecializationId<i32> = SpecializationId::new(3, 3);
    const FLAG_ID: SpecializationId<bool> = SpecializationId::new(1, true);

    fn kernel() -> Kernel {
        Kernel::with_constants("report", [INT_ID.decl(), FLAG_ID.decl()], |_, _| Ok(()))
    }

    fn selector(kinds: &[ImageKind], jit: bool) -> ImageSelector {
        let store = Arc::new(InMemoryImageStore::new());
        for kind in kinds {
            store.register(DeviceImageVariant::for_kernel(&kernel(), *kind, Vec::new()));
        }
        ImageSelector::new(store, jit, 4)
    }

    #[test]
    fn defaults_pick_baked_image_with_null_binding() {
        let selector = selector(&[ImageKind::DefaultsBaked, ImageKind::Configurable], false);
        let selection = selector
            .select(&kernel(), &SpecializationConstantSet::new())
            .unwrap();
        assert!(selection.uses_defaults_image());
        assert_eq!(selection.binding, ConstantBinding::Null);
    }

    #[test]
    fn explicit_value_picks_configurable_image() {
        let selector = selector(&[ImageKind::DefaultsBaked, ImageKind::Configurable], false);
        let mut set = SpecializationConstantSet::new();
        set.set(&INT_ID, 5);
        let selection = selector.select(&kernel(), &set).unwrap();
        assert!(!selection.uses_defaults_image());
        match selection.binding {
            ConstantBinding::Buffer { layout, bytes } => {
                assert_eq!(layout.byte_len(), 16);
                // id 1 sorts before id 3
                assert_eq!(bytes[0], 1);
                assert_eq!(&bytes[8..12], &5i32.to_le_bytes());
            }
            other => panic!("unexpected binding {other:?}"),
        }
    }

    #[test]
    fn alternating_submissions_are_stateless() {
        let selector = selector(&[ImageKind::DefaultsBaked, ImageKind::Configurable], false);
        let mut explicit = SpecializationConstantSet::new();
        explicit.set(&INT_ID, 5);
        let defaults = SpecializationConstantSet::new();
        let picks: Vec<bool> = [&defaults, &explicit, &defaults, &explicit]
            .into_iter()
            .map(|set| selector.select(&kernel(), set).unwrap().uses_defaults_image())
            .collect();
        assert_eq!(picks, vec![true, false, true, false]);
    }

    #[test]
    fn defaults_without_baked_image_use_buffer_of_defaults() {
        let selector = selector(&[ImageKind::Configurable], false);
        let selection = selector
            .select(&kernel(), &SpecializationConstantSet::new())
            .unwrap();
        match selection.binding {
            ConstantBinding::Buffer { bytes, .. } => {
                assert_eq!(&bytes[8..12], &3i32.to_le_bytes());
            }
            other => panic!("unexpected binding {other:?}"),
        }
    }

    #[test]
    fn explicit_value_without_configurable_image_is_fatal() {
        let selector = selector(&[ImageKind::DefaultsBaked], false);
        let mut set = SpecializationConstantSet::new();
        set.set(&INT_ID, 5);
        assert_eq!(
            selector.select(&kernel(), &set).unwrap_err(),
            SelectionError::NoConfigurableVariant {
                kernel: "report".into(),
                explicit: vec![3]
            }
        );
    }

    #[test]
    fn missing_images_respect_jit_fallback() {
        let strict = selector(&[], false);
        assert!(matches!(
            strict.select(&kernel(), &SpecializationConstantSet::new()),
            Err(SelectionError::NoVariants { .. })
        ));
        let jit = selector(&[], true);
        let selection = jit
            .select(&kernel(), &SpecializationConstantSet::new())
            .unwrap();
        assert_eq!(selection.image.image_id, "report.jit");
    }

    #[test]
    fn images_registered_after_a_lookup_are_selected() {
        let store = Arc::new(InMemoryImageStore::new());
        store.register(DeviceImageVariant::defaults_baked(&kernel()));
        let selector = ImageSelector::new(store.clone(), false, 4);
        let mut set = SpecializationConstantSet::new();
        set.set(&INT_ID, 5);
        assert!(matches!(
            selector.select(&kernel(), &set),
            Err(SelectionError::NoConfigurableVariant { .. })
        ));

        store.register(DeviceImageVariant::configurable(&kernel()));
        let selection = selector.select(&kernel(), &set).unwrap();
        assert_eq!(selection.image.image_id, "report.configurable");

        store.remove_kernel("report");
        assert!(matches!(
            selector.select(&kernel(), &SpecializationConstantSet::new()),
            Err(SelectionError::NoVariants { .. })
        ));
    }

    #[test]
    fn kernels_without_constants_leave_argument_unused() {
        let plain = Kernel::new("plain", |_, _| Ok(()));
        let selector = ImageSelector::new(Arc::new(InMemoryImageStore::new()), true, 4);
        let selection = selector
            .select(&plain, &SpecializationConstantSet::new())
            .unwrap();
        assert_eq!(selection.binding, ConstantBinding::Unused);
    }
}
