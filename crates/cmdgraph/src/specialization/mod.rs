//! Specialization constants and device image selection.

pub mod bundle;
pub mod constants;
pub mod image;
pub mod selector;

pub use bundle::KernelBundle;
pub use constants::{
    ConstantDecl, SpecConstKind, SpecConstType, SpecConstValue, SpecializationConstantSet,
    SpecializationId, CONSTANT_SLOT_BYTES,
};
pub use image::{DeviceImageVariant, ImageKind, ImageStore, InMemoryImageStore};
pub use selector::{
    ConstantBinding, ConstantLayout, ConstantSlot, ImageSelector, Selection, SelectionError,
    DEFAULT_IMAGE_CACHE_CAPACITY,
};
