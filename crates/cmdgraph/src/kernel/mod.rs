pub mod atomic;
#[allow(clippy::module_inception)]
mod kernel;
pub mod matrix;

pub use atomic::{AtomicElement, AtomicError, AtomicOp, ElementKind};
pub use kernel::{Kernel, KernelContext, NdRange, WorkItem};
pub use matrix::{MatrixError, MatrixLayout, Tile, TileOrigin};
