//! Allocation handles and the access records derived from them.
mod access;
mod allocator;

pub use access::{any_conflict, AccessMode, AccessRecord, AllocationId, ByteRange};
pub use allocator::{byte_size, AllocationInfo, MemoryError, Placement, UsmAllocator, UsmPtr};
