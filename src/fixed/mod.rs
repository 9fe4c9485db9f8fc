//! Fixed-size slab allocator.
//!
//! Pages are carved into equal slots for a single size class; free slots are
//! tracked with an index-linked intrusive free list.

pub mod fixed_size_allocator;
pub(crate) mod page;

pub use fixed_size_allocator::FixedSizeAllocator;
