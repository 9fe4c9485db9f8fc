//! Coalescing allocator.
//!
//! Variable-size blocks are carved out of large buffers by splitting, and
//! merged back with their physical neighbours when released.

pub(crate) mod buffer;
pub mod coalesce_allocator;

pub use buffer::{BLOCK_ALIGN, BLOCK_HEADER_SIZE};
pub use coalesce_allocator::CoalesceAllocator;
