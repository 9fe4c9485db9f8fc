//! Size-class memory allocator
//!
//! This crate implements a user-space memory manager that routes requests to
//! size-specialized sub-allocators, featuring:
//! - Fixed-size slab pools for the 16..=512 byte size classes
//! - A coalescing free-list allocator for mid-size requests
//! - Direct OS mappings for large objects
//! - An optional spin-locked [`GlobalAlloc`](core::alloc::GlobalAlloc) wrapper
//!
//! The engines themselves are single-threaded and perform no locking.

#![no_std]

#[cfg(test)]
extern crate std;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[cfg_attr(not(feature = "tracking"), allow(unused_macros))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Index value terminating an intrusive free list.
pub const END_OF_LIST: usize = usize::MAX;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid `size` or geometry (e.g. a block too small to hold a free-list link).
    InvalidParam,
    /// The region provider could not satisfy a reservation.
    NoMemory,
    /// The allocator was used before `init` or after `destroy`.
    NotInitialized,
    /// Deallocate an address that no allocator owns.
    NotAllocated,
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// Where an allocator is in its `init` / `destroy` lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Uninit,
    Live,
    Destroyed,
}

#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// [`align_up`] that reports overflow instead of wrapping.
#[inline]
const fn checked_align_up(pos: usize, align: usize) -> Option<usize> {
    match pos.checked_add(align - 1) {
        Some(end) => Some(end & !(align - 1)),
        None => None,
    }
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
#[allow(dead_code)]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod region;
pub use region::{MmapRegionProvider, RegionProvider};

pub mod fixed;
pub use fixed::FixedSizeAllocator;

pub mod coalesce;
pub use coalesce::CoalesceAllocator;

pub mod memory_allocator;
pub use memory_allocator::{MemoryAllocator, MemoryAllocatorConfig, SizeClass, Tier};

pub mod global_allocator;
pub use global_allocator::LockedMemoryAllocator;

#[cfg(feature = "tracking")]
pub mod stats;
#[cfg(feature = "tracking")]
pub use stats::{CoalesceStats, FixedSizeStats, MemoryStats};
