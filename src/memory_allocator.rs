//! Size-class dispatcher.
//!
//! Small requests go to one of six fixed-size pools, mid-size requests to the
//! coalescing allocator, and anything at or above the large-object threshold
//! to its own OS mapping. On release each sub-allocator is asked in turn
//! whether it owns the pointer.

use core::mem::size_of;
use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::{debug, error};

use crate::coalesce::{CoalesceAllocator, BLOCK_ALIGN};
use crate::fixed::FixedSizeAllocator;
use crate::region::{MmapRegionProvider, RegionProvider};
use crate::{AllocError, AllocResult, Lifecycle};

/// Requests of this many bytes or more bypass the pools (10 MiB).
pub const LARGE_OBJECT_THRESHOLD: usize = 10 * 1024 * 1024;

/// Payload bytes per fixed-size page, identical for every class.
const FIXED_PAGE_BYTES: usize = 8192;

/// Size classes served by the fixed-size pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum SizeClass {
    Bytes16 = 16,
    Bytes32 = 32,
    Bytes64 = 64,
    Bytes128 = 128,
    Bytes256 = 256,
    Bytes512 = 512,
}

impl SizeClass {
    pub const COUNT: usize = 6;
    pub const MAX_SIZE: usize = 512;

    pub const ALL: [SizeClass; Self::COUNT] = [
        SizeClass::Bytes16,
        SizeClass::Bytes32,
        SizeClass::Bytes64,
        SizeClass::Bytes128,
        SizeClass::Bytes256,
        SizeClass::Bytes512,
    ];

    /// Smallest class whose block size is at least `size`.
    pub fn from_size(size: usize) -> Option<Self> {
        Some(match size {
            0..=16 => SizeClass::Bytes16,
            17..=32 => SizeClass::Bytes32,
            33..=64 => SizeClass::Bytes64,
            65..=128 => SizeClass::Bytes128,
            129..=256 => SizeClass::Bytes256,
            257..=512 => SizeClass::Bytes512,
            _ => return None,
        })
    }

    pub fn size(&self) -> usize {
        *self as usize
    }

    /// Blocks per page, chosen so every class reserves the same page payload.
    pub fn blocks_per_page(&self) -> usize {
        FIXED_PAGE_BYTES / self.size()
    }

    pub fn to_index(&self) -> usize {
        match self {
            SizeClass::Bytes16 => 0,
            SizeClass::Bytes32 => 1,
            SizeClass::Bytes64 => 2,
            SizeClass::Bytes128 => 3,
            SizeClass::Bytes256 => 4,
            SizeClass::Bytes512 => 5,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Which tier owns an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Fixed(SizeClass),
    Coalesce,
    /// Direct OS mapping, with the exact requested size.
    Os { size: usize },
}

/// Dispatcher geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAllocatorConfig {
    /// Requests at or above this size get their own OS mapping.
    pub large_object_threshold: usize,
    /// Payload capacity of each coalescing buffer.
    pub coalesce_buffer_size: usize,
}

impl Default for MemoryAllocatorConfig {
    fn default() -> Self {
        Self {
            large_object_threshold: LARGE_OBJECT_THRESHOLD,
            coalesce_buffer_size: LARGE_OBJECT_THRESHOLD * 2,
        }
    }
}

impl MemoryAllocatorConfig {
    /// Every request routed to the coalescing tier must fit one buffer.
    pub fn validate(&self) -> AllocResult {
        if self.large_object_threshold <= SizeClass::MAX_SIZE {
            return Err(AllocError::InvalidParam);
        }
        let largest_mid_request = crate::checked_align_up(self.large_object_threshold, BLOCK_ALIGN)
            .ok_or(AllocError::InvalidParam)?;
        if self.coalesce_buffer_size < largest_mid_request {
            return Err(AllocError::InvalidParam);
        }
        Ok(())
    }
}

/// Record for one direct OS mapping, stored at the start of the mapping.
#[repr(C, align(16))]
struct OsBlock {
    next: Option<NonNull<OsBlock>>,
    size: usize,
}

const OS_HEADER_SIZE: usize = size_of::<OsBlock>();

impl OsBlock {
    fn payload(block: NonNull<OsBlock>) -> usize {
        block.as_ptr() as usize + OS_HEADER_SIZE
    }
}

/// Composes the fixed-size pools, the coalescing allocator and direct OS
/// mappings behind a single `alloc`/`free` pair.
pub struct MemoryAllocator<P: RegionProvider + Clone = MmapRegionProvider> {
    provider: P,
    fixed: [FixedSizeAllocator<P>; SizeClass::COUNT],
    coalesce: CoalesceAllocator<P>,
    os_blocks: Option<NonNull<OsBlock>>,
    config: MemoryAllocatorConfig,
    lifecycle: Lifecycle,
    #[cfg(feature = "tracking")]
    num_alloc: usize,
    #[cfg(feature = "tracking")]
    num_free: usize,
}

// SAFETY: the allocator exclusively owns every region it points into.
unsafe impl<P: RegionProvider + Clone + Send> Send for MemoryAllocator<P> {}

impl<P: RegionProvider + Clone> MemoryAllocator<P> {
    pub fn new(provider: P) -> Self {
        Self {
            fixed: core::array::from_fn(|_| FixedSizeAllocator::new(provider.clone())),
            coalesce: CoalesceAllocator::new(provider.clone()),
            provider,
            os_blocks: None,
            config: MemoryAllocatorConfig::default(),
            lifecycle: Lifecycle::Uninit,
            #[cfg(feature = "tracking")]
            num_alloc: 0,
            #[cfg(feature = "tracking")]
            num_free: 0,
        }
    }

    /// Initialize with the default geometry.
    pub fn init(&mut self) -> AllocResult {
        self.init_with(MemoryAllocatorConfig::default())
    }

    pub fn init_with(&mut self, config: MemoryAllocatorConfig) -> AllocResult {
        debug_assert!(
            self.lifecycle == Lifecycle::Uninit,
            "MemoryAllocator: init on an allocator that is live or destroyed"
        );
        if self.lifecycle != Lifecycle::Uninit {
            return Err(AllocError::InvalidParam);
        }
        config.validate()?;

        if let Err(err) = self.init_tiers(&config) {
            error!("memory allocator: init failed: {:?}", err);
            self.reset_tiers();
            return Err(err);
        }

        self.config = config;
        self.lifecycle = Lifecycle::Live;
        Ok(())
    }

    fn init_tiers(&mut self, config: &MemoryAllocatorConfig) -> AllocResult {
        for class in SizeClass::ALL {
            self.fixed[class.to_index()].init(class.size(), class.blocks_per_page())?;
        }
        self.coalesce.init(config.coalesce_buffer_size)
    }

    /// Swap in fresh sub-allocators; dropping the old ones releases their regions.
    fn reset_tiers(&mut self) {
        let provider = &self.provider;
        self.fixed = core::array::from_fn(|_| FixedSizeAllocator::new(provider.clone()));
        self.coalesce = CoalesceAllocator::new(provider.clone());
    }

    /// Release every page, buffer and OS mapping.
    pub fn destroy(&mut self) {
        debug_assert!(
            self.lifecycle == Lifecycle::Live,
            "MemoryAllocator: not initialized before destroy"
        );
        for allocator in self.fixed.iter_mut() {
            allocator.destroy();
        }
        self.coalesce.destroy();
        self.release_os_blocks();
        self.lifecycle = Lifecycle::Destroyed;
    }

    pub fn config(&self) -> &MemoryAllocatorConfig {
        &self.config
    }

    pub fn fixed_allocator(&self, class: SizeClass) -> &FixedSizeAllocator<P> {
        &self.fixed[class.to_index()]
    }

    pub fn coalesce_allocator(&self) -> &CoalesceAllocator<P> {
        &self.coalesce
    }

    pub fn os_block_count(&self) -> usize {
        self.os_block_iter().count()
    }

    /// Route a request to the tier serving `size`.
    pub fn alloc(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        debug_assert!(
            self.lifecycle == Lifecycle::Live,
            "MemoryAllocator: not initialized before alloc"
        );
        if self.lifecycle != Lifecycle::Live {
            return Err(AllocError::NotInitialized);
        }

        let ptr = if let Some(class) = SizeClass::from_size(size) {
            self.fixed[class.to_index()].alloc(size)?
        } else if size < self.config.large_object_threshold {
            self.coalesce.alloc(size)?
        } else {
            self.alloc_os(size)?
        };

        #[cfg(feature = "tracking")]
        {
            self.num_alloc += 1;
        }
        Ok(ptr)
    }

    /// Return `ptr` to whichever tier owns it.
    ///
    /// Freeing an address that no tier owns is a precondition violation: it
    /// panics in builds with debug assertions and is logged otherwise.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`alloc`](Self::alloc) on this
    /// allocator and not freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        debug_assert!(
            self.lifecycle == Lifecycle::Live,
            "MemoryAllocator: not initialized before free"
        );
        if self.lifecycle != Lifecycle::Live {
            return;
        }

        let released = unsafe { self.free_in_tiers(ptr) };
        debug_assert!(
            released,
            "MemoryAllocator: {:#x} is not owned by any allocator",
            ptr.as_ptr() as usize
        );
        if !released {
            error!(
                "memory allocator: {:#x} is not owned by any allocator",
                ptr.as_ptr() as usize
            );
            return;
        }

        #[cfg(feature = "tracking")]
        {
            self.num_free += 1;
        }
    }

    unsafe fn free_in_tiers(&mut self, ptr: NonNull<u8>) -> bool {
        for allocator in self.fixed.iter_mut() {
            if unsafe { allocator.free(ptr) } {
                return true;
            }
        }
        if unsafe { self.coalesce.free(ptr) } {
            return true;
        }
        self.release_os_block(ptr.as_ptr() as usize)
    }

    /// Which tier owns `ptr`, if any.
    pub fn tier_of(&self, ptr: NonNull<u8>) -> Option<Tier> {
        for (index, allocator) in self.fixed.iter().enumerate() {
            if allocator.owns(ptr) {
                return SizeClass::from_index(index).map(Tier::Fixed);
            }
        }
        if self.coalesce.owns(ptr) {
            return Some(Tier::Coalesce);
        }
        let addr = ptr.as_ptr() as usize;
        self.os_block_iter()
            .find(|&(payload, _)| payload == addr)
            .map(|(_, size)| Tier::Os { size })
    }

    fn alloc_os(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        let total = size
            .checked_add(OS_HEADER_SIZE)
            .ok_or(AllocError::InvalidParam)?;
        let base = self.provider.reserve_commit(total)?;
        let block = base.cast::<OsBlock>();
        unsafe {
            block.as_ptr().write(OsBlock {
                next: self.os_blocks,
                size,
            });
        }
        self.os_blocks = Some(block);
        debug!(
            "memory allocator: os block at {:#x} ({} bytes)",
            base.as_ptr() as usize,
            size
        );
        NonNull::new(OsBlock::payload(block) as *mut u8).ok_or(AllocError::NoMemory)
    }

    /// Unlink and release the OS mapping whose payload starts at `addr`.
    fn release_os_block(&mut self, addr: usize) -> bool {
        let mut prev: Option<NonNull<OsBlock>> = None;
        let mut cursor = self.os_blocks;
        while let Some(block) = cursor {
            let (next, size) = unsafe { ((*block.as_ptr()).next, (*block.as_ptr()).size) };
            if OsBlock::payload(block) == addr {
                match prev {
                    Some(prev) => unsafe { (*prev.as_ptr()).next = next },
                    None => self.os_blocks = next,
                }
                return unsafe { self.provider.release(block.cast(), size + OS_HEADER_SIZE) };
            }
            prev = Some(block);
            cursor = next;
        }
        false
    }

    fn release_os_blocks(&mut self) {
        let mut cursor = self.os_blocks.take();
        while let Some(block) = cursor {
            let (next, size) = unsafe { ((*block.as_ptr()).next, (*block.as_ptr()).size) };
            cursor = next;
            unsafe { self.provider.release(block.cast(), size + OS_HEADER_SIZE) };
        }
    }

    /// `(payload address, size)` of every live OS mapping.
    fn os_block_iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let mut cursor = self.os_blocks;
        core::iter::from_fn(move || {
            let block = cursor?;
            let (next, size) = unsafe { ((*block.as_ptr()).next, (*block.as_ptr()).size) };
            cursor = next;
            Some((OsBlock::payload(block), size))
        })
    }
}

#[cfg(feature = "tracking")]
impl<P: RegionProvider + Clone> MemoryAllocator<P> {
    /// Snapshot of every tier's counters.
    pub fn stats(&self) -> crate::stats::MemoryStats {
        let mut stats = crate::stats::MemoryStats {
            allocs: self.num_alloc,
            frees: self.num_free,
            coalesce: self.coalesce.stats(),
            ..Default::default()
        };
        for (slot, allocator) in stats.fixed.iter_mut().zip(self.fixed.iter()) {
            *slot = allocator.stats();
        }
        for (_, size) in self.os_block_iter() {
            stats.os_blocks += 1;
            stats.os_bytes += size;
        }
        stats
    }

    pub fn dump_stat(&self) {
        crate::stats::StatsReporter::report_memory(&self.stats());
        for allocator in self.fixed.iter() {
            allocator.dump_stat();
        }
        self.coalesce.dump_stat();
        self.dump_os_blocks();
    }

    pub fn dump_blocks(&self) {
        for allocator in self.fixed.iter() {
            allocator.dump_blocks();
        }
        self.coalesce.dump_blocks();
        self.dump_os_blocks();
    }

    fn dump_os_blocks(&self) {
        #[cfg(feature = "log")]
        use log::info;

        info!("  os blocks:");
        for (index, (addr, size)) in self.os_block_iter().enumerate() {
            info!("    block {} addr {:#x} size {}", index, addr, size);
        }
    }
}

impl<P: RegionProvider + Clone + Default> Default for MemoryAllocator<P> {
    fn default() -> Self {
        Self::new(P::default())
    }
}

impl<P: RegionProvider + Clone> Drop for MemoryAllocator<P> {
    fn drop(&mut self) {
        self.release_os_blocks();
    }
}
