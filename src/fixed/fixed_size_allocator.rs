//! Fixed-size block allocator.
//!
//! One instance serves a single block size out of a singly-linked chain of
//! pages. Allocation pops the page free list, then bump-allocates untouched
//! slots, then moves on to the next page (creating it on demand).

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::{debug, warn};

use super::page::{PageGeometry, PageNode};
use crate::region::{MmapRegionProvider, RegionProvider};
use crate::{AllocError, AllocResult, Lifecycle};

/// Slab pool for one block size
pub struct FixedSizeAllocator<P: RegionProvider = MmapRegionProvider> {
    provider: P,
    geometry: PageGeometry,
    head: Option<PageNode>,
    lifecycle: Lifecycle,
    #[cfg(feature = "tracking")]
    num_alloc: usize,
    #[cfg(feature = "tracking")]
    num_free: usize,
}

impl<P: RegionProvider> FixedSizeAllocator<P> {
    pub const fn new(provider: P) -> Self {
        Self {
            provider,
            geometry: PageGeometry::EMPTY,
            head: None,
            lifecycle: Lifecycle::Uninit,
            #[cfg(feature = "tracking")]
            num_alloc: 0,
            #[cfg(feature = "tracking")]
            num_free: 0,
        }
    }

    /// Establish the geometry and reserve the first page.
    pub fn init(&mut self, block_size: usize, blocks_per_page: usize) -> AllocResult {
        debug_assert!(
            self.lifecycle == Lifecycle::Uninit,
            "FixedSizeAllocator: init on an allocator that is live or destroyed"
        );
        if self.lifecycle != Lifecycle::Uninit {
            return Err(AllocError::InvalidParam);
        }
        if block_size < size_of::<usize>()
            || block_size % align_of::<usize>() != 0
            || blocks_per_page == 0
        {
            return Err(AllocError::InvalidParam);
        }

        self.geometry =
            PageGeometry::new(block_size, blocks_per_page).ok_or(AllocError::InvalidParam)?;
        self.head = Some(self.alloc_page()?);
        self.lifecycle = Lifecycle::Live;
        Ok(())
    }

    /// Release every page back to the provider.
    pub fn destroy(&mut self) {
        debug_assert!(
            self.lifecycle == Lifecycle::Live,
            "FixedSizeAllocator: not initialized before destroy"
        );
        self.release_pages();
        self.lifecycle = Lifecycle::Destroyed;
    }

    pub fn block_size(&self) -> usize {
        self.geometry.block_size
    }

    pub fn blocks_per_page(&self) -> usize {
        self.geometry.blocks_per_page
    }

    pub fn page_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(page) = cursor {
            count += 1;
            cursor = page.next();
        }
        count
    }

    /// Allocate one block. `size` only has to fit the block size.
    pub fn alloc(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        debug_assert!(
            self.lifecycle == Lifecycle::Live,
            "FixedSizeAllocator: not initialized before alloc"
        );
        debug_assert!(
            size <= self.geometry.block_size,
            "FixedSizeAllocator: request of {} bytes exceeds block size {}",
            size,
            self.geometry.block_size
        );
        let Some(mut page) = self.head else {
            return Err(AllocError::NotInitialized);
        };

        loop {
            if let Some(slot) = page.pop_free(&self.geometry) {
                self.note_alloc();
                return Ok(slot);
            }
            if let Some(slot) = page.bump(&self.geometry) {
                self.note_alloc();
                return Ok(slot);
            }
            page = match page.next() {
                Some(next) => next,
                None => {
                    let new_page = self.alloc_page()?;
                    page.set_next(Some(new_page));
                    new_page
                }
            };
        }
    }

    /// Return `ptr` to its page. Returns `false` when no page owns it.
    ///
    /// # Safety
    ///
    /// If this allocator owns `ptr`, it must be a live block previously
    /// returned by [`alloc`](Self::alloc) and not freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> bool {
        debug_assert!(
            self.lifecycle == Lifecycle::Live,
            "FixedSizeAllocator: not initialized before free"
        );
        let Some(mut page) = self.find_page(ptr) else {
            return false;
        };

        let addr = ptr.as_ptr() as usize;
        let Some(index) = page.slot_index(addr, &self.geometry) else {
            debug_assert!(false, "FixedSizeAllocator: {:#x} is not a block start", addr);
            warn!("fixed-size allocator: {:#x} is not a block start", addr);
            return true;
        };
        debug_assert!(
            index < page.initialized(),
            "FixedSizeAllocator: {:#x} was never handed out",
            addr
        );
        debug_assert!(
            !page.is_free(index, &self.geometry),
            "FixedSizeAllocator: double free of {:#x}",
            addr
        );

        unsafe { page.push_free(index, &self.geometry) };
        #[cfg(feature = "tracking")]
        {
            self.num_free += 1;
        }
        true
    }

    /// Whether `ptr` falls inside one of this allocator's pages.
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.find_page(ptr).is_some()
    }

    fn find_page(&self, ptr: NonNull<u8>) -> Option<PageNode> {
        let addr = ptr.as_ptr() as usize;
        let mut cursor = self.head;
        while let Some(page) = cursor {
            if page.contains(addr, &self.geometry) {
                return Some(page);
            }
            cursor = page.next();
        }
        None
    }

    fn alloc_page(&mut self) -> AllocResult<PageNode> {
        let base = self.provider.reserve_commit(self.geometry.region_size)?;
        debug!(
            "fixed-size allocator: new {}-byte page at {:#x} ({} blocks)",
            self.geometry.block_size,
            base.as_ptr() as usize,
            self.geometry.blocks_per_page
        );
        Ok(unsafe { PageNode::init(base, &self.geometry) })
    }

    fn release_pages(&mut self) {
        let mut cursor = self.head.take();
        while let Some(page) = cursor {
            cursor = page.next();
            unsafe {
                self.provider
                    .release(page.region_base(), self.geometry.region_size);
            }
        }
    }

    #[inline]
    fn note_alloc(&mut self) {
        #[cfg(feature = "tracking")]
        {
            self.num_alloc += 1;
        }
    }

    #[cfg(test)]
    pub(crate) fn free_list_len(&self) -> usize {
        let mut len = 0;
        let mut cursor = self.head;
        while let Some(page) = cursor {
            len += page.free_len(&self.geometry);
            cursor = page.next();
        }
        len
    }
}

#[cfg(feature = "tracking")]
impl<P: RegionProvider> FixedSizeAllocator<P> {
    /// Aggregate occupancy counters.
    pub fn stats(&self) -> crate::stats::FixedSizeStats {
        let mut stats = crate::stats::FixedSizeStats {
            block_size: self.geometry.block_size,
            allocs: self.num_alloc,
            frees: self.num_free,
            region_size: self.geometry.region_size,
            ..Default::default()
        };
        let mut cursor = self.head;
        while let Some(page) = cursor {
            let free = page.free_len(&self.geometry);
            stats.pages += 1;
            stats.free_blocks += free;
            stats.busy_blocks += page.initialized() - free;
            cursor = page.next();
        }
        stats
    }

    pub fn dump_stat(&self) {
        let stats = self.stats();
        crate::stats::StatsReporter::report_fixed(&stats);
        let mut cursor = self.head;
        let mut page_index = 0;
        while let Some(page) = cursor {
            crate::stats::StatsReporter::report_region(
                page_index,
                page.region_base().as_ptr() as usize,
                self.geometry.region_size,
            );
            page_index += 1;
            cursor = page.next();
        }
    }

    pub fn dump_blocks(&self) {
        #[cfg(feature = "log")]
        use log::info;

        info!("  fixed-size {}:", self.geometry.block_size);
        let mut cursor = self.head;
        let mut page_index = 0;
        while let Some(page) = cursor {
            info!("    page {}", page_index);
            for index in 0..page.initialized() {
                let state = if page.is_free(index, &self.geometry) {
                    "free"
                } else {
                    "busy"
                };
                info!(
                    "      block {} {} addr {:#x}",
                    index,
                    state,
                    page.slot_addr(index, &self.geometry)
                );
            }
            page_index += 1;
            cursor = page.next();
        }
    }
}

impl<P: RegionProvider + Default> Default for FixedSizeAllocator<P> {
    fn default() -> Self {
        Self::new(P::default())
    }
}

impl<P: RegionProvider> Drop for FixedSizeAllocator<P> {
    fn drop(&mut self) {
        self.release_pages();
    }
}
