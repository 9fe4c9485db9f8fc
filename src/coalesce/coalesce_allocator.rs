//! Coalescing variable-size allocator.
//!
//! Requests are served first-fit from each buffer's free list, splitting
//! oversized blocks. Freed blocks are merged eagerly with their physical
//! neighbours, so no two adjacent blocks are ever both free.

use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::{debug, warn};

use super::buffer::{payload_size_for, BufferGeometry, BufferNode, BLOCK_HEADER_SIZE, MIN_PAYLOAD};
use crate::region::{MmapRegionProvider, RegionProvider};
use crate::{AllocError, AllocResult, Lifecycle, END_OF_LIST};

/// Variable-size allocator over a chain of equally sized buffers
pub struct CoalesceAllocator<P: RegionProvider = MmapRegionProvider> {
    provider: P,
    geometry: BufferGeometry,
    head: Option<BufferNode>,
    lifecycle: Lifecycle,
    #[cfg(feature = "tracking")]
    num_alloc: usize,
    #[cfg(feature = "tracking")]
    num_free: usize,
}

impl<P: RegionProvider> CoalesceAllocator<P> {
    pub const fn new(provider: P) -> Self {
        Self {
            provider,
            geometry: BufferGeometry::EMPTY,
            head: None,
            lifecycle: Lifecycle::Uninit,
            #[cfg(feature = "tracking")]
            num_alloc: 0,
            #[cfg(feature = "tracking")]
            num_free: 0,
        }
    }

    /// Reserve the first buffer with room for `buffer_size` payload bytes.
    pub fn init(&mut self, buffer_size: usize) -> AllocResult {
        debug_assert!(
            self.lifecycle == Lifecycle::Uninit,
            "CoalesceAllocator: init on an allocator that is live or destroyed"
        );
        if self.lifecycle != Lifecycle::Uninit || buffer_size == 0 {
            return Err(AllocError::InvalidParam);
        }

        self.geometry = BufferGeometry::new(buffer_size).ok_or(AllocError::InvalidParam)?;
        self.head = Some(self.alloc_buffer()?);
        self.lifecycle = Lifecycle::Live;
        Ok(())
    }

    /// Release every buffer back to the provider.
    pub fn destroy(&mut self) {
        debug_assert!(
            self.lifecycle == Lifecycle::Live,
            "CoalesceAllocator: not initialized before destroy"
        );
        self.release_buffers();
        self.lifecycle = Lifecycle::Destroyed;
    }

    /// Payload capacity of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.geometry.buffer_size
    }

    pub fn buffer_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(buffer) = cursor {
            count += 1;
            cursor = buffer.next();
        }
        count
    }

    /// Allocate `size` contiguous bytes, growing by a whole buffer when no
    /// free block fits.
    pub fn alloc(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        debug_assert!(
            self.lifecycle == Lifecycle::Live,
            "CoalesceAllocator: not initialized before alloc"
        );
        let Some(mut buffer) = self.head else {
            return Err(AllocError::NotInitialized);
        };

        let Some(size) = payload_size_for(size).filter(|&s| s <= self.geometry.buffer_size) else {
            warn!(
                "coalesce allocator: request of {} bytes exceeds buffer size {}",
                size, self.geometry.buffer_size
            );
            return Err(AllocError::InvalidParam);
        };

        loop {
            if let Some(ptr) = Self::alloc_from(&mut buffer, size) {
                #[cfg(feature = "tracking")]
                {
                    self.num_alloc += 1;
                }
                return Ok(ptr);
            }
            buffer = match buffer.next() {
                Some(next) => next,
                None => {
                    let new_buffer = self.alloc_buffer()?;
                    buffer.set_next(Some(new_buffer));
                    new_buffer
                }
            };
        }
    }

    /// First-fit over one buffer's free list.
    fn alloc_from(buffer: &mut BufferNode, size: usize) -> Option<NonNull<u8>> {
        let mut prev = None;
        let mut cursor = buffer.free_head();

        while cursor != END_OF_LIST {
            let next = buffer.link(cursor);
            let found = buffer.size_of_block(cursor);

            if found >= size {
                if found >= size + BLOCK_HEADER_SIZE + MIN_PAYLOAD {
                    buffer.set_size(cursor, size);
                    let remainder = cursor + BLOCK_HEADER_SIZE + size;
                    buffer.write_block(remainder, found - size - BLOCK_HEADER_SIZE, true);
                    // The remainder terminates the chain: blocks that followed
                    // `cursor` in the free list are no longer reachable from it.
                    buffer.set_link(remainder, END_OF_LIST);
                    buffer.relink(prev, remainder);
                } else {
                    buffer.relink(prev, next);
                }
                buffer.set_free(cursor, false);
                return NonNull::new(buffer.payload(cursor) as *mut u8);
            }

            prev = Some(cursor);
            cursor = next;
        }
        None
    }

    /// Release `ptr` and merge it with free physical neighbours. Returns
    /// `false` when no buffer owns it.
    ///
    /// # Safety
    ///
    /// If this allocator owns `ptr`, it must be a live block previously
    /// returned by [`alloc`](Self::alloc) and not freed since.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> bool {
        debug_assert!(
            self.lifecycle == Lifecycle::Live,
            "CoalesceAllocator: not initialized before free"
        );
        let addr = ptr.as_ptr() as usize;
        let Some(mut buffer) = self.find_buffer(addr) else {
            return false;
        };

        let Some((prev, current)) = self.locate_block(&buffer, addr) else {
            debug_assert!(false, "CoalesceAllocator: {:#x} is not a block start", addr);
            warn!("coalesce allocator: {:#x} is not a block start", addr);
            return true;
        };
        debug_assert!(
            !buffer.is_free(current),
            "CoalesceAllocator: double free of {:#x}",
            addr
        );

        #[cfg(feature = "tracking")]
        {
            self.num_free += 1;
        }

        if let Some(next) = buffer.next_physical(current, &self.geometry) {
            if buffer.is_free(next) {
                buffer.unlink(next);
                let merged = buffer.size_of_block(current)
                    + buffer.size_of_block(next)
                    + BLOCK_HEADER_SIZE;
                buffer.set_size(current, merged);
            }
        }

        if let Some(prev) = prev {
            if buffer.is_free(prev) {
                let merged = buffer.size_of_block(prev)
                    + buffer.size_of_block(current)
                    + BLOCK_HEADER_SIZE;
                buffer.set_size(prev, merged);
                return true;
            }
        }

        buffer.set_free(current, true);
        buffer.set_link(current, buffer.free_head());
        buffer.set_free_head(current);
        true
    }

    /// Whether `ptr` falls inside one of this allocator's buffers.
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.find_buffer(ptr.as_ptr() as usize).is_some()
    }

    fn find_buffer(&self, addr: usize) -> Option<BufferNode> {
        let mut cursor = self.head;
        while let Some(buffer) = cursor {
            if buffer.contains(addr, &self.geometry) {
                return Some(buffer);
            }
            cursor = buffer.next();
        }
        None
    }

    /// Physical walk to the block whose payload starts at `addr`, returning
    /// it together with its physical predecessor.
    fn locate_block(&self, buffer: &BufferNode, addr: usize) -> Option<(Option<usize>, usize)> {
        let mut prev = None;
        let mut offset = 0;
        while buffer.payload(offset) < addr {
            prev = Some(offset);
            offset = buffer.next_physical(offset, &self.geometry)?;
        }
        (buffer.payload(offset) == addr).then_some((prev, offset))
    }

    fn alloc_buffer(&mut self) -> AllocResult<BufferNode> {
        let base = self.provider.reserve_commit(self.geometry.region_size)?;
        debug!(
            "coalesce allocator: new buffer at {:#x} ({} payload bytes)",
            base.as_ptr() as usize,
            self.geometry.buffer_size
        );
        Ok(unsafe { BufferNode::init(base, &self.geometry) })
    }

    fn release_buffers(&mut self) {
        let mut cursor = self.head.take();
        while let Some(buffer) = cursor {
            cursor = buffer.next();
            unsafe {
                self.provider
                    .release(buffer.region_base(), self.geometry.region_size);
            }
        }
    }

    /// Visit every block of every buffer as `(buffer_index, offset, size, free)`.
    #[cfg(any(test, feature = "tracking"))]
    pub(crate) fn for_each_block(&self, mut f: impl FnMut(usize, usize, usize, bool)) {
        let mut cursor = self.head;
        let mut index = 0;
        while let Some(buffer) = cursor {
            for (offset, size, free) in buffer.physical_blocks(&self.geometry) {
                f(index, offset, size, free);
            }
            index += 1;
            cursor = buffer.next();
        }
    }
}

#[cfg(feature = "tracking")]
impl<P: RegionProvider> CoalesceAllocator<P> {
    /// Aggregate occupancy counters.
    pub fn stats(&self) -> crate::stats::CoalesceStats {
        let mut stats = crate::stats::CoalesceStats {
            allocs: self.num_alloc,
            frees: self.num_free,
            buffer_size: self.geometry.buffer_size,
            region_size: self.geometry.region_size,
            buffers: self.buffer_count(),
            ..Default::default()
        };
        self.for_each_block(|_, _, _, free| {
            if free {
                stats.free_blocks += 1;
            } else {
                stats.busy_blocks += 1;
            }
        });
        stats
    }

    pub fn dump_stat(&self) {
        crate::stats::StatsReporter::report_coalesce(&self.stats());
        let mut cursor = self.head;
        let mut index = 0;
        while let Some(buffer) = cursor {
            crate::stats::StatsReporter::report_region(
                index,
                buffer.region_base().as_ptr() as usize,
                self.geometry.region_size,
            );
            index += 1;
            cursor = buffer.next();
        }
    }

    pub fn dump_blocks(&self) {
        #[cfg(feature = "log")]
        use log::info;

        info!("  coalesce:");
        let mut cursor = self.head;
        let mut buffer_index = 0;
        while let Some(buffer) = cursor {
            info!("    buffer {}", buffer_index);
            for (block_index, (offset, size, free)) in
                buffer.physical_blocks(&self.geometry).enumerate()
            {
                info!(
                    "      block {} {} addr {:#x} size {}",
                    block_index,
                    if free { "free" } else { "busy" },
                    buffer.blocks() + offset,
                    size
                );
            }
            buffer_index += 1;
            cursor = buffer.next();
        }
    }
}

impl<P: RegionProvider + Default> Default for CoalesceAllocator<P> {
    fn default() -> Self {
        Self::new(P::default())
    }
}

impl<P: RegionProvider> Drop for CoalesceAllocator<P> {
    fn drop(&mut self) {
        self.release_buffers();
    }
}
