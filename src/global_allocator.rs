//! Spin-locked global allocator.
//!
//! The engines perform no locking; this wrapper serializes every call behind
//! one `SpinNoIrq` and adapts [`Layout`] requests to the size classes so the
//! dispatcher can back [`GlobalAlloc`].

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::{error, warn};

use crate::coalesce::BLOCK_ALIGN;
use crate::memory_allocator::{MemoryAllocator, MemoryAllocatorConfig, SizeClass, Tier};
use crate::region::{MmapRegionProvider, RegionProvider};
use crate::{AllocError, AllocResult};

/// [`MemoryAllocator`] behind a single lock
pub struct LockedMemoryAllocator<P: RegionProvider + Clone = MmapRegionProvider> {
    inner: SpinNoIrq<Option<MemoryAllocator<P>>>,
}

impl<P: RegionProvider + Clone> LockedMemoryAllocator<P> {
    pub const fn new() -> Self {
        Self {
            inner: SpinNoIrq::new(None),
        }
    }

    /// Build and initialize the inner allocator.
    pub fn init(&self, provider: P, config: MemoryAllocatorConfig) -> AllocResult {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            warn!("locked allocator: already initialized");
            return Err(AllocError::InvalidParam);
        }
        let mut allocator = MemoryAllocator::new(provider);
        allocator.init_with(config)?;
        *inner = Some(allocator);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    pub fn alloc(&self, size: usize) -> AllocResult<NonNull<u8>> {
        self.inner
            .lock()
            .as_mut()
            .ok_or(AllocError::NotInitialized)?
            .alloc(size)
    }

    /// # Safety
    ///
    /// See [`MemoryAllocator::free`].
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        match self.inner.lock().as_mut() {
            Some(allocator) => unsafe { allocator.free(ptr) },
            None => {
                error!("locked allocator: free before init");
            }
        }
    }

    pub fn tier_of(&self, ptr: NonNull<u8>) -> Option<Tier> {
        self.inner.lock().as_ref()?.tier_of(ptr)
    }

    /// Tear down the inner allocator, releasing every region.
    pub fn destroy(&self) {
        if let Some(mut allocator) = self.inner.lock().take() {
            allocator.destroy();
        }
    }

    #[cfg(feature = "tracking")]
    pub fn stats(&self) -> Option<crate::stats::MemoryStats> {
        self.inner.lock().as_ref().map(|allocator| allocator.stats())
    }

    #[cfg(feature = "tracking")]
    pub fn dump_stat(&self) {
        if let Some(allocator) = self.inner.lock().as_ref() {
            allocator.dump_stat();
        }
    }

    fn alloc_layout(&self, layout: Layout) -> AllocResult<NonNull<u8>>
    where
        P: Default,
    {
        let size = routed_size(layout).ok_or(AllocError::InvalidParam)?;
        let mut inner = self.inner.lock();
        if inner.is_none() {
            let mut allocator = MemoryAllocator::new(P::default());
            allocator.init()?;
            *inner = Some(allocator);
        }
        inner
            .as_mut()
            .ok_or(AllocError::NotInitialized)?
            .alloc(size)
    }
}

/// Request size that yields a block satisfying `layout`.
///
/// Every tier hands out `BLOCK_ALIGN`-aligned blocks, and a fixed-class block
/// is aligned to its own size. Anything stricter than that is unsupported.
fn routed_size(layout: Layout) -> Option<usize> {
    if layout.align() <= BLOCK_ALIGN {
        return Some(layout.size());
    }
    let size = layout.size().max(layout.align());
    (size <= SizeClass::MAX_SIZE).then_some(size)
}

impl<P: RegionProvider + Clone> Default for LockedMemoryAllocator<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Initializes itself with the default provider and geometry on first use.
unsafe impl<P: RegionProvider + Clone + Default> GlobalAlloc for LockedMemoryAllocator<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.alloc_layout(layout) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_e) => {
                warn!("locked allocator: cannot serve {:?}: {:?}", layout, _e);
                core::ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { self.free(ptr) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // A fixed-class block already covers every size up to its class.
        if let Some(old) = NonNull::new(ptr) {
            if let Some(Tier::Fixed(class)) = self.tier_of(old) {
                if new_size <= class.size() {
                    return ptr;
                }
            }
        }

        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return core::ptr::null_mut();
        };
        let new_ptr = unsafe { GlobalAlloc::alloc(self, new_layout) };
        if !new_ptr.is_null() {
            unsafe {
                core::ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
        }
        new_ptr
    }
}
