//! OS region provider.
//!
//! Every page, buffer and large-object mapping is obtained from a
//! [`RegionProvider`]. The engines only ever reserve whole regions and give
//! them back whole, so the provider needs no notion of partial release.

use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::error;

use crate::{AllocError, AllocResult};

/// Source of committed, readable and writable address ranges.
pub trait RegionProvider {
    /// Reserve and commit `size` bytes of zero-initialized memory.
    ///
    /// The returned base address is at least page aligned.
    fn reserve_commit(&mut self, size: usize) -> AllocResult<NonNull<u8>>;

    /// Release a region previously returned by [`reserve_commit`](Self::reserve_commit).
    ///
    /// Returns whether the provider accepted the release.
    ///
    /// # Safety
    ///
    /// `base` and `size` must describe exactly one live region obtained from
    /// this provider, and nothing may access the region afterwards.
    unsafe fn release(&mut self, base: NonNull<u8>, size: usize) -> bool;
}

/// Anonymous private mappings via `mmap(2)`/`munmap(2)`.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MmapRegionProvider;

#[cfg(unix)]
impl MmapRegionProvider {
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
impl RegionProvider for MmapRegionProvider {
    fn reserve_commit(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        if size == 0 {
            return Err(AllocError::InvalidParam);
        }

        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            error!("region provider: mmap of {:#x} bytes failed", size);
            return Err(AllocError::NoMemory);
        }

        NonNull::new(ptr.cast::<u8>()).ok_or(AllocError::NoMemory)
    }

    unsafe fn release(&mut self, base: NonNull<u8>, size: usize) -> bool {
        let rc = unsafe { libc::munmap(base.as_ptr().cast::<libc::c_void>(), size) };
        if rc != 0 {
            error!(
                "region provider: munmap of [{:#x}, +{:#x}) failed",
                base.as_ptr() as usize,
                size
            );
        }
        rc == 0
    }
}

/// Heap-backed provider that counts live regions, shared by unit tests.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use core::alloc::Layout;
    use core::cell::RefCell;
    use std::alloc::{alloc_zeroed, dealloc};
    use std::rc::Rc;
    use std::vec::Vec;

    const REGION_ALIGN: usize = 0x1000;

    #[derive(Default)]
    pub(crate) struct Ledger {
        pub(crate) live: Vec<(usize, usize)>,
        pub(crate) reserved: usize,
        pub(crate) released: usize,
        /// Reservations fail with `NoMemory` once `reserved` reaches this.
        pub(crate) reserve_limit: Option<usize>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct CountingProvider {
        pub(crate) ledger: Rc<RefCell<Ledger>>,
    }

    impl CountingProvider {
        pub(crate) fn live_regions(&self) -> usize {
            self.ledger.borrow().live.len()
        }

        pub(crate) fn reserved(&self) -> usize {
            self.ledger.borrow().reserved
        }

        pub(crate) fn released(&self) -> usize {
            self.ledger.borrow().released
        }

        pub(crate) fn set_reserve_limit(&self, limit: Option<usize>) {
            self.ledger.borrow_mut().reserve_limit = limit;
        }
    }

    impl RegionProvider for CountingProvider {
        fn reserve_commit(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
            {
                let ledger = self.ledger.borrow();
                if ledger.reserve_limit.is_some_and(|limit| ledger.reserved >= limit) {
                    return Err(AllocError::NoMemory);
                }
            }
            let layout =
                Layout::from_size_align(size, REGION_ALIGN).map_err(|_| AllocError::InvalidParam)?;
            let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(AllocError::NoMemory)?;
            let mut ledger = self.ledger.borrow_mut();
            ledger.live.push((ptr.as_ptr() as usize, size));
            ledger.reserved += 1;
            Ok(ptr)
        }

        unsafe fn release(&mut self, base: NonNull<u8>, size: usize) -> bool {
            let mut ledger = self.ledger.borrow_mut();
            let addr = base.as_ptr() as usize;
            let Some(idx) = ledger
                .live
                .iter()
                .position(|&(a, s)| a == addr && s == size)
            else {
                return false;
            };
            ledger.live.swap_remove(idx);
            ledger.released += 1;
            let layout = Layout::from_size_align(size, REGION_ALIGN).unwrap();
            unsafe { dealloc(base.as_ptr(), layout) };
            true
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_mmap_reserve_release() {
        let mut provider = MmapRegionProvider::new();
        let base = provider.reserve_commit(0x3000).unwrap();
        assert!(crate::is_aligned(base.as_ptr() as usize, 0x1000));

        // Fresh anonymous mappings are zeroed and writable.
        unsafe {
            assert_eq!(*base.as_ptr().add(0x2fff), 0);
            base.as_ptr().add(0x2fff).write(0xab);
        }

        assert!(unsafe { provider.release(base, 0x3000) });
    }

    #[test]
    fn test_mmap_zero_size_rejected() {
        let mut provider = MmapRegionProvider::new();
        assert_eq!(provider.reserve_commit(0), Err(AllocError::InvalidParam));
    }
}
