//! Slab page implementation.
//!
//! A page is one OS-backed region: a [`PageHeader`] followed by an array of
//! `blocks_per_page` equally sized slots. Free slots are chained through an
//! index stored in their first word.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::END_OF_LIST;

/// Largest alignment a slot array is padded to.
const MAX_SLOT_ALIGN: usize = 0x1000;

#[repr(C)]
pub(crate) struct PageHeader {
    next: Option<NonNull<PageHeader>>,
    free_head: usize,
    initialized: usize,
    blocks: NonNull<u8>,
}

/// Layout shared by every page of one allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageGeometry {
    pub block_size: usize,
    pub blocks_per_page: usize,
    /// Offset of the slot array from the region base.
    pub blocks_offset: usize,
    /// Total bytes reserved from the provider per page.
    pub region_size: usize,
}

impl PageGeometry {
    pub const EMPTY: Self = Self {
        block_size: 0,
        blocks_per_page: 0,
        blocks_offset: 0,
        region_size: 0,
    };

    /// Slots are aligned to the largest power of two dividing `block_size`.
    ///
    /// Returns `None` when the page would not fit the address space.
    pub fn new(block_size: usize, blocks_per_page: usize) -> Option<Self> {
        let slot_align = (1usize << block_size.trailing_zeros()).min(MAX_SLOT_ALIGN);
        let blocks_offset = crate::align_up(size_of::<PageHeader>(), slot_align);
        let region_size = block_size
            .checked_mul(blocks_per_page)?
            .checked_add(blocks_offset)?;
        Some(Self {
            block_size,
            blocks_per_page,
            blocks_offset,
            region_size,
        })
    }

    pub fn payload_bytes(&self) -> usize {
        self.block_size * self.blocks_per_page
    }
}

/// Handle to a page header living at the start of its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageNode {
    header: NonNull<PageHeader>,
}

impl PageNode {
    /// Write a fresh header at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a writable region of `geometry.region_size` bytes,
    /// aligned to at least the page header and slot alignment.
    pub unsafe fn init(base: NonNull<u8>, geometry: &PageGeometry) -> Self {
        let header = base.cast::<PageHeader>();
        let blocks = unsafe { base.add(geometry.blocks_offset) };
        unsafe {
            header.write(PageHeader {
                next: None,
                free_head: END_OF_LIST,
                initialized: 0,
                blocks,
            });
        }
        Self { header }
    }

    fn header(&self) -> &PageHeader {
        unsafe { self.header.as_ref() }
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        unsafe { self.header.as_mut() }
    }

    /// Base of the OS region backing this page.
    pub fn region_base(&self) -> NonNull<u8> {
        self.header.cast()
    }

    pub fn blocks(&self) -> usize {
        self.header().blocks.as_ptr() as usize
    }

    pub fn next(&self) -> Option<PageNode> {
        self.header().next.map(|header| PageNode { header })
    }

    pub fn set_next(&mut self, next: Option<PageNode>) {
        self.header_mut().next = next.map(|node| node.header);
    }

    pub fn free_head(&self) -> usize {
        self.header().free_head
    }

    pub fn initialized(&self) -> usize {
        self.header().initialized
    }

    pub fn slot_addr(&self, index: usize, geometry: &PageGeometry) -> usize {
        self.blocks() + index * geometry.block_size
    }

    /// Closed-open range test over the whole slot array.
    pub fn contains(&self, addr: usize, geometry: &PageGeometry) -> bool {
        let start = self.blocks();
        start <= addr && addr < start + geometry.payload_bytes()
    }

    pub fn slot_index(&self, addr: usize, geometry: &PageGeometry) -> Option<usize> {
        let offset = addr.checked_sub(self.blocks())?;
        if offset % geometry.block_size != 0 {
            return None;
        }
        let index = offset / geometry.block_size;
        (index < geometry.blocks_per_page).then_some(index)
    }

    /// Free-list link stored in the slot at `index`.
    pub fn link_at(&self, index: usize, geometry: &PageGeometry) -> usize {
        unsafe { (self.slot_addr(index, geometry) as *const usize).read() }
    }

    /// Pop the head of the free list.
    pub fn pop_free(&mut self, geometry: &PageGeometry) -> Option<NonNull<u8>> {
        let index = self.free_head();
        if index == END_OF_LIST {
            return None;
        }
        let next = self.link_at(index, geometry);
        self.header_mut().free_head = next;
        NonNull::new(self.slot_addr(index, geometry) as *mut u8)
    }

    /// Hand out the next never-used slot.
    pub fn bump(&mut self, geometry: &PageGeometry) -> Option<NonNull<u8>> {
        let index = self.initialized();
        if index >= geometry.blocks_per_page {
            return None;
        }
        self.header_mut().initialized = index + 1;
        NonNull::new(self.slot_addr(index, geometry) as *mut u8)
    }

    /// Push the slot at `index` onto the free list.
    ///
    /// # Safety
    ///
    /// `index` must name a live slot of this page.
    pub unsafe fn push_free(&mut self, index: usize, geometry: &PageGeometry) {
        let slot = self.slot_addr(index, geometry) as *mut usize;
        unsafe { slot.write(self.free_head()) };
        self.header_mut().free_head = index;
    }

    /// Number of slots currently chained in the free list.
    #[cfg(any(test, feature = "tracking"))]
    pub fn free_len(&self, geometry: &PageGeometry) -> usize {
        let mut len = 0;
        let mut index = self.free_head();
        while index != END_OF_LIST {
            len += 1;
            index = self.link_at(index, geometry);
        }
        len
    }

    #[cfg(any(debug_assertions, feature = "tracking"))]
    pub fn is_free(&self, index: usize, geometry: &PageGeometry) -> bool {
        let mut cursor = self.free_head();
        while cursor != END_OF_LIST {
            if cursor == index {
                return true;
            }
            cursor = self.link_at(cursor, geometry);
        }
        false
    }
}
