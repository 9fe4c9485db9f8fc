//! Coalescing buffer and block headers.
//!
//! A buffer is one OS-backed region: a [`BufferHeader`] followed by a
//! contiguous run of blocks. Each block is a [`BlockHeader`] immediately
//! followed by its payload. Blocks are addressed by their offset from the
//! start of the block area; the same offsets link the free list.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::END_OF_LIST;

/// Alignment of every block header and payload.
pub const BLOCK_ALIGN: usize = 16;

/// Bytes taken by one block header.
pub const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Smallest payload a block may have: it must hold a free-list link.
pub const MIN_PAYLOAD: usize = BLOCK_ALIGN;

const _: () = assert!(MIN_PAYLOAD >= size_of::<usize>());
const _: () = assert!(BLOCK_HEADER_SIZE % BLOCK_ALIGN == 0);

#[repr(C)]
pub(crate) struct BufferHeader {
    next: Option<NonNull<BufferHeader>>,
    free_head: usize,
    blocks: NonNull<u8>,
}

#[repr(C, align(16))]
pub(crate) struct BlockHeader {
    size: usize,
    free: bool,
}

/// Layout shared by every buffer of one allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferGeometry {
    /// Payload capacity of a fresh buffer (its single free block).
    pub buffer_size: usize,
    pub blocks_offset: usize,
    pub region_size: usize,
}

impl BufferGeometry {
    pub const EMPTY: Self = Self {
        buffer_size: 0,
        blocks_offset: 0,
        region_size: 0,
    };

    /// Returns `None` when the buffer would not fit the address space.
    pub fn new(buffer_size: usize) -> Option<Self> {
        let buffer_size = payload_size_for(buffer_size)?;
        let blocks_offset = crate::align_up(size_of::<BufferHeader>(), BLOCK_ALIGN);
        let region_size = buffer_size.checked_add(blocks_offset + BLOCK_HEADER_SIZE)?;
        Some(Self {
            buffer_size,
            blocks_offset,
            region_size,
        })
    }

    /// Offset one past the last block.
    pub fn blocks_end(&self) -> usize {
        BLOCK_HEADER_SIZE + self.buffer_size
    }
}

/// Round a request up to a block payload size, or `None` on overflow.
pub(crate) fn payload_size_for(request: usize) -> Option<usize> {
    crate::checked_align_up(request.max(MIN_PAYLOAD), BLOCK_ALIGN)
}

/// Handle to a buffer header living at the start of its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferNode {
    header: NonNull<BufferHeader>,
}

impl BufferNode {
    /// Write a fresh header at `base` with one free block spanning the buffer.
    ///
    /// # Safety
    ///
    /// `base` must point to a writable, `BLOCK_ALIGN`-aligned region of
    /// `geometry.region_size` bytes.
    pub unsafe fn init(base: NonNull<u8>, geometry: &BufferGeometry) -> Self {
        let header = base.cast::<BufferHeader>();
        let blocks = unsafe { base.add(geometry.blocks_offset) };
        unsafe {
            header.write(BufferHeader {
                next: None,
                free_head: 0,
                blocks,
            });
        }
        let mut node = Self { header };
        node.write_block(0, geometry.buffer_size, true);
        node.set_link(0, END_OF_LIST);
        node
    }

    fn header(&self) -> &BufferHeader {
        unsafe { self.header.as_ref() }
    }

    fn header_mut(&mut self) -> &mut BufferHeader {
        unsafe { self.header.as_mut() }
    }

    fn block(&self, offset: usize) -> *mut BlockHeader {
        (self.blocks() + offset) as *mut BlockHeader
    }

    pub fn region_base(&self) -> NonNull<u8> {
        self.header.cast()
    }

    pub fn blocks(&self) -> usize {
        self.header().blocks.as_ptr() as usize
    }

    pub fn next(&self) -> Option<BufferNode> {
        self.header().next.map(|header| BufferNode { header })
    }

    pub fn set_next(&mut self, next: Option<BufferNode>) {
        self.header_mut().next = next.map(|node| node.header);
    }

    pub fn free_head(&self) -> usize {
        self.header().free_head
    }

    pub fn set_free_head(&mut self, offset: usize) {
        self.header_mut().free_head = offset;
    }

    /// Whether `addr` lies strictly inside the block area.
    pub fn contains(&self, addr: usize, geometry: &BufferGeometry) -> bool {
        let start = self.blocks();
        start < addr && addr < start + geometry.blocks_end()
    }

    pub fn write_block(&mut self, offset: usize, size: usize, free: bool) {
        unsafe { self.block(offset).write(BlockHeader { size, free }) };
    }

    pub fn size_of_block(&self, offset: usize) -> usize {
        unsafe { (*self.block(offset)).size }
    }

    pub fn set_size(&mut self, offset: usize, size: usize) {
        unsafe { (*self.block(offset)).size = size };
    }

    pub fn is_free(&self, offset: usize) -> bool {
        unsafe { (*self.block(offset)).free }
    }

    pub fn set_free(&mut self, offset: usize, free: bool) {
        unsafe { (*self.block(offset)).free = free };
    }

    pub fn payload(&self, offset: usize) -> usize {
        self.blocks() + offset + BLOCK_HEADER_SIZE
    }

    /// Free-list link kept in the first payload word of a free block.
    pub fn link(&self, offset: usize) -> usize {
        unsafe { (self.payload(offset) as *const usize).read() }
    }

    pub fn set_link(&mut self, offset: usize, next: usize) {
        unsafe { (self.payload(offset) as *mut usize).write(next) };
    }

    /// Offset of the block physically following the one at `offset`.
    pub fn next_physical(&self, offset: usize, geometry: &BufferGeometry) -> Option<usize> {
        let next = offset + BLOCK_HEADER_SIZE + self.size_of_block(offset);
        (next < geometry.blocks_end()).then_some(next)
    }

    /// Point the predecessor (or the list head) at `target`.
    pub fn relink(&mut self, prev: Option<usize>, target: usize) {
        match prev {
            Some(prev) => self.set_link(prev, target),
            None => self.set_free_head(target),
        }
    }

    /// Remove `target` from the free list. Returns `false` if the chain
    /// does not reach it.
    pub fn unlink(&mut self, target: usize) -> bool {
        let mut prev = None;
        let mut cursor = self.free_head();
        while cursor != END_OF_LIST {
            if cursor == target {
                let next = self.link(cursor);
                self.relink(prev, next);
                return true;
            }
            prev = Some(cursor);
            cursor = self.link(cursor);
        }
        false
    }

    /// Physical walk over `(offset, size, free)` of every block.
    #[cfg(any(test, feature = "tracking"))]
    pub fn physical_blocks<'a>(
        &'a self,
        geometry: &'a BufferGeometry,
    ) -> impl Iterator<Item = (usize, usize, bool)> + 'a {
        let mut cursor = Some(0);
        core::iter::from_fn(move || {
            let offset = cursor?;
            cursor = self.next_physical(offset, geometry);
            Some((offset, self.size_of_block(offset), self.is_free(offset)))
        })
    }

    /// Offsets reachable from the free-list head, in list order.
    #[cfg(any(test, feature = "tracking"))]
    pub fn free_chain(&self) -> impl Iterator<Item = usize> + '_ {
        let mut cursor = self.free_head();
        core::iter::from_fn(move || {
            if cursor == END_OF_LIST {
                return None;
            }
            let offset = cursor;
            cursor = self.link(offset);
            Some(offset)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;
    use std::alloc::{alloc_zeroed, dealloc};
    use std::vec::Vec;

    fn with_buffer(buffer_size: usize, f: impl FnOnce(BufferNode, BufferGeometry)) {
        let geometry = BufferGeometry::new(buffer_size).unwrap();
        let layout = Layout::from_size_align(geometry.region_size, 0x1000).unwrap();
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();
        let node = unsafe { BufferNode::init(base, &geometry) };
        f(node, geometry);
        unsafe { dealloc(base.as_ptr(), layout) };
    }

    #[test]
    fn test_header_size() {
        assert_eq!(BLOCK_HEADER_SIZE, 16);
        assert_eq!(payload_size_for(0), Some(16));
        assert_eq!(payload_size_for(17), Some(32));
        assert_eq!(payload_size_for(513), Some(528));
        assert_eq!(payload_size_for(usize::MAX - 15), Some(usize::MAX - 15));
        assert_eq!(payload_size_for(usize::MAX - 14), None);
        assert_eq!(payload_size_for(usize::MAX), None);
    }

    #[test]
    fn test_geometry_overflow() {
        assert_eq!(BufferGeometry::new(usize::MAX), None);
        assert_eq!(BufferGeometry::new(usize::MAX - 15), None);
        let geometry = BufferGeometry::new(100).unwrap();
        assert_eq!(geometry.buffer_size, 112);
        assert_eq!(geometry.region_size, geometry.blocks_offset + BLOCK_HEADER_SIZE + 112);
    }

    #[test]
    fn test_fresh_buffer_is_one_free_block() {
        with_buffer(1024, |node, geometry| {
            let blocks: Vec<_> = node.physical_blocks(&geometry).collect();
            assert_eq!(blocks, [(0, 1024, true)]);
            assert_eq!(node.free_chain().collect::<Vec<_>>(), [0]);
            assert!(crate::is_aligned(node.payload(0), BLOCK_ALIGN));
        });
    }

    #[test]
    fn test_unlink_middle_of_chain() {
        with_buffer(1024, |mut node, geometry| {
            // Three blocks: [0:208][224:272][512:512], chained 512 -> 224 -> 0
            node.write_block(0, 208, true);
            node.write_block(224, 272, true);
            node.write_block(512, 512, true);
            assert_eq!(node.next_physical(0, &geometry), Some(224));
            assert_eq!(node.next_physical(224, &geometry), Some(512));
            assert_eq!(node.next_physical(512, &geometry), None);

            node.set_link(0, END_OF_LIST);
            node.set_link(224, 0);
            node.set_link(512, 224);
            node.set_free_head(512);

            assert!(node.unlink(224));
            assert_eq!(node.free_chain().collect::<Vec<_>>(), [512, 0]);
            assert!(!node.unlink(224));
            assert!(node.unlink(512));
            assert_eq!(node.free_chain().collect::<Vec<_>>(), [0]);
        });
    }

    #[test]
    fn test_contains_is_strict() {
        with_buffer(256, |node, geometry| {
            let start = node.blocks();
            assert!(!node.contains(start, &geometry));
            assert!(node.contains(node.payload(0), &geometry));
            assert!(node.contains(start + geometry.blocks_end() - 1, &geometry));
            assert!(!node.contains(start + geometry.blocks_end(), &geometry));
        });
    }
}
