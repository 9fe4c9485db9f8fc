//! Property tests for the dispatcher.
//!
//! Live allocations never overlap and keep their contents across arbitrary
//! interleavings of `alloc` and `free` over every tier.

use core::ptr::NonNull;

use proptest::prelude::*;
use slab_coalesce_allocator::{MemoryAllocator, MemoryAllocatorConfig, MmapRegionProvider, Tier};

const THRESHOLD: usize = 8 * 1024;

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(prop::sample::Index),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..=512).prop_map(Op::Alloc),
        2 => (513usize..THRESHOLD).prop_map(Op::Alloc),
        1 => (THRESHOLD..3 * THRESHOLD).prop_map(Op::Alloc),
        4 => any::<prop::sample::Index>().prop_map(Op::Free),
    ]
}

struct Live {
    ptr: NonNull<u8>,
    size: usize,
    byte: u8,
}

impl Live {
    fn intact(&self) -> bool {
        let bytes = unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.size) };
        bytes.iter().all(|&b| b == self.byte)
    }

    fn range(&self) -> (usize, usize) {
        let start = self.ptr.as_ptr() as usize;
        (start, start + self.size.max(1))
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_live_blocks_never_overlap(ops in prop::collection::vec(op(), 1..128)) {
        let mut allocator = MemoryAllocator::new(MmapRegionProvider::new());
        allocator
            .init_with(MemoryAllocatorConfig {
                large_object_threshold: THRESHOLD,
                coalesce_buffer_size: 2 * THRESHOLD,
            })
            .unwrap();

        let mut live: Vec<Live> = Vec::new();
        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::Alloc(size) => {
                    let ptr = allocator.alloc(size).unwrap();
                    prop_assert!(allocator.tier_of(ptr).is_some());
                    if size >= THRESHOLD {
                        prop_assert_eq!(allocator.tier_of(ptr), Some(Tier::Os { size }));
                    }
                    let block = Live { ptr, size, byte: step as u8 };
                    unsafe { ptr.as_ptr().write_bytes(block.byte, size) };
                    live.push(block);
                }
                Op::Free(index) => {
                    if live.is_empty() {
                        continue;
                    }
                    let block = live.swap_remove(index.index(live.len()));
                    prop_assert!(block.intact());
                    unsafe { allocator.free(block.ptr) };
                }
            }

            let mut ranges: Vec<_> = live.iter().map(Live::range).collect();
            ranges.sort_unstable();
            for pair in ranges.windows(2) {
                prop_assert!(pair[0].1 <= pair[1].0, "overlap: {:?}", pair);
            }
        }

        for block in live.iter() {
            prop_assert!(block.intact());
        }
        for block in live.drain(..) {
            unsafe { allocator.free(block.ptr) };
        }
        prop_assert_eq!(allocator.os_block_count(), 0);
    }
}
