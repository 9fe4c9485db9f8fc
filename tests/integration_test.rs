//! Integration tests for the allocator crate
//!
//! Exercises the public API end to end over real `mmap` regions.

extern crate slab_coalesce_allocator;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use std::thread;
use std::vec::Vec;

use slab_coalesce_allocator::memory_allocator::LARGE_OBJECT_THRESHOLD;
use slab_coalesce_allocator::{
    AllocError, CoalesceAllocator, FixedSizeAllocator, LockedMemoryAllocator, MemoryAllocator,
    MemoryAllocatorConfig, MmapRegionProvider, SizeClass, Tier,
};

fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
    unsafe { ptr.as_ptr().write_bytes(byte, len) };
}

fn check(ptr: NonNull<u8>, len: usize, byte: u8) -> bool {
    let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), len) };
    bytes.iter().all(|&b| b == byte)
}

#[test]
fn test_fixed_size_allocator_grows_by_pages() {
    let mut allocator = FixedSizeAllocator::new(MmapRegionProvider::new());
    allocator.init(64, 16).unwrap();
    assert_eq!(allocator.page_count(), 1);

    let mut blocks = Vec::new();
    for i in 0..40u8 {
        let ptr = allocator.alloc(64).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        fill(ptr, 64, i);
        blocks.push(ptr);
    }
    assert_eq!(allocator.page_count(), 3);
    for (i, &ptr) in blocks.iter().enumerate() {
        assert!(check(ptr, 64, i as u8));
    }

    for &ptr in blocks.iter() {
        unsafe { assert!(allocator.free(ptr)) };
    }
    // Free lists are per page and LIFO: the first page hands back its last
    // released block.
    assert_eq!(allocator.alloc(64).unwrap(), blocks[15]);
    assert_eq!(allocator.page_count(), 3);

    allocator.destroy();
}

#[test]
fn test_fixed_size_allocator_rejects_bad_geometry() {
    let mut allocator = FixedSizeAllocator::new(MmapRegionProvider::new());
    assert_eq!(allocator.init(4, 16), Err(AllocError::InvalidParam));
    assert_eq!(allocator.init(24, 0), Err(AllocError::InvalidParam));
    assert_eq!(allocator.init(12, 16), Err(AllocError::InvalidParam));
}

#[test]
fn test_coalesce_allocator_merges_back_to_one_block() {
    let mut allocator = CoalesceAllocator::new(MmapRegionProvider::new());
    allocator.init(4096).unwrap();

    let a = allocator.alloc(1000).unwrap();
    let b = allocator.alloc(1000).unwrap();
    let c = allocator.alloc(1000).unwrap();
    fill(a, 1000, 0xa);
    fill(b, 1000, 0xb);
    fill(c, 1000, 0xc);
    assert!(check(a, 1000, 0xa) && check(b, 1000, 0xb) && check(c, 1000, 0xc));

    unsafe {
        assert!(allocator.free(b));
        assert!(allocator.free(a));
        assert!(allocator.free(c));
    }

    // The whole buffer is one free block again.
    let whole = allocator.alloc(4096).unwrap();
    assert_eq!(whole, a);
    assert_eq!(allocator.buffer_count(), 1);

    assert_eq!(allocator.alloc(4097), Err(AllocError::InvalidParam));
}

#[test]
fn test_coalesce_allocator_grows_when_full() {
    let mut allocator = CoalesceAllocator::new(MmapRegionProvider::new());
    allocator.init(4096).unwrap();

    let first = allocator.alloc(3000).unwrap();
    let second = allocator.alloc(3000).unwrap();
    assert_eq!(allocator.buffer_count(), 2);
    assert!(allocator.owns(first) && allocator.owns(second));
    unsafe {
        assert!(allocator.free(first));
        assert!(allocator.free(second));
    }
}

#[test]
fn test_memory_allocator_default_geometry() {
    let mut allocator = MemoryAllocator::new(MmapRegionProvider::new());
    allocator.init().unwrap();
    assert_eq!(*allocator.config(), MemoryAllocatorConfig::default());

    let small = allocator.alloc(1).unwrap();
    let mid = allocator.alloc(513).unwrap();
    let below = allocator.alloc(LARGE_OBJECT_THRESHOLD - 1).unwrap();
    let large = allocator.alloc(LARGE_OBJECT_THRESHOLD).unwrap();

    assert_eq!(allocator.tier_of(small), Some(Tier::Fixed(SizeClass::Bytes16)));
    assert_eq!(allocator.tier_of(mid), Some(Tier::Coalesce));
    assert_eq!(allocator.tier_of(below), Some(Tier::Coalesce));
    assert_eq!(
        allocator.tier_of(large),
        Some(Tier::Os {
            size: LARGE_OBJECT_THRESHOLD
        })
    );

    fill(large, LARGE_OBJECT_THRESHOLD, 0x77);
    assert!(check(large, LARGE_OBJECT_THRESHOLD, 0x77));

    unsafe {
        allocator.free(large);
        allocator.free(below);
        allocator.free(mid);
        allocator.free(small);
    }
    assert_eq!(allocator.os_block_count(), 0);
    allocator.destroy();
}

#[test]
fn test_memory_allocator_mixed_workload() {
    let mut allocator = MemoryAllocator::new(MmapRegionProvider::new());
    allocator
        .init_with(MemoryAllocatorConfig {
            large_object_threshold: 64 * 1024,
            coalesce_buffer_size: 128 * 1024,
        })
        .unwrap();

    let sizes = [8, 16, 24, 100, 200, 400, 512, 700, 4000, 30_000, 70_000, 100_000];
    let mut live = Vec::new();
    for round in 0..8u8 {
        for (i, &size) in sizes.iter().enumerate() {
            let ptr = allocator.alloc(size).unwrap();
            let byte = round.wrapping_mul(31).wrapping_add(i as u8);
            fill(ptr, size, byte);
            live.push((ptr, size, byte));
        }
        // Release every other live block to interleave reuse with growth.
        let mut index = 0;
        live.retain(|&(ptr, _, _)| {
            index += 1;
            if index % 2 == 0 {
                unsafe { allocator.free(ptr) };
                false
            } else {
                true
            }
        });
    }

    for &(ptr, size, byte) in live.iter() {
        assert!(check(ptr, size, byte), "block at {:p} corrupted", ptr);
    }
    for (ptr, _, _) in live.drain(..) {
        unsafe { allocator.free(ptr) };
    }
    assert_eq!(allocator.os_block_count(), 0);
}

#[test]
fn test_locked_allocator_backs_global_alloc() {
    static ALLOCATOR: LockedMemoryAllocator = LockedMemoryAllocator::new();

    let layout = Layout::from_size_align(48, 16).unwrap();
    let ptr = unsafe { GlobalAlloc::alloc(&ALLOCATOR, layout) };
    assert!(!ptr.is_null());
    assert!(ALLOCATOR.is_initialized());

    let grown = unsafe { ALLOCATOR.realloc(ptr, layout, 600) };
    assert!(!grown.is_null());
    unsafe { ALLOCATOR.dealloc(grown, Layout::from_size_align(600, 16).unwrap()) };
}

#[test]
fn test_locked_allocator_across_threads() {
    static ALLOCATOR: LockedMemoryAllocator = LockedMemoryAllocator::new();

    let config = MemoryAllocatorConfig {
        large_object_threshold: 16 * 1024,
        coalesce_buffer_size: 64 * 1024,
    };
    ALLOCATOR.init(MmapRegionProvider::new(), config).unwrap();

    let workers: Vec<_> = (0..4u8)
        .map(|worker| {
            thread::spawn(move || {
                for round in 0..200usize {
                    let size = 1 + (round * 97 + worker as usize * 13) % 20_000;
                    let ptr = ALLOCATOR.alloc(size).unwrap();
                    fill(ptr, size, worker);
                    assert!(check(ptr, size, worker));
                    unsafe { ALLOCATOR.free(ptr) };
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    ALLOCATOR.destroy();
    assert!(!ALLOCATOR.is_initialized());
}
