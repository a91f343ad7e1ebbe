//! Integration tests for the scratch allocator.

use basalt_memory::scratch::ScratchAllocator;
use basalt_memory::{MemoryUsage, Reset};

#[test]
fn bump_respects_alignment_and_disjointness() {
    let mut allocator =
        ScratchAllocator::create(4096, 8).expect("failed to create scratch allocator");

    let p1 = allocator.alloc(13, 8).expect("allocation 1 failed");
    let p2 = allocator.alloc(7, 16).expect("allocation 2 failed");
    let p3 = allocator.alloc(1, 1).expect("allocation 3 failed");

    let a1 = p1.as_ptr() as usize;
    let a2 = p2.as_ptr() as usize;
    let a3 = p3.as_ptr() as usize;

    assert_eq!(a1 % 8, 0);
    assert_eq!(a2 % 16, 0);
    assert!(a2 - a1 >= 13, "allocations overlap");
    assert!(a3 > a2);

    // The first allocation starts the usable region, so everything must
    // stay inside [a1, a1 + capacity).
    assert!(a3 < a1 + 4096);

    allocator.destroy().expect("destroy failed");
}

#[test]
fn reset_zeroes_and_reuses_addresses() {
    let mut allocator =
        ScratchAllocator::create(4096, 8).expect("failed to create scratch allocator");

    let p1 = allocator.alloc(13, 8).expect("allocation failed");
    unsafe { std::ptr::write_bytes(p1.as_ptr(), 0xAA, 13) };

    allocator.reset().expect("reset failed");
    assert_eq!(allocator.allocated(), 0);

    let q1 = allocator.alloc(13, 8).expect("allocation after reset failed");
    assert_eq!(q1, p1, "reset must rewind to the same addresses");

    let bytes = unsafe { std::slice::from_raw_parts(q1.as_ptr(), 13) };
    assert!(bytes.iter().all(|&b| b == 0), "reset must zero the region");

    allocator.destroy().expect("destroy failed");
}

#[test]
fn exhaustion_is_recoverable() {
    let mut allocator =
        ScratchAllocator::create(64, 8).expect("failed to create scratch allocator");

    assert!(allocator.alloc(60, 8).is_some());
    assert!(allocator.alloc(16, 8).is_none(), "over-capacity alloc must fail");
    assert!(
        allocator.alloc(4, 1).is_some(),
        "a fitting alloc must still succeed after a failed one"
    );

    allocator.destroy().expect("destroy failed");
}

#[test]
fn full_capacity_alloc_after_reset() {
    let mut allocator =
        ScratchAllocator::create(512, 8).expect("failed to create scratch allocator");

    assert!(allocator.alloc(300, 8).is_some());
    Reset::reset(&mut allocator).expect("reset failed");
    assert!(
        allocator.alloc(512, 1).is_some(),
        "full capacity must be allocatable right after reset"
    );

    allocator.destroy().expect("destroy failed");
}

#[test]
fn copy_from_duplicates_bytes() {
    let mut allocator =
        ScratchAllocator::create(256, 8).expect("failed to create scratch allocator");

    let payload = [0x11u8, 0x22, 0x33, 0x44, 0x55];
    let dest = allocator.copy_from(&payload).expect("copy failed");

    assert_eq!(dest.as_ptr() as usize % std::mem::align_of::<*mut u8>(), 0);
    let bytes = unsafe { std::slice::from_raw_parts(dest.as_ptr(), payload.len()) };
    assert_eq!(bytes, &payload);

    allocator.destroy().expect("destroy failed");
}

unsafe fn free_heap_block(ptr: *mut u8) {
    // SAFETY: test helper; the pointer always comes from the matching
    // Box::into_raw below.
    unsafe { drop(Box::from_raw(ptr.cast::<[u8; 16]>())) };
}

#[test]
fn move_from_frees_and_nulls_the_source() {
    let mut allocator =
        ScratchAllocator::create(256, 8).expect("failed to create scratch allocator");

    let mut src = Box::into_raw(Box::new([0x77u8; 16])).cast::<u8>();
    let dest = unsafe { allocator.move_from(&mut src, 16, free_heap_block) }
        .expect("move failed");

    assert!(src.is_null(), "move must null the source pointer");
    let bytes = unsafe { std::slice::from_raw_parts(dest.as_ptr(), 16) };
    assert!(bytes.iter().all(|&b| b == 0x77));

    allocator.destroy().expect("destroy failed");
}

#[test]
fn usage_accounting() {
    let mut allocator =
        ScratchAllocator::create(1024, 8).expect("failed to create scratch allocator");

    assert_eq!(allocator.total_memory(), Some(1024));
    assert_eq!(allocator.used_memory(), 0);

    allocator.alloc(100, 8).expect("allocation failed");
    assert_eq!(allocator.used_memory(), 100);
    assert_eq!(allocator.available_memory(), Some(924));

    // Watermark only moves forward between resets.
    allocator.alloc(10, 2).expect("allocation failed");
    assert!(allocator.used_memory() >= 110);

    allocator.destroy().expect("destroy failed");
}
