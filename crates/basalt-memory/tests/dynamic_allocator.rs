//! Integration tests for the dynamic allocator.

use basalt_memory::dynamic::DynamicAllocator;
use basalt_memory::{MemoryUsage, Reset};

#[test]
fn allocations_stay_in_the_first_block_while_it_fits() {
    let mut allocator = DynamicAllocator::create(256, 8).expect("failed to create allocator");

    let p1 = allocator.alloc(64).expect("allocation failed");
    let p2 = allocator.alloc(64).expect("allocation failed");

    assert_eq!(p1.as_ptr() as usize % 8, 0);
    assert_eq!(p2.as_ptr() as usize % 8, 0);
    assert!(p2.as_ptr() as usize >= p1.as_ptr() as usize + 64);
    assert_eq!(allocator.block_count(), 1);

    allocator.destroy().expect("destroy failed");
}

#[test]
fn overflow_appends_a_block() {
    let mut allocator = DynamicAllocator::create(256, 8).expect("failed to create allocator");

    let first = allocator.alloc(200).expect("allocation failed");
    let overflow = allocator.alloc(200).expect("overflow allocation failed");
    assert_eq!(allocator.block_count(), 2);
    assert_eq!(overflow.as_ptr() as usize % 8, 0);

    // First-fit: a small request must reuse the head block's tail space.
    let small = allocator.alloc(40).expect("small allocation failed");
    assert_eq!(allocator.block_count(), 2);
    assert_eq!(small.as_ptr() as usize, first.as_ptr() as usize + 200);

    allocator.destroy().expect("destroy failed");
}

#[test]
fn oversized_requests_get_a_block_of_their_own() {
    let mut allocator = DynamicAllocator::create(128, 16).expect("failed to create allocator");

    let big = allocator.alloc(8192).expect("oversized allocation failed");
    assert_eq!(big.as_ptr() as usize % 16, 0);
    assert_eq!(allocator.block_count(), 2);

    // The oversized block is fully writable.
    unsafe { std::ptr::write_bytes(big.as_ptr(), 0x42, 8192) };
    assert_eq!(unsafe { big.as_ptr().add(8191).read() }, 0x42);

    allocator.destroy().expect("destroy failed");
}

#[test]
fn reset_keeps_the_first_block_only() {
    let mut allocator = DynamicAllocator::create(128, 8).expect("failed to create allocator");

    let first = allocator.alloc(64).expect("allocation failed");
    allocator.alloc(512).expect("overflow allocation failed");
    allocator.alloc(512).expect("overflow allocation failed");
    assert!(allocator.block_count() >= 2);

    Reset::reset(&mut allocator).expect("reset failed");
    assert_eq!(allocator.block_count(), 1);
    assert_eq!(allocator.used_memory(), 0);

    let again = allocator.alloc(64).expect("allocation after reset failed");
    assert_eq!(again, first, "reset must rewind the first block");

    allocator.destroy().expect("destroy failed");
}

#[test]
fn usage_accounting_spans_the_chain() {
    let mut allocator = DynamicAllocator::create(128, 8).expect("failed to create allocator");

    allocator.alloc(100).expect("allocation failed");
    allocator.alloc(200).expect("overflow allocation failed");

    assert!(allocator.used_memory() >= 300);
    assert_eq!(allocator.total_memory(), None);
    assert!(allocator.available_memory().is_some());

    allocator.destroy().expect("destroy failed");
}

#[test]
fn fixed_alignment_applies_to_every_block() {
    let mut allocator = DynamicAllocator::create(64, 128).expect("failed to create allocator");
    assert_eq!(allocator.alignment(), 128);

    for _ in 0..8 {
        let ptr = allocator.alloc(48).expect("allocation failed");
        assert_eq!(ptr.as_ptr() as usize % 128, 0);
    }

    allocator.destroy().expect("destroy failed");
}
