//! Integration tests for the transfer/absorb protocol.

use basalt_memory::scratch::ScratchAllocator;
use basalt_memory::stack::StackAllocator;
use basalt_memory::transfer::Envelope;
use basalt_memory::Strategy;

#[test]
fn round_trip_between_scratch_allocators() {
    let source = ScratchAllocator::create(256, 8).expect("failed to create source");
    let payload = [0xAAu8, 0xBB, 0xCC, 0xDD];

    let envelope = source.transfer(&payload, 4);
    assert_eq!(envelope.payload_len(), 4);
    assert_eq!(envelope.payload_alignment(), 4);

    let mut dest = ScratchAllocator::create(64, 8).expect("failed to create destination");
    let absorbed = dest.absorb(envelope).expect("absorb failed");

    assert_eq!(absorbed.as_ptr() as usize % 4, 0);
    let bytes = unsafe { std::slice::from_raw_parts(absorbed.as_ptr(), 4) };
    assert_eq!(bytes, &payload);

    dest.destroy().expect("destroy failed");
}

#[test]
fn payload_built_inside_the_source_region() {
    let mut source = ScratchAllocator::create(256, 8).expect("failed to create source");
    let ptr = source.alloc(64, 8).expect("allocation failed");
    unsafe {
        for i in 0..64 {
            ptr.as_ptr().add(i).write(i as u8);
        }
    }

    // The payload lives in the region being sealed; the envelope prefix
    // overlaps its tail.
    let payload = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
    let envelope = source.transfer(payload, 8);

    let mut dest = ScratchAllocator::create(128, 8).expect("failed to create destination");
    let absorbed = dest.absorb(envelope).expect("absorb failed");
    let bytes = unsafe { std::slice::from_raw_parts(absorbed.as_ptr(), 64) };
    for (i, b) in bytes.iter().enumerate() {
        assert_eq!(*b, i as u8, "byte {i} corrupted in transit");
    }

    dest.destroy().expect("destroy failed");
}

#[test]
fn destroy_after_transfer_is_a_silent_no_op() {
    let source = ScratchAllocator::create(256, 8).expect("failed to create source");
    let stale_ptr = source.as_raw();
    let envelope = source.transfer(&[0xAA, 0xBB, 0xCC, 0xDD], 4);

    // A caller still holding the old handle must not unmap the envelope.
    let stale = unsafe { ScratchAllocator::from_raw(stale_ptr) };
    stale
        .destroy()
        .expect("destroy of a transferred-out allocator must succeed silently");

    let mut dest = ScratchAllocator::create(64, 8).expect("failed to create destination");
    let absorbed = dest.absorb(envelope).expect("absorb after stale destroy failed");
    let bytes = unsafe { std::slice::from_raw_parts(absorbed.as_ptr(), 4) };
    assert_eq!(bytes, &[0xAA, 0xBB, 0xCC, 0xDD]);

    dest.destroy().expect("destroy failed");
}

#[test]
fn absorb_rejects_an_active_allocator() {
    let mut allocator = ScratchAllocator::create(128, 8).expect("failed to create allocator");

    // A fresh allocator carries no magic; it is not an envelope.
    assert!(unsafe { Envelope::from_raw(allocator.as_raw()) }.is_none());

    // And it is still a working allocator afterwards.
    assert!(allocator.alloc(16, 8).is_some());
    allocator.destroy().expect("destroy failed");
}

#[test]
fn absorb_into_exhausted_destination_returns_none() {
    let source = ScratchAllocator::create(256, 8).expect("failed to create source");
    let payload = [0x5Au8; 128];
    let envelope = source.transfer(&payload, 8);

    let mut dest = ScratchAllocator::create(64, 8).expect("failed to create destination");
    assert!(
        dest.absorb(envelope).is_none(),
        "an undersized destination must reject the payload"
    );

    // The destination stays usable; the source reservation was reclaimed.
    assert!(dest.alloc(32, 8).is_some());
    dest.destroy().expect("destroy failed");
}

#[test]
fn stack_allocators_speak_the_same_protocol() {
    let mut source = StackAllocator::create(4096, 8, Strategy::Lazy)
        .expect("failed to create stack source");
    let ptr = source.alloc(32, 8).expect("allocation failed");
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0x9C, 32) };

    let payload = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 32) };
    let envelope = source.transfer(payload, 8);

    let mut dest = StackAllocator::create(4096, 8, Strategy::Eager)
        .expect("failed to create stack destination");
    let absorbed = dest.absorb(envelope).expect("absorb failed");
    let bytes = unsafe { std::slice::from_raw_parts(absorbed.as_ptr(), 32) };
    assert!(bytes.iter().all(|&b| b == 0x9C));

    dest.destroy().expect("destroy failed");
}

#[test]
fn dropping_an_envelope_releases_the_reservation() {
    let source = ScratchAllocator::create(256, 8).expect("failed to create source");
    let envelope = source.transfer(&[1, 2, 3], 1);
    // Dropping instead of absorbing must reclaim the mapping rather than
    // leak it; nothing observable beyond not crashing here.
    drop(envelope);
}

#[test]
fn into_raw_round_trips_through_from_raw() {
    let source = ScratchAllocator::create(256, 8).expect("failed to create source");
    let envelope = source.transfer(&[0x42u8; 16], 8);

    let raw = envelope.into_raw();
    let envelope = unsafe { Envelope::from_raw(raw) }.expect("magic must survive the round trip");
    assert_eq!(envelope.payload_len(), 16);

    let mut dest = ScratchAllocator::create(64, 8).expect("failed to create destination");
    let absorbed = dest.absorb(envelope).expect("absorb failed");
    let bytes = unsafe { std::slice::from_raw_parts(absorbed.as_ptr(), 16) };
    assert!(bytes.iter().all(|&b| b == 0x42));

    dest.destroy().expect("destroy failed");
}
