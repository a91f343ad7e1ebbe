//! Integration tests for the reservation layer.

use basalt_memory::{page_size, vm};

#[test]
fn eager_reservations_are_fully_committed() {
    let page = page_size();
    let user = vm::reserve_eager(2 * page, 8).expect("eager reservation failed");

    let header = unsafe { vm::header(user) };
    assert_eq!(header.committed_bytes(), header.reserved_bytes());
    assert!(header.reserved_bytes() >= 2 * page);
    assert_eq!(header.page_size(), page);
    assert_eq!(
        header.committed_pages() * header.page_size(),
        header.committed_bytes()
    );

    // Every byte of the requested capacity is writable.
    unsafe { std::ptr::write_bytes(user.as_ptr(), 0x5A, 2 * page) };
    assert_eq!(unsafe { user.as_ptr().add(2 * page - 1).read() }, 0x5A);

    unsafe { vm::release(user) }.expect("release failed");
}

#[test]
fn lazy_reservations_start_with_one_page() {
    let page = page_size();
    let user = vm::reserve_lazy(8 * page, 8).expect("lazy reservation failed");

    let header = unsafe { vm::header(user) };
    assert_eq!(header.committed_bytes(), page);
    assert_eq!(header.committed_pages(), 1);
    assert!(header.reserved_bytes() >= 8 * page);

    // The first page holds the header and is writable past the user
    // pointer.
    unsafe { std::ptr::write_bytes(user.as_ptr(), 0xA5, 64) };

    unsafe { vm::release(user) }.expect("release failed");
}

#[test]
fn commit_extends_in_page_multiples() {
    let page = page_size();
    let user = vm::reserve_lazy(8 * page, 8).expect("lazy reservation failed");

    unsafe { vm::commit(user, 1) }.expect("single-byte commit failed");
    assert_eq!(unsafe { vm::header(user) }.committed_bytes(), 2 * page);

    unsafe { vm::commit(user, 2 * page) }.expect("two-page commit failed");
    let header = unsafe { vm::header(user) };
    assert_eq!(header.committed_bytes(), 4 * page);
    assert_eq!(header.committed_pages(), 4);

    // The freshly committed span is writable.
    unsafe { std::ptr::write_bytes(user.as_ptr(), 0x3C, 3 * page) };

    unsafe { vm::release(user) }.expect("release failed");
}

#[test]
fn commit_beyond_the_reservation_fails_cleanly() {
    let page = page_size();
    let user = vm::reserve_lazy(2 * page, 8).expect("lazy reservation failed");

    let before = unsafe { vm::header(user) };
    let remaining = before.reserved_bytes() - before.committed_bytes();

    let err = unsafe { vm::commit(user, remaining + page) }
        .expect_err("over-commit must be rejected");
    assert!(err.is_out_of_memory());

    // Nothing was mutated by the failed call.
    let after = unsafe { vm::header(user) };
    assert_eq!(after.committed_bytes(), before.committed_bytes());
    assert_eq!(after.committed_pages(), before.committed_pages());

    // Committing exactly the remainder still works.
    unsafe { vm::commit(user, remaining) }.expect("exact remainder commit failed");
    assert_eq!(
        unsafe { vm::header(user) }.committed_bytes(),
        before.reserved_bytes()
    );

    unsafe { vm::release(user) }.expect("release failed");
}

#[test]
fn user_pointers_honor_the_requested_alignment() {
    for alignment in [1usize, 2, 8, 64, 512, 2048] {
        let user = vm::reserve_eager(4096, alignment)
            .unwrap_or_else(|_| panic!("reservation at alignment {alignment} failed"));
        assert_eq!(
            user.as_ptr() as usize % alignment,
            0,
            "user pointer not {alignment}-aligned"
        );
        unsafe { vm::release(user) }.expect("release failed");
    }
}

#[test]
fn lazy_capacity_is_reachable_at_maximum_alignment() {
    let page = page_size();
    let capacity = 4 * page;
    let user = vm::reserve_lazy(capacity, 2048).expect("lazy reservation failed");

    let header = unsafe { vm::header(user) };
    let user_offset = user.as_ptr() as usize - header.base() as usize;
    assert!(
        header.reserved_bytes() - user_offset >= capacity,
        "alignment slack ate into the reserved capacity"
    );

    unsafe { vm::release(user) }.expect("release failed");
}
