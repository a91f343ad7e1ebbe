//! Page-granular virtual-memory reservations with a prepended header.
//!
//! Every reservation is one anonymous mapping laid out as:
//!
//! ```text
//! [mapping base]....[ReservationHeader][user region, `alignment`-aligned]
//!                    ^ user_ptr - HEADER_SIZE                ^ user_ptr
//! ```
//!
//! The caller-visible pointer is `align_up(base + HEADER_SIZE, alignment)`
//! and the header sits immediately before it, so every operation can find
//! its own bookkeeping from the user pointer alone. The header always lands
//! inside the first committed page because `HEADER_SIZE + MAX_ALIGNMENT - 1`
//! is at most half a page plus the header.
//!
//! Two provisioning strategies are offered: **eager** commits the whole
//! range at creation, **lazy** reserves address space and commits the first
//! page only, leaving the rest to [`commit`].

mod syscalls;

use core::mem;
use core::ptr::NonNull;

use crate::error::{AllocError, AllocResult, INV_BAD_ALIGNMENT};
use crate::platform::page_size;
use crate::{invariant, invariant_positive, invariant_range};
use crate::utils::{align_up, is_power_of_two, try_align_up};
use crate::{MAX_ALIGNMENT, MIN_ALIGNMENT};

use syscalls::MemoryProtection;

/// Bookkeeping prepended to every reservation.
///
/// All fields are page-derived: `reserved_bytes` and `committed_bytes` are
/// page multiples, `committed_pages` is `committed_bytes / page_size`, and
/// for eager reservations `committed_bytes == reserved_bytes`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ReservationHeader {
    base: *mut u8,
    page_size: usize,
    reserved_bytes: usize,
    committed_bytes: usize,
    committed_pages: usize,
}

/// Size of the prepended [`ReservationHeader`].
pub const HEADER_SIZE: usize = mem::size_of::<ReservationHeader>();

const _: () = assert!(HEADER_SIZE == 5 * mem::size_of::<usize>());
const _: () = assert!(mem::align_of::<ReservationHeader>() == mem::align_of::<*mut u8>());

impl ReservationHeader {
    /// Base of the OS mapping (before the header and alignment slack).
    pub fn base(&self) -> *const u8 {
        self.base
    }

    /// Page size captured when the reservation was created.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Total bytes of reserved address space.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    /// Bytes currently readable and writable.
    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes
    }

    /// Committed page count.
    pub fn committed_pages(&self) -> usize {
        self.committed_pages
    }
}

fn header_ptr(user: NonNull<u8>) -> *mut ReservationHeader {
    // The header sits immediately below the user pointer by construction.
    unsafe { user.as_ptr().sub(HEADER_SIZE).cast::<ReservationHeader>() }
}

/// Copies out the header of the reservation behind `user`.
///
/// # Safety
///
/// `user` must be a pointer returned by [`reserve_eager`] or
/// [`reserve_lazy`] that has not been released.
pub unsafe fn header(user: NonNull<u8>) -> ReservationHeader {
    unsafe { header_ptr(user).read() }
}

fn check_reserve_inputs(capacity: usize, alignment: usize) {
    invariant_positive!(capacity);
    invariant!(
        is_power_of_two(alignment),
        INV_BAD_ALIGNMENT,
        "alignment = {}",
        alignment
    );
    invariant_range!(alignment, MIN_ALIGNMENT, MAX_ALIGNMENT);
}

fn place_header(base: NonNull<u8>, alignment: usize, header: ReservationHeader) -> NonNull<u8> {
    let candidate = base.as_ptr() as usize + HEADER_SIZE;
    let user = align_up(candidate, alignment);
    let header_addr = (user - HEADER_SIZE) as *mut ReservationHeader;
    // SAFETY: user - HEADER_SIZE >= base, and the first page is committed,
    // so the header write stays inside accessible memory.
    unsafe { header_addr.write(header) };
    // SAFETY: user is derived from a non-null mapping base.
    unsafe { NonNull::new_unchecked(user as *mut u8) }
}

/// Reserves address space for `capacity` bytes, committing only the first
/// page. Physical pages are provided on demand through [`commit`].
///
/// Returns the aligned user pointer; the reservation header is prepended.
pub fn reserve_lazy(capacity: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
    check_reserve_inputs(capacity, alignment);

    let page = page_size();
    debug_assert!(HEADER_SIZE + MAX_ALIGNMENT - 1 <= page);

    // Alignment slack is folded in before rounding so the full capacity
    // stays reachable behind the aligned user pointer.
    let total = capacity
        .checked_add(HEADER_SIZE + alignment - 1)
        .and_then(|t| try_align_up(t, page))
        .ok_or(AllocError::OutOfMemory { requested: capacity })?;

    let base = syscalls::map(total, MemoryProtection::None)
        .map_err(|_| AllocError::OutOfMemory { requested: total })?;

    #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
    syscalls::advise_huge_pages(base.as_ptr(), total);

    // SAFETY: the first page of the fresh mapping is a valid sub-range.
    if unsafe { syscalls::commit_range(base.as_ptr(), page) }.is_err() {
        // SAFETY: base/total are the mapping just created.
        let _ = unsafe { syscalls::unmap(base.as_ptr(), total) };
        return Err(AllocError::PermissionChange { len: page });
    }

    let user = place_header(
        base,
        alignment,
        ReservationHeader {
            base: base.as_ptr(),
            page_size: page,
            reserved_bytes: total,
            committed_bytes: page,
            committed_pages: 1,
        },
    );

    #[cfg(feature = "logging")]
    tracing::debug!(capacity, alignment, reserved = total, "reserved lazy region");

    Ok(user)
}

/// Reserves and commits `capacity` bytes up front.
///
/// An extra page is folded into the reservation to absorb alignment slack,
/// so the full `capacity` is usable behind the returned pointer.
pub fn reserve_eager(capacity: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
    check_reserve_inputs(capacity, alignment);

    let page = page_size();
    debug_assert!(HEADER_SIZE + MAX_ALIGNMENT - 1 <= page);

    let total = capacity
        .checked_add(HEADER_SIZE + page)
        .and_then(|t| try_align_up(t, page))
        .ok_or(AllocError::OutOfMemory { requested: capacity })?;

    let base = syscalls::map(total, MemoryProtection::ReadWrite)
        .map_err(|_| AllocError::OutOfMemory { requested: total })?;

    #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
    syscalls::advise_huge_pages(base.as_ptr(), total);

    let user = place_header(
        base,
        alignment,
        ReservationHeader {
            base: base.as_ptr(),
            page_size: page,
            reserved_bytes: total,
            committed_bytes: total,
            committed_pages: total / page,
        },
    );

    #[cfg(feature = "logging")]
    tracing::debug!(capacity, alignment, reserved = total, "reserved eager region");

    Ok(user)
}

/// Extends the committed range of a lazy reservation by
/// `round_up(extra, page)` bytes.
///
/// Fails with [`AllocError::OutOfMemory`] if the expansion would exceed the
/// reservation and [`AllocError::PermissionChange`] if the OS rejects the
/// protection change. The header is only updated after the OS call
/// succeeds.
///
/// # Safety
///
/// `user` must be a live pointer returned by [`reserve_lazy`] or
/// [`reserve_eager`].
pub unsafe fn commit(user: NonNull<u8>, extra: usize) -> AllocResult<()> {
    invariant_positive!(extra);

    let header = header_ptr(user);
    // SAFETY: caller guarantees user identifies a live reservation.
    let snapshot = unsafe { header.read() };
    let page = snapshot.page_size;
    let len = align_up(extra, page);

    if len > snapshot.reserved_bytes - snapshot.committed_bytes {
        return Err(AllocError::OutOfMemory { requested: len });
    }

    // SAFETY: [base + committed, base + committed + len) stays inside the
    // reservation per the bound check above.
    let commit_base = unsafe { snapshot.base.add(snapshot.committed_bytes) };
    // SAFETY: committing a page-aligned sub-range of a live mapping.
    unsafe { syscalls::commit_range(commit_base, len) }
        .map_err(|_| AllocError::PermissionChange { len })?;

    // SAFETY: header pointer is valid for the lifetime of the reservation.
    unsafe {
        (*header).committed_bytes = snapshot.committed_bytes + len;
        (*header).committed_pages = (snapshot.committed_bytes + len) / page;
    }

    #[cfg(feature = "logging")]
    tracing::trace!(committed = snapshot.committed_bytes + len, "committed pages");

    Ok(())
}

/// Unmaps the entire reservation identified by `user`.
///
/// # Safety
///
/// `user` must be a live pointer returned by [`reserve_lazy`] or
/// [`reserve_eager`]; the reservation must not be touched afterwards.
pub unsafe fn release(user: NonNull<u8>) -> AllocResult<()> {
    // SAFETY: caller guarantees user identifies a live reservation.
    let snapshot = unsafe { header_ptr(user).read() };

    invariant!(!snapshot.base.is_null(), crate::error::INV_NULL_POINTER);
    invariant_positive!(snapshot.reserved_bytes);
    invariant_positive!(snapshot.page_size);

    #[cfg(feature = "logging")]
    tracing::debug!(reserved = snapshot.reserved_bytes, "releasing region");

    // SAFETY: base/reserved_bytes describe the original mapping.
    unsafe { syscalls::unmap(snapshot.base, snapshot.reserved_bytes) }
        .map_err(|_| AllocError::Deallocation { len: snapshot.reserved_bytes })
}
