//! Scratch allocator implementation.
//!
//! The allocator's state record lives at the start of its own reservation's
//! user region; the usable area begins just past it:
//!
//! ```text
//! [reservation header][ScratchState][usable region ...............]
//!                      ^ state/user ^ base                 base+capacity
//! ```
//!
//! The handle is a single pointer to that record. Keeping the record inside
//! the mapping is what makes the transfer protocol possible: sealing an
//! envelope overwrites the record in place, and the destroy path recognizes
//! the overwrite through the magic word.

use core::mem;
use core::ptr::{self, NonNull};

use crate::error::{AllocError, AllocResult, INV_BAD_ALIGNMENT, INV_NULL_POINTER};
use crate::transfer::{self, Envelope};
use crate::utils::{align_up, is_power_of_two, try_align_up};
use crate::vm;
use crate::{invariant, invariant_positive, invariant_range};
use crate::{Strategy, MAX_ALIGNMENT, MIN_ALIGNMENT};

/// State record placed at the base of the reservation's user region.
///
/// The first field holds a mapping address, never the transfer magic, so a
/// live allocator can always be told apart from a sealed envelope.
#[repr(C)]
struct ScratchState {
    base: *mut u8,
    capacity: usize,
    allocated: usize,
    strategy: usize,
}

const STATE_SIZE: usize = mem::size_of::<ScratchState>();

const _: () = assert!(STATE_SIZE == 4 * mem::size_of::<usize>());
const _: () = assert!(STATE_SIZE >= transfer::ENVELOPE_WORDS * mem::size_of::<usize>());
const _: () = assert!(mem::align_of::<ScratchState>() == mem::align_of::<*mut u8>());

/// Linear bump allocator over a single eager reservation.
///
/// Single-writer by construction: the handle is neither `Send` nor `Sync`,
/// and every mutating operation takes `&mut self`.
#[repr(transparent)]
pub struct ScratchAllocator {
    state: NonNull<ScratchState>,
}

impl ScratchAllocator {
    /// Creates a scratch allocator with `capacity` usable bytes.
    ///
    /// The reservation is sized `capacity + state + alignment - 1` so the
    /// full capacity survives the alignment of the usable region.
    ///
    /// Invariants (abort): `capacity > 0`, `alignment` a power of two in
    /// `[MIN_ALIGNMENT, MAX_ALIGNMENT]`.
    pub fn create(capacity: usize, alignment: usize) -> AllocResult<ScratchAllocator> {
        invariant_positive!(capacity);
        invariant!(
            is_power_of_two(alignment),
            INV_BAD_ALIGNMENT,
            "alignment = {}",
            alignment
        );
        invariant_range!(alignment, MIN_ALIGNMENT, MAX_ALIGNMENT);

        let total = capacity
            .checked_add(STATE_SIZE + alignment - 1)
            .ok_or(AllocError::OutOfMemory { requested: capacity })?;

        let user = vm::reserve_eager(total, alignment)?;
        let state = user.cast::<ScratchState>();

        let base = align_up(user.as_ptr() as usize + STATE_SIZE, alignment);
        let usable = total - (base - user.as_ptr() as usize);
        if usable < capacity {
            // SAFETY: the reservation was just created and nothing else
            // holds it.
            invariant!(
                unsafe { vm::release(user) }.is_ok(),
                crate::error::INV_INVALID_STATE,
                "failed to release a half-built scratch region"
            );
            return Err(AllocError::OutOfMemory { requested: capacity });
        }

        // SAFETY: the state record lies at the start of the committed user
        // region; the reservation is eager, so the write cannot fault.
        unsafe {
            state.as_ptr().write(ScratchState {
                base: base as *mut u8,
                capacity,
                allocated: 0,
                strategy: Strategy::Eager as usize,
            });
        }

        #[cfg(feature = "logging")]
        tracing::debug!(capacity, alignment, "created scratch allocator");

        Ok(ScratchAllocator { state })
    }

    /// Bumps out `size` bytes at `alignment`.
    ///
    /// Returns `None` when the request plus alignment padding exceeds the
    /// remaining capacity; the caller is expected to treat the scratch as
    /// a frame and `reset`. The returned bytes are not zeroed.
    pub fn alloc(&mut self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        invariant_positive!(size);
        invariant!(
            is_power_of_two(alignment),
            INV_BAD_ALIGNMENT,
            "alignment = {}",
            alignment
        );
        invariant_range!(alignment, MIN_ALIGNMENT, MAX_ALIGNMENT);

        let state = self.state_mut();
        let current = state.base as usize + state.allocated;
        let aligned = try_align_up(current, alignment)?;
        let total = size.checked_add(aligned - current)?;

        if total > state.capacity - state.allocated {
            return None;
        }

        state.allocated += total;
        NonNull::new(aligned as *mut u8)
    }

    /// Zeroes everything allocated so far and rewinds the watermark.
    ///
    /// Invalidates all pointers previously handed out by [`alloc`].
    ///
    /// [`alloc`]: ScratchAllocator::alloc
    pub fn reset(&mut self) -> AllocResult<()> {
        let state = self.state_mut();
        // SAFETY: [base, base + allocated) is committed, owned memory.
        unsafe { ptr::write_bytes(state.base, 0, state.allocated) };
        state.allocated = 0;
        Ok(())
    }

    /// Allocates room for `src` at pointer alignment and copies it in.
    ///
    /// `src` must not alias this allocator's own region; use
    /// [`transfer`](ScratchAllocator::transfer) to move data out instead.
    pub fn copy_from(&mut self, src: &[u8]) -> Option<NonNull<u8>> {
        invariant_positive!(src.len());

        let dest = self.alloc(src.len(), mem::align_of::<*mut u8>())?;
        // SAFETY: dest points at src.len() freshly allocated bytes disjoint
        // from src per the documented contract.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dest.as_ptr(), src.len()) };
        debug_assert_eq!(
            unsafe { core::slice::from_raw_parts(dest.as_ptr(), src.len()) },
            src,
            "copied bytes diverge from the source"
        );
        Some(dest)
    }

    /// Copies `len` bytes from `*src` into the region, then frees the
    /// source through `free_fn` and nulls `*src`.
    ///
    /// # Safety
    ///
    /// `*src` must be valid for `len` byte reads, must not alias this
    /// allocator's region, and must be safe to pass to `free_fn`.
    pub unsafe fn move_from(
        &mut self,
        src: &mut *mut u8,
        len: usize,
        free_fn: unsafe fn(*mut u8),
    ) -> Option<NonNull<u8>> {
        invariant!(!src.is_null(), INV_NULL_POINTER, "move source is null");
        invariant_positive!(len);

        let dest = self.alloc(len, mem::align_of::<*mut u8>())?;
        // SAFETY: caller guarantees *src is readable for len bytes and
        // disjoint from this region.
        unsafe { ptr::copy_nonoverlapping(*src, dest.as_ptr(), len) };
        debug_assert_eq!(
            unsafe { core::slice::from_raw_parts(dest.as_ptr(), len) },
            unsafe { core::slice::from_raw_parts(*src, len) },
            "moved bytes diverge from the source"
        );

        // SAFETY: caller guarantees free_fn can release *src.
        unsafe { free_fn(*src) };
        *src = ptr::null_mut();

        Some(dest)
    }

    /// Releases the reservation.
    ///
    /// If the region was sealed by [`transfer`](ScratchAllocator::transfer),
    /// ownership moved to an [`Envelope`] and this is a silent no-op
    /// success; the magic word guards the unmap.
    pub fn destroy(self) -> AllocResult<()> {
        let user = self.state.cast::<u8>();
        mem::forget(self);
        // SAFETY: the handle is gone; nothing else owns the reservation.
        unsafe { destroy_raw(user) }
    }

    /// Seals this allocator into a data envelope carrying `payload`.
    ///
    /// The region stops being an allocator; its next legal operation is
    /// absorption into another allocator (or dropping the envelope, which
    /// releases the reservation).
    ///
    /// Invariants (abort): payload non-empty and at most `capacity` bytes,
    /// `alignment` a power of two.
    pub fn transfer(self, payload: &[u8], alignment: usize) -> Envelope {
        invariant_positive!(payload.len());
        invariant_range!(payload.len(), 1, self.state().capacity);
        invariant!(
            is_power_of_two(alignment),
            INV_BAD_ALIGNMENT,
            "alignment = {}",
            alignment
        );

        let user = self.state.cast::<u8>();
        mem::forget(self);
        // SAFETY: the handle is relinquished and the eager reservation is
        // fully committed, covering the envelope span.
        unsafe { transfer::seal(user, payload, alignment) }
    }

    /// Absorbs `envelope` into this allocator, returning a pointer to the
    /// materialized payload.
    ///
    /// On exhaustion the source reservation is still released and `None` is
    /// returned.
    pub fn absorb(&mut self, envelope: Envelope) -> Option<NonNull<u8>> {
        transfer::absorb_into(envelope, |len, alignment| self.alloc(len, alignment))
    }

    /// Usable capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.state().capacity
    }

    /// Current watermark.
    pub fn allocated(&self) -> usize {
        self.state().allocated
    }

    /// Bytes still available behind the watermark.
    pub fn available(&self) -> usize {
        let state = self.state();
        state.capacity - state.allocated
    }

    /// The raw state pointer, for interop with the transfer protocol.
    pub fn as_raw(&self) -> NonNull<u8> {
        self.state.cast()
    }

    /// Rebuilds a handle from a raw state pointer.
    ///
    /// # Safety
    ///
    /// `raw` must come from [`as_raw`](ScratchAllocator::as_raw) on a live
    /// scratch allocator, and no other handle to it may be used afterwards.
    pub unsafe fn from_raw(raw: NonNull<u8>) -> ScratchAllocator {
        ScratchAllocator { state: raw.cast() }
    }

    fn state(&self) -> &ScratchState {
        // SAFETY: the handle owns the reservation; the record stays mapped
        // until destroy.
        unsafe { self.state.as_ref() }
    }

    fn state_mut(&mut self) -> &mut ScratchState {
        // SAFETY: as in state, plus &mut self guarantees exclusivity.
        unsafe { self.state.as_mut() }
    }
}

impl Drop for ScratchAllocator {
    fn drop(&mut self) {
        // SAFETY: drop is the final use of the handle.
        let _ = unsafe { destroy_raw(self.state.cast()) };
    }
}

/// Destroys the allocator behind a raw state pointer, honoring the
/// transfer-magic guard.
///
/// # Safety
///
/// `user` must identify a live scratch or stack reservation with no
/// remaining handle in use.
pub(crate) unsafe fn destroy_raw(user: NonNull<u8>) -> AllocResult<()> {
    if transfer::is_sealed(user) {
        // Ownership moved to an envelope; the consumer releases it.
        return Ok(());
    }
    // SAFETY: forwarded contract.
    unsafe { vm::release(user) }
}
