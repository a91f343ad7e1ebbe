//! Stack allocator implementation.

use core::mem;
use core::ptr::{self, NonNull};

use crate::error::{
    AllocError, AllocResult, INV_BAD_ALIGNMENT, INV_INVALID_STATE, INV_NULL_POINTER,
};
use crate::scratch::destroy_raw;
use crate::transfer::{self, Envelope};
use crate::utils::{align_up, is_power_of_two, try_align_up};
use crate::vm;
use crate::{invariant, invariant_positive, invariant_range};
use crate::{Strategy, MAX_ALIGNMENT, MAX_STACK_DEPTH, MIN_ALIGNMENT};

/// State record placed at the base of the reservation's user region.
///
/// Layout extends the scratch record with the checkpoint stack; the shared
/// prefix keeps the transfer protocol and the destroy-path magic probe
/// identical across both linear allocators.
#[repr(C)]
pub(crate) struct StackState {
    base: *mut u8,
    capacity: usize,
    allocated: usize,
    strategy: usize,
    checkpoint_count: usize,
    checkpoints: [usize; MAX_STACK_DEPTH],
}

const STATE_SIZE: usize = mem::size_of::<StackState>();

const _: () = assert!(STATE_SIZE == (5 + MAX_STACK_DEPTH) * mem::size_of::<usize>());
const _: () = assert!(STATE_SIZE >= transfer::ENVELOPE_WORDS * mem::size_of::<usize>());
const _: () = assert!(mem::align_of::<StackState>() == mem::align_of::<*mut u8>());

/// Linear allocator with checkpoint/unwind and a choice of eager or lazy
/// page provisioning.
///
/// Single-writer by construction: the handle is neither `Send` nor `Sync`,
/// and every mutating operation takes `&mut self`.
#[repr(transparent)]
pub struct StackAllocator {
    state: NonNull<StackState>,
}

impl StackAllocator {
    /// Creates a stack allocator with `capacity` usable bytes.
    ///
    /// With [`Strategy::Lazy`] only the first page is committed at
    /// creation; further pages are committed as the watermark advances.
    /// The state record always lies within that first page.
    ///
    /// Invariants (abort): `capacity > 0`, `alignment` a power of two in
    /// `[MIN_ALIGNMENT, MAX_ALIGNMENT]`.
    pub fn create(
        capacity: usize,
        alignment: usize,
        strategy: Strategy,
    ) -> AllocResult<StackAllocator> {
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

        let user = match strategy {
            Strategy::Eager => vm::reserve_eager(total, alignment)?,
            Strategy::Lazy => vm::reserve_lazy(total, alignment)?,
        };
        let state = user.cast::<StackState>();

        let base = align_up(user.as_ptr() as usize + STATE_SIZE, alignment);
        let usable = total - (base - user.as_ptr() as usize);
        if usable < capacity {
            // SAFETY: the reservation was just created and nothing else
            // holds it.
            invariant!(
                unsafe { vm::release(user) }.is_ok(),
                INV_INVALID_STATE,
                "failed to release a half-built stack region"
            );
            return Err(AllocError::OutOfMemory { requested: capacity });
        }

        // SAFETY: the record fits in the first committed page for both
        // strategies (header + alignment slack + record stay below one
        // page by the MAX_ALIGNMENT cap).
        unsafe {
            state.as_ptr().write(StackState {
                base: base as *mut u8,
                capacity,
                allocated: 0,
                strategy: strategy as usize,
                checkpoint_count: 0,
                checkpoints: [0; MAX_STACK_DEPTH],
            });
        }

        #[cfg(feature = "logging")]
        tracing::debug!(capacity, alignment, ?strategy, "created stack allocator");

        Ok(StackAllocator { state })
    }

    /// Bumps out `size` bytes at `alignment`.
    ///
    /// Lazy allocators first extend the committed range to cover the new
    /// watermark; a commit failure fails the allocation and leaves the
    /// watermark untouched. Exhaustion returns `None`.
    pub fn alloc(&mut self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        invariant_positive!(size);
        invariant!(
            is_power_of_two(alignment),
            INV_BAD_ALIGNMENT,
            "alignment = {}",
            alignment
        );
        invariant_range!(alignment, MIN_ALIGNMENT, MAX_ALIGNMENT);

        let user = self.state.cast::<u8>();
        let (base_addr, capacity, allocated, strategy) = {
            let state = self.state();
            (state.base as usize, state.capacity, state.allocated, state.strategy)
        };

        let current = base_addr + allocated;
        let aligned = try_align_up(current, alignment)?;
        let total = size.checked_add(aligned - current)?;

        if total > capacity - allocated {
            return None;
        }

        if strategy == Strategy::Lazy as usize {
            // SAFETY: user identifies this allocator's live reservation.
            let header = unsafe { vm::header(user) };
            let end_offset = current + total - header.base() as usize;
            if end_offset > header.committed_bytes() {
                let shortfall = end_offset - header.committed_bytes();
                // SAFETY: the commit target is this allocator's own user
                // pointer, so the header lookup lands on the real header.
                if unsafe { vm::commit(user, shortfall) }.is_err() {
                    return None;
                }
            }
        }

        self.state_mut().allocated = allocated + total;
        NonNull::new(aligned as *mut u8)
    }

    /// Pushes the current watermark onto the checkpoint stack.
    ///
    /// Returns [`AllocError::StackOverflow`] once
    /// [`MAX_STACK_DEPTH`] checkpoints are live.
    pub fn record(&mut self) -> AllocResult<()> {
        let state = self.state_mut();
        if state.checkpoint_count == MAX_STACK_DEPTH {
            return Err(AllocError::StackOverflow { depth: MAX_STACK_DEPTH });
        }
        state.checkpoints[state.checkpoint_count] = state.allocated;
        state.checkpoint_count += 1;
        Ok(())
    }

    /// Pops the most recent checkpoint and rewinds the watermark to it.
    ///
    /// Everything allocated since the matching [`record`] becomes invalid.
    /// Unwinding an empty stack is an invariant violation (abort).
    ///
    /// [`record`]: StackAllocator::record
    pub fn unwind(&mut self) -> AllocResult<()> {
        let state = self.state_mut();
        invariant!(
            state.checkpoint_count > 0,
            INV_INVALID_STATE,
            "cannot unwind an empty checkpoint stack"
        );
        state.checkpoint_count -= 1;
        state.allocated = state.checkpoints[state.checkpoint_count];
        Ok(())
    }

    /// Rewinds the watermark to zero and clears the checkpoint stack.
    ///
    /// Committed pages are retained until destroy; lazy allocators do not
    /// decommit on reset.
    pub fn reset(&mut self) -> AllocResult<()> {
        let state = self.state_mut();
        state.allocated = 0;
        state.checkpoint_count = 0;
        Ok(())
    }

    /// Allocates room for `src` at pointer alignment and copies it in.
    ///
    /// `src` must not alias this allocator's own region.
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

    /// Releases the reservation; a silent no-op success if the region was
    /// sealed by [`transfer`](StackAllocator::transfer).
    pub fn destroy(self) -> AllocResult<()> {
        let user = self.state.cast::<u8>();
        mem::forget(self);
        // SAFETY: the handle is gone; nothing else owns the reservation.
        unsafe { destroy_raw(user) }
    }

    /// Seals this allocator into a data envelope carrying `payload`.
    ///
    /// For lazy allocators the envelope span is committed first, so the
    /// seal never writes into uncommitted pages.
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
        if self.state().strategy == Strategy::Lazy as usize {
            // SAFETY: user identifies this allocator's live reservation.
            let header = unsafe { vm::header(user) };
            let envelope_end = user.as_ptr() as usize
                + transfer::ENVELOPE_WORDS * mem::size_of::<usize>()
                + payload.len();
            let end_offset = envelope_end - header.base() as usize;
            if end_offset > header.committed_bytes() {
                let shortfall = end_offset - header.committed_bytes();
                // The envelope span always fits the reservation, so only a
                // pathological protection failure can land here.
                invariant!(
                    unsafe { vm::commit(user, shortfall) }.is_ok(),
                    INV_INVALID_STATE,
                    "failed to commit the envelope span"
                );
            }
        }

        mem::forget(self);
        // SAFETY: the handle is relinquished and the envelope span is
        // committed.
        unsafe { transfer::seal(user, payload, alignment) }
    }

    /// Absorbs `envelope` into this allocator, returning a pointer to the
    /// materialized payload.
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

    /// Provisioning strategy chosen at creation.
    pub fn strategy(&self) -> Strategy {
        if self.state().strategy == Strategy::Lazy as usize {
            Strategy::Lazy
        } else {
            Strategy::Eager
        }
    }

    /// Live checkpoint count.
    pub fn checkpoint_depth(&self) -> usize {
        self.state().checkpoint_count
    }

    /// Bytes of the reservation currently committed, including the header
    /// and state record span.
    pub fn committed_bytes(&self) -> usize {
        // SAFETY: the handle owns a live reservation.
        unsafe { vm::header(self.state.cast()) }.committed_bytes()
    }

    /// The raw state pointer, for interop with the transfer protocol.
    pub fn as_raw(&self) -> NonNull<u8> {
        self.state.cast()
    }

    /// Rebuilds a handle from a raw state pointer.
    ///
    /// # Safety
    ///
    /// `raw` must come from [`as_raw`](StackAllocator::as_raw) on a live
    /// stack allocator, and no other handle to it may be used afterwards.
    pub unsafe fn from_raw(raw: NonNull<u8>) -> StackAllocator {
        StackAllocator { state: raw.cast() }
    }

    fn state(&self) -> &StackState {
        // SAFETY: the handle owns the reservation; the record stays mapped
        // until destroy.
        unsafe { self.state.as_ref() }
    }

    fn state_mut(&mut self) -> &mut StackState {
        // SAFETY: as in state, plus &mut self guarantees exclusivity.
        unsafe { self.state.as_mut() }
    }
}

impl Drop for StackAllocator {
    fn drop(&mut self) {
        // SAFETY: drop is the final use of the handle.
        let _ = unsafe { destroy_raw(self.state.cast()) };
    }
}
