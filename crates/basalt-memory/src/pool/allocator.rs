//! Pool allocator implementation.

use core::mem::{self, ManuallyDrop};
use core::ptr::NonNull;

use crate::error::{AllocError, AllocResult, INV_BAD_ALIGNMENT, INV_INVALID_STATE};
use crate::scratch::ScratchAllocator;
use crate::utils::{align_up, is_power_of_two};
use crate::vm;
use crate::{invariant, invariant_positive, invariant_range};
use crate::{MAX_ALIGNMENT, MIN_ALIGNMENT};

const WORD: usize = mem::size_of::<usize>();

/// State record placed at the base of the reservation's user region.
#[repr(C)]
pub(crate) struct PoolState {
    base: *mut u8,
    /// Object count, fixed at creation.
    capacity: usize,
    /// Free slots currently in the ring.
    available: usize,
    object_size: usize,
    /// Ring of `capacity + 1` slot addresses.
    ring: *mut usize,
    head: usize,
    tail: usize,
    /// Companion scratch allocator backing the ring storage.
    ring_backing: ManuallyDrop<ScratchAllocator>,
}

const STATE_SIZE: usize = mem::size_of::<PoolState>();

const _: () = assert!(mem::align_of::<PoolState>() == mem::align_of::<*mut u8>());

/// Fixed-size object pool over one eager reservation.
///
/// Single-writer by construction: the handle is neither `Send` nor `Sync`,
/// and every mutating operation takes `&mut self`.
#[repr(transparent)]
pub struct PoolAllocator {
    state: NonNull<PoolState>,
}

impl PoolAllocator {
    /// Creates a pool of `object_count` slots of `object_size` bytes each.
    ///
    /// The ring is pre-populated with every slot address
    /// (`base + i * object_size`), so the pool starts fully available. For
    /// the slots themselves to be `alignment`-aligned, `object_size` should
    /// be a multiple of `alignment`.
    ///
    /// Invariants (abort): both sizes positive, `alignment` a power of two
    /// in `[MIN_ALIGNMENT, MAX_ALIGNMENT]`.
    pub fn create(
        object_size: usize,
        object_count: usize,
        alignment: usize,
    ) -> AllocResult<PoolAllocator> {
        let _diag = crate::error::diagnostic_scope("pool_allocator::create");

        invariant_positive!(object_size);
        invariant_positive!(object_count);
        invariant!(
            is_power_of_two(alignment),
            INV_BAD_ALIGNMENT,
            "alignment = {}",
            alignment
        );
        invariant_range!(alignment, MIN_ALIGNMENT, MAX_ALIGNMENT);

        let area = object_count
            .checked_mul(object_size)
            .ok_or(AllocError::OutOfMemory { requested: usize::MAX })?;
        let total = area
            .checked_add(STATE_SIZE + alignment - 1)
            .ok_or(AllocError::OutOfMemory { requested: area })?;
        let ring_bytes = object_count
            .checked_add(1)
            .and_then(|slots| slots.checked_mul(WORD))
            .ok_or(AllocError::OutOfMemory { requested: usize::MAX })?;

        let user = vm::reserve_eager(total, alignment)?;
        let state = user.cast::<PoolState>();

        let base = align_up(user.as_ptr() as usize + STATE_SIZE, alignment);
        let usable = total - (base - user.as_ptr() as usize);
        if usable < area {
            // SAFETY: the reservation was just created and nothing else
            // holds it.
            invariant!(
                unsafe { vm::release(user) }.is_ok(),
                INV_INVALID_STATE,
                "failed to release a half-built pool region"
            );
            return Err(AllocError::OutOfMemory { requested: area });
        }

        let mut ring_backing = match ScratchAllocator::create(ring_bytes, mem::align_of::<usize>())
        {
            Ok(backing) => backing,
            Err(err) => {
                // SAFETY: as above; the main reservation is still exclusively
                // ours.
                invariant!(
                    unsafe { vm::release(user) }.is_ok(),
                    INV_INVALID_STATE,
                    "failed to release a half-built pool region"
                );
                return Err(err);
            }
        };

        // The companion was sized for exactly this allocation.
        let ring = ring_backing
            .alloc(ring_bytes, mem::align_of::<usize>())
            .map(|ptr| ptr.as_ptr().cast::<usize>());
        let Some(ring) = ring else {
            let _ = ring_backing.destroy();
            // SAFETY: as above.
            invariant!(
                unsafe { vm::release(user) }.is_ok(),
                INV_INVALID_STATE,
                "failed to release a half-built pool region"
            );
            return Err(AllocError::OutOfMemory { requested: ring_bytes });
        };

        // SAFETY: the ring holds object_count + 1 word slots; the state
        // record sits in committed memory at the start of the user region.
        unsafe {
            for i in 0..object_count {
                ring.add(i).write(base + i * object_size);
            }
            state.as_ptr().write(PoolState {
                base: base as *mut u8,
                capacity: object_count,
                available: object_count,
                object_size,
                ring,
                head: object_count,
                tail: 0,
                ring_backing: ManuallyDrop::new(ring_backing),
            });
        }

        #[cfg(feature = "logging")]
        tracing::debug!(object_size, object_count, alignment, "created pool allocator");

        Ok(PoolAllocator { state })
    }

    /// Acquires a free slot, or `None` when the pool is exhausted.
    ///
    /// The slot's bytes are not zeroed.
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        let state = self.state_mut();
        if state.available == 0 {
            return None;
        }
        // SAFETY: tail always indexes a populated ring entry while
        // available > 0.
        let slot = unsafe { state.ring.add(state.tail).read() };
        state.tail = (state.tail + 1) % (state.capacity + 1);
        state.available -= 1;
        NonNull::new(slot as *mut u8)
    }

    /// Returns a slot to the pool.
    ///
    /// Debug builds assert the pointer lies in the object area on a slot
    /// boundary and that the pool is not over-released.
    pub fn release(&mut self, ptr: NonNull<u8>) -> AllocResult<()> {
        let state = self.state_mut();
        let addr = ptr.as_ptr() as usize;
        let base = state.base as usize;
        debug_assert!(
            addr >= base && addr < base + state.capacity * state.object_size,
            "pointer outside the object area"
        );
        debug_assert_eq!(
            (addr - base) % state.object_size,
            0,
            "pointer not on a slot boundary"
        );
        debug_assert!(
            state.available < state.capacity,
            "more releases than live objects"
        );

        // SAFETY: head always indexes a vacant ring entry while
        // available < capacity (one slot stays reserved).
        unsafe { state.ring.add(state.head).write(addr) };
        state.head = (state.head + 1) % (state.capacity + 1);
        state.available += 1;
        Ok(())
    }

    /// Reinitializes the ring from every slot, making the pool fully
    /// available again. Invalidates all outstanding slot pointers.
    pub fn reset(&mut self) -> AllocResult<()> {
        let state = self.state_mut();
        // SAFETY: the ring was sized for capacity + 1 entries at creation.
        unsafe {
            for i in 0..state.capacity {
                state.ring.add(i).write(state.base as usize + i * state.object_size);
            }
        }
        state.head = state.capacity;
        state.tail = 0;
        state.available = state.capacity;
        Ok(())
    }

    /// Destroys the companion scratch first, then releases the
    /// reservation.
    pub fn destroy(mut self) -> AllocResult<()> {
        let user = self.state.cast::<u8>();
        // SAFETY: the state record is live until the release below; the
        // companion is taken exactly once.
        let backing = unsafe { ManuallyDrop::take(&mut self.state_mut().ring_backing) };
        mem::forget(self);
        backing.destroy()?;
        // SAFETY: nothing else owns the reservation.
        unsafe { vm::release(user) }
    }

    /// Object count, fixed at creation.
    pub fn capacity(&self) -> usize {
        self.state().capacity
    }

    /// Free slots currently available.
    pub fn available(&self) -> usize {
        self.state().available
    }

    /// Size of each object slot in bytes.
    pub fn object_size(&self) -> usize {
        self.state().object_size
    }

    fn state(&self) -> &PoolState {
        // SAFETY: the handle owns the reservation; the record stays mapped
        // until destroy.
        unsafe { self.state.as_ref() }
    }

    fn state_mut(&mut self) -> &mut PoolState {
        // SAFETY: as in state, plus &mut self guarantees exclusivity.
        unsafe { self.state.as_mut() }
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        // SAFETY: drop is the final use of the handle; companion first,
        // then the reservation.
        unsafe {
            let backing = ManuallyDrop::take(&mut self.state_mut().ring_backing);
            drop(backing);
            let _ = vm::release(self.state.cast());
        }
    }
}
