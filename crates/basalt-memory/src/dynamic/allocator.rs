//! Dynamic allocator implementation.
//!
//! The primary reservation carries the allocator state and the first block;
//! every appended block is its own eager reservation with a block record
//! prepended:
//!
//! ```text
//! primary:  [header][DynamicState][BlockState][data ....]
//! appended: [header][BlockState][data ....]
//! ```

use core::mem;
use core::ptr::{self, NonNull};

use crate::error::{AllocError, AllocResult, INV_BAD_ALIGNMENT, INV_INVALID_STATE};
use crate::utils::{align_up, is_power_of_two, try_align_up};
use crate::vm;
use crate::{invariant, invariant_positive, invariant_range};
use crate::{MAX_ALIGNMENT, MIN_ALIGNMENT};

/// One linear block in the chain.
#[repr(C)]
pub(crate) struct BlockState {
    base: *mut u8,
    next: *mut BlockState,
    capacity: usize,
    allocated: usize,
}

/// Chain head plus the alignment fixed at creation.
#[repr(C)]
pub(crate) struct DynamicState {
    head: *mut BlockState,
    alignment: usize,
}

const BLOCK_SIZE: usize = mem::size_of::<BlockState>();
const DYN_SIZE: usize = mem::size_of::<DynamicState>();

const _: () = assert!(BLOCK_SIZE == 4 * mem::size_of::<usize>());
const _: () = assert!(DYN_SIZE == 2 * mem::size_of::<usize>());
const _: () = assert!(mem::align_of::<DynamicState>() == mem::align_of::<*mut u8>());

/// Growable chain of bump-allocated blocks with one fixed alignment.
///
/// Single-writer by construction: the handle is neither `Send` nor `Sync`,
/// and every mutating operation takes `&mut self`.
#[repr(transparent)]
pub struct DynamicAllocator {
    state: NonNull<DynamicState>,
}

impl DynamicAllocator {
    /// Creates a dynamic allocator whose first block holds `capacity`
    /// usable bytes; all allocations are aligned to `alignment`.
    ///
    /// Invariants (abort): `capacity > 0`, `alignment` a power of two in
    /// `[MIN_ALIGNMENT, MAX_ALIGNMENT]`.
    pub fn create(capacity: usize, alignment: usize) -> AllocResult<DynamicAllocator> {
        invariant_positive!(capacity);
        invariant!(
            is_power_of_two(alignment),
            INV_BAD_ALIGNMENT,
            "alignment = {}",
            alignment
        );
        invariant_range!(alignment, MIN_ALIGNMENT, MAX_ALIGNMENT);

        let total = capacity
            .checked_add(DYN_SIZE + BLOCK_SIZE + alignment - 1)
            .ok_or(AllocError::OutOfMemory { requested: capacity })?;

        let user = vm::reserve_eager(total, alignment)?;
        let state = user.cast::<DynamicState>();
        let block = unsafe { user.as_ptr().add(DYN_SIZE) }.cast::<BlockState>();

        let base = align_up(block as usize + BLOCK_SIZE, alignment);
        let usable = total - (base - user.as_ptr() as usize);
        if usable < capacity {
            // SAFETY: the reservation was just created and nothing else
            // holds it.
            invariant!(
                unsafe { vm::release(user) }.is_ok(),
                INV_INVALID_STATE,
                "failed to release a half-built dynamic region"
            );
            return Err(AllocError::OutOfMemory { requested: capacity });
        }

        // SAFETY: both records lie in the committed user region of the
        // fresh eager reservation.
        unsafe {
            block.write(BlockState {
                base: base as *mut u8,
                next: ptr::null_mut(),
                capacity,
                allocated: 0,
            });
            state.as_ptr().write(DynamicState { head: block, alignment });
        }

        #[cfg(feature = "logging")]
        tracing::debug!(capacity, alignment, "created dynamic allocator");

        Ok(DynamicAllocator { state })
    }

    /// Bumps out `size` bytes at the allocator's fixed alignment.
    ///
    /// Walks the chain first-fit; when no block has room, appends a block
    /// of at least `max(size + alignment - 1, first-block capacity)` bytes.
    /// Returns `None` only if that new reservation fails.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        invariant_positive!(size);

        let alignment = self.state().alignment;
        let head = self.state().head;

        // First fit over the existing chain.
        let mut block = head;
        let tail = loop {
            // SAFETY: chain pointers are only ever written by this
            // allocator and stay valid until release.
            let (block_base, block_capacity, block_allocated) =
                unsafe { ((*block).base as usize, (*block).capacity, (*block).allocated) };

            let current = block_base + block_allocated;
            let aligned = try_align_up(current, alignment)?;
            let total = size.checked_add(aligned - current)?;
            if total <= block_capacity - block_allocated {
                // SAFETY: as above.
                unsafe { (*block).allocated = block_allocated + total };
                return NonNull::new(aligned as *mut u8);
            }

            // SAFETY: as above.
            let next = unsafe { (*block).next };
            if next.is_null() {
                break block;
            }
            block = next;
        };

        // SAFETY: head stays valid for the allocator's lifetime.
        let first_capacity = unsafe { (*head).capacity };
        let grow = size.checked_add(alignment - 1)?.max(first_capacity);
        let total = grow.checked_add(BLOCK_SIZE + alignment - 1)?;

        let user = vm::reserve_eager(total, alignment).ok()?;
        let new_block = user.cast::<BlockState>().as_ptr();
        let base = align_up(new_block as usize + BLOCK_SIZE, alignment);
        if total - (base - user.as_ptr() as usize) < grow {
            // SAFETY: the reservation was just created and unused.
            invariant!(
                unsafe { vm::release(user) }.is_ok(),
                INV_INVALID_STATE,
                "failed to release a half-built block"
            );
            return None;
        }

        // SAFETY: the block record lies in committed memory; base is
        // alignment-aligned, so the request needs no padding here.
        unsafe {
            new_block.write(BlockState {
                base: base as *mut u8,
                next: ptr::null_mut(),
                capacity: grow,
                allocated: size,
            });
            (*tail).next = new_block;
        }

        #[cfg(feature = "logging")]
        tracing::trace!(capacity = grow, "appended dynamic block");

        NonNull::new(base as *mut u8)
    }

    /// Releases every block after the first and rewinds the first block's
    /// watermark. Invalidates all outstanding allocations.
    ///
    /// On a release failure the chain keeps the not-yet-freed tail linked
    /// behind the first block, so a retry remains possible.
    pub fn reset(&mut self) -> AllocResult<()> {
        let head = self.state().head;
        // SAFETY: chain records stay valid until their reservation is
        // released; each appended block's record is its reservation's user
        // pointer.
        unsafe {
            let mut current = (*head).next;
            (*head).next = ptr::null_mut();
            (*head).allocated = 0;
            while !current.is_null() {
                let next = (*current).next;
                if let Err(err) = vm::release(NonNull::new_unchecked(current.cast::<u8>())) {
                    (*head).next = current;
                    return Err(err);
                }
                current = next;
            }
        }
        Ok(())
    }

    /// Releases the whole chain and the primary reservation.
    ///
    /// Teardown is best-effort: a failing block release is remembered,
    /// the remaining blocks are still attempted, and the first error is
    /// returned.
    pub fn destroy(self) -> AllocResult<()> {
        let user = self.state.cast::<u8>();
        let head = self.state().head;
        mem::forget(self);

        let mut result = Ok(());
        // SAFETY: the handle is gone; every record remains valid until its
        // own reservation is released below.
        unsafe {
            let mut current = (*head).next;
            while !current.is_null() {
                let next = (*current).next;
                if let Err(err) = vm::release(NonNull::new_unchecked(current.cast::<u8>())) {
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                current = next;
            }
            if let Err(err) = vm::release(user) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Alignment fixed at creation.
    pub fn alignment(&self) -> usize {
        self.state().alignment
    }

    /// Number of blocks currently in the chain.
    pub fn block_count(&self) -> usize {
        let mut count = 0;
        let mut block = self.state().head;
        while !block.is_null() {
            count += 1;
            // SAFETY: chain records stay valid while the handle lives.
            block = unsafe { (*block).next };
        }
        count
    }

    pub(crate) fn used_bytes(&self) -> usize {
        let mut used = 0;
        let mut block = self.state().head;
        while !block.is_null() {
            // SAFETY: as in block_count.
            unsafe {
                used += (*block).allocated;
                block = (*block).next;
            }
        }
        used
    }

    pub(crate) fn total_bytes(&self) -> usize {
        let mut total = 0;
        let mut block = self.state().head;
        while !block.is_null() {
            // SAFETY: as in block_count.
            unsafe {
                total += (*block).capacity;
                block = (*block).next;
            }
        }
        total
    }

    fn state(&self) -> &DynamicState {
        // SAFETY: the handle owns the primary reservation; the record stays
        // mapped until destroy.
        unsafe { self.state.as_ref() }
    }
}

impl Drop for DynamicAllocator {
    fn drop(&mut self) {
        let head = self.state().head;
        // SAFETY: drop is the final use of the handle.
        unsafe {
            let mut current = (*head).next;
            while !current.is_null() {
                let next = (*current).next;
                let _ = vm::release(NonNull::new_unchecked(current.cast::<u8>()));
                current = next;
            }
            let _ = vm::release(self.state.cast());
        }
    }
}
