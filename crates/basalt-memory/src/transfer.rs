//! Zero-copy hand-off of a payload between allocators.
//!
//! `transfer` repurposes a scratch or stack allocator as a data envelope:
//! the allocator's state record is overwritten with three words (a magic
//! sentinel, the payload size, and the payload alignment) followed by the
//! payload bytes:
//!
//! ```text
//! offset 0*word : TRANSFER_MAGIC
//! offset 1*word : payload_size      (bytes)
//! offset 2*word : payload_alignment (bytes, power of two)
//! offset 3*word : payload bytes
//! ```
//!
//! From that point the region is no longer an allocator; the only legal
//! next step is `absorb`, which materializes the payload into a destination
//! allocator and releases the source reservation. The magic word doubles as
//! a runtime type tag: the destroy path of every linear allocator probes it
//! and turns into a silent no-op when it matches, so a stale handle held by
//! a buggy caller cannot unmap a region whose ownership already moved.

use core::mem;
use core::ptr::{self, NonNull};

use crate::vm;

/// Sentinel word marking a transferred-out allocator.
///
/// Pointer-width dependent so the full first word of the state record is
/// covered; neither value can collide with a valid mapping address written
/// there by `create`.
#[cfg(target_pointer_width = "64")]
pub const TRANSFER_MAGIC: usize = 0xFFFF_FFFF_DEAD_C0DE;
/// Sentinel word marking a transferred-out allocator (32-bit value).
#[cfg(target_pointer_width = "32")]
pub const TRANSFER_MAGIC: usize = 0xDEAD_C0DE;

/// Words occupied by the envelope prefix ahead of the payload.
pub(crate) const ENVELOPE_WORDS: usize = 3;

const WORD: usize = mem::size_of::<usize>();

/// An allocator converted into a read-once data envelope.
///
/// Owns the underlying reservation: dropping an `Envelope` releases it, and
/// [`absorb`](crate::scratch::ScratchAllocator::absorb) consumes it.
pub struct Envelope {
    user: NonNull<u8>,
}

impl Envelope {
    /// Payload length in bytes.
    pub fn payload_len(&self) -> usize {
        // SAFETY: a sealed envelope always has its three prefix words
        // committed and initialized.
        unsafe { self.user.as_ptr().cast::<usize>().add(1).read() }
    }

    /// Payload alignment in bytes.
    pub fn payload_alignment(&self) -> usize {
        // SAFETY: as in payload_len.
        unsafe { self.user.as_ptr().cast::<usize>().add(2).read() }
    }

    /// Reclaims an envelope from a raw region pointer.
    ///
    /// Returns `None` unless the first word carries [`TRANSFER_MAGIC`],
    /// the runtime discriminant between an active allocator and an
    /// envelope.
    ///
    /// # Safety
    ///
    /// `raw` must point at a live reservation's user region (an allocator
    /// state record or a sealed envelope), and no other owner of that
    /// reservation may remain in use.
    pub unsafe fn from_raw(raw: NonNull<u8>) -> Option<Envelope> {
        // SAFETY: first word of the user region is always committed.
        if unsafe { raw.as_ptr().cast::<usize>().read() } != TRANSFER_MAGIC {
            return None;
        }
        Some(Envelope { user: raw })
    }

    /// Releases ownership of the underlying reservation without freeing it.
    pub fn into_raw(self) -> NonNull<u8> {
        let user = self.user;
        mem::forget(self);
        user
    }

    /// The raw region pointer, for interop with stale-handle probes.
    pub fn as_raw(&self) -> NonNull<u8> {
        self.user
    }
}

impl Drop for Envelope {
    fn drop(&mut self) {
        // SAFETY: the envelope owns the reservation; after drop nobody can
        // reach it again.
        let _ = unsafe { vm::release(self.user) };
    }
}

/// Returns `true` if the region behind `user` carries the transfer magic.
pub(crate) fn is_sealed(user: NonNull<u8>) -> bool {
    // SAFETY: the first word of a user region is committed from creation
    // onwards (it holds the state record's base pointer until sealed).
    unsafe { user.as_ptr().cast::<usize>().read() == TRANSFER_MAGIC }
}

/// Overwrites the state record at `user` with the envelope prefix and the
/// payload bytes.
///
/// # Safety
///
/// `user` must be the state pointer of a live scratch or stack allocator
/// whose handle has been relinquished, with `3 * WORD + payload.len()`
/// bytes committed from `user` onwards.
pub(crate) unsafe fn seal(user: NonNull<u8>, payload: &[u8], alignment: usize) -> Envelope {
    let words = user.as_ptr().cast::<usize>();
    // SAFETY: the caller guarantees the envelope span is committed; the
    // state record is at least three words by compile-time assertion in the
    // allocator modules.
    unsafe {
        words.write(TRANSFER_MAGIC);
        words.add(1).write(payload.len());
        words.add(2).write(alignment);
        // The payload frequently lives inside the very region being sealed
        // (built in this allocator, then transferred), so the ranges may
        // overlap; copy handles that, copy_nonoverlapping would not.
        ptr::copy(
            payload.as_ptr(),
            user.as_ptr().add(ENVELOPE_WORDS * WORD),
            payload.len(),
        );
    }
    Envelope { user }
}

/// Materializes `envelope` into a destination allocation obtained from
/// `alloc`, releasing the source reservation either way.
///
/// Returns `None` when the destination cannot hold the payload; the source
/// is still released so the reservation is reclaimed rather than leaked.
pub(crate) fn absorb_into(
    envelope: Envelope,
    alloc: impl FnOnce(usize, usize) -> Option<NonNull<u8>>,
) -> Option<NonNull<u8>> {
    let len = envelope.payload_len();
    let alignment = envelope.payload_alignment();

    let Some(dest) = alloc(len, alignment) else {
        drop(envelope);
        return None;
    };

    // SAFETY: dest points at `len` freshly allocated bytes in a different
    // reservation; the source payload words are committed and initialized.
    unsafe {
        // Invalidate the magic first so a lingering raw pointer cannot
        // re-absorb the same envelope.
        envelope.user.as_ptr().cast::<usize>().write(0);
        ptr::copy_nonoverlapping(
            envelope.user.as_ptr().add(ENVELOPE_WORDS * WORD),
            dest.as_ptr(),
            len,
        );
    }

    drop(envelope);
    Some(dest)
}
