//! Pool allocator: O(1) acquisition and release of identically-sized
//! objects from a ring of free slots.
//!
//! The object area is one contiguous eager reservation; free-slot pointers
//! circulate through a ring one entry larger than the object count (the
//! usual one-slot-reserved convention), backed by a companion scratch
//! allocator.

mod allocator;

pub use allocator::PoolAllocator;
