//! Stack allocator: scratch semantics plus a fixed-depth checkpoint stack
//! and on-demand page commitment for lazy reservations.
//!
//! `record` pushes the current watermark; `unwind` pops it back, bulk-
//! invalidating everything allocated in between. Scopes nest up to
//! [`MAX_STACK_DEPTH`](crate::MAX_STACK_DEPTH) deep. [`StackScope`] wraps a
//! record/unwind pair in an RAII guard.

mod allocator;
mod scope;

pub use allocator::StackAllocator;
pub use scope::StackScope;
