//! Linear scratch allocator: monotonic bump allocation over one eager
//! reservation, freed in bulk by `reset` or `destroy`.
//!
//! The intended pattern is frame-shaped work: carve sub-regions off the
//! watermark while building a result, then reset the whole region in one
//! step. Individual allocations are never freed on their own.

mod allocator;

pub use allocator::ScratchAllocator;

pub(crate) use allocator::destroy_raw;
