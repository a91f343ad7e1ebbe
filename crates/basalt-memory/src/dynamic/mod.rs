//! Dynamic allocator: a linked list of linear blocks grown on demand.
//!
//! Allocations bump within the existing blocks first-fit; a request that
//! fits nowhere appends a fresh block sized for at least the request. Reset
//! keeps the first block and releases the rest of the chain.

mod allocator;

pub use allocator::DynamicAllocator;
