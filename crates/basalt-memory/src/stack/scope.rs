//! RAII wrapper around a record/unwind pair.

use crate::error::AllocResult;
use crate::stack::StackAllocator;

/// Records a checkpoint on construction and unwinds to it on drop.
///
/// Keeps record/unwind pairs balanced across early returns. Calling
/// [`StackAllocator::unwind`] through the borrowed allocator while a scope
/// is live breaks that balance and is the caller's responsibility.
pub struct StackScope<'a> {
    allocator: &'a mut StackAllocator,
}

impl<'a> StackScope<'a> {
    /// Records a checkpoint; fails if the checkpoint stack is full.
    pub fn new(allocator: &'a mut StackAllocator) -> AllocResult<StackScope<'a>> {
        allocator.record()?;
        Ok(StackScope { allocator })
    }

    /// The underlying allocator, for allocations inside the scope.
    pub fn allocator(&mut self) -> &mut StackAllocator {
        self.allocator
    }

    /// Unwinds now instead of at the end of the lexical scope.
    pub fn finish(self) {}
}

impl Drop for StackScope<'_> {
    fn drop(&mut self) {
        let _ = self.allocator.unwind();
    }
}
