//! Traits shared by every allocator family.

use crate::dynamic::DynamicAllocator;
use crate::error::AllocResult;
use crate::pool::PoolAllocator;
use crate::scratch::ScratchAllocator;
use crate::stack::StackAllocator;

/// Uniform usage queries across allocator families.
pub trait MemoryUsage {
    /// Bytes currently handed out.
    fn used_memory(&self) -> usize;

    /// Bytes still available, when the family can answer cheaply.
    fn available_memory(&self) -> Option<usize>;

    /// Total usable bytes, when fixed at creation.
    fn total_memory(&self) -> Option<usize>;
}

/// Bulk invalidation of all outstanding allocations.
pub trait Reset {
    /// Restores the allocator to its freshly-created state.
    ///
    /// Every pointer previously handed out becomes invalid.
    fn reset(&mut self) -> AllocResult<()>;
}

impl MemoryUsage for ScratchAllocator {
    fn used_memory(&self) -> usize {
        self.allocated()
    }

    fn available_memory(&self) -> Option<usize> {
        Some(self.available())
    }

    fn total_memory(&self) -> Option<usize> {
        Some(self.capacity())
    }
}

impl Reset for ScratchAllocator {
    fn reset(&mut self) -> AllocResult<()> {
        ScratchAllocator::reset(self)
    }
}

impl MemoryUsage for StackAllocator {
    fn used_memory(&self) -> usize {
        self.allocated()
    }

    fn available_memory(&self) -> Option<usize> {
        Some(self.available())
    }

    fn total_memory(&self) -> Option<usize> {
        Some(self.capacity())
    }
}

impl Reset for StackAllocator {
    fn reset(&mut self) -> AllocResult<()> {
        StackAllocator::reset(self)
    }
}

impl MemoryUsage for PoolAllocator {
    fn used_memory(&self) -> usize {
        (self.capacity() - self.available()) * self.object_size()
    }

    fn available_memory(&self) -> Option<usize> {
        Some(self.available() * self.object_size())
    }

    fn total_memory(&self) -> Option<usize> {
        Some(self.capacity() * self.object_size())
    }
}

impl Reset for PoolAllocator {
    fn reset(&mut self) -> AllocResult<()> {
        PoolAllocator::reset(self)
    }
}

impl MemoryUsage for DynamicAllocator {
    fn used_memory(&self) -> usize {
        self.used_bytes()
    }

    fn available_memory(&self) -> Option<usize> {
        Some(self.total_bytes() - self.used_bytes())
    }

    // The chain grows on demand, so there is no fixed total.
    fn total_memory(&self) -> Option<usize> {
        None
    }
}

impl Reset for DynamicAllocator {
    fn reset(&mut self) -> AllocResult<()> {
        DynamicAllocator::reset(self)
    }
}
