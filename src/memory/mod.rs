//! Device memory allocation strategies.
//!
//! Both strategies expose the same [`DeviceAllocator`] contract and are
//! selected once at startup through [`AllocatorKind`]; components receive
//! the allocator by reference, never through a global.

use std::sync::Arc;

use crate::config::{AllocatorKind, PoolConfig};
use crate::device::traits::{MemoryHandle, RenderDevice};
use crate::error::RenderResult;

pub mod passthrough;
pub mod pool;

pub use passthrough::PassThroughAllocator;
pub use pool::{PoolAllocator, PoolStats};

/// How an allocation will be used, from the pool's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocUsage {
    /// A sub-range of a shared block; the common case for buffers.
    Linear,
    /// The whole span of a block of its own. For large, long-lived
    /// resources such as images.
    Dedicated,
}

/// A caller-held handle to a byte range of a device memory block.
///
/// Move-only by design: `release` consumes it, so use-after-release and
/// double release are compile errors. An allocation must be released to the
/// allocator that produced it.
#[derive(Debug)]
pub struct Allocation {
    memory: MemoryHandle,
    offset: u64,
    size: u64,
    memory_type: u32,
    block: u32,
}

impl Allocation {
    pub(crate) fn new(
        memory: MemoryHandle,
        offset: u64,
        size: u64,
        memory_type: u32,
        block: u32,
    ) -> Self {
        Self {
            memory,
            offset,
            size,
            memory_type,
            block,
        }
    }

    /// The device memory this range lives in.
    pub fn memory(&self) -> MemoryHandle {
        self.memory
    }

    /// Byte offset of the range within its block.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size of the range in bytes (after granularity rounding).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Memory type index the range was allocated from.
    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    pub(crate) fn block(&self) -> u32 {
        self.block
    }
}

/// The allocator contract shared by the pooled and pass-through strategies.
pub trait DeviceAllocator {
    /// Serve a memory range of at least `size` bytes from `memory_type`.
    /// Failure is fatal to the request and propagated, never retried with a
    /// smaller size.
    fn allocate(
        &mut self,
        memory_type: u32,
        size: u64,
        usage: AllocUsage,
    ) -> RenderResult<Allocation>;

    /// Return a range to the allocator, consuming the handle.
    fn release(&mut self, allocation: Allocation);

    /// Bytes currently in use for one memory type.
    fn allocated_bytes(&self, memory_type: u32) -> u64;

    /// Number of live allocations across all memory types.
    fn allocation_count(&self) -> usize;
}

/// Construct the allocator strategy chosen in the config.
pub fn create_allocator(
    kind: AllocatorKind,
    device: Arc<dyn RenderDevice>,
    config: &PoolConfig,
) -> Box<dyn DeviceAllocator> {
    match kind {
        AllocatorKind::Pooled => Box::new(PoolAllocator::new(device, config.clone())),
        AllocatorKind::PassThrough => Box::new(PassThroughAllocator::new(device)),
    }
}
