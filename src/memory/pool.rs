//! Pooled device memory: fixed blocks carved into first-fit sub-ranges.
//!
//! One [`MemoryBlock`] per physical device allocation, holding an ordered
//! free list of `(offset, size)` spans. Released ranges merge with adjacent
//! spans on both sides, so free-list fragmentation cannot grow unbounded
//! under acquire/release churn. Blocks are never shrunk; they are freed only
//! when the allocator is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::PoolConfig;
use crate::device::traits::{MemoryHandle, RenderDevice};
use crate::error::RenderResult;
use crate::util::size::{align_up, format_bytes};

use super::{AllocUsage, Allocation, DeviceAllocator};

/// One physical allocation from the device for a given memory type.
struct MemoryBlock {
    memory: MemoryHandle,
    memory_type: u32,
    size: u64,
    /// Free spans, sorted by offset, non-overlapping, non-adjacent.
    free: Vec<(u64, u64)>,
    /// A dedicated allocation holds the whole block.
    reserved: bool,
}

impl MemoryBlock {
    fn is_empty(&self) -> bool {
        !self.reserved && self.free.len() == 1 && self.free[0] == (0, self.size)
    }

    /// Carve `size` bytes from the first span that fits.
    fn take_first_fit(&mut self, size: u64) -> Option<u64> {
        let index = self.free.iter().position(|&(_, len)| len >= size)?;
        let (offset, len) = self.free[index];
        if len == size {
            self.free.remove(index);
        } else {
            self.free[index] = (offset + size, len - size);
        }
        Some(offset)
    }

    /// Return a span to the free list, merging with both neighbors where
    /// contiguous. Returns false if the span overlaps an existing free span
    /// (a double release).
    fn insert_free(&mut self, offset: u64, size: u64) -> bool {
        let index = self.free.partition_point(|&(start, _)| start < offset);

        if index > 0 {
            let (prev_start, prev_len) = self.free[index - 1];
            if prev_start + prev_len > offset {
                return false;
            }
        }
        if index < self.free.len() && offset + size > self.free[index].0 {
            return false;
        }

        let merges_prev = index > 0 && {
            let (prev_start, prev_len) = self.free[index - 1];
            prev_start + prev_len == offset
        };
        let merges_next = index < self.free.len() && offset + size == self.free[index].0;

        match (merges_prev, merges_next) {
            (true, true) => {
                let next_len = self.free[index].1;
                self.free[index - 1].1 += size + next_len;
                self.free.remove(index);
            }
            (true, false) => self.free[index - 1].1 += size,
            (false, true) => {
                self.free[index].0 = offset;
                self.free[index].1 += size;
            }
            (false, false) => self.free.insert(index, (offset, size)),
        }
        true
    }
}

/// Snapshot of pool state for diagnostics and tests.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Number of device blocks created.
    pub block_count: usize,
    /// Total free spans across all blocks.
    pub free_span_count: usize,
    /// Bytes currently handed out, all memory types.
    pub allocated_bytes: u64,
    /// Bytes sitting in free lists.
    pub free_bytes: u64,
    /// Live allocations.
    pub allocation_count: usize,
}

/// The pooled allocator strategy.
pub struct PoolAllocator {
    device: Arc<dyn RenderDevice>,
    config: PoolConfig,
    /// Blocks in creation order; allocation scans them first-fit.
    blocks: Vec<MemoryBlock>,
    in_use: HashMap<u32, u64>,
    live: usize,
}

impl PoolAllocator {
    /// Create an empty pool. Blocks are carved from the device on demand.
    pub fn new(device: Arc<dyn RenderDevice>, config: PoolConfig) -> Self {
        Self {
            device,
            config,
            blocks: Vec::new(),
            in_use: HashMap::new(),
            live: 0,
        }
    }

    fn create_block(&mut self, memory_type: u32, size: u64) -> RenderResult<usize> {
        let memory = self.device.allocate_memory(memory_type, size)?;
        log::debug!(
            "pool: new block of {} for memory type {}",
            format_bytes(size),
            memory_type
        );
        self.blocks.push(MemoryBlock {
            memory,
            memory_type,
            size,
            free: vec![(0, size)],
            reserved: false,
        });
        Ok(self.blocks.len() - 1)
    }

    fn finish(&mut self, block: usize, offset: u64, size: u64) -> Allocation {
        let memory_type = self.blocks[block].memory_type;
        *self.in_use.entry(memory_type).or_insert(0) += size;
        self.live += 1;
        Allocation::new(
            self.blocks[block].memory,
            offset,
            size,
            memory_type,
            block as u32,
        )
    }

    /// Free bytes available for one memory type.
    pub fn free_bytes(&self, memory_type: u32) -> u64 {
        self.blocks
            .iter()
            .filter(|b| b.memory_type == memory_type)
            .flat_map(|b| b.free.iter())
            .map(|&(_, len)| len)
            .sum()
    }

    /// Current pool state.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            block_count: self.blocks.len(),
            free_span_count: self.blocks.iter().map(|b| b.free.len()).sum(),
            allocated_bytes: self.in_use.values().sum(),
            free_bytes: self
                .blocks
                .iter()
                .flat_map(|b| b.free.iter())
                .map(|&(_, len)| len)
                .sum(),
            allocation_count: self.live,
        }
    }
}

impl DeviceAllocator for PoolAllocator {
    fn allocate(
        &mut self,
        memory_type: u32,
        size: u64,
        usage: AllocUsage,
    ) -> RenderResult<Allocation> {
        let rounded = align_up(size.max(1), self.config.page_granularity);

        match usage {
            AllocUsage::Dedicated => {
                // Only an empty, unreserved block's full span is eligible.
                let found = self
                    .blocks
                    .iter()
                    .position(|b| b.memory_type == memory_type && b.is_empty() && b.size >= rounded);
                let block = match found {
                    Some(index) => index,
                    None => self
                        .create_block(memory_type, rounded.max(self.config.min_block_size))?,
                };
                let whole = self.blocks[block].size;
                self.blocks[block].free.clear();
                self.blocks[block].reserved = true;
                Ok(self.finish(block, 0, whole))
            }
            AllocUsage::Linear => {
                for index in 0..self.blocks.len() {
                    let block = &mut self.blocks[index];
                    if block.memory_type != memory_type || block.reserved {
                        continue;
                    }
                    if let Some(offset) = block.take_first_fit(rounded) {
                        return Ok(self.finish(index, offset, rounded));
                    }
                }
                let block_size = (rounded * 2).max(self.config.min_block_size);
                let block = self.create_block(memory_type, block_size)?;
                let offset = self.blocks[block]
                    .take_first_fit(rounded)
                    .expect("fresh block must fit its own request");
                Ok(self.finish(block, offset, rounded))
            }
        }
    }

    fn release(&mut self, allocation: Allocation) {
        let Some(block) = self.blocks.get_mut(allocation.block() as usize) else {
            debug_assert!(false, "release against unknown block");
            log::error!("pool: release against unknown block, ignoring");
            return;
        };

        if block.reserved && allocation.offset() == 0 && allocation.size() == block.size {
            block.reserved = false;
            block.free = vec![(0, block.size)];
        } else if !block.insert_free(allocation.offset(), allocation.size()) {
            debug_assert!(false, "release of a range that is already free");
            log::error!(
                "pool: release of already-free range at offset {}, ignoring",
                allocation.offset()
            );
            return;
        }

        if let Some(in_use) = self.in_use.get_mut(&allocation.memory_type()) {
            *in_use -= allocation.size();
        }
        self.live -= 1;
    }

    fn allocated_bytes(&self, memory_type: u32) -> u64 {
        self.in_use.get(&memory_type).copied().unwrap_or(0)
    }

    fn allocation_count(&self) -> usize {
        self.live
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        if self.live > 0 {
            log::warn!("pool: dropped with {} live allocations", self.live);
        }
        for block in self.blocks.drain(..) {
            self.device.free_memory(block.memory);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dummy::{DummyDevice, HOST_VISIBLE_TYPE};

    fn pool(min_block_size: u64) -> PoolAllocator {
        PoolAllocator::new(
            Arc::new(DummyDevice::new()),
            PoolConfig {
                page_granularity: 1024,
                min_block_size,
            },
        )
    }

    #[test]
    fn test_three_allocations_share_one_block() {
        let mut pool = pool(10240);

        let a = pool.allocate(HOST_VISIBLE_TYPE, 100, AllocUsage::Linear).unwrap();
        let b = pool.allocate(HOST_VISIBLE_TYPE, 5000, AllocUsage::Linear).unwrap();
        let c = pool.allocate(HOST_VISIBLE_TYPE, 100, AllocUsage::Linear).unwrap();

        assert_eq!(pool.stats().block_count, 1);
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 1024);
        assert_eq!(c.offset(), 6144);
        assert_eq!(pool.allocated_bytes(HOST_VISIBLE_TYPE), 7168);
        assert_eq!(pool.free_bytes(HOST_VISIBLE_TYPE), 10240 - 7168);

        // Ranges must not overlap.
        assert!(a.offset() + a.size() <= b.offset());
        assert!(b.offset() + b.size() <= c.offset());

        pool.release(a);
        pool.release(b);
        pool.release(c);
    }

    #[test]
    fn test_full_drain_merges_to_one_span() {
        let mut pool = pool(10240);

        let mut live: Vec<Option<Allocation>> = Vec::new();
        for _ in 0..6 {
            live.push(Some(
                pool.allocate(HOST_VISIBLE_TYPE, 2000, AllocUsage::Linear).unwrap(),
            ));
        }
        // Release in a shuffled order to exercise both merge directions.
        for index in [3, 0, 5, 1, 4, 2] {
            pool.release(live[index].take().unwrap());
        }

        let stats = pool.stats();
        assert_eq!(stats.allocation_count, 0);
        assert_eq!(stats.allocated_bytes, 0);
        assert_eq!(stats.free_span_count, stats.block_count);
    }

    #[test]
    fn test_first_fit_reuses_released_span() {
        let mut pool = pool(10240);

        let a = pool.allocate(HOST_VISIBLE_TYPE, 1024, AllocUsage::Linear).unwrap();
        let b = pool.allocate(HOST_VISIBLE_TYPE, 1024, AllocUsage::Linear).unwrap();
        let freed_offset = a.offset();

        pool.release(a);
        let c = pool.allocate(HOST_VISIBLE_TYPE, 1024, AllocUsage::Linear).unwrap();
        assert_eq!(c.offset(), freed_offset);

        pool.release(b);
        pool.release(c);
    }

    #[test]
    fn test_dedicated_block_is_not_shared() {
        let mut pool = pool(4096);

        let image = pool
            .allocate(HOST_VISIBLE_TYPE, 4096, AllocUsage::Dedicated)
            .unwrap();
        assert_eq!(image.offset(), 0);
        assert_eq!(image.size(), 4096);

        // A linear request must not land in the reserved block.
        let other = pool.allocate(HOST_VISIBLE_TYPE, 1024, AllocUsage::Linear).unwrap();
        assert_eq!(pool.stats().block_count, 2);
        assert_ne!(other.memory(), image.memory());

        // Releasing the dedicated range makes the block eligible again.
        pool.release(image);
        let again = pool
            .allocate(HOST_VISIBLE_TYPE, 4096, AllocUsage::Dedicated)
            .unwrap();
        assert_eq!(pool.stats().block_count, 2);

        pool.release(other);
        pool.release(again);
    }

    #[test]
    fn test_oversized_request_doubles_block() {
        let mut pool = pool(1024);

        let big = pool.allocate(HOST_VISIBLE_TYPE, 8192, AllocUsage::Linear).unwrap();
        assert_eq!(big.size(), 8192);
        assert_eq!(pool.free_bytes(HOST_VISIBLE_TYPE), 8192);
        pool.release(big);
    }

    #[test]
    fn test_device_failure_propagates_and_leaves_pool_unchanged() {
        let device = Arc::new(DummyDevice::new());
        let mut pool = PoolAllocator::new(
            device.clone(),
            PoolConfig {
                page_granularity: 1024,
                min_block_size: 4096,
            },
        );

        let a = pool.allocate(HOST_VISIBLE_TYPE, 1024, AllocUsage::Linear).unwrap();
        let before = pool.stats();

        // The next request needs a new block, and the device refuses it.
        device.fail_next_allocation();
        let err = pool
            .allocate(HOST_VISIBLE_TYPE, 8192, AllocUsage::Linear)
            .unwrap_err();
        assert!(matches!(err, crate::RenderError::ResourceExhausted { .. }));

        // Fatal to the request only: nothing was created or leaked.
        let after = pool.stats();
        assert_eq!(after.block_count, before.block_count);
        assert_eq!(after.allocation_count, before.allocation_count);
        assert_eq!(after.allocated_bytes, before.allocated_bytes);

        // The pool keeps serving once the device recovers.
        let b = pool.allocate(HOST_VISIBLE_TYPE, 8192, AllocUsage::Linear).unwrap();
        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn test_blocks_freed_on_drop() {
        let device = Arc::new(DummyDevice::new());
        {
            let mut pool = PoolAllocator::new(device.clone(), PoolConfig::default());
            let a = pool.allocate(HOST_VISIBLE_TYPE, 100, AllocUsage::Linear).unwrap();
            assert_eq!(device.live_memory_count(), 1);
            pool.release(a);
        }
        assert_eq!(device.live_memory_count(), 0);
    }
}
