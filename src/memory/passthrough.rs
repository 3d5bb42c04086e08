//! Pass-through allocator: one dedicated device allocation per request.
//!
//! No pooling, no sub-ranges. Every `allocate` maps to exactly one device
//! allocation, which makes validation layers and address sanitizers see the
//! true extents of every resource. Selected through
//! [`crate::AllocatorKind::PassThrough`] for diagnostic builds.

use std::collections::HashMap;
use std::sync::Arc;

use crate::device::traits::RenderDevice;
use crate::error::RenderResult;

use super::{AllocUsage, Allocation, DeviceAllocator};

/// The diagnostic allocator strategy.
pub struct PassThroughAllocator {
    device: Arc<dyn RenderDevice>,
    in_use: HashMap<u32, u64>,
    live: usize,
}

impl PassThroughAllocator {
    /// Create a pass-through allocator.
    pub fn new(device: Arc<dyn RenderDevice>) -> Self {
        Self {
            device,
            in_use: HashMap::new(),
            live: 0,
        }
    }
}

impl DeviceAllocator for PassThroughAllocator {
    fn allocate(
        &mut self,
        memory_type: u32,
        size: u64,
        _usage: AllocUsage,
    ) -> RenderResult<Allocation> {
        let size = size.max(1);
        let memory = self.device.allocate_memory(memory_type, size)?;
        *self.in_use.entry(memory_type).or_insert(0) += size;
        self.live += 1;
        Ok(Allocation::new(memory, 0, size, memory_type, 0))
    }

    fn release(&mut self, allocation: Allocation) {
        self.device.free_memory(allocation.memory());
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

impl Drop for PassThroughAllocator {
    fn drop(&mut self) {
        if self.live > 0 {
            log::warn!("pass-through: dropped with {} live allocations", self.live);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dummy::{DummyDevice, HOST_VISIBLE_TYPE};

    #[test]
    fn test_every_request_gets_its_own_memory() {
        let device = Arc::new(DummyDevice::new());
        let mut alloc = PassThroughAllocator::new(device.clone());

        let a = alloc.allocate(HOST_VISIBLE_TYPE, 100, AllocUsage::Linear).unwrap();
        let b = alloc.allocate(HOST_VISIBLE_TYPE, 100, AllocUsage::Linear).unwrap();

        assert_ne!(a.memory(), b.memory());
        assert_eq!(a.offset(), 0);
        assert_eq!(device.live_memory_count(), 2);
        assert_eq!(alloc.allocation_count(), 2);
        assert_eq!(alloc.allocated_bytes(HOST_VISIBLE_TYPE), 200);

        alloc.release(a);
        assert_eq!(device.live_memory_count(), 1);
        assert_eq!(alloc.allocated_bytes(HOST_VISIBLE_TYPE), 100);
        alloc.release(b);
        assert_eq!(alloc.allocation_count(), 0);
    }

    #[test]
    fn test_device_failure_leaves_no_trace() {
        let device = Arc::new(DummyDevice::new());
        let mut alloc = PassThroughAllocator::new(device.clone());

        device.fail_next_allocation();
        let err = alloc
            .allocate(HOST_VISIBLE_TYPE, 4096, AllocUsage::Linear)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::RenderError::ResourceExhausted { .. }
        ));
        assert_eq!(alloc.allocation_count(), 0);
        assert_eq!(alloc.allocated_bytes(HOST_VISIBLE_TYPE), 0);
        assert_eq!(device.live_memory_count(), 0);
    }
}
