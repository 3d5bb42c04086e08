//! Buffer creation bound to pool-backed memory.
//!
//! `BufferFactory` is the one place the create/query/allocate/bind sequence
//! lives. The uniform arena uses it for page and staging buffers; mesh and
//! texture upload paths (external to this crate) go through the same helper.

use std::sync::Arc;

use crate::device::traits::{BufferHandle, BufferUsage, MemoryHandle, MemoryProfile, RenderDevice};
use crate::error::{RenderError, RenderResult};
use crate::memory::{AllocUsage, Allocation, DeviceAllocator};

/// A buffer object together with the allocation backing it.
#[derive(Debug)]
pub struct BackedBuffer {
    buffer: BufferHandle,
    allocation: Allocation,
    size: u64,
    host_visible: bool,
}

impl BackedBuffer {
    /// The device buffer handle.
    pub fn handle(&self) -> BufferHandle {
        self.buffer
    }

    /// The memory block the buffer is bound into.
    pub fn memory(&self) -> MemoryHandle {
        self.allocation.memory()
    }

    /// Byte offset of the buffer within its memory block.
    pub fn base_offset(&self) -> u64 {
        self.allocation.offset()
    }

    /// Logical buffer size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the backing memory is CPU-mappable.
    pub fn host_visible(&self) -> bool {
        self.host_visible
    }
}

/// Creates buffers and binds them to allocator-served memory.
pub struct BufferFactory {
    device: Arc<dyn RenderDevice>,
}

impl BufferFactory {
    /// Create a factory for one device.
    pub fn new(device: Arc<dyn RenderDevice>) -> Self {
        Self { device }
    }

    /// Create a buffer of `size` bytes backed by memory matching `profile`.
    pub fn create(
        &self,
        allocator: &mut dyn DeviceAllocator,
        size: u64,
        usage: BufferUsage,
        profile: MemoryProfile,
        alloc_usage: AllocUsage,
    ) -> RenderResult<BackedBuffer> {
        let buffer = self.device.create_buffer(size, usage)?;
        let requirements = self.device.buffer_requirements(buffer);

        let memory_type = match self
            .device
            .find_memory_type(requirements.memory_type_bits, profile)
        {
            Some(memory_type) => memory_type,
            None => {
                self.device.destroy_buffer(buffer);
                return Err(RenderError::NoCompatibleMemory {
                    type_bits: requirements.memory_type_bits,
                });
            }
        };

        let allocation = match allocator.allocate(memory_type, requirements.size, alloc_usage) {
            Ok(allocation) => allocation,
            Err(err) => {
                self.device.destroy_buffer(buffer);
                return Err(err);
            }
        };
        // Pool spans are granularity-aligned, which covers buffer alignment
        // up to the granularity.
        debug_assert_eq!(allocation.offset() % requirements.alignment, 0);

        self.device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;

        Ok(BackedBuffer {
            buffer,
            allocation,
            size,
            host_visible: self.device.is_host_visible(memory_type),
        })
    }

    /// Destroy a buffer and return its memory to the allocator. The caller
    /// guarantees no in-flight frame still references the buffer.
    pub fn destroy(&self, allocator: &mut dyn DeviceAllocator, buffer: BackedBuffer) {
        self.device.destroy_buffer(buffer.buffer);
        allocator.release(buffer.allocation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::device::dummy::DummyDevice;
    use crate::memory::PoolAllocator;

    #[test]
    fn test_create_binds_buffer_to_pool_memory() {
        let device = Arc::new(DummyDevice::new());
        let factory = BufferFactory::new(device.clone());
        let mut allocator = PoolAllocator::new(device.clone(), PoolConfig::default());

        let buffer = factory
            .create(
                &mut allocator,
                4096,
                BufferUsage::UNIFORM_BUFFER,
                MemoryProfile::HostVisible,
                AllocUsage::Linear,
            )
            .unwrap();

        assert!(buffer.host_visible());
        assert_eq!(buffer.size(), 4096);
        assert_eq!(allocator.allocation_count(), 1);

        factory.destroy(&mut allocator, buffer);
        assert_eq!(allocator.allocation_count(), 0);
    }

    #[test]
    fn test_device_local_profile_is_not_host_visible() {
        let device = Arc::new(DummyDevice::new());
        let factory = BufferFactory::new(device.clone());
        let mut allocator = PoolAllocator::new(device, PoolConfig::default());

        let buffer = factory
            .create(
                &mut allocator,
                1024,
                BufferUsage::VERTEX_BUFFER | BufferUsage::TRANSFER_DST,
                MemoryProfile::DeviceLocal,
                AllocUsage::Linear,
            )
            .unwrap();

        assert!(!buffer.host_visible());
        factory.destroy(&mut allocator, buffer);
    }
}
