//! The renderer core facade.
//!
//! `Renderer` wires the device, the allocator strategy, the buffer factory,
//! the uniform arena, the binding tables and the frame scheduler into one
//! front door. External collaborators (scene traversal, asset upload,
//! window handling) hold a `Renderer` and speak three surfaces: slot
//! acquire/release, raw buffer creation, and `run_frame`.

use std::sync::Arc;

use crate::arena::{ArenaStats, SlotHandle, UniformArena};
use crate::binder::DescriptorBinder;
use crate::buffer::{BackedBuffer, BufferFactory};
use crate::config::RendererConfig;
use crate::device::traits::{BufferUsage, MemoryProfile, RenderDevice};
use crate::error::RenderResult;
use crate::frame::{DrawInstance, FrameScheduler, FrameStats};
use crate::memory::{create_allocator, AllocUsage, DeviceAllocator};

/// The resource-management core for one device.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use framegpu::{DummyDevice, Renderer, RendererConfig};
///
/// let device = Arc::new(DummyDevice::new());
/// let mut renderer = Renderer::new(device, RendererConfig::default()).unwrap();
///
/// let slot = renderer.acquire_slot().unwrap();
/// // ... build DrawInstances referencing `slot` ...
/// renderer.run_frame(&[]).unwrap();
///
/// renderer.release_slot(slot);
/// renderer.shutdown().unwrap();
/// ```
pub struct Renderer {
    allocator: Box<dyn DeviceAllocator>,
    factory: BufferFactory,
    arena: UniformArena,
    binder: DescriptorBinder,
    scheduler: FrameScheduler,
    shut_down: bool,
}

impl Renderer {
    /// Build the full stack against `device` per `config`.
    pub fn new(device: Arc<dyn RenderDevice>, config: RendererConfig) -> RenderResult<Self> {
        let allocator = create_allocator(config.allocator, device.clone(), &config.pool);
        let factory = BufferFactory::new(device.clone());
        let arena = UniformArena::new(device.clone(), &config);
        let binder = DescriptorBinder::new(device.clone());
        let scheduler = FrameScheduler::new(device, &config)?;
        Ok(Self {
            allocator,
            factory,
            arena,
            binder,
            scheduler,
            shut_down: false,
        })
    }

    /// Acquire a uniform slot for a newly visible object.
    pub fn acquire_slot(&mut self) -> RenderResult<SlotHandle> {
        let (slot, _) = self.arena.acquire(&self.factory, &mut *self.allocator)?;
        Ok(slot)
    }

    /// Release a slot when its object leaves the scene. No frame that
    /// might still read the slot may be in flight with it bound.
    pub fn release_slot(&mut self, slot: SlotHandle) {
        self.arena.release(slot);
    }

    /// Create a pool-backed buffer, for mesh and texture upload paths.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsage,
        profile: MemoryProfile,
        alloc_usage: AllocUsage,
    ) -> RenderResult<BackedBuffer> {
        self.factory
            .create(&mut *self.allocator, size, usage, profile, alloc_usage)
    }

    /// Destroy a buffer created through [`Renderer::create_buffer`].
    pub fn destroy_buffer(&mut self, buffer: BackedBuffer) {
        self.factory.destroy(&mut *self.allocator, buffer);
    }

    /// Run one frame over the visible set.
    pub fn run_frame(&mut self, draws: &[DrawInstance]) -> RenderResult<()> {
        self.scheduler
            .run_frame(draws, &mut self.arena, &mut self.binder)
    }

    /// The injected allocator, for diagnostics.
    pub fn allocator(&self) -> &dyn DeviceAllocator {
        &*self.allocator
    }

    /// Arena counters.
    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    /// Frame counters.
    pub fn frame_stats(&self) -> FrameStats {
        self.scheduler.stats()
    }

    /// Orderly teardown: device idle first, then frame-loop resources,
    /// then tables, then arena pages back into the allocator.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.scheduler.shutdown()?;
        self.binder.destroy();
        self.arena.destroy(&self.factory, &mut *self.allocator);
        self.shut_down = true;
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if !self.shut_down {
            log::warn!("renderer: dropped without shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorKind;
    use crate::device::dummy::DummyDevice;

    #[test]
    fn test_facade_frame_cycle() {
        let device = Arc::new(DummyDevice::new());
        let mut renderer =
            Renderer::new(device, RendererConfig::minimal().with_page_capacity(8)).unwrap();

        let slot = renderer.acquire_slot().unwrap();
        assert_eq!(renderer.arena_stats().live_slots, 1);

        renderer.run_frame(&[]).unwrap();
        assert_eq!(renderer.frame_stats().frames_submitted, 1);

        renderer.release_slot(slot);
        assert_eq!(renderer.arena_stats().live_slots, 0);
        renderer.shutdown().unwrap();
    }

    #[test]
    fn test_pass_through_strategy_is_selectable() {
        let device = Arc::new(DummyDevice::new());
        let config = RendererConfig::minimal().with_allocator(AllocatorKind::PassThrough);
        let mut renderer = Renderer::new(device, config).unwrap();

        let buffer = renderer
            .create_buffer(
                2048,
                BufferUsage::VERTEX_BUFFER | BufferUsage::TRANSFER_DST,
                MemoryProfile::DeviceLocal,
                AllocUsage::Linear,
            )
            .unwrap();
        assert_eq!(renderer.allocator().allocation_count(), 1);

        renderer.destroy_buffer(buffer);
        assert_eq!(renderer.allocator().allocation_count(), 0);
        renderer.shutdown().unwrap();
    }
}
