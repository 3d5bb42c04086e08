//! The per-frame acquire/record/submit/present loop.
//!
//! `FrameScheduler` round-robins over K frame slots, K being the surface
//! image count. Each slot carries its own sync bundle so K frames can be in
//! flight; the only CPU block is the bounded fence wait guarding command
//! buffer reuse.
//!
//! Surface staleness is handled in two places. A stale acquire rebuilds the
//! chain synchronously and retries once. A stale present defers the rebuild
//! to the start of the next `run_frame`, so the just-submitted frame is
//! never torn down mid-flight. Rebuilds touch only chain-dependent state
//! (targets, depth, frame syncs if the image count changed); the allocator,
//! arena and binder are untouched.

use std::sync::Arc;

use glam::Mat4;

use crate::arena::{SlotHandle, UniformArena};
use crate::binder::DescriptorBinder;
use crate::config::RendererConfig;
use crate::device::traits::{
    AcquireOutcome, Extent, FrameSync, MeshRef, PresentOutcome, RenderDevice, TargetHandle,
};
use crate::error::{RenderError, RenderResult};

/// One renderable object for one frame: an externally owned entity id, the
/// uniform slot holding its transform, its mesh, and this frame's model
/// matrix.
#[derive(Debug, Clone, Copy)]
pub struct DrawInstance {
    pub entity: u64,
    pub slot: SlotHandle,
    pub mesh: MeshRef,
    pub transform: Mat4,
}

/// Where the scheduler is within the frame cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
    Rebuilding,
}

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    pub frames_submitted: u64,
    pub rebuilds: u64,
}

struct FrameSlot {
    sync: FrameSync,
}

/// The presentable-image set and its render targets.
struct SurfaceChain {
    extent: Extent,
    targets: Vec<TargetHandle>,
    depth: TargetHandle,
}

impl SurfaceChain {
    fn create(device: &dyn RenderDevice, image_count: u32, extent: Extent) -> RenderResult<Self> {
        // Depth first: backends attach it to every per-image target.
        let depth = device.create_depth_target(extent)?;
        let mut targets = Vec::with_capacity(image_count as usize);
        for image_index in 0..image_count {
            targets.push(device.create_render_target(image_index, extent)?);
        }
        Ok(Self {
            extent,
            targets,
            depth,
        })
    }

    fn destroy(&mut self, device: &dyn RenderDevice) {
        for target in self.targets.drain(..) {
            device.destroy_render_target(target);
        }
        device.destroy_render_target(self.depth);
    }
}

/// Drives the frame loop against one device.
pub struct FrameScheduler {
    device: Arc<dyn RenderDevice>,
    fence_timeout_ns: u64,
    slots: Vec<FrameSlot>,
    chain: SurfaceChain,
    current: usize,
    state: FrameState,
    pending_rebuild: bool,
    stats: FrameStats,
    shut_down: bool,
}

impl FrameScheduler {
    /// Build the chain and one sync bundle per presentable image.
    pub fn new(device: Arc<dyn RenderDevice>, config: &RendererConfig) -> RenderResult<Self> {
        let image_count = device.image_count();
        let extent = device.surface_extent();
        let chain = SurfaceChain::create(&*device, image_count, extent)?;
        let mut slots = Vec::with_capacity(image_count as usize);
        for _ in 0..image_count {
            slots.push(FrameSlot {
                sync: device.create_frame_sync()?,
            });
        }
        Ok(Self {
            device,
            fence_timeout_ns: config.fence_timeout_ns,
            slots,
            chain,
            current: 0,
            state: FrameState::Idle,
            pending_rebuild: false,
            stats: FrameStats::default(),
            shut_down: false,
        })
    }

    /// Run one frame over `draws`. An empty draw list still records an
    /// (empty) pass, submits and presents; it must never grow pages or
    /// tables, and never time out.
    ///
    /// Every `slot` in `draws` must be live and already covered by a
    /// binding table or be acquired this frame (tables are synced here,
    /// before recording).
    pub fn run_frame(
        &mut self,
        draws: &[DrawInstance],
        arena: &mut UniformArena,
        binder: &mut DescriptorBinder,
    ) -> RenderResult<()> {
        if self.pending_rebuild {
            self.rebuild()?;
            self.pending_rebuild = false;
        }

        // A stale acquire rebuilds and retries once. Two stale acquires in
        // a row means the surface cannot converge this frame.
        self.state = FrameState::Acquiring;
        let mut image_index = None;
        for _ in 0..2 {
            match self
                .device
                .acquire_image(self.slots[self.current].sync.acquired)?
            {
                AcquireOutcome::Ready { image_index: index } => {
                    image_index = Some(index);
                    break;
                }
                AcquireOutcome::Stale => self.rebuild()?,
            }
        }
        let Some(image_index) = image_index else {
            self.state = FrameState::Idle;
            return Err(RenderError::StaleSurface);
        };

        let sync = self.slots[self.current].sync;

        self.state = FrameState::Recording;
        self.device.wait_fence(sync.fence, self.fence_timeout_ns)?;
        self.device.reset_fence(sync.fence)?;

        binder.sync_pages(arena)?;

        self.device.begin_commands(sync.commands)?;
        // Staged-mode copies must land before the pass begins.
        arena.publish(draws, sync.commands)?;

        self.device.cmd_begin_pass(
            sync.commands,
            self.chain.targets[image_index as usize],
            self.chain.extent,
        );
        self.device.cmd_bind_pipeline(sync.commands);

        let mut bound_page = None;
        for draw in draws {
            let page = draw.slot.page();
            if bound_page != Some(page) {
                let table = binder.table_for(page).ok_or(RenderError::ContractViolation(
                    "draw references a page with no binding table",
                ))?;
                self.device.cmd_bind_table(sync.commands, table);
                bound_page = Some(page);
            }
            self.device.cmd_push_slot(sync.commands, draw.slot.slot());
            self.device.cmd_draw(sync.commands, &draw.mesh);
        }

        self.device.cmd_end_pass(sync.commands);
        self.device.end_commands(sync.commands)?;

        self.state = FrameState::Submitted;
        self.device
            .submit(sync.commands, sync.acquired, sync.finished, sync.fence)?;
        self.stats.frames_submitted += 1;

        self.state = FrameState::Presenting;
        if self.device.present(image_index, sync.finished)? == PresentOutcome::Stale {
            // The frame was presented; rebuild at the top of the next one.
            self.pending_rebuild = true;
        }

        self.current = (self.current + 1) % self.slots.len();
        self.state = FrameState::Idle;
        Ok(())
    }

    /// Tear down and rebuild everything that depends on the surface chain.
    fn rebuild(&mut self) -> RenderResult<()> {
        self.state = FrameState::Rebuilding;
        self.device.wait_idle()?;
        self.chain.destroy(&*self.device);

        let (image_count, extent) = self.device.recreate_surface()?;
        self.chain = SurfaceChain::create(&*self.device, image_count, extent)?;

        if image_count as usize != self.slots.len() {
            for slot in self.slots.drain(..) {
                self.device.destroy_frame_sync(&slot.sync);
            }
            for _ in 0..image_count {
                self.slots.push(FrameSlot {
                    sync: self.device.create_frame_sync()?,
                });
            }
        }

        self.current = 0;
        self.stats.rebuilds += 1;
        log::debug!(
            "surface rebuilt: {} images at {}x{}",
            image_count,
            extent.width,
            extent.height
        );
        Ok(())
    }

    /// Current scheduler state.
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Frame counters.
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Wait for the device to go idle, then destroy the chain and every
    /// sync bundle. Frame-loop resources only; the caller tears down the
    /// arena, binder and allocator afterwards.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.device.wait_idle()?;
        self.chain.destroy(&*self.device);
        for slot in self.slots.drain(..) {
            self.device.destroy_frame_sync(&slot.sync);
        }
        self.shut_down = true;
        Ok(())
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if !self.shut_down {
            log::warn!("scheduler: dropped without shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferFactory;
    use crate::config::{PoolConfig, PublishStrategy};
    use crate::device::dummy::DummyDevice;
    use crate::device::traits::BufferHandle;
    use crate::memory::{DeviceAllocator, PoolAllocator};

    struct Fixture {
        device: Arc<DummyDevice>,
        factory: BufferFactory,
        allocator: PoolAllocator,
        arena: UniformArena,
        binder: DescriptorBinder,
        scheduler: FrameScheduler,
    }

    fn fixture(device: Arc<DummyDevice>) -> Fixture {
        let config = RendererConfig::default()
            .with_page_capacity(8)
            .with_publish(PublishStrategy::Mapped);
        let dyn_device: Arc<dyn RenderDevice> = device.clone();
        Fixture {
            factory: BufferFactory::new(dyn_device.clone()),
            allocator: PoolAllocator::new(dyn_device.clone(), PoolConfig::default()),
            arena: UniformArena::new(dyn_device.clone(), &config),
            binder: DescriptorBinder::new(dyn_device.clone()),
            scheduler: FrameScheduler::new(dyn_device, &config).unwrap(),
            device,
        }
    }

    impl Fixture {
        fn draw_for(&mut self, entity: u64) -> DrawInstance {
            let (slot, _) = self
                .arena
                .acquire(&self.factory, &mut self.allocator)
                .unwrap();
            DrawInstance {
                entity,
                slot,
                mesh: MeshRef {
                    vertex: BufferHandle(0),
                    index: BufferHandle(0),
                    index_count: 36,
                },
                transform: Mat4::IDENTITY,
            }
        }

        fn run(&mut self, draws: &[DrawInstance]) -> RenderResult<()> {
            self.scheduler
                .run_frame(draws, &mut self.arena, &mut self.binder)
        }

        fn teardown(mut self) {
            self.scheduler.shutdown().unwrap();
            self.binder.destroy();
            self.arena.destroy(&self.factory, &mut self.allocator);
        }
    }

    #[test]
    fn test_empty_draw_list_submits_without_growth() {
        let mut fx = fixture(Arc::new(DummyDevice::new()));

        for _ in 0..5 {
            fx.run(&[]).unwrap();
        }

        assert_eq!(fx.scheduler.stats().frames_submitted, 5);
        assert_eq!(fx.scheduler.stats().rebuilds, 0);
        assert_eq!(fx.arena.page_count(), 0);
        assert_eq!(fx.binder.table_count(), 0);
        assert_eq!(fx.device.submit_count(), 5);
        fx.teardown();
    }

    #[test]
    fn test_draws_create_tables_and_submit() {
        let mut fx = fixture(Arc::new(DummyDevice::new()));
        let draws = [fx.draw_for(1), fx.draw_for(2)];

        fx.run(&draws).unwrap();

        assert_eq!(fx.arena.page_count(), 1);
        assert_eq!(fx.binder.table_count(), 1);
        assert_eq!(fx.scheduler.stats().frames_submitted, 1);
        fx.teardown();
    }

    #[test]
    fn test_stale_acquire_rebuilds_once_and_recovers() {
        let device = Arc::new(DummyDevice::new());
        let mut fx = fixture(device.clone());
        fx.run(&[]).unwrap();

        let before = fx.allocator.allocation_count();
        device.invalidate_surface(Extent {
            width: 1920,
            height: 1080,
        });

        fx.run(&[]).unwrap();

        assert_eq!(fx.scheduler.stats().rebuilds, 1);
        assert_eq!(fx.scheduler.stats().frames_submitted, 2);
        assert_eq!(fx.allocator.allocation_count(), before);
        assert_eq!(
            device.surface_extent(),
            Extent {
                width: 1920,
                height: 1080
            }
        );

        // Subsequent frames are clean.
        fx.run(&[]).unwrap();
        assert_eq!(fx.scheduler.stats().rebuilds, 1);
        fx.teardown();
    }

    #[test]
    fn test_stale_present_defers_rebuild_to_next_frame() {
        let device = Arc::new(DummyDevice::new());
        let mut fx = fixture(device.clone());

        device.invalidate_surface_after_acquire(Extent {
            width: 640,
            height: 480,
        });

        // The frame that observes the stale present still completes.
        fx.run(&[]).unwrap();
        assert_eq!(fx.scheduler.stats().frames_submitted, 1);
        assert_eq!(fx.scheduler.stats().rebuilds, 0);

        // The next frame rebuilds first, then runs normally.
        fx.run(&[]).unwrap();
        assert_eq!(fx.scheduler.stats().rebuilds, 1);
        assert_eq!(fx.scheduler.stats().frames_submitted, 2);
        fx.teardown();
    }

    #[test]
    fn test_hung_queue_surfaces_as_sync_timeout() {
        // One image means one frame slot, so the very next frame reuses
        // the slot whose fence a hung queue never signalled.
        let device = Arc::new(DummyDevice::with_surface(
            Extent {
                width: 320,
                height: 240,
            },
            1,
        ));
        let mut fx = fixture(device.clone());

        device.stall_queue();
        fx.run(&[]).unwrap();

        let err = fx.run(&[]).unwrap_err();
        assert!(matches!(err, RenderError::SyncTimeout { .. }));
        assert_eq!(fx.scheduler.stats().frames_submitted, 1);
        fx.teardown();
    }

    #[test]
    fn test_frames_round_robin_over_image_count() {
        let device = Arc::new(DummyDevice::with_surface(
            Extent {
                width: 800,
                height: 600,
            },
            2,
        ));
        let mut fx = fixture(device.clone());

        for _ in 0..6 {
            fx.run(&[]).unwrap();
        }
        assert_eq!(fx.scheduler.stats().frames_submitted, 6);
        assert_eq!(fx.scheduler.state(), FrameState::Idle);
        fx.teardown();
    }
}
