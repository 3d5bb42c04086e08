//! Paged arena of fixed-size uniform slots.
//!
//! Each page is one pool-backed buffer holding `page_capacity` slots; each
//! slot holds one object's per-frame transform record. Handles are opaque
//! `(page, slot)` pairs; slot indices are recycled through a per-page free
//! queue. A slot's bytes are defined only between a successful `acquire`
//! and the matching `release`; they are not zeroed on release (stale bytes
//! are harmless until the slot is reacquired and rewritten).
//!
//! Publishing has two modes, chosen once at startup: host-visible pages are
//! written directly and flushed, device-local pages go through a
//! host-visible staging buffer and one batched copy command per page.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use crossbeam_queue::SegQueue;
use glam::Mat4;

use crate::buffer::{BackedBuffer, BufferFactory};
use crate::config::{PublishStrategy, RendererConfig};
use crate::device::traits::{
    BufferHandle, BufferUsage, CommandHandle, CopyRegion, MemoryProfile, RenderDevice,
};
use crate::error::{RenderError, RenderResult};
use crate::frame::DrawInstance;
use crate::memory::{AllocUsage, DeviceAllocator};
use crate::util::size::align_up;

/// The per-object record written into a slot: the model matrix and its
/// inverse-transpose for normals, both column-major.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ObjectUniform {
    pub model: [[f32; 4]; 4],
    pub normal: [[f32; 4]; 4],
}

impl ObjectUniform {
    /// Build the record from a model transform.
    pub fn from_transform(model: Mat4) -> Self {
        Self {
            model: model.to_cols_array_2d(),
            normal: model.inverse().transpose().to_cols_array_2d(),
        }
    }
}

/// Opaque handle to one live uniform slot: `(page, slot)` packed into 32
/// bits. Must be presented unchanged on release and publish. Unique while
/// live; indices are reused only after release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle(u32);

impl SlotHandle {
    fn new(page: u16, slot: u16) -> Self {
        Self((page as u32) << 16 | slot as u32)
    }

    /// Index of the page this slot lives in.
    pub fn page(self) -> u32 {
        self.0 >> 16
    }

    /// Slot index within the page.
    pub fn slot(self) -> u32 {
        self.0 & 0xffff
    }
}

/// Which path `publish` takes, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishMode {
    Mapped,
    Staged,
}

struct UniformPage {
    buffer: BackedBuffer,
    /// Host-visible twin of `buffer` in staged mode.
    staging: Option<BackedBuffer>,
    free: SegQueue<u32>,
    live: Vec<bool>,
}

/// Snapshot of arena state for diagnostics and tests.
#[derive(Debug, Clone, Default)]
pub struct ArenaStats {
    /// Pages created so far (never shrinks).
    pub pages: usize,
    /// Currently acquired slots.
    pub live_slots: u32,
    /// Bytes per slot after alignment rounding.
    pub slot_size: u64,
    /// Slots per page.
    pub page_capacity: u32,
}

/// The paged uniform-slot arena.
pub struct UniformArena {
    device: Arc<dyn RenderDevice>,
    slot_size: u64,
    capacity: u32,
    mode: PublishMode,
    pages: Vec<UniformPage>,
    live_slots: u32,
}

impl UniformArena {
    /// Create an empty arena. Slot size is the record size rounded up to
    /// the device's minimum uniform alignment; pages are created lazily on
    /// the first acquire that finds no free slot.
    pub fn new(device: Arc<dyn RenderDevice>, config: &RendererConfig) -> Self {
        let limits = device.limits();
        let slot_size = align_up(
            std::mem::size_of::<ObjectUniform>() as u64,
            limits.min_uniform_alignment,
        );
        let mode = match config.publish {
            PublishStrategy::Mapped => PublishMode::Mapped,
            PublishStrategy::Staged => PublishMode::Staged,
            PublishStrategy::Auto => {
                if device
                    .find_memory_type(u32::MAX, MemoryProfile::HostVisible)
                    .is_some()
                {
                    PublishMode::Mapped
                } else {
                    PublishMode::Staged
                }
            }
        };
        debug_assert!(config.page_capacity > 0 && config.page_capacity <= u16::MAX as u32 + 1);
        Self {
            device,
            slot_size,
            capacity: config.page_capacity,
            mode,
            pages: Vec::new(),
            live_slots: 0,
        }
    }

    /// Acquire a slot, creating a page if every existing page is full. The
    /// returned flag is true when a page was created, telling the caller to
    /// grow its binding tables before the next frame uses the slot.
    pub fn acquire(
        &mut self,
        factory: &BufferFactory,
        allocator: &mut dyn DeviceAllocator,
    ) -> RenderResult<(SlotHandle, bool)> {
        for (page_index, page) in self.pages.iter_mut().enumerate() {
            if let Some(slot) = page.free.pop() {
                page.live[slot as usize] = true;
                self.live_slots += 1;
                return Ok((SlotHandle::new(page_index as u16, slot as u16), false));
            }
        }

        if self.pages.len() > u16::MAX as usize {
            return Err(RenderError::ResourceExhausted {
                requested: self.slot_size * self.capacity as u64,
            });
        }
        let page_index = self.pages.len() as u16;
        let mut page = self.create_page(factory, allocator)?;
        log::debug!(
            "uniform arena grew to {} pages ({} slots)",
            self.pages.len() + 1,
            (self.pages.len() + 1) * self.capacity as usize
        );

        let slot = page.free.pop().expect("fresh page has free slots");
        page.live[slot as usize] = true;
        self.pages.push(page);
        self.live_slots += 1;
        Ok((SlotHandle::new(page_index, slot as u16), true))
    }

    fn create_page(
        &self,
        factory: &BufferFactory,
        allocator: &mut dyn DeviceAllocator,
    ) -> RenderResult<UniformPage> {
        let bytes = self.slot_size * self.capacity as u64;
        let (profile, usage) = match self.mode {
            PublishMode::Mapped => (
                MemoryProfile::HostVisible,
                BufferUsage::UNIFORM_BUFFER,
            ),
            PublishMode::Staged => (
                MemoryProfile::DeviceLocal,
                BufferUsage::UNIFORM_BUFFER | BufferUsage::TRANSFER_DST,
            ),
        };
        let buffer = factory.create(allocator, bytes, usage, profile, AllocUsage::Linear)?;

        let staging = match self.mode {
            PublishMode::Mapped => None,
            PublishMode::Staged => Some(factory.create(
                allocator,
                bytes,
                BufferUsage::TRANSFER_SRC,
                MemoryProfile::HostVisible,
                AllocUsage::Linear,
            )?),
        };

        let free = SegQueue::new();
        for slot in 0..self.capacity {
            free.push(slot);
        }
        Ok(UniformPage {
            buffer,
            staging,
            free,
            live: vec![false; self.capacity as usize],
        })
    }

    /// Release a slot back to its page. Releasing a handle that is not
    /// live is a contract violation: checked in debug builds, logged and
    /// ignored in release builds.
    pub fn release(&mut self, handle: SlotHandle) {
        let Some(page) = self.pages.get_mut(handle.page() as usize) else {
            debug_assert!(false, "release of handle with unknown page");
            log::error!("arena: release of unknown page {}", handle.page());
            return;
        };
        let slot = handle.slot() as usize;
        if !page.live[slot] {
            debug_assert!(false, "double release of uniform slot");
            log::error!(
                "arena: double release of slot {} on page {}",
                slot,
                handle.page()
            );
            return;
        }
        page.live[slot] = false;
        page.free.push(handle.slot());
        self.live_slots -= 1;
    }

    /// Write every instance's transform record into its slot. Mapped pages
    /// get direct writes plus one flush per touched page; staged pages get
    /// staging writes plus one batched copy command per touched page,
    /// recorded into `commands` (which must still be recording and outside
    /// any render pass).
    pub fn publish(&mut self, draws: &[DrawInstance], commands: CommandHandle) -> RenderResult<()> {
        // (page index) -> flushed byte range or pending copy regions.
        let mut touched: HashMap<usize, (u64, u64)> = HashMap::new();
        let mut copies: HashMap<usize, Vec<CopyRegion>> = HashMap::new();

        for draw in draws {
            let page_index = draw.slot.page() as usize;
            let slot = draw.slot.slot() as usize;
            let Some(page) = self.pages.get(page_index) else {
                debug_assert!(false, "publish of handle with unknown page");
                log::error!("arena: publish of unknown page {}", page_index);
                continue;
            };
            if !page.live[slot] {
                debug_assert!(false, "publish of a released slot");
                log::error!("arena: publish of released slot {} on page {}", slot, page_index);
                continue;
            }

            let record = ObjectUniform::from_transform(draw.transform);
            let data = bytemuck::bytes_of(&record);
            let slot_offset = slot as u64 * self.slot_size;

            match self.mode {
                PublishMode::Mapped => {
                    self.device.write_memory(
                        page.buffer.memory(),
                        page.buffer.base_offset() + slot_offset,
                        data,
                    )?;
                    let range = touched
                        .entry(page_index)
                        .or_insert((slot_offset, slot_offset + self.slot_size));
                    range.0 = range.0.min(slot_offset);
                    range.1 = range.1.max(slot_offset + self.slot_size);
                }
                PublishMode::Staged => {
                    let staging = page.staging.as_ref().expect("staged page has staging");
                    self.device.write_memory(
                        staging.memory(),
                        staging.base_offset() + slot_offset,
                        data,
                    )?;
                    copies.entry(page_index).or_default().push(CopyRegion {
                        src_offset: slot_offset,
                        dst_offset: slot_offset,
                        size: self.slot_size,
                    });
                }
            }
        }

        for (page_index, (start, end)) in touched {
            let buffer = &self.pages[page_index].buffer;
            self.device
                .flush_memory(buffer.memory(), buffer.base_offset() + start, end - start)?;
        }
        for (page_index, regions) in copies {
            let page = &self.pages[page_index];
            let staging = page.staging.as_ref().expect("staged page has staging");
            self.device
                .cmd_copy_buffer(commands, staging.handle(), page.buffer.handle(), &regions);
        }
        Ok(())
    }

    /// Read a live slot's current bytes back from its page. Readback/debug
    /// helper; backs the publish round-trip tests.
    pub fn read_slot(&self, handle: SlotHandle) -> RenderResult<Vec<u8>> {
        let page = self
            .pages
            .get(handle.page() as usize)
            .ok_or(RenderError::ContractViolation("read of unknown page"))?;
        if !page.live[handle.slot() as usize] {
            return Err(RenderError::ContractViolation("read of released slot"));
        }
        let mut out = vec![0u8; self.slot_size as usize];
        self.device.read_memory(
            page.buffer.memory(),
            page.buffer.base_offset() + handle.slot() as u64 * self.slot_size,
            &mut out,
        )?;
        Ok(out)
    }

    /// The backing buffer of one page, for binding-table creation.
    pub fn page_buffer(&self, page: u32) -> Option<BufferHandle> {
        self.pages.get(page as usize).map(|p| p.buffer.handle())
    }

    /// Bytes per page.
    pub fn page_bytes(&self) -> u64 {
        self.slot_size * self.capacity as u64
    }

    /// Number of pages created so far.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Current arena state.
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            pages: self.pages.len(),
            live_slots: self.live_slots,
            slot_size: self.slot_size,
            page_capacity: self.capacity,
        }
    }

    /// Release every page's buffers. Must run after the device is idle.
    pub fn destroy(&mut self, factory: &BufferFactory, allocator: &mut dyn DeviceAllocator) {
        if self.live_slots > 0 {
            log::warn!("arena: destroyed with {} live slots", self.live_slots);
        }
        for page in self.pages.drain(..) {
            factory.destroy(allocator, page.buffer);
            if let Some(staging) = page.staging {
                factory.destroy(allocator, staging);
            }
        }
        self.live_slots = 0;
    }
}

impl Drop for UniformArena {
    fn drop(&mut self) {
        if !self.pages.is_empty() {
            log::warn!(
                "arena: dropped with {} pages still allocated (destroy not called)",
                self.pages.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::device::dummy::DummyDevice;
    use crate::memory::PoolAllocator;

    struct Fixture {
        factory: BufferFactory,
        allocator: PoolAllocator,
        arena: UniformArena,
    }

    fn fixture(publish: PublishStrategy, page_capacity: u32) -> Fixture {
        let device: Arc<dyn RenderDevice> = Arc::new(DummyDevice::new());
        let config = RendererConfig::default()
            .with_publish(publish)
            .with_page_capacity(page_capacity);
        Fixture {
            factory: BufferFactory::new(device.clone()),
            allocator: PoolAllocator::new(device.clone(), PoolConfig::default()),
            arena: UniformArena::new(device, &config),
        }
    }

    impl Fixture {
        fn acquire(&mut self) -> (SlotHandle, bool) {
            self.arena
                .acquire(&self.factory, &mut self.allocator)
                .unwrap()
        }

        fn teardown(mut self) {
            self.arena.destroy(&self.factory, &mut self.allocator);
        }
    }

    #[test]
    fn test_slot_size_respects_alignment() {
        let fx = fixture(PublishStrategy::Mapped, 16);
        // DummyDevice reports 256-byte uniform alignment; the 128-byte
        // record rounds up.
        assert_eq!(fx.arena.stats().slot_size, 256);
        fx.teardown();
    }

    #[test]
    fn test_first_acquire_creates_page() {
        let mut fx = fixture(PublishStrategy::Mapped, 16);
        let (handle, is_new_page) = fx.acquire();
        assert!(is_new_page);
        assert_eq!(handle.page(), 0);
        assert_eq!(fx.arena.page_count(), 1);
        fx.teardown();
    }

    #[test]
    fn test_live_handles_never_alias() {
        let mut fx = fixture(PublishStrategy::Mapped, 8);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            let (handle, _) = fx.acquire();
            assert!(seen.insert((handle.page(), handle.slot())));
        }
        fx.teardown();
    }

    #[test]
    fn test_three_hundred_acquires_make_two_pages() {
        let mut fx = fixture(PublishStrategy::Mapped, 256);
        let mut new_pages = Vec::new();
        for _ in 0..300 {
            let (_, is_new_page) = fx.acquire();
            new_pages.push(is_new_page);
        }
        assert_eq!(fx.arena.page_count(), 2);
        assert!(new_pages[0]);
        assert!(new_pages[1..256].iter().all(|&n| !n));
        assert!(new_pages[256]);
        assert!(new_pages[257..].iter().all(|&n| !n));
        fx.teardown();
    }

    #[test]
    fn test_released_slots_are_reused_before_growth() {
        let mut fx = fixture(PublishStrategy::Mapped, 4);
        let handles: Vec<_> = (0..4).map(|_| fx.acquire().0).collect();
        assert_eq!(fx.arena.page_count(), 1);

        let released: Vec<_> = handles.iter().map(|h| (h.page(), h.slot())).collect();
        for handle in handles {
            fx.arena.release(handle);
        }

        for _ in 0..4 {
            let (handle, is_new_page) = fx.acquire();
            assert!(!is_new_page);
            assert!(released.contains(&(handle.page(), handle.slot())));
        }
        assert_eq!(fx.arena.page_count(), 1);
        fx.teardown();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double release")]
    fn test_double_release_is_checked() {
        let mut fx = fixture(PublishStrategy::Mapped, 4);
        let (handle, _) = fx.acquire();
        fx.arena.release(handle);
        fx.arena.release(handle);
    }

    fn publish_roundtrip(publish: PublishStrategy) {
        let mut fx = fixture(publish, 8);
        let (handle, _) = fx.acquire();

        let model = Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0));
        let draw = DrawInstance {
            entity: 7,
            slot: handle,
            mesh: crate::device::traits::MeshRef {
                vertex: crate::device::traits::BufferHandle(0),
                index: crate::device::traits::BufferHandle(0),
                index_count: 0,
            },
            transform: model,
        };
        fx.arena.publish(&[draw], CommandHandle(0)).unwrap();

        let bytes = fx.arena.read_slot(handle).unwrap();
        let expected = ObjectUniform::from_transform(model);
        assert_eq!(
            &bytes[..std::mem::size_of::<ObjectUniform>()],
            bytemuck::bytes_of(&expected)
        );
        fx.teardown();
    }

    #[test]
    fn test_publish_roundtrip_mapped() {
        publish_roundtrip(PublishStrategy::Mapped);
    }

    #[test]
    fn test_publish_roundtrip_staged() {
        publish_roundtrip(PublishStrategy::Staged);
    }
}
