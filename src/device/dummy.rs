//! CPU-simulated render device for tests and headless runs.
//!
//! Storage is plain `Vec<u8>`; no GPU hardware is required. The simulated
//! queue is immediate-mode: a submit signals its fence at once and recorded
//! buffer copies execute when recorded, so everything the frame loop
//! observes (fence order, publish results, stale surfaces) is deterministic.
//!
//! Two memory types are modeled: type 0 is device-local (writes through
//! [`RenderDevice::write_memory`] are rejected, forcing the staged publish
//! path), type 1 is host-visible.

use std::collections::{HashMap, HashSet};

use crate::error::{RenderError, RenderResult};
use crate::sync::mutex::Mutex;

use super::traits::*;

/// The simulated device-local memory type index.
pub const DEVICE_LOCAL_TYPE: u32 = 0;
/// The simulated host-visible memory type index.
pub const HOST_VISIBLE_TYPE: u32 = 1;

struct MemoryRecord {
    bytes: Vec<u8>,
    memory_type: u32,
}

struct BufferRecord {
    size: u64,
    #[allow(dead_code)]
    usage: BufferUsage,
    bound: Option<(MemoryHandle, u64)>,
}

struct SurfaceState {
    extent: Extent,
    image_count: u32,
    next_image: u32,
    stale: bool,
    /// Turn stale only after the next successful acquire, so the staleness
    /// is first observed at present time.
    stale_after_acquire: bool,
    pending_extent: Option<Extent>,
}

struct DummyState {
    next_id: u64,
    memories: HashMap<u64, MemoryRecord>,
    buffers: HashMap<u64, BufferRecord>,
    tables: HashMap<u64, (BufferHandle, u64)>,
    fences: HashMap<u64, bool>,
    semaphores: HashSet<u64>,
    commands: HashMap<u64, bool>,
    targets: HashSet<u64>,
    surface: SurfaceState,
    submits: u64,
    /// The next allocate_memory call fails with ResourceExhausted.
    fail_next_allocation: bool,
    /// Submits stop signalling their fence, as a hung queue would.
    stalled: bool,
}

impl DummyState {
    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// A render device simulated in RAM.
pub struct DummyDevice {
    state: Mutex<DummyState>,
    limits: DeviceLimits,
}

impl DummyDevice {
    /// Create a device with a 1280x720 surface and three presentable images.
    pub fn new() -> Self {
        Self::with_surface(
            Extent {
                width: 1280,
                height: 720,
            },
            3,
        )
    }

    /// Create a device with an explicit surface shape.
    pub fn with_surface(extent: Extent, image_count: u32) -> Self {
        Self {
            state: Mutex::new(DummyState {
                next_id: 0,
                memories: HashMap::new(),
                buffers: HashMap::new(),
                tables: HashMap::new(),
                fences: HashMap::new(),
                semaphores: HashSet::new(),
                commands: HashMap::new(),
                targets: HashSet::new(),
                surface: SurfaceState {
                    extent,
                    image_count,
                    next_image: 0,
                    stale: false,
                    stale_after_acquire: false,
                    pending_extent: None,
                },
                submits: 0,
                fail_next_allocation: false,
                stalled: false,
            }),
            limits: DeviceLimits {
                min_uniform_alignment: 256,
                memory_type_count: 2,
            },
        }
    }

    /// Simulate a window resize: every acquire and present reports the
    /// chain stale until [`RenderDevice::recreate_surface`] runs.
    pub fn invalidate_surface(&self, new_extent: Extent) {
        let mut st = self.state.lock();
        st.surface.stale = true;
        st.surface.pending_extent = Some(new_extent);
    }

    /// Simulate a resize that lands between an acquire and its present: the
    /// next acquire still succeeds, and the chain is stale from then on.
    pub fn invalidate_surface_after_acquire(&self, new_extent: Extent) {
        let mut st = self.state.lock();
        st.surface.stale_after_acquire = true;
        st.surface.pending_extent = Some(new_extent);
    }

    /// Make the next [`RenderDevice::allocate_memory`] call fail as if the
    /// device were out of memory. One-shot; later calls succeed again.
    pub fn fail_next_allocation(&self) {
        self.state.lock().fail_next_allocation = true;
    }

    /// Simulate a hung queue: submits are still accepted but never signal
    /// their fence, so the next wait on a reused frame slot times out.
    pub fn stall_queue(&self) {
        self.state.lock().stalled = true;
    }

    /// Number of live device memory allocations.
    pub fn live_memory_count(&self) -> usize {
        self.state.lock().memories.len()
    }

    /// Number of live binding tables.
    pub fn live_table_count(&self) -> usize {
        self.state.lock().tables.len()
    }

    /// Total submits seen by the simulated queue.
    pub fn submit_count(&self) -> u64 {
        self.state.lock().submits
    }
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderDevice for DummyDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn find_memory_type(&self, type_bits: u32, profile: MemoryProfile) -> Option<u32> {
        let wanted = match profile {
            MemoryProfile::DeviceLocal => DEVICE_LOCAL_TYPE,
            MemoryProfile::HostVisible => HOST_VISIBLE_TYPE,
        };
        (type_bits & (1 << wanted) != 0).then_some(wanted)
    }

    fn is_host_visible(&self, memory_type: u32) -> bool {
        memory_type == HOST_VISIBLE_TYPE
    }

    fn allocate_memory(&self, memory_type: u32, size: u64) -> RenderResult<MemoryHandle> {
        let mut st = self.state.lock();
        if st.fail_next_allocation {
            st.fail_next_allocation = false;
            return Err(RenderError::ResourceExhausted { requested: size });
        }
        let id = st.fresh_id();
        st.memories.insert(
            id,
            MemoryRecord {
                bytes: vec![0u8; size as usize],
                memory_type,
            },
        );
        Ok(MemoryHandle(id))
    }

    fn free_memory(&self, memory: MemoryHandle) {
        self.state.lock().memories.remove(&memory.0);
    }

    fn write_memory(&self, memory: MemoryHandle, offset: u64, data: &[u8]) -> RenderResult<()> {
        let mut st = self.state.lock();
        let rec = st
            .memories
            .get_mut(&memory.0)
            .ok_or(RenderError::ContractViolation("write to freed memory"))?;
        if rec.memory_type != HOST_VISIBLE_TYPE {
            return Err(RenderError::ContractViolation(
                "write to non-host-visible memory",
            ));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > rec.bytes.len() {
            return Err(RenderError::ContractViolation("write past end of memory"));
        }
        rec.bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_memory(&self, memory: MemoryHandle, offset: u64, out: &mut [u8]) -> RenderResult<()> {
        let st = self.state.lock();
        let rec = st
            .memories
            .get(&memory.0)
            .ok_or(RenderError::ContractViolation("read from freed memory"))?;
        let start = offset as usize;
        let end = start + out.len();
        if end > rec.bytes.len() {
            return Err(RenderError::ContractViolation("read past end of memory"));
        }
        out.copy_from_slice(&rec.bytes[start..end]);
        Ok(())
    }

    fn flush_memory(&self, memory: MemoryHandle, offset: u64, size: u64) -> RenderResult<()> {
        let st = self.state.lock();
        let rec = st
            .memories
            .get(&memory.0)
            .ok_or(RenderError::ContractViolation("flush of freed memory"))?;
        if (offset + size) as usize > rec.bytes.len() {
            return Err(RenderError::ContractViolation("flush past end of memory"));
        }
        Ok(())
    }

    fn create_buffer(&self, size: u64, usage: BufferUsage) -> RenderResult<BufferHandle> {
        let mut st = self.state.lock();
        let id = st.fresh_id();
        st.buffers.insert(
            id,
            BufferRecord {
                size,
                usage,
                bound: None,
            },
        );
        Ok(BufferHandle(id))
    }

    fn buffer_requirements(&self, buffer: BufferHandle) -> MemoryRequirements {
        let st = self.state.lock();
        let size = st.buffers.get(&buffer.0).map(|b| b.size).unwrap_or(0);
        MemoryRequirements {
            size,
            alignment: 256,
            memory_type_bits: (1 << DEVICE_LOCAL_TYPE) | (1 << HOST_VISIBLE_TYPE),
        }
    }

    fn bind_buffer_memory(
        &self,
        buffer: BufferHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> RenderResult<()> {
        let mut st = self.state.lock();
        if !st.memories.contains_key(&memory.0) {
            return Err(RenderError::ContractViolation("bind to freed memory"));
        }
        let rec = st
            .buffers
            .get_mut(&buffer.0)
            .ok_or(RenderError::ContractViolation("bind of destroyed buffer"))?;
        if rec.bound.is_some() {
            return Err(RenderError::ContractViolation("buffer already bound"));
        }
        rec.bound = Some((memory, offset));
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.state.lock().buffers.remove(&buffer.0);
    }

    fn create_binding_table(&self, buffer: BufferHandle, range: u64) -> RenderResult<TableHandle> {
        let mut st = self.state.lock();
        if !st.buffers.contains_key(&buffer.0) {
            return Err(RenderError::ContractViolation(
                "binding table over destroyed buffer",
            ));
        }
        let id = st.fresh_id();
        st.tables.insert(id, (buffer, range));
        Ok(TableHandle(id))
    }

    fn destroy_binding_table(&self, table: TableHandle) {
        self.state.lock().tables.remove(&table.0);
    }

    fn create_frame_sync(&self) -> RenderResult<FrameSync> {
        let mut st = self.state.lock();
        let acquired = st.fresh_id();
        let finished = st.fresh_id();
        let fence = st.fresh_id();
        let commands = st.fresh_id();
        st.semaphores.insert(acquired);
        st.semaphores.insert(finished);
        // Fences start signaled so the first wait passes.
        st.fences.insert(fence, true);
        st.commands.insert(commands, false);
        Ok(FrameSync {
            acquired: SemaphoreHandle(acquired),
            finished: SemaphoreHandle(finished),
            fence: FenceHandle(fence),
            commands: CommandHandle(commands),
        })
    }

    fn destroy_frame_sync(&self, sync: &FrameSync) {
        let mut st = self.state.lock();
        st.semaphores.remove(&sync.acquired.0);
        st.semaphores.remove(&sync.finished.0);
        st.fences.remove(&sync.fence.0);
        st.commands.remove(&sync.commands.0);
    }

    fn wait_fence(&self, fence: FenceHandle, timeout_ns: u64) -> RenderResult<()> {
        let st = self.state.lock();
        match st.fences.get(&fence.0) {
            Some(true) => Ok(()),
            // The simulated queue signals at submit, so an unsignaled fence
            // can never become signaled by waiting.
            Some(false) => Err(RenderError::SyncTimeout {
                waited_ns: timeout_ns,
            }),
            None => Err(RenderError::ContractViolation("wait on destroyed fence")),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> RenderResult<()> {
        let mut st = self.state.lock();
        match st.fences.get_mut(&fence.0) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(RenderError::ContractViolation("reset of destroyed fence")),
        }
    }

    fn wait_idle(&self) -> RenderResult<()> {
        Ok(())
    }

    fn begin_commands(&self, commands: CommandHandle) -> RenderResult<()> {
        let mut st = self.state.lock();
        match st.commands.get_mut(&commands.0) {
            Some(recording) => {
                *recording = true;
                Ok(())
            }
            None => Err(RenderError::ContractViolation(
                "begin on destroyed command buffer",
            )),
        }
    }

    fn end_commands(&self, commands: CommandHandle) -> RenderResult<()> {
        let mut st = self.state.lock();
        match st.commands.get_mut(&commands.0) {
            Some(recording) => {
                *recording = false;
                Ok(())
            }
            None => Err(RenderError::ContractViolation(
                "end on destroyed command buffer",
            )),
        }
    }

    fn cmd_copy_buffer(
        &self,
        _commands: CommandHandle,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[CopyRegion],
    ) {
        // Immediate-mode queue: execute the copy as it is recorded.
        let mut st = self.state.lock();
        let Some((src_mem, src_base)) = st.buffers.get(&src.0).and_then(|b| b.bound) else {
            return;
        };
        let Some((dst_mem, dst_base)) = st.buffers.get(&dst.0).and_then(|b| b.bound) else {
            return;
        };
        for region in regions {
            let from = (src_base + region.src_offset) as usize;
            let staged: Vec<u8> = match st.memories.get(&src_mem.0) {
                Some(rec) => rec.bytes[from..from + region.size as usize].to_vec(),
                None => continue,
            };
            if let Some(rec) = st.memories.get_mut(&dst_mem.0) {
                let to = (dst_base + region.dst_offset) as usize;
                rec.bytes[to..to + staged.len()].copy_from_slice(&staged);
            }
        }
    }

    fn cmd_begin_pass(&self, _commands: CommandHandle, _target: TargetHandle, _extent: Extent) {}

    fn cmd_bind_pipeline(&self, _commands: CommandHandle) {}

    fn cmd_bind_table(&self, _commands: CommandHandle, _table: TableHandle) {}

    fn cmd_push_slot(&self, _commands: CommandHandle, _slot: u32) {}

    fn cmd_draw(&self, _commands: CommandHandle, _mesh: &MeshRef) {}

    fn cmd_end_pass(&self, _commands: CommandHandle) {}

    fn surface_extent(&self) -> Extent {
        self.state.lock().surface.extent
    }

    fn image_count(&self) -> u32 {
        self.state.lock().surface.image_count
    }

    fn recreate_surface(&self) -> RenderResult<(u32, Extent)> {
        let mut st = self.state.lock();
        if let Some(extent) = st.surface.pending_extent.take() {
            st.surface.extent = extent;
        }
        st.surface.stale = false;
        st.surface.next_image = 0;
        Ok((st.surface.image_count, st.surface.extent))
    }

    fn create_render_target(&self, _image_index: u32, _extent: Extent) -> RenderResult<TargetHandle> {
        let mut st = self.state.lock();
        let id = st.fresh_id();
        st.targets.insert(id);
        Ok(TargetHandle(id))
    }

    fn create_depth_target(&self, _extent: Extent) -> RenderResult<TargetHandle> {
        let mut st = self.state.lock();
        let id = st.fresh_id();
        st.targets.insert(id);
        Ok(TargetHandle(id))
    }

    fn destroy_render_target(&self, target: TargetHandle) {
        self.state.lock().targets.remove(&target.0);
    }

    fn acquire_image(&self, _acquired: SemaphoreHandle) -> RenderResult<AcquireOutcome> {
        let mut st = self.state.lock();
        if st.surface.stale {
            return Ok(AcquireOutcome::Stale);
        }
        let image_index = st.surface.next_image;
        st.surface.next_image = (image_index + 1) % st.surface.image_count;
        if st.surface.stale_after_acquire {
            st.surface.stale_after_acquire = false;
            st.surface.stale = true;
        }
        Ok(AcquireOutcome::Ready { image_index })
    }

    fn submit(
        &self,
        commands: CommandHandle,
        _wait: SemaphoreHandle,
        _signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> RenderResult<()> {
        let mut st = self.state.lock();
        if st.commands.get(&commands.0).copied() != Some(false) {
            return Err(RenderError::ContractViolation(
                "submit of unfinished command buffer",
            ));
        }
        if !st.fences.contains_key(&fence.0) {
            return Err(RenderError::ContractViolation("submit with destroyed fence"));
        }
        if !st.stalled {
            if let Some(signaled) = st.fences.get_mut(&fence.0) {
                *signaled = true;
            }
        }
        st.submits += 1;
        Ok(())
    }

    fn present(&self, _image_index: u32, _wait: SemaphoreHandle) -> RenderResult<PresentOutcome> {
        let st = self.state.lock();
        if st.surface.stale {
            Ok(PresentOutcome::Stale)
        } else {
            Ok(PresentOutcome::Presented)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_write_read_roundtrip() {
        let device = DummyDevice::new();
        let memory = device.allocate_memory(HOST_VISIBLE_TYPE, 1024).unwrap();

        device.write_memory(memory, 128, &[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 4];
        device.read_memory(memory, 128, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_allocation_failure_is_one_shot() {
        let device = DummyDevice::new();
        device.fail_next_allocation();

        let err = device.allocate_memory(HOST_VISIBLE_TYPE, 4096).unwrap_err();
        assert!(matches!(
            err,
            RenderError::ResourceExhausted { requested: 4096 }
        ));
        assert_eq!(device.live_memory_count(), 0);

        // The device recovers after the injected failure.
        device.allocate_memory(HOST_VISIBLE_TYPE, 4096).unwrap();
        assert_eq!(device.live_memory_count(), 1);
    }

    #[test]
    fn test_device_local_rejects_cpu_writes() {
        let device = DummyDevice::new();
        let memory = device.allocate_memory(DEVICE_LOCAL_TYPE, 1024).unwrap();

        assert!(device.write_memory(memory, 0, &[0xff]).is_err());
    }

    #[test]
    fn test_acquire_cycles_round_robin() {
        let device = DummyDevice::with_surface(
            Extent {
                width: 64,
                height: 64,
            },
            2,
        );
        let sync = device.create_frame_sync().unwrap();

        for expected in [0, 1, 0, 1] {
            match device.acquire_image(sync.acquired).unwrap() {
                AcquireOutcome::Ready { image_index } => assert_eq!(image_index, expected),
                AcquireOutcome::Stale => panic!("unexpected stale surface"),
            }
        }
    }

    #[test]
    fn test_invalidated_surface_reports_stale_until_recreated() {
        let device = DummyDevice::new();
        let sync = device.create_frame_sync().unwrap();

        device.invalidate_surface(Extent {
            width: 800,
            height: 600,
        });
        assert_eq!(
            device.acquire_image(sync.acquired).unwrap(),
            AcquireOutcome::Stale
        );

        let (count, extent) = device.recreate_surface().unwrap();
        assert_eq!(count, 3);
        assert_eq!(extent.width, 800);
        assert!(matches!(
            device.acquire_image(sync.acquired).unwrap(),
            AcquireOutcome::Ready { .. }
        ));
    }

    #[test]
    fn test_fence_starts_signaled() {
        let device = DummyDevice::new();
        let sync = device.create_frame_sync().unwrap();

        device.wait_fence(sync.fence, 1_000).unwrap();
        device.reset_fence(sync.fence).unwrap();
        assert!(device.wait_fence(sync.fence, 1_000).is_err());
    }

    #[test]
    fn test_copy_buffer_moves_bytes_between_memories() {
        let device = DummyDevice::new();

        let src_mem = device.allocate_memory(HOST_VISIBLE_TYPE, 256).unwrap();
        let dst_mem = device.allocate_memory(DEVICE_LOCAL_TYPE, 256).unwrap();
        let src = device
            .create_buffer(256, BufferUsage::TRANSFER_SRC)
            .unwrap();
        let dst = device
            .create_buffer(256, BufferUsage::TRANSFER_DST)
            .unwrap();
        device.bind_buffer_memory(src, src_mem, 0).unwrap();
        device.bind_buffer_memory(dst, dst_mem, 0).unwrap();

        device.write_memory(src_mem, 16, &[9, 8, 7]).unwrap();
        device.cmd_copy_buffer(
            CommandHandle(0),
            src,
            dst,
            &[CopyRegion {
                src_offset: 16,
                dst_offset: 64,
                size: 3,
            }],
        );

        let mut out = [0u8; 3];
        device.read_memory(dst_mem, 64, &mut out).unwrap();
        assert_eq!(out, [9, 8, 7]);
    }
}
