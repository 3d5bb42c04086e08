//! Render device trait and shared device-facing types.
//!
//! This module defines the device interface WITHOUT pulling in any
//! backend-specific dependencies. The allocators, the uniform arena, the
//! descriptor binder and the frame scheduler all talk to `dyn RenderDevice`,
//! so every one of them can run against the CPU-simulated backend in tests.
//!
//! Handles are opaque u64 newtypes. Backends decide what rides inside them
//! (the Vulkan backend stores raw vk handles directly).

use crate::error::RenderResult;

/// Handle to one physical device memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryHandle(pub u64);

/// Handle to a device buffer object (unbound until
/// [`RenderDevice::bind_buffer_memory`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Handle to a GPU-side binding table (descriptor set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableHandle(pub u64);

/// Handle to a GPU-GPU synchronization primitive (semaphore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreHandle(pub u64);

/// Handle to a CPU-waitable fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub u64);

/// Handle to a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandHandle(pub u64);

/// Handle to a render target (image view + framebuffer for one presentable
/// image, or the shared depth target).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetHandle(pub u64);

/// Surface dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

/// Device limits read once at startup.
#[derive(Debug, Clone, Copy)]
pub struct DeviceLimits {
    /// Minimum addressable alignment for uniform-buffer offsets. Uniform
    /// slot sizes are rounded up to this.
    pub min_uniform_alignment: u64,

    /// Number of memory types the device reports.
    pub memory_type_count: u32,
}

/// Result of a buffer requirements query.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRequirements {
    /// Required backing size (may exceed the buffer's logical size).
    pub size: u64,

    /// Required offset alignment.
    pub alignment: u64,

    /// Bitmask of memory types the buffer may be bound to.
    pub memory_type_bits: u32,
}

/// Which side of the bus the memory should favor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryProfile {
    /// GPU-only access, fastest for shaders.
    DeviceLocal,
    /// CPU can map and write, GPU can read.
    HostVisible,
}

/// Buffer usage flags. Bit values match the Vulkan buffer usage bits so the
/// Vulkan backend can pass them through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferUsage {
    pub bits: u32,
}

impl BufferUsage {
    pub const TRANSFER_SRC: Self = Self { bits: 0x0001 };
    pub const TRANSFER_DST: Self = Self { bits: 0x0002 };
    pub const UNIFORM_BUFFER: Self = Self { bits: 0x0010 };
    pub const STORAGE_BUFFER: Self = Self { bits: 0x0020 };
    pub const INDEX_BUFFER: Self = Self { bits: 0x0040 };
    pub const VERTEX_BUFFER: Self = Self { bits: 0x0080 };

    /// Whether all of `other`'s bits are set.
    pub fn contains(self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            bits: self.bits | rhs.bits,
        }
    }
}

/// One region of a buffer-to-buffer copy.
#[derive(Debug, Clone, Copy)]
pub struct CopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// The synchronization bundle for one in-flight frame: the "image acquired"
/// and "render finished" semaphores, the fence guarding command buffer
/// reuse, and the command buffer itself.
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    pub acquired: SemaphoreHandle,
    pub finished: SemaphoreHandle,
    pub fence: FenceHandle,
    pub commands: CommandHandle,
}

/// Outcome of an image acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is ready for rendering.
    Ready { image_index: u32 },
    /// The surface chain no longer matches the surface (resize or
    /// suboptimal); it must be rebuilt before rendering.
    Stale,
}

/// Outcome of a present request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// The image was queued for presentation.
    Presented,
    /// The image was presented but the chain should be rebuilt before the
    /// next frame.
    Stale,
}

/// Opaque mesh geometry handles, uploaded by an external asset path. This
/// layer binds them for drawing and never looks inside.
#[derive(Debug, Clone, Copy)]
pub struct MeshRef {
    pub vertex: BufferHandle,
    pub index: BufferHandle,
    pub index_count: u32,
}

/// The device operations the resource core needs, and nothing more.
///
/// Methods take `&self`; backends use interior mutability. All handle
/// lifetimes are manual: every `create_*`/`allocate_*` has a matching
/// destroy/free the owner must call, after waiting for the device to go
/// idle if the handle may still be referenced by in-flight work.
pub trait RenderDevice: Send + Sync {
    // --- Queries ---------------------------------------------------------

    /// Device limits, stable for the device's lifetime.
    fn limits(&self) -> DeviceLimits;

    /// Pick a memory type out of `type_bits` matching `profile`.
    fn find_memory_type(&self, type_bits: u32, profile: MemoryProfile) -> Option<u32>;

    /// Whether a memory type is CPU-mappable.
    fn is_host_visible(&self, memory_type: u32) -> bool;

    // --- Device memory ---------------------------------------------------

    /// Allocate one physical block of device memory.
    fn allocate_memory(&self, memory_type: u32, size: u64) -> RenderResult<MemoryHandle>;

    /// Free a block. The caller guarantees nothing references it.
    fn free_memory(&self, memory: MemoryHandle);

    /// Write `data` into host-visible memory at `offset`. Errors on
    /// non-host-visible memory.
    fn write_memory(&self, memory: MemoryHandle, offset: u64, data: &[u8]) -> RenderResult<()>;

    /// Read bytes back from device memory at `offset`. Backends may
    /// restrict this to host-visible memory; the CPU backend allows all
    /// reads, which is what the publish round-trip tests rely on.
    fn read_memory(&self, memory: MemoryHandle, offset: u64, out: &mut [u8]) -> RenderResult<()>;

    /// Flush a written range of non-coherent host-visible memory.
    fn flush_memory(&self, memory: MemoryHandle, offset: u64, size: u64) -> RenderResult<()>;

    // --- Buffers ---------------------------------------------------------

    /// Create an unbound buffer object.
    fn create_buffer(&self, size: u64, usage: BufferUsage) -> RenderResult<BufferHandle>;

    /// Query backing requirements for a buffer.
    fn buffer_requirements(&self, buffer: BufferHandle) -> MemoryRequirements;

    /// Bind a buffer to memory at `offset`.
    fn bind_buffer_memory(
        &self,
        buffer: BufferHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> RenderResult<()>;

    /// Destroy a buffer object (not its memory).
    fn destroy_buffer(&self, buffer: BufferHandle);

    // --- Binding tables --------------------------------------------------

    /// Create a binding table referencing `buffer`'s first `range` bytes.
    fn create_binding_table(&self, buffer: BufferHandle, range: u64) -> RenderResult<TableHandle>;

    /// Destroy a binding table.
    fn destroy_binding_table(&self, table: TableHandle);

    // --- Synchronization -------------------------------------------------

    /// Create the sync bundle for one in-flight frame. The fence starts
    /// signaled so the first wait on it passes.
    fn create_frame_sync(&self) -> RenderResult<FrameSync>;

    /// Destroy a frame's sync bundle.
    fn destroy_frame_sync(&self, sync: &FrameSync);

    /// Wait for a fence with a bound. Exceeding the bound returns
    /// [`crate::RenderError::SyncTimeout`].
    fn wait_fence(&self, fence: FenceHandle, timeout_ns: u64) -> RenderResult<()>;

    /// Reset a fence to unsignaled.
    fn reset_fence(&self, fence: FenceHandle) -> RenderResult<()>;

    /// Block until the device has finished all submitted work.
    fn wait_idle(&self) -> RenderResult<()>;

    // --- Command recording -----------------------------------------------

    /// Reset and begin recording a command buffer.
    fn begin_commands(&self, commands: CommandHandle) -> RenderResult<()>;

    /// Finish recording.
    fn end_commands(&self, commands: CommandHandle) -> RenderResult<()>;

    /// Record a buffer-to-buffer copy.
    fn cmd_copy_buffer(
        &self,
        commands: CommandHandle,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[CopyRegion],
    );

    /// Begin the forward render pass against one presentable image.
    fn cmd_begin_pass(&self, commands: CommandHandle, target: TargetHandle, extent: Extent);

    /// Bind the graphics pipeline.
    fn cmd_bind_pipeline(&self, commands: CommandHandle);

    /// Bind a uniform binding table.
    fn cmd_bind_table(&self, commands: CommandHandle, table: TableHandle);

    /// Push a slot index as an inline constant so the shader can select
    /// the right uniform record.
    fn cmd_push_slot(&self, commands: CommandHandle, slot: u32);

    /// Record an indexed draw of `mesh`.
    fn cmd_draw(&self, commands: CommandHandle, mesh: &MeshRef);

    /// End the render pass.
    fn cmd_end_pass(&self, commands: CommandHandle);

    // --- Surface chain ---------------------------------------------------

    /// Current surface extent.
    fn surface_extent(&self) -> Extent;

    /// Number of presentable images (K, the frames-in-flight depth).
    fn image_count(&self) -> u32;

    /// Tear down and recreate the presentable image set against the
    /// current surface. Returns the new image count and extent. The caller
    /// has already waited for device idle and destroyed all render targets.
    fn recreate_surface(&self) -> RenderResult<(u32, Extent)>;

    /// Create the render target for one presentable image.
    fn create_render_target(&self, image_index: u32, extent: Extent) -> RenderResult<TargetHandle>;

    /// Create the shared depth target.
    fn create_depth_target(&self, extent: Extent) -> RenderResult<TargetHandle>;

    /// Destroy a render or depth target.
    fn destroy_render_target(&self, target: TargetHandle);

    /// Request the next presentable image, signalling `acquired` when it
    /// is ready.
    fn acquire_image(&self, acquired: SemaphoreHandle) -> RenderResult<AcquireOutcome>;

    /// Submit a command buffer: wait on `wait`, signal `signal` and
    /// `fence` on completion.
    fn submit(
        &self,
        commands: CommandHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> RenderResult<()>;

    /// Present an acquired image, waiting on `wait`.
    fn present(&self, image_index: u32, wait: SemaphoreHandle) -> RenderResult<PresentOutcome>;
}
