//! Render device abstraction.
//!
//! `traits` defines the backend-agnostic interface, `dummy` is a
//! CPU-simulated backend for tests and headless runs, and `vulkan` (behind
//! the `gpu-vulkan` feature) is the real one.

pub mod dummy;
pub mod traits;

#[cfg(feature = "gpu-vulkan")]
pub mod vulkan;

pub use dummy::DummyDevice;
pub use traits::{
    AcquireOutcome, BufferHandle, BufferUsage, CommandHandle, CopyRegion, DeviceLimits, Extent,
    FenceHandle, FrameSync, MemoryHandle, MemoryProfile, MemoryRequirements, MeshRef,
    PresentOutcome, RenderDevice, SemaphoreHandle, TableHandle, TargetHandle,
};
