//! # framegpu
//!
//! Pooled GPU memory, uniform-slot arenas, and frame scheduling for Rust
//! renderers.
//!
//! ## Features
//!
//! - Device memory pooling with first-fit sub-allocation and span merging
//! - Pass-through allocator for validation-layer and lifetime debugging
//! - Paged uniform-slot arena with mapped or staged publishing
//! - Per-page binding tables, created lazily as the arena grows
//! - Frame scheduler with K frames in flight and surface-rebuild handling
//! - CPU-simulated device backend, so the whole stack runs in plain tests
//! - Vulkan backend via ash (feature `gpu-vulkan`)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use framegpu::{DummyDevice, Renderer, RendererConfig};
//!
//! let device = Arc::new(DummyDevice::new());
//! let mut renderer = Renderer::new(device, RendererConfig::default()).unwrap();
//!
//! let slot = renderer.acquire_slot().unwrap();
//!
//! // Game loop
//! renderer.run_frame(&[]).unwrap();
//!
//! renderer.release_slot(slot);
//! renderer.shutdown().unwrap();
//! ```

pub mod arena;
pub mod binder;
pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod memory;
pub mod renderer;

mod sync;
#[allow(dead_code)]
mod util;

// Re-export the public API at the crate root for convenience
pub use arena::{ArenaStats, ObjectUniform, SlotHandle, UniformArena};
pub use binder::DescriptorBinder;
pub use buffer::{BackedBuffer, BufferFactory};
pub use config::{AllocatorKind, PoolConfig, PublishStrategy, RendererConfig};
pub use device::dummy::DummyDevice;
pub use device::traits::{
    AcquireOutcome, BufferHandle, BufferUsage, DeviceLimits, Extent, MemoryProfile, MeshRef,
    PresentOutcome, RenderDevice,
};
pub use error::{RenderError, RenderResult};
pub use frame::{DrawInstance, FrameScheduler, FrameState, FrameStats};
pub use memory::{
    create_allocator, AllocUsage, Allocation, DeviceAllocator, PassThroughAllocator,
    PoolAllocator, PoolStats,
};
pub use renderer::Renderer;

#[cfg(feature = "gpu-vulkan")]
pub use device::vulkan::{VulkanContext, VulkanDevice};
