//! Vulkan backend for the render device trait, using the ash crate.
//!
//! The backend is constructed from externally created core objects
//! (instance, device, surface, queue, pipeline layout, set layout) and owns
//! everything chain- and pool-shaped: the swapchain, the render pass, the
//! command pool and the descriptor pool. The graphics pipeline itself is
//! built by the caller against [`VulkanDevice::render_pass`] and installed
//! with [`VulkanDevice::install_pipeline`], since shader and pipeline
//! construction live outside this crate.

mod device;

pub use device::{VulkanContext, VulkanDevice};
