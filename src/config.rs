//! Renderer configuration.

use crate::util::size::mb;

/// Memory pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Granularity every request is rounded up to. Some hardware reports a
    /// buffer-image granularity of 1, which is unusable as a real page size,
    /// so a fixed constant is used instead of the device query.
    pub page_granularity: u64,

    /// Smallest device block the pool will carve from (default: 4 MB).
    pub min_block_size: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            page_granularity: 1024,
            min_block_size: mb(4),
        }
    }
}

/// Which allocator strategy backs buffer and image memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind {
    /// Sub-allocate from pooled device blocks (the production strategy).
    Pooled,
    /// One dedicated device allocation per request. No pooling; useful for
    /// validation-layer runs and for isolating lifetime bugs.
    PassThrough,
}

/// How the uniform arena moves slot data to the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStrategy {
    /// Pick from the device capability query at startup: mapped writes if a
    /// host-visible uniform memory type exists, staged copies otherwise.
    Auto,
    /// Force direct mapped writes plus a per-page flush.
    Mapped,
    /// Force a host-visible staging buffer plus batched per-page copies.
    Staged,
}

/// Configuration for the renderer core.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Memory pool tuning.
    pub pool: PoolConfig,

    /// Allocator strategy, chosen once at startup.
    pub allocator: AllocatorKind,

    /// Uniform slots per arena page (default: 256).
    pub page_capacity: u32,

    /// How the arena publishes slot data.
    pub publish: PublishStrategy,

    /// Bound on any single fence wait (default: 1 s). Exceeding it is fatal.
    pub fence_timeout_ns: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            allocator: AllocatorKind::Pooled,
            page_capacity: 256,
            publish: PublishStrategy::Auto,
            fence_timeout_ns: 1_000_000_000,
        }
    }
}

impl RendererConfig {
    /// Create a minimal config for tests or constrained environments.
    pub fn minimal() -> Self {
        Self {
            pool: PoolConfig {
                page_granularity: 1024,
                min_block_size: mb(1),
            },
            page_capacity: 64,
            ..Self::default()
        }
    }

    /// Builder pattern: set the allocator strategy.
    pub fn with_allocator(mut self, kind: AllocatorKind) -> Self {
        self.allocator = kind;
        self
    }

    /// Builder pattern: set the arena page capacity.
    pub fn with_page_capacity(mut self, capacity: u32) -> Self {
        self.page_capacity = capacity;
        self
    }

    /// Builder pattern: set the publish strategy.
    pub fn with_publish(mut self, publish: PublishStrategy) -> Self {
        self.publish = publish;
        self
    }

    /// Builder pattern: set the fence wait bound.
    pub fn with_fence_timeout_ns(mut self, timeout: u64) -> Self {
        self.fence_timeout_ns = timeout;
        self
    }
}
