//! Binding tables for arena pages.
//!
//! One table per uniform page, created lazily as the arena grows and bound
//! to the page's full buffer range. Tables are append-only until shutdown:
//! a frame still in flight may reference any existing table by page index,
//! so nothing is destroyed mid-run.

use std::sync::Arc;

use crate::arena::UniformArena;
use crate::device::traits::{RenderDevice, TableHandle};
use crate::error::RenderResult;

/// Owns the per-page binding tables.
pub struct DescriptorBinder {
    device: Arc<dyn RenderDevice>,
    tables: Vec<TableHandle>,
}

impl DescriptorBinder {
    pub fn new(device: Arc<dyn RenderDevice>) -> Self {
        Self {
            device,
            tables: Vec::new(),
        }
    }

    /// Create tables for any arena pages not yet covered. Called once per
    /// frame before recording; a no-op when the arena has not grown.
    pub fn sync_pages(&mut self, arena: &UniformArena) -> RenderResult<()> {
        while self.tables.len() < arena.page_count() {
            let page = self.tables.len() as u32;
            let buffer = arena
                .page_buffer(page)
                .expect("page index below page_count");
            let table = self.device.create_binding_table(buffer, arena.page_bytes())?;
            log::debug!("binder: created table for page {}", page);
            self.tables.push(table);
        }
        Ok(())
    }

    /// The table for a page, if one has been created.
    pub fn table_for(&self, page: u32) -> Option<TableHandle> {
        self.tables.get(page as usize).copied()
    }

    /// Number of tables created so far.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Destroy every table. Must run after the device is idle.
    pub fn destroy(&mut self) {
        for table in self.tables.drain(..) {
            self.device.destroy_binding_table(table);
        }
    }
}

impl Drop for DescriptorBinder {
    fn drop(&mut self) {
        if !self.tables.is_empty() {
            log::warn!(
                "binder: dropped with {} live tables (destroy not called)",
                self.tables.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferFactory;
    use crate::config::{PoolConfig, PublishStrategy, RendererConfig};
    use crate::device::dummy::DummyDevice;
    use crate::memory::PoolAllocator;

    #[test]
    fn test_sync_creates_one_table_per_page() {
        let device = Arc::new(DummyDevice::new());
        let factory = BufferFactory::new(device.clone());
        let mut allocator = PoolAllocator::new(device.clone(), PoolConfig::default());
        let config = RendererConfig::default()
            .with_page_capacity(4)
            .with_publish(PublishStrategy::Mapped);
        let mut arena = UniformArena::new(device.clone(), &config);
        let mut binder = DescriptorBinder::new(device.clone());

        binder.sync_pages(&arena).unwrap();
        assert_eq!(binder.table_count(), 0);
        assert!(binder.table_for(0).is_none());

        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(arena.acquire(&factory, &mut allocator).unwrap().0);
        }
        assert_eq!(arena.page_count(), 2);

        binder.sync_pages(&arena).unwrap();
        assert_eq!(binder.table_count(), 2);
        assert!(binder.table_for(0).is_some());
        assert!(binder.table_for(1).is_some());
        assert_eq!(device.live_table_count(), 2);

        // Re-sync without growth changes nothing.
        let before = binder.table_for(0).unwrap();
        binder.sync_pages(&arena).unwrap();
        assert_eq!(binder.table_count(), 2);
        assert_eq!(binder.table_for(0).unwrap(), before);

        binder.destroy();
        assert_eq!(device.live_table_count(), 0);
        for handle in handles {
            arena.release(handle);
        }
        arena.destroy(&factory, &mut allocator);
    }
}
