//! Synchronization primitives.
//!
//! Provides thin wrappers over std or parking_lot mutexes. Device backends
//! need interior mutability because `RenderDevice` methods take `&self`.

pub(crate) mod mutex;
