//! Error taxonomy for the resource managers and the frame loop.
//!
//! Two categories bubble up to callers: [`RenderError::ResourceExhausted`]
//! and [`RenderError::SyncTimeout`]. A stale surface is recovered internally
//! by the frame scheduler and only escapes if the rebuild path cannot
//! converge. Contract violations (released handle reuse, double release) are
//! preconditions: they abort in debug builds and are logged and ignored in
//! release builds - callers must not rely on recovery.

use thiserror::Error;

/// Errors produced by the GPU resource core.
#[derive(Debug, Error)]
pub enum RenderError {
    /// Device memory or device object limits reached. Fatal to the
    /// triggering request; never silently retried with a smaller size.
    #[error("device out of memory (requested {requested} bytes)")]
    ResourceExhausted {
        /// Bytes requested when the device refused.
        requested: u64,
    },

    /// No device memory type satisfies the requested profile.
    #[error("no compatible memory type (type bits {type_bits:#x})")]
    NoCompatibleMemory {
        /// Memory-type bits reported by the buffer requirements query.
        type_bits: u32,
    },

    /// A fence wait exceeded its bound. Indicates a GPU hang or driver
    /// fault; fatal, never retried.
    #[error("fence wait exceeded {waited_ns} ns")]
    SyncTimeout {
        /// The bound that was exceeded, in nanoseconds.
        waited_ns: u64,
    },

    /// The presentation surface needs rebuilding. Recovered internally; a
    /// caller only sees this if the surface stays stale across a rebuild.
    #[error("presentation surface is stale")]
    StaleSurface,

    /// A caller broke a documented precondition.
    #[error("contract violation: {0}")]
    ContractViolation(&'static str),

    /// Backend-specific fault, opaque to this layer.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Convenience alias used throughout the crate.
pub type RenderResult<T> = Result<T, RenderError>;
