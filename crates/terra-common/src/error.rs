//! Error types for Terra.

use thiserror::Error;

use crate::ids::{FragmentId, SourceId};

/// Top-level error type for residency operations.
#[derive(Debug, Error)]
pub enum TerraError {
    /// Tile source errors
    #[error("Tile source error: {0}")]
    Source(#[from] SourceError),

    /// Geometry backing store errors
    #[error("Geometry error: {0}")]
    Geometry(#[from] GeometryError),

    /// GPU-related errors
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    /// LOD selection errors
    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else that breaks frame preparation
    #[error("Frame preparation failed: {0}")]
    Frame(String),
}

impl TerraError {
    /// Returns true for the I/O and timeout classes that only cost one
    /// fragment or texture for the current frame.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Source(_) | Self::Geometry(_) | Self::Io(_))
    }
}

/// Tile source errors.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Reading or decoding a tile failed
    #[error("{source_id}: tile read failed: {reason}")]
    Io {
        /// Failing source
        source_id: SourceId,
        /// Description of the failure
        reason: String,
    },

    /// Source did not answer before the fetch deadline
    #[error("{source_id}: no answer within {millis} ms")]
    Timeout {
        /// Failing source
        source_id: SourceId,
        /// Deadline that elapsed
        millis: u64,
    },

    /// Source code panicked on a fetch worker
    #[error("{source_id}: fetch worker panicked: {message}")]
    Panicked {
        /// Failing source
        source_id: SourceId,
        /// Panic payload, if it was a string
        message: String,
    },

    /// The shared fetch pool is gone
    #[error("fetch pool is shut down")]
    PoolClosed,
}

/// Geometry backing store errors.
#[derive(Debug, Error)]
pub enum GeometryError {
    /// Some fragments could not be made resident
    #[error("failed to acquire {} fragment(s): {reason}", fragments.len())]
    AcquireFailed {
        /// Fragments that are not resident
        fragments: Vec<FragmentId>,
        /// Description of the failure
        reason: String,
    },

    /// Fragment unknown to the backing store
    #[error("unknown fragment {0}")]
    Unknown(FragmentId),
}

/// GPU-specific errors.
#[derive(Debug, Error)]
pub enum GpuError {
    /// Texture upload failed
    #[error("Texture upload failed: {0}")]
    UploadFailed(String),

    /// Out of texture memory
    #[error("Out of texture memory: {requested} bytes requested")]
    OutOfMemory {
        /// Size of the failed allocation
        requested: usize,
    },
}

/// LOD selection errors.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Mesh hierarchy could not be read
    #[error("Mesh hierarchy unavailable: {0}")]
    Unavailable(String),

    /// View parameters cannot be used for selection
    #[error("Invalid view: {0}")]
    InvalidView(String),
}

/// Result type alias for residency operations.
pub type TerraResult<T> = Result<T, TerraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_failed_message_counts_fragments() {
        let err = GeometryError::AcquireFailed {
            fragments: vec![FragmentId::new(1), FragmentId::new(2)],
            reason: "disk".to_string(),
        };
        assert_eq!(err.to_string(), "failed to acquire 2 fragment(s): disk");
    }

    #[test]
    fn test_frame_errors_are_not_recoverable() {
        assert!(!TerraError::Frame("boom".to_string()).is_recoverable());
        let gpu: TerraError = GpuError::UploadFailed("x".to_string()).into();
        assert!(!gpu.is_recoverable());
    }
}
