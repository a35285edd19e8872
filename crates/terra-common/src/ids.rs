//! ID types for fragments, sources and GPU-side resources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for texture handles handed out by backends that have no
/// native handle space of their own.
static TEXTURE_HANDLE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier of a mesh fragment, stable across frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FragmentId(u64);

impl FragmentId {
    /// Creates a fragment ID from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fragment#{}", self.0)
    }
}

/// Identifier of a texture dataset (one tile source).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceId(u16);

impl SourceId {
    /// Creates a source ID from a raw value.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// Identifier of a tile inside a source's tile matrix set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileId {
    /// Tile matrix (pyramid level)
    pub matrix: u32,
    /// Column in the matrix
    pub x: i64,
    /// Row in the matrix
    pub y: i64,
}

impl TileId {
    /// Creates a new tile ID.
    #[must_use]
    pub const fn new(matrix: u32, x: i64, y: i64) -> Self {
        Self { matrix, x, y }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.matrix, self.x, self.y)
    }
}

/// Handle of a texture object living in GPU memory.
///
/// Only the render thread creates or frees these; the value itself is inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextureHandle(u64);

impl TextureHandle {
    /// Wraps a backend-native handle value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Allocates a process-unique handle value.
    #[must_use]
    pub fn allocate() -> Self {
        Self(TEXTURE_HANDLE_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw handle value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Identifier of a compositing shader program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShaderId(u32);

impl ShaderId {
    /// Creates a shader ID from a raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocated_handles_are_unique() {
        let a = TextureHandle::allocate();
        let b = TextureHandle::allocate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fragment_ids_order_by_raw_value() {
        assert!(FragmentId::new(1) < FragmentId::new(2));
    }

    #[test]
    fn test_tile_id_display() {
        assert_eq!(TileId::new(3, 4, -1).to_string(), "3/4/-1");
    }
}
