//! # Terra Common
//!
//! Common types shared by the Terra terrain streaming crates.
//!
//! This crate provides foundational types used across all Terra subsystems:
//! - ID types (FragmentId, SourceId, TextureHandle, ...)
//! - Bounding boxes in world space
//! - The error taxonomy of the residency engine
//! - Prelude for convenient imports

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod bbox;
pub mod error;
pub mod ids;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bbox::*;
    pub use crate::error::*;
    pub use crate::ids::*;
}

pub use prelude::*;
