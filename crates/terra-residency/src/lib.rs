//! # Terra Residency
//!
//! View-dependent terrain streaming and GPU residency.
//!
//! This crate handles:
//! - Fragment set diffing and geometry release/acquire
//! - Texture resolution estimates and request coalescing
//! - Parallel tile fetching under a per-frame deadline
//! - A bounded GPU texture cache with deferred eviction

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod fetch;
pub mod gpu;
pub mod lod;
pub mod lru;
pub mod manager;
pub mod mesh;
pub mod request;
pub mod source;
pub mod stats;
pub mod tile;
pub mod tile_cache;


/// Prelude for convenient imports
pub mod prelude {
    pub use crate::cache::*;
    pub use crate::coalesce::*;
    pub use crate::config::*;
    pub use crate::fetch::{ConcurrentFetcher, FetchJob, FetchOutcome, FetchPool};
    pub use crate::gpu::{GpuContext, TextureBackend, TextureUpload};
    pub use crate::lod::*;
    pub use crate::manager::*;
    pub use crate::mesh::*;
    pub use crate::request::*;
    pub use crate::source::*;
    pub use crate::stats::*;
    pub use crate::tile::*;
    pub use crate::tile_cache::*;
}

pub use prelude::*;
