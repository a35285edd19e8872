//! Frame and lifetime statistics of the streaming manager.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happened during one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameStats {
    /// Frame number
    pub frame: u64,
    /// Fragments in the active set
    pub active: usize,
    /// Fragments whose geometry was released
    pub released: usize,
    /// Fragments whose geometry was acquired
    pub acquired: usize,
    /// Fragments left without geometry
    pub acquire_failures: usize,
    /// Per-fragment texture requests issued
    pub texture_requests: usize,
    /// Tile requests after coalescing
    pub tile_requests: usize,
    /// Textures served from the residency cache
    pub textures_reused: usize,
    /// Textures uploaded from freshly fetched tiles
    pub textures_uploaded: usize,
    /// Fragments drawn without any texture
    pub untextured: usize,
    /// Sources that failed this frame
    pub sources_failed: usize,
    /// Sources that missed the fetch deadline
    pub sources_timed_out: usize,
    /// Time spent in the fetch barrier
    pub fetch_time: Duration,
    /// GPU textures freed by this frame's cleanup
    pub textures_freed: usize,
    /// Frame preparation failed and nothing was drawn
    pub dropped: bool,
}

/// Cumulative statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingStats {
    /// Frames prepared
    pub frames: u64,
    /// Frames dropped after a failure
    pub dropped_frames: u64,
    /// Geometry releases
    pub released: u64,
    /// Geometry acquires
    pub acquired: u64,
    /// Tile requests sent to sources
    pub tile_requests: u64,
    /// Texture uploads
    pub textures_uploaded: u64,
    /// Textures reused from the cache
    pub textures_reused: u64,
    /// GPU textures freed
    pub textures_freed: u64,
    /// Source failures and timeouts
    pub source_errors: u64,
}

impl StreamingStats {
    /// Folds one frame into the totals.
    pub fn record(&mut self, frame: &FrameStats) {
        self.frames += 1;
        if frame.dropped {
            self.dropped_frames += 1;
        }
        self.released += frame.released as u64;
        self.acquired += frame.acquired as u64;
        self.tile_requests += frame.tile_requests as u64;
        self.textures_uploaded += frame.textures_uploaded as u64;
        self.textures_reused += frame.textures_reused as u64;
        self.textures_freed += frame.textures_freed as u64;
        self.source_errors += (frame.sources_failed + frame.sources_timed_out) as u64;
    }

    /// Share of texture lookups answered by the cache.
    #[must_use]
    pub fn reuse_ratio(&self) -> f64 {
        let total = self.textures_reused + self.textures_uploaded;
        if total == 0 {
            0.0
        } else {
            self.textures_reused as f64 / total as f64
        }
    }
}
