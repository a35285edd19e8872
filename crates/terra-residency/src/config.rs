//! Residency engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the streaming manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    // === LOD ===
    /// Screen-space error bound handed to the mesh source, in pixels
    pub max_pixel_error: f64,
    /// Desired on-screen size of one texel, in pixels
    pub max_projected_texel_size: f64,
    /// Finest rung of the resolution ladder, in world units per pixel
    pub base_units_per_pixel: f64,
    /// A cached texture finer than required by at most this factor is reused
    pub max_resolution_oversample: f64,
    /// Relative tolerance when comparing resolutions during coalescing
    pub resolution_epsilon: f64,

    // === Texture residency ===
    /// Capacity of the GPU texture cache (entries)
    pub max_cached_textures: usize,
    /// Capacity of each source's CPU tile cache (tiles)
    pub tile_cache_entries: usize,

    // === Fetching ===
    /// Timeout for sources that do not declare one, in milliseconds
    pub default_source_timeout_ms: u64,
    /// Upper bound of the per-frame fetch barrier, in milliseconds
    pub max_fetch_deadline_ms: u64,
    /// Worker threads in the shared fetch pool
    pub fetch_workers: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_pixel_error: 5.0,
            max_projected_texel_size: 1.0,
            base_units_per_pixel: 0.25,
            max_resolution_oversample: 2.0,
            resolution_epsilon: 1e-4,

            max_cached_textures: 300,
            tile_cache_entries: 400,

            default_source_timeout_ms: 250,
            max_fetch_deadline_ms: 1000,
            fetch_workers: 4,
        }
    }
}

impl StreamingConfig {
    /// Validate and clamp configuration values to sensible ranges.
    pub fn validate(&mut self) {
        self.max_pixel_error = self.max_pixel_error.clamp(0.1, 100.0);
        self.max_projected_texel_size = self.max_projected_texel_size.clamp(0.1, 16.0);
        if !(self.base_units_per_pixel.is_finite() && self.base_units_per_pixel > 0.0) {
            self.base_units_per_pixel = Self::default().base_units_per_pixel;
        }
        self.max_resolution_oversample = self.max_resolution_oversample.clamp(1.0, 16.0);
        self.resolution_epsilon = self.resolution_epsilon.clamp(0.0, 0.1);

        self.max_cached_textures = self.max_cached_textures.max(1);
        self.tile_cache_entries = self.tile_cache_entries.max(1);

        self.default_source_timeout_ms = self.default_source_timeout_ms.clamp(1, 60_000);
        self.max_fetch_deadline_ms = self.max_fetch_deadline_ms.clamp(1, 60_000);
        self.fetch_workers = self.fetch_workers.clamp(1, 64);
    }

    /// Timeout for sources that do not declare one.
    #[must_use]
    pub fn default_source_timeout(&self) -> Duration {
        Duration::from_millis(self.default_source_timeout_ms)
    }

    /// Upper bound of the fetch barrier.
    #[must_use]
    pub fn max_fetch_deadline(&self) -> Duration {
        Duration::from_millis(self.max_fetch_deadline_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_survive_validation() {
        let mut config = StreamingConfig::default();
        config.validate();
        assert_eq!(config, StreamingConfig::default());
    }

    #[test]
    fn test_validate_clamps() {
        let mut config = StreamingConfig {
            max_cached_textures: 0,
            fetch_workers: 0,
            base_units_per_pixel: -3.0,
            max_resolution_oversample: 0.5,
            ..StreamingConfig::default()
        };
        config.validate();
        assert_eq!(config.max_cached_textures, 1);
        assert_eq!(config.fetch_workers, 1);
        assert!((config.base_units_per_pixel - 0.25).abs() < f64::EPSILON);
        assert!((config.max_resolution_oversample - 1.0).abs() < f64::EPSILON);
    }
}
