//! Flyover configuration.
//!
//! Embeds the streaming tunables and adds the synthetic scene, the camera
//! flight and the simulated datasets. Loaded from and saved to TOML.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use terra_residency::StreamingConfig;

/// Configuration file name.
pub const CONFIG_FILE: &str = "terra-flyover.toml";

/// One simulated texture dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Display name
    pub name: String,
    /// Simulated latency per tile, in milliseconds
    pub latency_ms: u64,
    /// Probability that a tile read fails
    pub failure_rate: f64,
    /// Probability that a tile comes back degraded and must not be cached
    pub degraded_rate: f64,
    /// Declared per-frame timeout (None = streaming default)
    pub timeout_ms: Option<u64>,
    /// Visible at start
    pub enabled: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: "imagery".to_string(),
            latency_ms: 5,
            failure_rate: 0.0,
            degraded_rate: 0.0,
            timeout_ms: None,
            enabled: true,
        }
    }
}

/// Flyover parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlyoverConfig {
    // === Display ===
    /// Viewport width in pixels
    pub screen_width: u32,
    /// Viewport height in pixels
    pub screen_height: u32,
    /// Vertical field of view in degrees
    pub fov_degrees: f64,
    /// Largest texture edge the simulated GPU accepts
    pub max_texture_size: u32,
    /// Simulated texture memory in megabytes
    pub texture_memory_mb: u64,
    /// Vertical exaggeration
    pub z_scale: f64,

    // === Terrain ===
    /// Edge length of the square terrain, in world units
    pub terrain_size: f64,
    /// Deepest quadtree level of the mesh
    pub max_lod: u32,
    /// Height range of the terrain, in world units
    pub relief: f64,
    /// Geometry fragments the backing store can hold
    pub geometry_capacity: usize,

    // === Flight ===
    /// Frames to render
    pub frames: u64,
    /// Camera altitude at the start
    pub start_altitude: f64,
    /// Camera altitude at the end
    pub end_altitude: f64,
    /// Frame at which the last dataset is toggled (None = never)
    pub toggle_dataset_at: Option<u64>,
    /// Random seed for the simulated datasets
    pub seed: u64,

    // === Output ===
    /// Write a JSON flight report here
    pub report_path: Option<PathBuf>,

    // TOML tables must follow plain values
    // === Datasets ===
    /// Simulated texture datasets, in compositing order
    pub datasets: Vec<DatasetConfig>,

    // === Streaming ===
    /// Residency engine tunables
    pub streaming: StreamingConfig,
}

impl Default for FlyoverConfig {
    fn default() -> Self {
        Self {
            screen_width: 1280,
            screen_height: 720,
            fov_degrees: 60.0,
            max_texture_size: 4096,
            texture_memory_mb: 512,
            z_scale: 1.0,

            terrain_size: 16_384.0,
            max_lod: 6,
            relief: 400.0,
            geometry_capacity: 2048,

            frames: 240,
            start_altitude: 6000.0,
            end_altitude: 300.0,
            toggle_dataset_at: Some(120),
            seed: 0x7e44a,

            report_path: None,

            datasets: vec![
                DatasetConfig::default(),
                DatasetConfig {
                    name: "overlay".to_string(),
                    latency_ms: 20,
                    failure_rate: 0.02,
                    degraded_rate: 0.05,
                    timeout_ms: Some(150),
                    enabled: true,
                },
            ],

            streaming: StreamingConfig::default(),
        }
    }
}

impl FlyoverConfig {
    /// Load configuration from a specific path.
    /// Returns default config if file doesn't exist or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }

        let mut contents = String::new();
        if let Err(e) = fs::File::open(path).and_then(|mut f| f.read_to_string(&mut contents)) {
            warn!("Failed to read config file: {e}");
            return Self::default();
        }

        match toml::from_str(&contents) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            },
            Err(e) => {
                warn!("Failed to parse config file: {e}");
                Self::default()
            },
        }
    }

    /// Save configuration to a specific path.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut file = fs::File::create(path)?;
        file.write_all(contents.as_bytes())?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Validate and clamp configuration values to sensible ranges.
    pub fn validate(&mut self) {
        self.streaming.validate();

        // Display
        self.screen_width = self.screen_width.clamp(320, 7680);
        self.screen_height = self.screen_height.clamp(240, 4320);
        self.fov_degrees = self.fov_degrees.clamp(10.0, 120.0);
        self.max_texture_size = self.max_texture_size.clamp(256, 16_384);
        self.texture_memory_mb = self.texture_memory_mb.clamp(16, 65_536);
        self.z_scale = self.z_scale.clamp(0.1, 20.0);

        // Terrain
        if !(self.terrain_size.is_finite() && self.terrain_size > 0.0) {
            self.terrain_size = Self::default().terrain_size;
        }
        self.max_lod = self.max_lod.min(12);
        self.relief = self.relief.max(0.0);
        self.geometry_capacity = self.geometry_capacity.max(1);

        // Flight
        self.frames = self.frames.max(1);
        self.start_altitude = self.start_altitude.max(1.0);
        self.end_altitude = self.end_altitude.max(1.0);

        // Datasets
        if self.datasets.is_empty() {
            warn!("No datasets configured, adding default imagery");
            self.datasets.push(DatasetConfig::default());
        }
        for dataset in &mut self.datasets {
            dataset.failure_rate = dataset.failure_rate.clamp(0.0, 1.0);
            dataset.degraded_rate = dataset.degraded_rate.clamp(0.0, 1.0);
        }
    }

    /// Vertical field of view in radians.
    #[must_use]
    pub fn fov_y(&self) -> f64 {
        self.fov_degrees.to_radians()
    }

    /// Simulated texture memory in bytes.
    #[must_use]
    pub fn texture_memory_bytes(&self) -> usize {
        usize::try_from(self.texture_memory_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = FlyoverConfig::default();
        assert_eq!(config.screen_height, 720);
        assert_eq!(config.datasets.len(), 2);
        assert_eq!(config.streaming.max_cached_textures, 300);
    }

    #[test]
    fn test_config_validation() {
        let mut config = FlyoverConfig::default();

        // Set invalid values
        config.screen_width = 10;
        config.fov_degrees = 500.0;
        config.datasets.clear();
        config.streaming.fetch_workers = 0;

        config.validate();

        // Should be clamped
        assert_eq!(config.screen_width, 320);
        assert!((config.fov_degrees - 120.0).abs() < 1e-9);
        assert_eq!(config.datasets.len(), 1);
        assert_eq!(config.streaming.fetch_workers, 1);
    }

    #[test]
    fn test_config_save_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("nested").join("flyover.toml");

        let mut config = FlyoverConfig::default();
        config.frames = 12;
        config.streaming.max_cached_textures = 64;
        config.datasets[1].latency_ms = 90;
        config.toggle_dataset_at = Some(6);

        config.save_to(&config_path).expect("Failed to save config");

        let loaded = FlyoverConfig::load_from(&config_path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_missing_file() {
        let config = FlyoverConfig::load_from("/nonexistent/path/flyover.toml");
        assert_eq!(config, FlyoverConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join(CONFIG_FILE);
        fs::write(&config_path, "frames = 7\n\n[streaming]\nmax_pixel_error = 2.5\n")
            .expect("write");

        let config = FlyoverConfig::load_from(&config_path);
        assert_eq!(config.frames, 7);
        assert!((config.streaming.max_pixel_error - 2.5).abs() < 1e-9);
        assert_eq!(config.streaming.fetch_workers, 4);
        assert_eq!(config.screen_width, 1280);
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join(CONFIG_FILE);
        fs::write(&config_path, "frames = \"many\"").expect("write");

        assert_eq!(FlyoverConfig::load_from(&config_path), FlyoverConfig::default());
    }
}
