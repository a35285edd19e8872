//! Scripted camera flight.
//!
//! Descends diagonally across the terrain while the streaming manager keeps
//! geometry and imagery resident, then shuts everything down and reports.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use glam::DVec3;
use tracing::{debug, error, info, warn};

use terra_common::{ShaderId, SourceId};
use terra_residency::{
    CachingTileSource, GpuContext, RenderContext, RenderSet, TerrainStreamingManager, TileSource,
    ViewParams,
};

use crate::config::FlyoverConfig;
use crate::perf::{FlightMetrics, FlightReport, GpuSummary};
use crate::scene::{MemoryGeometry, ProceduralSource, QuadtreeMesh, SimulatedGpu};

/// Largest pixel buffer edge the procedural datasets paint.
const PREVIEW_EDGE: u32 = 256;

/// Straight descent from one corner region of the terrain towards the other.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlightPath {
    start: DVec3,
    end: DVec3,
    frames: u64,
    far: f64,
}

impl FlightPath {
    /// Builds the path described by `config`.
    #[must_use]
    pub fn new(config: &FlyoverConfig) -> Self {
        let size = config.terrain_size;
        Self {
            start: DVec3::new(size * 0.1, size * 0.1, config.start_altitude),
            end: DVec3::new(size * 0.7, size * 0.6, config.end_altitude),
            frames: config.frames.max(1),
            far: size * 2.0,
        }
    }

    /// Camera of `frame`, looking ahead and down.
    #[must_use]
    pub fn view(&self, frame: u64, fov_y: f64) -> ViewParams {
        let t = if self.frames > 1 {
            (frame.min(self.frames - 1) as f64) / ((self.frames - 1) as f64)
        } else {
            0.0
        };
        let eye = self.start.lerp(self.end, t);
        let heading = (self.end - self.start).truncate().normalize_or_zero();
        let target = DVec3::new(
            eye.x + heading.x * eye.z,
            eye.y + heading.y * eye.z,
            0.0,
        );
        ViewParams {
            far: self.far,
            ..ViewParams::look_at(eye, target, fov_y)
        }
    }
}

/// Flies the configured path and returns the report.
pub fn run(config: &FlyoverConfig) -> Result<FlightReport> {
    let mesh = QuadtreeMesh::new(
        config.terrain_size,
        config.max_lod,
        config.relief,
        config.screen_height,
    );
    let geometry = MemoryGeometry::new(config.geometry_capacity);

    let mut sources: Vec<Arc<dyn TileSource>> = Vec::with_capacity(config.datasets.len());
    for (i, dataset) in config.datasets.iter().enumerate() {
        let id = SourceId::new(u16::try_from(i).context("too many datasets")?);
        let source = ProceduralSource::new(
            id,
            dataset,
            config.seed.wrapping_add(i as u64),
            PREVIEW_EDGE,
        );
        info!("Dataset {id}: {}", source.name());
        sources.push(Arc::new(CachingTileSource::new(
            source,
            config.streaming.tile_cache_entries,
        )));
    }

    let mut manager = TerrainStreamingManager::new(config.streaming.clone(), mesh, geometry, sources)
        .context("failed to start terrain streaming")?;
    for (i, dataset) in config.datasets.iter().enumerate() {
        if !dataset.enabled {
            manager.set_source_enabled(SourceId::new(i as u16), false);
        }
    }

    let context = RenderContext {
        z_scale: config.z_scale,
        screen_width: config.screen_width,
        screen_height: config.screen_height,
        max_texture_size: config.max_texture_size,
        compositing_shaders: (1..=config.datasets.len() as u32).map(ShaderId::new).collect(),
    };
    let mut gpu = SimulatedGpu::new(config.texture_memory_bytes());
    let path = FlightPath::new(config);
    let mut metrics = FlightMetrics::default();
    let toggled = SourceId::new(config.datasets.len().saturating_sub(1) as u16);

    info!("Flying {} frames", config.frames);
    for frame in 0..config.frames {
        if config.toggle_dataset_at == Some(frame) {
            let enable = !manager.is_source_enabled(toggled);
            manager.set_source_enabled(toggled, enable);
        }

        let view = path.view(frame, config.fov_y());
        let started = Instant::now();
        let mut draws = 0;
        let stats = manager.render_frame(&view, &context, &mut gpu, |set, gpu| {
            draws = draw(set, gpu);
        });
        metrics.record(started.elapsed(), &stats, draws);

        if frame % 30 == 0 {
            info!(
                "Frame {}: altitude {:.0}, {} fragments ({} resident), {} textures ({:.1} MB), {:.1} ms avg",
                stats.frame,
                view.eye.z,
                stats.active,
                manager.geometry().resident(),
                gpu.texture_count(),
                gpu.bytes() as f64 / (1024.0 * 1024.0),
                metrics.avg_frame_ms()
            );
        }
    }

    let peak_fragments = manager.geometry().peak();
    let totals = manager.stats().clone();
    manager.shutdown(&mut GpuContext::new(&mut gpu));

    let leaked = gpu.texture_count();
    if leaked > 0 {
        warn!("{leaked} textures still alive after shutdown");
    }
    let (uploads, frees) = gpu.traffic();
    info!(
        "Flight done: {} frames, {} dropped, {:.0}% textures reused, peak {:.1} MB",
        metrics.frames().len(),
        totals.dropped_frames,
        totals.reuse_ratio() * 100.0,
        gpu.peak_bytes() as f64 / (1024.0 * 1024.0)
    );

    Ok(metrics.into_report(
        totals,
        GpuSummary {
            peak_bytes: gpu.peak_bytes(),
            peak_textures: gpu.peak_textures(),
            uploads,
            frees,
            leaked,
            peak_fragments,
        },
    ))
}

/// Stand-in for draw submission: checks every bound texture is alive.
fn draw(set: &RenderSet, gpu: &SimulatedGpu) -> usize {
    let mut draws = 0;
    for item in set.drawable() {
        for texture in &item.textures {
            if !gpu.is_live(texture.handle) {
                error!("{} bound to freed texture {:?}", item.fragment, texture.handle);
            }
        }
        draws += 1;
    }
    debug!("Frame {}: {draws} draws", set.frame);
    draws
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatasetConfig;

    fn quick_config() -> FlyoverConfig {
        let mut config = FlyoverConfig {
            frames: 6,
            terrain_size: 2048.0,
            max_lod: 3,
            start_altitude: 1500.0,
            end_altitude: 200.0,
            toggle_dataset_at: Some(3),
            datasets: vec![
                DatasetConfig {
                    latency_ms: 0,
                    ..DatasetConfig::default()
                },
                DatasetConfig {
                    name: "overlay".to_string(),
                    latency_ms: 0,
                    degraded_rate: 0.5,
                    ..DatasetConfig::default()
                },
            ],
            ..FlyoverConfig::default()
        };
        config.validate();
        config
    }

    #[test]
    fn test_path_endpoints() {
        let config = quick_config();
        let path = FlightPath::new(&config);

        let first = path.view(0, 1.0);
        let last = path.view(config.frames - 1, 1.0);
        assert!((first.eye.z - 1500.0).abs() < 1e-9);
        assert!((last.eye.z - 200.0).abs() < 1e-9);
        assert!(first.forward.z < 0.0, "Camera looks down");
        assert!((first.far - 4096.0).abs() < 1e-9);

        // frames past the end hold the last camera
        assert_eq!(path.view(config.frames + 10, 1.0), last);
    }

    #[test]
    fn test_flight_runs_clean() {
        let config = quick_config();
        let report = run(&config).expect("flight");

        assert_eq!(report.summary.frames, 6);
        assert_eq!(report.totals.dropped_frames, 0);
        assert!(report.summary.draws > 0);
        assert!(report.gpu.uploads > 0);
        assert_eq!(report.gpu.leaked, 0, "Shutdown frees every texture");
        assert_eq!(report.gpu.uploads, report.gpu.frees);
        assert!(report.frames.iter().all(|f| f.sources_timed_out == 0));
    }
}
