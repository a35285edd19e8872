//! Flight metrics and the JSON report.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use terra_residency::{FrameStats, StreamingStats};

/// Rolling frame timings plus per-frame streaming stats.
#[derive(Debug)]
pub struct FlightMetrics {
    /// Recent frame times in seconds
    frame_times: VecDeque<f32>,
    history_size: usize,
    frames: Vec<FrameStats>,
    slowest_frame: Duration,
    slowest_fetch: Duration,
    draws: u64,
}

impl Default for FlightMetrics {
    fn default() -> Self {
        Self::new(120)
    }
}

impl FlightMetrics {
    /// Create a collector averaging over `history_size` frames.
    #[must_use]
    pub fn new(history_size: usize) -> Self {
        Self {
            frame_times: VecDeque::with_capacity(history_size),
            history_size: history_size.max(1),
            frames: Vec::new(),
            slowest_frame: Duration::ZERO,
            slowest_fetch: Duration::ZERO,
            draws: 0,
        }
    }

    /// Record one frame.
    pub fn record(&mut self, elapsed: Duration, stats: &FrameStats, draws: usize) {
        self.frame_times.push_back(elapsed.as_secs_f32());
        if self.frame_times.len() > self.history_size {
            self.frame_times.pop_front();
        }
        self.slowest_frame = self.slowest_frame.max(elapsed);
        self.slowest_fetch = self.slowest_fetch.max(stats.fetch_time);
        self.draws += draws as u64;
        self.frames.push(stats.clone());
    }

    /// Average frame time over the window, in milliseconds.
    #[must_use]
    pub fn avg_frame_ms(&self) -> f32 {
        if self.frame_times.is_empty() {
            return 0.0;
        }
        self.frame_times.iter().sum::<f32>() / self.frame_times.len() as f32 * 1000.0
    }

    /// Frames recorded so far.
    #[must_use]
    pub fn frames(&self) -> &[FrameStats] {
        &self.frames
    }

    /// Builds the report.
    #[must_use]
    pub fn into_report(self, totals: StreamingStats, gpu: GpuSummary) -> FlightReport {
        FlightReport {
            summary: FlightSummary {
                frames: self.frames.len() as u64,
                avg_frame_ms: self.avg_frame_ms(),
                slowest_frame_ms: self.slowest_frame.as_secs_f64() * 1000.0,
                slowest_fetch_ms: self.slowest_fetch.as_secs_f64() * 1000.0,
                draws: self.draws,
                reuse_ratio: totals.reuse_ratio(),
            },
            totals,
            gpu,
            frames: self.frames,
        }
    }
}

/// Texture memory figures of the simulated GPU.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuSummary {
    /// Highest texture memory use, in bytes
    pub peak_bytes: usize,
    /// Highest live texture count
    pub peak_textures: usize,
    /// Textures uploaded
    pub uploads: u64,
    /// Textures freed
    pub frees: u64,
    /// Textures still alive after shutdown
    pub leaked: usize,
    /// Highest number of resident geometry fragments
    pub peak_fragments: usize,
}

/// Headline numbers of a flight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlightSummary {
    /// Frames flown
    pub frames: u64,
    /// Average frame time over the last window
    pub avg_frame_ms: f32,
    /// Slowest frame
    pub slowest_frame_ms: f64,
    /// Slowest fetch barrier
    pub slowest_fetch_ms: f64,
    /// Fragments drawn
    pub draws: u64,
    /// Share of textures served from the cache
    pub reuse_ratio: f64,
}

/// Everything written to the report file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlightReport {
    /// Headline numbers
    pub summary: FlightSummary,
    /// Cumulative streaming statistics
    pub totals: StreamingStats,
    /// Texture memory figures
    pub gpu: GpuSummary,
    /// Per-frame statistics
    pub frames: Vec<FrameStats>,
}

impl FlightReport {
    /// Writes the report as pretty JSON.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writer.flush()?;

        info!("Wrote flight report to {}", path.display());
        Ok(())
    }
}
