//! Synthetic collaborators for the flyover.
//!
//! A quadtree terrain mesh, an in-memory geometry store with a fixed
//! capacity, procedural imagery datasets with simulated latency and
//! failures, and a texture backend with a memory budget.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use glam::DVec3;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use terra_common::{
    BBox3, FragmentId, GeometryError, GpuError, MeshError, SourceError, SourceId, TextureHandle,
    TileId,
};
use terra_residency::lod::pixels_per_unit;
use terra_residency::{
    GeometryStore, MeshFragment, MeshSource, PixelFormat, TextureBackend, TextureTile,
    TextureUpload, TileRequest, TileSource, ViewParams,
};

use crate::config::DatasetConfig;

/// Mesh cells along one fragment edge; sets the geometric error per level.
const CELLS_PER_FRAGMENT: f64 = 64.0;

/// Square terrain split into a quadtree of fragments.
#[derive(Debug, Clone)]
pub struct QuadtreeMesh {
    size: f64,
    max_lod: u32,
    relief: f64,
    screen_height: u32,
}

impl QuadtreeMesh {
    /// Creates a mesh of edge `size` refined down to `max_lod`.
    #[must_use]
    pub fn new(size: f64, max_lod: u32, relief: f64, screen_height: u32) -> Self {
        Self {
            size,
            max_lod,
            relief,
            screen_height,
        }
    }

    /// Stable id of quadtree node `(level, x, y)`.
    #[must_use]
    pub fn fragment_id(level: u32, x: u32, y: u32) -> FragmentId {
        FragmentId::new((u64::from(level) << 48) | (u64::from(x) << 24) | u64::from(y))
    }

    fn fragment(&self, level: u32, x: u32, y: u32) -> MeshFragment {
        let edge = self.size / f64::from(1u32 << level);
        let min = DVec3::new(f64::from(x) * edge, f64::from(y) * edge, 0.0);
        let max = DVec3::new(min.x + edge, min.y + edge, self.relief);
        MeshFragment::new(Self::fragment_id(level, x, y), BBox3::from_corners(min, max), level)
    }

    /// World-space geometric error of a fragment at `level`.
    fn geometric_error(&self, level: u32) -> f64 {
        self.size / f64::from(1u32 << level) / CELLS_PER_FRAGMENT
    }
}

impl MeshSource for QuadtreeMesh {
    fn select(
        &mut self,
        view: &ViewParams,
        max_pixel_error: f64,
        z_scale: f64,
    ) -> Result<Vec<MeshFragment>, MeshError> {
        if self.size <= 0.0 {
            return Err(MeshError::Unavailable("empty terrain".to_string()));
        }

        let mut selected = Vec::new();
        let mut stack = vec![(0u32, 0u32, 0u32)];
        while let Some((level, x, y)) = stack.pop() {
            let fragment = self.fragment(level, x, y);
            let distance = fragment.bbox.distance_to(view.eye, z_scale).max(view.near);
            if distance > view.far {
                continue;
            }

            let error = self.geometric_error(level)
                * pixels_per_unit(distance, view.fov_y, self.screen_height);
            if error > max_pixel_error && level < self.max_lod {
                for (dx, dy) in [(1, 1), (0, 1), (1, 0), (0, 0)] {
                    stack.push((level + 1, x * 2 + dx, y * 2 + dy));
                }
            } else {
                selected.push((distance, fragment));
            }
        }

        // front to back
        selected.sort_by(|a, b| a.0.total_cmp(&b.0));
        trace!("Selected {} fragments", selected.len());
        Ok(selected.into_iter().map(|(_, f)| f).collect())
    }
}

/// Geometry store holding at most `capacity` fragments.
#[derive(Debug, Clone, Default)]
pub struct MemoryGeometry {
    resident: HashSet<FragmentId>,
    capacity: usize,
    peak: usize,
}

impl MemoryGeometry {
    /// Creates an empty store.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            resident: HashSet::new(),
            capacity,
            peak: 0,
        }
    }

    /// Number of resident fragments.
    #[must_use]
    pub fn resident(&self) -> usize {
        self.resident.len()
    }

    /// Highest number of fragments resident at once.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak
    }
}

impl GeometryStore for MemoryGeometry {
    fn require(&mut self, fragments: &[FragmentId]) -> Result<(), GeometryError> {
        let mut failed = Vec::new();
        for id in fragments {
            if self.resident.contains(id) {
                continue;
            }
            if self.resident.len() >= self.capacity {
                failed.push(*id);
            } else {
                self.resident.insert(*id);
            }
        }
        self.peak = self.peak.max(self.resident.len());

        if failed.is_empty() {
            Ok(())
        } else {
            Err(GeometryError::AcquireFailed {
                fragments: failed,
                reason: format!("geometry store full ({} fragments)", self.capacity),
            })
        }
    }

    fn release(&mut self, fragments: &[FragmentId]) {
        for id in fragments {
            self.resident.remove(id);
        }
    }
}

/// Imagery dataset that paints tiles instead of reading them.
///
/// Pixel buffers are rendered at most `max_edge` texels on a side; the tile
/// keeps the requested resolution.
pub struct ProceduralSource {
    id: SourceId,
    name: String,
    latency: Duration,
    failure_rate: f64,
    degraded_rate: f64,
    timeout: Option<Duration>,
    max_edge: u32,
    rng: Mutex<fastrand::Rng>,
}

impl ProceduralSource {
    /// Creates a dataset from its configuration.
    #[must_use]
    pub fn new(id: SourceId, config: &DatasetConfig, seed: u64, max_edge: u32) -> Self {
        Self {
            id,
            name: config.name.clone(),
            latency: Duration::from_millis(config.latency_ms),
            failure_rate: config.failure_rate,
            degraded_rate: config.degraded_rate,
            timeout: config.timeout_ms.map(Duration::from_millis),
            max_edge: max_edge.max(1),
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }

    /// Dataset name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl TileSource for ProceduralSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn fetch_tile(&self, request: &TileRequest) -> Result<Option<Arc<TextureTile>>, SourceError> {
        let (fails, degraded, jitter) = {
            let mut rng = self.rng.lock();
            let latency_ms = self.latency.as_millis() as u64;
            (
                rng.f64() < self.failure_rate,
                rng.f64() < self.degraded_rate,
                rng.u64(0..=latency_ms / 2),
            )
        };
        if !self.latency.is_zero() {
            thread::sleep(self.latency + Duration::from_millis(jitter));
        }
        if fails {
            return Err(SourceError::Io {
                source_id: self.id,
                reason: format!("{}: simulated read error", self.name),
            });
        }

        let bbox = *request.bbox();
        let upp = request.units_per_pixel();
        let (width, height) = request.pixel_size();
        let (width, height) = (width.clamp(1, self.max_edge), height.clamp(1, self.max_edge));
        let id = TileId::new(
            upp.log2().round().max(0.0) as u32,
            (bbox.min.x / upp).floor() as i64,
            (bbox.min.y / upp).floor() as i64,
        );

        // one flat colour per tile is enough to tell them apart
        let shade = (id.x ^ id.y ^ i64::from(id.matrix)) as u8;
        let pixel = [shade, shade.wrapping_mul(3), u8::from(degraded) * 255, 255];
        let pixels: Vec<u8> = pixel
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * PixelFormat::Rgba8.bytes_per_pixel())
            .collect();

        if degraded {
            debug!("{}: degraded tile {id}", self.name);
        }
        Ok(Some(Arc::new(TextureTile {
            id,
            bbox,
            units_per_pixel: upp,
            width,
            height,
            format: PixelFormat::Rgba8,
            pixels: pixels.into(),
            cacheable: !degraded,
        })))
    }
}

/// Texture backend that tracks memory against a budget.
#[derive(Debug, Default)]
pub struct SimulatedGpu {
    textures: HashMap<TextureHandle, usize>,
    bytes: usize,
    budget: usize,
    uploads: u64,
    frees: u64,
    peak_bytes: usize,
    peak_textures: usize,
}

impl SimulatedGpu {
    /// Creates a GPU with `budget` bytes of texture memory.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            ..Self::default()
        }
    }

    /// Checks if `handle` names a live texture.
    #[must_use]
    pub fn is_live(&self, handle: TextureHandle) -> bool {
        self.textures.contains_key(&handle)
    }

    /// Live textures.
    #[must_use]
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Bytes in use.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Highest byte count seen.
    #[must_use]
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }

    /// Highest texture count seen.
    #[must_use]
    pub fn peak_textures(&self) -> usize {
        self.peak_textures
    }

    /// Uploads and frees so far.
    #[must_use]
    pub fn traffic(&self) -> (u64, u64) {
        (self.uploads, self.frees)
    }
}

impl TextureBackend for SimulatedGpu {
    fn upload(&mut self, upload: &TextureUpload<'_>) -> Result<TextureHandle, GpuError> {
        let size = upload.tile.byte_size();
        if self.bytes + size > self.budget {
            return Err(GpuError::OutOfMemory { requested: size });
        }
        let handle = TextureHandle::allocate();
        self.textures.insert(handle, size);
        self.bytes += size;
        self.uploads += 1;
        self.peak_bytes = self.peak_bytes.max(self.bytes);
        self.peak_textures = self.peak_textures.max(self.textures.len());
        Ok(handle)
    }

    fn free(&mut self, handle: TextureHandle) {
        match self.textures.remove(&handle) {
            Some(size) => {
                self.bytes -= size;
                self.frees += 1;
            },
            None => warn!("Free of unknown texture {handle:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terra_common::BBox2;
    use terra_residency::TextureRequest;

    fn view(height: f64) -> ViewParams {
        ViewParams::look_at(
            DVec3::new(100.0, 100.0, height),
            DVec3::new(100.0, 100.0, 0.0),
            1.0,
        )
    }

    fn request() -> TileRequest {
        TileRequest::from_request(TextureRequest::new(
            FragmentId::new(1),
            BBox2::new(0.0, 0.0, 64.0, 32.0),
            0.5,
        ))
    }

    #[test]
    fn test_quadtree_refines_near_the_camera() {
        let mut mesh = QuadtreeMesh::new(4096.0, 5, 100.0, 720);

        let far = mesh.select(&view(50_000.0), 5.0, 1.0).expect("select");
        assert_eq!(far.len(), 1, "Distant terrain is a single root fragment");

        let near = mesh.select(&view(150.0), 5.0, 1.0).expect("select");
        assert!(near.len() > 4);
        assert_eq!(near[0].lod, 5, "Closest fragment is the finest");
        assert!(near.iter().any(|f| f.lod < 5));

        // selection covers the terrain exactly once
        let area: f64 = near.iter().map(|f| f.bbox.footprint().area()).sum();
        assert!((area - 4096.0 * 4096.0).abs() < 1e-3);
    }

    #[test]
    fn test_fragment_ids_are_unique_per_node() {
        assert_ne!(
            QuadtreeMesh::fragment_id(1, 0, 1),
            QuadtreeMesh::fragment_id(1, 1, 0)
        );
        assert_ne!(
            QuadtreeMesh::fragment_id(0, 0, 0),
            QuadtreeMesh::fragment_id(1, 0, 0)
        );
    }

    #[test]
    fn test_geometry_store_reports_overflow() {
        let mut store = MemoryGeometry::new(2);
        let ids: Vec<FragmentId> = (1..=3).map(FragmentId::new).collect();
        let err = store.require(&ids).expect_err("over capacity");
        match err {
            GeometryError::AcquireFailed { fragments, .. } => {
                assert_eq!(fragments, vec![FragmentId::new(3)]);
            },
            other => panic!("unexpected error {other}"),
        }
        store.release(&ids[..1]);
        assert!(store.require(&ids[2..]).is_ok());
        assert_eq!(store.resident(), 2);
        assert_eq!(store.peak(), 2);
    }

    #[test]
    fn test_procedural_source_paints_requested_area() {
        let source = ProceduralSource::new(
            SourceId::new(0),
            &DatasetConfig {
                latency_ms: 0,
                ..DatasetConfig::default()
            },
            1,
            512,
        );
        let tile = source.fetch_tile(&request()).expect("fetch").expect("tile");
        assert_eq!((tile.width, tile.height), (128, 64));
        assert_eq!(tile.byte_size(), 128 * 64 * 4);
        assert!(tile.cacheable);
    }

    #[test]
    fn test_procedural_source_failures() {
        let broken = ProceduralSource::new(
            SourceId::new(1),
            &DatasetConfig {
                latency_ms: 0,
                failure_rate: 1.0,
                ..DatasetConfig::default()
            },
            1,
            64,
        );
        assert!(matches!(broken.fetch_tile(&request()), Err(SourceError::Io { .. })));

        let degraded = ProceduralSource::new(
            SourceId::new(2),
            &DatasetConfig {
                latency_ms: 0,
                degraded_rate: 1.0,
                timeout_ms: Some(40),
                ..DatasetConfig::default()
            },
            1,
            64,
        );
        let tile = degraded.fetch_tile(&request()).expect("fetch").expect("tile");
        assert!(!tile.cacheable);
        assert_eq!((tile.width, tile.height), (64, 64));
        assert_eq!(degraded.timeout(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_gpu_budget() {
        let source = ProceduralSource::new(
            SourceId::new(0),
            &DatasetConfig {
                latency_ms: 0,
                ..DatasetConfig::default()
            },
            1,
            512,
        );
        let tile = source.fetch_tile(&request()).expect("fetch").expect("tile");
        let upload = TextureUpload {
            tile: &tile,
            region: *request().bbox(),
        };

        let mut gpu = SimulatedGpu::new(tile.byte_size() + 1);
        let handle = gpu.upload(&upload).expect("fits");
        assert!(matches!(gpu.upload(&upload), Err(GpuError::OutOfMemory { .. })));

        gpu.free(handle);
        assert_eq!(gpu.bytes(), 0);
        assert!(!gpu.is_live(handle));
        assert_eq!(gpu.traffic(), (1, 1));
    }
}
