//! Terrain streaming manager.
//!
//! Runs once per frame on the render thread:
//!
//! 1. ask the mesh source for the fragments of the current view
//! 2. release geometry that left the view, then acquire what entered it
//! 3. build one texture request per fragment and dataset, reusing cached
//!    textures whose resolution still fits
//! 4. coalesce the rest per dataset and fetch under one deadline
//! 5. upload what arrived and hand the host an ordered [`RenderSet`]
//!
//! GPU textures evicted along the way are only freed by
//! [`TerrainStreamingManager::finish_frame`], after the host has drawn.

use std::collections::{BTreeMap, BTreeSet};
use std::f64::consts::PI;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use terra_common::{
    BBox3, FragmentId, GeometryError, MeshError, ShaderId, SourceId, TerraResult, TextureHandle,
};

use crate::cache::{CachedTexture, ResidencyCache, TextureKey};
use crate::coalesce::Coalescer;
use crate::config::StreamingConfig;
use crate::fetch::{panic_message, ConcurrentFetcher, FetchJob, FetchOutcome, FetchPool};
use crate::gpu::{GpuContext, TextureBackend};
use crate::lod::{required_units_per_pixel, RenderContext, ViewParams};
use crate::mesh::{GeometryStore, MeshFragment, MeshSource};
use crate::request::TextureRequest;
use crate::source::TileSource;
use crate::stats::{FrameStats, StreamingStats};

/// A texture bound to a fragment for the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundTexture {
    /// Dataset the imagery came from
    pub source: SourceId,
    /// GPU texture, valid until the next `finish_frame`
    pub handle: TextureHandle,
    /// Fragment footprint inside the texture, `(u_min, v_min, u_max, v_max)`
    pub tex_coords: [f32; 4],
}

/// One fragment to draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderItem {
    /// Fragment identity
    pub fragment: FragmentId,
    /// World-space bounds
    pub bbox: BBox3,
    /// Level of detail
    pub lod: u32,
    /// False if the geometry acquire failed; the host skips the fragment
    pub has_geometry: bool,
    /// Bound textures in dataset order, possibly empty
    pub textures: Vec<BoundTexture>,
    /// Compositing program for `textures.len()` textures
    pub shader: Option<ShaderId>,
}

impl RenderItem {
    /// First bound texture, if any.
    #[must_use]
    pub fn texture(&self) -> Option<TextureHandle> {
        self.textures.first().map(|t| t.handle)
    }

    /// Texture bound from `source`, if any.
    #[must_use]
    pub fn texture_from(&self, source: SourceId) -> Option<&BoundTexture> {
        self.textures.iter().find(|t| t.source == source)
    }
}

/// Ordered draw list for one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderSet {
    /// Frame number
    pub frame: u64,
    /// Fragments in draw order
    pub items: Vec<RenderItem>,
}

impl RenderSet {
    /// Number of fragments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Checks if there is nothing to draw.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item of `fragment`, if it is part of the frame.
    #[must_use]
    pub fn get(&self, fragment: FragmentId) -> Option<&RenderItem> {
        self.items.iter().find(|item| item.fragment == fragment)
    }

    /// Items with resident geometry.
    pub fn drawable(&self) -> impl Iterator<Item = &RenderItem> {
        self.items.iter().filter(|item| item.has_geometry)
    }
}

struct SourceSlot {
    source: Arc<dyn TileSource>,
    enabled: bool,
}

/// Frame-by-frame geometry and texture residency.
pub struct TerrainStreamingManager<M, G> {
    config: StreamingConfig,
    mesh: M,
    geometry: G,
    sources: Vec<SourceSlot>,
    fetcher: ConcurrentFetcher,
    cache: ResidencyCache,
    /// Fragments of the last prepared frame, in draw order
    active: Vec<MeshFragment>,
    /// Active fragments whose geometry acquire failed
    ungeometried: BTreeSet<FragmentId>,
    frame: u64,
    last_frame: FrameStats,
    stats: StreamingStats,
}

impl<M: MeshSource, G: GeometryStore> TerrainStreamingManager<M, G> {
    /// Creates a manager drawing imagery from `sources`, in that order.
    ///
    /// Spawns the fetch pool, sized so every source gets its own worker.
    pub fn new(
        mut config: StreamingConfig,
        mesh: M,
        geometry: G,
        sources: Vec<Arc<dyn TileSource>>,
    ) -> TerraResult<Self> {
        config.validate();

        let mut seen = BTreeSet::new();
        for source in &sources {
            if !seen.insert(source.id()) {
                warn!("{} registered twice, textures will be shared", source.id());
            }
        }

        let pool = FetchPool::new(config.fetch_workers.max(sources.len()))?;
        let fetcher = ConcurrentFetcher::new(
            pool,
            config.default_source_timeout(),
            config.max_fetch_deadline(),
        );
        info!(
            "Terrain streaming ready: {} sources, {} fetch workers, {} textures max",
            sources.len(),
            fetcher.pool().size(),
            config.max_cached_textures
        );

        Ok(Self {
            cache: ResidencyCache::new(config.max_cached_textures),
            config,
            mesh,
            geometry,
            sources: sources
                .into_iter()
                .map(|source| SourceSlot {
                    source,
                    enabled: true,
                })
                .collect(),
            fetcher,
            active: Vec::new(),
            ungeometried: BTreeSet::new(),
            frame: 0,
            last_frame: FrameStats::default(),
            stats: StreamingStats::default(),
        })
    }

    /// Prepares the next frame.
    ///
    /// Returns `None` if preparation failed; the failure is logged and the
    /// manager stays usable. Textures in the returned set stay valid until
    /// [`Self::finish_frame`].
    pub fn advance(
        &mut self,
        view: &ViewParams,
        context: &RenderContext,
        gpu: &mut GpuContext<'_>,
    ) -> Option<RenderSet> {
        self.frame += 1;
        let mut frame = FrameStats {
            frame: self.frame,
            ..FrameStats::default()
        };

        let result =
            panic::catch_unwind(AssertUnwindSafe(|| self.prepare(view, context, gpu, &mut frame)));
        let set = match result {
            Ok(Ok(set)) => Some(set),
            Ok(Err(e)) => {
                error!("Frame {} dropped: {e}", self.frame);
                None
            },
            Err(payload) => {
                error!(
                    "Frame {} dropped, preparation panicked: {}",
                    self.frame,
                    panic_message(payload.as_ref())
                );
                None
            },
        };

        frame.dropped = set.is_none();
        self.stats.record(&frame);
        self.last_frame = frame;
        set
    }

    /// Frees every GPU texture evicted since the last call.
    ///
    /// Call after all draw calls of the frame have been issued.
    pub fn finish_frame(&mut self, gpu: &mut GpuContext<'_>) -> usize {
        let freed = self.cache.cleanup(gpu);
        self.last_frame.textures_freed += freed;
        self.stats.textures_freed += freed as u64;
        freed
    }

    /// Runs one complete frame: prepare, `draw`, then cleanup.
    ///
    /// A panic inside `draw` is contained and counts as a dropped frame.
    pub fn render_frame<B, F>(
        &mut self,
        view: &ViewParams,
        context: &RenderContext,
        backend: &mut B,
        draw: F,
    ) -> FrameStats
    where
        B: TextureBackend,
        F: FnOnce(&RenderSet, &mut B),
    {
        let set = self.advance(view, context, &mut GpuContext::new(&mut *backend));
        if let Some(set) = set {
            let drawn = panic::catch_unwind(AssertUnwindSafe(|| draw(&set, &mut *backend)));
            if let Err(payload) = drawn {
                error!(
                    "Frame {} dropped, draw panicked: {}",
                    self.frame,
                    panic_message(payload.as_ref())
                );
                self.last_frame.dropped = true;
                self.stats.dropped_frames += 1;
            }
        }
        self.finish_frame(&mut GpuContext::new(&mut *backend));
        self.last_frame.clone()
    }

    /// Turns a dataset on or off. Textures of a disabled dataset are
    /// evicted. Returns false for an unknown source.
    pub fn set_source_enabled(&mut self, id: SourceId, enabled: bool) -> bool {
        let Some(slot) = self.sources.iter_mut().find(|s| s.source.id() == id) else {
            warn!("Cannot toggle unknown {id}");
            return false;
        };
        if slot.enabled == enabled {
            return true;
        }
        slot.enabled = enabled;
        if enabled {
            info!("Enabled {id}");
        } else {
            let evicted = self.cache.invalidate_where(|key| key.source == id);
            info!("Disabled {id}, evicting {evicted} textures");
        }
        true
    }

    /// Checks if a dataset is enabled.
    #[must_use]
    pub fn is_source_enabled(&self, id: SourceId) -> bool {
        self.sources
            .iter()
            .any(|s| s.enabled && s.source.id() == id)
    }

    /// Releases all geometry and frees every texture.
    pub fn shutdown(&mut self, gpu: &mut GpuContext<'_>) {
        let resident: Vec<FragmentId> = self
            .active
            .iter()
            .map(|f| f.id)
            .filter(|id| !self.ungeometried.contains(id))
            .collect();
        if !resident.is_empty() {
            self.geometry.release(&resident);
        }
        self.active.clear();
        self.ungeometried.clear();

        self.cache.clear();
        let freed = self.finish_frame(gpu);
        info!(
            "Terrain streaming shut down after {} frames: released {} fragments, freed {freed} textures",
            self.frame,
            resident.len()
        );
    }

    /// Active configuration, after validation.
    #[must_use]
    pub const fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Number of frames prepared so far.
    #[must_use]
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    /// Fragments of the last prepared frame.
    #[must_use]
    pub fn active_fragments(&self) -> &[MeshFragment] {
        &self.active
    }

    /// Checks if `fragment` is active with resident geometry.
    #[must_use]
    pub fn has_geometry(&self, fragment: FragmentId) -> bool {
        !self.ungeometried.contains(&fragment) && self.active.iter().any(|f| f.id == fragment)
    }

    /// GPU texture cache.
    #[must_use]
    pub const fn cache(&self) -> &ResidencyCache {
        &self.cache
    }

    /// Statistics of the last frame.
    #[must_use]
    pub const fn last_frame(&self) -> &FrameStats {
        &self.last_frame
    }

    /// Cumulative statistics.
    #[must_use]
    pub const fn stats(&self) -> &StreamingStats {
        &self.stats
    }

    /// Mesh source.
    #[must_use]
    pub const fn mesh(&self) -> &M {
        &self.mesh
    }

    /// Geometry backing store.
    #[must_use]
    pub const fn geometry(&self) -> &G {
        &self.geometry
    }

    fn prepare(
        &mut self,
        view: &ViewParams,
        context: &RenderContext,
        gpu: &mut GpuContext<'_>,
        frame: &mut FrameStats,
    ) -> TerraResult<RenderSet> {
        validate_view(view)?;
        self.cache.begin_frame();

        let next = self
            .mesh
            .select(view, self.config.max_pixel_error, context.z_scale)?;
        self.update_geometry(next, frame);

        let (reused, jobs) = self.plan_textures(view, context, gpu, frame);
        let outcome = self.fetch(jobs, frame);
        let set = self.assemble(&reused, &outcome, context, gpu, frame);

        debug!(
            "Frame {}: {} fragments (-{} +{}), {} texture requests in {} tiles, {} reused, {} uploaded",
            self.frame,
            frame.active,
            frame.released,
            frame.acquired,
            frame.texture_requests,
            frame.tile_requests,
            frame.textures_reused,
            frame.textures_uploaded
        );
        Ok(set)
    }

    /// Diffs `next` against the active set, releasing before acquiring.
    fn update_geometry(&mut self, mut next: Vec<MeshFragment>, frame: &mut FrameStats) {
        let mut next_ids = BTreeSet::new();
        next.retain(|f| next_ids.insert(f.id));

        let mut to_release = Vec::new();
        for fragment in &self.active {
            if next_ids.contains(&fragment.id) {
                continue;
            }
            // never acquired, nothing to give back
            if !self.ungeometried.remove(&fragment.id) {
                to_release.push(fragment.id);
            }
        }
        if !to_release.is_empty() {
            debug!("Releasing {} fragments", to_release.len());
            self.geometry.release(&to_release);
        }

        let previous: BTreeSet<FragmentId> = self.active.iter().map(|f| f.id).collect();
        let to_acquire: Vec<FragmentId> = next
            .iter()
            .map(|f| f.id)
            .filter(|id| !previous.contains(id) || self.ungeometried.contains(id))
            .collect();

        let mut failed = BTreeSet::new();
        if !to_acquire.is_empty() {
            if let Err(e) = self.geometry.require(&to_acquire) {
                failed = match &e {
                    GeometryError::AcquireFailed { fragments, .. } => {
                        fragments.iter().copied().collect()
                    },
                    GeometryError::Unknown(id) => BTreeSet::from([*id]),
                };
                warn!("{e}, drawing them without geometry this frame");
            }
            for id in &to_acquire {
                if failed.contains(id) {
                    self.ungeometried.insert(*id);
                } else {
                    self.ungeometried.remove(id);
                }
            }
        }

        frame.released = to_release.len();
        frame.acquired = to_acquire.iter().filter(|id| !failed.contains(id)).count();
        frame.acquire_failures = self.ungeometried.len();
        frame.active = next.len();
        self.active = next;
    }

    /// Binds reusable cached textures and builds one fetch job per dataset
    /// for everything else.
    fn plan_textures(
        &mut self,
        view: &ViewParams,
        context: &RenderContext,
        gpu: &mut GpuContext<'_>,
        frame: &mut FrameStats,
    ) -> (BTreeMap<TextureKey, BoundTexture>, Vec<FetchJob>) {
        let coalescer = Coalescer::new(self.config.resolution_epsilon)
            .with_max_tile_pixels(context.max_texture_size);
        let mut reused = BTreeMap::new();
        let mut jobs = Vec::new();

        for slot in self.sources.iter().filter(|s| s.enabled) {
            let source_id = slot.source.id();
            let mut requests = Vec::new();

            for fragment in &self.active {
                if self.ungeometried.contains(&fragment.id) {
                    continue;
                }
                let key = TextureKey::new(fragment.id, source_id);
                let required = required_units_per_pixel(&fragment.bbox, view, context, &self.config);

                let cached = self.cache.get(&key).map(CachedTexture::units_per_pixel);
                if cached.is_some_and(|upp| is_reusable(upp, required, &self.config)) {
                    if let Some(bound) = bind_cached(&mut self.cache, &key, gpu) {
                        reused.insert(key, bound);
                        continue;
                    }
                }
                requests.push(TextureRequest::new(
                    fragment.id,
                    fragment.bbox.footprint(),
                    required,
                ));
            }

            if requests.is_empty() {
                continue;
            }
            let tiles = coalescer.coalesce(&requests);
            frame.texture_requests += requests.len();
            frame.tile_requests += tiles.len();
            jobs.push(FetchJob {
                source: Arc::clone(&slot.source),
                requests: tiles,
            });
        }

        frame.textures_reused = reused.len();
        (reused, jobs)
    }

    fn fetch(&self, jobs: Vec<FetchJob>, frame: &mut FrameStats) -> FetchOutcome {
        if jobs.is_empty() {
            return FetchOutcome::default();
        }
        let deadline = self.fetcher.deadline_for(jobs.iter().map(|job| &job.source));
        let outcome = self.fetcher.fetch(jobs, deadline);
        frame.fetch_time = outcome.elapsed;
        frame.sources_failed = outcome.failed();
        frame.sources_timed_out = outcome.timed_out();
        outcome
    }

    /// Uploads fetched tiles and builds the draw list in selection order.
    fn assemble(
        &mut self,
        reused: &BTreeMap<TextureKey, BoundTexture>,
        outcome: &FetchOutcome,
        context: &RenderContext,
        gpu: &mut GpuContext<'_>,
        frame: &mut FrameStats,
    ) -> RenderSet {
        let mut items = Vec::with_capacity(self.active.len());

        for fragment in &self.active {
            let has_geometry = !self.ungeometried.contains(&fragment.id);
            let mut textures = Vec::new();

            for slot in self.sources.iter().filter(|s| has_geometry && s.enabled) {
                let source_id = slot.source.id();
                let key = TextureKey::new(fragment.id, source_id);

                if let Some(bound) = reused.get(&key) {
                    textures.push(*bound);
                    continue;
                }

                if let Some(tile) = outcome.tile(source_id, fragment.id) {
                    let region = fragment.bbox.footprint();
                    let texture = CachedTexture::new(key, Arc::clone(tile), region);
                    match self.cache.insert_enabled(texture, gpu) {
                        Ok(handle) => {
                            frame.textures_uploaded += 1;
                            textures.push(BoundTexture {
                                source: source_id,
                                handle,
                                tex_coords: tile.tex_coords(&region),
                            });
                            continue;
                        },
                        Err(e) => warn!("Upload for {} from {source_id} failed: {e}", fragment.id),
                    }
                }

                // a texture at the wrong resolution beats no texture
                if let Some(bound) = bind_cached(&mut self.cache, &key, gpu) {
                    textures.push(bound);
                }
            }

            if has_geometry && textures.is_empty() {
                frame.untextured += 1;
            }
            items.push(RenderItem {
                fragment: fragment.id,
                bbox: fragment.bbox,
                lod: fragment.lod,
                has_geometry,
                shader: context.shader_for(textures.len()),
                textures,
            });
        }

        RenderSet {
            frame: self.frame,
            items,
        }
    }
}

impl<M, G> std::fmt::Debug for TerrainStreamingManager<M, G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerrainStreamingManager")
            .field("frame", &self.frame)
            .field("sources", &self.sources.len())
            .field("active", &self.active.len())
            .field("ungeometried", &self.ungeometried.len())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// A cached texture is reused if it is at least as fine as required and
/// not more than `max_resolution_oversample` times finer.
fn is_reusable(cached: f64, required: f64, config: &StreamingConfig) -> bool {
    let eps = config.resolution_epsilon;
    cached <= required * (1.0 + eps)
        && cached * config.max_resolution_oversample >= required * (1.0 - eps)
}

fn bind_cached(
    cache: &mut ResidencyCache,
    key: &TextureKey,
    gpu: &mut GpuContext<'_>,
) -> Option<BoundTexture> {
    match cache.enable(key, gpu)? {
        Ok(handle) => {
            let texture = cache.peek(key)?;
            Some(BoundTexture {
                source: key.source,
                handle,
                tex_coords: texture.tile().tex_coords(texture.region()),
            })
        },
        Err(e) => {
            warn!("Re-upload of cached {key:?} failed: {e}");
            None
        },
    }
}

fn validate_view(view: &ViewParams) -> Result<(), MeshError> {
    if !view.eye.is_finite() || !view.forward.is_finite() {
        return Err(MeshError::InvalidView(format!(
            "non-finite camera at {} looking {}",
            view.eye, view.forward
        )));
    }
    if !(view.fov_y > 0.0 && view.fov_y < PI) {
        return Err(MeshError::InvalidView(format!(
            "field of view {} outside (0, pi)",
            view.fov_y
        )));
    }
    Ok(())
}
