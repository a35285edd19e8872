//! GPU-side texture residency cache.
//!
//! Bounded LRU of uploaded fragment textures with two-phase eviction:
//! overflow only *marks* the least recently used entry, and the GPU texture
//! is destroyed later in [`ResidencyCache::cleanup`], after the frame's draw
//! calls have been issued. A texture that is still bound mid-draw is
//! therefore never freed.
//!
//! ```text
//! Created -> Enabled <-> ResidentUnused -> MarkedForEviction -> Freed
//!                 ^                               |
//!                 +--------- cache hit -----------+
//! ```

use std::sync::Arc;

use tracing::{debug, trace, warn};

use terra_common::{BBox2, FragmentId, GpuError, SourceId, TextureHandle};

use crate::gpu::{GpuContext, TextureUpload};
use crate::lru::LruMap;
use crate::tile::TextureTile;

/// Cache identity of a fragment texture: one texture per fragment and
/// dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureKey {
    /// Textured fragment
    pub fragment: FragmentId,
    /// Dataset the imagery came from
    pub source: SourceId,
}

impl TextureKey {
    /// Creates a new key.
    #[must_use]
    pub const fn new(fragment: FragmentId, source: SourceId) -> Self {
        Self { fragment, source }
    }
}

/// Lifecycle of a cached texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureState {
    /// Tile assigned, nothing on the GPU yet
    Created,
    /// Uploaded and bound for the current frame
    Enabled,
    /// Uploaded, not used this frame
    ResidentUnused,
    /// Waiting for the next cleanup to free its GPU texture
    MarkedForEviction,
    /// GPU texture destroyed
    Freed,
}

/// A fragment texture and its GPU state.
#[derive(Debug)]
pub struct CachedTexture {
    key: TextureKey,
    tile: Arc<TextureTile>,
    region: BBox2,
    handle: Option<TextureHandle>,
    state: TextureState,
    cache_eligible: bool,
}

impl CachedTexture {
    /// Creates a texture for `region` of `tile`. Cache eligibility follows
    /// the tile's `cacheable` flag.
    #[must_use]
    pub fn new(key: TextureKey, tile: Arc<TextureTile>, region: BBox2) -> Self {
        let cache_eligible = tile.cacheable;
        Self {
            key,
            tile,
            region,
            handle: None,
            state: TextureState::Created,
            cache_eligible,
        }
    }

    /// Cache identity.
    #[must_use]
    pub const fn key(&self) -> TextureKey {
        self.key
    }

    /// Shared source tile.
    #[must_use]
    pub fn tile(&self) -> &Arc<TextureTile> {
        &self.tile
    }

    /// Fragment footprint inside the tile.
    #[must_use]
    pub const fn region(&self) -> &BBox2 {
        &self.region
    }

    /// Resolution of the underlying tile.
    #[must_use]
    pub fn units_per_pixel(&self) -> f64 {
        self.tile.units_per_pixel
    }

    /// GPU handle, once uploaded.
    #[must_use]
    pub const fn handle(&self) -> Option<TextureHandle> {
        self.handle
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> TextureState {
        self.state
    }

    /// Whether the texture may outlive the frame it was fetched for.
    #[must_use]
    pub const fn is_cache_eligible(&self) -> bool {
        self.cache_eligible
    }

    /// Uploads if needed and marks the texture bound for this frame.
    fn enable(&mut self, gpu: &mut GpuContext<'_>) -> Result<TextureHandle, GpuError> {
        let handle = match self.handle {
            Some(handle) => handle,
            None => {
                let handle = gpu.upload(&TextureUpload {
                    tile: &self.tile,
                    region: self.region,
                })?;
                self.handle = Some(handle);
                handle
            },
        };
        self.state = TextureState::Enabled;
        Ok(handle)
    }

    fn release(&mut self, gpu: &mut GpuContext<'_>) -> bool {
        self.state = TextureState::Freed;
        match self.handle.take() {
            Some(handle) => {
                gpu.free(handle);
                true
            },
            None => false,
        }
    }
}

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    /// Lookups answered by a live entry
    pub hits: u64,
    /// Lookups answered by rescuing a marked entry
    pub rescues: u64,
    /// Lookups with no entry
    pub misses: u64,
    /// Entries marked for eviction
    pub marked: u64,
    /// GPU textures destroyed
    pub freed: u64,
}

/// Bounded LRU of fragment textures with deferred GPU deallocation.
///
/// Mutated only from the render thread.
#[derive(Debug)]
pub struct ResidencyCache {
    live: LruMap<TextureKey, CachedTexture>,
    pending: Vec<CachedTexture>,
    max_entries: usize,
    counters: CacheCounters,
}

impl ResidencyCache {
    /// Creates a cache holding at most `max_entries` live textures.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            live: LruMap::new(),
            pending: Vec::new(),
            max_entries: max_entries.max(1),
            counters: CacheCounters::default(),
        }
    }

    /// Capacity bound.
    #[must_use]
    pub const fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Checks if there are no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of textures waiting for cleanup.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Counters since creation.
    #[must_use]
    pub const fn counters(&self) -> CacheCounters {
        self.counters
    }

    /// Inserts or replaces a texture as most recently used.
    ///
    /// A replaced texture and any entry pushed out by the capacity bound are
    /// marked for eviction. A texture that is not cache eligible is kept
    /// only until the next cleanup.
    pub fn promote(&mut self, mut texture: CachedTexture) {
        if !texture.cache_eligible {
            trace!("Texture {:?} used for one frame only", texture.key);
            self.mark(&mut texture);
            self.pending.push(texture);
            return;
        }

        if let Some(mut replaced) = self.live.insert(texture.key, texture) {
            self.mark(&mut replaced);
            self.pending.push(replaced);
        }
        self.enforce_capacity();
    }

    /// Looks up a texture and makes it most recently used.
    ///
    /// A hit on an entry marked for eviction rescues it back into the live
    /// set.
    pub fn get(&mut self, key: &TextureKey) -> Option<&CachedTexture> {
        if self.live.touch(key) {
            self.counters.hits += 1;
            return self.live.peek(key);
        }

        let rescued = self
            .pending
            .iter()
            .position(|t| t.key == *key && t.cache_eligible)
            .map(|pos| self.pending.swap_remove(pos));
        match rescued {
            Some(mut texture) => {
                debug!("Rescued {:?} from pending eviction", texture.key);
                self.counters.rescues += 1;
                texture.state = if texture.handle.is_some() {
                    TextureState::ResidentUnused
                } else {
                    TextureState::Created
                };
                self.live.insert(*key, texture);
                self.enforce_capacity();
                self.live.peek(key)
            },
            None => {
                self.counters.misses += 1;
                None
            },
        }
    }

    /// Looks up a live texture without touching access order.
    #[must_use]
    pub fn peek(&self, key: &TextureKey) -> Option<&CachedTexture> {
        self.live.peek(key)
    }

    /// Marks a live texture most recently used without replacing it.
    pub fn touch(&mut self, key: &TextureKey) -> bool {
        self.live.touch(key)
    }

    /// Binds a live texture for this frame, uploading it if it has no GPU
    /// texture yet. Entries waiting for eviction must be rescued with
    /// [`ResidencyCache::get`] first.
    pub fn enable(
        &mut self,
        key: &TextureKey,
        gpu: &mut GpuContext<'_>,
    ) -> Option<Result<TextureHandle, GpuError>> {
        if !self.live.touch(key) {
            return None;
        }
        let texture = self.live.peek_mut(key)?;
        Some(texture.enable(gpu))
    }

    /// Uploads `texture`, binds it for this frame and caches it.
    ///
    /// On upload failure nothing is cached.
    pub fn insert_enabled(
        &mut self,
        mut texture: CachedTexture,
        gpu: &mut GpuContext<'_>,
    ) -> Result<TextureHandle, GpuError> {
        let handle = texture.enable(gpu)?;
        self.promote(texture);
        Ok(handle)
    }

    /// Demotes every bound texture to resident-unused. Call at frame start.
    pub fn begin_frame(&mut self) {
        self.live.for_each_value_mut(|_, texture| {
            if texture.state == TextureState::Enabled {
                texture.state = TextureState::ResidentUnused;
            }
        });
    }

    /// Marks one texture for eviction.
    pub fn invalidate(&mut self, key: &TextureKey) -> bool {
        match self.live.remove(key) {
            Some(mut texture) => {
                self.mark(&mut texture);
                self.pending.push(texture);
                true
            },
            None => false,
        }
    }

    /// Marks every texture matching `predicate` for eviction.
    pub fn invalidate_where(&mut self, mut predicate: impl FnMut(&TextureKey) -> bool) -> usize {
        let keys: Vec<TextureKey> = self
            .live
            .iter()
            .map(|(k, _)| *k)
            .filter(|k| predicate(k))
            .collect();
        for key in &keys {
            self.invalidate(key);
        }
        keys.len()
    }

    /// Marks every texture for eviction.
    pub fn clear(&mut self) {
        for (_, mut texture) in self.live.drain() {
            self.mark(&mut texture);
            self.pending.push(texture);
        }
    }

    /// Frees the GPU texture of every entry marked since the last cleanup.
    ///
    /// Must run on the render thread after the frame's draw calls.
    pub fn cleanup(&mut self, gpu: &mut GpuContext<'_>) -> usize {
        let mut freed = 0;
        for mut texture in self.pending.drain(..) {
            if texture.release(gpu) {
                freed += 1;
            }
        }
        self.counters.freed += freed as u64;
        if freed > 0 {
            debug!(
                "Freed {freed} textures, {} of {} resident",
                self.live.len(),
                self.max_entries
            );
        }
        freed
    }

    fn enforce_capacity(&mut self) {
        while self.live.len() > self.max_entries {
            match self.live.pop_lru() {
                Some((_, mut evicted)) => {
                    self.mark(&mut evicted);
                    self.pending.push(evicted);
                },
                None => break,
            }
        }
    }

    fn mark(&mut self, texture: &mut CachedTexture) {
        trace!("Marking {:?} for eviction", texture.key);
        texture.state = TextureState::MarkedForEviction;
        self.counters.marked += 1;
    }
}

impl Drop for ResidencyCache {
    fn drop(&mut self) {
        let resident = self
            .pending
            .iter()
            .chain(self.live.iter().map(|(_, t)| t))
            .filter(|t| t.handle.is_some())
            .count();
        if resident > 0 {
            warn!("Residency cache dropped with {resident} GPU textures never freed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::testing::RecordingBackend;
    use crate::tile::PixelFormat;
    use terra_common::TileId;

    fn tile(cacheable: bool) -> Arc<TextureTile> {
        Arc::new(TextureTile {
            id: TileId::new(0, 0, 0),
            bbox: BBox2::new(0.0, 0.0, 4.0, 4.0),
            units_per_pixel: 1.0,
            width: 4,
            height: 4,
            format: PixelFormat::Rgba8,
            pixels: vec![0u8; 64].into(),
            cacheable,
        })
    }

    fn key(id: u64) -> TextureKey {
        TextureKey::new(FragmentId::new(id), SourceId::new(0))
    }

    fn texture(id: u64) -> CachedTexture {
        CachedTexture::new(key(id), tile(true), BBox2::new(0.0, 0.0, 4.0, 4.0))
    }

    fn insert(cache: &mut ResidencyCache, backend: &mut RecordingBackend, id: u64) -> TextureHandle {
        let mut gpu = GpuContext::new(backend);
        cache
            .insert_enabled(texture(id), &mut gpu)
            .expect("upload")
    }

    #[test]
    fn test_lru_victim_is_oldest_untouched_entry() {
        let mut backend = RecordingBackend::default();
        let mut cache = ResidencyCache::new(2);
        insert(&mut cache, &mut backend, 1);
        insert(&mut cache, &mut backend, 2);
        insert(&mut cache, &mut backend, 3);

        assert!(cache.peek(&key(1)).is_none());
        assert!(cache.peek(&key(2)).is_some());
        assert!(cache.peek(&key(3)).is_some());
        assert_eq!(cache.pending_len(), 1);
    }

    #[test]
    fn test_touch_protects_entry_from_eviction() {
        let mut backend = RecordingBackend::default();
        let mut cache = ResidencyCache::new(2);
        insert(&mut cache, &mut backend, 1);
        insert(&mut cache, &mut backend, 2);
        assert!(cache.touch(&key(1)));
        insert(&mut cache, &mut backend, 3);

        assert!(cache.peek(&key(1)).is_some());
        assert!(cache.peek(&key(2)).is_none());
    }

    #[test]
    fn test_eviction_frees_only_on_cleanup() {
        let mut backend = RecordingBackend::default();
        let mut cache = ResidencyCache::new(1);
        let first = insert(&mut cache, &mut backend, 1);
        insert(&mut cache, &mut backend, 2);

        assert!(backend.live.contains(&first));
        assert!(backend.freed.is_empty());

        let freed = cache.cleanup(&mut GpuContext::new(&mut backend));
        assert_eq!(freed, 1);
        assert_eq!(backend.freed, vec![first]);
        assert_eq!(cache.pending_len(), 0);

        // nothing left to free twice
        assert_eq!(cache.cleanup(&mut GpuContext::new(&mut backend)), 0);
    }

    #[test]
    fn test_cache_hit_rescues_marked_entry() {
        let mut backend = RecordingBackend::default();
        let mut cache = ResidencyCache::new(1);
        let first = insert(&mut cache, &mut backend, 1);
        let second = insert(&mut cache, &mut backend, 2);

        let rescued = cache.get(&key(1)).expect("rescued");
        assert_eq!(rescued.handle(), Some(first));
        assert_eq!(rescued.state(), TextureState::ResidentUnused);
        assert_eq!(cache.counters().rescues, 1);

        // the rescue pushed entry 2 out instead
        cache.cleanup(&mut GpuContext::new(&mut backend));
        assert_eq!(backend.freed, vec![second]);
        assert!(backend.live.contains(&first));
    }

    #[test]
    fn test_size_bounded_after_any_sequence() {
        let mut backend = RecordingBackend::default();
        let mut cache = ResidencyCache::new(3);
        for id in [1, 2, 3, 4, 2, 5, 6, 1, 7, 3] {
            if cache.get(&key(id)).is_none() {
                insert(&mut cache, &mut backend, id);
            }
        }
        cache.cleanup(&mut GpuContext::new(&mut backend));
        assert!(cache.len() <= 3);
        assert_eq!(backend.live.len(), cache.len());
    }

    #[test]
    fn test_ineligible_texture_lives_one_frame() {
        let mut backend = RecordingBackend::default();
        let mut cache = ResidencyCache::new(4);
        let degraded = CachedTexture::new(key(9), tile(false), BBox2::new(0.0, 0.0, 4.0, 4.0));
        let handle = cache
            .insert_enabled(degraded, &mut GpuContext::new(&mut backend))
            .expect("upload");

        assert!(cache.is_empty());
        assert!(cache.get(&key(9)).is_none());
        cache.cleanup(&mut GpuContext::new(&mut backend));
        assert_eq!(backend.freed, vec![handle]);
    }

    #[test]
    fn test_replacing_texture_marks_old_one() {
        let mut backend = RecordingBackend::default();
        let mut cache = ResidencyCache::new(4);
        let old = insert(&mut cache, &mut backend, 1);
        let new = insert(&mut cache, &mut backend, 1);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.peek(&key(1)).and_then(CachedTexture::handle), Some(new));
        cache.cleanup(&mut GpuContext::new(&mut backend));
        assert_eq!(backend.freed, vec![old]);
    }

    #[test]
    fn test_begin_frame_demotes_enabled_textures() {
        let mut backend = RecordingBackend::default();
        let mut cache = ResidencyCache::new(4);
        insert(&mut cache, &mut backend, 1);
        assert_eq!(cache.peek(&key(1)).map(CachedTexture::state), Some(TextureState::Enabled));

        cache.begin_frame();
        assert_eq!(
            cache.peek(&key(1)).map(CachedTexture::state),
            Some(TextureState::ResidentUnused)
        );

        let handle = cache
            .enable(&key(1), &mut GpuContext::new(&mut backend))
            .expect("cached")
            .expect("bound");
        assert_eq!(backend.uploads, 1);
        assert_eq!(cache.peek(&key(1)).and_then(CachedTexture::handle), Some(handle));
    }

    #[test]
    fn test_invalidate_where_and_clear() {
        let mut backend = RecordingBackend::default();
        let mut cache = ResidencyCache::new(8);
        for id in 1..=4 {
            insert(&mut cache, &mut backend, id);
        }
        let dropped = cache.invalidate_where(|k| k.fragment.raw() % 2 == 0);
        assert_eq!(dropped, 2);
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.cleanup(&mut GpuContext::new(&mut backend)), 4);
        assert!(backend.live.is_empty());
    }

    #[test]
    fn test_failed_upload_caches_nothing() {
        let mut backend = RecordingBackend {
            fail_uploads: true,
            ..RecordingBackend::default()
        };
        let mut cache = ResidencyCache::new(4);
        let result = cache.insert_enabled(texture(1), &mut GpuContext::new(&mut backend));
        assert!(result.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.pending_len(), 0);
    }
}
