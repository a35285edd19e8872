//! CPU-side tile cache in front of a tile source.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use terra_common::{SourceError, SourceId};

use crate::lru::LruMap;
use crate::request::{TileKey, TileRequest};
use crate::source::TileSource;
use crate::tile::TextureTile;

/// Keeps the most recently fetched tiles of a source in memory so repeated
/// requests for the same area and resolution skip disk and network.
///
/// Shared by fetch workers, hence the lock.
pub struct CachingTileSource<S> {
    inner: S,
    tiles: Mutex<LruMap<TileKey, Arc<TextureTile>>>,
    capacity: usize,
}

impl<S: TileSource> CachingTileSource<S> {
    /// Wraps `inner` with room for `capacity` tiles.
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            tiles: Mutex::new(LruMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Wrapped source.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of cached tiles.
    pub fn cached(&self) -> usize {
        self.tiles.lock().len()
    }
}

impl<S: TileSource> TileSource for CachingTileSource<S> {
    fn id(&self) -> SourceId {
        self.inner.id()
    }

    fn timeout(&self) -> Option<Duration> {
        self.inner.timeout()
    }

    fn fetch_tile(&self, request: &TileRequest) -> Result<Option<Arc<TextureTile>>, SourceError> {
        let key = request.key();
        if let Some(tile) = self.tiles.lock().get(&key) {
            trace!("{}: tile cache hit {}", self.inner.id(), tile.id);
            return Ok(Some(Arc::clone(tile)));
        }

        // lock is not held across the fetch
        let tile = self.inner.fetch_tile(request)?;
        if let Some(tile) = tile.as_ref().filter(|t| t.cacheable) {
            let mut tiles = self.tiles.lock();
            tiles.insert(key, Arc::clone(tile));
            while tiles.len() > self.capacity {
                tiles.pop_lru();
            }
        }
        Ok(tile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::TextureRequest;
    use crate::tile::PixelFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use terra_common::{BBox2, FragmentId, TileId};

    struct Counting {
        calls: AtomicUsize,
        cacheable: bool,
    }

    impl TileSource for Counting {
        fn id(&self) -> SourceId {
            SourceId::new(7)
        }

        fn fetch_tile(
            &self,
            request: &TileRequest,
        ) -> Result<Option<Arc<TextureTile>>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Arc::new(TextureTile {
                id: TileId::new(1, 0, 0),
                bbox: *request.bbox(),
                units_per_pixel: request.units_per_pixel(),
                width: 2,
                height: 2,
                format: PixelFormat::Rgb8,
                pixels: vec![0u8; 12].into(),
                cacheable: self.cacheable,
            })))
        }
    }

    fn request(x: f64) -> TileRequest {
        TileRequest::from_request(TextureRequest::new(
            FragmentId::new(1),
            BBox2::new(x, 0.0, 2.0, 2.0),
            1.0,
        ))
    }

    #[test]
    fn test_second_fetch_is_served_from_memory() {
        let source = CachingTileSource::new(
            Counting {
                calls: AtomicUsize::new(0),
                cacheable: true,
            },
            4,
        );
        let first = source.fetch_tile(&request(0.0)).expect("fetch").expect("tile");
        let second = source.fetch_tile(&request(0.0)).expect("fetch").expect("tile");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest_tile() {
        let source = CachingTileSource::new(
            Counting {
                calls: AtomicUsize::new(0),
                cacheable: true,
            },
            2,
        );
        for x in [0.0, 2.0, 4.0] {
            source.fetch_tile(&request(x)).expect("fetch");
        }
        assert_eq!(source.cached(), 2);
        source.fetch_tile(&request(0.0)).expect("fetch");
        assert_eq!(source.inner().calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_degraded_tiles_are_not_cached() {
        let source = CachingTileSource::new(
            Counting {
                calls: AtomicUsize::new(0),
                cacheable: false,
            },
            4,
        );
        source.fetch_tile(&request(0.0)).expect("fetch");
        source.fetch_tile(&request(0.0)).expect("fetch");
        assert_eq!(source.cached(), 0);
        assert_eq!(source.inner().calls.load(Ordering::SeqCst), 2);
    }
}
