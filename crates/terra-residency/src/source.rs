//! Tile source contract.
//!
//! Sources run on fetch workers. They do I/O and decoding only and never
//! see a GPU context.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use terra_common::{FragmentId, SourceError, SourceId};

use crate::request::TileRequest;
use crate::tile::TextureTile;

/// Tiles answered by one source, per fragment.
pub type TileBatch = HashMap<FragmentId, Arc<TextureTile>>;

/// A texture dataset.
pub trait TileSource: Send + Sync {
    /// Dataset identity.
    fn id(&self) -> SourceId;

    /// How long this source may take per frame. `None` uses the configured
    /// default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Produces the tile for `request`, or `None` if the dataset does not
    /// cover it.
    fn fetch_tile(&self, request: &TileRequest) -> Result<Option<Arc<TextureTile>>, SourceError>;

    /// Answers every fragment superseded by `request`. Sources are free to
    /// answer a subset.
    fn fetch(&self, request: &TileRequest) -> Result<TileBatch, SourceError> {
        Ok(self
            .fetch_tile(request)?
            .map(|tile| fan_out(request, &tile))
            .unwrap_or_default())
    }
}

/// Maps every fragment of `request` to the same shared tile.
#[must_use]
pub fn fan_out(request: &TileRequest, tile: &Arc<TextureTile>) -> TileBatch {
    request
        .fragments()
        .map(|fragment| (fragment, Arc::clone(tile)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::TextureRequest;
    use crate::tile::PixelFormat;
    use terra_common::{BBox2, TileId};

    struct Flat;

    impl TileSource for Flat {
        fn id(&self) -> SourceId {
            SourceId::new(1)
        }

        fn fetch_tile(
            &self,
            request: &TileRequest,
        ) -> Result<Option<Arc<TextureTile>>, SourceError> {
            Ok(Some(Arc::new(TextureTile {
                id: TileId::new(0, 0, 0),
                bbox: *request.bbox(),
                units_per_pixel: request.units_per_pixel(),
                width: 1,
                height: 1,
                format: PixelFormat::Rgb8,
                pixels: vec![1, 2, 3].into(),
                cacheable: true,
            })))
        }
    }

    #[test]
    fn test_default_fetch_fans_out_shared_tile() {
        let a = TextureRequest::new(FragmentId::new(1), BBox2::new(0.0, 0.0, 1.0, 1.0), 1.0);
        let b = TextureRequest::new(FragmentId::new(2), BBox2::new(1.0, 0.0, 1.0, 1.0), 1.0);
        let request = TileRequest::from_request(a).merge(TileRequest::from_request(b));

        let batch = Flat.fetch(&request).expect("fetch");
        assert_eq!(batch.len(), 2);
        let t1 = &batch[&FragmentId::new(1)];
        let t2 = &batch[&FragmentId::new(2)];
        assert!(Arc::ptr_eq(t1, t2));
        assert_eq!(Flat.timeout(), None);
    }
}
