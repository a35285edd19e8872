//! Texture and tile request data model.

use terra_common::{BBox2, FragmentId};

/// Slack used when comparing box edges in world units.
pub const BBOX_EPSILON: f64 = 1e-6;

/// What one fragment needs this frame: imagery over its footprint at a
/// given resolution. Rebuilt every frame, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureRequest {
    /// Fragment that will be textured
    pub fragment: FragmentId,
    /// Fragment footprint
    pub bbox: BBox2,
    /// Required resolution; smaller is finer
    pub units_per_pixel: f64,
}

impl TextureRequest {
    /// Creates a new texture request.
    #[must_use]
    pub const fn new(fragment: FragmentId, bbox: BBox2, units_per_pixel: f64) -> Self {
        Self {
            fragment,
            bbox,
            units_per_pixel,
        }
    }
}

/// Exact identity of a tile request, usable as a hash key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey([u64; 5]);

/// One physical tile fetch covering one or more texture requests.
///
/// The bbox covers the bbox of every superseded request and the resolution
/// is equal to or finer than each of theirs.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRequest {
    bbox: BBox2,
    units_per_pixel: f64,
    superseded: Vec<TextureRequest>,
}

impl TileRequest {
    /// Wraps a single texture request.
    #[must_use]
    pub fn from_request(request: TextureRequest) -> Self {
        Self {
            bbox: request.bbox,
            units_per_pixel: request.units_per_pixel,
            superseded: vec![request],
        }
    }

    /// Area covered by the tile.
    #[must_use]
    pub const fn bbox(&self) -> &BBox2 {
        &self.bbox
    }

    /// Resolution of the tile.
    #[must_use]
    pub const fn units_per_pixel(&self) -> f64 {
        self.units_per_pixel
    }

    /// Texture requests answered by this tile.
    #[must_use]
    pub fn superseded(&self) -> &[TextureRequest] {
        &self.superseded
    }

    /// Fragments answered by this tile.
    pub fn fragments(&self) -> impl Iterator<Item = FragmentId> + '_ {
        self.superseded.iter().map(|r| r.fragment)
    }

    /// Tile size in pixels.
    #[must_use]
    pub fn pixel_size(&self) -> (u32, u32) {
        (
            (self.bbox.width() / self.units_per_pixel).ceil() as u32,
            (self.bbox.height() / self.units_per_pixel).ceil() as u32,
        )
    }

    /// Hashable identity of the area and resolution.
    #[must_use]
    pub fn key(&self) -> TileKey {
        TileKey([
            self.bbox.min.x.to_bits(),
            self.bbox.min.y.to_bits(),
            self.bbox.max.x.to_bits(),
            self.bbox.max.y.to_bits(),
            self.units_per_pixel.to_bits(),
        ])
    }

    /// Checks if the two resolutions are equal within a relative tolerance.
    #[must_use]
    pub fn resolution_matches(&self, other: &TileRequest, epsilon: f64) -> bool {
        let scale = self.units_per_pixel.max(other.units_per_pixel);
        (self.units_per_pixel - other.units_per_pixel).abs() <= epsilon * scale
    }

    /// Checks if this tile covers `other` at equal or finer resolution.
    #[must_use]
    pub fn supersedes(&self, other: &TileRequest, epsilon: f64) -> bool {
        self.bbox.contains(&other.bbox, BBOX_EPSILON)
            && self.units_per_pixel <= other.units_per_pixel * (1.0 + epsilon)
    }

    /// Takes over the texture requests of a tile this one supersedes.
    pub fn absorb(&mut self, other: TileRequest) {
        self.superseded.extend(other.superseded);
    }

    /// Combines two tiles into one covering both at the finer resolution.
    #[must_use]
    pub fn merge(mut self, other: TileRequest) -> Self {
        self.bbox = self.bbox.union(&other.bbox);
        self.units_per_pixel = self.units_per_pixel.min(other.units_per_pixel);
        self.superseded.extend(other.superseded);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(id: u64, x: f64, upp: f64) -> TileRequest {
        TileRequest::from_request(TextureRequest::new(
            FragmentId::new(id),
            BBox2::new(x, 0.0, 1.0, 1.0),
            upp,
        ))
    }

    #[test]
    fn test_supersedes_requires_finer_or_equal_resolution() {
        let coarse = tile(1, 0.0, 2.0);
        let fine = tile(2, 0.0, 1.0);
        assert!(fine.supersedes(&coarse, 1e-4));
        assert!(!coarse.supersedes(&fine, 1e-4));
        assert!(fine.supersedes(&fine.clone(), 1e-4));
    }

    #[test]
    fn test_merge_unions_bbox_and_keeps_requests() {
        let merged = tile(1, 0.0, 1.0).merge(tile(2, 1.0, 1.0));
        assert_eq!(merged.bbox(), &BBox2::new(0.0, 0.0, 2.0, 1.0));
        let ids: Vec<_> = merged.fragments().map(FragmentId::raw).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(merged.pixel_size(), (2, 1));
    }

    #[test]
    fn test_key_identifies_area_and_resolution() {
        assert_eq!(tile(1, 0.0, 1.0).key(), tile(9, 0.0, 1.0).key());
        assert_ne!(tile(1, 0.0, 1.0).key(), tile(1, 0.0, 0.5).key());
    }
}
