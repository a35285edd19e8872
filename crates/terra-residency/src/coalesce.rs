//! Request coalescing.
//!
//! Adjacent fragments at the same LOD usually need the same physical tile.
//! Coalescing turns the per-fragment [`TextureRequest`]s of a frame into a
//! small set of [`TileRequest`]s so fetch cost scales with distinct tiles
//! instead of fragment count.

use tracing::trace;

use crate::request::{TextureRequest, TileRequest};

/// Default relative tolerance when matching resolutions.
pub const DEFAULT_RESOLUTION_EPSILON: f64 = 1e-4;

/// Greedy request minimizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coalescer {
    /// Relative resolution tolerance
    epsilon: f64,
    /// Largest tile edge a merge may produce, in pixels
    max_tile_pixels: u32,
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new(DEFAULT_RESOLUTION_EPSILON)
    }
}

impl Coalescer {
    /// Creates a coalescer without a tile size limit.
    #[must_use]
    pub const fn new(epsilon: f64) -> Self {
        Self {
            epsilon,
            max_tile_pixels: u32::MAX,
        }
    }

    /// Limits merged tiles to `pixels` on each edge.
    #[must_use]
    pub const fn with_max_tile_pixels(mut self, pixels: u32) -> Self {
        self.max_tile_pixels = pixels;
        self
    }

    /// Returns the resolution tolerance.
    #[must_use]
    pub const fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Minimizes `requests` into non-redundant tile requests.
    ///
    /// Every input ends up in the superseded set of exactly one output, and
    /// no output supersedes another.
    #[must_use]
    pub fn coalesce(&self, requests: &[TextureRequest]) -> Vec<TileRequest> {
        let mut minimized: Vec<TileRequest> = Vec::with_capacity(requests.len());

        'requests: for request in requests {
            let mut candidate = TileRequest::from_request(*request);

            'scan: loop {
                let mut i = 0;
                while i < minimized.len() {
                    if minimized[i].supersedes(&candidate, self.epsilon) {
                        minimized[i].absorb(candidate);
                        continue 'requests;
                    }
                    if candidate.supersedes(&minimized[i], self.epsilon) {
                        let covered = minimized.swap_remove(i);
                        candidate.absorb(covered);
                        continue;
                    }
                    if self.can_merge(&candidate, &minimized[i]) {
                        let neighbour = minimized.swap_remove(i);
                        candidate = candidate.merge(neighbour);
                        // the grown tile may now reach entries already scanned
                        continue 'scan;
                    }
                    i += 1;
                }
                minimized.push(candidate);
                break;
            }
        }

        trace!(
            "Coalesced {} texture requests into {} tile requests",
            requests.len(),
            minimized.len()
        );
        minimized
    }

    /// Two tiles merge when they sit side by side at the same resolution and
    /// their union is no larger than the pair.
    fn can_merge(&self, a: &TileRequest, b: &TileRequest) -> bool {
        use crate::request::BBOX_EPSILON;

        if !a.resolution_matches(b, self.epsilon) {
            return false;
        }
        if !a.bbox().shares_corner(b.bbox(), BBOX_EPSILON)
            || !a.bbox().tiles_with(b.bbox(), BBOX_EPSILON)
        {
            return false;
        }
        let union = a.bbox().union(b.bbox());
        let upp = a.units_per_pixel().min(b.units_per_pixel());
        let limit = f64::from(self.max_tile_pixels);
        union.width() / upp <= limit + BBOX_EPSILON && union.height() / upp <= limit + BBOX_EPSILON
    }
}

/// Coalesces with the default tolerance and no tile size limit.
#[must_use]
pub fn coalesce(requests: &[TextureRequest]) -> Vec<TileRequest> {
    Coalescer::default().coalesce(requests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use terra_common::{BBox2, FragmentId};

    fn cell(id: u64, col: i32, row: i32, upp: f64) -> TextureRequest {
        TextureRequest::new(
            FragmentId::new(id),
            BBox2::new(f64::from(col) * 64.0, f64::from(row) * 64.0, 64.0, 64.0),
            upp,
        )
    }

    #[test]
    fn test_adjacent_row_collapses_to_one_tile() {
        let requests: Vec<_> = (0..5).map(|i| cell(i, i as i32, 0, 1.0)).collect();
        let tiles = coalesce(&requests);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].superseded().len(), 5);
        assert_eq!(tiles[0].bbox(), &BBox2::new(0.0, 0.0, 320.0, 64.0));
    }

    #[test]
    fn test_square_block_collapses_to_one_tile() {
        let requests = vec![
            cell(1, 0, 0, 2.0),
            cell(2, 1, 0, 2.0),
            cell(3, 0, 1, 2.0),
            cell(4, 1, 1, 2.0),
        ];
        let tiles = coalesce(&requests);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].bbox(), &BBox2::new(0.0, 0.0, 128.0, 128.0));
    }

    #[test]
    fn test_different_resolutions_do_not_merge() {
        let tiles = coalesce(&[cell(1, 0, 0, 1.0), cell(2, 1, 0, 2.0)]);
        assert_eq!(tiles.len(), 2);
    }

    #[test]
    fn test_diagonal_neighbours_do_not_merge() {
        let tiles = coalesce(&[cell(1, 0, 0, 1.0), cell(2, 1, 1, 1.0)]);
        assert_eq!(tiles.len(), 2);
    }

    #[test]
    fn test_finer_covering_request_absorbs_coarser() {
        let big = TextureRequest::new(FragmentId::new(1), BBox2::new(0.0, 0.0, 128.0, 128.0), 1.0);
        let small = cell(2, 0, 0, 4.0);
        for order in [[big, small], [small, big]] {
            let tiles = coalesce(&order);
            assert_eq!(tiles.len(), 1);
            assert_eq!(tiles[0].superseded().len(), 2);
            assert!((tiles[0].units_per_pixel() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_duplicate_fragments_share_one_tile() {
        let tiles = coalesce(&[cell(1, 3, 3, 1.0), cell(2, 3, 3, 1.0)]);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].superseded().len(), 2);
    }

    #[test]
    fn test_tile_size_limit_stops_merging() {
        let requests: Vec<_> = (0..4).map(|i| cell(i, i as i32, 0, 1.0)).collect();
        let tiles = Coalescer::default()
            .with_max_tile_pixels(128)
            .coalesce(&requests);
        assert_eq!(tiles.len(), 2);
        for tile in &tiles {
            assert!(tile.pixel_size().0 <= 128);
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(coalesce(&[]).is_empty());
    }

    fn arb_requests() -> impl Strategy<Value = Vec<TextureRequest>> {
        prop::collection::vec((0..6i32, 0..6i32, 0..3u32), 0..24).prop_map(|cells| {
            cells
                .into_iter()
                .enumerate()
                .map(|(i, (col, row, level))| cell(i as u64, col, row, f64::from(1u32 << level)))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_every_request_superseded_exactly_once(requests in arb_requests()) {
            let tiles = coalesce(&requests);
            let mut seen: HashMap<FragmentId, usize> = HashMap::new();
            for tile in &tiles {
                for sub in tile.superseded() {
                    *seen.entry(sub.fragment).or_default() += 1;
                    prop_assert!(tile.bbox().contains(&sub.bbox, 1e-6));
                    prop_assert!(tile.units_per_pixel() <= sub.units_per_pixel * (1.0 + 1e-4));
                }
            }
            prop_assert_eq!(seen.len(), requests.len());
            prop_assert!(seen.values().all(|&n| n == 1));
        }

        #[test]
        fn prop_no_output_covers_another(requests in arb_requests()) {
            let tiles = coalesce(&requests);
            for (i, a) in tiles.iter().enumerate() {
                for (j, b) in tiles.iter().enumerate() {
                    if i != j {
                        prop_assert!(!a.supersedes(b, DEFAULT_RESOLUTION_EPSILON));
                    }
                }
            }
        }

        #[test]
        fn prop_never_requests_more_area_than_naive(requests in arb_requests()) {
            let tiles = coalesce(&requests);
            let naive: f64 = requests.iter().map(|r| r.bbox.area()).sum();
            let coalesced: f64 = tiles.iter().map(|t| t.bbox().area()).sum();
            prop_assert!(tiles.len() <= requests.len());
            prop_assert!(coalesced <= naive + 1e-6);
        }
    }
}
