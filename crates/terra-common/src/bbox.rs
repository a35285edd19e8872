//! Axis-aligned bounding boxes in world units.

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle on the ground plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox2 {
    /// Minimum corner (west, south)
    pub min: DVec2,
    /// Maximum corner (east, north)
    pub max: DVec2,
}

impl BBox2 {
    /// Creates a box from two opposite corners in any order.
    #[must_use]
    pub fn from_corners(a: DVec2, b: DVec2) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// Creates a box from its minimum corner and size.
    #[must_use]
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::from_corners(DVec2::new(x, y), DVec2::new(x + width, y + height))
    }

    /// Width along x.
    #[must_use]
    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    /// Height along y.
    #[must_use]
    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    /// Area of the box.
    #[must_use]
    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// Center point.
    #[must_use]
    pub fn center(&self) -> DVec2 {
        (self.min + self.max) * 0.5
    }

    /// Corners in counter-clockwise order starting at `min`.
    #[must_use]
    pub fn corners(&self) -> [DVec2; 4] {
        [
            self.min,
            DVec2::new(self.max.x, self.min.y),
            self.max,
            DVec2::new(self.min.x, self.max.y),
        ]
    }

    /// Checks if this box fully contains `other`, allowing `eps` slack on
    /// every edge.
    #[must_use]
    pub fn contains(&self, other: &BBox2, eps: f64) -> bool {
        other.min.x >= self.min.x - eps
            && other.min.y >= self.min.y - eps
            && other.max.x <= self.max.x + eps
            && other.max.y <= self.max.y + eps
    }

    /// Checks if the interiors of the two boxes overlap.
    #[must_use]
    pub fn intersects(&self, other: &BBox2) -> bool {
        self.min.x < other.max.x
            && self.max.x > other.min.x
            && self.min.y < other.max.y
            && self.max.y > other.min.y
    }

    /// Smallest box covering both.
    #[must_use]
    pub fn union(&self, other: &BBox2) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Checks if any corner of this box coincides with a corner of `other`.
    #[must_use]
    pub fn shares_corner(&self, other: &BBox2, eps: f64) -> bool {
        let theirs = other.corners();
        self.corners()
            .iter()
            .any(|c| theirs.iter().any(|o| c.abs_diff_eq(*o, eps)))
    }

    /// Checks if the two boxes tile their union exactly: they share a full
    /// edge, so the union adds no area beyond the two inputs.
    #[must_use]
    pub fn tiles_with(&self, other: &BBox2, eps: f64) -> bool {
        let same_columns = (self.min.x - other.min.x).abs() <= eps
            && (self.max.x - other.max.x).abs() <= eps;
        let same_rows = (self.min.y - other.min.y).abs() <= eps
            && (self.max.y - other.max.y).abs() <= eps;
        let stacked = (self.max.y - other.min.y).abs() <= eps
            || (other.max.y - self.min.y).abs() <= eps;
        let side_by_side = (self.max.x - other.min.x).abs() <= eps
            || (other.max.x - self.min.x).abs() <= eps;
        (same_columns && stacked) || (same_rows && side_by_side)
    }
}

/// Axis-aligned box in world space, z up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox3 {
    /// Minimum corner
    pub min: DVec3,
    /// Maximum corner
    pub max: DVec3,
}

impl BBox3 {
    /// Creates a box from two opposite corners in any order.
    #[must_use]
    pub fn from_corners(a: DVec3, b: DVec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// Footprint on the ground plane.
    #[must_use]
    pub fn footprint(&self) -> BBox2 {
        BBox2 {
            min: self.min.truncate(),
            max: self.max.truncate(),
        }
    }

    /// Distance from `point` to the nearest point of the box after scaling
    /// heights by `z_scale`. Zero when the point is inside.
    #[must_use]
    pub fn distance_to(&self, point: DVec3, z_scale: f64) -> f64 {
        let scale = DVec3::new(1.0, 1.0, z_scale);
        let min = self.min * scale;
        let max = self.max * scale;
        let nearest = point.clamp(min.min(max), min.max(max));
        nearest.distance(point)
    }
}
