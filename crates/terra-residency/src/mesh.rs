//! Collaborator contracts for mesh selection and geometry residency.
//!
//! Both run on the render thread, so neither needs to be `Send`.

use serde::{Deserialize, Serialize};
use terra_common::{BBox3, FragmentId, GeometryError, MeshError};

use crate::lod::ViewParams;

/// A mesh fragment chosen for the current view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshFragment {
    /// Stable fragment identity
    pub id: FragmentId,
    /// World-space bounds, unscaled
    pub bbox: BBox3,
    /// Level of detail; 0 is the coarsest
    pub lod: u32,
}

impl MeshFragment {
    /// Creates a new fragment descriptor.
    #[must_use]
    pub const fn new(id: FragmentId, bbox: BBox3, lod: u32) -> Self {
        Self { id, bbox, lod }
    }
}

/// Authoritative LOD selection over the multi-resolution mesh.
pub trait MeshSource {
    /// Fragments needed to draw `view` within `max_pixel_error` pixels of
    /// geometric error, in draw order.
    fn select(
        &mut self,
        view: &ViewParams,
        max_pixel_error: f64,
        z_scale: f64,
    ) -> Result<Vec<MeshFragment>, MeshError>;
}

/// GPU-side geometry backing store.
pub trait GeometryStore {
    /// Makes the geometry of `fragments` resident.
    ///
    /// On partial failure the error lists the fragments that are not
    /// resident; every other fragment is.
    fn require(&mut self, fragments: &[FragmentId]) -> Result<(), GeometryError>;

    /// Frees the geometry of `fragments`. Unknown ids are ignored.
    fn release(&mut self, fragments: &[FragmentId]);
}
