//! View description and screen-space texture resolution estimates.
//!
//! The mesh source owns geometric LOD. What lives here is the texture side:
//! how many world units one texel may cover for a fragment at a given
//! distance so that it projects to at most `max_projected_texel_size`
//! pixels on screen.

use glam::DVec3;
use serde::{Deserialize, Serialize};
use terra_common::{BBox3, ShaderId};

use crate::config::StreamingConfig;

/// Camera description for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewParams {
    /// Eye position in world units
    pub eye: DVec3,
    /// Viewing direction (need not be normalized)
    pub forward: DVec3,
    /// Up vector
    pub up: DVec3,
    /// Vertical field of view, radians
    pub fov_y: f64,
    /// Near clipping distance
    pub near: f64,
    /// Far clipping distance
    pub far: f64,
}

impl ViewParams {
    /// Creates a view looking from `eye` at `target` with z up.
    #[must_use]
    pub fn look_at(eye: DVec3, target: DVec3, fov_y: f64) -> Self {
        Self {
            eye,
            forward: target - eye,
            up: DVec3::Z,
            fov_y,
            near: 1.0,
            far: 100_000.0,
        }
    }
}

/// Per-frame rendering context supplied by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderContext {
    /// Vertical exaggeration of the terrain
    pub z_scale: f64,
    /// Viewport width in pixels
    pub screen_width: u32,
    /// Viewport height in pixels
    pub screen_height: u32,
    /// Largest texture edge the GPU accepts
    pub max_texture_size: u32,
    /// Compositing programs, indexed by texture count minus one
    pub compositing_shaders: Vec<ShaderId>,
}

impl Default for RenderContext {
    fn default() -> Self {
        Self {
            z_scale: 1.0,
            screen_width: 1280,
            screen_height: 720,
            max_texture_size: 4096,
            compositing_shaders: Vec::new(),
        }
    }
}

impl RenderContext {
    /// Shader for a fragment drawn with `texture_count` texture layers.
    ///
    /// Untextured fragments use the fixed pipeline (`None`). Counts beyond
    /// the configured programs fall back to the widest one.
    #[must_use]
    pub fn shader_for(&self, texture_count: usize) -> Option<ShaderId> {
        if texture_count == 0 {
            return None;
        }
        let idx = (texture_count - 1).min(self.compositing_shaders.len().checked_sub(1)?);
        self.compositing_shaders.get(idx).copied()
    }
}

/// Power-of-two resolution steps anchored at a base resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolutionLadder {
    base: f64,
}

impl ResolutionLadder {
    /// Creates a ladder whose finest rung is `base` units per pixel.
    #[must_use]
    pub fn new(base: f64) -> Self {
        Self { base }
    }

    /// Returns the finest rung.
    #[must_use]
    pub const fn base(&self) -> f64 {
        self.base
    }

    /// Coarsest rung that is still equal to or finer than `units_per_pixel`.
    #[must_use]
    pub fn floor(&self, units_per_pixel: f64) -> f64 {
        if units_per_pixel <= self.base {
            return self.base;
        }
        self.base * (units_per_pixel / self.base).log2().floor().exp2()
    }

    /// Finest rung that is equal to or coarser than `units_per_pixel`.
    #[must_use]
    pub fn ceil(&self, units_per_pixel: f64) -> f64 {
        if units_per_pixel <= self.base {
            return self.base;
        }
        self.base * (units_per_pixel / self.base).log2().ceil().exp2()
    }
}

/// Pixels covered by one world unit at `distance` from the eye.
#[must_use]
pub fn pixels_per_unit(distance: f64, fov_y: f64, screen_height: u32) -> f64 {
    let half_extent = distance * (fov_y * 0.5).tan();
    if half_extent <= f64::EPSILON {
        return f64::INFINITY;
    }
    f64::from(screen_height) / (2.0 * half_extent)
}

/// Texture resolution a fragment needs this frame, in world units per pixel.
///
/// Snapped onto the resolution ladder so neighbours at the same distance
/// band request identical resolutions, then coarsened if the fragment would
/// otherwise need a texture larger than the GPU allows.
#[must_use]
pub fn required_units_per_pixel(
    bbox: &BBox3,
    view: &ViewParams,
    context: &RenderContext,
    config: &StreamingConfig,
) -> f64 {
    let ladder = ResolutionLadder::new(config.base_units_per_pixel);
    let distance = bbox.distance_to(view.eye, context.z_scale).max(view.near);
    let ppu = pixels_per_unit(distance, view.fov_y, context.screen_height);
    let wanted = ladder.floor(config.max_projected_texel_size / ppu);

    let footprint = bbox.footprint();
    let extent = footprint.width().max(footprint.height());
    let limit = extent / f64::from(context.max_texture_size.max(1));
    if wanted < limit {
        ladder.ceil(limit)
    } else {
        wanted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_ladder_floor_and_ceil() {
        let ladder = ResolutionLadder::new(0.5);
        assert!((ladder.floor(0.1) - 0.5).abs() < 1e-12);
        assert!((ladder.floor(3.0) - 2.0).abs() < 1e-12);
        assert!((ladder.ceil(3.0) - 4.0).abs() < 1e-12);
        assert!((ladder.floor(4.0) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_pixels_per_unit_halves_with_distance() {
        let near = pixels_per_unit(100.0, FRAC_PI_2, 1000);
        let far = pixels_per_unit(200.0, FRAC_PI_2, 1000);
        assert!((near - 5.0).abs() < 1e-9);
        assert!((near / far - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_farther_fragments_get_coarser_textures() {
        let config = StreamingConfig::default();
        let context = RenderContext {
            screen_height: 1000,
            ..RenderContext::default()
        };
        let view = ViewParams::look_at(DVec3::new(0.0, 0.0, 10.0), DVec3::X, FRAC_PI_2);
        let near = BBox3::from_corners(DVec3::new(50.0, 0.0, 0.0), DVec3::new(60.0, 10.0, 0.0));
        let far = BBox3::from_corners(DVec3::new(5000.0, 0.0, 0.0), DVec3::new(5010.0, 10.0, 0.0));
        let near_upp = required_units_per_pixel(&near, &view, &context, &config);
        let far_upp = required_units_per_pixel(&far, &view, &context, &config);
        assert!(far_upp > near_upp);
    }

    #[test]
    fn test_texture_size_limit_coarsens_request() {
        let config = StreamingConfig::default();
        let context = RenderContext {
            max_texture_size: 256,
            ..RenderContext::default()
        };
        let view = ViewParams::look_at(DVec3::new(0.0, 0.0, 1.0), DVec3::X, FRAC_PI_2);
        let huge = BBox3::from_corners(DVec3::ZERO, DVec3::new(10_000.0, 10_000.0, 0.0));
        let upp = required_units_per_pixel(&huge, &view, &context, &config);
        assert!(10_000.0 / upp <= 256.0 + 1e-9);
    }

    #[test]
    fn test_shader_selection_by_texture_count() {
        let context = RenderContext {
            compositing_shaders: vec![ShaderId::new(10), ShaderId::new(20)],
            ..RenderContext::default()
        };
        assert_eq!(context.shader_for(0), None);
        assert_eq!(context.shader_for(1), Some(ShaderId::new(10)));
        assert_eq!(context.shader_for(2), Some(ShaderId::new(20)));
        assert_eq!(context.shader_for(5), Some(ShaderId::new(20)));
        assert_eq!(RenderContext::default().shader_for(1), None);
    }
}
