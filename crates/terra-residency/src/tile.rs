//! Fetched imagery tiles.

use std::sync::Arc;

use terra_common::{BBox2, TileId};

/// Pixel layout of a tile buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit RGB
    Rgb8,
    /// 8-bit RGBA
    Rgba8,
}

impl PixelFormat {
    /// Bytes per pixel.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb8 => 3,
            Self::Rgba8 => 4,
        }
    }
}

/// Decoded imagery for one tile request. Immutable once fetched and shared
/// by every fragment the tile answers.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureTile {
    /// Tile identity within its source
    pub id: TileId,
    /// Area covered by the pixels
    pub bbox: BBox2,
    /// Resolution of the pixels
    pub units_per_pixel: f64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel layout
    pub format: PixelFormat,
    /// Row-major pixel data
    pub pixels: Arc<[u8]>,
    /// False for degraded tiles that must not outlive the frame
    pub cacheable: bool,
}

impl TextureTile {
    /// Size of the pixel buffer in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.pixels.len()
    }

    /// Texture coordinates of `region` inside this tile, as
    /// `(u_min, v_min, u_max, v_max)`.
    #[must_use]
    pub fn tex_coords(&self, region: &BBox2) -> [f32; 4] {
        let w = self.bbox.width();
        let h = self.bbox.height();
        if w <= 0.0 || h <= 0.0 {
            return [0.0, 0.0, 1.0, 1.0];
        }
        [
            ((region.min.x - self.bbox.min.x) / w) as f32,
            ((region.min.y - self.bbox.min.y) / h) as f32,
            ((region.max.x - self.bbox.min.x) / w) as f32,
            ((region.max.y - self.bbox.min.y) / h) as f32,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tex_coords_of_sub_region() {
        let tile = TextureTile {
            id: TileId::new(0, 0, 0),
            bbox: BBox2::new(0.0, 0.0, 100.0, 50.0),
            units_per_pixel: 1.0,
            width: 100,
            height: 50,
            format: PixelFormat::Rgb8,
            pixels: vec![0u8; 100 * 50 * 3].into(),
            cacheable: true,
        };
        let uv = tile.tex_coords(&BBox2::new(50.0, 0.0, 50.0, 25.0));
        assert_eq!(uv, [0.5, 0.0, 1.0, 0.5]);
        assert_eq!(tile.byte_size(), 15_000);
    }
}
