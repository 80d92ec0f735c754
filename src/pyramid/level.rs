//! Pyramid level geometry.
//!
//! Levels are derived from the full-resolution image size and the tile size:
//! level 0 is native resolution and each subsequent level halves the linear
//! resolution of the previous one, rounding up.
//!
//! Two coordinate spaces are used throughout the crate:
//!
//! - **Image space**: full-resolution (level 0) pixel coordinates. Tiles are
//!   placed using their image-space footprint regardless of their level.
//! - **Level space**: pixel coordinates of a level's downsampled image, used to
//!   compute tile grids and output raster sizes.

use serde::Serialize;

/// Maximum number of levels a pyramid may have.
///
/// Beyond this the downsample factor no longer fits comfortably in a `u32`.
pub const MAX_LEVELS: u32 = 31;

// =============================================================================
// ImageRect
// =============================================================================

/// Axis-aligned rectangle in image-space pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ImageRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl ImageRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Exclusive right edge.
    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Intersection of two rectangles, or `None` if they do not overlap.
    pub fn intersect(&self, other: &ImageRect) -> Option<ImageRect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());

        if x1 <= x0 as u64 || y1 <= y0 as u64 {
            return None;
        }

        Some(ImageRect {
            x: x0,
            y: y0,
            width: (x1 - x0 as u64) as u32,
            height: (y1 - y0 as u64) as u32,
        })
    }
}

// =============================================================================
// Level math
// =============================================================================

/// Linear downsample factor of a level relative to level 0 (`2^level`).
#[inline]
pub fn downsample_factor(level: u32) -> u64 {
    1u64 << level.min(MAX_LEVELS)
}

/// Size of one image dimension at the given level: `ceil(full / 2^level)`.
#[inline]
pub fn level_dimension(full: u32, level: u32) -> u32 {
    let factor = downsample_factor(level);
    (full as u64).div_ceil(factor) as u32
}

/// Number of levels needed so that the coarsest level's smaller dimension
/// fits within one tile.
///
/// Always returns at least 1.
pub fn level_count_for(width: u32, height: u32, tile_width: u32, tile_height: u32) -> u32 {
    let min_dim = width.min(height);
    let tile = tile_width.min(tile_height).max(1);

    let mut count = 1;
    while count < MAX_LEVELS && level_dimension(min_dim, count - 1) > tile {
        count += 1;
    }
    count
}

// =============================================================================
// PyramidLevel
// =============================================================================

/// Derived geometry of a single pyramid level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PyramidLevel {
    /// Level index (0 = full resolution)
    pub index: u32,

    /// Full-resolution image width
    pub image_width: u32,

    /// Full-resolution image height
    pub image_height: u32,

    /// Width of this level in pixels
    pub width: u32,

    /// Height of this level in pixels
    pub height: u32,

    /// Linear scale relative to level 0 (`1 / 2^index`)
    pub scale: f64,

    /// Nominal tile width in level pixels
    pub tile_width: u32,

    /// Nominal tile height in level pixels
    pub tile_height: u32,

    /// Number of tiles in X direction
    pub tiles_across: u32,

    /// Number of tiles in Y direction
    pub tiles_down: u32,
}

impl PyramidLevel {
    /// Compute the geometry of `index` for an image of the given size.
    pub fn new(
        image_width: u32,
        image_height: u32,
        index: u32,
        tile_width: u32,
        tile_height: u32,
    ) -> Self {
        let width = level_dimension(image_width, index);
        let height = level_dimension(image_height, index);
        let tile_width = tile_width.max(1);
        let tile_height = tile_height.max(1);

        Self {
            index,
            image_width,
            image_height,
            width,
            height,
            scale: 1.0 / downsample_factor(index) as f64,
            tile_width,
            tile_height,
            tiles_across: width.div_ceil(tile_width),
            tiles_down: height.div_ceil(tile_height),
        }
    }

    /// Downsample factor of this level (`2^index`).
    pub fn downsample(&self) -> u64 {
        downsample_factor(self.index)
    }

    /// Total number of tiles at this level.
    pub fn tile_count(&self) -> u64 {
        self.tiles_across as u64 * self.tiles_down as u64
    }

    /// Whether `(x, y)` lies inside this level's tile grid.
    pub fn contains_tile(&self, x: u32, y: u32) -> bool {
        x < self.tiles_across && y < self.tiles_down
    }

    /// Image-space footprint of tile `(x, y)`.
    ///
    /// Edge tiles are clipped to the image, so the footprint may be smaller
    /// than `tile_size * 2^level`. Returns `None` outside the grid.
    pub fn footprint(&self, x: u32, y: u32) -> Option<ImageRect> {
        if !self.contains_tile(x, y) {
            return None;
        }

        let factor = self.downsample();
        let span_x = self.tile_width as u64 * factor;
        let span_y = self.tile_height as u64 * factor;
        let x0 = x as u64 * span_x;
        let y0 = y as u64 * span_y;

        if x0 >= self.image_width as u64 || y0 >= self.image_height as u64 {
            return None;
        }

        Some(ImageRect {
            x: x0 as u32,
            y: y0 as u32,
            width: span_x.min(self.image_width as u64 - x0) as u32,
            height: span_y.min(self.image_height as u64 - y0) as u32,
        })
    }

    /// Pixel size of tile `(x, y)` in level space.
    pub fn tile_pixel_size(&self, x: u32, y: u32) -> Option<(u32, u32)> {
        if !self.contains_tile(x, y) {
            return None;
        }

        let x0 = x * self.tile_width;
        let y0 = y * self.tile_height;
        Some((
            self.tile_width.min(self.width - x0),
            self.tile_height.min(self.height - y0),
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================
