//! Viewport projection and visible-region math.
//!
//! The view transform maps image space (level 0 pixels) to screen pixels.
//! From it we derive the zoom factor, the target pyramid level and the range
//! of tiles the viewport covers at that level.

use glam::{DAffine2, DVec2};
use serde::Serialize;

use crate::pyramid::{ImageRect, PyramidLevel};
use crate::tile::TileKey;

// =============================================================================
// ViewProjection
// =============================================================================

/// Image-to-screen transform plus viewport size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewProjection {
    /// Image space to screen space
    pub view: DAffine2,

    /// Screen space to image space
    pub inverse: DAffine2,

    /// Viewport width in screen pixels
    pub viewport_width: f64,

    /// Viewport height in screen pixels
    pub viewport_height: f64,
}

impl ViewProjection {
    /// Build a projection from a view transform, computing its inverse.
    pub fn new(view: DAffine2, viewport_width: f64, viewport_height: f64) -> Self {
        Self::from_parts(view, view.inverse(), viewport_width, viewport_height)
    }

    /// Build a projection from a view transform and a precomputed inverse.
    pub fn from_parts(
        view: DAffine2,
        inverse: DAffine2,
        viewport_width: f64,
        viewport_height: f64,
    ) -> Self {
        Self {
            view,
            inverse,
            viewport_width,
            viewport_height,
        }
    }

    /// View centred on `center` (image space) at `zoom` screen pixels per
    /// image pixel, rotated by `rotation` radians.
    pub fn centered(
        center: DVec2,
        zoom: f64,
        rotation: f64,
        viewport_width: f64,
        viewport_height: f64,
    ) -> Self {
        let half_viewport = DVec2::new(viewport_width, viewport_height) * 0.5;
        let view = DAffine2::from_translation(half_viewport)
            * DAffine2::from_scale_angle_translation(DVec2::splat(zoom), rotation, DVec2::ZERO)
            * DAffine2::from_translation(-center);
        Self::new(view, viewport_width, viewport_height)
    }

    /// Screen pixels per image pixel, from the linear part of the transform.
    pub fn zoom(&self) -> f64 {
        self.view.matrix2.x_axis.length()
    }

    /// Axis-aligned image-space bounds of the viewport, clamped to an image
    /// of the given size. `None` if the viewport misses the image.
    pub fn visible_image_rect(&self, image_width: u32, image_height: u32) -> Option<ImageRect> {
        let corners = [
            DVec2::new(0.0, 0.0),
            DVec2::new(self.viewport_width, 0.0),
            DVec2::new(0.0, self.viewport_height),
            DVec2::new(self.viewport_width, self.viewport_height),
        ];

        let mut min = DVec2::splat(f64::INFINITY);
        let mut max = DVec2::splat(f64::NEG_INFINITY);
        for corner in corners {
            let point = self.inverse.transform_point2(corner);
            min = min.min(point);
            max = max.max(point);
        }

        if !(min.is_finite() && max.is_finite()) {
            return None;
        }

        let x0 = min.x.floor().clamp(0.0, image_width as f64) as u32;
        let y0 = min.y.floor().clamp(0.0, image_height as f64) as u32;
        let x1 = max.x.ceil().clamp(0.0, image_width as f64) as u32;
        let y1 = max.y.ceil().clamp(0.0, image_height as f64) as u32;

        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(ImageRect::new(x0, y0, x1 - x0, y1 - y0))
    }
}

/// Pyramid level for a zoom factor.
///
/// `floor(-log2(zoom))` clamped to the pyramid when zooming out, level 0 at
/// or above native resolution. Degenerate zooms fall back to the coarsest
/// level.
pub fn select_level(zoom: f64, level_count: u32) -> u32 {
    let last = level_count.saturating_sub(1);
    if last == 0 {
        return 0;
    }
    if !zoom.is_finite() || zoom <= 0.0 {
        return last;
    }
    if zoom >= 1.0 {
        return 0;
    }

    let level = (-zoom.log2()).floor();
    (level.max(0.0) as u32).min(last)
}

// =============================================================================
// TileRange
// =============================================================================

/// Half-open rectangle of tile indices at one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileRange {
    pub level: u32,
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl TileRange {
    /// Tiles of `level` that intersect the image-space rectangle `rect`.
    pub fn covering(level: &PyramidLevel, rect: &ImageRect) -> Self {
        let span_x = level.tile_width as u64 * level.downsample();
        let span_y = level.tile_height as u64 * level.downsample();

        let x0 = ((rect.x as u64 / span_x) as u32).min(level.tiles_across);
        let y0 = ((rect.y as u64 / span_y) as u32).min(level.tiles_down);
        let x1 = (rect.right().div_ceil(span_x) as u32).min(level.tiles_across);
        let y1 = (rect.bottom().div_ceil(span_y) as u32).min(level.tiles_down);

        Self {
            level: level.index,
            x0,
            y0,
            x1: x1.max(x0),
            y1: y1.max(y0),
        }
    }

    /// Grow the range by `margin` tiles on every side, clamped to the grid.
    pub fn expand(&self, margin: u32, level: &PyramidLevel) -> Self {
        Self {
            level: self.level,
            x0: self.x0.saturating_sub(margin),
            y0: self.y0.saturating_sub(margin),
            x1: self.x1.saturating_add(margin).min(level.tiles_across),
            y1: self.y1.saturating_add(margin).min(level.tiles_down),
        }
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        key.level == self.level
            && key.x >= self.x0
            && key.x < self.x1
            && key.y >= self.y0
            && key.y < self.y1
    }

    pub fn len(&self) -> usize {
        (self.x1 - self.x0) as usize * (self.y1 - self.y0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys in row-major order.
    pub fn keys(&self) -> impl Iterator<Item = TileKey> + '_ {
        (self.y0..self.y1)
            .flat_map(move |y| (self.x0..self.x1).map(move |x| TileKey::new(self.level, x, y)))
    }
}

/// Centre of an image-space rectangle in tile-grid units of `level`.
pub fn grid_center(level: &PyramidLevel, rect: &ImageRect) -> DVec2 {
    let span = DVec2::new(
        (level.tile_width as u64 * level.downsample()) as f64,
        (level.tile_height as u64 * level.downsample()) as f64,
    );
    let center = DVec2::new(
        rect.x as f64 + rect.width as f64 * 0.5,
        rect.y as f64 + rect.height as f64 * 0.5,
    );
    center / span
}

/// Euclidean distance from a tile's centre to `center`, in tile units.
pub fn tile_distance(key: &TileKey, center: DVec2) -> f64 {
    DVec2::new(key.x as f64 + 0.5, key.y as f64 + 0.5).distance(center)
}
