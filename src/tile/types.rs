//! Tile identity and payload.

use std::fmt;
use std::sync::Arc;

use image::RgbaImage;
use serde::Serialize;

use crate::pyramid::ImageRect;

/// Bytes per pixel of the decoded RGBA payload.
pub const BYTES_PER_PIXEL: usize = 4;

// =============================================================================
// TileKey
// =============================================================================

/// Identity of one pyramid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TileKey {
    /// Pyramid level (0 = highest resolution)
    pub level: u32,

    /// Tile X coordinate (0-indexed from left)
    pub x: u32,

    /// Tile Y coordinate (0-indexed from top)
    pub y: u32,
}

impl TileKey {
    pub const fn new(level: u32, x: u32, y: u32) -> Self {
        Self { level, x, y }
    }

    /// The tile `levels` steps coarser that covers this tile's area.
    pub fn ancestor(&self, levels: u32) -> TileKey {
        let shift = levels.min(31);
        TileKey {
            level: self.level + levels,
            x: self.x >> shift,
            y: self.y >> shift,
        }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.level, self.x, self.y)
    }
}

// =============================================================================
// GpuHandle
// =============================================================================

/// Opaque handle to a GPU-resident copy of a tile.
///
/// The render backend owns the resource; the cache only remembers the handle
/// so it can tell the backend when the tile is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GpuHandle(pub u64);

// =============================================================================
// Tile
// =============================================================================

/// A decoded tile.
///
/// `image_x`, `image_y`, `width` and `height` describe where the tile sits in
/// full-resolution image space. The pixel payload may have a lower resolution
/// than that footprint (every level above 0 does); renderers place tiles with
/// the footprint and sample from the payload.
#[derive(Debug, Clone)]
pub struct Tile {
    pub key: TileKey,

    /// Decoded RGBA pixels, shared with any renderer holding the tile
    pub pixels: Arc<RgbaImage>,

    /// Left edge in image space
    pub image_x: u32,

    /// Top edge in image space
    pub image_y: u32,

    /// Footprint width in image space
    pub width: u32,

    /// Footprint height in image space
    pub height: u32,

    /// Whether the tile was part of the most recent visible set
    pub visible: bool,

    /// Logical access time assigned by the cache
    pub last_access: u64,

    /// GPU copy, if the renderer uploaded one
    pub gpu: Option<GpuHandle>,
}

impl Tile {
    pub fn new(key: TileKey, pixels: RgbaImage, footprint: ImageRect) -> Self {
        Self::from_shared(key, Arc::new(pixels), footprint)
    }

    pub fn from_shared(key: TileKey, pixels: Arc<RgbaImage>, footprint: ImageRect) -> Self {
        Self {
            key,
            pixels,
            image_x: footprint.x,
            image_y: footprint.y,
            width: footprint.width,
            height: footprint.height,
            visible: false,
            last_access: 0,
            gpu: None,
        }
    }

    /// Image-space footprint.
    pub fn footprint(&self) -> ImageRect {
        ImageRect::new(self.image_x, self.image_y, self.width, self.height)
    }

    pub fn pixel_width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn pixel_height(&self) -> u32 {
        self.pixels.height()
    }

    /// Whether the payload holds any pixels at all.
    pub fn has_pixels(&self) -> bool {
        self.pixels.width() > 0 && self.pixels.height() > 0
    }

    /// Estimated memory footprint of the decoded payload.
    pub fn byte_size(&self) -> usize {
        self.pixels.width() as usize * self.pixels.height() as usize * BYTES_PER_PIXEL
    }
}
