//! In-memory native tile source.
//!
//! Serves level-0 tiles cut from a decoded RGBA raster. It reports a single
//! level, so coarser levels come from wrapping it in a
//! [`PyramidSynthesizer`](crate::pyramid::PyramidSynthesizer).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::imageops;
use image::{Rgba, RgbaImage};

use crate::error::SourceError;
use crate::pyramid::PyramidLevel;
use crate::tile::{Tile, TileKey};

use super::TileSource;

/// Native tiles cut on demand from an in-memory raster.
pub struct MemoryTileSource {
    image: Arc<RgbaImage>,
    tile_width: u32,
    tile_height: u32,

    /// Simulated per-fetch latency
    latency: Option<Duration>,

    fetches: AtomicUsize,
    destroyed: AtomicBool,
}

impl MemoryTileSource {
    /// Create a source over `image` with square tiles of `tile_size` pixels.
    pub fn new(image: RgbaImage, tile_size: u32) -> Self {
        Self {
            image: Arc::new(image),
            tile_width: tile_size.max(1),
            tile_height: tile_size.max(1),
            latency: None,
            fetches: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Delay every fetch by `latency`, simulating remote storage.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = (!latency.is_zero()).then_some(latency);
        self
    }

    /// Number of tile fetches served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn native_level(&self) -> PyramidLevel {
        PyramidLevel::new(
            self.image.width(),
            self.image.height(),
            0,
            self.tile_width,
            self.tile_height,
        )
    }
}

#[async_trait]
impl TileSource for MemoryTileSource {
    async fn image_size(&self) -> Result<(u32, u32), SourceError> {
        Ok(self.image.dimensions())
    }

    async fn level_count(&self) -> Result<u32, SourceError> {
        Ok(1)
    }

    fn tile_size(&self, _level: u32) -> (u32, u32) {
        (self.tile_width, self.tile_height)
    }

    async fn get_tile(&self, key: TileKey) -> Result<Option<Tile>, SourceError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SourceError::Destroyed);
        }
        if key.level != 0 {
            return Err(SourceError::InvalidLevel {
                level: key.level,
                level_count: 1,
            });
        }

        let level = self.native_level();
        let footprint = level
            .footprint(key.x, key.y)
            .ok_or(SourceError::TileOutOfBounds {
                level: 0,
                x: key.x,
                y: key.y,
                max_x: level.tiles_across,
                max_y: level.tiles_down,
            })?;

        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let pixels = imageops::crop_imm(
            self.image.as_ref(),
            footprint.x,
            footprint.y,
            footprint.width,
            footprint.height,
        )
        .to_image();

        Ok(Some(Tile::new(key, pixels, footprint)))
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Diagonal RGB gradient, handy for demos and tests.
///
/// Red grows left to right, green top to bottom and blue along a 64-pixel
/// checker so tile seams are easy to spot.
pub fn synthetic_gradient(width: u32, height: u32) -> RgbaImage {
    let w = width.max(1);
    let h = height.max(1);
    RgbaImage::from_fn(w, h, |x, y| {
        let checker = ((x / 64) + (y / 64)) % 2;
        Rgba([
            (x as u64 * 255 / w as u64) as u8,
            (y as u64 * 255 / h as u64) as u8,
            if checker == 0 { 64 } else { 192 },
            255,
        ])
    })
}
