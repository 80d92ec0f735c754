//! Tile sources.
//!
//! A [`TileSource`] is anything that can answer "give me the decoded pixels of
//! tile `(level, x, y)`" together with the pyramid's metadata. The scheduler
//! treats sources as opaque async functions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 TileManager                  │
//! └──────────────────────┬───────────────────────┘
//!                        │ TileSource
//!          ┌─────────────┴──────────────┐
//!          ▼                            ▼
//! ┌─────────────────────┐   ┌───────────────────────┐
//! │ PyramidSynthesizer  │   │  EncodedTileSource    │
//! │ (coarse levels from │   │  (decode bytes from   │
//! │  native tiles)      │   │   a RawTileReader)    │
//! └──────────┬──────────┘   └───────────┬───────────┘
//!            ▼                          ▼
//! ┌─────────────────────┐   ┌───────────────────────┐
//! │  MemoryTileSource   │   │  DziDirectoryReader   │
//! │  (level 0 only)     │   │  (DZI tile directory) │
//! └─────────────────────┘   └───────────────────────┘
//! ```

mod dzi;
mod encoded;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::SourceError;
use crate::pyramid::PyramidLevel;
use crate::tile::{Tile, TileKey};

pub use dzi::{dzi_level_dimensions, max_dzi_level, DziDirectoryReader};
pub use encoded::{EncodedTileSource, RawTileReader};
pub use memory::{synthetic_gradient, MemoryTileSource};

// =============================================================================
// TileSource Trait
// =============================================================================

/// Format-agnostic provider of decoded tiles.
///
/// Implementations must be thread-safe; fetches for different tiles run
/// concurrently.
#[async_trait]
pub trait TileSource: Send + Sync + 'static {
    /// Full-resolution image size as `(width, height)`.
    async fn image_size(&self) -> Result<(u32, u32), SourceError>;

    /// Number of pyramid levels (at least 1).
    async fn level_count(&self) -> Result<u32, SourceError>;

    /// Nominal tile size at `level`. Edge tiles may be smaller.
    fn tile_size(&self, level: u32) -> (u32, u32);

    /// Fetch and decode one tile.
    ///
    /// `Ok(None)` means the source has no data for the cell; the scheduler
    /// treats it like a failed fetch.
    async fn get_tile(&self, key: TileKey) -> Result<Option<Tile>, SourceError>;

    /// Release any resources held by the source.
    fn destroy(&self) {}
}

#[async_trait]
impl<S: TileSource + ?Sized> TileSource for Arc<S> {
    async fn image_size(&self) -> Result<(u32, u32), SourceError> {
        (**self).image_size().await
    }

    async fn level_count(&self) -> Result<u32, SourceError> {
        (**self).level_count().await
    }

    fn tile_size(&self, level: u32) -> (u32, u32) {
        (**self).tile_size(level)
    }

    async fn get_tile(&self, key: TileKey) -> Result<Option<Tile>, SourceError> {
        (**self).get_tile(key).await
    }

    fn destroy(&self) {
        (**self).destroy()
    }
}

// =============================================================================
// SourceInfo
// =============================================================================

/// Pyramid metadata reported by a source once it is initialized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceInfo {
    /// Full-resolution width
    pub width: u32,

    /// Full-resolution height
    pub height: u32,

    /// Geometry of every level, finest first
    pub levels: Vec<PyramidLevel>,
}

impl SourceInfo {
    /// Build the level table for an image of the given size.
    pub fn new(
        width: u32,
        height: u32,
        level_count: u32,
        tile_size: impl Fn(u32) -> (u32, u32),
    ) -> Self {
        let levels = (0..level_count.max(1))
            .map(|index| {
                let (tw, th) = tile_size(index);
                PyramidLevel::new(width, height, index, tw, th)
            })
            .collect();

        Self {
            width,
            height,
            levels,
        }
    }

    /// Query a source for its metadata.
    pub async fn query<S: TileSource + ?Sized>(source: &S) -> Result<Self, SourceError> {
        let (width, height) = source.image_size().await?;
        let level_count = source.level_count().await?;
        Ok(Self::new(width, height, level_count, |level| {
            source.tile_size(level)
        }))
    }

    pub fn level_count(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn level(&self, index: u32) -> Option<&PyramidLevel> {
        self.levels.get(index as usize)
    }

    /// Validate that `key` addresses a tile inside the pyramid.
    pub fn check_key(&self, key: &TileKey) -> Result<&PyramidLevel, SourceError> {
        let level = self.level(key.level).ok_or(SourceError::InvalidLevel {
            level: key.level,
            level_count: self.level_count(),
        })?;

        if !level.contains_tile(key.x, key.y) {
            return Err(SourceError::TileOutOfBounds {
                level: key.level,
                x: key.x,
                y: key.y,
                max_x: level.tiles_across,
                max_y: level.tiles_down,
            });
        }

        Ok(level)
    }
}
