//! Deep Zoom Image (DZI) tile directory reader.
//!
//! Deep Zoom numbers its levels the other way round from this crate:
//! - DZI level 0 = 1x1 pixel (lowest resolution)
//! - DZI max level = full resolution
//!
//! Pyramid level `L` therefore lives in directory `max_dzi_level - L`.
//! Tiles are stored as `{dir}/{dzi_level}/{col}_{row}.{format}` with no
//! overlap.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::SourceError;
use crate::tile::TileKey;

use super::encoded::RawTileReader;

/// Maximum DZI level for the given image dimensions.
///
/// `max_level = ceil(log2(max(width, height)))`
pub fn max_dzi_level(width: u32, height: u32) -> u32 {
    let max_dim = width.max(height) as f64;
    if max_dim <= 1.0 {
        return 0;
    }
    max_dim.log2().ceil() as u32
}

/// Dimensions of the image at a DZI level.
///
/// `ceil(full / 2^(max_level - dzi_level))` per axis, never below 1.
pub fn dzi_level_dimensions(width: u32, height: u32, dzi_level: u32) -> (u32, u32) {
    let max_level = max_dzi_level(width, height);
    if dzi_level > max_level {
        return (0, 0);
    }

    let scale = 1u64 << (max_level - dzi_level);
    let level_width = (width as u64).div_ceil(scale) as u32;
    let level_height = (height as u64).div_ceil(scale) as u32;

    (level_width.max(1), level_height.max(1))
}

// =============================================================================
// DziDirectoryReader
// =============================================================================

/// Reads encoded tiles from an extracted DZI `_files` directory.
pub struct DziDirectoryReader {
    dir: PathBuf,
    identifier: String,
    width: u32,
    height: u32,
    tile_size: u32,
    format: String,
    max_level: u32,
}

impl DziDirectoryReader {
    /// Create a reader for `dir`, which holds one subdirectory per DZI level.
    pub fn new(
        dir: impl Into<PathBuf>,
        width: u32,
        height: u32,
        tile_size: u32,
        format: impl Into<String>,
    ) -> Self {
        let dir = dir.into();
        let format = format.into();
        let format = format.trim_start_matches('.').to_string();

        Self {
            identifier: dir.display().to_string(),
            dir,
            width,
            height,
            tile_size: tile_size.max(1),
            format,
            max_level: max_dzi_level(width, height),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `key`.
    pub fn tile_path(&self, key: &TileKey) -> Option<PathBuf> {
        let dzi_level = self.max_level.checked_sub(key.level)?;
        Some(
            self.dir
                .join(dzi_level.to_string())
                .join(format!("{}_{}.{}", key.x, key.y, self.format)),
        )
    }
}

#[async_trait]
impl RawTileReader for DziDirectoryReader {
    async fn read_tile(&self, key: TileKey) -> Result<Bytes, SourceError> {
        let path = self.tile_path(&key).ok_or(SourceError::InvalidLevel {
            level: key.level,
            level_count: self.max_level + 1,
        })?;

        debug!(key = %key, path = %path.display(), "reading dzi tile");
        let data = tokio::fs::read(&path).await?;
        Ok(Bytes::from(data))
    }

    fn image_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn level_count(&self) -> u32 {
        self.max_level + 1
    }

    fn tile_size(&self, _level: u32) -> (u32, u32) {
        (self.tile_size, self.tile_size)
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
