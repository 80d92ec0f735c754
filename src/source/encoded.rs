//! Decoding adapter for sources that store encoded tiles.
//!
//! A [`RawTileReader`] returns the encoded bytes of one tile (JPEG, PNG, ...).
//! [`EncodedTileSource`] turns it into a [`TileSource`] by decoding each tile
//! to RGBA on the blocking thread pool and attaching its image-space
//! footprint.

use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageReader, RgbaImage};
use tracing::debug;

use crate::error::SourceError;
use crate::tile::{Tile, TileKey};

use super::{SourceInfo, TileSource};

// =============================================================================
// RawTileReader Trait
// =============================================================================

/// Reader for encoded tile bytes.
#[async_trait]
pub trait RawTileReader: Send + Sync + 'static {
    /// Read the encoded bytes of one tile.
    async fn read_tile(&self, key: TileKey) -> Result<Bytes, SourceError>;

    /// Full-resolution image size.
    fn image_size(&self) -> (u32, u32);

    /// Number of pyramid levels.
    fn level_count(&self) -> u32;

    /// Nominal tile size at `level`.
    fn tile_size(&self, level: u32) -> (u32, u32);

    /// Identifier for logging (path, URL, ...).
    fn identifier(&self) -> &str;
}

// =============================================================================
// EncodedTileSource
// =============================================================================

/// [`TileSource`] that decodes tiles read by a [`RawTileReader`].
pub struct EncodedTileSource<R> {
    reader: R,
    info: SourceInfo,
}

impl<R: RawTileReader> EncodedTileSource<R> {
    pub fn new(reader: R) -> Self {
        let (width, height) = reader.image_size();
        let info = SourceInfo::new(width, height, reader.level_count(), |level| {
            reader.tile_size(level)
        });
        Self { reader, info }
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }
}

/// Decode encoded tile bytes to RGBA, guessing the format from its contents.
pub(crate) fn decode_rgba(data: &[u8]) -> Result<RgbaImage, SourceError> {
    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| SourceError::Decode {
            message: e.to_string(),
        })?;

    let image = reader.decode()?;
    Ok(image.to_rgba8())
}

#[async_trait]
impl<R: RawTileReader> TileSource for EncodedTileSource<R> {
    async fn image_size(&self) -> Result<(u32, u32), SourceError> {
        Ok((self.info.width, self.info.height))
    }

    async fn level_count(&self) -> Result<u32, SourceError> {
        Ok(self.info.level_count())
    }

    fn tile_size(&self, level: u32) -> (u32, u32) {
        self.reader.tile_size(level)
    }

    async fn get_tile(&self, key: TileKey) -> Result<Option<Tile>, SourceError> {
        let level = *self.info.check_key(&key)?;
        let footprint = level
            .footprint(key.x, key.y)
            .ok_or(SourceError::TileOutOfBounds {
                level: key.level,
                x: key.x,
                y: key.y,
                max_x: level.tiles_across,
                max_y: level.tiles_down,
            })?;

        let data = self.reader.read_tile(key).await?;
        if data.is_empty() {
            debug!(key = %key, source = self.reader.identifier(), "empty tile data");
            return Ok(None);
        }

        let mut pixels = tokio::task::spawn_blocking(move || decode_rgba(&data))
            .await
            .map_err(|e| SourceError::Decode {
                message: format!("decode task failed: {}", e),
            })??;

        // Encoders sometimes pad edge tiles to the full tile size.
        if let Some((w, h)) = level.tile_pixel_size(key.x, key.y) {
            if pixels.width() > w || pixels.height() > h {
                pixels = image::imageops::crop_imm(
                    &pixels,
                    0,
                    0,
                    w.min(pixels.width()),
                    h.min(pixels.height()),
                )
                .to_image();
            }
        }

        Ok(Some(Tile::new(key, pixels, footprint)))
    }
}

// =============================================================================
// Tests
// =============================================================================
