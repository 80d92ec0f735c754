//! Deep Zoom directory integration tests.
//!
//! Builds a small DZI tile tree of solid JPEG tiles in a temporary directory
//! and streams it through `EncodedTileSource` and `TileManager`.

use std::path::Path;

use tempfile::TempDir;

use pyramid_streamer::{
    dzi_level_dimensions, max_dzi_level, DziDirectoryReader, EncodedTileSource, SourceError,
    TileKey, TileManager, TileSource,
};

use super::test_utils::{
    is_valid_jpeg, roomy_cache, solid_jpeg, view_at, visible_only_scheduler, within_timeout,
};

const WIDTH: u32 = 600;
const HEIGHT: u32 = 400;
const TILE: u32 = 256;

/// Colour of every tile at pyramid level `level`.
fn level_colour(level: u32) -> [u8; 3] {
    match level {
        0 => [200, 40, 40],
        1 => [40, 200, 40],
        _ => [40, 40, 200],
    }
}

/// Write a DZI tree for the three finest pyramid levels.
fn write_pyramid(dir: &Path) {
    let max_level = max_dzi_level(WIDTH, HEIGHT);
    for level in 0..3 {
        let dzi_level = max_level - level;
        let (w, h) = dzi_level_dimensions(WIDTH, HEIGHT, dzi_level);
        let level_dir = dir.join(dzi_level.to_string());
        std::fs::create_dir_all(&level_dir).unwrap();

        for y in 0..h.div_ceil(TILE) {
            for x in 0..w.div_ceil(TILE) {
                let tw = TILE.min(w - x * TILE);
                let th = TILE.min(h - y * TILE);
                let jpeg = solid_jpeg(tw, th, level_colour(level));
                assert!(is_valid_jpeg(&jpeg));
                std::fs::write(level_dir.join(format!("{}_{}.jpeg", x, y)), &jpeg).unwrap();
            }
        }
    }
}

fn pyramid_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_pyramid(dir.path());
    dir
}

fn dzi_source(dir: &TempDir) -> EncodedTileSource<DziDirectoryReader> {
    EncodedTileSource::new(DziDirectoryReader::new(dir.path(), WIDTH, HEIGHT, TILE, "jpeg"))
}

fn close_to(actual: [u8; 4], expected: [u8; 3]) -> bool {
    actual[..3]
        .iter()
        .zip(expected.iter())
        .all(|(a, e)| a.abs_diff(*e) <= 4)
}

#[tokio::test]
async fn test_reads_edge_tile_with_image_footprint() {
    let dir = pyramid_dir();
    let source = dzi_source(&dir);

    // 600 -> 1024 needs 10 DZI levels above 1x1
    assert_eq!(source.level_count().await.unwrap(), max_dzi_level(WIDTH, HEIGHT) + 1);

    let tile = source.get_tile(TileKey::new(0, 2, 1)).await.unwrap().unwrap();
    assert_eq!(tile.footprint().x, 512);
    assert_eq!(tile.footprint().y, 256);
    assert_eq!(tile.pixels.dimensions(), (88, 144));
    assert!(close_to(tile.pixels.get_pixel(10, 10).0, level_colour(0)));

    // Level 1 is 300x200: two tiles across, each covering 512 image pixels
    let tile = source.get_tile(TileKey::new(1, 1, 0)).await.unwrap().unwrap();
    assert_eq!(tile.footprint().x, 512);
    assert_eq!(tile.footprint().width, 88);
    assert_eq!(tile.pixels.dimensions(), (44, 200));
}

#[tokio::test]
async fn test_missing_level_is_not_found() {
    let dir = pyramid_dir();
    let source = dzi_source(&dir);

    // Level 5 exists in the geometry but was never written
    let err = source.get_tile(TileKey::new(5, 0, 0)).await.unwrap_err();
    assert!(matches!(err, SourceError::NotFound(_)), "{:?}", err);
}

#[tokio::test]
async fn test_manager_streams_dzi_directory() {
    let dir = pyramid_dir();
    let source = dzi_source(&dir);
    let manager =
        TileManager::with_config(source, roomy_cache(), visible_only_scheduler()).unwrap();
    assert!(within_timeout(manager.wait_ready()).await);

    // Whole image at native resolution: 3x2 tiles
    let view = view_at(1.0, 300.0, 200.0, 600.0);
    manager.get_visible_tiles(&view);
    within_timeout(manager.wait_idle()).await;

    let tiles = manager.get_visible_tiles(&view);
    assert_eq!(tiles.len(), 6);
    for tile in &tiles {
        assert_eq!(tile.key.level, 0);
        assert!(close_to(tile.pixels.get_pixel(0, 0).0, level_colour(0)));
    }

    // The initial load also brought in the two coarser levels
    let stats = manager.get_load_stats();
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.completed, 6 + 2 + 1);
}

#[tokio::test]
async fn test_manager_survives_missing_tiles() {
    let dir = pyramid_dir();
    std::fs::remove_file(
        dir.path()
            .join(max_dzi_level(WIDTH, HEIGHT).to_string())
            .join("0_0.jpeg"),
    )
    .unwrap();

    let source = dzi_source(&dir);
    let manager =
        TileManager::with_config(source, roomy_cache(), visible_only_scheduler()).unwrap();
    assert!(within_timeout(manager.wait_ready()).await);

    let view = view_at(1.0, 300.0, 200.0, 600.0);
    manager.get_visible_tiles(&view);
    within_timeout(manager.wait_idle()).await;

    // The missing cell falls back to its level 1 parent
    let tiles = manager.get_visible_tiles(&view);
    assert_eq!(tiles.len(), 6);
    assert_eq!(tiles[0].key, TileKey::new(1, 0, 0));
    assert!(tiles.iter().all(|tile| tile.key != TileKey::new(0, 0, 0)));
    assert_eq!(manager.get_load_stats().failed, 1);
}
