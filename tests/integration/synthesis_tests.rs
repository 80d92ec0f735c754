//! Pyramid synthesis integration tests.
//!
//! Tests verify:
//! - Every synthesized tile covers exactly its level's footprint
//! - Composed tiles carry the downsampled native pixels
//! - Deep levels come from a bounded overview build
//! - The synthesizer works as a manager source end to end

use std::sync::Arc;

use image::{Rgba, RgbaImage};

use pyramid_streamer::{
    synthetic_gradient, CacheConfig, MemoryTileSource, PyramidLevel, PyramidSynthesizer,
    SchedulerConfig, SourceInfo, SynthesisConfig, TileKey, TileManager, TileSource,
};

use super::test_utils::{view_at, visible_only_scheduler, within_timeout, MockTileSource};

// =============================================================================
// Geometry
// =============================================================================

#[tokio::test]
async fn test_every_tile_matches_level_footprint() {
    // 20x20 native grid, six levels
    let native = MemoryTileSource::new(synthetic_gradient(1280, 1280), 64);
    let synth = PyramidSynthesizer::new(native);

    let info = SourceInfo::query(&synth).await.unwrap();
    assert_eq!(info.level_count(), 6);

    for level in info.levels.iter().skip(1) {
        let expected = PyramidLevel::new(1280, 1280, level.index, 64, 64);
        for y in 0..level.tiles_down {
            for x in 0..level.tiles_across {
                let key = TileKey::new(level.index, x, y);
                let tile = synth.get_tile(key).await.unwrap().unwrap();

                assert_eq!(Some(tile.footprint()), expected.footprint(x, y), "{}", key);
                assert_eq!(
                    Some(tile.pixels.dimensions()),
                    expected.tile_pixel_size(x, y),
                    "{}",
                    key
                );
            }
        }
    }
}

#[tokio::test]
async fn test_non_power_of_two_edges() {
    let native = MemoryTileSource::new(synthetic_gradient(1000, 700), 128);
    let synth = PyramidSynthesizer::new(native);
    let info = SourceInfo::query(&synth).await.unwrap();

    // Level 2 is 250x175: two tiles across, two down, edges clipped
    let level = info.level(2).unwrap();
    assert_eq!((level.tiles_across, level.tiles_down), (2, 2));

    let tile = synth.get_tile(TileKey::new(2, 1, 1)).await.unwrap().unwrap();
    assert_eq!(tile.image_x, 512);
    assert_eq!(tile.image_y, 512);
    assert_eq!(tile.width, 1000 - 512);
    assert_eq!(tile.height, 700 - 512);
    assert_eq!(tile.pixels.dimensions(), (122, 47));
}

#[tokio::test]
async fn test_out_of_grid_is_an_error() {
    let native = MemoryTileSource::new(synthetic_gradient(512, 512), 64);
    let synth = PyramidSynthesizer::new(native);

    assert!(synth.get_tile(TileKey::new(1, 4, 0)).await.is_err());
    assert!(synth.get_tile(TileKey::new(9, 0, 0)).await.is_err());
}

// =============================================================================
// Pixels
// =============================================================================

#[tokio::test]
async fn test_composed_tile_keeps_quadrant_colours() {
    // Four solid quadrants, one native tile each
    let mut image = RgbaImage::new(128, 128);
    let colours = [
        Rgba([255, 0, 0, 255]),
        Rgba([0, 255, 0, 255]),
        Rgba([0, 0, 255, 255]),
        Rgba([255, 255, 0, 255]),
    ];
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let quadrant = (y / 64) * 2 + x / 64;
        *pixel = colours[quadrant as usize];
    }

    let native = Arc::new(MemoryTileSource::new(image, 64));
    let synth = PyramidSynthesizer::new(native.clone());

    let tile = synth.get_tile(TileKey::new(1, 0, 0)).await.unwrap().unwrap();
    assert_eq!(tile.pixels.dimensions(), (64, 64));
    assert_eq!(*tile.pixels.get_pixel(8, 8), colours[0]);
    assert_eq!(*tile.pixels.get_pixel(56, 8), colours[1]);
    assert_eq!(*tile.pixels.get_pixel(8, 56), colours[2]);
    assert_eq!(*tile.pixels.get_pixel(56, 56), colours[3]);
    assert_eq!(native.fetch_count(), 4);
}

// =============================================================================
// Overview
// =============================================================================

#[tokio::test]
async fn test_overview_bounds_native_reads() {
    // 32x32 native grid; level 4 would need 256 native tiles per composed tile
    let native = Arc::new(MemoryTileSource::new(synthetic_gradient(2048, 2048), 64));
    let synth = PyramidSynthesizer::new(native.clone());

    for y in 0..2 {
        for x in 0..2 {
            let tile = synth.get_tile(TileKey::new(4, x, y)).await.unwrap().unwrap();
            assert_eq!(tile.pixels.dimensions(), (64, 64));
        }
    }

    assert!(synth.overview_ready());
    assert!(native.fetch_count() <= 36, "fetched {}", native.fetch_count());
}

#[tokio::test]
async fn test_wide_composition_falls_back_to_overview() {
    let native = Arc::new(MemoryTileSource::new(synthetic_gradient(1024, 1024), 64));
    let config = SynthesisConfig {
        max_compose_tiles: 2,
        ..SynthesisConfig::default()
    };
    let synth = PyramidSynthesizer::with_config(native.clone(), config).unwrap();

    // Level 1 needs four native tiles, more than allowed
    let tile = synth.get_tile(TileKey::new(1, 0, 0)).await.unwrap().unwrap();
    assert_eq!(tile.pixels.dimensions(), (64, 64));
    assert!(synth.overview_ready());
}

#[tokio::test]
async fn test_native_tiles_cached_by_synthesizer() {
    let native = Arc::new(MemoryTileSource::new(synthetic_gradient(256, 256), 64));
    let synth = PyramidSynthesizer::new(native.clone());

    let tile = synth.get_tile(TileKey::new(0, 3, 3)).await.unwrap().unwrap();
    assert_eq!(tile.footprint().x, 192);
    assert_eq!(native.fetch_count(), 1);

    synth.get_tile(TileKey::new(0, 3, 3)).await.unwrap().unwrap();
    assert_eq!(native.fetch_count(), 1);
    assert_eq!(synth.native_fetch_count(), 1);
}

#[tokio::test]
async fn test_source_levels_served_by_source() {
    // The source has two levels of its own; only levels 2+ are synthesized
    let source = MockTileSource::new(1024, 1024, 64, 2);
    let synth = PyramidSynthesizer::new(source.clone());
    assert_eq!(synth.level_count().await.unwrap(), 5);

    let key = TileKey::new(1, 2, 3);
    let tile = synth.get_tile(key).await.unwrap().unwrap();
    assert_eq!(*tile.pixels.get_pixel(0, 0), MockTileSource::color_of(key));
    assert_eq!(source.fetch_count(key), 1);
    assert_eq!(synth.native_fetch_count(), 0);

    // Level 2 is composed from native tiles, not from the source's level 1
    synth.get_tile(TileKey::new(2, 0, 0)).await.unwrap().unwrap();
    assert_eq!(synth.native_fetch_count(), 16);
    assert!(source.fetched_keys().iter().all(|key| key.level != 2));
}

// =============================================================================
// End to end
// =============================================================================

#[tokio::test]
async fn test_manager_over_synthesized_pyramid() {
    let native = MemoryTileSource::new(synthetic_gradient(2048, 2048), 64);
    let manager = TileManager::with_config(
        PyramidSynthesizer::new(native),
        CacheConfig::default(),
        visible_only_scheduler(),
    )
    .unwrap();
    assert!(within_timeout(manager.wait_ready()).await);
    assert_eq!(manager.source_info().unwrap().level_count(), 6);

    // Whole image at level 3: a 4x4 grid built from the overview
    let view = view_at(0.125, 1024.0, 1024.0, 256.0);
    assert_eq!(manager.target_level(&view), Some(3));
    manager.get_visible_tiles(&view);
    within_timeout(manager.wait_idle()).await;

    let tiles = manager.get_visible_tiles(&view);
    assert_eq!(tiles.len(), 16);
    assert!(tiles.iter().all(|tile| tile.key.level == 3));
    assert!(manager.source().overview_ready());
    assert!(manager.source().native_fetch_count() <= 36);
    assert_eq!(manager.get_load_stats().failed, 0);
}

#[tokio::test]
async fn test_zoom_in_session_over_synthesized_pyramid() {
    let native = MemoryTileSource::new(synthetic_gradient(4096, 4096), 256);
    let scheduler = SchedulerConfig {
        max_concurrent_loads: 4,
        ..SchedulerConfig::default()
    };
    let manager =
        TileManager::with_config(PyramidSynthesizer::new(native), CacheConfig::default(), scheduler)
            .unwrap();
    assert!(within_timeout(manager.wait_ready()).await);

    for zoom in [0.0625, 0.125, 0.25, 0.5, 1.0] {
        let view = view_at(zoom, 2048.0, 2048.0, 512.0);
        let level = manager.target_level(&view).unwrap();

        manager.get_visible_tiles(&view);
        within_timeout(manager.wait_idle()).await;

        let tiles = manager.get_visible_tiles(&view);
        assert!(!tiles.is_empty(), "zoom {}", zoom);
        assert!(tiles.iter().all(|tile| tile.key.level == level), "zoom {}", zoom);
    }

    let stats = manager.get_load_stats();
    assert_eq!(stats.failed, 0);
    assert!(stats.completed > 0);
}
