//! Load scheduler integration tests.
//!
//! These tests drive a `TileManager` over a mock source whose fetches can be
//! held, failed or blanked, and verify:
//! - Viewport queries never wait on fetches
//! - Each missing tile is fetched once while it is loading
//! - Level selection at zoom boundaries
//! - Progressive fallback to coarser cached tiles
//! - Load ordering: coarse levels first, nearest tiles first, prefetch last
//! - Failed, empty and timed-out fetches are retried by later queries
//! - Shutdown while fetches are in flight

use std::time::Duration;

use pyramid_streamer::{CacheConfig, SchedulerConfig, TileKey, TileManager};

use super::test_utils::{
    eventually, roomy_cache, view_at, visible_only_scheduler, within_timeout, MockTileSource,
};

fn manager_for(source: &MockTileSource, scheduler: SchedulerConfig) -> TileManager<MockTileSource> {
    TileManager::with_config(source.clone(), roomy_cache(), scheduler).unwrap()
}

// =============================================================================
// Cold cache
// =============================================================================

#[tokio::test]
async fn test_cold_cache_returns_nothing_then_everything() {
    let source = MockTileSource::new(512, 512, 256, 1).gated();
    let manager = manager_for(&source, visible_only_scheduler());
    assert!(within_timeout(manager.wait_ready()).await);

    let view = view_at(1.0, 256.0, 256.0, 512.0);
    assert!(manager.get_visible_tiles(&view).is_empty());

    // All four fetches start but are held by the gate
    eventually(|| source.started() == 4).await;
    assert_eq!(manager.get_loading_count(), 4);
    assert!(manager.get_visible_tiles(&view).is_empty());

    source.open();
    within_timeout(manager.wait_idle()).await;

    let tiles = manager.get_visible_tiles(&view);
    assert_eq!(tiles.len(), 4);
    for tile in &tiles {
        assert_eq!(tile.key.level, 0);
        assert!(tile.visible);
        assert_eq!(tile.pixels.dimensions(), (256, 256));
        assert_eq!(
            *tile.pixels.get_pixel(0, 0),
            MockTileSource::color_of(tile.key)
        );
    }
    assert_eq!(manager.get_load_stats().completed, 4);
}

#[tokio::test]
async fn test_query_does_not_wait_on_slow_fetches() {
    let source = MockTileSource::new(1024, 1024, 256, 1).gated();
    let manager = manager_for(&source, visible_only_scheduler());
    assert!(within_timeout(manager.wait_ready()).await);

    // Every query answers from the cache while all 16 fetches are held
    let view = view_at(1.0, 512.0, 512.0, 1024.0);
    for _ in 0..50 {
        assert!(manager.get_visible_tiles(&view).is_empty());
        tokio::task::yield_now().await;
    }
    assert_eq!(manager.get_loading_count(), 8);

    source.open();
    within_timeout(manager.wait_idle()).await;
}

#[tokio::test]
async fn test_loading_tiles_are_fetched_once() {
    let source = MockTileSource::new(512, 512, 256, 1).gated();
    let manager = manager_for(&source, visible_only_scheduler());
    assert!(within_timeout(manager.wait_ready()).await);

    let view = view_at(1.0, 256.0, 256.0, 512.0);
    manager.get_visible_tiles(&view);
    eventually(|| source.started() == 4).await;

    // Same view again while everything is in flight
    manager.get_visible_tiles(&view);
    manager.get_visible_tiles(&view);
    assert_eq!(manager.get_queue_length(), 0);

    source.open();
    within_timeout(manager.wait_idle()).await;
    manager.get_visible_tiles(&view);
    within_timeout(manager.wait_idle()).await;

    for key in source.fetched_keys() {
        assert_eq!(source.fetch_count(key), 1, "{} fetched more than once", key);
    }
    assert_eq!(source.started(), 4);
}

#[tokio::test]
async fn test_queries_before_ready_return_empty() {
    let source = MockTileSource::new(512, 512, 256, 1);
    let manager = manager_for(&source, visible_only_scheduler());

    // May or may not be ready yet; either way the first answer is empty
    let view = view_at(1.0, 256.0, 256.0, 512.0);
    assert!(manager.get_visible_tiles(&view).is_empty());

    assert!(within_timeout(manager.wait_ready()).await);
    let info = manager.source_info().unwrap();
    assert_eq!((info.width, info.height), (512, 512));
    assert_eq!(info.level_count(), 1);
}

// =============================================================================
// Level selection
// =============================================================================

#[tokio::test]
async fn test_zoom_boundaries_pick_levels() {
    let cases = [(1.0, 0, 4), (0.5, 1, 4), (0.25, 2, 4), (0.125, 3, 1)];

    for (zoom, level, count) in cases {
        let source = MockTileSource::new(2048, 2048, 256, 4);
        let manager = manager_for(&source, visible_only_scheduler());
        assert!(within_timeout(manager.wait_ready()).await);

        let view = view_at(zoom, 1024.0, 1024.0, 512.0);
        assert_eq!(manager.target_level(&view), Some(level));

        manager.get_visible_tiles(&view);
        within_timeout(manager.wait_idle()).await;

        let tiles = manager.get_visible_tiles(&view);
        assert_eq!(tiles.len(), count, "zoom {}", zoom);
        assert!(tiles.iter().all(|tile| tile.key.level == level), "zoom {}", zoom);
    }
}

#[tokio::test]
async fn test_zoom_between_powers_of_two() {
    let source = MockTileSource::new(2048, 2048, 256, 4);
    let manager = manager_for(&source, visible_only_scheduler());
    assert!(within_timeout(manager.wait_ready()).await);

    assert_eq!(manager.target_level(&view_at(0.75, 1024.0, 1024.0, 512.0)), Some(0));
    assert_eq!(manager.target_level(&view_at(0.3, 1024.0, 1024.0, 512.0)), Some(1));
    assert_eq!(manager.target_level(&view_at(4.0, 1024.0, 1024.0, 512.0)), Some(0));
    assert_eq!(manager.target_level(&view_at(0.01, 1024.0, 1024.0, 512.0)), Some(3));
}

// =============================================================================
// Progressive fallback
// =============================================================================

#[tokio::test]
async fn test_coarser_tile_stands_in_while_loading() {
    let source = MockTileSource::new(1024, 1024, 256, 2);
    let manager = manager_for(&source, visible_only_scheduler());
    assert!(within_timeout(manager.wait_ready()).await);

    // Level 1 covers the whole image with 2x2 tiles
    let overview = view_at(0.5, 512.0, 512.0, 512.0);
    manager.get_visible_tiles(&overview);
    within_timeout(manager.wait_idle()).await;
    assert_eq!(manager.get_visible_tiles(&overview).len(), 4);

    // Zoom into the top-left quarter while fetches are held
    source.close();
    let detail = view_at(1.0, 256.0, 256.0, 512.0);
    let tiles = manager.get_visible_tiles(&detail);

    assert_eq!(tiles.len(), 1);
    assert_eq!(tiles[0].key, TileKey::new(1, 0, 0));
    assert!(tiles[0].visible);
    assert_eq!(tiles[0].footprint().width, 512);

    source.open();
    within_timeout(manager.wait_idle()).await;

    let tiles = manager.get_visible_tiles(&detail);
    assert_eq!(tiles.len(), 4);
    assert!(tiles.iter().all(|tile| tile.key.level == 0));
}

#[tokio::test]
async fn test_fallbacks_come_before_target_tiles() {
    let source = MockTileSource::new(1024, 1024, 256, 2);
    let manager = manager_for(&source, visible_only_scheduler());
    assert!(within_timeout(manager.wait_ready()).await);

    let overview = view_at(0.5, 512.0, 512.0, 512.0);
    manager.get_visible_tiles(&overview);
    within_timeout(manager.wait_idle()).await;

    // Load one level-0 tile, then look at its neighbourhood with fetches held
    let corner = view_at(1.0, 128.0, 128.0, 200.0);
    manager.get_visible_tiles(&corner);
    within_timeout(manager.wait_idle()).await;

    source.close();
    let detail = view_at(1.0, 256.0, 256.0, 512.0);
    let tiles = manager.get_visible_tiles(&detail);

    assert_eq!(tiles.len(), 2);
    assert_eq!(tiles[0].key, TileKey::new(1, 0, 0));
    assert_eq!(tiles[1].key, TileKey::new(0, 0, 0));

    source.open();
    within_timeout(manager.wait_idle()).await;
}

#[tokio::test]
async fn test_no_fallback_without_progressive() {
    let source = MockTileSource::new(1024, 1024, 256, 2);
    let scheduler = SchedulerConfig {
        progressive: false,
        ..visible_only_scheduler()
    };
    let manager = manager_for(&source, scheduler);
    assert!(within_timeout(manager.wait_ready()).await);

    let overview = view_at(0.5, 512.0, 512.0, 512.0);
    manager.get_visible_tiles(&overview);
    within_timeout(manager.wait_idle()).await;

    source.close();
    assert!(manager
        .get_visible_tiles(&view_at(1.0, 256.0, 256.0, 512.0))
        .is_empty());

    source.open();
    within_timeout(manager.wait_idle()).await;
}

// =============================================================================
// Load ordering
// =============================================================================

#[tokio::test]
async fn test_nearest_tiles_load_first() {
    // 5x5 grid, all visible, one fetch at a time
    let source = MockTileSource::new(1280, 1280, 256, 1);
    let scheduler = SchedulerConfig {
        max_concurrent_loads: 1,
        ..visible_only_scheduler()
    };
    let manager = manager_for(&source, scheduler);
    assert!(within_timeout(manager.wait_ready()).await);

    manager.get_visible_tiles(&view_at(1.0, 640.0, 640.0, 1280.0));
    within_timeout(manager.wait_idle()).await;

    let order = source.fetch_order();
    assert_eq!(order.len(), 25);
    assert_eq!(order[0], TileKey::new(0, 2, 2));

    let distance = |key: &TileKey| {
        let dx = key.x as f64 - 2.0;
        let dy = key.y as f64 - 2.0;
        dx * dx + dy * dy
    };
    for pair in order.windows(2) {
        assert!(distance(&pair[0]) <= distance(&pair[1]), "{:?}", pair);
    }
}

#[tokio::test]
async fn test_initial_load_starts_with_coarse_levels() {
    let source = MockTileSource::new(2048, 2048, 256, 4);
    let scheduler = SchedulerConfig {
        max_concurrent_loads: 1,
        prefetch: false,
        ..SchedulerConfig::default()
    };
    let manager = manager_for(&source, scheduler);
    assert!(within_timeout(manager.wait_ready()).await);

    manager.get_visible_tiles(&view_at(1.0, 1024.0, 1024.0, 512.0));
    within_timeout(manager.wait_idle()).await;

    // Two levels coarser first, then one coarser, then the target
    let levels: Vec<u32> = source.fetch_order().iter().map(|key| key.level).collect();
    assert_eq!(levels, vec![2, 2, 2, 2, 1, 1, 1, 1, 0, 0, 0, 0]);
}

#[tokio::test]
async fn test_prefetch_loads_after_visible() {
    let source = MockTileSource::new(2048, 2048, 256, 1);
    let scheduler = SchedulerConfig {
        max_concurrent_loads: 1,
        prefetch: true,
        prefetch_margin: 1,
        ..visible_only_scheduler()
    };
    let manager = manager_for(&source, scheduler);
    assert!(within_timeout(manager.wait_ready()).await);

    let view = view_at(1.0, 1024.0, 1024.0, 512.0);
    manager.get_visible_tiles(&view);
    within_timeout(manager.wait_idle()).await;

    let order = source.fetch_order();
    // 2x2 visible block plus its one-tile ring
    assert_eq!(order.len(), 16);
    for key in &order[..4] {
        assert!((3..5).contains(&key.x) && (3..5).contains(&key.y), "{}", key);
    }

    // Prefetched tiles are cached but not flagged visible
    assert_eq!(manager.get_cache_stats().tile_count, 16);
    assert_eq!(manager.get_visible_tiles(&view).len(), 4);
}

#[tokio::test]
async fn test_full_queue_sheds_prefetch() {
    let source = MockTileSource::new(2048, 2048, 256, 1);
    let scheduler = SchedulerConfig {
        max_concurrent_loads: 1,
        prefetch: true,
        prefetch_margin: 1,
        max_queue_length: 6,
        ..visible_only_scheduler()
    };
    let manager = manager_for(&source, scheduler);
    assert!(within_timeout(manager.wait_ready()).await);

    manager.get_visible_tiles(&view_at(1.0, 1024.0, 1024.0, 512.0));
    within_timeout(manager.wait_idle()).await;

    // 4 visible + 2 of the 12 ring tiles fit
    assert_eq!(source.started(), 6);
    assert_eq!(manager.get_load_stats().dropped_prefetch, 10);
}

#[tokio::test]
async fn test_pan_loads_new_view_before_old() {
    // 32x1 strip, one fetch at a time
    let source = MockTileSource::new(8192, 256, 256, 1).gated();
    let scheduler = SchedulerConfig {
        max_concurrent_loads: 1,
        ..visible_only_scheduler()
    };
    let manager = manager_for(&source, scheduler);
    assert!(within_timeout(manager.wait_ready()).await);

    manager.get_visible_tiles(&view_at(1.0, 512.0, 128.0, 1024.0));
    eventually(|| source.started() == 1).await;

    // Pan to the far end while the first fetch is held
    let right = view_at(1.0, 7680.0, 128.0, 1024.0);
    manager.get_visible_tiles(&right);
    source.open();
    within_timeout(manager.wait_idle()).await;

    let order = source.fetch_order();
    assert!(order[0].x < 4, "{:?}", order);
    for key in &order[1..5] {
        assert!((28..32).contains(&key.x), "{:?}", order);
    }
    assert_eq!(manager.get_visible_tiles(&right).len(), 4);
}

#[tokio::test]
async fn test_panning_keeps_backlog_bounded() {
    let source = MockTileSource::new(8192, 256, 256, 1).gated();
    let scheduler = SchedulerConfig {
        max_concurrent_loads: 1,
        max_queue_length: 8,
        ..visible_only_scheduler()
    };
    let manager = manager_for(&source, scheduler);
    assert!(within_timeout(manager.wait_ready()).await);

    // One tile to the right per frame, then back to the start
    for step in 0..60 {
        let x = 512.0 + (step % 28) as f64 * 256.0;
        manager.get_visible_tiles(&view_at(1.0, x, 128.0, 1024.0));
        tokio::task::yield_now().await;

        assert!(manager.get_queue_length() <= 8, "step {}", step);
        assert!(manager.get_loading_count() <= 1);
    }
    assert!(manager.get_load_stats().dropped_prefetch > 0);

    source.open();
    within_timeout(manager.wait_idle()).await;
}

#[tokio::test]
async fn test_concurrency_limit() {
    let source = MockTileSource::new(2048, 2048, 256, 1).gated();
    let scheduler = SchedulerConfig {
        max_concurrent_loads: 3,
        ..visible_only_scheduler()
    };
    let manager = manager_for(&source, scheduler);
    assert!(within_timeout(manager.wait_ready()).await);

    manager.get_visible_tiles(&view_at(1.0, 1024.0, 1024.0, 2048.0));
    eventually(|| source.started() == 3).await;

    // Give the drain task a chance to overshoot
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(source.started(), 3);
    assert_eq!(manager.get_loading_count(), 3);
    assert_eq!(manager.get_queue_length(), 61);

    source.open();
    within_timeout(manager.wait_idle()).await;
    assert_eq!(source.started(), 64);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_failed_fetch_retried_by_next_query() {
    let failing = TileKey::new(0, 0, 0);
    let source = MockTileSource::new(512, 512, 256, 1).fail_once(failing);
    let manager = manager_for(&source, visible_only_scheduler());
    assert!(within_timeout(manager.wait_ready()).await);

    let view = view_at(1.0, 256.0, 256.0, 512.0);
    manager.get_visible_tiles(&view);
    within_timeout(manager.wait_idle()).await;

    let tiles = manager.get_visible_tiles(&view);
    assert_eq!(tiles.len(), 3);
    assert!(tiles.iter().all(|tile| tile.key != failing));
    let stats = manager.get_load_stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 3);

    // That query re-queued the failed tile
    within_timeout(manager.wait_idle()).await;
    assert_eq!(manager.get_visible_tiles(&view).len(), 4);
    assert_eq!(source.fetch_count(failing), 2);
}

#[tokio::test]
async fn test_empty_tile_is_not_cached() {
    let blank = TileKey::new(0, 1, 0);
    let source = MockTileSource::new(512, 512, 256, 1).empty_tile(blank);
    let manager = manager_for(&source, visible_only_scheduler());
    assert!(within_timeout(manager.wait_ready()).await);

    let view = view_at(1.0, 256.0, 256.0, 512.0);
    manager.get_visible_tiles(&view);
    within_timeout(manager.wait_idle()).await;

    let tiles = manager.get_visible_tiles(&view);
    assert_eq!(tiles.len(), 3);
    assert!(tiles.iter().all(|tile| tile.key != blank));
    assert_eq!(manager.get_cache_stats().tile_count, 3);
    assert_eq!(manager.get_load_stats().failed, 1);
}

#[tokio::test]
async fn test_hung_fetch_times_out() {
    let stuck = TileKey::new(0, 1, 1);
    let source = MockTileSource::new(512, 512, 256, 1).hang_tile(stuck);
    let scheduler = SchedulerConfig {
        fetch_timeout: Some(Duration::from_millis(50)),
        ..visible_only_scheduler()
    };
    let manager = manager_for(&source, scheduler);
    assert!(within_timeout(manager.wait_ready()).await);

    let view = view_at(1.0, 256.0, 256.0, 512.0);
    manager.get_visible_tiles(&view);
    within_timeout(manager.wait_idle()).await;

    let stats = manager.get_load_stats();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 3);
    assert_eq!(manager.get_loading_count(), 0);
    assert_eq!(manager.get_visible_tiles(&view).len(), 3);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_destroy_discards_in_flight_results() {
    let source = MockTileSource::new(512, 512, 256, 1).gated();
    let manager = manager_for(&source, visible_only_scheduler());
    assert!(within_timeout(manager.wait_ready()).await);

    let view = view_at(1.0, 256.0, 256.0, 512.0);
    manager.get_visible_tiles(&view);
    eventually(|| source.started() == 4).await;

    manager.destroy();
    within_timeout(manager.wait_idle()).await;

    source.open();
    eventually(|| manager.get_loading_count() == 0).await;

    assert_eq!(manager.get_cache_stats().tile_count, 0);
    assert!(manager.get_visible_tiles(&view).is_empty());
    assert_eq!(manager.get_load_stats().completed, 0);
}

#[tokio::test]
async fn test_clear_cache_refetches() {
    let source = MockTileSource::new(512, 512, 256, 1);
    let manager = TileManager::with_config(
        source.clone(),
        CacheConfig::default(),
        visible_only_scheduler(),
    )
    .unwrap();
    assert!(within_timeout(manager.wait_ready()).await);

    let view = view_at(1.0, 256.0, 256.0, 512.0);
    manager.get_visible_tiles(&view);
    within_timeout(manager.wait_idle()).await;

    manager.clear_cache();
    assert!(manager.get_visible_tiles(&view).is_empty());
    within_timeout(manager.wait_idle()).await;

    assert_eq!(manager.get_visible_tiles(&view).len(), 4);
    assert_eq!(source.fetch_count(TileKey::new(0, 0, 0)), 2);
}
