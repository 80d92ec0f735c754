//! Pyramid Streamer - replay a viewing session against a tile pyramid.
//!
//! This binary builds a tile source, drives a `TileManager` through a
//! simulated zoom-and-pan path and reports cache and load statistics.

use clap::Parser;
use glam::DVec2;
use serde::Serialize;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pyramid_streamer::{
    config::{parse_dimensions, Cli, Command, DziConfig, SessionArgs, ViewConfig},
    present_frame, synthetic_gradient, CacheStats, DziDirectoryReader, EncodedTileSource,
    FrameStats, HeadlessBackend, LoadStats, MemoryTileSource, PyramidSynthesizer, TileManager,
    TileSource, ViewProjection,
};

/// Pause between simulated frames.
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::View(config) => run_view(config).await,
        Command::Dzi(config) => run_dzi(config).await,
    }
}

// =============================================================================
// View Command
// =============================================================================

async fn run_view(config: ViewConfig) -> ExitCode {
    init_logging(config.session.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let image = match (&config.image, &config.synthetic) {
        (Some(path), _) => {
            let path = path.clone();
            info!("Decoding {}", path.display());
            let decoded =
                tokio::task::spawn_blocking(move || image::open(&path).map(|img| img.to_rgba8()))
                    .await;
            match decoded {
                Ok(Ok(image)) => image,
                Ok(Err(e)) => {
                    error!("Failed to decode image: {}", e);
                    return ExitCode::FAILURE;
                }
                Err(e) => {
                    error!("Decode task failed: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
        (None, Some(dims)) => match parse_dimensions(dims) {
            Ok((width, height)) => synthetic_gradient(width, height),
            Err(e) => {
                error!("Configuration error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        (None, None) => return ExitCode::FAILURE,
    };

    info!(
        "Image: {}x{}, native tiles {}px, latency {}ms",
        image.width(),
        image.height(),
        config.tile_size,
        config.latency_ms
    );

    let native = MemoryTileSource::new(image, config.tile_size)
        .with_latency(Duration::from_millis(config.latency_ms));
    let source = PyramidSynthesizer::new(native);

    run_session(source, &config.session).await
}

// =============================================================================
// DZI Command
// =============================================================================

async fn run_dzi(config: DziConfig) -> ExitCode {
    init_logging(config.session.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("DZI directory: {}", config.dir.display());
    let reader = DziDirectoryReader::new(
        config.dir.clone(),
        config.width,
        config.height,
        config.tile_size,
        config.format.clone(),
    );

    run_session(EncodedTileSource::new(reader), &config.session).await
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug, Serialize)]
struct ImageReport {
    width: u32,
    height: u32,
    levels: u32,
}

#[derive(Debug, Serialize)]
struct SessionReport {
    image: ImageReport,
    frames: u64,
    elapsed_ms: u128,
    cache: CacheStats,
    loads: LoadStats,
    last_frame: FrameStats,
}

/// View for frame `step` of `steps`: zoom from fit-to-viewport up to native
/// resolution while drifting from the image centre towards its lower left.
fn session_view(step: u32, steps: u32, image: (u32, u32), viewport: (f64, f64)) -> ViewProjection {
    let (width, height) = (image.0 as f64, image.1 as f64);
    let t = if steps > 1 {
        step as f64 / (steps - 1) as f64
    } else {
        1.0
    };

    let fit = (viewport.0 / width).min(viewport.1 / height).min(1.0);
    let zoom = fit * (1.0 / fit).powf(t);

    let start = DVec2::new(width * 0.5, height * 0.5);
    let end = DVec2::new(width * 0.3, height * 0.6);
    let center = start.lerp(end, t);

    ViewProjection::centered(center, zoom, 0.0, viewport.0, viewport.1)
}

async fn run_session<S: TileSource>(source: S, args: &SessionArgs) -> ExitCode {
    let cache = args.cache_config();
    let scheduler = args.scheduler_config();
    let manager = match TileManager::with_config(source, cache, scheduler) {
        Ok(manager) => manager,
        Err(e) => {
            error!("Failed to create tile manager: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if !manager.wait_ready().await {
        error!("Tile source failed to initialize");
        return ExitCode::FAILURE;
    }
    let Some(info) = manager.source_info() else {
        return ExitCode::FAILURE;
    };
    info!(
        "Pyramid: {}x{}, {} levels",
        info.width,
        info.height,
        info.level_count()
    );

    let viewport = (args.viewport_width as f64, args.viewport_height as f64);
    let mut backend = HeadlessBackend::with_simulated_gpu();
    let started = Instant::now();

    for step in 0..args.steps {
        let view = session_view(step, args.steps, (info.width, info.height), viewport);
        let frame = present_frame(&manager, &mut backend, &view);
        debug!(
            step,
            zoom = view.zoom(),
            level = ?manager.target_level(&view),
            drawn = frame.tiles_drawn,
            fallbacks = frame.fallback_tiles,
            loading = manager.get_loading_count(),
            queued = manager.get_queue_length(),
            "frame"
        );
        tokio::time::sleep(FRAME_INTERVAL).await;
    }

    // Let outstanding loads land, then draw the final view once more
    manager.wait_idle().await;
    let last_view = session_view(args.steps - 1, args.steps, (info.width, info.height), viewport);
    let last_frame = present_frame(&manager, &mut backend, &last_view);

    let report = SessionReport {
        image: ImageReport {
            width: info.width,
            height: info.height,
            levels: info.level_count(),
        },
        frames: backend.frames(),
        elapsed_ms: started.elapsed().as_millis(),
        cache: manager.get_cache_stats(),
        loads: manager.get_load_stats(),
        last_frame,
    };
    manager.destroy();

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize report: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_report(&report);
    }

    ExitCode::SUCCESS
}

fn print_report(report: &SessionReport) {
    let cache = &report.cache;
    let loads = &report.loads;

    println!("Pyramid Streamer Session");
    println!("═════════════════════════════════");
    println!(
        "Image:      {}x{} ({} levels)",
        report.image.width, report.image.height, report.image.levels
    );
    println!("Frames:     {} in {}ms", report.frames, report.elapsed_ms);
    println!();
    println!("Cache:");
    println!("  Tiles:    {} / {}", cache.tile_count, cache.max_tiles);
    println!(
        "  CPU:      {:.1} / {:.1} MiB",
        cache.cpu_bytes as f64 / (1024.0 * 1024.0),
        cache.max_cpu_bytes as f64 / (1024.0 * 1024.0)
    );
    println!(
        "  GPU:      {:.1} / {:.1} MiB",
        cache.gpu_bytes as f64 / (1024.0 * 1024.0),
        cache.max_gpu_bytes as f64 / (1024.0 * 1024.0)
    );
    println!(
        "  Hit rate: {:.1}% ({} hits, {} misses, {} evictions)",
        cache.hit_rate * 100.0,
        cache.hits,
        cache.misses,
        cache.evictions
    );
    println!();
    println!("Loads:");
    println!("  Completed: {}", loads.completed);
    println!("  Failed:    {} ({} timed out)", loads.failed, loads.timed_out);
    println!("  Prefetch dropped: {}", loads.dropped_prefetch);
    println!();
    println!(
        "Last frame: {} tiles ({} fallback)",
        report.last_frame.tiles_drawn, report.last_frame.fallback_tiles
    );
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "pyramid_streamer=debug"
    } else {
        "pyramid_streamer=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
