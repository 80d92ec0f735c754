//! Configuration for the tile cache, load scheduler and pyramid synthesis.
//!
//! Library users build [`CacheConfig`], [`SchedulerConfig`] and
//! [`SynthesisConfig`] directly (all implement `Default`). The command-line
//! front end parses the same settings with clap, accepting environment
//! variables with the `PYRAMID_` prefix:
//!
//! - `PYRAMID_CACHE_CPU_MB` - CPU tile cache budget in MiB (default: 256)
//! - `PYRAMID_CACHE_GPU_MB` - GPU residency budget in MiB (default: 512)
//! - `PYRAMID_CACHE_TILES` - Maximum number of cached tiles (default: 1000)
//! - `PYRAMID_MAX_LOADS` - Maximum concurrent tile loads (default: 6)
//! - `PYRAMID_FETCH_TIMEOUT_MS` - Per-fetch timeout, 0 disables (default: 30000)

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

// =============================================================================
// Default Values
// =============================================================================

/// Default CPU byte budget for decoded tiles: 256MB.
pub const DEFAULT_MAX_CPU_BYTES: usize = 256 * 1024 * 1024;

/// Default GPU residency budget: 512MB.
pub const DEFAULT_MAX_GPU_BYTES: usize = 512 * 1024 * 1024;

/// Default maximum number of cached tiles.
pub const DEFAULT_MAX_TILES: usize = 1000;

/// Default maximum number of concurrent tile loads.
pub const DEFAULT_MAX_CONCURRENT_LOADS: usize = 6;

/// Default per-fetch timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Priority penalty added to every prefetch request.
///
/// Visible-tile priorities are distances in tile units and are clamped below
/// this value, so prefetches always sort after visible tiles.
pub const DEFAULT_PREFETCH_PENALTY: f64 = 1000.0;

/// Default number of native tiles the overview is built from, at most.
pub const DEFAULT_OVERVIEW_SAMPLE_CAP: usize = 36;

/// Default long side of the overview raster in pixels.
pub const DEFAULT_OVERVIEW_LONG_SIDE: u32 = 512;

// =============================================================================
// Cache Configuration
// =============================================================================

/// Budgets for the viewport tile cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheConfig {
    /// Maximum decoded bytes held in memory
    pub max_cpu_bytes: usize,

    /// Maximum bytes of GPU-resident tiles before residency is dropped
    pub max_gpu_bytes: usize,

    /// Maximum number of cached tiles
    pub max_tiles: usize,

    /// Keep visible tiles while any invisible tile can be evicted instead
    pub protect_visible: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cpu_bytes: DEFAULT_MAX_CPU_BYTES,
            max_gpu_bytes: DEFAULT_MAX_GPU_BYTES,
            max_tiles: DEFAULT_MAX_TILES,
            protect_visible: true,
        }
    }
}

impl CacheConfig {
    /// Budget limited by bytes only.
    pub fn with_max_cpu_bytes(max_cpu_bytes: usize) -> Self {
        Self {
            max_cpu_bytes,
            max_tiles: usize::MAX,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_cpu_bytes == 0 {
            return Err("max_cpu_bytes must be greater than 0".to_string());
        }
        if self.max_tiles == 0 {
            return Err("max_tiles must be greater than 0".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Scheduler Configuration
// =============================================================================

/// Settings for the load scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum fetches in flight once the first tile has been shown
    pub max_concurrent_loads: usize,

    /// Maximum fetches in flight before the first tile has been shown
    pub initial_max_concurrent_loads: usize,

    /// Fetches started per drain cycle before the first tile has been shown
    pub initial_batch_size: usize,

    /// Fetches started per drain cycle before yielding
    pub batch_size: usize,

    /// Show cached coarser tiles in place of missing ones
    pub progressive: bool,

    /// Enqueue margin and adjacent-level prefetch requests
    pub prefetch: bool,

    /// Margin around the visible rectangle to prefetch, in tiles
    pub prefetch_margin: u32,

    /// Cap on prefetch tiles per adjacent level
    pub max_adjacent_prefetch: usize,

    /// Priority penalty applied to prefetch requests
    pub prefetch_penalty: f64,

    /// Priority bonus per level for coarse tiles during the initial load
    pub initial_level_bonus: f64,

    /// Queue length above which queued prefetches are dropped
    pub max_queue_length: usize,

    /// Per-fetch timeout; `None` lets a fetch run forever
    pub fetch_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loads: DEFAULT_MAX_CONCURRENT_LOADS,
            initial_max_concurrent_loads: 2,
            initial_batch_size: 2,
            batch_size: 4,
            progressive: true,
            prefetch: true,
            prefetch_margin: 1,
            max_adjacent_prefetch: 8,
            prefetch_penalty: DEFAULT_PREFETCH_PENALTY,
            initial_level_bonus: 4.0,
            max_queue_length: 512,
            fetch_timeout: Some(DEFAULT_FETCH_TIMEOUT),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_loads == 0 {
            return Err("max_concurrent_loads must be greater than 0".to_string());
        }
        if self.initial_max_concurrent_loads == 0 || self.initial_batch_size == 0 {
            return Err("initial load limits must be greater than 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".to_string());
        }
        if !(self.prefetch_penalty.is_finite() && self.prefetch_penalty > 0.0) {
            return Err("prefetch_penalty must be a positive number".to_string());
        }
        if self.max_queue_length == 0 {
            return Err("max_queue_length must be greater than 0".to_string());
        }
        if matches!(self.fetch_timeout, Some(t) if t.is_zero()) {
            return Err("fetch_timeout must be non-zero (use None to disable)".to_string());
        }
        Ok(())
    }

    /// Concurrency limit and per-cycle start count for the current phase.
    pub(crate) fn limits(&self, initial_phase: bool) -> (usize, usize) {
        if initial_phase {
            (
                self.initial_max_concurrent_loads.min(self.max_concurrent_loads),
                self.initial_batch_size,
            )
        } else {
            (self.max_concurrent_loads, self.batch_size)
        }
    }
}

// =============================================================================
// Synthesis Configuration
// =============================================================================

/// Settings for synthesizing coarse levels from native tiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SynthesisConfig {
    /// Levels below this use direct composition; deeper levels use the overview
    pub direct_max_level: u32,

    /// Most native tiles a single composition may read
    pub max_compose_tiles: usize,

    /// Long side of the overview raster in pixels
    pub overview_long_side: u32,

    /// Most native tiles the overview is built from
    pub overview_sample_cap: usize,

    /// Capacity of the internal native tile cache
    pub native_cache_tiles: usize,

    /// Concurrent native fetches per composition or overview build
    pub compose_concurrency: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            direct_max_level: 3,
            max_compose_tiles: 16,
            overview_long_side: DEFAULT_OVERVIEW_LONG_SIDE,
            overview_sample_cap: DEFAULT_OVERVIEW_SAMPLE_CAP,
            native_cache_tiles: 64,
            compose_concurrency: 4,
        }
    }
}

impl SynthesisConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.overview_long_side == 0 {
            return Err("overview_long_side must be greater than 0".to_string());
        }
        if self.overview_sample_cap == 0 || self.max_compose_tiles == 0 {
            return Err("tile caps must be greater than 0".to_string());
        }
        // An overview build must fit in the native cache or it thrashes.
        if self.native_cache_tiles <= self.overview_sample_cap
            || self.native_cache_tiles <= self.max_compose_tiles
        {
            return Err(format!(
                "native_cache_tiles ({}) must exceed overview_sample_cap ({}) and max_compose_tiles ({})",
                self.native_cache_tiles, self.overview_sample_cap, self.max_compose_tiles
            ));
        }
        if self.compose_concurrency == 0 {
            return Err("compose_concurrency must be greater than 0".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// Pyramid Streamer - tile pyramid cache and load scheduler.
///
/// Replays a simulated zoom-and-pan session against an image and reports how
/// the cache and scheduler behaved.
#[derive(Parser, Debug, Clone)]
#[command(name = "pyramid-streamer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Stream an image file (or a synthetic gradient) through a synthesized pyramid
    View(ViewConfig),

    /// Stream a Deep Zoom (DZI) tile directory
    Dzi(DziConfig),
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

/// Settings shared by every session command.
#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// CPU tile cache budget in MiB.
    #[arg(long, default_value_t = 256, env = "PYRAMID_CACHE_CPU_MB")]
    pub cache_cpu_mb: usize,

    /// GPU residency budget in MiB.
    #[arg(long, default_value_t = 512, env = "PYRAMID_CACHE_GPU_MB")]
    pub cache_gpu_mb: usize,

    /// Maximum number of cached tiles.
    #[arg(long, default_value_t = DEFAULT_MAX_TILES, env = "PYRAMID_CACHE_TILES")]
    pub cache_tiles: usize,

    /// Maximum concurrent tile loads.
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT_LOADS, env = "PYRAMID_MAX_LOADS")]
    pub max_loads: usize,

    /// Per-fetch timeout in milliseconds (0 disables the timeout).
    #[arg(long, default_value_t = 30_000, env = "PYRAMID_FETCH_TIMEOUT_MS")]
    pub fetch_timeout_ms: u64,

    /// Disable prefetching.
    #[arg(long, default_value_t = false)]
    pub no_prefetch: bool,

    /// Disable progressive (coarser tile) fallback.
    #[arg(long, default_value_t = false)]
    pub no_progressive: bool,

    /// Viewport width in screen pixels.
    #[arg(long, default_value_t = 1280)]
    pub viewport_width: u32,

    /// Viewport height in screen pixels.
    #[arg(long, default_value_t = 800)]
    pub viewport_height: u32,

    /// Number of simulated frames.
    #[arg(long, default_value_t = 24)]
    pub steps: u32,

    /// Print final statistics as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl SessionArgs {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_cpu_bytes: self.cache_cpu_mb.saturating_mul(1024 * 1024),
            max_gpu_bytes: self.cache_gpu_mb.saturating_mul(1024 * 1024),
            max_tiles: self.cache_tiles,
            protect_visible: true,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_loads: self.max_loads,
            progressive: !self.no_progressive,
            prefetch: !self.no_prefetch,
            fetch_timeout: (self.fetch_timeout_ms > 0)
                .then(|| Duration::from_millis(self.fetch_timeout_ms)),
            ..SchedulerConfig::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.viewport_width == 0 || self.viewport_height == 0 {
            return Err("viewport dimensions must be greater than 0".to_string());
        }
        if self.steps == 0 {
            return Err("steps must be greater than 0".to_string());
        }
        self.cache_config().validate()?;
        self.scheduler_config().validate()
    }
}

/// `view` command settings.
#[derive(Args, Debug, Clone)]
pub struct ViewConfig {
    /// Image file to stream (PNG or JPEG).
    #[arg(conflicts_with = "synthetic")]
    pub image: Option<PathBuf>,

    /// Generate a synthetic gradient of the given size instead, e.g. 8192x6144.
    #[arg(long)]
    pub synthetic: Option<String>,

    /// Native tile size in pixels.
    #[arg(long, default_value_t = 256)]
    pub tile_size: u32,

    /// Simulated latency per native tile fetch in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub latency_ms: u64,

    #[command(flatten)]
    pub session: SessionArgs,
}

impl ViewConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.image.is_none() && self.synthetic.is_none() {
            return Err("provide an image path or --synthetic WIDTHxHEIGHT".to_string());
        }
        if let Some(dims) = &self.synthetic {
            parse_dimensions(dims)?;
        }
        if self.tile_size == 0 {
            return Err("tile_size must be greater than 0".to_string());
        }
        self.session.validate()
    }
}

/// `dzi` command settings.
#[derive(Args, Debug, Clone)]
pub struct DziConfig {
    /// Tile directory (the `<name>_files` directory of a DZI pyramid).
    pub dir: PathBuf,

    /// Full-resolution image width.
    #[arg(long)]
    pub width: u32,

    /// Full-resolution image height.
    #[arg(long)]
    pub height: u32,

    /// Tile size in pixels.
    #[arg(long, default_value_t = 254)]
    pub tile_size: u32,

    /// Tile file extension.
    #[arg(long, default_value = "jpeg")]
    pub format: String,

    #[command(flatten)]
    pub session: SessionArgs,
}

impl DziConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err("image dimensions must be greater than 0".to_string());
        }
        if self.tile_size == 0 {
            return Err("tile_size must be greater than 0".to_string());
        }
        self.session.validate()
    }
}

/// Parse `WIDTHxHEIGHT`.
pub fn parse_dimensions(dims: &str) -> Result<(u32, u32), String> {
    let (w, h) = dims
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", dims))?;
    let width: u32 = w
        .trim()
        .parse()
        .map_err(|_| format!("invalid width '{}'", w))?;
    let height: u32 = h
        .trim()
        .parse()
        .map_err(|_| format!("invalid height '{}'", h))?;
    if width == 0 || height == 0 {
        return Err("dimensions must be greater than 0".to_string());
    }
    Ok((width, height))
}

// =============================================================================
// Tests
// =============================================================================
