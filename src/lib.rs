//! # Pyramid Streamer
//!
//! Tile pyramid cache and load scheduler for deep-zoom image viewers.
//!
//! A viewer that pans and zooms over an image far larger than memory asks
//! [`TileManager::get_visible_tiles`] for the current view on every frame.
//! The manager answers synchronously from its cache, falls back to cached
//! coarser tiles for cells that are still loading, and streams the missing
//! tiles in the background under a concurrency and memory budget.
//!
//! ## Features
//!
//! - **Non-blocking viewport queries**: fetches and decodes never run on the
//!   query path
//! - **Bounded caching**: LRU eviction under CPU byte and tile-count budgets,
//!   with GPU residency accounting
//! - **Prioritized loading**: nearest tiles first, prefetch behind visible
//!   tiles, coarse levels first on the initial load
//! - **Level synthesis**: coarse levels for sources tiled only at native
//!   resolution, by direct composition or from a cached overview raster
//!
//! ## Architecture
//!
//! - [`tile`] - Tile identity, payload and the LRU tile cache
//! - [`pyramid`] - Level geometry, raster helpers and level synthesis
//! - [`source`] - `TileSource` trait and concrete sources
//! - [`scheduler`] - View projection math, load queue and `TileManager`
//! - [`render`] - Render backend capability trait
//! - [`config`] - Configuration and CLI types
//!
//! ## Example
//!
//! ```rust,no_run
//! use glam::DVec2;
//! use pyramid_streamer::{
//!     synthetic_gradient, MemoryTileSource, PyramidSynthesizer, TileManager, ViewProjection,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let native = MemoryTileSource::new(synthetic_gradient(8192, 8192), 256);
//!     let manager = TileManager::new(PyramidSynthesizer::new(native)).unwrap();
//!     manager.wait_ready().await;
//!
//!     let view = ViewProjection::centered(DVec2::new(4096.0, 4096.0), 0.25, 0.0, 1280.0, 800.0);
//!
//!     // First call only schedules loads
//!     let tiles = manager.get_visible_tiles(&view);
//!     assert!(tiles.is_empty());
//!
//!     manager.wait_idle().await;
//!     let tiles = manager.get_visible_tiles(&view);
//!     println!("{} tiles ready", tiles.len());
//! }
//! ```

pub mod config;
pub mod error;
pub mod pyramid;
pub mod render;
pub mod scheduler;
pub mod source;
pub mod tile;

// Re-export commonly used types
pub use config::{CacheConfig, Cli, Command, SchedulerConfig, SynthesisConfig};
pub use error::{ManagerError, SourceError};
pub use pyramid::{level_count_for, ImageRect, PyramidLevel, PyramidSynthesizer};
pub use render::{present_frame, BackendKind, FrameStats, HeadlessBackend, RenderBackend};
pub use scheduler::{
    select_level, LoadQueue, LoadRequest, LoadStats, TileManager, TileRange, ViewProjection,
    ZoomTrend,
};
pub use source::{
    dzi_level_dimensions, max_dzi_level, synthetic_gradient, DziDirectoryReader,
    EncodedTileSource, MemoryTileSource, RawTileReader, SourceInfo, TileSource,
};
pub use tile::{CacheStats, GpuHandle, Tile, TileCache, TileKey, BYTES_PER_PIXEL};
