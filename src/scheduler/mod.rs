//! Viewport-driven load scheduling.
//!
//! # Components
//!
//! - [`ViewProjection`]: image-to-screen transform and viewport size
//! - [`select_level`] / [`TileRange`]: target level and visible tile grid
//! - [`LoadQueue`]: deduplicating priority queue of [`LoadRequest`]s
//! - [`ZoomTrend`]: recent zoom direction for adjacent-level prefetch
//! - [`TileManager`]: the cache plus the background fetch pipeline

mod manager;
mod queue;
mod trend;
mod view;

pub use manager::{LoadStats, TileManager};
pub use queue::{LoadQueue, LoadRequest};
pub use trend::ZoomTrend;
pub use view::{grid_center, select_level, tile_distance, TileRange, ViewProjection};
