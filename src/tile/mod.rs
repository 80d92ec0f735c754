//! Tile identity, payload and the bounded viewport cache.
//!
//! # Components
//!
//! - [`TileKey`]: `(level, x, y)` identity of one pyramid cell
//! - [`Tile`]: decoded RGBA payload plus its image-space footprint
//! - [`TileCache`]: LRU cache bounded by CPU bytes and tile count, with GPU
//!   residency accounting
//! - [`CacheStats`]: snapshot of cache usage and hit rate

mod cache;
mod types;

pub use cache::{CacheStats, TileCache};
pub use types::{GpuHandle, Tile, TileKey, BYTES_PER_PIXEL};
