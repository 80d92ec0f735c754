//! Bounded cache of decoded tiles.
//!
//! This module provides the viewport tile cache: decoded tiles keyed by
//! [`TileKey`], bounded by a CPU byte budget and a tile-count budget.
//!
//! # Eviction
//!
//! Eviction is strict LRU by logical access time and runs after every insert
//! while any budget is exceeded. Every `get` and `set` advances a logical
//! clock, so an identical call sequence always evicts in the same order.
//!
//! With `protect_visible` enabled (the default), a tile flagged `visible` is
//! only evicted once no invisible tile is left to evict instead.
//!
//! # GPU residency
//!
//! Tiles uploaded by a renderer carry a [`GpuHandle`]. Their payload size is
//! counted in `gpu_bytes`; when that exceeds the GPU budget the least recently
//! used resident tiles lose their handle but keep their CPU copy. Handles of
//! evicted or demoted tiles are queued for the renderer to release.

use std::mem;

use lru::LruCache;
use serde::Serialize;
use tracing::trace;

use crate::config::CacheConfig;

use super::types::{GpuHandle, Tile, TileKey};

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of cache usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of tiles currently cached
    pub tile_count: usize,

    /// Decoded bytes held
    pub cpu_bytes: usize,

    /// Estimated bytes resident on the GPU
    pub gpu_bytes: usize,

    pub max_cpu_bytes: usize,
    pub max_gpu_bytes: usize,
    pub max_tiles: usize,

    /// Number of `get` calls that found a tile
    pub hits: u64,

    /// Number of `get` calls that found nothing
    pub misses: u64,

    /// Number of tiles evicted to satisfy a budget
    pub evictions: u64,

    /// `hits / (hits + misses)`, or 0 before any access
    pub hit_rate: f64,
}

// =============================================================================
// Tile Cache
// =============================================================================

/// LRU cache of decoded tiles with byte and count budgets.
///
/// The cache itself is single-owner; the tile manager wraps it in a mutex so
/// that concurrent fetch completions and viewport queries serialize on it.
///
/// # Example
///
/// ```
/// use image::RgbaImage;
/// use pyramid_streamer::pyramid::ImageRect;
/// use pyramid_streamer::tile::{Tile, TileCache, TileKey};
///
/// let mut cache = TileCache::with_capacity(1024 * 1024);
/// let key = TileKey::new(0, 1, 2);
///
/// cache.set(Tile::new(key, RgbaImage::new(256, 256), ImageRect::new(256, 512, 256, 256)));
///
/// let tile = cache.get(&key).expect("cached");
/// assert_eq!(tile.image_x, 256);
/// assert_eq!(cache.stats().hits, 1);
/// ```
pub struct TileCache {
    /// Entries ordered by recency; `last_access` mirrors this order
    entries: LruCache<TileKey, Tile>,

    config: CacheConfig,

    cpu_bytes: usize,
    gpu_bytes: usize,

    /// Logical clock advanced by every `get` and `set`
    clock: u64,

    hits: u64,
    misses: u64,
    evictions: u64,

    /// Handles the renderer should release
    released_gpu: Vec<GpuHandle>,
}

impl TileCache {
    /// Create a cache with default budgets.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Create a cache bounded only by a CPU byte budget.
    pub fn with_capacity(max_cpu_bytes: usize) -> Self {
        Self::with_config(CacheConfig::with_max_cpu_bytes(max_cpu_bytes))
    }

    /// Create a cache with the given budgets.
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            entries: LruCache::unbounded(),
            config,
            cpu_bytes: 0,
            gpu_bytes: 0,
            clock: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            released_gpu: Vec::new(),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Get a tile, marking it most recently used and counting a hit or miss.
    pub fn get(&mut self, key: &TileKey) -> Option<&Tile> {
        let now = self.tick();
        match self.entries.get_mut(key) {
            Some(tile) => {
                tile.last_access = now;
                self.hits += 1;
                Some(&*tile)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Look at a tile without touching recency or statistics.
    pub fn peek(&self, key: &TileKey) -> Option<&Tile> {
        self.entries.peek(key)
    }

    /// Check if a tile is cached without updating LRU order or statistics.
    pub fn contains(&self, key: &TileKey) -> bool {
        self.entries.contains(key)
    }

    /// Store a tile, replacing any entry with the same key, then evict until
    /// every budget is satisfied.
    pub fn set(&mut self, mut tile: Tile) {
        if let Some(old) = self.entries.pop(&tile.key) {
            self.release(old);
        }

        tile.last_access = self.tick();
        self.cpu_bytes += tile.byte_size();
        if tile.gpu.is_some() {
            self.gpu_bytes += tile.byte_size();
        }
        trace!(key = %tile.key, bytes = tile.byte_size(), "cached tile");
        self.entries.put(tile.key, tile);

        self.enforce_budget();
    }

    /// Remove a tile, releasing its payload.
    ///
    /// Returns the removed tile if it existed.
    pub fn remove(&mut self, key: &TileKey) -> Option<Tile> {
        let tile = self.entries.pop(key)?;
        self.release(tile.clone());
        Some(tile)
    }

    /// Evict up to `n` tiles in LRU order. Returns the number evicted.
    pub fn evict_lru(&mut self, n: usize) -> usize {
        let mut evicted = 0;
        while evicted < n {
            let Some(key) = self.eviction_candidate() else {
                break;
            };
            if let Some(tile) = self.entries.pop(&key) {
                trace!(key = %key, visible = tile.visible, "evicted tile");
                self.release(tile);
                self.evictions += 1;
                evicted += 1;
            }
        }
        evicted
    }

    /// Remove every tile, releasing all payloads.
    pub fn clear(&mut self) {
        while let Some((_, tile)) = self.entries.pop_lru() {
            self.release(tile);
        }
        self.cpu_bytes = 0;
        self.gpu_bytes = 0;
    }

    /// Set a tile's visibility flag without touching recency.
    ///
    /// Returns `false` if the tile is not cached.
    pub fn set_visible(&mut self, key: &TileKey, visible: bool) -> bool {
        match self.entries.peek_mut(key) {
            Some(tile) => {
                tile.visible = visible;
                true
            }
            None => false,
        }
    }

    /// Record that the renderer uploaded a tile to the GPU.
    ///
    /// Replaces (and queues for release) any previous handle, then drops
    /// residency of older tiles while the GPU budget is exceeded. Returns
    /// `false` if the tile is not cached, in which case the handle is queued
    /// for release immediately.
    pub fn mark_gpu_resident(&mut self, key: &TileKey, handle: GpuHandle) -> bool {
        let Some(tile) = self.entries.peek_mut(key) else {
            self.released_gpu.push(handle);
            return false;
        };

        let size = tile.byte_size();
        if let Some(previous) = tile.gpu.replace(handle) {
            self.released_gpu.push(previous);
        } else {
            self.gpu_bytes += size;
        }

        self.enforce_gpu_budget(Some(*key));
        true
    }

    /// Take the GPU handles the renderer should release.
    pub fn take_released_gpu_handles(&mut self) -> Vec<GpuHandle> {
        mem::take(&mut self.released_gpu)
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<TileKey> {
        self.entries.iter().map(|(key, _)| *key).collect()
    }

    /// Visit every cached tile without touching recency.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut Tile)) {
        for (_, tile) in self.entries.iter_mut() {
            f(tile);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cpu_bytes(&self) -> usize {
        self.cpu_bytes
    }

    pub fn gpu_bytes(&self) -> usize {
        self.gpu_bytes
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        let accesses = self.hits + self.misses;
        CacheStats {
            tile_count: self.entries.len(),
            cpu_bytes: self.cpu_bytes,
            gpu_bytes: self.gpu_bytes,
            max_cpu_bytes: self.config.max_cpu_bytes,
            max_gpu_bytes: self.config.max_gpu_bytes,
            max_tiles: self.config.max_tiles,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            hit_rate: if accesses == 0 {
                0.0
            } else {
                self.hits as f64 / accesses as f64
            },
        }
    }

    fn over_budget(&self) -> bool {
        self.cpu_bytes > self.config.max_cpu_bytes || self.entries.len() > self.config.max_tiles
    }

    fn enforce_budget(&mut self) {
        while self.over_budget() && !self.entries.is_empty() {
            if self.evict_lru(1) == 0 {
                break;
            }
        }
        self.enforce_gpu_budget(None);
    }

    /// Drop GPU residency, oldest first, until the GPU budget holds.
    ///
    /// `keep` is never demoted; it is the tile that was just uploaded.
    fn enforce_gpu_budget(&mut self, keep: Option<TileKey>) {
        while self.gpu_bytes > self.config.max_gpu_bytes {
            let candidate = self
                .entries
                .iter()
                .rev()
                .filter(|(key, tile)| tile.gpu.is_some() && Some(**key) != keep)
                .min_by_key(|(_, tile)| self.config.protect_visible && tile.visible)
                .map(|(key, _)| *key);

            let Some(key) = candidate else {
                break;
            };
            if let Some(tile) = self.entries.peek_mut(&key) {
                if let Some(handle) = tile.gpu.take() {
                    self.gpu_bytes = self.gpu_bytes.saturating_sub(tile.byte_size());
                    self.released_gpu.push(handle);
                    trace!(key = %key, "dropped gpu residency");
                }
            }
        }
    }

    /// Least recently used tile, skipping visible tiles while an invisible
    /// one remains (when visible tiles are protected).
    fn eviction_candidate(&self) -> Option<TileKey> {
        if self.config.protect_visible {
            let invisible = self
                .entries
                .iter()
                .rev()
                .find(|(_, tile)| !tile.visible)
                .map(|(key, _)| *key);
            if invisible.is_some() {
                return invisible;
            }
        }
        self.entries.peek_lru().map(|(key, _)| *key)
    }

    fn release(&mut self, tile: Tile) {
        let size = tile.byte_size();
        self.cpu_bytes = self.cpu_bytes.saturating_sub(size);
        if let Some(handle) = tile.gpu {
            self.gpu_bytes = self.gpu_bytes.saturating_sub(size);
            self.released_gpu.push(handle);
        }
        // Dropping the tile releases this cache's reference to the pixels.
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
