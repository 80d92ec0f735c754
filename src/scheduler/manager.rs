//! Tile manager: bridges viewport queries to a bounded fetch pipeline.
//!
//! [`TileManager::get_visible_tiles`] is synchronous. It answers from the
//! cache, enqueues whatever is missing and hands queue draining to a
//! background task, so viewport queries never wait on a fetch.
//!
//! # Load lifecycle
//!
//! ```text
//! get_visible_tiles ──miss──► LoadQueue ──drain task──► in_flight ──fetch──► TileCache
//!        ▲                                                   │
//!        └──────────────── next query sees the tile ◄────────┘
//! ```
//!
//! Failed, empty and timed-out fetches are logged and dropped; the cell stays
//! a miss and is requested again by the next query that still needs it.

use std::collections::HashSet;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::config::{CacheConfig, SchedulerConfig};
use crate::error::{ManagerError, SourceError};
use crate::pyramid::{ImageRect, PyramidLevel};
use crate::source::{SourceInfo, TileSource};
use crate::tile::{CacheStats, GpuHandle, Tile, TileCache, TileKey};

use super::queue::{LoadQueue, LoadRequest};
use super::trend::ZoomTrend;
use super::view::{grid_center, select_level, tile_distance, TileRange, ViewProjection};

/// Coarser levels enqueued ahead of the target while nothing has been shown.
const INITIAL_COARSE_LEVELS: u32 = 2;

// =============================================================================
// State
// =============================================================================

/// Source metadata lifecycle.
#[derive(Debug, Clone)]
enum InitState {
    /// Metadata query running
    Pending,
    Ready(Arc<SourceInfo>),
    /// Query failed; retried on the next viewport query
    Failed,
}

/// Fetch outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    /// Fetches that produced a cached tile
    pub completed: u64,

    /// Fetches that failed or returned no data
    pub failed: u64,

    /// Fetches abandoned after the fetch timeout
    pub timed_out: u64,

    /// Prefetch requests shed because the queue was full
    pub dropped_prefetch: u64,
}

struct ManagerState {
    cache: TileCache,
    queue: LoadQueue,

    /// Keys whose fetch has started and not yet completed
    in_flight: HashSet<TileKey>,

    init: InitState,

    /// Set once any tile has been returned; ends the initial-load phase
    first_tile_shown: bool,

    /// Target-level keys of the latest query
    wanted: HashSet<TileKey>,

    /// Keys flagged visible in the cache, reset on the next query
    shown: Vec<TileKey>,

    trend: ZoomTrend,
    drain_scheduled: bool,
    destroyed: bool,
    stats: LoadStats,
}

impl ManagerState {
    fn is_idle(&self) -> bool {
        self.queue.is_empty()
            && self.in_flight.is_empty()
            && !self.drain_scheduled
            && !matches!(self.init, InitState::Pending)
    }

    /// Enqueue a request unless the tile is cached or already loading.
    fn enqueue(&mut self, request: LoadRequest) -> bool {
        if self.in_flight.contains(&request.key) || self.cache.contains(&request.key) {
            return false;
        }
        self.queue.push(request)
    }

    fn mark_shown(&mut self, key: TileKey) {
        if self.cache.set_visible(&key, true) {
            self.shown.push(key);
        }
    }
}

struct Inner<S> {
    source: Arc<S>,
    config: SchedulerConfig,
    runtime: Handle,
    state: Mutex<ManagerState>,

    /// Woken whenever the manager may have become idle
    idle: Notify,
}

impl<S> Inner<S> {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// TileManager
// =============================================================================

/// Viewport-driven tile cache and load scheduler over a [`TileSource`].
///
/// Must be created inside a tokio runtime; metadata queries and fetches run
/// as tasks on that runtime. Cloning yields another handle to the same
/// manager.
pub struct TileManager<S: TileSource> {
    inner: Arc<Inner<S>>,
}

impl<S: TileSource> Clone for TileManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: TileSource> TileManager<S> {
    /// Create a manager with default cache and scheduler settings.
    pub fn new(source: S) -> Result<Self, ManagerError> {
        Self::with_config(source, CacheConfig::default(), SchedulerConfig::default())
    }

    pub fn with_config(
        source: S,
        cache: CacheConfig,
        scheduler: SchedulerConfig,
    ) -> Result<Self, ManagerError> {
        cache.validate().map_err(ManagerError::InvalidConfig)?;
        scheduler.validate().map_err(ManagerError::InvalidConfig)?;
        let runtime = Handle::try_current().map_err(|_| ManagerError::NoRuntime)?;

        let state = ManagerState {
            cache: TileCache::with_config(cache),
            queue: LoadQueue::new(scheduler.max_queue_length),
            in_flight: HashSet::new(),
            init: InitState::Pending,
            first_tile_shown: false,
            wanted: HashSet::new(),
            shown: Vec::new(),
            trend: ZoomTrend::new(),
            drain_scheduled: false,
            destroyed: false,
            stats: LoadStats::default(),
        };

        let manager = Self {
            inner: Arc::new(Inner {
                source: Arc::new(source),
                config: scheduler,
                runtime,
                state: Mutex::new(state),
                idle: Notify::new(),
            }),
        };
        spawn_init(&manager.inner);
        Ok(manager)
    }

    /// The tile source.
    pub fn source(&self) -> &Arc<S> {
        &self.inner.source
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Source metadata, once the source has reported it.
    pub fn source_info(&self) -> Option<Arc<SourceInfo>> {
        match &self.inner.lock().init {
            InitState::Ready(info) => Some(info.clone()),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.source_info().is_some()
    }

    /// Pyramid level a view would load, once the source is ready.
    pub fn target_level(&self, view: &ViewProjection) -> Option<u32> {
        self.source_info()
            .map(|info| select_level(view.zoom(), info.level_count()))
    }

    // =========================================================================
    // Viewport query
    // =========================================================================

    /// Tiles available for `view` right now.
    ///
    /// Never waits on I/O. The list holds cached target-level tiles and, with
    /// progressive loading, cached coarser tiles standing in for missing ones
    /// (coarsest first, so they can be drawn underneath). Missing tiles are
    /// queued and loaded in the background; later calls return a more
    /// complete picture. Returns an empty list while the source is still
    /// initializing.
    pub fn get_visible_tiles(&self, view: &ViewProjection) -> Vec<Tile> {
        let config = &self.inner.config;
        let mut state = self.inner.lock();
        if state.destroyed {
            return Vec::new();
        }

        let info = match &state.init {
            InitState::Ready(info) => info.clone(),
            InitState::Pending => return Vec::new(),
            InitState::Failed => {
                state.init = InitState::Pending;
                spawn_init(&self.inner);
                return Vec::new();
            }
        };

        // Last frame's visibility no longer applies
        for key in mem::take(&mut state.shown) {
            state.cache.set_visible(&key, false);
        }
        state.wanted.clear();

        let zoom = view.zoom();
        state.trend.record(zoom);
        let level_count = info.level_count();
        let target = select_level(zoom, level_count);
        let Some(level) = info.level(target).copied() else {
            return Vec::new();
        };
        let Some(rect) = view.visible_image_rect(info.width, info.height) else {
            return Vec::new();
        };

        let range = TileRange::covering(&level, &rect);
        let center = grid_center(&level, &rect);
        let visible_cap = config.prefetch_penalty - 1.0;

        let mut tiles = Vec::new();
        let mut fallbacks: Vec<Tile> = Vec::new();
        let mut fallback_keys = HashSet::new();
        let mut requests = Vec::new();

        for key in range.keys() {
            state.wanted.insert(key);

            // A loading cell is a known miss; leave hit statistics alone
            let loading = state.in_flight.contains(&key);
            let hit = if loading {
                None
            } else {
                state.cache.get(&key).filter(|tile| tile.has_pixels()).cloned()
            };

            if let Some(mut tile) = hit {
                state.mark_shown(key);
                tile.visible = true;
                tiles.push(tile);
                continue;
            }

            if !loading {
                let priority = tile_distance(&key, center).min(visible_cap);
                requests.push(LoadRequest::visible(key, priority));
            }

            if config.progressive {
                for levels in 1..(level_count - target) {
                    let ancestor = key.ancestor(levels);
                    if fallback_keys.contains(&ancestor) {
                        break;
                    }
                    let substitute = state
                        .cache
                        .peek(&ancestor)
                        .filter(|tile| tile.has_pixels())
                        .cloned();
                    if let Some(mut tile) = substitute {
                        fallback_keys.insert(ancestor);
                        state.mark_shown(ancestor);
                        tile.visible = true;
                        fallbacks.push(tile);
                        break;
                    }
                }
            }
        }

        let initial_phase = !state.first_tile_shown;
        if initial_phase {
            requests.extend(initial_requests(&info, target, &rect, config));
        }
        if config.prefetch {
            requests.extend(margin_requests(&level, &range, center, config));
            let weights = state.trend.adjacent_weights();
            requests.extend(adjacent_requests(&info, target, &rect, weights, config));
        }

        // Requests still queued for an earlier view fall behind this one
        let current: HashSet<TileKey> = requests
            .iter()
            .filter(|request| !request.is_prefetch)
            .map(|request| request.key)
            .collect();
        let demoted = state.queue.demote_visible(&current, config.prefetch_penalty);

        let mut queued = 0;
        for request in requests {
            if state.enqueue(request) {
                queued += 1;
            }
        }

        if !tiles.is_empty() || !fallbacks.is_empty() {
            state.first_tile_shown = true;
        }
        if !state.queue.is_empty() {
            schedule_drain(&self.inner, &mut state);
        }

        debug!(
            level = target,
            zoom,
            cells = range.len(),
            hits = tiles.len(),
            fallbacks = fallbacks.len(),
            queued,
            demoted,
            queue = state.queue.len(),
            loading = state.in_flight.len(),
            "viewport query"
        );

        fallbacks.sort_by(|a, b| b.key.level.cmp(&a.key.level));
        fallbacks.extend(tiles);
        fallbacks
    }

    // =========================================================================
    // Cache and load state
    // =========================================================================

    pub fn get_cache_stats(&self) -> CacheStats {
        self.inner.lock().cache.stats()
    }

    pub fn get_load_stats(&self) -> LoadStats {
        let state = self.inner.lock();
        LoadStats {
            dropped_prefetch: state.queue.dropped_prefetch(),
            ..state.stats
        }
    }

    /// Drop every cached tile. Queued and in-flight loads continue.
    pub fn clear_cache(&self) {
        let mut state = self.inner.lock();
        state.cache.clear();
        state.shown.clear();
        debug!("tile cache cleared");
    }

    /// Number of fetches in flight.
    pub fn get_loading_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Number of queued requests not yet started.
    pub fn get_queue_length(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Record that the renderer uploaded a cached tile to the GPU.
    ///
    /// Returns `false` if the tile is no longer cached; its handle is then
    /// queued for release.
    pub fn mark_uploaded(&self, key: &TileKey, handle: GpuHandle) -> bool {
        self.inner.lock().cache.mark_gpu_resident(key, handle)
    }

    /// GPU handles of tiles that were evicted or lost GPU residency.
    pub fn take_released_gpu_handles(&self) -> Vec<GpuHandle> {
        self.inner.lock().cache.take_released_gpu_handles()
    }

    /// Wait until the source has reported its metadata (or failed to).
    ///
    /// Returns whether the manager is ready.
    pub async fn wait_ready(&self) -> bool {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let init = self.inner.lock().init.clone();
            match init {
                InitState::Ready(_) => return true,
                InitState::Failed => return false,
                InitState::Pending => notified.await,
            }
        }
    }

    /// Wait until nothing is queued or loading.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idle = {
                let state = self.inner.lock();
                state.destroyed || state.is_idle()
            };
            if idle {
                return;
            }
            notified.await;
        }
    }

    /// Stop scheduling, drop every cached tile and release the source.
    ///
    /// Fetches already running complete but their results are discarded.
    pub fn destroy(&self) {
        {
            let mut state = self.inner.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.queue.clear();
            state.cache.clear();
            state.shown.clear();
            state.wanted.clear();
        }
        self.inner.source.destroy();
        self.inner.idle.notify_waiters();
        info!("tile manager destroyed");
    }
}

// =============================================================================
// Request planning
// =============================================================================

/// Coarse tiles that get something on screen before the first paint.
fn initial_requests(
    info: &SourceInfo,
    target: u32,
    rect: &ImageRect,
    config: &SchedulerConfig,
) -> Vec<LoadRequest> {
    let last = info.level_count().saturating_sub(1);
    let coarsest = target.saturating_add(INITIAL_COARSE_LEVELS).min(last);

    let mut requests = Vec::new();
    for index in (target + 1)..=coarsest {
        let Some(level) = info.level(index) else {
            continue;
        };
        let range = TileRange::covering(level, rect);
        let center = grid_center(level, rect);
        let bonus = config.initial_level_bonus * (index - target) as f64;
        for key in range.keys() {
            let priority = (tile_distance(&key, center) - bonus).min(config.prefetch_penalty - 1.0);
            requests.push(LoadRequest::visible(key, priority));
        }
    }
    requests
}

/// Same-level tiles in a margin around the visible range.
fn margin_requests(
    level: &PyramidLevel,
    range: &TileRange,
    center: glam::DVec2,
    config: &SchedulerConfig,
) -> Vec<LoadRequest> {
    if config.prefetch_margin == 0 || range.is_empty() {
        return Vec::new();
    }

    let outer = range.expand(config.prefetch_margin, level);
    outer
        .keys()
        .filter(|key| !range.contains(key))
        .map(|key| {
            LoadRequest::prefetch(key, config.prefetch_penalty + tile_distance(&key, center))
        })
        .collect()
}

/// Tiles one level finer and one level coarser covering the visible region,
/// nearest first, capped per level and weighted by the zoom trend.
fn adjacent_requests(
    info: &SourceInfo,
    target: u32,
    rect: &ImageRect,
    (finer_weight, coarser_weight): (f64, f64),
    config: &SchedulerConfig,
) -> Vec<LoadRequest> {
    let mut candidates = Vec::new();
    if target > 0 {
        candidates.push((target - 1, finer_weight));
    }
    if target + 1 < info.level_count() {
        candidates.push((target + 1, coarser_weight));
    }

    let mut requests = Vec::new();
    for (index, weight) in candidates {
        let cap = ((config.max_adjacent_prefetch as f64) * weight * 2.0)
            .ceil()
            .min(config.max_adjacent_prefetch as f64) as usize;
        if cap == 0 {
            continue;
        }
        let Some(level) = info.level(index) else {
            continue;
        };

        let center = grid_center(level, rect);
        let mut keys: Vec<(f64, TileKey)> = TileRange::covering(level, rect)
            .keys()
            .map(|key| (tile_distance(&key, center), key))
            .collect();
        keys.sort_by(|a, b| a.0.total_cmp(&b.0));

        let direction_penalty = (1.0 - weight) * config.prefetch_penalty * 0.5;
        requests.extend(keys.into_iter().take(cap).map(|(distance, key)| {
            LoadRequest::prefetch(key, config.prefetch_penalty + direction_penalty + distance)
        }));
    }
    requests
}

// =============================================================================
// Background work
// =============================================================================

fn spawn_init<S: TileSource>(inner: &Arc<Inner<S>>) {
    let task_inner = inner.clone();
    inner.runtime.spawn(async move {
        let result = SourceInfo::query(task_inner.source.as_ref()).await;
        {
            let mut state = task_inner.lock();
            if state.destroyed {
                return;
            }
            state.init = match result {
                Ok(info) => {
                    info!(
                        width = info.width,
                        height = info.height,
                        levels = info.level_count(),
                        "tile source ready"
                    );
                    InitState::Ready(Arc::new(info))
                }
                Err(e) => {
                    warn!(error = %e, "tile source initialization failed");
                    InitState::Failed
                }
            };
        }
        task_inner.idle.notify_waiters();
    });
}

/// Start a drain task unless one is already pending.
fn schedule_drain<S: TileSource>(inner: &Arc<Inner<S>>, state: &mut ManagerState) {
    if state.drain_scheduled || state.destroyed {
        return;
    }
    state.drain_scheduled = true;
    inner.runtime.spawn(drain(inner.clone()));
}

/// Start queued fetches in batches until the queue is empty or the
/// concurrency limit is reached, yielding between batches.
async fn drain<S: TileSource>(inner: Arc<Inner<S>>) {
    loop {
        let started = {
            let mut state = inner.lock();
            let mut started = 0;

            if !state.destroyed {
                let (max_concurrent, batch) = inner.config.limits(!state.first_tile_shown);
                while started < batch && state.in_flight.len() < max_concurrent {
                    let Some(request) = state.queue.pop() else {
                        break;
                    };
                    // Loaded or started since it was queued
                    if state.in_flight.contains(&request.key)
                        || state.cache.contains(&request.key)
                    {
                        continue;
                    }
                    state.in_flight.insert(request.key);
                    spawn_fetch(&inner, request);
                    started += 1;
                }
            }

            if started == 0 {
                state.drain_scheduled = false;
            }
            started
        };

        if started == 0 {
            inner.idle.notify_waiters();
            return;
        }
        trace!(started, "drain batch");
        tokio::task::yield_now().await;
    }
}

fn spawn_fetch<S: TileSource>(inner: &Arc<Inner<S>>, request: LoadRequest) {
    let task_inner = inner.clone();
    inner.runtime.spawn(async move {
        let key = request.key;
        let fetch = task_inner.source.get_tile(key);

        let result = match task_inner.config.fetch_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fetch).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout {
                    level: key.level,
                    x: key.x,
                    y: key.y,
                    millis: timeout.as_millis() as u64,
                }),
            },
            None => fetch.await,
        };

        complete(&task_inner, request, result);
    });
}

/// Record a finished fetch and keep the queue moving.
fn complete<S: TileSource>(
    inner: &Arc<Inner<S>>,
    request: LoadRequest,
    result: Result<Option<Tile>, SourceError>,
) {
    let key = request.key;
    {
        let mut state = inner.lock();
        state.in_flight.remove(&key);

        if !state.destroyed {
            match result {
                Ok(Some(mut tile)) if tile.has_pixels() => {
                    // A tile the current view wants must not be the first evicted
                    tile.visible = state.wanted.contains(&key);
                    tile.key = key;
                    let visible = tile.visible;
                    state.cache.set(tile);
                    if visible {
                        state.shown.push(key);
                    }
                    state.stats.completed += 1;
                    trace!(key = %key, prefetch = request.is_prefetch, "tile loaded");
                }
                Ok(_) => {
                    state.stats.failed += 1;
                    debug!(key = %key, "tile source returned no data");
                }
                Err(e) => {
                    if matches!(e, SourceError::Timeout { .. }) {
                        state.stats.timed_out += 1;
                    }
                    state.stats.failed += 1;
                    warn!(
                        key = %key,
                        prefetch = request.is_prefetch,
                        error = %e,
                        "tile fetch failed"
                    );
                }
            }

            if !state.queue.is_empty() {
                schedule_drain(inner, &mut state);
            }
        }
    }
    inner.idle.notify_waiters();
}
