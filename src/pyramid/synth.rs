//! Coarse-level synthesis for sources tiled only at native resolution.
//!
//! [`PyramidSynthesizer`] wraps a [`TileSource`] and answers requests for
//! levels the source does not provide itself:
//!
//! - **Direct composition** for shallow levels: the native tiles under the
//!   coarse tile's footprint are fetched and scaled into one raster.
//! - **Overview** for deep levels, or when composition would need too many
//!   native tiles: one small raster of the whole image is built once from a
//!   bounded sample of native tiles, and coarse tiles are cropped from it.
//!
//! Native tiles are kept in a private LRU cache, separate from the viewport
//! cache, with concurrent requests for the same tile coalesced into a single
//! fetch.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use image::RgbaImage;
use lru::LruCache;
use tokio::sync::{Notify, OnceCell};
use tracing::{debug, info, warn};

use crate::config::SynthesisConfig;
use crate::error::{ManagerError, SourceError};
use crate::source::{SourceInfo, TileSource};
use crate::tile::{Tile, TileKey};

use super::level::{level_count_for, ImageRect, PyramidLevel};
use super::raster::{blit_scaled, new_raster};

/// Native tile coordinates `(x, y)` at level 0.
type NativeCoord = (u32, u32);

/// Lock a std mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Geometry
// =============================================================================

/// Pyramid geometry resolved from the wrapped source on first use.
#[derive(Debug)]
struct Geometry {
    /// Levels exposed by the synthesizer
    info: SourceInfo,

    /// Native (level 0) geometry of the wrapped source
    native: PyramidLevel,

    /// Number of levels the wrapped source serves itself
    source_levels: u32,
}

// =============================================================================
// Native Tile Cache
// =============================================================================

struct NativeCache {
    tiles: LruCache<NativeCoord, Arc<RgbaImage>>,
    in_flight: HashMap<NativeCoord, Arc<Notify>>,
}

// =============================================================================
// Overview State
// =============================================================================

/// Lifecycle of the overview raster.
enum OverviewState {
    NotStarted,
    InProgress(Arc<Notify>),
    Ready(Arc<RgbaImage>),
}

struct Overview {
    state: OverviewState,

    /// Bumped on invalidation so a build started earlier is discarded
    generation: u64,

    /// Latest build that finished without a raster
    failed: Option<Arc<Notify>>,
}

/// Whether a caller fetches a native tile itself or waits for another.
enum Role {
    Lead(Arc<Notify>),
    Wait(Arc<Notify>),
}

/// Clears a native in-flight entry and wakes waiters, even if the fetch is
/// dropped before completing.
struct NativeFetchGuard<'a> {
    native: &'a Mutex<NativeCache>,
    coord: NativeCoord,
    notify: Arc<Notify>,
}

impl Drop for NativeFetchGuard<'_> {
    fn drop(&mut self) {
        let mut native = lock(self.native);
        if native
            .in_flight
            .get(&self.coord)
            .is_some_and(|current| Arc::ptr_eq(current, &self.notify))
        {
            native.in_flight.remove(&self.coord);
        }
        drop(native);
        self.notify.notify_waiters();
    }
}

/// Resets an unfinished overview build and wakes waiters.
struct OverviewBuildGuard<'a> {
    overview: &'a Mutex<Overview>,
    notify: Arc<Notify>,
}

impl Drop for OverviewBuildGuard<'_> {
    fn drop(&mut self) {
        let mut overview = lock(self.overview);
        if let OverviewState::InProgress(current) = &overview.state {
            if Arc::ptr_eq(current, &self.notify) {
                overview.state = OverviewState::NotStarted;
            }
        }
        drop(overview);
        self.notify.notify_waiters();
    }
}

// =============================================================================
// PyramidSynthesizer
// =============================================================================

/// [`TileSource`] adding synthesized coarse levels to a native-resolution
/// source.
///
/// Levels the wrapped source reports are served by it directly (level 0
/// through the native cache). Every other level up to the point where the
/// image's smaller side fits in one tile is synthesized. Synthesized tiles
/// always declare the nominal image-space footprint of their cell; only their
/// pixel resolution is reduced.
pub struct PyramidSynthesizer<S> {
    source: S,
    config: SynthesisConfig,
    geometry: OnceCell<Geometry>,
    native: Mutex<NativeCache>,
    overview: Mutex<Overview>,

    /// Native tiles actually fetched from the wrapped source
    native_fetches: AtomicUsize,
}

impl<S: TileSource> PyramidSynthesizer<S> {
    /// Wrap `source` with default synthesis settings.
    pub fn new(source: S) -> Self {
        Self::build(source, SynthesisConfig::default())
    }

    /// Wrap `source`, rejecting settings that fail
    /// [`SynthesisConfig::validate`].
    pub fn with_config(source: S, config: SynthesisConfig) -> Result<Self, ManagerError> {
        config.validate().map_err(ManagerError::InvalidConfig)?;
        Ok(Self::build(source, config))
    }

    fn build(source: S, config: SynthesisConfig) -> Self {
        let capacity = NonZeroUsize::new(config.native_cache_tiles).unwrap_or(NonZeroUsize::MIN);

        Self {
            source,
            config,
            geometry: OnceCell::new(),
            native: Mutex::new(NativeCache {
                tiles: LruCache::new(capacity),
                in_flight: HashMap::new(),
            }),
            overview: Mutex::new(Overview {
                state: OverviewState::NotStarted,
                generation: 0,
                failed: None,
            }),
            native_fetches: AtomicUsize::new(0),
        }
    }

    /// The wrapped source.
    pub fn inner(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Number of native tiles fetched from the wrapped source so far.
    pub fn native_fetch_count(&self) -> usize {
        self.native_fetches.load(Ordering::SeqCst)
    }

    /// Whether the overview raster has been built.
    pub fn overview_ready(&self) -> bool {
        matches!(lock(&self.overview).state, OverviewState::Ready(_))
    }

    /// Drop the overview raster so the next deep-level request rebuilds it.
    ///
    /// A build already running completes for its current callers but is not
    /// kept.
    pub fn invalidate_overview(&self) {
        let mut overview = lock(&self.overview);
        overview.generation += 1;
        if let OverviewState::Ready(_) = overview.state {
            overview.state = OverviewState::NotStarted;
        }
        debug!(generation = overview.generation, "overview invalidated");
    }

    async fn geometry(&self) -> Result<&Geometry, SourceError> {
        self.geometry
            .get_or_try_init(|| async {
                let (width, height) = self.source.image_size().await?;
                let source_levels = self.source.level_count().await?.max(1);
                let (tw, th) = self.source.tile_size(0);

                let level_count = source_levels.max(level_count_for(width, height, tw, th));
                let info = SourceInfo::new(width, height, level_count, |level| {
                    if level < source_levels {
                        self.source.tile_size(level)
                    } else {
                        (tw, th)
                    }
                });
                let native = PyramidLevel::new(width, height, 0, tw, th);

                debug!(
                    width,
                    height,
                    source_levels,
                    level_count,
                    "synthesizer geometry resolved"
                );
                Ok::<_, SourceError>(Geometry {
                    info,
                    native,
                    source_levels,
                })
            })
            .await
    }

    // =========================================================================
    // Native tiles
    // =========================================================================

    /// Fetch a native tile through the native cache.
    ///
    /// Concurrent callers for the same tile share one fetch. `Ok(None)` means
    /// the source had no data for it.
    async fn native_tile(&self, x: u32, y: u32) -> Result<Option<Arc<RgbaImage>>, SourceError> {
        let coord = (x, y);
        loop {
            let role = {
                let mut native = lock(&self.native);
                if let Some(pixels) = native.tiles.get(&coord) {
                    return Ok(Some(pixels.clone()));
                }

                match native.in_flight.get(&coord) {
                    Some(notify) => Role::Wait(notify.clone()),
                    None => {
                        let notify = Arc::new(Notify::new());
                        native.in_flight.insert(coord, notify.clone());
                        Role::Lead(notify)
                    }
                }
            };

            let notify = match role {
                Role::Lead(notify) => notify,
                Role::Wait(pending) => {
                    // Register before re-checking so the wakeup is not missed
                    let notified = pending.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    let still_running = lock(&self.native)
                        .in_flight
                        .get(&coord)
                        .is_some_and(|current| Arc::ptr_eq(current, &pending));
                    if still_running {
                        notified.await;
                    }
                    continue;
                }
            };

            let _guard = NativeFetchGuard {
                native: &self.native,
                coord,
                notify,
            };

            self.native_fetches.fetch_add(1, Ordering::SeqCst);
            let result = self
                .source
                .get_tile(TileKey::new(0, x, y))
                .await
                .map(|tile| tile.filter(Tile::has_pixels).map(|tile| tile.pixels));

            if let Ok(Some(pixels)) = &result {
                lock(&self.native).tiles.put(coord, pixels.clone());
            }
            return result;
        }
    }

    /// Fetch native tiles with bounded concurrency, keeping the ones that
    /// yielded pixels.
    async fn fetch_native(
        &self,
        native: &PyramidLevel,
        coords: Vec<NativeCoord>,
    ) -> Vec<(ImageRect, Arc<RgbaImage>)> {
        stream::iter(coords)
            .map(|(x, y)| async move { ((x, y), self.native_tile(x, y).await) })
            .buffer_unordered(self.config.compose_concurrency)
            .filter_map(|((x, y), result)| async move {
                match result {
                    Ok(Some(pixels)) => native.footprint(x, y).map(|rect| (rect, pixels)),
                    Ok(None) => None,
                    Err(e) => {
                        debug!(x, y, error = %e, "native tile unavailable for synthesis");
                        None
                    }
                }
            })
            .collect()
            .await
    }

    // =========================================================================
    // Direct composition
    // =========================================================================

    /// Native tiles covering `footprint`, or `None` if more than the
    /// composition cap would be needed.
    fn compose_coords(
        &self,
        native: &PyramidLevel,
        footprint: &ImageRect,
    ) -> Option<Vec<NativeCoord>> {
        let tw = native.tile_width as u64;
        let th = native.tile_height as u64;

        let x0 = (footprint.x as u64 / tw) as u32;
        let y0 = (footprint.y as u64 / th) as u32;
        let x1 = (footprint.right().div_ceil(tw) as u32).min(native.tiles_across);
        let y1 = (footprint.bottom().div_ceil(th) as u32).min(native.tiles_down);

        let count = (x1.saturating_sub(x0) as usize) * (y1.saturating_sub(y0) as usize);
        if count > self.config.max_compose_tiles {
            return None;
        }

        Some(
            (y0..y1)
                .flat_map(|y| (x0..x1).map(move |x| (x, y)))
                .collect(),
        )
    }

    async fn compose(
        &self,
        geometry: &Geometry,
        level: &PyramidLevel,
        key: TileKey,
        footprint: ImageRect,
        coords: Vec<NativeCoord>,
    ) -> Result<Option<Tile>, SourceError> {
        let parts = self.fetch_native(&geometry.native, coords).await;
        if parts.is_empty() {
            return Ok(None);
        }

        let (width, height) = level
            .tile_pixel_size(key.x, key.y)
            .unwrap_or((level.tile_width, level.tile_height));
        let pixels = paint(width, height, footprint, parts).await?;

        Ok(pixels.map(|pixels| Tile::new(key, pixels, footprint)))
    }

    // =========================================================================
    // Overview
    // =========================================================================

    /// The overview raster, building it if needed.
    ///
    /// Returns `Ok(None)` if no native tile yielded data.
    async fn overview(&self, geometry: &Geometry) -> Result<Option<Arc<RgbaImage>>, SourceError> {
        let mut waited_on: Option<Arc<Notify>> = None;
        let (notify, generation) = loop {
            let pending = {
                let mut overview = lock(&self.overview);
                match &overview.state {
                    OverviewState::Ready(raster) => return Ok(Some(raster.clone())),
                    OverviewState::NotStarted => {
                        // The build this caller waited on produced nothing
                        let failed = waited_on
                            .as_ref()
                            .zip(overview.failed.as_ref())
                            .is_some_and(|(waited, failed)| Arc::ptr_eq(waited, failed));
                        if failed {
                            return Ok(None);
                        }

                        // Otherwise it was cancelled or invalidated; take over
                        let notify = Arc::new(Notify::new());
                        overview.state = OverviewState::InProgress(notify.clone());
                        break (notify, overview.generation);
                    }
                    OverviewState::InProgress(notify) => notify.clone(),
                }
            };

            let notified = pending.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let still_running = matches!(
                &lock(&self.overview).state,
                OverviewState::InProgress(current) if Arc::ptr_eq(current, &pending)
            );
            if still_running {
                notified.await;
            }
            waited_on = Some(pending.clone());
        };

        let _guard = OverviewBuildGuard {
            overview: &self.overview,
            notify: notify.clone(),
        };

        let result = self.build_overview(geometry).await;

        let mut overview = lock(&self.overview);
        match &result {
            Ok(Some(raster)) if overview.generation == generation => {
                overview.state = OverviewState::Ready(raster.clone());
            }
            Ok(Some(_)) => {}
            _ => overview.failed = Some(notify),
        }
        drop(overview);

        result
    }

    async fn build_overview(
        &self,
        geometry: &Geometry,
    ) -> Result<Option<Arc<RgbaImage>>, SourceError> {
        let native = &geometry.native;
        let (width, height) = (geometry.info.width, geometry.info.height);
        let long_side = width.max(height).max(1) as f64;
        let scale = (long_side / self.config.overview_long_side as f64).max(1.0);
        let ow = ((width as f64 / scale).round() as u32).max(1);
        let oh = ((height as f64 / scale).round() as u32).max(1);

        let bins = sample_bins(native, self.config.overview_sample_cap);
        let coords: Vec<NativeCoord> = bins.iter().map(|(coord, _)| *coord).collect();
        let bin_rects: HashMap<NativeCoord, ImageRect> = bins.into_iter().collect();
        let sampled = coords.len();

        let parts: Vec<(ImageRect, Arc<RgbaImage>)> = stream::iter(coords)
            .map(|(x, y)| async move { ((x, y), self.native_tile(x, y).await) })
            .buffer_unordered(self.config.compose_concurrency)
            .filter_map(|(coord, result)| {
                let rect = bin_rects.get(&coord).copied();
                async move {
                    match result {
                        Ok(Some(pixels)) => rect.map(|rect| (rect, pixels)),
                        Ok(None) => None,
                        Err(e) => {
                            warn!(x = coord.0, y = coord.1, error = %e, "overview sample failed");
                            None
                        }
                    }
                }
            })
            .collect()
            .await;

        let painted = parts.len();
        if painted == 0 {
            warn!(sampled, "overview build produced no data");
            return Ok(None);
        }

        let full = ImageRect::new(0, 0, width, height);
        let raster = paint(ow, oh, full, parts).await?;
        info!(
            width = ow,
            height = oh,
            sampled,
            painted,
            native_grid = %format!("{}x{}", native.tiles_across, native.tiles_down),
            "built overview raster"
        );

        Ok(raster.map(Arc::new))
    }

    async fn from_overview(
        &self,
        geometry: &Geometry,
        level: &PyramidLevel,
        key: TileKey,
        footprint: ImageRect,
    ) -> Result<Option<Tile>, SourceError> {
        let Some(overview) = self.overview(geometry).await? else {
            return Ok(None);
        };

        let (width, height) = level
            .tile_pixel_size(key.x, key.y)
            .unwrap_or((level.tile_width, level.tile_height));
        let full = ImageRect::new(0, 0, geometry.info.width, geometry.info.height);

        let mut pixels = new_raster(width, height);
        if !blit_scaled(&mut pixels, &footprint, &overview, &full) {
            return Ok(None);
        }

        Ok(Some(Tile::new(key, pixels, footprint)))
    }
}

/// Paint `parts` (image-space rectangle plus pixels) into a new raster
/// covering `dst_rect`, on the blocking pool.
///
/// Returns `None` if nothing overlapped.
async fn paint(
    width: u32,
    height: u32,
    dst_rect: ImageRect,
    parts: Vec<(ImageRect, Arc<RgbaImage>)>,
) -> Result<Option<RgbaImage>, SourceError> {
    tokio::task::spawn_blocking(move || {
        let mut raster = new_raster(width, height);
        let mut drawn = false;
        for (rect, pixels) in &parts {
            drawn |= blit_scaled(&mut raster, &dst_rect, pixels, rect);
        }
        drawn.then_some(raster)
    })
    .await
    .map_err(|e| SourceError::Decode {
        message: format!("composition task failed: {}", e),
    })
}

/// Evenly spaced native tiles for the overview, each paired with the
/// image-space rectangle it stands in for.
///
/// When the grid fits within `cap` every tile stands for itself. Otherwise
/// the grid is split into at most `cap` bins and the tile at the centre of
/// each bin is stretched over the whole bin.
fn sample_bins(native: &PyramidLevel, cap: usize) -> Vec<(NativeCoord, ImageRect)> {
    let gx = native.tiles_across as usize;
    let gy = native.tiles_down as usize;
    let cap = cap.max(1);

    let (sx, sy) = if gx * gy <= cap {
        (gx, gy)
    } else {
        let sy = gy.min((cap as f64).sqrt().floor() as usize).max(1);
        let sx = gx.min(cap / sy).max(1);
        (sx, sy)
    };

    let span = |index: usize, bins: usize, grid: usize| {
        let start = index * grid / bins;
        let end = ((index + 1) * grid / bins).max(start + 1);
        (start as u32, end as u32)
    };

    let mut bins = Vec::with_capacity(sx * sy);
    for by in 0..sy {
        let (ty0, ty1) = span(by, sy, gy);
        for bx in 0..sx {
            let (tx0, tx1) = span(bx, sx, gx);

            let (Some(first), Some(last)) = (
                native.footprint(tx0, ty0),
                native.footprint(tx1 - 1, ty1 - 1),
            ) else {
                continue;
            };
            let rect = ImageRect::new(
                first.x,
                first.y,
                (last.right() - first.x as u64) as u32,
                (last.bottom() - first.y as u64) as u32,
            );

            let centre = ((tx0 + tx1 - 1) / 2, (ty0 + ty1 - 1) / 2);
            bins.push((centre, rect));
        }
    }
    bins
}

#[async_trait]
impl<S: TileSource> TileSource for PyramidSynthesizer<S> {
    async fn image_size(&self) -> Result<(u32, u32), SourceError> {
        let geometry = self.geometry().await?;
        Ok((geometry.info.width, geometry.info.height))
    }

    async fn level_count(&self) -> Result<u32, SourceError> {
        Ok(self.geometry().await?.info.level_count())
    }

    fn tile_size(&self, level: u32) -> (u32, u32) {
        match self.geometry.get() {
            Some(geometry) if level >= geometry.source_levels => self.source.tile_size(0),
            _ => self.source.tile_size(level),
        }
    }

    async fn get_tile(&self, key: TileKey) -> Result<Option<Tile>, SourceError> {
        let geometry = self.geometry().await?;
        let level = *geometry.info.check_key(&key)?;
        let footprint = level
            .footprint(key.x, key.y)
            .ok_or(SourceError::TileOutOfBounds {
                level: key.level,
                x: key.x,
                y: key.y,
                max_x: level.tiles_across,
                max_y: level.tiles_down,
            })?;

        if key.level == 0 {
            return Ok(self
                .native_tile(key.x, key.y)
                .await?
                .map(|pixels| Tile::from_shared(key, pixels, footprint)));
        }

        if key.level < geometry.source_levels {
            return self.source.get_tile(key).await;
        }

        if key.level < self.config.direct_max_level {
            if let Some(coords) = self.compose_coords(&geometry.native, &footprint) {
                return self.compose(geometry, &level, key, footprint, coords).await;
            }
            debug!(key = %key, "composition too wide, using overview");
        }

        self.from_overview(geometry, &level, key, footprint).await
    }

    fn destroy(&self) {
        {
            let mut native = lock(&self.native);
            native.tiles.clear();
        }
        self.invalidate_overview();
        self.source.destroy();
    }
}

// =============================================================================
// Tests
// =============================================================================
