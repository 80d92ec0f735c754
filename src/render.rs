//! Render backend capability trait.
//!
//! A backend is chosen once, when the viewer is created, and driven through
//! [`RenderBackend`]. Backends that keep GPU copies of tiles return a
//! [`GpuHandle`] from `upload_tile`; the tile manager tracks those for its GPU
//! budget and hands back handles that should be released.

use std::collections::HashMap;

use serde::Serialize;

use crate::scheduler::{TileManager, ViewProjection};
use crate::source::TileSource;
use crate::tile::{GpuHandle, Tile, TileKey};

/// Backend variant, fixed at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    WebGpu,
    WebGl2,
    WebGl,
    Canvas2d,
    Headless,
}

impl BackendKind {
    /// Whether tiles are uploaded to GPU memory.
    pub fn uses_gpu(&self) -> bool {
        !matches!(self, BackendKind::Canvas2d | BackendKind::Headless)
    }
}

/// Draw summary for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameStats {
    /// Tiles passed to `render_tiles`
    pub tiles_drawn: usize,

    /// Tiles from a coarser level than the frame's finest tile
    pub fallback_tiles: usize,

    /// Tiles uploaded this frame
    pub uploads: usize,

    /// GPU handles released this frame
    pub releases: usize,
}

/// Operations every render backend provides.
pub trait RenderBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Upload a tile's pixels. Returns the GPU handle, or `None` if the
    /// backend draws straight from CPU memory.
    fn upload_tile(&mut self, tile: &Tile) -> Option<GpuHandle>;

    /// Free a GPU copy previously returned by `upload_tile`.
    fn release_tile(&mut self, handle: GpuHandle);

    /// Draw `tiles` (coarsest first) under `view`.
    fn render_tiles(&mut self, tiles: &[Tile], view: &ViewProjection) -> FrameStats;
}

/// Fetch the visible tiles for `view`, sync GPU residency and draw them.
pub fn present_frame<S: TileSource, B: RenderBackend + ?Sized>(
    manager: &TileManager<S>,
    backend: &mut B,
    view: &ViewProjection,
) -> FrameStats {
    let tiles = manager.get_visible_tiles(view);

    let mut uploads = 0;
    for tile in tiles.iter().filter(|tile| tile.gpu.is_none()) {
        if let Some(handle) = backend.upload_tile(tile) {
            manager.mark_uploaded(&tile.key, handle);
            uploads += 1;
        }
    }

    let released = manager.take_released_gpu_handles();
    let releases = released.len();
    for handle in released {
        backend.release_tile(handle);
    }

    FrameStats {
        uploads,
        releases,
        ..backend.render_tiles(&tiles, view)
    }
}

// =============================================================================
// HeadlessBackend
// =============================================================================

/// Backend that draws nothing and records what it was given.
///
/// With `simulate_gpu` it hands out handles like a GPU backend would, which
/// exercises the manager's GPU accounting without a device.
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    simulate_gpu: bool,
    next_handle: u64,
    resident: HashMap<GpuHandle, TileKey>,
    frames: u64,
    last_frame: FrameStats,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Headless backend that issues GPU handles for uploaded tiles.
    pub fn with_simulated_gpu() -> Self {
        Self {
            simulate_gpu: true,
            ..Self::default()
        }
    }

    /// Tiles currently holding a simulated GPU copy.
    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn last_frame(&self) -> FrameStats {
        self.last_frame
    }
}

impl RenderBackend for HeadlessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Headless
    }

    fn upload_tile(&mut self, tile: &Tile) -> Option<GpuHandle> {
        if !self.simulate_gpu {
            return None;
        }
        self.next_handle += 1;
        let handle = GpuHandle(self.next_handle);
        self.resident.insert(handle, tile.key);
        Some(handle)
    }

    fn release_tile(&mut self, handle: GpuHandle) {
        self.resident.remove(&handle);
    }

    fn render_tiles(&mut self, tiles: &[Tile], _view: &ViewProjection) -> FrameStats {
        let finest = tiles.iter().map(|tile| tile.key.level).min().unwrap_or(0);
        let stats = FrameStats {
            tiles_drawn: tiles.len(),
            fallback_tiles: tiles.iter().filter(|tile| tile.key.level > finest).count(),
            uploads: 0,
            releases: 0,
        };
        self.frames += 1;
        self.last_frame = stats;
        stats
    }
}
