//! Pyramid geometry and level synthesis.
//!
//! - [`PyramidLevel`] / [`ImageRect`]: per-level tile grids and image-space
//!   footprints
//! - [`raster`]: compose and rescale helpers shared by synthesis strategies
//! - [`PyramidSynthesizer`]: serves coarse levels for sources tiled only at
//!   native resolution

mod level;
pub mod raster;
mod synth;

pub use level::{
    downsample_factor, level_count_for, level_dimension, ImageRect, PyramidLevel, MAX_LEVELS,
};
pub use synth::PyramidSynthesizer;
