//! Raster compositing helpers used by pyramid synthesis.
//!
//! Every raster is paired with the image-space rectangle it covers. Blitting
//! maps the overlap of two such rectangles from source pixels to destination
//! pixels, so the same routine serves both 2x2 composition of native tiles
//! and crop-and-scale from the overview raster.

use image::imageops::{self, FilterType};
use image::RgbaImage;

use super::level::ImageRect;

/// Resampling filter for downscaling. Triangle is cheap and avoids aliasing
/// at the 2x/4x factors the pyramid produces.
const RESAMPLE_FILTER: FilterType = FilterType::Triangle;

/// Allocate a transparent RGBA raster.
pub fn new_raster(width: u32, height: u32) -> RgbaImage {
    RgbaImage::new(width.max(1), height.max(1))
}

/// Map an image-space span `[start, end)` inside a rectangle of `extent`
/// image pixels onto a raster of `pixels` pixels.
fn map_span(start: u64, end: u64, origin: u32, extent: u32, pixels: u32) -> (f64, f64) {
    let ratio = pixels as f64 / extent.max(1) as f64;
    (
        (start - origin as u64) as f64 * ratio,
        (end - origin as u64) as f64 * ratio,
    )
}

/// Source span rounded outward so no contributing pixel is dropped.
fn outer_pixels(span: (f64, f64), limit: u32) -> (u32, u32) {
    let start = (span.0.floor().max(0.0) as u32).min(limit.saturating_sub(1));
    let end = (span.1.ceil() as u32).clamp(start + 1, limit.max(1));
    (start, end - start)
}

/// Destination span rounded to the nearest pixel edges, at least one pixel wide.
fn nearest_pixels(span: (f64, f64), limit: u32) -> (u32, u32) {
    let start = (span.0.round().max(0.0) as u32).min(limit.saturating_sub(1));
    let end = (span.1.round() as u32).clamp(start + 1, limit.max(1));
    (start, end - start)
}

/// Copy the part of `src` that overlaps `dst_rect` into `dst`, rescaling it
/// to the destination resolution.
///
/// `src_rect` and `dst_rect` are the image-space rectangles covered by the
/// whole of `src` and `dst` respectively. Returns `false` when the rectangles
/// do not overlap and nothing was drawn.
pub fn blit_scaled(
    dst: &mut RgbaImage,
    dst_rect: &ImageRect,
    src: &RgbaImage,
    src_rect: &ImageRect,
) -> bool {
    if src.width() == 0 || src.height() == 0 || dst.width() == 0 || dst.height() == 0 {
        return false;
    }

    let Some(overlap) = dst_rect.intersect(src_rect) else {
        return false;
    };

    let (sx, sw) = outer_pixels(
        map_span(
            overlap.x as u64,
            overlap.right(),
            src_rect.x,
            src_rect.width,
            src.width(),
        ),
        src.width(),
    );
    let (sy, sh) = outer_pixels(
        map_span(
            overlap.y as u64,
            overlap.bottom(),
            src_rect.y,
            src_rect.height,
            src.height(),
        ),
        src.height(),
    );
    let (dx, dw) = nearest_pixels(
        map_span(
            overlap.x as u64,
            overlap.right(),
            dst_rect.x,
            dst_rect.width,
            dst.width(),
        ),
        dst.width(),
    );
    let (dy, dh) = nearest_pixels(
        map_span(
            overlap.y as u64,
            overlap.bottom(),
            dst_rect.y,
            dst_rect.height,
            dst.height(),
        ),
        dst.height(),
    );

    let region = imageops::crop_imm(src, sx, sy, sw, sh).to_image();
    if region.dimensions() == (dw, dh) {
        imageops::replace(dst, &region, dx as i64, dy as i64);
    } else {
        let scaled = imageops::resize(&region, dw, dh, RESAMPLE_FILTER);
        imageops::replace(dst, &scaled, dx as i64, dy as i64);
    }

    true
}

// =============================================================================
// Tests
// =============================================================================
