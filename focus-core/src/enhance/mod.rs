//! enhance — low-light normalisation applied before detection and compositing
//!
//! Contrast-limited adaptive histogram equalisation on the luminance channel
//! (chroma untouched), followed by a small median filter to knock down the
//! noise CLAHE amplifies in dark regions. Pure functions, no state.

use image::RgbImage;
use rayon::prelude::*;

use crate::video::RgbFrame;

/// Histogram clip limit, as a multiple of the uniform bin height.
pub const CLIP_LIMIT: f32 = 2.0;
/// Tiles per axis.
pub const TILE_GRID: usize = 8;
/// Median filter radius used for denoising.
const DENOISE_RADIUS: u32 = 1;

/// Enhance a frame for low-light footage. Returns a new frame; `pts` is kept.
pub fn enhance_low_light(frame: &RgbFrame) -> RgbFrame {
    if frame.is_empty() {
        return frame.clone();
    }
    let w = frame.width as usize;
    let h = frame.height as usize;

    let (luma, chroma) = split_ycbcr(&frame.data);
    let equalized = clahe(&luma, w, h, TILE_GRID, CLIP_LIMIT);
    let merged = merge_ycbcr(&equalized, &chroma);

    let img = RgbImage::from_raw(frame.width, frame.height, merged)
        .unwrap_or_else(|| RgbImage::new(frame.width, frame.height));
    let denoised = imageproc::filter::median_filter(&img, DENOISE_RADIUS, DENOISE_RADIUS);
    RgbFrame::from_image(denoised, frame.pts)
}

// ── Colour space ─────────────────────────────────────────────────────────────

/// BT.601 full-range RGB → (Y plane, interleaved Cb/Cr).
fn split_ycbcr(rgb: &[u8]) -> (Vec<u8>, Vec<[f32; 2]>) {
    rgb.par_chunks_exact(3)
        .map(|px| {
            let (r, g, b) = (px[0] as f32, px[1] as f32, px[2] as f32);
            let y = 0.299 * r + 0.587 * g + 0.114 * b;
            let cb = -0.168_736 * r - 0.331_264 * g + 0.5 * b;
            let cr = 0.5 * r - 0.418_688 * g - 0.081_312 * b;
            (y.round().clamp(0.0, 255.0) as u8, [cb, cr])
        })
        .unzip()
}

fn merge_ycbcr(luma: &[u8], chroma: &[[f32; 2]]) -> Vec<u8> {
    luma.par_iter()
        .zip(chroma.par_iter())
        .flat_map_iter(|(&y, &[cb, cr])| {
            let y = y as f32;
            let r = y + 1.402 * cr;
            let g = y - 0.344_136 * cb - 0.714_136 * cr;
            let b = y + 1.772 * cb;
            [r, g, b].map(|v| v.round().clamp(0.0, 255.0) as u8)
        })
        .collect()
}

// ── CLAHE ────────────────────────────────────────────────────────────────────

/// CLAHE over a single 8-bit plane with a `grid × grid` tile layout; each
/// pixel bilinearly interpolates between the LUTs of its four nearest tile
/// centres.
pub fn clahe(plane: &[u8], w: usize, h: usize, grid: usize, clip_limit: f32) -> Vec<u8> {
    if w == 0 || h == 0 || grid == 0 || plane.len() != w * h {
        return plane.to_vec();
    }

    let cols = grid.min(w);
    let rows = grid.min(h);
    let tile_w = w.div_ceil(cols);
    let tile_h = h.div_ceil(rows);

    let luts: Vec<[u8; 256]> = (0..rows * cols)
        .into_par_iter()
        .map(|t| {
            let (tx, ty) = (t % cols, t / cols);
            let x0 = (tx * tile_w).min(w);
            let y0 = (ty * tile_h).min(h);
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for &v in &plane[y * w + x0..y * w + x1] {
                    hist[v as usize] += 1;
                }
            }
            let count = (x1 - x0) * (y1 - y0);
            if clip_limit > 0.0 {
                clip_histogram(&mut hist, count, clip_limit);
            }
            tile_lut(&hist, count)
        })
        .collect();

    // Neighbouring tile indices and the weight of the far one, per column.
    let axis = |pos: usize, tile: usize, n: usize| -> (usize, usize, f32) {
        let f = (pos as f32 + 0.5) / tile as f32 - 0.5;
        if f <= 0.0 {
            return (0, 0, 0.0);
        }
        let i0 = (f.floor() as usize).min(n - 1);
        let i1 = (i0 + 1).min(n - 1);
        let a = if i0 == i1 { 0.0 } else { f - i0 as f32 };
        (i0, i1, a)
    };
    let x_axis: Vec<(usize, usize, f32)> = (0..w).map(|x| axis(x, tile_w, cols)).collect();

    let mut out = vec![0u8; w * h];
    out.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        let (ty0, ty1, ay) = axis(y, tile_h, rows);
        for (x, dst) in row.iter_mut().enumerate() {
            let (tx0, tx1, ax) = x_axis[x];
            let v = plane[y * w + x] as usize;
            let top = luts[ty0 * cols + tx0][v] as f32 * (1.0 - ax)
                + luts[ty0 * cols + tx1][v] as f32 * ax;
            let bottom = luts[ty1 * cols + tx0][v] as f32 * (1.0 - ax)
                + luts[ty1 * cols + tx1][v] as f32 * ax;
            *dst = (top * (1.0 - ay) + bottom * ay).round().clamp(0.0, 255.0) as u8;
        }
    });
    out
}

/// Clip bins at `clip_limit × (count / 256)` and spread the excess evenly.
fn clip_histogram(hist: &mut [u32; 256], count: usize, clip_limit: f32) {
    let ceiling = ((count as f32 / 256.0) * clip_limit).ceil().max(1.0) as u32;
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > ceiling {
            excess += *bin - ceiling;
            *bin = ceiling;
        }
    }
    let per_bin = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += per_bin + u32::from(i < remainder);
    }
}

/// Equalisation LUT from a (clipped) tile histogram.
fn tile_lut(hist: &[u32; 256], count: usize) -> [u8; 256] {
    let mut lut = [0u8; 256];
    if count == 0 {
        return lut;
    }
    let scale = 255.0 / count as f32;
    let mut acc = 0u32;
    for (i, &bin) in hist.iter().enumerate() {
        acc += bin;
        lut[i] = (acc as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}
