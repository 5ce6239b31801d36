//! Rectangle-initialised GrabCut for soft focus.
//!
//! Pixels outside the target box are fixed background; everything inside is
//! "probably foreground". Each iteration fits a 5-component colour GMM to
//! each side, builds an 8-connected graph over the box interior (data term
//! from the GMMs, smoothness term from colour contrast) and takes a minimum
//! cut. The source side of the final cut is the subject's silhouette.

pub mod gmm;
pub mod maxflow;

use rayon::prelude::*;
use tracing::debug;

use crate::detection::BoundingBox;
use crate::video::RgbFrame;
use gmm::{kmeans_labels, Color, Gmm};
use maxflow::GraphBuilder;

/// Iterations used for live compositing.
pub const DEFAULT_ITERATIONS: usize = 1;
/// Smoothness weight between neighbouring pixels.
const GAMMA: f64 = 50.0;
/// Upper bound on samples fed to each GMM fit; larger sets are strided.
const MAX_GMM_SAMPLES: usize = 40_000;
/// Floor for likelihoods before taking `-ln`.
const MIN_LIKELIHOOD: f64 = 1e-300;

/// Per-pixel foreground mask covering a whole frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundMask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl ForegroundMask {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_foreground(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.bits[(y * self.width + x) as usize]
    }

    pub fn foreground_count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    /// Row-major mask, one entry per pixel.
    pub fn as_slice(&self) -> &[bool] {
        &self.bits
    }
}

/// Segment the subject inside `bbox`.
///
/// `None` when the clamped box is degenerate (needs at least 2 px of extent
/// in each axis), leaves no background to learn from, or the cut comes out
/// empty; callers fall back to the hard box.
pub fn segment_foreground(frame: &RgbFrame, bbox: BoundingBox, iterations: usize) -> Option<ForegroundMask> {
    let rect = bbox.clamp_to(frame.width, frame.height)?;
    if rect.x2 <= rect.x1 + 1 || rect.y2 <= rect.y1 + 1 || frame.is_empty() {
        return None;
    }
    let (w, h) = (frame.width as usize, frame.height as usize);
    let colors: Vec<Color> = frame
        .data
        .par_chunks_exact(3)
        .map(|p| Color::new(p[0] as f64, p[1] as f64, p[2] as f64))
        .collect();
    if colors.len() != w * h {
        return None;
    }

    let region = Region::new(rect);
    if region.len() == w * h {
        debug!("target box covers the frame; nothing to learn background from");
        return None;
    }

    let outside = w * h - region.len();
    let mut foreground: Vec<bool> = vec![true; region.len()];
    let mut models: Option<(Gmm, Gmm)> = None;
    let beta = contrast_beta(&colors, w, h);

    for _ in 0..iterations.max(1) {
        // Background: everything outside the box plus whatever the last cut
        // rejected inside it.
        let fixed = strided((0..w * h).filter(|&i| !region.contains_index(i, w)), outside);
        let rejected = (0..region.len()).filter(|&i| !foreground[i]).map(|i| region.frame_index(i, w));
        let bg_samples: Vec<Color> = fixed.chain(rejected).map(|i| colors[i]).collect();

        let kept = foreground.iter().filter(|&&f| f).count();
        let fg_samples: Vec<Color> = strided((0..region.len()).filter(|&i| foreground[i]), kept)
            .map(|i| colors[region.frame_index(i, w)])
            .collect();
        if fg_samples.is_empty() {
            return None;
        }

        let (fg_labels, bg_labels) = match &models {
            None => (kmeans_labels(&fg_samples), kmeans_labels(&bg_samples)),
            Some((fg, bg)) => (
                fg_samples.iter().map(|c| fg.most_likely_component(c)).collect(),
                bg_samples.iter().map(|c| bg.most_likely_component(c)).collect(),
            ),
        };
        let fg_model = Gmm::learn(&fg_samples, &fg_labels)?;
        let bg_model = Gmm::learn(&bg_samples, &bg_labels)?;

        foreground = cut(&colors, w, h, &region, &fg_model, &bg_model, beta);
        models = Some((fg_model, bg_model));
    }

    let mut bits = vec![false; w * h];
    let mut count = 0usize;
    for (i, &fg) in foreground.iter().enumerate() {
        if fg {
            bits[region.frame_index(i, w)] = true;
            count += 1;
        }
    }
    if count == 0 {
        debug!(bbox = ?rect, "segmentation produced an empty mask");
        return None;
    }
    Some(ForegroundMask {
        width: frame.width,
        height: frame.height,
        bits,
    })
}

/// The box interior, indexed row-major from its top-left corner.
struct Region {
    x1: usize,
    y1: usize,
    w: usize,
    h: usize,
}

impl Region {
    fn new(b: BoundingBox) -> Self {
        Self {
            x1: b.x1 as usize,
            y1: b.y1 as usize,
            w: b.width() as usize,
            h: b.height() as usize,
        }
    }

    fn len(&self) -> usize {
        self.w * self.h
    }

    fn contains(&self, x: usize, y: usize) -> bool {
        x >= self.x1 && x < self.x1 + self.w && y >= self.y1 && y < self.y1 + self.h
    }

    fn contains_index(&self, i: usize, frame_w: usize) -> bool {
        self.contains(i % frame_w, i / frame_w)
    }

    fn frame_index(&self, i: usize, frame_w: usize) -> usize {
        (self.y1 + i / self.w) * frame_w + self.x1 + i % self.w
    }

    fn local_index(&self, x: usize, y: usize) -> usize {
        (y - self.y1) * self.w + (x - self.x1)
    }
}

/// Every `n`-th item so that at most [`MAX_GMM_SAMPLES`] survive.
fn strided<I: Iterator<Item = usize>>(iter: I, len: usize) -> impl Iterator<Item = usize> {
    let step = len.div_ceil(MAX_GMM_SAMPLES).max(1);
    iter.step_by(step)
}

/// Half-neighbourhood used to visit each undirected pair once.
const BACKWARD: [(isize, isize); 4] = [(-1, 0), (-1, -1), (0, -1), (1, -1)];
const NEIGHBOURS: [(isize, isize); 8] = [(-1, 0), (-1, -1), (0, -1), (1, -1), (1, 0), (1, 1), (0, 1), (-1, 1)];

/// `1 / (2 · E[‖Δc‖²])` over all 8-connected pairs in the frame.
fn contrast_beta(colors: &[Color], w: usize, h: usize) -> f64 {
    let (sum, pairs) = (0..h)
        .into_par_iter()
        .map(|y| {
            let mut sum = 0.0;
            let mut pairs = 0usize;
            for x in 0..w {
                for (dx, dy) in BACKWARD {
                    let (nx, ny) = (x as isize + dx, y as isize + dy);
                    if nx < 0 || ny < 0 || nx >= w as isize {
                        continue;
                    }
                    let d = colors[y * w + x] - colors[ny as usize * w + nx as usize];
                    sum += d.norm_squared();
                    pairs += 1;
                }
            }
            (sum, pairs)
        })
        .reduce(|| (0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1));
    if pairs == 0 || sum <= 0.0 {
        0.0
    } else {
        1.0 / (2.0 * sum / pairs as f64)
    }
}

fn smoothness(a: &Color, b: &Color, beta: f64, diagonal: bool) -> f64 {
    let dist = if diagonal { std::f64::consts::SQRT_2 } else { 1.0 };
    GAMMA / dist * (-beta * (a - b).norm_squared()).exp()
}

/// Build the graph over the region and return the source (foreground) side
/// of its minimum cut.
fn cut(
    colors: &[Color],
    w: usize,
    h: usize,
    region: &Region,
    fg_model: &Gmm,
    bg_model: &Gmm,
    beta: f64,
) -> Vec<bool> {
    let n = region.len();
    let (source, sink) = (n, n + 1);

    // Terminal capacities per node: (from source, to sink).
    let mut terminals: Vec<(f64, f64)> = (0..n)
        .into_par_iter()
        .map(|i| {
            let c = &colors[region.frame_index(i, w)];
            let to_fg = -bg_model.likelihood(c).max(MIN_LIKELIHOOD).ln();
            let to_bg = -fg_model.likelihood(c).max(MIN_LIKELIHOOD).ln();
            (to_fg, to_bg)
        })
        .collect();

    let mut graph = GraphBuilder::with_capacity(n + 2, n * 5);
    for i in 0..n {
        let (x, y) = (region.x1 + i % region.w, region.y1 + i / region.w);
        let here = &colors[y * w + x];
        for (k, (dx, dy)) in NEIGHBOURS.into_iter().enumerate() {
            let (nx, ny) = (x as isize + dx, y as isize + dy);
            if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                continue;
            }
            let (nx, ny) = (nx as usize, ny as usize);
            let weight = smoothness(here, &colors[ny * w + nx], beta, dx != 0 && dy != 0);
            if region.contains(nx, ny) {
                // Inner pairs once, from the later pixel.
                if k < BACKWARD.len() {
                    graph.add_edge(i, region.local_index(nx, ny), weight, weight);
                }
            } else {
                // Neighbour is fixed background.
                terminals[i].1 += weight;
            }
        }
    }
    for (i, (mut from_source, mut to_sink)) in terminals.into_iter().enumerate() {
        let shared = from_source.min(to_sink);
        from_source -= shared;
        to_sink -= shared;
        if from_source > 0.0 {
            graph.add_edge(source, i, from_source, 0.0);
        }
        if to_sink > 0.0 {
            graph.add_edge(i, sink, to_sink, 0.0);
        }
    }

    let mut graph = graph.build();
    let flow = graph.max_flow(source, sink);
    let side = graph.source_side(source);
    debug!(nodes = n, flow, "segmentation cut");
    side.into_iter().take(n).collect()
}
