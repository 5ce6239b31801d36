//! Full-covariance RGB Gaussian mixtures for the colour data term.

use nalgebra::{Matrix3, Vector3};

pub type Color = Vector3<f64>;

/// Components per mixture.
pub const COMPONENTS: usize = 5;
/// Added to the covariance diagonal so flat-colour components stay invertible.
const VARIANCE_FLOOR: f64 = 0.01;
const KMEANS_ROUNDS: usize = 10;
/// `(2π)^{3/2}`
const NORM: f64 = 15.749_609_945_653_303;

#[derive(Debug, Clone)]
struct Component {
    weight: f64,
    mean: Color,
    inv_cov: Matrix3<f64>,
    /// `weight / ((2π)^{3/2} · sqrt(det Σ))`
    scale: f64,
}

impl Component {
    fn density(&self, c: &Color) -> f64 {
        if self.weight <= 0.0 {
            return 0.0;
        }
        let d = c - self.mean;
        let mahalanobis = (d.transpose() * self.inv_cov * d)[(0, 0)];
        self.scale * (-0.5 * mahalanobis).exp()
    }
}

#[derive(Debug, Clone)]
pub struct Gmm {
    components: Vec<Component>,
}

impl Gmm {
    /// Fit a mixture to `samples` given a component label per sample.
    /// `None` if no component ends up with samples.
    pub fn learn(samples: &[Color], labels: &[usize]) -> Option<Self> {
        let k = COMPONENTS;
        let mut count = [0usize; COMPONENTS];
        let mut sum = [Color::zeros(); COMPONENTS];
        let mut prod = [Matrix3::<f64>::zeros(); COMPONENTS];
        for (c, &l) in samples.iter().zip(labels) {
            count[l] += 1;
            sum[l] += c;
            prod[l] += c * c.transpose();
        }
        let total = samples.len() as f64;
        if total == 0.0 {
            return None;
        }

        let mut components = Vec::with_capacity(k);
        for i in 0..k {
            if count[i] == 0 {
                components.push(Component {
                    weight: 0.0,
                    mean: Color::zeros(),
                    inv_cov: Matrix3::identity(),
                    scale: 0.0,
                });
                continue;
            }
            let n = count[i] as f64;
            let mean = sum[i] / n;
            let cov = prod[i] / n - mean * mean.transpose() + Matrix3::identity() * VARIANCE_FLOOR;
            let det = cov.determinant();
            let inv_cov = cov.try_inverse()?;
            if !(det > 0.0 && det.is_finite()) {
                return None;
            }
            let weight = n / total;
            components.push(Component {
                weight,
                mean,
                inv_cov,
                scale: weight / (NORM * det.sqrt()),
            });
        }
        Some(Self { components })
    }

    /// Mixture density at `c`.
    pub fn likelihood(&self, c: &Color) -> f64 {
        self.components.iter().map(|comp| comp.density(c)).sum()
    }

    /// Component contributing most density at `c`.
    pub fn most_likely_component(&self, c: &Color) -> usize {
        let mut best = (0, f64::NEG_INFINITY);
        for (i, comp) in self.components.iter().enumerate() {
            let d = comp.density(c);
            if d > best.1 {
                best = (i, d);
            }
        }
        best.0
    }
}

/// Deterministic k-means labelling of `samples` into [`COMPONENTS`]
/// clusters, seeded from evenly spaced samples.
pub fn kmeans_labels(samples: &[Color]) -> Vec<usize> {
    let k = COMPONENTS;
    if samples.is_empty() {
        return Vec::new();
    }
    let mut centres: Vec<Color> = (0..k)
        .map(|i| samples[i * samples.len() / k])
        .collect();
    let mut labels = vec![0usize; samples.len()];

    for _ in 0..KMEANS_ROUNDS {
        let mut changed = false;
        for (c, label) in samples.iter().zip(labels.iter_mut()) {
            let nearest = nearest_centre(&centres, c);
            changed |= nearest != *label;
            *label = nearest;
        }

        let mut sum = vec![Color::zeros(); k];
        let mut count = vec![0usize; k];
        for (c, &l) in samples.iter().zip(&labels) {
            sum[l] += c;
            count[l] += 1;
        }
        for i in 0..k {
            if count[i] > 0 {
                centres[i] = sum[i] / count[i] as f64;
            }
        }
        if !changed {
            break;
        }
    }
    labels
}

fn nearest_centre(centres: &[Color], c: &Color) -> usize {
    let mut best = (0, f64::INFINITY);
    for (i, centre) in centres.iter().enumerate() {
        let d = (c - centre).norm_squared();
        if d < best.1 {
            best = (i, d);
        }
    }
    best.0
}
