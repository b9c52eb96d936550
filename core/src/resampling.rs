//! Resampling strategies.
//!
//! Every strategy maps a weight vector of length N to N source indices in
//! `[0, N)`, with repetition. Weights need not be normalized; they are scaled by
//! their sum. A vector that places all mass on one particle collapses to N
//! copies of that index.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Selects how surviving particles are drawn from the weight vector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingStrategy {
    /// Direct multinomial sampling.
    Naive,
    Systematic,
    Stratified,
    /// Deterministic `floor(N w)` copies, then systematic draws over the residuals.
    #[default]
    Residual,
}

impl ResamplingStrategy {
    /// Draw `weights.len()` source indices.
    pub fn resample<R: Rng + ?Sized>(&self, weights: &[f64], rng: &mut R) -> Vec<usize> {
        let n = weights.len();
        match self {
            ResamplingStrategy::Naive => multinomial_resample(weights, n, rng),
            ResamplingStrategy::Systematic => systematic_resample(weights, n, rng),
            ResamplingStrategy::Stratified => stratified_resample(weights, n, rng),
            ResamplingStrategy::Residual => residual_resample(weights, n, rng),
        }
    }
}

/// Normalized cumulative sum. Falls back to uniform if the weights carry no mass.
fn cumulative(weights: &[f64]) -> Vec<f64> {
    let total: f64 = weights.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
    let n = weights.len();
    let mut acc = 0.0;
    let mut cumsum: Vec<f64> = weights
        .iter()
        .map(|&w| {
            let w = if total > 0.0 {
                if w.is_finite() && w > 0.0 { w / total } else { 0.0 }
            } else {
                1.0 / n as f64
            };
            acc += w;
            acc
        })
        .collect();
    // Pin the tail so round-off can never select trailing zero-weight entries.
    let last = if total > 0.0 {
        weights.iter().rposition(|w| w.is_finite() && *w > 0.0)
    } else {
        n.checked_sub(1)
    };
    if let Some(last) = last {
        cumsum[last..].iter_mut().for_each(|c| *c = 1.0);
    }
    cumsum
}

/// First index whose cumulative weight strictly exceeds `u`.
#[inline]
fn search(cumsum: &[f64], u: f64) -> usize {
    cumsum
        .partition_point(|&c| c <= u)
        .min(cumsum.len().saturating_sub(1))
}

/// Draw from `positions` (sorted, in `[0, 1)`) against the cumulative weights.
fn select_sorted(cumsum: &[f64], positions: impl Iterator<Item = f64>) -> Vec<usize> {
    let last = cumsum.len().saturating_sub(1);
    let mut out = Vec::with_capacity(cumsum.len());
    let mut j = 0;
    for u in positions {
        while j < last && cumsum[j] <= u {
            j += 1;
        }
        out.push(j);
    }
    out
}

/// Multinomial resampling: `n` independent draws.
pub fn multinomial_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    let cumsum = cumulative(weights);
    (0..n).map(|_| search(&cumsum, rng.random::<f64>())).collect()
}

/// Systematic resampling: a single offset, evenly spaced positions.
pub fn systematic_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() || n == 0 {
        return Vec::new();
    }
    let cumsum = cumulative(weights);
    let step = 1.0 / n as f64;
    let offset = rng.random::<f64>() * step;
    select_sorted(&cumsum, (0..n).map(|i| offset + i as f64 * step))
}

/// Stratified resampling: one independent draw per stratum.
pub fn stratified_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() || n == 0 {
        return Vec::new();
    }
    let cumsum = cumulative(weights);
    let step = 1.0 / n as f64;
    let positions: Vec<f64> = (0..n)
        .map(|i| (i as f64 + rng.random::<f64>()) * step)
        .collect();
    select_sorted(&cumsum, positions.into_iter())
}

/// Residual resampling.
pub fn residual_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    if weights.is_empty() || n == 0 {
        return Vec::new();
    }
    let total: f64 = weights.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
    if total <= 0.0 {
        return systematic_resample(weights, n, rng);
    }
    let scaled: Vec<f64> = weights
        .iter()
        .map(|&w| {
            if w.is_finite() && w > 0.0 {
                w / total * n as f64
            } else {
                0.0
            }
        })
        .collect();

    let mut indices = Vec::with_capacity(n);
    for (i, s) in scaled.iter().enumerate() {
        let copies = s.floor() as usize;
        for _ in 0..copies.min(n - indices.len()) {
            indices.push(i);
        }
    }
    let remaining = n - indices.len();
    if remaining > 0 {
        let residuals: Vec<f64> = scaled.iter().map(|s| s - s.floor()).collect();
        indices.extend(systematic_resample(&residuals, remaining, rng));
    }
    indices
}
