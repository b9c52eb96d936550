//! Linear algebra helpers for noise models, map regression, and ping likelihoods.
//!
//! Public API:
//!     pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn spd_inverse(matrix: &DMatrix<f64>, opt: SolveOptions) -> Option<DMatrix<f64>>
//!     pub fn gaussian_log_likelihood(residual, variances) -> Result<f64, LikelihoodError>
//!     pub fn weight_from_log_likelihood(log_likelihood) -> Result<f64, LikelihoodError>
//!     pub fn evenly_spaced_indices(n: usize, k: usize) -> Vec<usize>
//!
//! Square-root strategy:
//! 1) Diagonal matrices take an element-wise square root (zeros stay zero)
//! 2) Symmetrize P ← 0.5 (P + Pᵀ), then Cholesky
//! 3) Symmetric EVD with eigenvalues clamped at zero → S = U * sqrt(Λ⁺) * Uᵀ

use std::f64::consts::PI;

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DVector};

use crate::error::LikelihoodError;

/// Compute a square root `S` such that `matrix ≈ S * Sᵀ`.
///
/// Positive semi-definite inputs are handled exactly, so an all-zero noise
/// covariance yields an all-zero square root and injects no noise.
///
/// # Panics
/// If `matrix` is not square.
pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    assert!(
        matrix.is_square(),
        "matrix_square_root: matrix must be square"
    );
    if let Some(s) = diagonal_sqrt(matrix) {
        return s;
    }
    let p = symmetrize(matrix);
    if let Some(ch) = Cholesky::new(p.clone()) {
        return ch.l().into_owned();
    }
    evd_symmetric_sqrt(&p)
}

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

fn diagonal_sqrt(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = m.nrows();
    for i in 0..n {
        for j in 0..n {
            if i != j && m[(i, j)] != 0.0 {
                return None;
            }
        }
    }
    let d = m.diagonal().map(|v| v.max(0.0).sqrt());
    Some(DMatrix::from_diagonal(&d))
}

fn evd_symmetric_sqrt(p: &DMatrix<f64>) -> DMatrix<f64> {
    let se = SymmetricEigen::new(p.clone());
    let sqrt_vals = se.eigenvalues.map(|l| l.max(0.0).sqrt());
    let u = se.eigenvectors;
    &u * DMatrix::from_diagonal(&sqrt_vals) * u.transpose()
}

#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    pub initial_jitter: f64,
    pub max_jitter: f64,
    pub max_tries: usize,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            initial_jitter: 1e-10,
            max_jitter: 1e-4,
            max_tries: 7,
        }
    }
}

/// Invert an SPD-ish matrix through Cholesky, retrying with a growing diagonal
/// jitter. Returns None if every attempt fails.
pub fn spd_inverse(matrix: &DMatrix<f64>, opt: SolveOptions) -> Option<DMatrix<f64>> {
    if !matrix.is_square() {
        return None;
    }
    let a = symmetrize(matrix);
    if let Some(ch) = Cholesky::new(a.clone()) {
        return Some(ch.inverse());
    }
    let scale = a.diagonal().amax().max(1.0);
    let mut jitter = opt.initial_jitter;
    for _ in 0..opt.max_tries {
        let mut aj = a.clone();
        for i in 0..aj.nrows() {
            aj[(i, i)] += jitter * scale;
        }
        if let Some(ch) = Cholesky::new(aj) {
            return Some(ch.inverse());
        }
        jitter *= 10.0;
        if jitter > opt.max_jitter {
            break;
        }
    }
    None
}

/// Log-density of `residual` under a zero-mean Gaussian with diagonal covariance.
///
/// `ln N = -0.5 * (rᵀ Σ⁻¹ r + d ln 2π + ln |Σ|)`
///
/// # Errors
/// * `DimensionMismatch` if the lengths differ
/// * `Singular` if any variance is zero, negative, or not finite
/// * `NonFinite` if the result overflows
pub fn gaussian_log_likelihood(
    residual: &DVector<f64>,
    variances: &DVector<f64>,
) -> Result<f64, LikelihoodError> {
    if residual.len() != variances.len() {
        return Err(LikelihoodError::DimensionMismatch {
            residual: residual.len(),
            covariance: variances.len(),
        });
    }
    if let Some(&bad) = variances.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
        return Err(LikelihoodError::Singular(bad));
    }
    let mahalanobis: f64 = residual
        .iter()
        .zip(variances.iter())
        .map(|(r, v)| r * r / v)
        .sum();
    let log_det: f64 = variances.iter().map(|v| v.ln()).sum();
    let d = residual.len() as f64;
    let ll = -0.5 * (mahalanobis + d * (2.0 * PI).ln() + log_det);
    if ll.is_finite() {
        Ok(ll)
    } else {
        Err(LikelihoodError::NonFinite)
    }
}

/// Particle weight from a ping log-likelihood: `|1 / ln L|`.
///
/// # Errors
/// `NonFinite` when the log-likelihood is exactly zero or not finite.
pub fn weight_from_log_likelihood(log_likelihood: f64) -> Result<f64, LikelihoodError> {
    if log_likelihood == 0.0 || !log_likelihood.is_finite() {
        return Err(LikelihoodError::NonFinite);
    }
    Ok((1.0 / log_likelihood).abs())
}

/// `round(linspace(0, n - 1, k))`, or every index when `k >= n`.
pub fn evenly_spaced_indices(n: usize, k: usize) -> Vec<usize> {
    if k >= n {
        return (0..n).collect();
    }
    match k {
        0 => Vec::new(),
        1 => vec![0],
        _ => {
            let step = (n - 1) as f64 / (k - 1) as f64;
            (0..k).map(|i| (i as f64 * step).round() as usize).collect()
        }
    }
}

/* =============================== Tests ==================================== */

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn max_abs_diff(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
        (a - b).amax()
    }

    #[test]
    fn t_symmetrize() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 3.0]);
        let s = symmetrize(&m);
        let expected = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 3.0]);
        assert!(max_abs_diff(&s, &expected) < 1e-15);
    }

    #[test]
    fn t_sqrt_diagonal_with_zeros() {
        let m = DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, 0.0, 0.25]));
        let s = matrix_square_root(&m);
        assert_approx_eq!(s[(0, 0)], 2.0, 1e-15);
        assert_eq!(s[(1, 1)], 0.0);
        assert_approx_eq!(s[(2, 2)], 0.5, 1e-15);
    }

    #[test]
    fn t_sqrt_full_spd() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 0.5, 0.0, 1.0, -1.0, 0.0, 0.0, 0.2]);
        let p = &a * a.transpose();
        let s = matrix_square_root(&p);
        assert!(max_abs_diff(&(&s * s.transpose()), &p) < 1e-12);
    }

    #[test]
    fn t_sqrt_psd_falls_back_to_evd() {
        // Rank-one, so Cholesky fails.
        let v = DMatrix::from_column_slice(2, 1, &[1.0, 1.0]);
        let p = &v * v.transpose();
        let s = matrix_square_root(&p);
        assert!(max_abs_diff(&(&s * s.transpose()), &p) < 1e-12);
    }

    #[test]
    #[should_panic]
    fn t_sqrt_non_square_panics() {
        let _ = matrix_square_root(&DMatrix::<f64>::zeros(3, 2));
    }

    #[test]
    fn t_spd_inverse() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let inv = spd_inverse(&a, SolveOptions::default()).expect("SPD matrix inverts");
        assert!(max_abs_diff(&(&a * inv), &DMatrix::identity(2, 2)) < 1e-12);
    }

    #[test]
    fn t_spd_inverse_singular_with_jitter() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        assert!(spd_inverse(&a, SolveOptions::default()).is_some());
        assert!(spd_inverse(&DMatrix::zeros(2, 3), SolveOptions::default()).is_none());
    }

    #[test]
    fn t_log_likelihood_standard_normal() {
        let r = DVector::from_vec(vec![0.0]);
        let v = DVector::from_vec(vec![1.0]);
        let ll = gaussian_log_likelihood(&r, &v).unwrap();
        assert_approx_eq!(ll, -0.5 * (2.0 * PI).ln(), 1e-12);
    }

    #[test]
    fn t_log_likelihood_errors() {
        let r = DVector::from_vec(vec![0.1, 0.2]);
        assert!(matches!(
            gaussian_log_likelihood(&r, &DVector::from_vec(vec![1.0])),
            Err(LikelihoodError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            gaussian_log_likelihood(&r, &DVector::from_vec(vec![1.0, 0.0])),
            Err(LikelihoodError::Singular(_))
        ));
        assert!(matches!(
            gaussian_log_likelihood(&r, &DVector::from_vec(vec![f64::NAN, 1.0])),
            Err(LikelihoodError::Singular(_))
        ));
    }

    #[test]
    fn t_evenly_spaced_indices() {
        assert_eq!(evenly_spaced_indices(512, 5), vec![0, 128, 256, 383, 511]);
        assert_eq!(evenly_spaced_indices(3, 5), vec![0, 1, 2]);
        assert_eq!(evenly_spaced_indices(10, 1), vec![0]);
        assert!(evenly_spaced_indices(10, 0).is_empty());
    }

    #[test]
    fn t_weight_prefers_smaller_magnitude() {
        let good = weight_from_log_likelihood(-2.0).unwrap();
        let bad = weight_from_log_likelihood(-20.0).unwrap();
        assert!(good > bad);
        assert_approx_eq!(good, 0.5, 1e-15);
        assert!(weight_from_log_likelihood(0.0).is_err());
    }
}
