//! Per-particle probabilistic terrain maps.
//!
//! A [`MapModel`] regresses seabed depth `z` over horizontal position `(x, y)` and
//! reports a predictive mean and variance for each query point. The filter only
//! relies on the fit/predict/save/load contract, so any regression backend can
//! sit behind it. [`SparseGpMap`] is the default backend: a sparse Gaussian
//! process with a squared-exponential kernel and a grid of inducing points.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, MapModelError, QueryError, TrainingError};
use crate::linalg::{SolveOptions, evenly_spaced_indices, spd_inverse};

/// Predictive mean and variance at a set of query points.
#[derive(Clone, Debug, PartialEq)]
pub struct MapPrediction {
    pub mean: DVector<f64>,
    pub variance: DVector<f64>,
}

/// Regression hyperparameters handed to [`MapModel::fit`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapHyperparameters {
    /// Requested number of inducing points (rounded to a square grid).
    pub inducing_points: usize,
    /// Kernel length scale in meters.
    pub length_scale: f64,
    /// Kernel signal variance in m².
    pub signal_variance: f64,
    /// Observation noise variance in m².
    pub noise_variance: f64,
    /// Larger training sets are subsampled evenly to this size.
    pub max_training_points: usize,
}

impl Default for MapHyperparameters {
    fn default() -> Self {
        Self {
            inducing_points: 300,
            length_scale: 10.0,
            signal_variance: 1.0,
            noise_variance: 0.01,
            max_training_points: 2000,
        }
    }
}

impl MapHyperparameters {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |field: &'static str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid {
                    field,
                    reason: format!("must be positive and finite, got {v}"),
                })
            }
        };
        positive("map.length_scale", self.length_scale)?;
        positive("map.signal_variance", self.signal_variance)?;
        positive("map.noise_variance", self.noise_variance)?;
        if self.inducing_points == 0 {
            return Err(ConfigError::Invalid {
                field: "map.inducing_points",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_training_points == 0 {
            return Err(ConfigError::Invalid {
                field: "map.max_training_points",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Contract between the filter and a terrain regression backend.
///
/// Implementations are cloned into background training threads, so they must be
/// `Send + 'static`.
pub trait MapModel: Clone + Send + Sync + 'static {
    /// Fit a new model to `inputs` (n x 2, columns x and y) and `targets` (n).
    ///
    /// # Errors
    /// `TrainingError` when the inputs and targets disagree in length or the
    /// data cannot be fit.
    fn fit(
        &self,
        inputs: &DMatrix<f64>,
        targets: &DVector<f64>,
        hyperparameters: &MapHyperparameters,
    ) -> Result<Self, MapModelError>;

    /// Predict mean and variance at `inputs` (q x 2).
    ///
    /// # Errors
    /// `QueryError::NotFitted` if the model has never been fit.
    fn predict(&self, inputs: &DMatrix<f64>) -> Result<MapPrediction, MapModelError>;

    fn is_fitted(&self) -> bool;

    /// Persist the learned parameters.
    fn save(&self, path: &Path) -> Result<(), MapModelError>;

    /// Restore a model written by [`MapModel::save`].
    fn load(path: &Path) -> Result<Self, MapModelError>;
}

#[derive(Clone, Debug, PartialEq)]
struct FittedGp {
    hyperparameters: MapHyperparameters,
    mean_offset: f64,
    inducing: DMatrix<f64>,
    alpha: DVector<f64>,
    kmm_inv: DMatrix<f64>,
    sigma: DMatrix<f64>,
}

/// On-disk form of a fitted model. Matrices are stored column-major.
#[derive(Serialize, Deserialize)]
struct StoredGp {
    hyperparameters: MapHyperparameters,
    mean_offset: f64,
    inducing: Vec<f64>,
    alpha: Vec<f64>,
    kmm_inv: Vec<f64>,
    sigma: Vec<f64>,
}

/// Sparse Gaussian-process terrain map.
///
/// Uses the deterministic training conditional: the predictive mean is
/// `μ + K*m α` and the variance is `k** - K*m Kmm⁻¹ Km* + K*m Σ Km* + σ²`,
/// where `Σ = (Kmm + σ⁻² Kmn Knm)⁻¹`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SparseGpMap {
    fitted: Option<FittedGp>,
}

impl SparseGpMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of inducing points in the fitted model (0 before fitting).
    pub fn inducing_count(&self) -> usize {
        self.fitted.as_ref().map_or(0, |f| f.inducing.nrows())
    }
}

fn squared_exponential(a: &DMatrix<f64>, b: &DMatrix<f64>, hp: &MapHyperparameters) -> DMatrix<f64> {
    let inv_two_l2 = 1.0 / (2.0 * hp.length_scale * hp.length_scale);
    DMatrix::from_fn(a.nrows(), b.nrows(), |i, j| {
        let dx = a[(i, 0)] - b[(j, 0)];
        let dy = a[(i, 1)] - b[(j, 1)];
        hp.signal_variance * (-(dx * dx + dy * dy) * inv_two_l2).exp()
    })
}

fn axis_samples(min: f64, max: f64, count: usize) -> Vec<f64> {
    if count <= 1 || (max - min).abs() < 1e-9 {
        return vec![0.5 * (min + max)];
    }
    let step = (max - min) / (count - 1) as f64;
    (0..count).map(|i| min + i as f64 * step).collect()
}

/// Inducing points on a `sqrt(m) x sqrt(m)` grid spanning the input bounds.
fn inducing_grid(inputs: &DMatrix<f64>, requested: usize) -> DMatrix<f64> {
    let side = ((requested as f64).sqrt().round() as usize).max(1);
    let xs = inputs.column(0);
    let ys = inputs.column(1);
    let gx = axis_samples(xs.min(), xs.max(), side);
    let gy = axis_samples(ys.min(), ys.max(), side);
    let mut points = Vec::with_capacity(gx.len() * gy.len() * 2);
    for x in &gx {
        for y in &gy {
            points.push(*x);
            points.push(*y);
        }
    }
    DMatrix::from_row_slice(gx.len() * gy.len(), 2, &points)
}

impl MapModel for SparseGpMap {
    fn fit(
        &self,
        inputs: &DMatrix<f64>,
        targets: &DVector<f64>,
        hyperparameters: &MapHyperparameters,
    ) -> Result<Self, MapModelError> {
        if inputs.ncols() != 2 {
            return Err(TrainingError::Dimension(inputs.ncols()).into());
        }
        if inputs.nrows() != targets.len() {
            return Err(TrainingError::LengthMismatch {
                inputs: inputs.nrows(),
                targets: targets.len(),
            }
            .into());
        }
        if targets.is_empty() {
            return Err(TrainingError::Empty.into());
        }
        if inputs.iter().chain(targets.iter()).any(|v| !v.is_finite()) {
            return Err(TrainingError::NonFinite.into());
        }

        let keep = evenly_spaced_indices(targets.len(), hyperparameters.max_training_points);
        let x = inputs.select_rows(keep.iter());
        let y = targets.select_rows(keep.iter());

        let mean_offset = y.mean();
        let centered = y.add_scalar(-mean_offset);
        let noise = hyperparameters.noise_variance;

        let inducing = inducing_grid(&x, hyperparameters.inducing_points);
        let mut kmm = squared_exponential(&inducing, &inducing, hyperparameters);
        for i in 0..kmm.nrows() {
            kmm[(i, i)] += 1e-8 * hyperparameters.signal_variance;
        }
        let kmn = squared_exponential(&inducing, &x, hyperparameters);

        let a = &kmm + (&kmn * kmn.transpose()) / noise;
        let sigma = spd_inverse(&a, SolveOptions::default()).ok_or(TrainingError::Numerical)?;
        let kmm_inv = spd_inverse(&kmm, SolveOptions::default()).ok_or(TrainingError::Numerical)?;
        let alpha = &sigma * (&kmn * centered) / noise;

        Ok(Self {
            fitted: Some(FittedGp {
                hyperparameters: hyperparameters.clone(),
                mean_offset,
                inducing,
                alpha,
                kmm_inv,
                sigma,
            }),
        })
    }

    fn predict(&self, inputs: &DMatrix<f64>) -> Result<MapPrediction, MapModelError> {
        let gp = self.fitted.as_ref().ok_or(QueryError::NotFitted)?;
        if inputs.ncols() != 2 {
            return Err(QueryError::Dimension(inputs.ncols()).into());
        }
        let hp = &gp.hyperparameters;
        let ksm = squared_exponential(inputs, &gp.inducing, hp);
        let mean = (&ksm * &gp.alpha).add_scalar(gp.mean_offset);

        let q = &ksm * &gp.kmm_inv;
        let s = &ksm * &gp.sigma;
        let variance = DVector::from_fn(inputs.nrows(), |i, _| {
            let k = ksm.row(i);
            let v = hp.signal_variance - q.row(i).dot(&k) + s.row(i).dot(&k) + hp.noise_variance;
            v.max(hp.noise_variance)
        });
        Ok(MapPrediction { mean, variance })
    }

    fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    fn save(&self, path: &Path) -> Result<(), MapModelError> {
        let stored = self.fitted.as_ref().map(|gp| StoredGp {
            hyperparameters: gp.hyperparameters.clone(),
            mean_offset: gp.mean_offset,
            inducing: gp.inducing.as_slice().to_vec(),
            alpha: gp.alpha.as_slice().to_vec(),
            kmm_inv: gp.kmm_inv.as_slice().to_vec(),
            sigma: gp.sigma.as_slice().to_vec(),
        });
        let file = File::create(path).map_err(|source| MapModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &stored)?;
        writer.flush().map_err(|source| MapModelError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn load(path: &Path) -> Result<Self, MapModelError> {
        let file = File::open(path).map_err(|source| MapModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let stored: Option<StoredGp> = serde_json::from_reader(BufReader::new(file))?;
        let Some(stored) = stored else {
            return Ok(Self::default());
        };
        let m = stored.alpha.len();
        if stored.inducing.len() != 2 * m
            || stored.kmm_inv.len() != m * m
            || stored.sigma.len() != m * m
        {
            return Err(<serde_json::Error as serde::de::Error>::custom(format!(
                "inconsistent sparse GP dimensions for {m} inducing points"
            ))
            .into());
        }
        Ok(Self {
            fitted: Some(FittedGp {
                hyperparameters: stored.hyperparameters,
                mean_offset: stored.mean_offset,
                inducing: DMatrix::from_column_slice(m, 2, &stored.inducing),
                alpha: DVector::from_vec(stored.alpha),
                kmm_inv: DMatrix::from_column_slice(m, m, &stored.kmm_inv),
                sigma: DMatrix::from_column_slice(m, m, &stored.sigma),
            }),
        })
    }
}
