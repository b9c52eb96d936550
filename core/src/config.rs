//! Filter configuration.
//!
//! Configuration is read from JSON, YAML, or TOML, chosen by file extension.
//! Every field has a default, so a file only needs to list what it changes.
//!
//! Noise covariances accept 6 numbers (a diagonal), 36 numbers (a full row-major
//! 6x6 matrix), or the same list written as a bracketed string, e.g.
//! `"[0.1, 0.1, 0.0, 0.0, 0.0, 0.01]"`. Ordering is `x, y, z, roll, pitch, yaw`.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use nalgebra::{Matrix6, Vector6};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::map_model::MapHyperparameters;
use crate::rbpf::PoseAveraging;
use crate::resampling::ResamplingStrategy;
use crate::transforms::{FrameConfig, StaticTransform};

/// A 6x6 pose noise covariance.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CovarianceSpec", into = "CovarianceSpec")]
pub struct NoiseCovariance(Matrix6<f64>);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum CovarianceSpec {
    Values(Vec<f64>),
    Text(String),
}

impl NoiseCovariance {
    pub fn diagonal(variances: [f64; 6]) -> Self {
        Self(Matrix6::from_diagonal(&Vector6::from(variances)))
    }

    pub fn zero() -> Self {
        Self(Matrix6::zeros())
    }

    pub fn matrix(&self) -> &Matrix6<f64> {
        &self.0
    }

    /// Build from 6 diagonal or 36 row-major values.
    pub fn from_values(values: &[f64]) -> Result<Self, ConfigError> {
        let malformed = |reason: String| ConfigError::Covariance {
            value: format!("{values:?}"),
            reason,
        };
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(malformed(format!("non-finite entry {bad}")));
        }
        let m = match values.len() {
            6 => Matrix6::from_diagonal(&Vector6::from_column_slice(values)),
            36 => Matrix6::from_row_slice(values),
            n => return Err(malformed(format!("expected 6 or 36 values, got {n}"))),
        };
        for i in 0..6 {
            if m[(i, i)] < 0.0 {
                return Err(malformed(format!("negative variance on diagonal {i}")));
            }
            for j in (i + 1)..6 {
                let (a, b) = (m[(i, j)], m[(j, i)]);
                if (a - b).abs() > 1e-9 * a.abs().max(b.abs()).max(1.0) {
                    return Err(malformed(format!("not symmetric at ({i}, {j})")));
                }
            }
        }
        Ok(Self(m))
    }

    /// Parse the bracketed list form, `"[a, b, ...]"`.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let malformed = |reason: String| ConfigError::Covariance {
            value: text.to_string(),
            reason,
        };
        let inner = text
            .trim()
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| malformed("expected a bracketed list".into()))?;
        let values = inner
            .split(',')
            .map(|tok| {
                tok.trim()
                    .parse::<f64>()
                    .map_err(|e| malformed(format!("`{}`: {e}", tok.trim())))
            })
            .collect::<Result<Vec<f64>, _>>()?;
        Self::from_values(&values)
    }

    fn is_diagonal(&self) -> bool {
        (0..6).all(|i| (0..6).all(|j| i == j || self.0[(i, j)] == 0.0))
    }
}

impl TryFrom<CovarianceSpec> for NoiseCovariance {
    type Error = ConfigError;

    fn try_from(spec: CovarianceSpec) -> Result<Self, Self::Error> {
        match spec {
            CovarianceSpec::Values(v) => Self::from_values(&v),
            CovarianceSpec::Text(s) => Self::parse(&s),
        }
    }
}

impl From<NoiseCovariance> for CovarianceSpec {
    fn from(c: NoiseCovariance) -> Self {
        if c.is_diagonal() {
            CovarianceSpec::Values(c.0.diagonal().iter().copied().collect())
        } else {
            CovarianceSpec::Values(c.0.transpose().iter().copied().collect())
        }
    }
}

/// Top-level filter configuration.
///
/// Scalar fields come first and nested tables last so the struct serializes
/// cleanly to TOML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RbpfConfig {
    /// Number of weighted particles (the dead-reckoning particle is extra).
    pub particle_count: usize,
    /// Beams kept from each ping after subsampling.
    #[serde(alias = "num_beams_sim")]
    pub beams_simulated: usize,
    /// Native beam count of the sonar, used for synthetic pings.
    #[serde(alias = "n_beams_mbes")]
    pub beams_real: usize,
    /// Fan opening angle in radians.
    #[serde(alias = "mbes_open_angle")]
    pub opening_angle: f64,
    /// Maximum slant range for synthetic beams, m.
    pub max_range: f64,
    /// Standard deviation of a single depth measurement, m.
    pub measurement_std: f64,
    pub motion_covariance: NoiseCovariance,
    pub init_covariance: NoiseCovariance,
    pub resampling_noise_covariance: NoiseCovariance,
    /// Retrain every particle's map once more than this many pings arrived
    /// since the last retraining.
    pub retrain_after_pings: usize,
    pub resampling_strategy: ResamplingStrategy,
    pub averaging_strategy: PoseAveraging,
    /// Root directory for the trajectory archive.
    pub storage_path: PathBuf,
    pub seed: u64,
    pub frames: FrameConfig,
    pub map: MapHyperparameters,
    pub static_transforms: Vec<StaticTransform>,
}

impl Default for RbpfConfig {
    fn default() -> Self {
        Self {
            particle_count: 10,
            beams_simulated: 20,
            beams_real: 512,
            opening_angle: 60.0_f64.to_radians(),
            max_range: 120.0,
            measurement_std: 0.01,
            motion_covariance: NoiseCovariance::diagonal([1e-4, 1e-4, 1e-6, 1e-7, 1e-7, 1e-6]),
            init_covariance: NoiseCovariance::diagonal([0.5, 0.5, 0.0, 0.0, 0.0, 1e-3]),
            resampling_noise_covariance: NoiseCovariance::diagonal([
                0.05, 0.05, 0.0, 0.0, 0.0, 1e-4,
            ]),
            retrain_after_pings: 100,
            resampling_strategy: ResamplingStrategy::default(),
            averaging_strategy: PoseAveraging::default(),
            storage_path: PathBuf::from("rbpf_output"),
            seed: 42,
            frames: FrameConfig::default(),
            map: MapHyperparameters::default(),
            static_transforms: default_static_transforms(&FrameConfig::default()),
        }
    }
}

/// Odom coincident with map, sonar at the vehicle origin looking down.
pub fn default_static_transforms(frames: &FrameConfig) -> Vec<StaticTransform> {
    vec![
        StaticTransform {
            parent: frames.map_frame.clone(),
            child: frames.odom_frame.clone(),
            translation: [0.0; 3],
            rotation_rpy: [0.0; 3],
        },
        StaticTransform {
            parent: frames.base_frame.clone(),
            child: frames.sensor_frame.clone(),
            translation: [0.0; 3],
            rotation_rpy: [std::f64::consts::PI, 0.0, 0.0],
        },
    ]
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl RbpfConfig {
    /// Reject values the filter cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.particle_count == 0 {
            return Err(invalid("particle_count", "must be at least 1"));
        }
        if self.beams_simulated == 0 {
            return Err(invalid("beams_simulated", "must be at least 1"));
        }
        if self.beams_real == 0 {
            return Err(invalid("beams_real", "must be at least 1"));
        }
        if !(self.measurement_std.is_finite() && self.measurement_std > 0.0) {
            return Err(invalid(
                "measurement_std",
                format!("must be positive, got {}", self.measurement_std),
            ));
        }
        if !(self.opening_angle.is_finite() && self.opening_angle > 0.0) {
            return Err(invalid(
                "opening_angle",
                format!("must be positive, got {}", self.opening_angle),
            ));
        }
        if !(self.max_range.is_finite() && self.max_range > 0.0) {
            return Err(invalid(
                "max_range",
                format!("must be positive, got {}", self.max_range),
            ));
        }
        self.map.validate()
    }

    /// Resampling threshold on the filtered effective sample size.
    pub fn ess_threshold(&self) -> f64 {
        self.particle_count as f64 / 2.0
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(|e| parse_error("json", e))
    }

    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(|e| parse_error("json", e))
    }

    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let s = serde_yaml::to_string(self).map_err(|e| parse_error("yaml", e))?;
        File::create(path)?.write_all(s.as_bytes())?;
        Ok(())
    }

    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(|e| parse_error("yaml", e))
    }

    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let s = toml::to_string(self).map_err(|e| parse_error("toml", e))?;
        File::create(path)?.write_all(s.as_bytes())?;
        Ok(())
    }

    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut s = String::new();
        File::open(path)?.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(|e| parse_error("toml", e))
    }

    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    /// Generic read: choose format by file extension, then validate.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let p = path.as_ref();
        let cfg = match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn extension(p: &Path) -> Option<String> {
    p.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn parse_error(format: &'static str, e: impl std::fmt::Display) -> ConfigError {
    ConfigError::Parse {
        format,
        message: e.to_string(),
    }
}
