//! A single trajectory hypothesis together with its own terrain map.
//!
//! Each particle owns a 6-DOF pose in the map frame, the sonar poses at which
//! pings arrived since the last resampling, the beams those pings placed in the
//! map, and the per-beam (input, target, mean, variance) samples collected at
//! each measurement update. The map itself is an opaque [`MapModel`] that can be
//! refit on a background thread while the filter keeps running.

use std::fmt::{self, Debug, Display};
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Isometry3, Matrix6, Point3, Vector6};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::MapModelError;
use crate::geometry::{PoseVector, pose_to_isometry, quaternion_from_euler, wrap_to_pi};
use crate::linalg::{gaussian_log_likelihood, matrix_square_root, weight_from_log_likelihood};
use crate::map_model::{MapHyperparameters, MapModel};
use crate::messages::Twist;
use crate::transforms::SensorTransforms;

/// Unique particle / ancestry identifier.
pub type ParticleId = u64;

/// Weight assigned when a particle's map cannot be queried.
pub const MIN_WEIGHT: f64 = 1e-50;

/// Zero-mean Gaussian perturbation of a 6-DOF pose.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoseNoise {
    covariance: Matrix6<f64>,
    sqrt: Matrix6<f64>,
}

impl PoseNoise {
    pub fn new(covariance: Matrix6<f64>) -> Self {
        let s = matrix_square_root(&DMatrix::from_column_slice(6, 6, covariance.as_slice()));
        Self {
            covariance,
            sqrt: Matrix6::from_column_slice(s.as_slice()),
        }
    }

    pub fn from_diagonal(variances: &Vector6<f64>) -> Self {
        Self::new(Matrix6::from_diagonal(variances))
    }

    pub fn zero() -> Self {
        Self::new(Matrix6::zeros())
    }

    pub fn covariance(&self) -> &Matrix6<f64> {
        &self.covariance
    }

    pub fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Vector6<f64> {
        let z: Vector6<f64> = Vector6::from_fn(|_, _| StandardNormal.sample(rng));
        self.sqrt * z
    }
}

/// One beam scored against a particle's map during a measurement update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MapSample {
    pub x: f64,
    pub y: f64,
    /// Observed depth.
    pub target: f64,
    /// Map mean at `(x, y)`.
    pub mean: f64,
    /// Map variance at `(x, y)`.
    pub variance: f64,
}

/// Result of scoring one ping against a particle's map.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MeasurementOutcome {
    /// Likelihood evaluated normally.
    Weighted { weight: f64, log_likelihood: f64 },
    /// The map could not be queried, or its last retraining failed; weight
    /// set to [`MIN_WEIGHT`].
    MapUnavailable,
    /// No usable beams in the ping; weight set to zero.
    Missed,
    /// The likelihood was singular or overflowed; weight set to zero.
    Degenerate,
}

impl MeasurementOutcome {
    /// Counts toward the missed-measurement gate on resampling.
    pub fn is_missed(&self) -> bool {
        matches!(self, MeasurementOutcome::Missed | MeasurementOutcome::Degenerate)
    }
}

/// A trajectory hypothesis with its own map model `M`.
///
/// The dead-reckoning particle uses `M = ()` and never touches a map.
pub struct Particle<M> {
    id: ParticleId,
    parent_id: Option<ParticleId>,
    pub pose: PoseVector,
    pub weight: f64,
    pose_history: Vec<Isometry3<f64>>,
    observations: Vec<Point3<f64>>,
    training: Vec<MapSample>,
    trajectory: Vec<PoseVector>,
    map: M,
    pending_map: Option<JoinHandle<Result<M, MapModelError>>>,
    /// The last retraining failed; `map` is out of date.
    map_stale: bool,
    motion_noise: PoseNoise,
    mounting: SensorTransforms,
    rng: StdRng,
}

impl<M> Display for Particle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("id", &self.id)
            .field("x", &self.pose[0])
            .field("y", &self.pose[1])
            .field("z", &self.pose[2])
            .field("roll", &self.pose[3])
            .field("pitch", &self.pose[4])
            .field("yaw", &self.pose[5])
            .field("weight", &self.weight)
            .finish()
    }
}

impl<M> Debug for Particle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("pose", &self.pose.as_slice())
            .field("weight", &self.weight)
            .field("pings", &self.pose_history.len())
            .field("training_samples", &self.training.len())
            .field("training_in_flight", &self.pending_map.is_some())
            .finish()
    }
}

impl<M> Particle<M> {
    pub fn new(
        id: ParticleId,
        pose: PoseVector,
        map: M,
        motion_noise: PoseNoise,
        mounting: SensorTransforms,
        seed: u64,
    ) -> Self {
        Self {
            id,
            parent_id: None,
            pose,
            weight: 1.0,
            pose_history: Vec::new(),
            observations: Vec::new(),
            training: Vec::new(),
            trajectory: Vec::new(),
            map,
            pending_map: None,
            map_stale: false,
            motion_noise,
            mounting,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn id(&self) -> ParticleId {
        self.id
    }

    pub fn parent_id(&self) -> Option<ParticleId> {
        self.parent_id
    }

    pub(crate) fn set_lineage(&mut self, id: ParticleId, parent_id: Option<ParticleId>) {
        self.id = id;
        self.parent_id = parent_id;
    }

    /// Advance the pose by one odometry step.
    ///
    /// Angular rates are applied directly to roll, pitch, and yaw; the linear
    /// velocity is rotated into the map frame by the updated attitude. Process
    /// noise is drawn once per step. Non-positive or non-finite `dt` is a no-op.
    pub fn predict(&mut self, control: &Twist, dt: f64) {
        if !(dt.is_finite() && dt > 0.0) {
            return;
        }
        let noise = self.motion_noise.sample(&mut self.rng);
        let roll = wrap_to_pi(self.pose[3] + control.angular.x * dt + noise[3]);
        let pitch = wrap_to_pi(self.pose[4] + control.angular.y * dt + noise[4]);
        let yaw = wrap_to_pi(self.pose[5] + control.angular.z * dt + noise[5]);

        let step = quaternion_from_euler(roll, pitch, yaw) * (control.linear * dt)
            + noise.fixed_rows::<3>(0);
        self.pose[0] += step.x;
        self.pose[1] += step.y;
        self.pose[2] += step.z;
        self.pose[3] = roll;
        self.pose[4] = pitch;
        self.pose[5] = yaw;
    }

    /// Perturb the pose with a draw from `noise`.
    pub fn add_noise(&mut self, noise: &PoseNoise) {
        let delta = noise.sample(&mut self.rng);
        self.pose += delta;
        for i in 3..6 {
            self.pose[i] = wrap_to_pi(self.pose[i]);
        }
    }

    /// Sonar pose in the map frame at the current vehicle pose.
    pub fn sensor_pose(&self) -> Isometry3<f64> {
        self.mounting.sensor_in_map(&pose_to_isometry(&self.pose))
    }

    /// Append the current sonar pose to the ping-synchronized history.
    pub fn record_pose_history(&mut self) {
        let pose = self.sensor_pose();
        self.pose_history.push(pose);
    }

    /// Record the pose for an incoming ping and place its beams in the map.
    pub fn record_ping(&mut self, beams: &[Point3<f64>]) {
        self.record_pose_history();
        let sensor = self.sensor_pose();
        self.observations.extend(
            beams
                .iter()
                .map(|b| sensor.transform_point(b))
                .filter(|p| p.iter().all(|v| v.is_finite())),
        );
    }

    /// Clear the per-update map samples.
    pub fn reset_training_buffers(&mut self) {
        self.training.clear();
    }

    /// Start a fresh lineage segment after resampling.
    pub fn start_segment(&mut self) {
        self.pose_history.clear();
        self.observations.clear();
        self.trajectory.clear();
        self.reset_training_buffers();
    }

    pub fn pose_history(&self) -> &[Isometry3<f64>] {
        &self.pose_history
    }

    /// Beams placed in the map since the segment started.
    pub fn observations(&self) -> &[Point3<f64>] {
        &self.observations
    }

    pub fn training_buffers(&self) -> &[MapSample] {
        &self.training
    }

    /// Poses at each measurement update since the segment started.
    pub fn trajectory(&self) -> &[PoseVector] {
        &self.trajectory
    }
}

impl<M: MapModel> Particle<M> {
    pub fn map(&self) -> &M {
        &self.map
    }

    pub fn is_training(&self) -> bool {
        self.pending_map.is_some()
    }

    /// True while the map is the one left behind by a failed retraining.
    pub fn map_is_stale(&self) -> bool {
        self.map_stale
    }

    /// Refit the map on a background thread from `inputs` (n x 2) and `targets`.
    /// A job already in flight is joined first.
    pub fn begin_training(
        &mut self,
        inputs: DMatrix<f64>,
        targets: DVector<f64>,
        hyperparameters: MapHyperparameters,
    ) {
        self.sync_map();
        let base = self.map.clone();
        let spawned = thread::Builder::new()
            .name(format!("map-train-{}", self.id))
            .spawn(move || base.fit(&inputs, &targets, &hyperparameters));
        match spawned {
            Ok(handle) => self.pending_map = Some(handle),
            Err(e) => warn!("Particle {}: could not spawn training thread: {}", self.id, e),
        }
    }

    /// Join an in-flight training job and install its model.
    ///
    /// Returns true if a new model was installed. A failed job keeps the
    /// previous model but marks it stale, and the particle scores the floor
    /// weight until a later retraining succeeds.
    pub fn sync_map(&mut self) -> bool {
        let Some(handle) = self.pending_map.take() else {
            return false;
        };
        let error = match handle.join() {
            Ok(Ok(model)) => {
                self.map = model;
                self.map_stale = false;
                return true;
            }
            Ok(Err(e)) => e,
            Err(_) => MapModelError::Worker,
        };
        warn!("Particle {}: map training failed: {}", self.id, error);
        self.map_stale = true;
        false
    }

    /// Take over the pose and map of another particle (the resampling source),
    /// including whether that map is stale.
    pub fn inherit(&mut self, pose: PoseVector, map: M, map_stale: bool) {
        self.sync_map();
        self.pose = pose;
        self.map = map;
        self.map_stale = map_stale;
    }

    /// Training set from ancestor observations plus this segment's beams.
    pub fn training_set(&self, ancestry: &[Point3<f64>]) -> (DMatrix<f64>, DVector<f64>) {
        let points: Vec<&Point3<f64>> = ancestry.iter().chain(self.observations.iter()).collect();
        let inputs = DMatrix::from_fn(points.len(), 2, |i, j| points[i][j]);
        let targets = DVector::from_fn(points.len(), |i, _| points[i].z);
        (inputs, targets)
    }

    /// Score `beams` (sonar frame) against this particle's map.
    ///
    /// The beams are placed with the sonar pose recorded for the latest ping.
    /// Waits for any in-flight training first, so a freshly retrained model is
    /// always the one sampled.
    pub fn measurement_update(
        &mut self,
        beams: &[Point3<f64>],
        measurement_variance: f64,
    ) -> MeasurementOutcome {
        self.sync_map();
        self.trajectory.push(self.pose);

        let sensor = self
            .pose_history
            .last()
            .copied()
            .unwrap_or_else(|| self.sensor_pose());
        let placed: Vec<Point3<f64>> = beams
            .iter()
            .map(|b| sensor.transform_point(b))
            .filter(|p| p.iter().all(|v| v.is_finite()))
            .collect();
        if placed.is_empty() {
            self.weight = 0.0;
            return MeasurementOutcome::Missed;
        }

        if self.map_stale {
            debug!("Particle {}: map retraining failed; using floor weight", self.id);
            self.weight = MIN_WEIGHT;
            return MeasurementOutcome::MapUnavailable;
        }

        let inputs = DMatrix::from_fn(placed.len(), 2, |i, j| placed[i][j]);
        let observed = DVector::from_fn(placed.len(), |i, _| placed[i].z);
        let prediction = match self.map.predict(&inputs) {
            Ok(p) => p,
            Err(e) => {
                debug!("Particle {}: map query failed: {}", self.id, e);
                self.weight = MIN_WEIGHT;
                return MeasurementOutcome::MapUnavailable;
            }
        };

        self.training
            .extend(placed.iter().enumerate().map(|(i, p)| MapSample {
                x: p.x,
                y: p.y,
                target: p.z,
                mean: prediction.mean[i],
                variance: prediction.variance[i],
            }));

        let residual = &prediction.mean - &observed;
        let variances = prediction.variance.add_scalar(measurement_variance);
        match gaussian_log_likelihood(&residual, &variances).and_then(|ll| {
            weight_from_log_likelihood(ll).map(|w| (w, ll))
        }) {
            Ok((weight, log_likelihood)) => {
                self.weight = weight;
                MeasurementOutcome::Weighted {
                    weight,
                    log_likelihood,
                }
            }
            Err(e) => {
                warn!("Particle {}: likelihood failed: {}", self.id, e);
                self.weight = 0.0;
                MeasurementOutcome::Degenerate
            }
        }
    }
}
