//! Rao-Blackwellized particle filter for multibeam bathymetric SLAM.
//!
//! Particles carry vehicle pose hypotheses; each one owns an independent
//! terrain map. Odometry drives the predict step. A fresh ping is scored
//! against every particle's map on the next odometry sample, after which the
//! filtered effective sample size decides whether to resample. Resampling
//! forks the ancestry tree, copies pose and map from survivors into lost
//! particles, and jitters everyone to keep the cloud diverse.
//!
//! Maps are refit on background threads once enough pings have accumulated.
//! A particle joins its own training job before its next measurement update.

use std::collections::VecDeque;
use std::path::Path;

use log::{debug, error, info, trace, warn};
use nalgebra::{Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::ancestry::AncestryTree;
use crate::archive::{ArchiveSummary, TrajectoryArchive};
use crate::config::RbpfConfig;
use crate::error::{ArchiveError, ConfigError, MapModelError, ResampleError};
use crate::geometry::{PoseVector, circular_mean, weighted_circular_mean, wrap_to_pi};
use crate::map_model::MapModel;
use crate::messages::{Odometry, Ping, Twist};
use crate::particle::{MeasurementOutcome, Particle, ParticleId, PoseNoise};
use crate::transforms::SensorTransforms;

/// Length of the effective sample size moving average.
pub const ESS_WINDOW: usize = 3;

/// Added to every weight before normalization.
const WEIGHT_FLOOR: f64 = 1e-200;

/// Id of the dead-reckoning particle, which never enters the ancestry tree.
const DEAD_RECKONING_ID: ParticleId = ParticleId::MAX;

/// How the published pose is derived from the particle cloud.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PoseAveraging {
    /// Plain mean of all particles.
    #[default]
    Unweighted,
    /// Weight-averaged mean.
    Weighted,
    /// Pose of the heaviest particle.
    HighestWeight,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterState {
    Idle,
    Predicting,
    AwaitingMeasurement,
    Updating,
    Resampling,
    Finished,
}

/// Moving average of the effective sample size over a fixed window.
#[derive(Clone, Debug)]
pub struct EssFilter {
    window: VecDeque<f64>,
    filtered: f64,
}

impl EssFilter {
    /// Window of `len` entries, all set to `initial`.
    pub fn new(initial: f64, len: usize) -> Self {
        let len = len.max(1);
        Self {
            window: std::iter::repeat_n(initial, len).collect(),
            filtered: initial,
        }
    }

    pub fn push(&mut self, ess: f64) -> f64 {
        self.window.pop_front();
        self.window.push_back(ess);
        self.filtered = self.window.iter().sum::<f64>() / self.window.len() as f64;
        self.filtered
    }

    pub fn filtered(&self) -> f64 {
        self.filtered
    }
}

/// Why a resampling decision did not resample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Filtered ESS at or above half the particle count.
    AboveThreshold,
    /// More than half the particles missed the ping.
    TooManyMissed,
    /// Every weight was zero.
    DegenerateWeights,
}

/// Result of one resampling decision.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResampleOutcome {
    pub ess: f64,
    pub filtered_ess: f64,
    pub missed: usize,
    pub skipped: Option<SkipReason>,
}

impl ResampleOutcome {
    pub fn resampled(&self) -> bool {
        self.skipped.is_none()
    }
}

/// Mean pose of the cloud and the spread of particle positions around it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoseEstimate {
    pub pose: PoseVector,
    pub covariance: Matrix3<f64>,
}

/// Column names for [`Diagnostics::to_array`].
pub const DIAGNOSTICS_HEADER: [&str; 17] = [
    "filtered_ess",
    "ess_threshold",
    "gt_x",
    "gt_y",
    "gt_z",
    "est_x",
    "est_y",
    "est_z",
    "dr_x",
    "dr_y",
    "dr_z",
    "cov_xx",
    "cov_xy",
    "cov_xz",
    "cov_yy",
    "cov_yz",
    "cov_zz",
];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Diagnostics {
    pub filtered_ess: f64,
    pub threshold: f64,
    pub ground_truth: Vector3<f64>,
    pub estimate: Vector3<f64>,
    pub dead_reckoning: Vector3<f64>,
    pub covariance: Matrix3<f64>,
}

impl Diagnostics {
    pub fn to_array(&self) -> [f64; 17] {
        let c = &self.covariance;
        [
            self.filtered_ess,
            self.threshold,
            self.ground_truth.x,
            self.ground_truth.y,
            self.ground_truth.z,
            self.estimate.x,
            self.estimate.y,
            self.estimate.z,
            self.dead_reckoning.x,
            self.dead_reckoning.y,
            self.dead_reckoning.z,
            c[(0, 0)],
            c[(0, 1)],
            c[(0, 2)],
            c[(1, 1)],
            c[(1, 2)],
            c[(2, 2)],
        ]
    }
}

/// Everything published after a measurement cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterOutput {
    /// Stamp of the odometry sample that triggered the cycle.
    pub stamp: f64,
    pub poses: Vec<PoseVector>,
    pub estimate: PoseEstimate,
    pub ess: f64,
    pub filtered_ess: f64,
    pub resampled: bool,
    pub missed: usize,
    /// Sensor transforms fell back to identity; positions are unreliable.
    pub degraded: bool,
    pub diagnostics: Diagnostics,
}

fn position(pose: &PoseVector) -> Vector3<f64> {
    Vector3::new(pose[0], pose[1], pose[2])
}

/// Split resampled `indices` into lost particles and the sources they are
/// cloned from. The first occurrence of an index keeps that particle; every
/// further occurrence overwrites the next lost one.
fn partition(indices: &[usize], n: usize) -> (Vec<usize>, Vec<usize>) {
    let mut chosen = vec![false; n];
    let mut dupes = Vec::new();
    for &i in indices {
        if chosen[i] {
            dupes.push(i);
        } else {
            chosen[i] = true;
        }
    }
    let lost = (0..n).filter(|&i| !chosen[i]).collect();
    (lost, dupes)
}

/// The filter: particle set, dead-reckoning reference, ancestry, and ESS window.
pub struct RbpfSlam<M: MapModel> {
    config: RbpfConfig,
    particles: Vec<Particle<M>>,
    dead_reckoning: Particle<()>,
    tree: AncestryTree,
    ess: EssFilter,
    transforms: SensorTransforms,
    resampling_noise: PoseNoise,
    rng: StdRng,
    last_odom_stamp: Option<f64>,
    pending_ping: Option<Ping>,
    last_processed_ping: Option<f64>,
    pings_since_training: usize,
    trainings: usize,
    state: FilterState,
}

impl<M: MapModel> RbpfSlam<M> {
    /// Spread `config.particle_count` particles around `initial_pose` using
    /// the initial covariance. Every particle starts from a copy of `prior_map`.
    pub fn new(
        config: RbpfConfig,
        transforms: SensorTransforms,
        prior_map: M,
        initial_pose: PoseVector,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut tree = AncestryTree::new();

        let init_noise = PoseNoise::new(*config.init_covariance.matrix());
        let motion_noise = PoseNoise::new(*config.motion_covariance.matrix());
        let weight = 1.0 / config.particle_count as f64;
        let mut particles = Vec::with_capacity(config.particle_count);
        for _ in 0..config.particle_count {
            let mut pose = initial_pose + init_noise.sample(&mut rng);
            for i in 3..6 {
                pose[i] = wrap_to_pi(pose[i]);
            }
            let mut p = Particle::new(
                tree.allocate_id(),
                pose,
                prior_map.clone(),
                motion_noise,
                transforms,
                rng.random(),
            );
            p.weight = weight;
            particles.push(p);
        }
        let dead_reckoning = Particle::new(
            DEAD_RECKONING_ID,
            initial_pose,
            (),
            PoseNoise::zero(),
            transforms,
            rng.random(),
        );
        if transforms.degraded {
            warn!("Filter starting with degraded sensor transforms");
        }
        info!(
            "RBPF initialized: {} particles, {:?} resampling, retrain after {} pings",
            config.particle_count, config.resampling_strategy, config.retrain_after_pings
        );

        Ok(Self {
            ess: EssFilter::new(config.particle_count as f64, ESS_WINDOW),
            resampling_noise: PoseNoise::new(*config.resampling_noise_covariance.matrix()),
            config,
            particles,
            dead_reckoning,
            tree,
            transforms,
            rng,
            last_odom_stamp: None,
            pending_ping: None,
            last_processed_ping: None,
            pings_since_training: 0,
            trainings: 0,
            state: FilterState::Idle,
        })
    }

    pub fn config(&self) -> &RbpfConfig {
        &self.config
    }

    pub fn particles(&self) -> &[Particle<M>] {
        &self.particles
    }

    pub fn dead_reckoning(&self) -> &Particle<()> {
        &self.dead_reckoning
    }

    pub fn ancestry(&self) -> &AncestryTree {
        &self.tree
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    pub fn filtered_ess(&self) -> f64 {
        self.ess.filtered()
    }

    pub fn transforms(&self) -> &SensorTransforms {
        &self.transforms
    }

    pub fn pings_since_training(&self) -> usize {
        self.pings_since_training
    }

    /// Retraining rounds started so far.
    pub fn trainings(&self) -> usize {
        self.trainings
    }

    /// Process an odometry sample.
    ///
    /// Samples with a non-finite stamp or not newer than the previous one are
    /// ignored. Otherwise every
    /// particle is predicted forward; if a ping arrived since the last update
    /// the full update/resample/publish cycle runs and its output is returned.
    pub fn handle_odometry(&mut self, odom: &Odometry) -> Option<FilterOutput> {
        if self.state == FilterState::Finished {
            trace!("Survey finished; dropping odometry at {:.3}", odom.stamp);
            return None;
        }
        if !odom.stamp.is_finite() {
            warn!("Ignoring odometry with non-finite stamp {}", odom.stamp);
            return None;
        }
        let Some(last) = self.last_odom_stamp else {
            self.last_odom_stamp = Some(odom.stamp);
            self.state = FilterState::AwaitingMeasurement;
            return None;
        };
        if odom.stamp <= last {
            debug!(
                "Ignoring odometry at {:.3}: not newer than {:.3}",
                odom.stamp, last
            );
            return None;
        }
        self.last_odom_stamp = Some(odom.stamp);
        self.predict(&odom.twist, odom.stamp - last);

        let Some(ping) = self.pending_ping.take() else {
            self.state = FilterState::AwaitingMeasurement;
            return None;
        };
        let missed = self.update(&ping);
        self.last_processed_ping = Some(ping.stamp);

        let weights: Vec<f64> = self
            .particles
            .iter()
            .map(|p| p.weight + WEIGHT_FLOOR)
            .collect();
        let outcome = match self.resample(&weights, missed) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Resampling at {:.3} failed: {}", odom.stamp, e);
                return None;
            }
        };
        Some(self.publish(odom, &outcome))
    }

    /// Store a ping for the next update.
    ///
    /// The ping is subsampled to the configured beam count and every particle
    /// records its sonar pose and places the beams in its map frame. Once more
    /// than `retrain_after_pings` pings have arrived since the last round,
    /// every particle's map starts retraining in the background.
    pub fn handle_ping(&mut self, ping: &Ping) {
        if self.state == FilterState::Finished {
            trace!("Survey finished; dropping ping at {:.3}", ping.stamp);
            return;
        }
        if !ping.stamp.is_finite() {
            warn!("Ignoring ping with non-finite stamp {}", ping.stamp);
            return;
        }
        if let Some(last) = self.last_processed_ping
            && ping.stamp <= last
        {
            debug!("Ignoring ping at {:.3}: already processed {:.3}", ping.stamp, last);
            return;
        }
        let ping = ping.subsample(self.config.beams_simulated);
        self.particles
            .par_iter_mut()
            .for_each(|p| p.record_ping(&ping.beams));
        self.pending_ping = Some(ping);

        self.pings_since_training += 1;
        if self.pings_since_training > self.config.retrain_after_pings {
            self.retrain_maps();
        }
    }

    fn retrain_maps(&mut self) {
        info!(
            "Retraining {} particle maps after {} pings",
            self.particles.len(),
            self.pings_since_training
        );
        for p in self.particles.iter_mut() {
            let ancestry = self.tree.reconstruct_observations(p.id());
            let (inputs, targets) = p.training_set(&ancestry);
            if inputs.nrows() == 0 {
                debug!("Particle {}: nothing to train on", p.id());
                continue;
            }
            p.begin_training(inputs, targets, self.config.map.clone());
        }
        self.trainings += 1;
        self.pings_since_training = 0;
    }

    fn predict(&mut self, twist: &Twist, dt: f64) {
        self.state = FilterState::Predicting;
        self.particles
            .par_iter_mut()
            .for_each(|p| p.predict(twist, dt));
        self.dead_reckoning.predict(twist, dt);
    }

    /// Score the ping against every particle. Returns the missed count.
    fn update(&mut self, ping: &Ping) -> usize {
        self.state = FilterState::Updating;
        let variance = self.config.measurement_std.powi(2);
        let outcomes: Vec<MeasurementOutcome> = self
            .particles
            .par_iter_mut()
            .map(|p| p.measurement_update(&ping.beams, variance))
            .collect();

        let missed = outcomes.iter().filter(|o| o.is_missed()).count();
        let unavailable = outcomes
            .iter()
            .filter(|o| matches!(o, MeasurementOutcome::MapUnavailable))
            .count();
        debug!(
            "Ping {:.3}: {} beams, {} missed, {} without a map",
            ping.stamp,
            ping.len(),
            missed,
            unavailable
        );
        missed
    }

    /// Decide on and, if warranted, perform resampling.
    ///
    /// `weights` are normalized here. The ESS enters the moving-average window
    /// even when the cycle is skipped. Resampling runs only if the filtered ESS
    /// is below half the particle count and no more than half the particles
    /// missed the measurement.
    ///
    /// Fails without touching the filter if `weights` does not have one entry
    /// per particle.
    pub fn resample(
        &mut self,
        weights: &[f64],
        missed: usize,
    ) -> Result<ResampleOutcome, ResampleError> {
        let n = self.particles.len();
        if weights.len() != n {
            return Err(ResampleError::WeightCount {
                expected: n,
                actual: weights.len(),
            });
        }
        let total: f64 = weights.iter().sum();
        let normalized: Option<Vec<f64>> = (total > 0.0 && total.is_finite())
            .then(|| weights.iter().map(|w| w / total).collect());

        let ess = match &normalized {
            Some(w) => 1.0 / w.iter().map(|w| w * w).sum::<f64>(),
            None => {
                warn!("All particle weights are zero; skipping resampling");
                n as f64
            }
        };
        let filtered_ess = self.ess.push(ess);
        let threshold = self.config.ess_threshold();
        let mut outcome = ResampleOutcome {
            ess,
            filtered_ess,
            missed,
            skipped: None,
        };

        let Some(weights) = normalized else {
            outcome.skipped = Some(SkipReason::DegenerateWeights);
            return Ok(outcome);
        };
        if filtered_ess >= threshold {
            outcome.skipped = Some(SkipReason::AboveThreshold);
            return Ok(outcome);
        }
        if missed as f64 > threshold {
            info!(
                "Filtered ESS {:.2} below {:.2} but {} particles missed; not resampling",
                filtered_ess, threshold, missed
            );
            outcome.skipped = Some(SkipReason::TooManyMissed);
            return Ok(outcome);
        }

        self.state = FilterState::Resampling;
        info!(
            "Resampling: filtered ESS {:.2} < {:.2}, {} missed",
            filtered_ess, threshold, missed
        );
        let indices = self
            .config
            .resampling_strategy
            .resample(&weights, &mut self.rng);
        let (lost, sources) = partition(&indices, n);

        // Clones must copy the latest model of their source.
        for p in self.particles.iter_mut() {
            p.sync_map();
        }
        let new_ids = self
            .tree
            .record_generation(&mut self.particles, &lost, &sources)?;
        trace!("New lineage ids: {new_ids:?}");

        for (&l, &s) in lost.iter().zip(&sources) {
            let source = &self.particles[s];
            let (pose, map, stale) = (source.pose, source.map().clone(), source.map_is_stale());
            self.particles[l].inherit(pose, map, stale);
        }
        let uniform = 1.0 / n as f64;
        let noise = self.resampling_noise;
        for p in self.particles.iter_mut() {
            p.add_noise(&noise);
            p.start_segment();
            p.weight = uniform;
        }
        debug!("Replaced {} particles", lost.len());
        Ok(outcome)
    }

    /// Mean pose and position covariance of the cloud.
    pub fn average_pose(&self) -> PoseEstimate {
        let n = self.particles.len();
        let uniform = vec![1.0 / n as f64; n];
        let weights = match self.config.averaging_strategy {
            PoseAveraging::Weighted => {
                let total: f64 = self.particles.iter().map(|p| p.weight).sum();
                if total > 0.0 && total.is_finite() {
                    self.particles.iter().map(|p| p.weight / total).collect()
                } else {
                    uniform
                }
            }
            PoseAveraging::Unweighted | PoseAveraging::HighestWeight => uniform,
        };

        let pose = match self.config.averaging_strategy {
            PoseAveraging::HighestWeight => self
                .particles
                .iter()
                .max_by(|a, b| a.weight.total_cmp(&b.weight))
                .map(|p| p.pose)
                .unwrap_or_else(PoseVector::zeros),
            PoseAveraging::Unweighted => {
                let mut mean = PoseVector::zeros();
                for p in &self.particles {
                    mean += p.pose;
                }
                mean /= n as f64;
                for i in 3..6 {
                    mean[i] = circular_mean(self.particles.iter().map(|p| p.pose[i]));
                }
                mean
            }
            PoseAveraging::Weighted => {
                let mut mean = PoseVector::zeros();
                for (p, w) in self.particles.iter().zip(&weights) {
                    mean += p.pose * *w;
                }
                for i in 3..6 {
                    mean[i] = weighted_circular_mean(
                        self.particles.iter().zip(&weights).map(|(p, w)| (p.pose[i], *w)),
                    );
                }
                mean
            }
        };

        let center = position(&pose);
        let mut covariance = Matrix3::zeros();
        for (p, w) in self.particles.iter().zip(&weights) {
            let d = position(&p.pose) - center;
            covariance += (d * d.transpose()) * *w;
        }
        PoseEstimate { pose, covariance }
    }

    fn publish(&mut self, odom: &Odometry, outcome: &ResampleOutcome) -> FilterOutput {
        let estimate = self.average_pose();
        let diagnostics = Diagnostics {
            filtered_ess: outcome.filtered_ess,
            threshold: self.config.ess_threshold(),
            ground_truth: position(&odom.pose),
            estimate: position(&estimate.pose),
            dead_reckoning: position(&self.dead_reckoning.pose),
            covariance: estimate.covariance,
        };
        self.state = FilterState::AwaitingMeasurement;
        FilterOutput {
            stamp: odom.stamp,
            poses: self.particles.iter().map(|p| p.pose).collect(),
            estimate,
            ess: outcome.ess,
            filtered_ess: outcome.filtered_ess,
            resampled: outcome.resampled(),
            missed: outcome.missed,
            degraded: self.transforms.degraded,
            diagnostics,
        }
    }

    /// Stop processing sensor data. Training jobs in flight keep running.
    pub fn finish_survey(&mut self) {
        let in_flight = self.particles.iter().filter(|p| p.is_training()).count();
        info!("Survey finished; {in_flight} map trainings still in flight");
        self.state = FilterState::Finished;
    }

    /// Join every pending training job. Returns how many installed a new map.
    pub fn wait_for_training(&mut self) -> usize {
        self.particles
            .iter_mut()
            .map(|p| p.sync_map())
            .filter(|&installed| installed)
            .count()
    }

    /// Write every particle's reconstructed history under the storage path.
    pub fn save_trajectories(&self) -> Result<ArchiveSummary, ArchiveError> {
        TrajectoryArchive::new(&self.config.storage_path).write(&self.particles, &self.tree)
    }

    /// Persist the map of the particle in slot `index`.
    pub fn save_particle_map<P: AsRef<Path>>(
        &mut self,
        index: usize,
        path: P,
    ) -> Result<(), MapModelError> {
        let particle = self
            .particles
            .get_mut(index)
            .ok_or(MapModelError::UnknownParticle(index))?;
        particle.sync_map();
        particle.map().save(path.as_ref())
    }
}
