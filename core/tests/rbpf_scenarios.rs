//! Scenario tests for the particle filter driven through its public interface
//!
//! These tests exercise the resampling gate and the message handling of [`RbpfSlam`] without a trained map, so
//! every particle scores the same floor weight and the outcome of each cycle is fully determined by the weights the
//! test hands to [`RbpfSlam::resample`] or by the ordering of the messages.
//!
//! ## Scenarios
//!
//! - Uniform weights never resample and leave the ancestry tree empty.
//! - A single surviving particle takes over the whole cloud once the filtered ESS drops below half the particle
//!   count, and its history stays reconstructable through the ancestry tree.
//! - A measurement that every particle missed never triggers resampling.
//! - Odometry with a zero or negative time step and pings that are not newer than the last processed one are
//!   ignored.
//! - Messages with a non-finite stamp are dropped without moving the filter clock.
use nalgebra::{Point3, Vector3};

use rbpf_slam::config::{NoiseCovariance, RbpfConfig};
use rbpf_slam::geometry::PoseVector;
use rbpf_slam::map_model::{MapHyperparameters, SparseGpMap};
use rbpf_slam::messages::{Odometry, Ping, Twist};
use rbpf_slam::rbpf::{FilterState, RbpfSlam, SkipReason};
use rbpf_slam::transforms::SensorTransforms;

use assert_approx_eq::assert_approx_eq;

const START: [f64; 6] = [10.0, -4.0, -5.0, 0.0, 0.0, 0.3];

fn config(particles: usize) -> RbpfConfig {
    RbpfConfig {
        particle_count: particles,
        init_covariance: NoiseCovariance::diagonal([0.2, 0.2, 0.0, 0.0, 0.0, 0.0]),
        motion_covariance: NoiseCovariance::zero(),
        resampling_noise_covariance: NoiseCovariance::zero(),
        map: MapHyperparameters {
            inducing_points: 9,
            ..MapHyperparameters::default()
        },
        seed: 7,
        ..RbpfConfig::default()
    }
}

fn filter(particles: usize) -> RbpfSlam<SparseGpMap> {
    RbpfSlam::new(
        config(particles),
        SensorTransforms::downward_sonar(),
        SparseGpMap::new(),
        PoseVector::from_row_slice(&START),
    )
    .unwrap()
}

/// Constant forward motion along the body x axis.
fn odometry(stamp: f64) -> Odometry {
    Odometry {
        stamp,
        pose: PoseVector::from_row_slice(&START),
        twist: Twist {
            linear: Vector3::new(1.0, 0.0, 0.0),
            angular: Vector3::zeros(),
        },
    }
}

fn ping(stamp: f64) -> Ping {
    Ping::new(
        stamp,
        (-5..=5)
            .map(|i| Point3::new(0.0, 2.0 * i as f64, 20.0))
            .collect(),
    )
}

fn weights_favoring(n: usize, survivor: usize) -> Vec<f64> {
    let mut w = vec![0.0; n];
    w[survivor] = 1.0;
    w
}

/// Feed `updates` ping/odometry pairs after an initial stamp-setting sample.
fn drive(slam: &mut RbpfSlam<SparseGpMap>, updates: usize) -> usize {
    slam.handle_odometry(&odometry(0.0));
    let mut published = 0;
    for k in 1..=updates {
        slam.handle_ping(&ping(k as f64 - 0.5));
        if slam.handle_odometry(&odometry(k as f64)).is_some() {
            published += 1;
        }
    }
    published
}

#[test]
fn untrained_maps_give_uniform_weights() {
    let mut slam = filter(8);
    assert_eq!(drive(&mut slam, 4), 4);
    let w0 = slam.particles()[0].weight;
    for p in slam.particles() {
        assert_approx_eq!(p.weight, w0, 1e-15);
    }
    assert!(slam.ancestry().is_empty());
    assert_approx_eq!(slam.filtered_ess(), 8.0, 1e-9);
    assert_eq!(slam.state(), FilterState::AwaitingMeasurement);
}

#[test]
fn uniform_weights_keep_every_particle() {
    let mut slam = filter(6);
    let ids: Vec<u64> = slam.particles().iter().map(|p| p.id()).collect();
    for _ in 0..5 {
        let outcome = slam.resample(&[1.0; 6], 0).unwrap();
        assert_eq!(outcome.skipped, Some(SkipReason::AboveThreshold));
        assert_approx_eq!(outcome.ess, 6.0, 1e-9);
    }
    let after: Vec<u64> = slam.particles().iter().map(|p| p.id()).collect();
    assert_eq!(ids, after);
    assert!(slam.ancestry().is_empty());
}

#[test]
fn single_survivor_takes_over_the_cloud() {
    let n = 8;
    let mut slam = filter(n);
    drive(&mut slam, 3);
    let survivor = 5;
    let survivor_id = slam.particles()[survivor].id();
    let survivor_pose = slam.particles()[survivor].pose;
    let survivor_track = slam.particles()[survivor].trajectory().to_vec();
    assert_eq!(survivor_track.len(), 3);

    // The moving average starts at N, so the first collapse only pulls it to (2N + 1) / 3.
    let first = slam.resample(&weights_favoring(n, survivor), 0).unwrap();
    assert!(!first.resampled());
    let second = slam.resample(&weights_favoring(n, survivor), 0).unwrap();
    assert!(second.resampled());
    assert_approx_eq!(second.filtered_ess, (n as f64 + 2.0) / 3.0, 1e-9);

    let tree = slam.ancestry();
    assert_eq!(tree.len(), 2 * n);
    for p in slam.particles() {
        assert_eq!(p.parent_id(), Some(survivor_id));
        assert_eq!(p.pose, survivor_pose);
        assert_approx_eq!(p.weight, 1.0 / n as f64, 1e-15);
        assert!(p.trajectory().is_empty());
        assert_eq!(tree.lineage(p.id()), vec![survivor_id, p.id()]);
        assert_eq!(tree.reconstruct_trajectory(p.id()), survivor_track);
    }
    let leaves = tree.leaves().count();
    // The n - 1 replaced lineages and the n new ids.
    assert_eq!(leaves, 2 * n - 1);
}

#[test]
fn resampled_cloud_keeps_following_odometry() {
    let n = 6;
    let mut slam = filter(n);
    drive(&mut slam, 2);
    slam.resample(&weights_favoring(n, 0), 0).unwrap();
    assert!(slam.resample(&weights_favoring(n, 0), 0).unwrap().resampled());
    let x = slam.particles()[0].pose[0];

    slam.handle_ping(&ping(2.5));
    let out = slam.handle_odometry(&odometry(3.0)).unwrap();
    for pose in &out.poses {
        assert_approx_eq!(pose[0], out.poses[0][0], 1e-12);
    }
    assert_approx_eq!(out.poses[0][0], x + START[5].cos(), 1e-9);
    assert_eq!(out.missed, 0);
}

#[test]
fn all_missed_measurements_never_resample() {
    let n = 10;
    let mut slam = filter(n);
    for _ in 0..4 {
        let outcome = slam.resample(&weights_favoring(n, 2), n).unwrap();
        assert!(!outcome.resampled());
    }
    let last = slam.resample(&weights_favoring(n, 2), n).unwrap();
    assert!(last.filtered_ess < slam.config().ess_threshold());
    assert_eq!(last.skipped, Some(SkipReason::TooManyMissed));
    assert!(slam.ancestry().is_empty());

    // Half missed is still allowed.
    let allowed = slam.resample(&weights_favoring(n, 2), n / 2).unwrap();
    assert!(allowed.resampled());
}

#[test]
fn zero_and_negative_time_steps_are_ignored() {
    let mut slam = filter(3);
    slam.handle_odometry(&odometry(1.0));
    let before: Vec<PoseVector> = slam.particles().iter().map(|p| p.pose).collect();

    slam.handle_ping(&ping(1.0));
    assert!(slam.handle_odometry(&odometry(1.0)).is_none());
    assert!(slam.handle_odometry(&odometry(0.5)).is_none());
    assert!(slam.handle_odometry(&odometry(f64::NAN)).is_none());
    let after: Vec<PoseVector> = slam.particles().iter().map(|p| p.pose).collect();
    assert_eq!(before, after);
    assert_approx_eq!(slam.dead_reckoning().pose[0], START[0], 1e-12);

    // The pending ping is still consumed by the next valid sample.
    assert!(slam.handle_odometry(&odometry(2.0)).is_some());
}

#[test]
fn non_finite_stamps_never_block_later_messages() {
    let mut slam = filter(3);
    assert!(slam.handle_odometry(&odometry(f64::INFINITY)).is_none());
    slam.handle_ping(&ping(f64::INFINITY));
    assert!(slam.particles()[0].pose_history().is_empty());

    // The first finite sample still sets the clock and later ones predict.
    assert!(slam.handle_odometry(&odometry(0.0)).is_none());
    assert!(slam.handle_odometry(&odometry(f64::NEG_INFINITY)).is_none());
    let x = slam.particles()[0].pose[0];
    slam.handle_ping(&ping(0.5));
    let out = slam.handle_odometry(&odometry(1.0)).unwrap();
    assert_approx_eq!(out.poses[0][0], x + START[5].cos(), 1e-9);
    assert_approx_eq!(slam.dead_reckoning().pose[0], START[0] + START[5].cos(), 1e-9);
}

#[test]
fn stale_pings_are_dropped() {
    let mut slam = filter(3);
    slam.handle_odometry(&odometry(0.0));
    slam.handle_ping(&ping(0.5));
    assert!(slam.handle_odometry(&odometry(1.0)).is_some());

    let recorded = slam.particles()[0].pose_history().len();
    slam.handle_ping(&ping(0.5));
    slam.handle_ping(&ping(0.2));
    assert_eq!(slam.particles()[0].pose_history().len(), recorded);
    assert!(slam.handle_odometry(&odometry(2.0)).is_none());

    slam.handle_ping(&ping(1.5));
    assert_eq!(slam.particles()[0].pose_history().len(), recorded + 1);
}

#[test]
fn dead_reckoning_tracks_pure_odometry() {
    let mut slam = filter(3);
    drive(&mut slam, 5);
    let dr = slam.dead_reckoning().pose;
    assert_approx_eq!(dr[0], START[0] + 5.0 * START[5].cos(), 1e-9);
    assert_approx_eq!(dr[1], START[1] + 5.0 * START[5].sin(), 1e-9);
    assert_approx_eq!(dr[2], START[2], 1e-12);
}
