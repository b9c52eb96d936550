//! Synthetic lawnmower surveys over a triangle-mesh seabed.
//!
//! A [`SurveyPlan`] describes a boustrophedon pattern: parallel legs along x,
//! joined by short transits in +y. [`SurveyPlan::generate`] samples the true
//! trajectory at the odometry rate, derives the body-frame twist that carries
//! one sample to the next (so dead reckoning on noise-free odometry reproduces
//! the truth), corrupts it with Gaussian noise, and ray-casts a ping from the
//! true sonar pose at the ping rate.

use std::path::{Path, PathBuf};

use log::info;
use nalgebra::{Point3, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::beams::{BeamSimulator, TriangleMesh, beam_directions};
use crate::config::RbpfConfig;
use crate::error::MessageError;
use crate::geometry::{PoseVector, pose_to_isometry, quaternion_from_euler, wrap_to_pi};
use crate::messages::{Odometry, Ping, Twist, write_odometry_csv, write_pings_csv};
use crate::transforms::SensorTransforms;

/// Lawnmower survey description. Distances in metres, rates in Hz.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyPlan {
    pub legs: usize,
    pub leg_length: f64,
    pub leg_spacing: f64,
    pub speed: f64,
    /// Vehicle depth below the surface.
    pub vehicle_depth: f64,
    /// Mean seabed depth for [`SurveyPlan::seabed`].
    pub seabed_depth: f64,
    pub odometry_rate: f64,
    pub ping_rate: f64,
    /// Std of the additive noise on each linear velocity component, m/s.
    pub velocity_noise_std: f64,
    /// Std of the additive noise on the yaw rate, rad/s.
    pub yaw_rate_noise_std: f64,
    /// Std of the along-beam range noise, m.
    pub range_noise_std: f64,
}

impl Default for SurveyPlan {
    fn default() -> Self {
        Self {
            legs: 4,
            leg_length: 100.0,
            leg_spacing: 15.0,
            speed: 1.5,
            vehicle_depth: 5.0,
            seabed_depth: 25.0,
            odometry_rate: 10.0,
            ping_rate: 2.0,
            velocity_noise_std: 0.02,
            yaw_rate_noise_std: 1e-3,
            range_noise_std: 0.02,
        }
    }
}

/// Output of [`SurveyPlan::generate`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Survey {
    /// Noisy twists; `pose` is the ground truth.
    pub odometry: Vec<Odometry>,
    pub pings: Vec<Ping>,
}

impl Survey {
    pub fn initial_pose(&self) -> PoseVector {
        self.odometry
            .first()
            .map(|o| o.pose)
            .unwrap_or_else(PoseVector::zeros)
    }

    /// Write `odometry.csv` and `pings.csv` into `dir`.
    pub fn write_csv<P: AsRef<Path>>(&self, dir: P) -> Result<(PathBuf, PathBuf), MessageError> {
        let odom = dir.as_ref().join("odometry.csv");
        let pings = dir.as_ref().join("pings.csv");
        write_odometry_csv(&odom, &self.odometry)?;
        write_pings_csv(&pings, &self.pings)?;
        Ok((odom, pings))
    }
}

impl SurveyPlan {
    fn waypoints(&self) -> Vec<Vector2<f64>> {
        let mut points = vec![Vector2::zeros()];
        for leg in 0..self.legs {
            let y = leg as f64 * self.leg_spacing;
            let x_end = if leg % 2 == 0 { self.leg_length } else { 0.0 };
            if leg > 0 {
                points.push(Vector2::new(points[points.len() - 1].x, y));
            }
            points.push(Vector2::new(x_end, y));
        }
        points
    }

    /// Total path length.
    pub fn length(&self) -> f64 {
        self.waypoints()
            .windows(2)
            .map(|w| (w[1] - w[0]).norm())
            .sum()
    }

    pub fn duration(&self) -> f64 {
        if self.speed > 0.0 {
            self.length() / self.speed
        } else {
            0.0
        }
    }

    /// True pose after `distance` metres along the path. Clamped to the ends.
    pub fn pose_at(&self, distance: f64) -> PoseVector {
        let points = self.waypoints();
        let z = -self.vehicle_depth;
        let mut remaining = distance.max(0.0);
        let mut last_yaw = 0.0;
        for w in points.windows(2) {
            let seg = w[1] - w[0];
            let len = seg.norm();
            if len == 0.0 {
                continue;
            }
            last_yaw = seg.y.atan2(seg.x);
            if remaining <= len {
                let p = w[0] + seg * (remaining / len);
                return PoseVector::new(p.x, p.y, z, 0.0, 0.0, last_yaw);
            }
            remaining -= len;
        }
        let end = points[points.len() - 1];
        PoseVector::new(end.x, end.y, z, 0.0, 0.0, last_yaw)
    }

    /// Gently undulating seabed covering the survey area with a margin.
    pub fn seabed(&self, cells: usize) -> TriangleMesh {
        let margin = 50.0;
        let y_extent = self.legs.saturating_sub(1) as f64 * self.leg_spacing;
        let depth = self.seabed_depth;
        TriangleMesh::from_height_fn(
            (-margin, self.leg_length + margin),
            (-margin, y_extent + margin),
            cells,
            move |x, y| -depth + 2.0 * (x / 15.0).sin() * (y / 20.0).cos() + 0.02 * x,
        )
    }

    /// Generate odometry and pings. Sonar geometry comes from `config`
    /// (`beams_real`, `opening_angle`, `max_range`).
    pub fn generate<S: BeamSimulator + ?Sized>(
        &self,
        simulator: &S,
        mounting: &SensorTransforms,
        config: &RbpfConfig,
        seed: u64,
    ) -> Survey {
        let mut rng = StdRng::seed_from_u64(seed);
        let duration = self.duration();
        let dirs = beam_directions(config.beams_real, config.opening_angle);

        let mut odometry = Vec::new();
        if self.odometry_rate > 0.0 {
            let dt = 1.0 / self.odometry_rate;
            let steps = (duration * self.odometry_rate).floor() as usize;
            let mut previous = self.pose_at(0.0);
            for k in 0..=steps {
                let stamp = k as f64 * dt;
                let pose = self.pose_at(self.speed * stamp);
                let mut twist = if k == 0 {
                    Twist::default()
                } else {
                    twist_between(&previous, &pose, dt)
                };
                twist.linear += Vector3::from_fn(|_, _| {
                    self.velocity_noise_std * rng.sample::<f64, _>(StandardNormal)
                });
                twist.angular.z += self.yaw_rate_noise_std * rng.sample::<f64, _>(StandardNormal);
                odometry.push(Odometry { stamp, pose, twist });
                previous = pose;
            }
        }

        let mut pings = Vec::new();
        if self.ping_rate > 0.0 {
            let count = (duration * self.ping_rate).floor() as usize;
            for j in 1..=count {
                let stamp = j as f64 / self.ping_rate;
                let pose = self.pose_at(self.speed * stamp);
                let sensor = mounting.sensor_in_map(&pose_to_isometry(&pose));
                let beams = simulator
                    .simulate_ping(&sensor, &dirs, config.max_range)
                    .into_iter()
                    .map(|b| {
                        let noise = self.range_noise_std * rng.sample::<f64, _>(StandardNormal);
                        perturb_range(b, noise)
                    })
                    .collect();
                pings.push(Ping::new(stamp, beams));
            }
        }

        info!(
            "Generated survey: {:.0} m over {:.1} s, {} odometry samples, {} pings",
            self.length(),
            duration,
            odometry.len(),
            pings.len()
        );
        Survey { odometry, pings }
    }
}

/// Body twist that moves `from` to `to` in `dt` under the particle motion model.
fn twist_between(from: &PoseVector, to: &PoseVector, dt: f64) -> Twist {
    let angular = Vector3::new(
        wrap_to_pi(to[3] - from[3]),
        wrap_to_pi(to[4] - from[4]),
        wrap_to_pi(to[5] - from[5]),
    ) / dt;
    let displacement = Vector3::new(to[0] - from[0], to[1] - from[1], to[2] - from[2]);
    let linear = quaternion_from_euler(to[3], to[4], to[5]).inverse() * displacement / dt;
    Twist { linear, angular }
}

fn perturb_range(beam: Point3<f64>, noise: f64) -> Point3<f64> {
    let range = beam.coords.norm();
    if range == 0.0 {
        return beam;
    }
    beam * ((range + noise) / range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beams::{MeshBeamSimulator, SoundSpeedProfile};
    use crate::particle::{Particle, PoseNoise};
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn quiet_plan() -> SurveyPlan {
        SurveyPlan {
            legs: 2,
            leg_length: 20.0,
            leg_spacing: 10.0,
            speed: 2.0,
            velocity_noise_std: 0.0,
            yaw_rate_noise_std: 0.0,
            range_noise_std: 0.0,
            ..SurveyPlan::default()
        }
    }

    fn sonar_config() -> RbpfConfig {
        RbpfConfig {
            beams_real: 16,
            ..RbpfConfig::default()
        }
    }

    #[test]
    fn path_follows_lawnmower_pattern() {
        let plan = quiet_plan();
        assert_approx_eq!(plan.length(), 50.0, 1e-12);
        assert_approx_eq!(plan.duration(), 25.0, 1e-12);

        let p = plan.pose_at(10.0);
        assert_approx_eq!(p[0], 10.0, 1e-12);
        assert_approx_eq!(p[2], -5.0, 1e-12);
        assert_approx_eq!(p[5], 0.0, 1e-12);

        let p = plan.pose_at(25.0);
        assert_approx_eq!(p[0], 20.0, 1e-12);
        assert_approx_eq!(p[1], 5.0, 1e-12);
        assert_approx_eq!(p[5], PI / 2.0, 1e-12);

        let p = plan.pose_at(40.0);
        assert_approx_eq!(p[0], 10.0, 1e-12);
        assert_approx_eq!(p[1], 10.0, 1e-12);
        assert_approx_eq!(p[5].abs(), PI, 1e-12);

        let end = plan.pose_at(1e6);
        assert_approx_eq!(end[0], 0.0, 1e-12);
        assert_approx_eq!(end[1], 10.0, 1e-12);
    }

    #[test]
    fn noise_free_odometry_reproduces_truth() {
        let plan = quiet_plan();
        let sim = MeshBeamSimulator::new(plan.seabed(8), SoundSpeedProfile::default());
        let survey = plan.generate(&sim, &SensorTransforms::downward_sonar(), &sonar_config(), 1);
        assert_eq!(survey.odometry.len(), 251);

        let mut dr = Particle::new(
            0,
            survey.initial_pose(),
            (),
            PoseNoise::zero(),
            SensorTransforms::default(),
            0,
        );
        for w in survey.odometry.windows(2) {
            dr.predict(&w[1].twist, w[1].stamp - w[0].stamp);
            for i in 0..3 {
                assert_approx_eq!(dr.pose[i], w[1].pose[i], 1e-6);
            }
        }
    }

    #[test]
    fn pings_see_the_seabed_below() {
        let plan = quiet_plan();
        let sim = MeshBeamSimulator::new(plan.seabed(16), SoundSpeedProfile::default());
        let survey = plan.generate(&sim, &SensorTransforms::downward_sonar(), &sonar_config(), 1);
        assert_eq!(survey.pings.len(), 50);
        for ping in &survey.pings {
            assert_eq!(ping.len(), 16);
            // Sonar z looks down; the seabed is 17 to 23 m below the vehicle.
            assert!(ping.beams.iter().all(|b| b.z > 10.0 && b.z < 30.0));
        }
    }

    #[test]
    fn generation_is_seeded() {
        let plan = SurveyPlan {
            legs: 1,
            leg_length: 10.0,
            ..SurveyPlan::default()
        };
        let sim = MeshBeamSimulator::new(plan.seabed(4), SoundSpeedProfile::default());
        let mounting = SensorTransforms::downward_sonar();
        let a = plan.generate(&sim, &mounting, &sonar_config(), 5);
        let b = plan.generate(&sim, &mounting, &sonar_config(), 5);
        let c = plan.generate(&sim, &mounting, &sonar_config(), 6);
        assert_eq!(a, b);
        assert_ne!(a.odometry, c.odometry);
    }

    #[test]
    fn survey_csv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let plan = SurveyPlan {
            legs: 1,
            leg_length: 6.0,
            ..SurveyPlan::default()
        };
        let sim = MeshBeamSimulator::new(plan.seabed(4), SoundSpeedProfile::default());
        let survey = plan.generate(&sim, &SensorTransforms::downward_sonar(), &sonar_config(), 3);
        let (odom, pings) = survey.write_csv(dir.path()).unwrap();
        let odometry = crate::messages::read_odometry_csv(odom).unwrap();
        let read = crate::messages::read_pings_csv(pings).unwrap();
        assert_eq!(odometry.len(), survey.odometry.len());
        assert_eq!(read.len(), survey.pings.len());
    }
}
