//! Pose and rigid-transform algebra.
//!
//! Poses are carried around the filter as 6-vectors `[x, y, z, roll, pitch, yaw]`
//! in the map frame. Rotations follow the nalgebra convention used by
//! [`UnitQuaternion::from_euler_angles`], i.e. `R = Rz(yaw) * Ry(pitch) * Rx(roll)`.

use std::f64::consts::PI;

use nalgebra::{
    Isometry3, Matrix3, Matrix4, Rotation3, Translation3, UnitQuaternion, Vector3, Vector6,
};

/// 6-DOF pose vector: `[x, y, z, roll, pitch, yaw]`.
pub type PoseVector = Vector6<f64>;

/// Wrap an angle to the range $[-\pi, \pi)$ radians.
///
/// # Example
/// ```rust
/// use rbpf_slam::geometry::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    if (-PI..PI).contains(&angle) {
        return angle;
    }
    (angle + PI).rem_euclid(2.0 * PI) - PI
}

/// Wrap an angle to the range $[0, 2\pi)$ radians.
pub fn wrap_to_2pi(angle: f64) -> f64 {
    angle.rem_euclid(2.0 * PI)
}

/// Build a unit quaternion from roll, pitch, and yaw.
pub fn quaternion_from_euler(roll: f64, pitch: f64, yaw: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_euler_angles(roll, pitch, yaw)
}

/// Recover `(roll, pitch, yaw)` from a unit quaternion.
pub fn euler_from_quaternion(q: &UnitQuaternion<f64>) -> (f64, f64, f64) {
    q.euler_angles()
}

/// Convert a pose vector into a rigid transform.
pub fn pose_to_isometry(pose: &PoseVector) -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::new(pose[0], pose[1], pose[2]),
        quaternion_from_euler(pose[3], pose[4], pose[5]),
    )
}

/// Convert a rigid transform back into a pose vector.
pub fn isometry_to_pose(iso: &Isometry3<f64>) -> PoseVector {
    let (roll, pitch, yaw) = euler_from_quaternion(&iso.rotation);
    let t = iso.translation.vector;
    PoseVector::new(t.x, t.y, t.z, roll, pitch, yaw)
}

/// Compose two transforms, `a * b` (apply `b` first).
pub fn compose(a: &Isometry3<f64>, b: &Isometry3<f64>) -> Isometry3<f64> {
    a * b
}

/// Pack a translation and rotation into a 4x4 homogeneous matrix.
pub fn to_homogeneous(translation: &Vector3<f64>, rotation: &UnitQuaternion<f64>) -> Matrix4<f64> {
    Isometry3::from_parts(Translation3::from(*translation), *rotation).to_homogeneous()
}

/// Split a 4x4 homogeneous matrix into translation and rotation.
///
/// The upper-left block is re-orthonormalized, so matrices that have drifted
/// slightly from SO(3) are still accepted.
pub fn from_homogeneous(m: &Matrix4<f64>) -> (Vector3<f64>, UnitQuaternion<f64>) {
    let translation = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);
    let block: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
    let rotation = Rotation3::from_matrix(&block);
    (translation, UnitQuaternion::from_rotation_matrix(&rotation))
}

/// Circular mean of a set of angles, in $[-\pi, \pi)$.
///
/// Returns 0 for an empty slice.
pub fn circular_mean<I>(angles: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let (s, c) = angles
        .into_iter()
        .fold((0.0, 0.0), |(s, c), a| (s + a.sin(), c + a.cos()));
    if s == 0.0 && c == 0.0 {
        return 0.0;
    }
    wrap_to_pi(s.atan2(c))
}

/// Circular mean of `(angle, weight)` pairs.
pub fn weighted_circular_mean<I>(samples: I) -> f64
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let (s, c) = samples
        .into_iter()
        .fold((0.0, 0.0), |(s, c), (a, w)| (s + w * a.sin(), c + w * a.cos()));
    if s == 0.0 && c == 0.0 {
        return 0.0;
    }
    wrap_to_pi(s.atan2(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::Point3;

    #[test]
    fn wrap_to_pi_ranges() {
        assert_approx_eq!(wrap_to_pi(3.0 * PI / 2.0), -PI / 2.0, 1e-12);
        assert_approx_eq!(wrap_to_pi(-3.0 * PI / 2.0), PI / 2.0, 1e-12);
        assert_approx_eq!(wrap_to_pi(0.25), 0.25, 1e-15);
        assert_approx_eq!(wrap_to_pi(PI), -PI, 1e-12);
        assert_approx_eq!(wrap_to_2pi(-PI / 2.0), 3.0 * PI / 2.0, 1e-12);
        assert_approx_eq!(wrap_to_2pi(5.0 * PI), PI, 1e-12);
    }

    #[test]
    fn pose_isometry_roundtrip() {
        let pose = PoseVector::new(1.0, -2.0, -30.0, 0.05, -0.1, 2.5);
        let back = isometry_to_pose(&pose_to_isometry(&pose));
        for i in 0..6 {
            assert_approx_eq!(back[i], pose[i], 1e-12);
        }
    }

    #[test]
    fn homogeneous_roundtrip() {
        let t = Vector3::new(3.0, 4.0, 5.0);
        let q = quaternion_from_euler(0.1, 0.2, 0.3);
        let m = to_homogeneous(&t, &q);
        assert_approx_eq!(m[(3, 3)], 1.0, 1e-15);
        let (t2, q2) = from_homogeneous(&m);
        assert_approx_eq!((t2 - t).norm(), 0.0, 1e-12);
        assert_approx_eq!(q2.angle_to(&q), 0.0, 1e-9);
    }

    #[test]
    fn compose_applies_right_first() {
        let a = pose_to_isometry(&PoseVector::new(10.0, 0.0, 0.0, 0.0, 0.0, PI / 2.0));
        let b = pose_to_isometry(&PoseVector::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.0));
        let p = compose(&a, &b).transform_point(&Point3::origin());
        assert_approx_eq!(p.x, 10.0, 1e-12);
        assert_approx_eq!(p.y, 1.0, 1e-12);
    }

    #[test]
    fn circular_mean_straddles_pi() {
        let mean = circular_mean([PI - 0.1, -PI + 0.1]);
        assert_approx_eq!(mean.abs(), PI, 1e-9);
        assert_approx_eq!(circular_mean([0.1, 0.3]), 0.2, 1e-12);
        assert_eq!(circular_mean(Vec::<f64>::new()), 0.0);
    }

    #[test]
    fn weighted_circular_mean_follows_heavier_angle() {
        let mean = weighted_circular_mean([(0.0, 0.9), (PI / 2.0, 0.1)]);
        assert!(mean > 0.0 && mean < PI / 4.0);
        assert_approx_eq!(weighted_circular_mean([(0.4, 1.0), (-1.0, 0.0)]), 0.4, 1e-12);
    }
}
