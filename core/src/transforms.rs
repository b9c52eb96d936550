//! Static frame bookkeeping between the map, odometry, vehicle, and sonar frames.
//!
//! Only two fixed transforms matter to the filter: map←odom, which places the
//! odometry frame in the map, and base←sensor, the sonar mounting on the
//! vehicle. Both are resolved once at startup. A failed lookup is logged and
//! replaced by identity, and the result is flagged as degraded so callers can
//! tell the spatial output is untrustworthy.

use std::collections::HashMap;

use log::{error, info};
use nalgebra::{Isometry3, Translation3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::TransformLookupError;
use crate::geometry::quaternion_from_euler;

/// Source of rigid transforms between named frames.
pub trait TransformLookup {
    /// Transform that maps coordinates in `source_frame` into `target_frame`.
    fn lookup(&self, target_frame: &str, source_frame: &str)
    -> Result<Isometry3<f64>, TransformLookupError>;
}

/// One configured static transform: pose of `child` expressed in `parent`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StaticTransform {
    pub parent: String,
    pub child: String,
    #[serde(default)]
    pub translation: [f64; 3],
    /// Roll, pitch, yaw in radians.
    #[serde(default)]
    pub rotation_rpy: [f64; 3],
}

impl StaticTransform {
    pub fn isometry(&self) -> Isometry3<f64> {
        let [x, y, z] = self.translation;
        let [r, p, yaw] = self.rotation_rpy;
        Isometry3::from_parts(Translation3::new(x, y, z), quaternion_from_euler(r, p, yaw))
    }
}

/// Lookup table built from static transforms. Answers direct, inverse, and
/// identity queries; it does not chain through intermediate frames.
#[derive(Clone, Debug, Default)]
pub struct StaticTransformTable {
    entries: HashMap<(String, String), Isometry3<f64>>,
}

impl StaticTransformTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_transforms<'a, I>(transforms: I) -> Self
    where
        I: IntoIterator<Item = &'a StaticTransform>,
    {
        let mut table = Self::new();
        for t in transforms {
            table.insert(&t.parent, &t.child, t.isometry());
        }
        table
    }

    /// Register the pose of `child` in `parent`.
    pub fn insert(&mut self, parent: &str, child: &str, transform: Isometry3<f64>) {
        self.entries
            .insert((parent.to_string(), child.to_string()), transform);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TransformLookup for StaticTransformTable {
    fn lookup(
        &self,
        target_frame: &str,
        source_frame: &str,
    ) -> Result<Isometry3<f64>, TransformLookupError> {
        if target_frame == source_frame {
            return Ok(Isometry3::identity());
        }
        let key = (target_frame.to_string(), source_frame.to_string());
        if let Some(t) = self.entries.get(&key) {
            return Ok(*t);
        }
        let inverse_key = (source_frame.to_string(), target_frame.to_string());
        if let Some(t) = self.entries.get(&inverse_key) {
            return Ok(t.inverse());
        }
        Err(TransformLookupError::NotFound {
            target_frame: target_frame.to_string(),
            source_frame: source_frame.to_string(),
        })
    }
}

/// Names of the frames the filter works with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub map_frame: String,
    pub odom_frame: String,
    pub base_frame: String,
    pub sensor_frame: String,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            map_frame: "map".to_string(),
            odom_frame: "odom".to_string(),
            base_frame: "base_link".to_string(),
            sensor_frame: "mbes_link".to_string(),
        }
    }
}

/// Fixed transforms shared by every particle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorTransforms {
    /// Odometry frame expressed in the map frame.
    pub map_from_odom: Isometry3<f64>,
    /// Sonar frame expressed in the vehicle frame.
    pub base_from_sensor: Isometry3<f64>,
    /// Set when any lookup failed and identity was substituted.
    pub degraded: bool,
}

impl Default for SensorTransforms {
    fn default() -> Self {
        Self {
            map_from_odom: Isometry3::identity(),
            base_from_sensor: Isometry3::identity(),
            degraded: false,
        }
    }
}

impl SensorTransforms {
    /// Sonar looking straight down from the vehicle origin, odom coincident with map.
    pub fn downward_sonar() -> Self {
        Self {
            base_from_sensor: Isometry3::rotation(Vector3::x() * std::f64::consts::PI),
            ..Self::default()
        }
    }

    /// Resolve both transforms, degrading to identity on failure.
    pub fn resolve<T: TransformLookup + ?Sized>(lookup: &T, frames: &FrameConfig) -> Self {
        let mut degraded = false;
        let mut fetch = |target: &str, source: &str| match lookup.lookup(target, source) {
            Ok(t) => {
                info!("Resolved transform {source} -> {target}");
                t
            }
            Err(e) => {
                error!("Transform lookup failed: {e}; using identity, spatial output is unreliable");
                degraded = true;
                Isometry3::identity()
            }
        };
        let map_from_odom = fetch(&frames.map_frame, &frames.odom_frame);
        let base_from_sensor = fetch(&frames.base_frame, &frames.sensor_frame);
        Self {
            map_from_odom,
            base_from_sensor,
            degraded,
        }
    }

    /// Pose of the sonar in the map frame for a vehicle pose in the odom frame.
    pub fn sensor_in_map(&self, odom_from_base: &Isometry3<f64>) -> Isometry3<f64> {
        self.map_from_odom * odom_from_base * self.base_from_sensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::Point3;

    fn table() -> StaticTransformTable {
        StaticTransformTable::from_transforms(&[
            StaticTransform {
                parent: "map".into(),
                child: "odom".into(),
                translation: [100.0, 50.0, 0.0],
                rotation_rpy: [0.0, 0.0, 0.0],
            },
            StaticTransform {
                parent: "base_link".into(),
                child: "mbes_link".into(),
                translation: [0.5, 0.0, -0.2],
                rotation_rpy: [std::f64::consts::PI, 0.0, 0.0],
            },
        ])
    }

    #[test]
    fn lookup_direct_inverse_identity() {
        let t = table();
        assert_eq!(t.len(), 2);
        let m_o = t.lookup("map", "odom").unwrap();
        assert_approx_eq!(m_o.translation.vector.x, 100.0, 1e-12);
        let o_m = t.lookup("odom", "map").unwrap();
        assert_approx_eq!(o_m.translation.vector.x, -100.0, 1e-12);
        assert_eq!(t.lookup("map", "map").unwrap(), Isometry3::identity());
        assert!(matches!(
            t.lookup("map", "gps"),
            Err(TransformLookupError::NotFound { .. })
        ));
    }

    #[test]
    fn resolve_full_chain() {
        let tf = SensorTransforms::resolve(&table(), &FrameConfig::default());
        assert!(!tf.degraded);
        let beam = Point3::new(0.0, 0.0, 10.0);
        let p = tf.sensor_in_map(&Isometry3::identity()).transform_point(&beam);
        assert_approx_eq!(p.x, 100.5, 1e-9);
        assert_approx_eq!(p.z, -10.2, 1e-9);
    }

    #[test]
    fn resolve_missing_transform_degrades_to_identity() {
        let tf = SensorTransforms::resolve(&StaticTransformTable::new(), &FrameConfig::default());
        assert!(tf.degraded);
        assert_eq!(tf.map_from_odom, Isometry3::identity());
        assert_eq!(tf.base_from_sensor, Isometry3::identity());
    }

    #[test]
    fn downward_sonar_points_down() {
        let tf = SensorTransforms::downward_sonar();
        let p = tf
            .sensor_in_map(&Isometry3::translation(0.0, 0.0, -5.0))
            .transform_point(&Point3::new(0.0, 0.0, 20.0));
        assert_approx_eq!(p.z, -25.0, 1e-9);
    }
}
