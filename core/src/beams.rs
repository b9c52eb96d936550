//! Synthetic multibeam returns.
//!
//! A [`BeamSimulator`] casts a fan of beams from a sonar pose against a fixed
//! bathymetric surface. [`MeshBeamSimulator`] does this against a triangle mesh
//! with a sound-speed profile for travel times; it is brute force and meant for
//! survey-sized meshes, not large terrain models.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::{Isometry3, Point3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::MeshError;

/// Nominal sound speed in sea water, m/s.
pub const DEFAULT_SOUND_SPEED: f64 = 1500.0;

/// A beam that hit the surface.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BeamHit {
    /// Intersection in the map frame.
    pub point: Point3<f64>,
    /// Slant range from the sonar, m.
    pub range: f64,
    /// Two-way travel time, s.
    pub travel_time: f64,
}

/// Ray-casting sonar model.
pub trait BeamSimulator {
    /// Cast each of `beam_directions` (sonar frame, unit length) from `sensor_pose`
    /// (sonar in map). Rays that miss or exceed `max_range` yield `None`.
    fn simulate(
        &self,
        sensor_pose: &Isometry3<f64>,
        beam_directions: &[Vector3<f64>],
        max_range: f64,
    ) -> Vec<Option<BeamHit>>;

    /// Same as [`simulate`](Self::simulate) but returns the hits in the sonar frame,
    /// dropping misses. This is the shape of a recorded ping.
    fn simulate_ping(
        &self,
        sensor_pose: &Isometry3<f64>,
        beam_directions: &[Vector3<f64>],
        max_range: f64,
    ) -> Vec<Point3<f64>> {
        let inverse = sensor_pose.inverse();
        self.simulate(sensor_pose, beam_directions, max_range)
            .into_iter()
            .flatten()
            .map(|hit| inverse.transform_point(&hit.point))
            .collect()
    }
}

/// Unit beam directions for a fan of `count` beams spanning `opening_angle`
/// radians across the sonar's y-z plane, centered on +z.
///
/// Beam `i` is +z rotated about +x by `-opening/2 + i * opening / count`.
pub fn beam_directions(count: usize, opening_angle: f64) -> Vec<Vector3<f64>> {
    let step = if count > 0 {
        opening_angle / count as f64
    } else {
        0.0
    };
    (0..count)
        .map(|i| {
            let angle = -opening_angle / 2.0 + step * i as f64;
            (UnitQuaternion::from_axis_angle(&Vector3::x_axis(), angle) * Vector3::z()).normalize()
        })
        .collect()
}

/// Triangulated seabed surface.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TriangleMesh {
    pub vertices: Vec<[f64; 3]>,
    pub faces: Vec<[usize; 3]>,
}

impl TriangleMesh {
    /// Build a mesh from vertices and faces, validating face indices.
    pub fn new(vertices: Vec<[f64; 3]>, faces: Vec<[usize; 3]>) -> Result<Self, MeshError> {
        let mesh = Self { vertices, faces };
        mesh.validate()?;
        Ok(mesh)
    }

    fn validate(&self) -> Result<(), MeshError> {
        for (face, tri) in self.faces.iter().enumerate() {
            if let Some(&vertex) = tri.iter().find(|&&v| v >= self.vertices.len()) {
                return Err(MeshError::InvalidFace {
                    face,
                    vertex,
                    count: self.vertices.len(),
                });
            }
        }
        Ok(())
    }

    /// Regular grid over `[x0, x1] x [y0, y1]` with `cells x cells` squares,
    /// each split into two triangles, elevation `height(x, y)`.
    pub fn from_height_fn<F>(x_range: (f64, f64), y_range: (f64, f64), cells: usize, height: F) -> Self
    where
        F: Fn(f64, f64) -> f64,
    {
        let cells = cells.max(1);
        let n = cells + 1;
        let dx = (x_range.1 - x_range.0) / cells as f64;
        let dy = (y_range.1 - y_range.0) / cells as f64;
        let mut vertices = Vec::with_capacity(n * n);
        for j in 0..n {
            for i in 0..n {
                let x = x_range.0 + i as f64 * dx;
                let y = y_range.0 + j as f64 * dy;
                vertices.push([x, y, height(x, y)]);
            }
        }
        let mut faces = Vec::with_capacity(2 * cells * cells);
        for j in 0..cells {
            for i in 0..cells {
                let a = j * n + i;
                let b = a + 1;
                let c = a + n;
                let d = c + 1;
                faces.push([a, b, d]);
                faces.push([a, d, c]);
            }
        }
        Self { vertices, faces }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, MeshError> {
        let file = File::open(path)?;
        let mesh: TriangleMesh = serde_json::from_reader(BufReader::new(file))?;
        mesh.validate()?;
        Ok(mesh)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), MeshError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    fn vertex(&self, i: usize) -> Vector3<f64> {
        let [x, y, z] = self.vertices[i];
        Vector3::new(x, y, z)
    }

    /// Distance along `dir` from `origin` to the nearest face, if any.
    pub fn intersect(&self, origin: &Point3<f64>, dir: &Vector3<f64>) -> Option<f64> {
        self.faces
            .iter()
            .filter_map(|f| {
                moller_trumbore(
                    origin,
                    dir,
                    &self.vertex(f[0]),
                    &self.vertex(f[1]),
                    &self.vertex(f[2]),
                )
            })
            .min_by(|a, b| a.total_cmp(b))
    }
}

fn moller_trumbore(
    origin: &Point3<f64>,
    dir: &Vector3<f64>,
    v0: &Vector3<f64>,
    v1: &Vector3<f64>,
    v2: &Vector3<f64>,
) -> Option<f64> {
    const EPS: f64 = 1e-12;
    // Barycentric slack so rays along a shared edge hit one of its faces.
    const EDGE: f64 = 1e-9;
    let e1 = v1 - v0;
    let e2 = v2 - v0;
    let p = dir.cross(&e2);
    let det = e1.dot(&p);
    if det.abs() < EPS {
        return None;
    }
    let inv = 1.0 / det;
    let s = origin.coords - v0;
    let u = s.dot(&p) * inv;
    if !(-EDGE..=1.0 + EDGE).contains(&u) {
        return None;
    }
    let q = s.cross(&e1);
    let v = dir.dot(&q) * inv;
    if v < -EDGE || u + v > 1.0 + EDGE {
        return None;
    }
    let t = e2.dot(&q) * inv;
    (t > EPS).then_some(t)
}

/// Sound speed as a function of depth (positive down), piecewise linear.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SoundSpeedProfile {
    /// `(depth, speed)` samples sorted by depth.
    samples: Vec<(f64, f64)>,
}

#[derive(Deserialize)]
struct SoundSpeedRecord {
    depth: f64,
    speed: f64,
}

impl SoundSpeedProfile {
    pub fn new(mut samples: Vec<(f64, f64)>) -> Self {
        samples.retain(|(d, s)| d.is_finite() && s.is_finite() && *s > 0.0);
        samples.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { samples }
    }

    /// Read a `depth,speed` CSV.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self, MeshError> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut samples = Vec::new();
        for result in rdr.deserialize() {
            let r: SoundSpeedRecord = result?;
            samples.push((r.depth, r.speed));
        }
        Ok(Self::new(samples))
    }

    /// Speed at `depth`, clamped to the end samples.
    pub fn speed_at(&self, depth: f64) -> f64 {
        match self.samples.as_slice() {
            [] => DEFAULT_SOUND_SPEED,
            [(_, s)] => *s,
            samples => {
                let k = samples.partition_point(|(d, _)| *d <= depth);
                if k == 0 {
                    return samples[0].1;
                }
                if k == samples.len() {
                    return samples[k - 1].1;
                }
                let (d0, s0) = samples[k - 1];
                let (d1, s1) = samples[k];
                s0 + (s1 - s0) * (depth - d0) / (d1 - d0)
            }
        }
    }

    /// Mean speed over `[a, b]` by trapezoidal integration.
    pub fn mean_speed(&self, a: f64, b: f64) -> f64 {
        const STEPS: usize = 16;
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        if hi - lo < 1e-9 {
            return self.speed_at(lo);
        }
        let h = (hi - lo) / STEPS as f64;
        let mut sum = 0.5 * (self.speed_at(lo) + self.speed_at(hi));
        for i in 1..STEPS {
            sum += self.speed_at(lo + i as f64 * h);
        }
        sum / STEPS as f64
    }
}

/// Ray caster over a triangle mesh. Map z is up, so depth is `-z`.
#[derive(Clone, Debug)]
pub struct MeshBeamSimulator {
    mesh: TriangleMesh,
    profile: SoundSpeedProfile,
}

impl MeshBeamSimulator {
    pub fn new(mesh: TriangleMesh, profile: SoundSpeedProfile) -> Self {
        Self { mesh, profile }
    }

    pub fn mesh(&self) -> &TriangleMesh {
        &self.mesh
    }
}

impl BeamSimulator for MeshBeamSimulator {
    fn simulate(
        &self,
        sensor_pose: &Isometry3<f64>,
        beam_directions: &[Vector3<f64>],
        max_range: f64,
    ) -> Vec<Option<BeamHit>> {
        let origin = Point3::from(sensor_pose.translation.vector);
        beam_directions
            .iter()
            .map(|d| {
                let dir = sensor_pose.rotation * d.normalize();
                let range = self.mesh.intersect(&origin, &dir)?;
                if range > max_range {
                    return None;
                }
                let point = origin + dir * range;
                let speed = self.profile.mean_speed(-origin.z, -point.z);
                Some(BeamHit {
                    point,
                    range,
                    travel_time: 2.0 * range / speed,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn flat(depth: f64) -> TriangleMesh {
        TriangleMesh::from_height_fn((-50.0, 50.0), (-50.0, 50.0), 4, |_, _| -depth)
    }

    #[test]
    fn fan_geometry() {
        let dirs = beam_directions(4, PI / 2.0);
        assert_eq!(dirs.len(), 4);
        // First beam at -45 degrees about x.
        assert_approx_eq!(dirs[0].y, (PI / 4.0).sin(), 1e-12);
        assert_approx_eq!(dirs[0].z, (PI / 4.0).cos(), 1e-12);
        // Third beam is nadir.
        assert_approx_eq!(dirs[2].z, 1.0, 1e-12);
        assert!(dirs.iter().all(|d| (d.norm() - 1.0).abs() < 1e-12));
    }

    #[test]
    fn flat_seabed_ranges() {
        let sim = MeshBeamSimulator::new(flat(20.0), SoundSpeedProfile::default());
        // Sonar at the surface looking down.
        let pose = Isometry3::rotation(Vector3::x() * PI);
        // Beams at -30 and 0 degrees.
        let dirs = beam_directions(2, PI / 3.0);
        let hits = sim.simulate(&pose, &dirs, 100.0);
        assert_eq!(hits.len(), 2);
        let nadir = hits[1].unwrap();
        assert_approx_eq!(nadir.range, 20.0, 1e-9);
        assert_approx_eq!(nadir.point.z, -20.0, 1e-9);
        assert_approx_eq!(nadir.travel_time, 40.0 / DEFAULT_SOUND_SPEED, 1e-12);
        let edge = hits[0].unwrap();
        assert_approx_eq!(edge.range, 20.0 / (PI / 6.0).cos(), 1e-9);
    }

    #[test]
    fn misses_and_range_limit() {
        let sim = MeshBeamSimulator::new(flat(20.0), SoundSpeedProfile::default());
        let up = Isometry3::identity();
        assert!(sim.simulate(&up, &[Vector3::z()], 100.0)[0].is_none());
        let down = Isometry3::rotation(Vector3::x() * PI);
        assert!(sim.simulate(&down, &[Vector3::z()], 10.0)[0].is_none());
    }

    #[test]
    fn ping_is_expressed_in_sonar_frame() {
        let sim = MeshBeamSimulator::new(flat(20.0), SoundSpeedProfile::default());
        let pose = Isometry3::new(Vector3::new(5.0, 5.0, -2.0), Vector3::x() * PI);
        let ping = sim.simulate_ping(&pose, &[Vector3::z()], 100.0);
        assert_eq!(ping.len(), 1);
        assert_approx_eq!(ping[0].z, 18.0, 1e-9);
        assert_approx_eq!(ping[0].x, 0.0, 1e-9);
    }

    #[test]
    fn sound_speed_interpolation() {
        let svp = SoundSpeedProfile::new(vec![(100.0, 1480.0), (0.0, 1520.0)]);
        assert_approx_eq!(svp.speed_at(50.0), 1500.0, 1e-9);
        assert_approx_eq!(svp.speed_at(-5.0), 1520.0, 1e-9);
        assert_approx_eq!(svp.speed_at(500.0), 1480.0, 1e-9);
        assert_approx_eq!(svp.mean_speed(0.0, 100.0), 1500.0, 1e-9);
    }

    #[test]
    fn sound_speed_profile_from_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "depth,speed").unwrap();
        writeln!(file, "50.0,1490.0").unwrap();
        writeln!(file, "0.0,1510.0").unwrap();
        writeln!(file, "25.0,-1.0").unwrap();
        file.flush().unwrap();

        let svp = SoundSpeedProfile::from_csv(file.path()).unwrap();
        // The negative speed is dropped and the rest sorted by depth.
        assert_approx_eq!(svp.speed_at(0.0), 1510.0, 1e-9);
        assert_approx_eq!(svp.speed_at(25.0), 1500.0, 1e-9);
        assert_approx_eq!(svp.speed_at(80.0), 1490.0, 1e-9);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "depth,speed").unwrap();
        writeln!(bad, "10.0,fast").unwrap();
        bad.flush().unwrap();
        assert!(matches!(
            SoundSpeedProfile::from_csv(bad.path()),
            Err(MeshError::Csv(_))
        ));
        assert!(matches!(
            SoundSpeedProfile::from_csv(bad.path().with_extension("missing")),
            Err(MeshError::Csv(_))
        ));
    }

    #[test]
    fn mesh_validation_and_persistence() {
        assert!(matches!(
            TriangleMesh::new(vec![[0.0; 3]], vec![[0, 0, 3]]),
            Err(MeshError::InvalidFace { vertex: 3, .. })
        ));
        let mesh = flat(10.0);
        let file = tempfile::NamedTempFile::new().unwrap();
        mesh.save(file.path()).unwrap();
        assert_eq!(TriangleMesh::load(file.path()).unwrap(), mesh);
    }
}
