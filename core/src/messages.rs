//! Sensor messages consumed by the filter and their logged CSV form.
//!
//! Two streams drive the filter: odometry samples (pose + twist), which trigger
//! the predict step, and multibeam pings, which are stored and later scored
//! against each particle's map. For offline replay both are read from CSV logs
//! and merged into a single time-ordered [`EventStream`].
//!
//! ## CSV layout
//!
//! Odometry, one row per sample:
//!
//! ```text
//! time,x,y,z,roll,pitch,yaw,vx,vy,vz,wx,wy,wz
//! ```
//!
//! Pings, one row per beam, grouped into pings by `time`:
//!
//! ```text
//! time,beam,x,y,z
//! ```
//!
//! Beam coordinates are Cartesian in the sonar frame.

use std::collections::BTreeMap;
use std::path::Path;

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::MessageError;
use crate::geometry::PoseVector;
use crate::linalg::evenly_spaced_indices;

/// Body-frame linear velocity and Euler angle rates.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Twist {
    pub linear: Vector3<f64>,
    pub angular: Vector3<f64>,
}

/// A timestamped odometry sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Odometry {
    /// Seconds.
    pub stamp: f64,
    /// Reported vehicle pose; used as ground truth in diagnostics.
    pub pose: PoseVector,
    pub twist: Twist,
}

/// A timestamped multibeam ping in the sonar frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Ping {
    pub stamp: f64,
    pub beams: Vec<Point3<f64>>,
}

impl Ping {
    pub fn new(stamp: f64, beams: Vec<Point3<f64>>) -> Self {
        Self { stamp, beams }
    }

    /// Keep `beam_count` evenly spaced beams (`round(linspace(0, n-1, k))`).
    /// A ping with no more than `beam_count` beams is returned unchanged.
    pub fn subsample(&self, beam_count: usize) -> Ping {
        let beams = evenly_spaced_indices(self.beams.len(), beam_count)
            .into_iter()
            .map(|i| self.beams[i])
            .collect();
        Ping {
            stamp: self.stamp,
            beams,
        }
    }

    pub fn len(&self) -> usize {
        self.beams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beams.is_empty()
    }
}

/// One logged odometry row.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OdometryRecord {
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
    pub wx: f64,
    pub wy: f64,
    pub wz: f64,
}

impl From<&OdometryRecord> for Odometry {
    fn from(r: &OdometryRecord) -> Self {
        Odometry {
            stamp: r.time,
            pose: PoseVector::new(r.x, r.y, r.z, r.roll, r.pitch, r.yaw),
            twist: Twist {
                linear: Vector3::new(r.vx, r.vy, r.vz),
                angular: Vector3::new(r.wx, r.wy, r.wz),
            },
        }
    }
}

impl From<&Odometry> for OdometryRecord {
    fn from(o: &Odometry) -> Self {
        OdometryRecord {
            time: o.stamp,
            x: o.pose[0],
            y: o.pose[1],
            z: o.pose[2],
            roll: o.pose[3],
            pitch: o.pose[4],
            yaw: o.pose[5],
            vx: o.twist.linear.x,
            vy: o.twist.linear.y,
            vz: o.twist.linear.z,
            wx: o.twist.angular.x,
            wy: o.twist.angular.y,
            wz: o.twist.angular.z,
        }
    }
}

/// One logged beam.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PingRecord {
    pub time: f64,
    pub beam: usize,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Read odometry samples from a CSV log.
pub fn read_odometry_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Odometry>, MessageError> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut samples = Vec::new();
    for result in rdr.deserialize() {
        let record: OdometryRecord = result?;
        samples.push(Odometry::from(&record));
    }
    Ok(samples)
}

/// Write odometry samples to a CSV log.
pub fn write_odometry_csv<P: AsRef<Path>>(path: P, samples: &[Odometry]) -> Result<(), MessageError> {
    let mut wtr = csv::Writer::from_path(path)?;
    for sample in samples {
        wtr.serialize(OdometryRecord::from(sample))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Beams of one stamp, keyed by beam index, before sorting.
type BeamGroup = (f64, Vec<(usize, Point3<f64>)>);

/// Read pings from a beam-per-row CSV log. Rows sharing a timestamp form one
/// ping, ordered by beam index.
pub fn read_pings_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Ping>, MessageError> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut grouped: BTreeMap<u64, BeamGroup> = BTreeMap::new();
    for result in rdr.deserialize() {
        let r: PingRecord = result?;
        // Total order on finite stamps via their bit pattern.
        let key = ordered_key(r.time);
        grouped
            .entry(key)
            .or_insert_with(|| (r.time, Vec::new()))
            .1
            .push((r.beam, Point3::new(r.x, r.y, r.z)));
    }
    Ok(grouped
        .into_values()
        .map(|(stamp, mut beams)| {
            beams.sort_by_key(|(i, _)| *i);
            Ping::new(stamp, beams.into_iter().map(|(_, p)| p).collect())
        })
        .collect())
}

/// Write pings to a beam-per-row CSV log.
pub fn write_pings_csv<P: AsRef<Path>>(path: P, pings: &[Ping]) -> Result<(), MessageError> {
    let mut wtr = csv::Writer::from_path(path)?;
    for ping in pings {
        for (beam, p) in ping.beams.iter().enumerate() {
            wtr.serialize(PingRecord {
                time: ping.stamp,
                beam,
                x: p.x,
                y: p.y,
                z: p.z,
            })?;
        }
    }
    wtr.flush()?;
    Ok(())
}

fn ordered_key(t: f64) -> u64 {
    let bits = t.to_bits();
    if bits >> 63 == 1 { !bits } else { bits | (1 << 63) }
}

/// A sensor message delivered to the filter in time order.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Odometry(Odometry),
    Ping(Ping),
}

impl Event {
    pub fn stamp(&self) -> f64 {
        match self {
            Event::Odometry(o) => o.stamp,
            Event::Ping(p) => p.stamp,
        }
    }
}

/// Time-ordered merge of the odometry and ping streams.
#[derive(Clone, Debug, Default)]
pub struct EventStream {
    pub events: Vec<Event>,
}

impl EventStream {
    /// Merge both streams. At equal stamps a ping sorts before odometry, so the
    /// odometry sample that shares its stamp triggers the update.
    pub fn build(odometry: Vec<Odometry>, pings: Vec<Ping>) -> Self {
        let mut events: Vec<Event> = pings
            .into_iter()
            .map(Event::Ping)
            .chain(odometry.into_iter().map(Event::Odometry))
            .collect();
        events.sort_by(|a, b| {
            a.stamp().total_cmp(&b.stamp()).then_with(|| {
                let rank = |e: &Event| matches!(e, Event::Odometry(_)) as u8;
                rank(a).cmp(&rank(b))
            })
        });
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn odom(stamp: f64) -> Odometry {
        Odometry {
            stamp,
            pose: PoseVector::new(stamp, 0.0, -5.0, 0.0, 0.0, 0.1),
            twist: Twist {
                linear: Vector3::new(1.0, 0.0, 0.0),
                angular: Vector3::zeros(),
            },
        }
    }

    #[test]
    fn subsample_selects_evenly_spaced_beams() {
        let beams = (0..512).map(|i| Point3::new(i as f64, 0.0, 10.0)).collect();
        let ping = Ping::new(1.0, beams);
        let sub = ping.subsample(5);
        let xs: Vec<f64> = sub.beams.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![0.0, 128.0, 256.0, 383.0, 511.0]);
        assert_eq!(sub.stamp, 1.0);
        assert_eq!(ping.subsample(600).len(), 512);
    }

    #[test]
    fn event_stream_orders_pings_before_odometry_on_ties() {
        let stream = EventStream::build(
            vec![odom(2.0), odom(1.0)],
            vec![Ping::new(1.0, vec![]), Ping::new(1.5, vec![])],
        );
        let kinds: Vec<(f64, bool)> = stream
            .iter()
            .map(|e| (e.stamp(), matches!(e, Event::Ping(_))))
            .collect();
        assert_eq!(kinds, vec![(1.0, true), (1.0, false), (1.5, true), (2.0, false)]);
    }

    #[test]
    fn csv_roundtrip_groups_beams_into_pings() {
        let dir = tempfile::tempdir().unwrap();
        let odom_path = dir.path().join("odom.csv");
        let ping_path = dir.path().join("pings.csv");

        write_odometry_csv(&odom_path, &[odom(0.0), odom(0.5)]).unwrap();
        let pings = vec![
            Ping::new(0.25, vec![Point3::new(0.0, -1.0, 9.0), Point3::new(0.0, 1.0, 9.5)]),
            Ping::new(0.75, vec![Point3::new(0.0, 0.0, 8.0)]),
        ];
        write_pings_csv(&ping_path, &pings).unwrap();

        let odometry = read_odometry_csv(&odom_path).unwrap();
        assert_eq!(odometry.len(), 2);
        assert_approx_eq!(odometry[1].pose[0], 0.5, 1e-12);
        assert_approx_eq!(odometry[1].twist.linear.x, 1.0, 1e-12);

        let read = read_pings_csv(&ping_path).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].len(), 2);
        assert_approx_eq!(read[0].beams[1].z, 9.5, 1e-12);
        assert_approx_eq!(read[1].stamp, 0.75, 1e-12);
    }
}
