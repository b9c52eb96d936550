//! On-demand export of every particle's reconstructed history.
//!
//! Files are grouped per particle slot and per lineage segment:
//!
//! ```text
//! <storage>/trajectory/p{i}/localization/tr_path/ID{id}_tr.csv     x,y,z,roll,pitch,yaw
//! <storage>/trajectory/p{i}/localization/obs_path/ID{id}_obs.csv   x,y,z
//! <storage>/trajectory/p{i}/mapping/est_map/ID{id}_map.csv         x,y,mean,variance
//! <storage>/trajectory/p{i}/mapping/obs_depth/ID{id}_depth.csv     x,y,depth
//! ```
//!
//! A particle gets one set of files for each node on its path from the root,
//! plus its live (not yet closed) segment.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::Serialize;

use crate::ancestry::{AncestryTree, Lineage, Segment};
use crate::error::ArchiveError;
use crate::particle::ParticleId;

#[derive(Serialize)]
struct PoseRow {
    x: f64,
    y: f64,
    z: f64,
    roll: f64,
    pitch: f64,
    yaw: f64,
}

#[derive(Serialize)]
struct PointRow {
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Serialize)]
struct MapRow {
    x: f64,
    y: f64,
    mean: f64,
    variance: f64,
}

#[derive(Serialize)]
struct DepthRow {
    x: f64,
    y: f64,
    depth: f64,
}

/// What a call to [`TrajectoryArchive::write`] produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArchiveSummary {
    pub particles: usize,
    pub segments: usize,
    pub files: Vec<PathBuf>,
}

impl ArchiveSummary {
    pub fn files_written(&self) -> usize {
        self.files.len()
    }
}

/// Writer for the trajectory archive rooted at `<storage>/trajectory`.
#[derive(Clone, Debug)]
pub struct TrajectoryArchive {
    root: PathBuf,
}

impl TrajectoryArchive {
    pub fn new<P: AsRef<Path>>(storage_path: P) -> Self {
        Self {
            root: storage_path.as_ref().join("trajectory"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write every particle's lineage.
    pub fn write<L: Lineage>(
        &self,
        particles: &[L],
        tree: &AncestryTree,
    ) -> Result<ArchiveSummary, ArchiveError> {
        let mut summary = ArchiveSummary {
            particles: particles.len(),
            ..ArchiveSummary::default()
        };
        for (slot, particle) in particles.iter().enumerate() {
            let live_id = particle.lineage_id();
            let mut ids = tree.lineage(live_id);
            if ids.last() != Some(&live_id) {
                ids.push(live_id);
            }
            let base = self.root.join(format!("p{slot}"));
            for id in ids {
                let segment = if id == live_id {
                    particle.segment()
                } else {
                    match tree.node(id) {
                        Some(node) => node.segment.clone(),
                        None => continue,
                    }
                };
                self.write_segment(&base, id, &segment, &mut summary.files)?;
                summary.segments += 1;
            }
        }
        info!(
            "Archived {} particles ({} segments, {} files) under {}",
            summary.particles,
            summary.segments,
            summary.files.len(),
            self.root.display()
        );
        Ok(summary)
    }

    fn write_segment(
        &self,
        base: &Path,
        id: ParticleId,
        segment: &Segment,
        files: &mut Vec<PathBuf>,
    ) -> Result<(), ArchiveError> {
        let tr = target(base, "localization/tr_path", &format!("ID{id}_tr.csv"))?;
        write_rows(
            &tr,
            segment.trajectory.iter().map(|p| PoseRow {
                x: p[0],
                y: p[1],
                z: p[2],
                roll: p[3],
                pitch: p[4],
                yaw: p[5],
            }),
        )?;
        files.push(tr);

        let obs = target(base, "localization/obs_path", &format!("ID{id}_obs.csv"))?;
        write_rows(
            &obs,
            segment.observations.iter().map(|p| PointRow {
                x: p.x,
                y: p.y,
                z: p.z,
            }),
        )?;
        files.push(obs);

        let map = target(base, "mapping/est_map", &format!("ID{id}_map.csv"))?;
        write_rows(
            &map,
            segment.mapping.iter().map(|s| MapRow {
                x: s.x,
                y: s.y,
                mean: s.mean,
                variance: s.variance,
            }),
        )?;
        files.push(map);

        let depth = target(base, "mapping/obs_depth", &format!("ID{id}_depth.csv"))?;
        write_rows(
            &depth,
            segment.mapping.iter().map(|s| DepthRow {
                x: s.x,
                y: s.y,
                depth: s.target,
            }),
        )?;
        files.push(depth);
        Ok(())
    }
}

fn target(base: &Path, dir: &str, file: &str) -> Result<PathBuf, ArchiveError> {
    let dir = base.join(dir);
    fs::create_dir_all(&dir).map_err(|source| ArchiveError::Io {
        path: dir.clone(),
        source,
    })?;
    Ok(dir.join(file))
}

fn write_rows<T: Serialize>(
    path: &Path,
    rows: impl Iterator<Item = T>,
) -> Result<(), ArchiveError> {
    let mut wtr = csv::Writer::from_path(path)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush().map_err(|source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
