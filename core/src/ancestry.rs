//! Lineage of particles across resampling events.
//!
//! Resampling overwrites lost particles in place with copies of the survivors,
//! which would destroy the history those particles carried. The ancestry tree
//! keeps it: each resampling event closes the segment every live particle has
//! been accumulating under its current id, then forks a fresh id for every
//! particle. Lost particles fork from the source they were cloned from,
//! survivors fork from themselves. Walking parent links from any id back to a
//! root and concatenating segments recovers the full history.
//!
//! Nodes live in an arena indexed through an id map; nothing is ever removed.

use std::collections::{HashMap, HashSet};

use nalgebra::Point3;

use crate::error::ResampleError;
use crate::geometry::PoseVector;
use crate::particle::{MapSample, Particle, ParticleId};

/// History accumulated by one lineage between two resampling events.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Segment {
    /// Poses at each measurement update.
    pub trajectory: Vec<PoseVector>,
    /// Beams placed in the map frame.
    pub observations: Vec<Point3<f64>>,
    /// Beams scored against the map, with the map's prediction.
    pub mapping: Vec<MapSample>,
}

impl Segment {
    pub fn is_empty(&self) -> bool {
        self.trajectory.is_empty() && self.observations.is_empty() && self.mapping.is_empty()
    }
}

/// Anything that carries a lineage id and a history segment.
pub trait Lineage {
    fn lineage_id(&self) -> ParticleId;
    fn assign_lineage(&mut self, id: ParticleId, parent: ParticleId);
    /// Snapshot of the segment accumulated under the current id.
    fn segment(&self) -> Segment;
}

impl<M> Lineage for Particle<M> {
    fn lineage_id(&self) -> ParticleId {
        self.id()
    }

    fn assign_lineage(&mut self, id: ParticleId, parent: ParticleId) {
        self.set_lineage(id, Some(parent));
    }

    fn segment(&self) -> Segment {
        Segment {
            trajectory: self.trajectory().to_vec(),
            observations: self.observations().to_vec(),
            mapping: self.training_buffers().to_vec(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AncestryNode {
    pub id: ParticleId,
    pub parent_id: Option<ParticleId>,
    pub segment: Segment,
    pub children: Vec<ParticleId>,
}

/// Arena of ancestry nodes.
#[derive(Clone, Debug, Default)]
pub struct AncestryTree {
    nodes: Vec<AncestryNode>,
    slots: HashMap<ParticleId, usize>,
    next_id: ParticleId,
}

impl AncestryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a fresh id. Ids are never reused.
    pub fn allocate_id(&mut self) -> ParticleId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: ParticleId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn node(&self, id: ParticleId) -> Option<&AncestryNode> {
        self.slots.get(&id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &AncestryNode> {
        self.nodes.iter()
    }

    /// Nodes with no children.
    pub fn leaves(&self) -> impl Iterator<Item = &AncestryNode> {
        self.nodes.iter().filter(|n| n.children.is_empty())
    }

    fn insert(&mut self, id: ParticleId, parent_id: Option<ParticleId>) {
        let slot = self.nodes.len();
        self.nodes.push(AncestryNode {
            id,
            parent_id,
            segment: Segment::default(),
            children: Vec::new(),
        });
        self.slots.insert(id, slot);
        if let Some(parent) = parent_id.and_then(|p| self.slots.get(&p).copied()) {
            self.nodes[parent].children.push(id);
        }
    }

    /// Record one resampling event.
    ///
    /// `lost[k]` is overwritten by a clone of `sources[k]`. Every particle's
    /// current segment is closed into its node (particles not yet in the tree
    /// become roots), then every particle moves to a new id: lost particles
    /// under their source's old id, the rest under their own old id.
    ///
    /// Returns the newly created ids in particle order. Mismatched or
    /// out-of-range indices are rejected before the tree changes.
    pub fn record_generation<L: Lineage>(
        &mut self,
        particles: &mut [L],
        lost: &[usize],
        sources: &[usize],
    ) -> Result<Vec<ParticleId>, ResampleError> {
        if lost.len() != sources.len() {
            return Err(ResampleError::UnpairedLost {
                lost: lost.len(),
                sources: sources.len(),
            });
        }
        let count = particles.len();
        if let Some(&index) = lost.iter().chain(sources).find(|&&i| i >= count) {
            return Err(ResampleError::IndexOutOfRange { index, count });
        }

        for p in particles.iter() {
            let id = p.lineage_id();
            if !self.contains(id) {
                self.insert(id, None);
            }
            let slot = self.slots[&id];
            self.nodes[slot].segment = p.segment();
        }

        let old_ids: Vec<ParticleId> = particles.iter().map(|p| p.lineage_id()).collect();
        let mut parents = old_ids.clone();
        for (&l, &s) in lost.iter().zip(sources) {
            parents[l] = old_ids[s];
        }

        let mut new_ids = Vec::with_capacity(particles.len());
        for (p, &parent) in particles.iter_mut().zip(&parents) {
            let id = self.allocate_id();
            self.insert(id, Some(parent));
            p.assign_lineage(id, parent);
            new_ids.push(id);
        }
        Ok(new_ids)
    }

    /// Ids from the root down to `id`. Empty if `id` is unknown.
    pub fn lineage(&self, id: ParticleId) -> Vec<ParticleId> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.node(current) else {
                break;
            };
            if !seen.insert(current) {
                break;
            }
            chain.push(current);
            cursor = node.parent_id;
        }
        chain.reverse();
        chain
    }

    /// Full trajectory for `id`, root segment first.
    pub fn reconstruct_trajectory(&self, id: ParticleId) -> Vec<PoseVector> {
        self.lineage(id)
            .into_iter()
            .filter_map(|i| self.node(i))
            .flat_map(|n| n.segment.trajectory.iter().copied())
            .collect()
    }

    /// All observations for `id`, root segment first.
    pub fn reconstruct_observations(&self, id: ParticleId) -> Vec<Point3<f64>> {
        self.lineage(id)
            .into_iter()
            .filter_map(|i| self.node(i))
            .flat_map(|n| n.segment.observations.iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal lineage carrier: a growing list of x positions.
    struct Walker {
        id: ParticleId,
        parent: Option<ParticleId>,
        xs: Vec<f64>,
    }

    impl Lineage for Walker {
        fn lineage_id(&self) -> ParticleId {
            self.id
        }
        fn assign_lineage(&mut self, id: ParticleId, parent: ParticleId) {
            self.id = id;
            self.parent = Some(parent);
        }
        fn segment(&self) -> Segment {
            Segment {
                trajectory: self
                    .xs
                    .iter()
                    .map(|&x| PoseVector::new(x, 0.0, 0.0, 0.0, 0.0, 0.0))
                    .collect(),
                ..Segment::default()
            }
        }
    }

    fn walkers(tree: &mut AncestryTree, n: usize) -> Vec<Walker> {
        (0..n)
            .map(|i| Walker {
                id: tree.allocate_id(),
                parent: None,
                xs: vec![i as f64],
            })
            .collect()
    }

    #[test]
    fn first_generation_creates_roots_and_forks_everyone() {
        let mut tree = AncestryTree::new();
        let mut ws = walkers(&mut tree, 4);
        let new_ids = tree.record_generation(&mut ws, &[1, 3], &[0, 0]).unwrap();

        assert_eq!(tree.len(), 8);
        assert_eq!(new_ids, vec![4, 5, 6, 7]);
        // Lost roots 1 and 3 end their lines; the four new ids are leaves too.
        assert_eq!(tree.leaves().count(), 6);
        for root in 0..4 {
            assert_eq!(tree.node(root).unwrap().parent_id, None);
        }
        // Two clones plus particle 0's own continuation descend from root 0.
        assert_eq!(tree.node(0).unwrap().children, vec![4, 5, 7]);
        assert_eq!(tree.node(2).unwrap().children, vec![6]);
        assert!(tree.node(1).unwrap().children.is_empty());
        assert_eq!(ws[1].parent, Some(0));
        assert_eq!(ws[2].parent, Some(2));
    }

    #[test]
    fn previous_ids_remain_reachable_and_single_parented() {
        let mut tree = AncestryTree::new();
        let mut ws = walkers(&mut tree, 5);
        let before: Vec<ParticleId> = ws.iter().map(|w| w.id).collect();
        tree.record_generation(&mut ws, &[2], &[4]).unwrap();
        for w in &mut ws {
            w.xs = vec![10.0 + w.id as f64];
        }
        tree.record_generation(&mut ws, &[0, 1], &[3, 3]).unwrap();

        for id in before {
            assert!(tree.contains(id));
        }
        let mut child_count: HashMap<ParticleId, usize> = HashMap::new();
        for n in tree.nodes() {
            for c in &n.children {
                *child_count.entry(*c).or_default() += 1;
            }
        }
        assert!(child_count.values().all(|&c| c == 1));
        for w in &ws {
            let chain = tree.lineage(w.id);
            assert_eq!(chain.len(), 3);
            assert_eq!(tree.node(chain[0]).unwrap().parent_id, None);
        }
    }

    #[test]
    fn reconstruction_concatenates_and_is_idempotent() {
        let mut tree = AncestryTree::new();
        let mut ws = walkers(&mut tree, 3);
        tree.record_generation(&mut ws, &[0], &[2]).unwrap();
        for w in &mut ws {
            w.xs = vec![100.0 + w.id as f64, 200.0];
        }
        tree.record_generation(&mut ws, &[], &[]).unwrap();

        // Particle 0 was cloned from root 2 at the first event.
        let parent_of_leaf = tree.node(ws[0].id).unwrap().parent_id.unwrap();
        let xs: Vec<f64> = tree
            .reconstruct_trajectory(parent_of_leaf)
            .iter()
            .map(|p| p[0])
            .collect();
        assert_eq!(xs, vec![2.0, 100.0 + parent_of_leaf as f64, 200.0]);

        let a = tree.reconstruct_trajectory(ws[1].id);
        let b = tree.reconstruct_trajectory(ws[1].id);
        assert_eq!(a, b);
        assert!(tree.reconstruct_trajectory(999).is_empty());
    }

    #[test]
    fn mismatched_lost_and_sources_are_rejected() {
        let mut tree = AncestryTree::new();
        let mut ws = walkers(&mut tree, 2);
        let before = tree.len();
        assert_eq!(
            tree.record_generation(&mut ws, &[0], &[]),
            Err(ResampleError::UnpairedLost {
                lost: 1,
                sources: 0
            })
        );
        assert_eq!(
            tree.record_generation(&mut ws, &[0], &[2]),
            Err(ResampleError::IndexOutOfRange { index: 2, count: 2 })
        );
        assert_eq!(tree.len(), before);
        assert_eq!(ws[0].id, 0);
    }
}
