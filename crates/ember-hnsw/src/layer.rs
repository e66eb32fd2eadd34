//! Per-layer HNSW helpers: level assignment and neighbor selection.

use crate::graph::{Node, NodeId};
use ember_vector::DistanceFunction;
use rand::Rng;
use std::cmp::Ordering;
use std::sync::Arc;

/// A node reached during a layer search, scored against the query.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub nid: NodeId,
    pub node: Arc<Node>,
    pub distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    /// Ascending distance, ties broken by record id.
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.node.id.cmp(&other.node.id))
    }
}

/// Generate a random layer for a new node.
///
/// Uses the formula: floor(-ln(uniform(0,1)) * m_L)
/// where m_L = 1/ln(M).
///
/// This gives exponential distribution where probability of
/// being at layer L is roughly 1/M^L.
pub fn random_layer<R: Rng + ?Sized>(rng: &mut R, m: usize, max_layers: usize) -> usize {
    let m_l = 1.0 / (m as f64).ln();

    let uniform: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0); // Avoid ln(0)

    let layer = (-uniform.ln() * m_l).floor() as usize;
    layer.min(max_layers.saturating_sub(1))
}

/// Select up to `m` neighbors with the diversity heuristic.
///
/// `candidates` must be sorted by distance to the base node. A candidate is
/// kept only if no already-kept neighbor is closer to it than the base is;
/// if that leaves fewer than `m`, the closest discarded candidates fill in.
pub fn select_neighbors(
    distance: DistanceFunction,
    candidates: &[Candidate],
    m: usize,
) -> Vec<Candidate> {
    let mut kept: Vec<Candidate> = Vec::with_capacity(m);
    let mut discarded: Vec<&Candidate> = Vec::new();

    for candidate in candidates {
        if kept.len() >= m {
            break;
        }

        let covered = kept.iter().any(|existing| {
            distance.distance(&candidate.node.vector, &existing.node.vector) < candidate.distance
        });

        if covered {
            discarded.push(candidate);
        } else {
            kept.push(candidate.clone());
        }
    }

    for candidate in discarded {
        if kept.len() >= m {
            break;
        }
        kept.push(candidate.clone());
    }

    kept
}
