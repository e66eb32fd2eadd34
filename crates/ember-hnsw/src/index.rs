//! HNSW index implementation.
//!
//! Implements the Hierarchical Navigable Small World algorithm for
//! approximate nearest neighbor search over record ids.

use crate::graph::{Node, NodeId};
use crate::layer::{random_layer, select_neighbors, Candidate};
use crate::{HnswError, Result};
use ember_vector::{validate_vector, DistanceFunction, VectorMatch};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// HNSW configuration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswConfig {
    /// Max connections per node (M parameter).
    /// Default: 16
    pub m: usize,

    /// Max connections in layer 0 (M_max0 = 2*M).
    /// Default: 32
    pub m_max0: usize,

    /// Beam width during construction (ef_construction).
    /// Higher = better quality, slower build.
    /// Default: 200
    pub ef_construction: usize,

    /// Beam width during search (ef_search).
    /// Higher = better recall, slower search.
    /// Default: 100
    pub ef_search: usize,

    /// Maximum number of layers.
    /// Default: 16 (supports ~10^7 vectors)
    pub max_layers: usize,

    /// Seed for level assignment. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            m_max0: 32,
            ef_construction: 200,
            ef_search: 100,
            max_layers: 16,
            seed: None,
        }
    }
}

impl HnswConfig {
    /// Config with `m_max0 = 2 * m`.
    pub fn with_m(m: usize) -> Self {
        Self {
            m,
            m_max0: m * 2,
            ..Default::default()
        }
    }

    /// Rejects unusable parameters and clamps the ones that only degrade recall.
    pub fn validated(mut self) -> Result<Self> {
        if self.m < 2 {
            return Err(HnswError::InvalidConfig(format!(
                "m must be at least 2, got {}",
                self.m
            )));
        }
        if self.max_layers == 0 {
            return Err(HnswError::InvalidConfig(
                "max_layers must be at least 1".into(),
            ));
        }
        if self.m_max0 < self.m {
            tracing::warn!(m = self.m, m_max0 = self.m_max0, "m_max0 below m, clamping");
            self.m_max0 = self.m;
        }
        if self.ef_construction < self.m {
            tracing::warn!(
                m = self.m,
                ef_construction = self.ef_construction,
                "ef_construction below m, clamping"
            );
            self.ef_construction = self.m;
        }
        if self.ef_search == 0 {
            tracing::warn!("ef_search is zero, clamping to 1");
            self.ef_search = 1;
        }
        Ok(self)
    }
}

/// The node every search starts from, and the top layer it lives on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryPoint {
    pub(crate) nid: NodeId,
    pub(crate) level: usize,
}

/// HNSW index.
///
/// Thread-safe: inserts, deletes and searches may run concurrently from
/// any number of threads.
pub struct HnswIndex {
    pub(crate) config: HnswConfig,
    pub(crate) dimensions: usize,
    pub(crate) distance: DistanceFunction,

    /// Node storage, indexed by internal id. Append-only until `clear`.
    pub(crate) nodes: RwLock<Vec<Arc<Node>>>,

    /// Record id -> internal id.
    pub(crate) id_map: RwLock<HashMap<u64, NodeId>>,

    pub(crate) entry_point: RwLock<Option<EntryPoint>>,

    pub(crate) live: AtomicUsize,
    pub(crate) tombstones: AtomicUsize,

    rng: Mutex<StdRng>,
}

impl HnswIndex {
    /// Create a new HNSW index.
    ///
    /// # Arguments
    ///
    /// * `dimensions` - Vector dimensions
    /// * `distance` - Distance function to use
    /// * `config` - HNSW configuration parameters
    pub fn new(dimensions: usize, distance: DistanceFunction, config: HnswConfig) -> Result<Self> {
        if dimensions == 0 {
            return Err(HnswError::InvalidConfig(
                "dimensions must be greater than zero".into(),
            ));
        }
        let config = config.validated()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            config,
            dimensions,
            distance,
            nodes: RwLock::new(Vec::new()),
            id_map: RwLock::new(HashMap::new()),
            entry_point: RwLock::new(None),
            live: AtomicUsize::new(0),
            tombstones: AtomicUsize::new(0),
            rng: Mutex::new(rng),
        })
    }

    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn distance_function(&self) -> DistanceFunction {
        self.distance
    }

    /// Insert a vector under a record id.
    ///
    /// Returns after the node is linked at every layer it lives on.
    pub fn insert(&self, id: u64, vector: impl Into<Arc<[f32]>>) -> Result<()> {
        let vector: Arc<[f32]> = vector.into();
        validate_vector(self.dimensions, &vector)?;

        let level = random_layer(&mut *self.rng.lock(), self.config.m, self.config.max_layers);
        let node = Arc::new(Node::new(id, vector, level));
        let nid = self.register(node.clone())?;

        self.link(nid, &node)
    }

    /// Tombstone a record id. Returns true if it was live.
    ///
    /// The node stays in the graph as a waypoint for other searches.
    pub fn delete(&self, id: u64) -> bool {
        let nid = match self.id_map.read().get(&id) {
            Some(&nid) => nid,
            None => return false,
        };

        match self.node(nid) {
            Some(node) if node.tombstone() => {
                self.live.fetch_sub(1, Ordering::Relaxed);
                self.tombstones.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// k nearest live records with the configured `ef_search`.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<VectorMatch>> {
        self.search_with_ef(query, k, self.config.ef_search, cancel)
    }

    /// k nearest live records, sorted by ascending distance then id.
    ///
    /// `ef` below `k` is raised to `k`. If tombstones crowd live nodes out
    /// of the beam, `ef` doubles until `k` live results are found or every
    /// node has been considered.
    pub fn search_with_ef(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<VectorMatch>> {
        validate_vector(self.dimensions, query)?;

        if cancel.is_cancelled() {
            return Err(HnswError::Cancelled);
        }

        let live = self.len();
        if k == 0 || live == 0 {
            return Ok(Vec::new());
        }

        let entry = match *self.entry_point.read() {
            Some(entry) => entry,
            None => return Ok(Vec::new()),
        };
        let entry_node = match self.node(entry.nid) {
            Some(node) => node,
            None => return Ok(Vec::new()),
        };

        let mut ef = ef.max(1);
        if ef < k {
            tracing::warn!(ef, k, "ef_search below k, clamping");
            ef = k;
        }

        // Greedy descent to layer 1
        let mut ep = vec![self.score(query, entry.nid, entry_node)];
        for layer in (1..=entry.level).rev() {
            let found = self.search_layer(query, &ep, 1, layer, Some(cancel))?;
            if let Some(best) = found.into_iter().next() {
                ep = vec![best];
            }
        }

        let node_count = self.node_count();
        let wanted = k.min(live);

        loop {
            let found = self.search_layer(query, &ep, ef, 0, Some(cancel))?;
            let results: Vec<VectorMatch> = found
                .iter()
                .filter(|c| !c.node.is_tombstoned())
                .take(k)
                .map(|c| VectorMatch::new(c.node.id, c.distance))
                .collect();

            if results.len() >= wanted || ef >= node_count {
                return Ok(results);
            }

            ef = (ef * 2).min(node_count);
            tracing::debug!(ef, found = results.len(), k, "Widening beam past tombstones");
        }
    }

    /// Whether `id` is indexed and live.
    pub fn contains(&self, id: u64) -> bool {
        self.lookup(id).map_or(false, |node| !node.is_tombstoned())
    }

    /// Whether `id` has a node, live or tombstoned.
    pub fn is_indexed(&self, id: u64) -> bool {
        self.id_map.read().contains_key(&id)
    }

    /// Vector stored for `id`, live or tombstoned.
    pub fn get(&self, id: u64) -> Option<Arc<[f32]>> {
        self.lookup(id).map(|node| node.vector.clone())
    }

    /// Live record ids, ascending.
    pub fn live_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .nodes
            .read()
            .iter()
            .filter(|n| !n.is_tombstoned())
            .map(|n| n.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of live (non-tombstoned) nodes.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of nodes in the graph, tombstones included.
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.load(Ordering::Relaxed)
    }

    /// Drop every node.
    pub fn clear(&self) {
        let mut id_map = self.id_map.write();
        let mut nodes = self.nodes.write();
        let mut entry_point = self.entry_point.write();

        id_map.clear();
        nodes.clear();
        *entry_point = None;
        self.live.store(0, Ordering::Relaxed);
        self.tombstones.store(0, Ordering::Relaxed);
    }

    pub(crate) fn node(&self, nid: NodeId) -> Option<Arc<Node>> {
        self.nodes.read().get(nid as usize).cloned()
    }

    fn lookup(&self, id: u64) -> Option<Arc<Node>> {
        let nid = *self.id_map.read().get(&id)?;
        self.node(nid)
    }

    /// Max neighbors per node at `layer`.
    fn capacity(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.m_max0
        } else {
            self.config.m
        }
    }

    fn score(&self, query: &[f32], nid: NodeId, node: Arc<Node>) -> Candidate {
        let distance = self.distance.distance(query, &node.vector);
        Candidate {
            nid,
            node,
            distance,
        }
    }

    /// Add a node to the table and id map.
    pub(crate) fn register(&self, node: Arc<Node>) -> Result<NodeId> {
        let mut id_map = self.id_map.write();
        if id_map.contains_key(&node.id) {
            return Err(HnswError::DuplicateId(node.id));
        }

        let mut nodes = self.nodes.write();
        let nid = nodes.len() as NodeId;
        id_map.insert(node.id, nid);
        if node.is_tombstoned() {
            self.tombstones.fetch_add(1, Ordering::Relaxed);
        } else {
            self.live.fetch_add(1, Ordering::Relaxed);
        }
        nodes.push(node);

        Ok(nid)
    }

    /// Connect a registered node into the graph.
    fn link(&self, nid: NodeId, node: &Arc<Node>) -> Result<()> {
        let entry = {
            let mut entry_point = self.entry_point.write();
            match *entry_point {
                Some(entry) => entry,
                None => {
                    *entry_point = Some(EntryPoint {
                        nid,
                        level: node.level,
                    });
                    return Ok(());
                }
            }
        };

        let entry_node = match self.node(entry.nid) {
            Some(n) => n,
            None => return Ok(()),
        };
        let query = &node.vector;
        let mut ep = vec![self.score(query, entry.nid, entry_node)];

        // Greedy descent through the layers above the new node
        for layer in (node.level + 1..=entry.level).rev() {
            let found = self.search_layer(query, &ep, 1, layer, None)?;
            if let Some(best) = found.into_iter().next() {
                ep = vec![best];
            }
        }

        for layer in (0..=node.level.min(entry.level)).rev() {
            let candidates: Vec<Candidate> = self
                .search_layer(query, &ep, self.config.ef_construction, layer, None)?
                .into_iter()
                .filter(|c| c.nid != nid)
                .collect();

            let selected = select_neighbors(self.distance, &candidates, self.capacity(layer));

            if let Some(list) = node.layer(layer) {
                let mut list = list.write();
                for neighbor in &selected {
                    list.add(neighbor.nid);
                }
            }

            for neighbor in &selected {
                self.connect(neighbor, nid, layer);
            }

            if !candidates.is_empty() {
                ep = candidates;
            }
        }

        if node.level > entry.level {
            let mut entry_point = self.entry_point.write();
            if entry_point.map_or(true, |e| node.level > e.level) {
                *entry_point = Some(EntryPoint {
                    nid,
                    level: node.level,
                });
            }
        }

        Ok(())
    }

    /// Add the edge `neighbor -> new_nid`, pruning `neighbor`'s list if it
    /// overflows. Only `neighbor`'s outgoing edges are dropped; the pruned
    /// nodes keep their own lists.
    fn connect(&self, neighbor: &Candidate, new_nid: NodeId, layer: usize) {
        let list = match neighbor.node.layer(layer) {
            Some(list) => list,
            None => return,
        };
        let cap = self.capacity(layer);

        let mut list = list.write();
        if !list.add(new_nid) || list.len() <= cap {
            return;
        }

        let base = &neighbor.node.vector;
        let mut scored: Vec<Candidate> = {
            let nodes = self.nodes.read();
            list.ids
                .iter()
                .filter_map(|&id| {
                    nodes.get(id as usize).map(|n| Candidate {
                        nid: id,
                        distance: self.distance.distance(base, &n.vector),
                        node: n.clone(),
                    })
                })
                .collect()
        };
        scored.sort();

        let keep = select_neighbors(self.distance, &scored, cap);
        list.ids = keep.iter().map(|c| c.nid).collect();
    }

    /// Beam search within a single layer.
    ///
    /// Returns up to `ef` candidates sorted by distance (closest first).
    /// Holds no neighbor-list lock across iterations.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[Candidate],
        ef: usize,
        layer: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Candidate>> {
        // Min-heap for candidates (closest first)
        let mut candidates: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        // Max-heap for results (furthest first, for pruning)
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();
        let mut visited: HashSet<NodeId> = HashSet::new();

        for ep in entry_points {
            if visited.insert(ep.nid) {
                candidates.push(Reverse(ep.clone()));
                results.push(ep.clone());
            }
        }
        while results.len() > ef {
            results.pop();
        }

        while let Some(Reverse(current)) = candidates.pop() {
            if cancel.map_or(false, |c| c.is_cancelled()) {
                return Err(HnswError::Cancelled);
            }

            // Stop if current is worse than worst in results (and results is full)
            if results.len() >= ef {
                if let Some(worst) = results.peek() {
                    if current.distance > worst.distance {
                        break;
                    }
                }
            }

            let neighbor_ids = current.node.neighbors(layer);
            let fresh: Vec<(NodeId, Arc<Node>)> = {
                let nodes = self.nodes.read();
                neighbor_ids
                    .into_iter()
                    .filter(|id| visited.insert(*id))
                    .filter_map(|id| nodes.get(id as usize).map(|n| (id, n.clone())))
                    .collect()
            };

            for (nid, node) in fresh {
                let candidate = self.score(query, nid, node);

                let should_add = results.len() < ef
                    || results
                        .peek()
                        .map(|w| candidate < *w)
                        .unwrap_or(true);

                if should_add {
                    candidates.push(Reverse(candidate.clone()));
                    results.push(candidate);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        Ok(results.into_sorted_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_index() -> HnswIndex {
        let config = HnswConfig {
            m: 8,
            m_max0: 16,
            ef_construction: 50,
            ef_search: 20,
            max_layers: 8,
            seed: Some(42),
        };
        HnswIndex::new(3, DistanceFunction::SquaredEuclidean, config).unwrap()
    }

    fn never() -> CancellationToken {
        CancellationToken::new()
    }

    #[test]
    fn test_insert_and_get() {
        let index = create_test_index();

        index.insert(1, vec![1.0, 2.0, 3.0]).unwrap();
        index.insert(2, vec![4.0, 5.0, 6.0]).unwrap();

        assert_eq!(index.len(), 2);
        assert!(index.contains(1));
        assert_eq!(&*index.get(1).unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let index = create_test_index();
        index.insert(1, vec![1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(
            index.insert(1, vec![0.0, 0.0, 0.0]),
            Err(HnswError::DuplicateId(1))
        ));
        assert_eq!(index.node_count(), 1);
    }

    #[test]
    fn test_search_basic() {
        let index = create_test_index();

        index.insert(1, vec![0.0, 0.0, 0.0]).unwrap();
        index.insert(2, vec![1.0, 1.0, 1.0]).unwrap();
        index.insert(3, vec![10.0, 10.0, 10.0]).unwrap();

        let results = index.search(&[0.0, 0.0, 0.0], 3, &never()).unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, 1);
        assert!(results[0].distance < 0.001);
        assert_eq!(results[2].id, 3);
    }

    #[test]
    fn test_search_accuracy() {
        let index = create_test_index();

        for i in 0..20u64 {
            index.insert(i, vec![i as f32, 0.0, 0.0]).unwrap();
        }

        let results = index.search(&[5.0, 0.0, 0.0], 3, &never()).unwrap();
        assert_eq!(results[0].id, 5);

        let ids: Vec<_> = results.iter().map(|r| r.id).collect();
        assert!(ids.contains(&4) && ids.contains(&6));
    }

    #[test]
    fn test_ties_ordered_by_id() {
        let index = create_test_index();
        index.insert(9, vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(3, vec![-1.0, 0.0, 0.0]).unwrap();
        index.insert(5, vec![0.0, 1.0, 0.0]).unwrap();

        let results = index.search(&[0.0, 0.0, 0.0], 3, &never()).unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 5, 9]);
    }

    #[test]
    fn test_delete_tombstones() {
        let index = create_test_index();

        index.insert(1, vec![1.0, 2.0, 3.0]).unwrap();
        index.insert(2, vec![4.0, 5.0, 6.0]).unwrap();

        assert!(index.delete(1));
        assert!(!index.delete(1));
        assert!(!index.delete(99));
        assert!(!index.contains(1));
        assert!(index.is_indexed(1));
        assert_eq!(index.len(), 1);
        assert_eq!(index.node_count(), 2);
        assert_eq!(index.tombstone_count(), 1);

        let results = index.search(&[1.0, 2.0, 3.0], 5, &never()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 2);
    }

    #[test]
    fn test_search_widens_past_tombstones() {
        let config = HnswConfig {
            m: 4,
            m_max0: 8,
            ef_construction: 16,
            ef_search: 2,
            max_layers: 4,
            seed: Some(1),
        };
        let index = HnswIndex::new(2, DistanceFunction::SquaredEuclidean, config).unwrap();

        for i in 0..50u64 {
            index.insert(i, vec![i as f32, 0.0]).unwrap();
        }
        // Tombstone everything near the query
        for i in 0..45u64 {
            index.delete(i);
        }

        let results = index.search(&[0.0, 0.0], 3, &never()).unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![45, 46, 47]);
    }

    #[test]
    fn test_empty_index() {
        let index = create_test_index();
        let results = index.search(&[1.0, 2.0, 3.0], 5, &never()).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_dimension_mismatch() {
        let index = create_test_index();

        assert!(matches!(
            index.insert(1, vec![1.0, 2.0]),
            Err(HnswError::Vector(_))
        ));
        assert!(index.is_empty());

        index.insert(1, vec![1.0, 2.0, 3.0]).unwrap();
        assert!(index.search(&[1.0], 1, &never()).is_err());
    }

    #[test]
    fn test_cancelled_search() {
        let index = create_test_index();
        index.insert(1, vec![1.0, 2.0, 3.0]).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            index.search(&[1.0, 2.0, 3.0], 1, &token),
            Err(HnswError::Cancelled)
        ));
    }

    #[test]
    fn test_clear() {
        let index = create_test_index();
        index.insert(1, vec![1.0, 2.0, 3.0]).unwrap();
        index.delete(1);
        index.clear();

        assert_eq!(index.node_count(), 0);
        assert_eq!(index.tombstone_count(), 0);
        index.insert(1, vec![1.0, 2.0, 3.0]).unwrap();
        assert!(index.contains(1));
    }

    #[test]
    fn test_config_clamping() {
        let config = HnswConfig {
            m: 16,
            ef_construction: 4,
            ..Default::default()
        }
        .validated()
        .unwrap();
        assert_eq!(config.ef_construction, 16);

        assert!(HnswConfig::with_m(1).validated().is_err());
        assert!(HnswConfig {
            max_layers: 0,
            ..Default::default()
        }
        .validated()
        .is_err());
    }

    #[test]
    fn test_small_m_keeps_every_node_linked() {
        for m in [2, 3] {
            let config = HnswConfig {
                m,
                m_max0: m * 2,
                ef_construction: 32,
                ef_search: 16,
                max_layers: 4,
                seed: Some(9),
            };
            let index = HnswIndex::new(2, DistanceFunction::SquaredEuclidean, config).unwrap();
            for i in 0..500u64 {
                let angle = i as f32 * 0.37;
                index.insert(i, vec![angle.cos() * i as f32, angle.sin()]).unwrap();
            }

            let nodes = index.nodes.read().clone();
            for (nid, node) in nodes.iter().enumerate() {
                for layer in 0..=node.level {
                    let neighbors = node.neighbors(layer);
                    assert!(neighbors.len() <= index.capacity(layer));
                    assert!(!neighbors.contains(&(nid as NodeId)));
                }
                // Pruning keeps `capacity` entries, so no list is ever emptied.
                assert!(
                    !node.neighbors(0).is_empty(),
                    "m={} node {} has no layer-0 edges",
                    m,
                    nid
                );
            }
        }
    }
}
