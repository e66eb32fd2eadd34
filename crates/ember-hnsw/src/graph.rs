//! Graph data structures for HNSW.
//!
//! Nodes own their adjacency: one neighbor list per layer they live on,
//! each guarded by its own lock.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Internal node ID (dense, for array indexing).
pub type NodeId = u32;

/// A node in the HNSW graph.
#[derive(Debug)]
pub struct Node {
    /// Record id.
    pub id: u64,
    /// The vector data, shared with whoever built the node.
    pub vector: Arc<[f32]>,
    /// The highest layer this node lives on.
    pub level: usize,
    /// Neighbor lists, index 0 = bottom layer.
    layers: Vec<RwLock<Neighbors>>,
    tombstoned: AtomicBool,
}

impl Node {
    pub fn new(id: u64, vector: Arc<[f32]>, level: usize) -> Self {
        Self {
            id,
            vector,
            level,
            layers: (0..=level).map(|_| RwLock::new(Neighbors::new())).collect(),
            tombstoned: AtomicBool::new(false),
        }
    }

    /// The neighbor list at `layer`, if the node lives on it.
    pub fn layer(&self, layer: usize) -> Option<&RwLock<Neighbors>> {
        self.layers.get(layer)
    }

    /// Copy of the neighbor ids at `layer`. The lock is released on return.
    pub fn neighbors(&self, layer: usize) -> Vec<NodeId> {
        self.layers
            .get(layer)
            .map(|l| l.read().ids.clone())
            .unwrap_or_default()
    }

    pub fn set_neighbors(&self, layer: usize, ids: Vec<NodeId>) {
        if let Some(l) = self.layers.get(layer) {
            l.write().ids = ids;
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned.load(Ordering::Acquire)
    }

    /// Marks the node deleted. Returns true if it was live.
    pub fn tombstone(&self) -> bool {
        !self.tombstoned.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn restore_tombstone(&self, tombstoned: bool) {
        self.tombstoned.store(tombstoned, Ordering::Release);
    }
}

/// Neighbor list for a node at a specific layer.
#[derive(Debug, Clone, Default)]
pub struct Neighbors {
    pub ids: Vec<NodeId>,
}

impl Neighbors {
    pub fn new() -> Self {
        Self { ids: Vec::new() }
    }

    /// Add a neighbor. Returns false if already present.
    pub fn add(&mut self, id: NodeId) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    /// Remove a neighbor. Returns false if not found.
    pub fn remove(&mut self, id: NodeId) -> bool {
        if let Some(pos) = self.ids.iter().position(|&x| x == id) {
            self.ids.swap_remove(pos);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
