//! Scored search results.

use std::cmp::Ordering;

/// A match returned from vector search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorMatch {
    /// Record id.
    pub id: u64,
    /// Distance (lower = more similar).
    pub distance: f32,
}

impl VectorMatch {
    pub fn new(id: u64, distance: f32) -> Self {
        Self { id, distance }
    }
}

impl Eq for VectorMatch {}

impl PartialOrd for VectorMatch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VectorMatch {
    /// Ascending distance, ties broken by ascending id.
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}
