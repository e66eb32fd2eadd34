//! Exact (brute force) top-k search.
//!
//! Linear scan - O(n * d) but exact. The query engine uses it whenever the
//! approximate index is disabled or too small to be worth consulting, which
//! keeps small deployments correct by construction.

use crate::distance::DistanceFunction;
use crate::matches::VectorMatch;
use crate::{validate_vector, Result};
use std::collections::BinaryHeap;

/// Bounded collector that keeps the `k` best matches seen so far.
///
/// Backed by a max-heap so the current worst match is evicted in O(log k).
#[derive(Debug)]
pub struct TopK {
    k: usize,
    heap: BinaryHeap<VectorMatch>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.saturating_add(1).min(4096)),
        }
    }

    /// Offer a match; keeps it only if it beats the current worst.
    pub fn push(&mut self, candidate: VectorMatch) {
        if self.k == 0 {
            return;
        }
        if self.heap.len() < self.k {
            self.heap.push(candidate);
            return;
        }
        if let Some(worst) = self.heap.peek() {
            if candidate < *worst {
                self.heap.pop();
                self.heap.push(candidate);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Matches sorted by ascending distance, ties by ascending id.
    pub fn into_sorted_vec(self) -> Vec<VectorMatch> {
        self.heap.into_sorted_vec()
    }
}

/// Exact linear-scan searcher.
///
/// Stateless apart from its dimension and metric: the caller supplies the
/// candidate vectors, so the same scanner works over the record store, a
/// slice, or any other iterator of `(id, vector)` pairs.
#[derive(Debug, Clone, Copy)]
pub struct ExactScan {
    dimensions: usize,
    distance: DistanceFunction,
}

impl ExactScan {
    /// Create a new exact scanner.
    ///
    /// # Example
    ///
    /// ```
    /// use ember_vector::{DistanceFunction, ExactScan};
    ///
    /// let scan = ExactScan::new(768, DistanceFunction::Cosine);
    /// assert_eq!(scan.dimensions(), 768);
    /// ```
    pub fn new(dimensions: usize, distance: DistanceFunction) -> Self {
        Self {
            dimensions,
            distance,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn distance_function(&self) -> DistanceFunction {
        self.distance
    }

    /// Score a single candidate against the query.
    #[inline]
    pub fn score(&self, query: &[f32], id: u64, vector: &[f32]) -> VectorMatch {
        VectorMatch::new(id, self.distance.distance(query, vector))
    }

    /// Return the `k` nearest candidates, sorted by distance (ascending).
    ///
    /// Candidates with a different dimension are skipped; the stores feeding
    /// this scanner enforce the dimension at insert time.
    pub fn search<'a, I>(&self, query: &[f32], k: usize, candidates: I) -> Result<Vec<VectorMatch>>
    where
        I: IntoIterator<Item = (u64, &'a [f32])>,
    {
        validate_vector(self.dimensions, query)?;

        let mut top = TopK::new(k);
        for (id, vector) in candidates {
            if vector.len() != self.dimensions {
                continue;
            }
            top.push(self.score(query, id, vector));
        }

        Ok(top.into_sorted_vec())
    }
}
