//! Distance functions for vector similarity.
//!
//! Provides the three metrics a deployment may choose from:
//! - **Squared Euclidean (L2)**: straight-line distance without the sqrt
//! - **Cosine**: 1 - cosine similarity, good for normalized embeddings
//! - **Inner Product**: negated dot product, for maximum inner product search
//!
//! All three return "lower = more similar", so every index and scan in the
//! workspace sorts ascending regardless of the metric.

use crate::VectorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Distance function enumeration.
///
/// Chosen once per deployment; the index and every query must agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceFunction {
    /// Squared Euclidean distance: sum((a[i] - b[i])^2)
    #[serde(alias = "l2", alias = "euclidean")]
    SquaredEuclidean,
    /// Cosine distance: 1 - (a · b) / (||a|| * ||b||)
    Cosine,
    /// Inner product (negative for distance): -(a · b)
    #[serde(alias = "dot", alias = "ip")]
    InnerProduct,
}

impl Default for DistanceFunction {
    fn default() -> Self {
        Self::Cosine
    }
}

impl DistanceFunction {
    /// Compute distance between two vectors.
    ///
    /// Returns a distance value where lower = more similar.
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::SquaredEuclidean => euclidean_distance_squared(a, b),
            Self::Cosine => cosine_distance(a, b),
            Self::InnerProduct => -inner_product(a, b),
        }
    }

    /// Stable short name, used in config files and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SquaredEuclidean => "l2",
            Self::Cosine => "cosine",
            Self::InnerProduct => "dot",
        }
    }
}

impl fmt::Display for DistanceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceFunction {
    type Err = VectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l2" | "euclidean" | "squared_euclidean" => Ok(Self::SquaredEuclidean),
            "cosine" => Ok(Self::Cosine),
            "dot" | "ip" | "inner_product" => Ok(Self::InnerProduct),
            other => Err(VectorError::UnknownDistance(other.to_string())),
        }
    }
}

/// Compute squared Euclidean distance.
///
/// k-NN search only needs relative ordering, so the sqrt is skipped.
///
/// # Example
///
/// ```
/// use ember_vector::euclidean_distance_squared;
///
/// let a = [0.0, 0.0];
/// let b = [3.0, 4.0];
/// assert!((euclidean_distance_squared(&a, &b) - 25.0).abs() < 0.001);
/// ```
#[inline]
pub fn euclidean_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    // Process in chunks of 4 for better auto-vectorization
    let mut sum = 0.0f32;
    let chunks = a.len() / 4;

    for i in 0..chunks {
        let base = i * 4;
        let d0 = a[base] - b[base];
        let d1 = a[base + 1] - b[base + 1];
        let d2 = a[base + 2] - b[base + 2];
        let d3 = a[base + 3] - b[base + 3];
        sum += d0 * d0 + d1 * d1 + d2 * d2 + d3 * d3;
    }

    for i in (chunks * 4)..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }

    sum
}

/// Compute cosine distance between two vectors.
///
/// Returns a value in [0, 2] where:
/// - 0 = identical direction
/// - 1 = orthogonal
/// - 2 = opposite direction
///
/// # Example
///
/// ```
/// use ember_vector::cosine_distance;
///
/// let a = [1.0, 0.0];
/// let b = [0.0, 1.0];
/// assert!((cosine_distance(&a, &b) - 1.0).abs() < 0.001);
/// ```
#[inline]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    let (dot, norm_a, norm_b) = dot_and_norms(a, b);

    let denom = (norm_a * norm_b).sqrt();
    if denom < f32::EPSILON {
        return 1.0; // Undefined for zero vectors, return orthogonal
    }

    // Clamp to [-1, 1] to absorb floating point error
    let similarity = (dot / denom).clamp(-1.0, 1.0);

    1.0 - similarity
}

/// Compute inner product (dot product) of two vectors.
///
/// Higher values indicate more similarity; `DistanceFunction::InnerProduct`
/// negates it.
#[inline]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    let mut sum = 0.0f32;
    let chunks = a.len() / 4;

    for i in 0..chunks {
        let base = i * 4;
        sum += a[base] * b[base]
            + a[base + 1] * b[base + 1]
            + a[base + 2] * b[base + 2]
            + a[base + 3] * b[base + 3];
    }

    for i in (chunks * 4)..a.len() {
        sum += a[i] * b[i];
    }

    sum
}

/// Compute dot product and squared norms in a single pass.
///
/// Returns (dot, norm_a_squared, norm_b_squared)
#[inline]
fn dot_and_norms(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    let chunks = a.len() / 4;

    for i in 0..chunks {
        let base = i * 4;

        dot += a[base] * b[base]
            + a[base + 1] * b[base + 1]
            + a[base + 2] * b[base + 2]
            + a[base + 3] * b[base + 3];

        norm_a += a[base] * a[base]
            + a[base + 1] * a[base + 1]
            + a[base + 2] * a[base + 2]
            + a[base + 3] * a[base + 3];

        norm_b += b[base] * b[base]
            + b[base + 1] * b[base + 1]
            + b[base + 2] * b[base + 2]
            + b[base + 3] * b[base + 3];
    }

    for i in (chunks * 4)..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }

    (dot, norm_a, norm_b)
}
