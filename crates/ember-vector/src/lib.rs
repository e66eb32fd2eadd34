//! Vector primitives for the Ember embedding store.
//!
//! This crate provides the pieces shared by the record store, the HNSW index
//! and the query engine:
//!
//! - **Distance functions**: squared Euclidean (L2), Cosine, negative Inner Product
//! - **VectorMatch**: a scored result, ordered by distance then id
//! - **ExactScan / TopK**: linear-scan search with a bounded heap, used as
//!   the exact fallback when the approximate index is absent or small
//!
//! # Example
//!
//! ```
//! use ember_vector::{DistanceFunction, ExactScan};
//!
//! let scan = ExactScan::new(3, DistanceFunction::Cosine);
//! let vectors = vec![(1u64, vec![1.0, 0.0, 0.0]), (2, vec![0.0, 1.0, 0.0])];
//!
//! let results = scan
//!     .search(&[1.0, 0.0, 0.0], 1, vectors.iter().map(|(id, v)| (*id, v.as_slice())))
//!     .unwrap();
//! assert_eq!(results[0].id, 1);
//! ```

mod brute;
mod distance;
mod matches;

pub use brute::{ExactScan, TopK};
pub use distance::{
    cosine_distance, euclidean_distance_squared, inner_product, DistanceFunction,
};
pub use matches::VectorMatch;

/// Error type for vector operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector: {0}")]
    InvalidVector(String),

    #[error("Unknown distance function: {0}")]
    UnknownDistance(String),
}

/// Result type for vector operations.
pub type Result<T> = std::result::Result<T, VectorError>;

/// Validate a vector's dimension and values.
///
/// Dimension is checked first so a wrong-length vector always reports
/// `DimensionMismatch`, whatever its contents.
pub fn validate_vector(dimensions: usize, vector: &[f32]) -> Result<()> {
    if vector.len() != dimensions {
        return Err(VectorError::DimensionMismatch {
            expected: dimensions,
            actual: vector.len(),
        });
    }

    for (i, &v) in vector.iter().enumerate() {
        if v.is_nan() {
            return Err(VectorError::InvalidVector(format!("NaN at index {}", i)));
        }
        if v.is_infinite() {
            return Err(VectorError::InvalidVector(format!("Inf at index {}", i)));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_vector() {
        assert!(validate_vector(3, &[1.0, 2.0, 3.0]).is_ok());

        let err = validate_vector(3, &[1.0, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            VectorError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));

        // Wrong length wins over bad values
        let err = validate_vector(3, &[f32::NAN]).unwrap_err();
        assert!(matches!(err, VectorError::DimensionMismatch { .. }));

        assert!(matches!(
            validate_vector(2, &[1.0, f32::NAN]),
            Err(VectorError::InvalidVector(_))
        ));
        assert!(matches!(
            validate_vector(2, &[f32::INFINITY, 1.0]),
            Err(VectorError::InvalidVector(_))
        ));
    }
}
