//! ember-engine: the query engine.
//!
//! Owns a [`RecordStore`](ember_store::RecordStore) and an
//! [`HnswIndex`](ember_hnsw::HnswIndex) and keeps the index in step with the
//! store. Searches go through the index, or through an exact scan when the
//! index is disabled or too small to be worth it.
//!
//! # Example
//!
//! ```
//! use ember_engine::{Engine, EngineConfig};
//!
//! let engine = Engine::open(EngineConfig::in_memory(3)).unwrap();
//! engine.insert("cat", vec![1.0, 0.0, 0.0]).unwrap();
//! engine.insert("dog", vec![0.9, 0.1, 0.0]).unwrap();
//!
//! let hits = engine.search(&[1.0, 0.0, 0.0], 1, None).unwrap();
//! assert_eq!(hits[0].text, "cat");
//! ```

mod config;
mod engine;
mod indexer;

pub use config::{EngineConfig, IndexingPolicy};
pub use engine::{Engine, EngineStats, SearchHit, INDEX_FILE_NAME};

pub use ember_hnsw::HnswConfig;
pub use ember_store::{CompactionStats, EmbeddingRecord, FsyncPolicy};
pub use ember_vector::DistanceFunction;
pub use tokio_util::sync::CancellationToken;

use ember_hnsw::HnswError;
use ember_store::StoreError;
use ember_vector::VectorError;

/// Errors returned by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Record {0} not found")]
    NotFound(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(StoreError),

    #[error("Index error: {0}")]
    Index(HnswError),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DimensionMismatch { expected, actual } => {
                EngineError::DimensionMismatch { expected, actual }
            }
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::InvalidVector(msg) | StoreError::InvalidConfig(msg) => {
                EngineError::InvalidArgument(msg)
            }
            other => EngineError::Storage(other),
        }
    }
}

impl From<HnswError> for EngineError {
    fn from(e: HnswError) -> Self {
        match e {
            HnswError::Cancelled => EngineError::Cancelled,
            HnswError::Vector(v) => v.into(),
            HnswError::InvalidConfig(msg) => EngineError::InvalidArgument(msg),
            other => EngineError::Index(other),
        }
    }
}

impl From<VectorError> for EngineError {
    fn from(e: VectorError) -> Self {
        match e {
            VectorError::DimensionMismatch { expected, actual } => {
                EngineError::DimensionMismatch { expected, actual }
            }
            VectorError::InvalidVector(msg) | VectorError::UnknownDistance(msg) => {
                EngineError::InvalidArgument(msg)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
