//! HNSW (Hierarchical Navigable Small World) index for Ember.
//!
//! Provides approximate nearest neighbor (ANN) search over record ids using
//! the HNSW algorithm. HNSW builds a multi-layer graph where:
//!
//! - Higher layers have fewer nodes (exponential decay)
//! - Each layer is a navigable small-world graph
//! - Search starts at the top layer and descends
//!
//! # Concurrency
//!
//! Every node owns one neighbor list per layer, each behind its own
//! `RwLock`. Inserts and searches take at most one neighbor-list lock at a
//! time, so inserts proceed concurrently with each other and with searches.
//!
//! # Deletion
//!
//! Deletes are tombstones: the node stays in the graph as a waypoint and is
//! filtered from results. Rebuilding the index from its source drops them.
//!
//! # Parameters
//!
//! - `M`: Max connections per node per layer (default: 16, layer 0 uses 2*M)
//! - `ef_construction`: Beam width during index building (default: 200)
//! - `ef_search`: Beam width during search (default: 100)
//! - `max_layers`: Maximum number of layers (default: 16)
//!
//! # Example
//!
//! ```
//! use ember_hnsw::{HnswConfig, HnswIndex};
//! use ember_vector::DistanceFunction;
//! use tokio_util::sync::CancellationToken;
//!
//! let index = HnswIndex::new(4, DistanceFunction::SquaredEuclidean, HnswConfig::default()).unwrap();
//!
//! index.insert(1, vec![1.0; 4]).unwrap();
//! index.insert(2, vec![2.0; 4]).unwrap();
//!
//! let results = index.search(&[1.5; 4], 10, &CancellationToken::new()).unwrap();
//! assert_eq!(results.len(), 2);
//! ```

mod graph;
mod index;
mod layer;
mod serialize;

pub use index::{HnswConfig, HnswIndex};
pub use serialize::{IndexSnapshot, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};

/// Error type for HNSW operations.
#[derive(Debug, thiserror::Error)]
pub enum HnswError {
    #[error("Vector error: {0}")]
    Vector(#[from] ember_vector::VectorError),

    #[error("Id {0} is already indexed")]
    DuplicateId(u64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Search cancelled")]
    Cancelled,

    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt snapshot: {0}")]
    Corrupt(String),

    #[error("Incompatible snapshot: {0}")]
    Incompatible(String),

    /// A snapshot references an id whose vector is no longer available.
    #[error("No vector available for id {0}")]
    MissingVector(u64),
}

/// Result type for HNSW operations.
pub type Result<T> = std::result::Result<T, HnswError>;
