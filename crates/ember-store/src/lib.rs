//! ember-store: durable record store for text + embedding pairs.
//!
//! Records live in a single append-only log of CRC32C-framed entries. On open
//! the log is replayed into an in-memory id map; a torn or corrupt tail is
//! truncated. Deletes append tombstones, and [`RecordStore::compact`] rewrites
//! the log with live records only.
//!
//! # Example
//!
//! ```
//! use ember_store::RecordStore;
//!
//! let store = RecordStore::in_memory(2);
//! let id = store.insert("hello", vec![0.5, 0.5]).unwrap();
//! assert_eq!(store.get(id).unwrap().text, "hello");
//! ```

pub mod log;
pub mod record;
pub mod recovery;
pub mod store;

pub use log::{FsyncPolicy, RecordLog, LOG_FILE_NAME};
pub use record::{LogRecord, RecordError};
pub use recovery::RecoveryInfo;
pub use store::{CompactionStats, EmbeddingRecord, RecordStore, Scan, StoreConfig};

use ember_vector::VectorError;

/// Errors returned by the record store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector: {0}")]
    InvalidVector(String),

    #[error("Record {0} not found")]
    NotFound(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<VectorError> for StoreError {
    fn from(e: VectorError) -> Self {
        match e {
            VectorError::DimensionMismatch { expected, actual } => {
                StoreError::DimensionMismatch { expected, actual }
            }
            VectorError::InvalidVector(msg) => StoreError::InvalidVector(msg),
            VectorError::UnknownDistance(name) => StoreError::InvalidConfig(name),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
