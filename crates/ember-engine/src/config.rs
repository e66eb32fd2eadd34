//! Engine configuration.

use crate::{EngineError, Result};
use ember_hnsw::HnswConfig;
use ember_store::FsyncPolicy;
use ember_vector::DistanceFunction;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// When the index learns about a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingPolicy {
    /// `insert`/`delete` return after the index is updated.
    #[default]
    Synchronous,
    /// A background worker applies index updates in write order.
    /// Exact-scan searches still see every write immediately.
    Asynchronous,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fixed vector dimension `D`.
    pub dimensions: usize,
    /// Metric the index is built with.
    pub metric: DistanceFunction,
    /// Metric queries are ranked with. Must equal `metric` when set.
    pub search_metric: Option<DistanceFunction>,
    /// Directory for `records.log` and `index.hnsw`. `None` keeps
    /// everything in memory.
    pub data_dir: Option<PathBuf>,
    pub hnsw: HnswConfig,
    /// When false, every search is an exact scan.
    pub index_enabled: bool,
    pub policy: IndexingPolicy,
    /// Searches use the exact scan while the index holds fewer live nodes
    /// than this. Defaults to `hnsw.ef_search`.
    pub exact_threshold: Option<usize>,
    /// Rebuild the index once tombstones exceed this fraction of its nodes.
    pub rebuild_tombstone_ratio: f64,
    pub fsync: FsyncPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dimensions: 768,
            metric: DistanceFunction::Cosine,
            search_metric: None,
            data_dir: None,
            hnsw: HnswConfig::default(),
            index_enabled: true,
            policy: IndexingPolicy::Synchronous,
            exact_threshold: None,
            rebuild_tombstone_ratio: 0.5,
            fsync: FsyncPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// An in-memory engine for `dimensions`-sized vectors.
    pub fn in_memory(dimensions: usize) -> Self {
        Self {
            dimensions,
            ..Default::default()
        }
    }

    /// An on-disk engine rooted at `dir`.
    pub fn persistent(dir: impl Into<PathBuf>, dimensions: usize) -> Self {
        Self {
            dimensions,
            data_dir: Some(dir.into()),
            ..Default::default()
        }
    }

    pub fn exact_threshold(&self) -> usize {
        self.exact_threshold.unwrap_or(self.hnsw.ef_search)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimensions == 0 {
            return Err(EngineError::InvalidArgument(
                "dimensions must be greater than zero".into(),
            ));
        }
        if let Some(search_metric) = self.search_metric {
            if search_metric != self.metric {
                return Err(EngineError::InvalidArgument(format!(
                    "search metric {} does not match index metric {}",
                    search_metric, self.metric
                )));
            }
        }
        if !(self.rebuild_tombstone_ratio > 0.0 && self.rebuild_tombstone_ratio <= 1.0) {
            return Err(EngineError::InvalidArgument(format!(
                "rebuild_tombstone_ratio must be within (0, 1], got {}",
                self.rebuild_tombstone_ratio
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.dimensions, 768);
        assert_eq!(config.metric, DistanceFunction::Cosine);
        assert_eq!(config.policy, IndexingPolicy::Synchronous);
        assert_eq!(config.exact_threshold(), config.hnsw.ef_search);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_metric_mismatch_rejected() {
        let config = EngineConfig {
            search_metric: Some(DistanceFunction::SquaredEuclidean),
            ..EngineConfig::in_memory(4)
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_bad_ratio_rejected() {
        let config = EngineConfig {
            rebuild_tombstone_ratio: 0.0,
            ..EngineConfig::in_memory(4)
        };
        assert!(config.validate().is_err());
    }
}
