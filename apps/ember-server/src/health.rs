//! Health check for the engine.

use ember_engine::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Health status for the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHealthStatus {
    /// Overall server status: "healthy" or "degraded"
    pub status: String,

    /// Server uptime in seconds
    pub uptime_seconds: u64,

    /// Live records in the store
    pub records: usize,

    /// Nodes in the index, tombstoned ones included
    pub index_nodes: usize,

    pub index_tombstones: usize,

    /// Index updates still queued behind the asynchronous worker
    pub pending_index_ops: usize,

    /// Records stored but missing from the index
    pub stale_ids: usize,

    /// Additional details
    pub details: String,
}

/// Health check service.
pub struct HealthChecker {
    engine: Arc<Engine>,
    started: Instant,
}

impl HealthChecker {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            started: Instant::now(),
        }
    }

    pub async fn check(&self) -> ServerHealthStatus {
        let stats = self.engine.stats();

        let (status, details) = if stats.stale_ids > 0 {
            (
                "degraded",
                format!(
                    "{} records are not indexed; searches may miss them until repaired",
                    stats.stale_ids
                ),
            )
        } else {
            ("healthy", "All records indexed".to_string())
        };

        ServerHealthStatus {
            status: status.to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            records: stats.records,
            index_nodes: stats.index_nodes,
            index_tombstones: stats.index_tombstones,
            pending_index_ops: stats.pending_index_ops,
            stale_ids: stats.stale_ids,
            details,
        }
    }
}
