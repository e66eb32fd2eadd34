//! The engine handle: writes, searches and index lifecycle.

use crate::config::{EngineConfig, IndexingPolicy};
use crate::indexer::{self, IndexOp, Pending};
use crate::{EngineError, Result};
use ember_hnsw::{HnswError, HnswIndex, IndexSnapshot};
use ember_observe::{
    obs_count, obs_gauge, obs_hist, IndexEvt, IndexKind, Meter, NoopMeter, VizEvent,
};
use ember_store::{CompactionStats, EmbeddingRecord, RecordStore, StoreConfig, StoreError};
use ember_vector::{validate_vector, DistanceFunction, ExactScan, TopK, VectorMatch};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// File name of the index snapshot inside the data directory.
pub const INDEX_FILE_NAME: &str = "index.hnsw";

/// How many records the exact scan visits between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 256;

const PATH_EXACT: &[(&str, &str)] = &[("path", "exact")];
const PATH_APPROX: &[(&str, &str)] = &[("path", "approx")];

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: u64,
    pub text: String,
    /// Distance under the configured metric, lower is closer.
    pub distance: f32,
}

/// Point-in-time counters for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub records: usize,
    pub store_tombstones: usize,
    pub index_nodes: usize,
    pub index_tombstones: usize,
    pub pending_index_ops: usize,
    pub stale_ids: usize,
}

/// State shared with the index worker.
struct Inner {
    config: EngineConfig,
    store: RecordStore,
    index: RwLock<Arc<HnswIndex>>,
    /// Shared for index mutations, exclusive for rebuilds.
    maintenance: RwLock<()>,
    stale: Mutex<BTreeSet<u64>>,
    pending: Pending,
    exact: ExactScan,
    snapshot_path: Option<PathBuf>,
    meter: Arc<dyn Meter>,
    #[cfg(test)]
    fail_index_inserts: AtomicBool,
}

/// Handle to an open embedding store and its index.
///
/// All methods take `&self` and are safe to call from many threads. Calls
/// block; async callers should run them on a blocking pool.
pub struct Engine {
    inner: Arc<Inner>,
    sender: Mutex<Option<UnboundedSender<IndexOp>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Engine {
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with_meter(config, Arc::new(NoopMeter))
    }

    /// Opens the store, then loads the index snapshot (catching it up with
    /// the store) or rebuilds the index from scratch.
    pub fn open_with_meter(config: EngineConfig, meter: Arc<dyn Meter>) -> Result<Self> {
        config.validate()?;

        let store = match &config.data_dir {
            Some(dir) => RecordStore::open_with_meter(
                StoreConfig {
                    dir: dir.clone(),
                    dimensions: config.dimensions,
                    fsync_policy: config.fsync,
                },
                meter.clone(),
            )?,
            None => RecordStore::in_memory_with_meter(config.dimensions, meter.clone()),
        };

        let snapshot_path = config.data_dir.as_ref().map(|d| d.join(INDEX_FILE_NAME));
        let empty = HnswIndex::new(config.dimensions, config.metric, config.hnsw.clone())?;

        let inner = Arc::new(Inner {
            exact: ExactScan::new(config.dimensions, config.metric),
            index: RwLock::new(Arc::new(empty)),
            maintenance: RwLock::new(()),
            stale: Mutex::new(BTreeSet::new()),
            pending: Pending::default(),
            snapshot_path,
            meter,
            store,
            config,
            #[cfg(test)]
            fail_index_inserts: AtomicBool::new(false),
        });

        if inner.config.index_enabled {
            inner.load_or_rebuild_index()?;
        }

        let (sender, worker) = match inner.config.policy {
            IndexingPolicy::Synchronous => (None, None),
            IndexingPolicy::Asynchronous => {
                let (tx, rx) = indexer::channel();
                let worker_inner = inner.clone();
                let handle = indexer::spawn_worker(rx, move |op| {
                    worker_inner.apply(op);
                    worker_inner.pending.done();
                })
                .map_err(StoreError::from)?;
                (Some(tx), Some(handle))
            }
        };

        tracing::info!(
            records = inner.store.len(),
            dimensions = inner.config.dimensions,
            metric = %inner.config.metric,
            policy = ?inner.config.policy,
            index_enabled = inner.config.index_enabled,
            "Engine opened"
        );

        Ok(Self {
            inner,
            sender: Mutex::new(sender),
            worker: Mutex::new(worker),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Stores a record and indexes it according to the indexing policy.
    ///
    /// The record is durable (per the fsync policy) and visible to `get`
    /// and exact-scan searches before this returns.
    pub fn insert(&self, text: impl Into<String>, vector: Vec<f32>) -> Result<u64> {
        let id = self.inner.store.insert(text, vector)?;
        self.dispatch(IndexOp::Insert(id));
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Result<Arc<EmbeddingRecord>> {
        Ok(self.inner.store.get(id)?)
    }

    /// Tombstones a record in the store and the index.
    pub fn delete(&self, id: u64) -> Result<()> {
        self.inner.store.delete(id)?;
        self.dispatch(IndexOp::Delete(id));
        Ok(())
    }

    /// Live records in id order, for export.
    pub fn list(&self, offset: usize, limit: usize) -> Vec<Arc<EmbeddingRecord>> {
        self.inner.store.scan().skip(offset).take(limit).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// The `k` records nearest to `query`.
    ///
    /// `metric`, when given, must equal the configured metric.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        metric: Option<DistanceFunction>,
    ) -> Result<Vec<SearchHit>> {
        self.search_with_cancel(query, k, metric, &CancellationToken::new())
    }

    /// Like [`search`](Self::search), returning `Cancelled` once `cancel`
    /// fires.
    pub fn search_with_cancel(
        &self,
        query: &[f32],
        k: usize,
        metric: Option<DistanceFunction>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        let inner = &self.inner;

        if k == 0 {
            return Err(EngineError::InvalidArgument("k must be at least 1".into()));
        }
        if let Some(metric) = metric {
            if metric != inner.config.metric {
                return Err(EngineError::InvalidArgument(format!(
                    "query metric {} does not match index metric {}",
                    metric, inner.config.metric
                )));
            }
        }
        validate_vector(inner.config.dimensions, query)?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let start = Instant::now();
        let index = inner.index();
        // A k that covers every live record is answered exactly; the graph
        // gives no guarantee that every node is reachable.
        let use_index = inner.config.index_enabled
            && index.len() >= inner.config.exact_threshold()
            && k < inner.store.len();

        let matches = if use_index {
            obs_count!(inner.meter, "engine_searches_total", PATH_APPROX, 1);
            index.search(query, k, cancel)?
        } else {
            obs_count!(inner.meter, "engine_searches_total", PATH_EXACT, 1);
            inner.exact_search(query, k, cancel)?
        };

        // Records deleted since the match was found are dropped.
        let hits: Vec<SearchHit> = matches
            .into_iter()
            .filter_map(|m| {
                inner.store.get(m.id).ok().map(|record| SearchHit {
                    id: m.id,
                    text: record.text.clone(),
                    distance: m.distance,
                })
            })
            .collect();

        let ms = start.elapsed().as_secs_f64() * 1000.0;
        obs_hist!(inner.meter, "engine_search_latency_ms", &[], ms);
        tracing::debug!(k, hits = hits.len(), approx = use_index, ms, "Search complete");

        Ok(hits)
    }

    /// Compacts the store and rebuilds the index without tombstones.
    pub fn compact(&self) -> Result<CompactionStats> {
        let stats = self.inner.store.compact()?;
        if self.inner.config.index_enabled {
            self.inner.rebuild_index()?;
        }
        Ok(stats)
    }

    /// Discards the index and rebuilds it from the store. Returns the node count.
    pub fn rebuild_index(&self) -> Result<usize> {
        self.inner.rebuild_index()
    }

    /// Writes the index snapshot. Returns bytes written, or 0 when there is
    /// nowhere to write it.
    pub fn save_index(&self) -> Result<u64> {
        self.inner.save_index()
    }

    /// Ids whose index update failed after the record was stored.
    pub fn stale_ids(&self) -> Vec<u64> {
        self.inner.stale.lock().iter().copied().collect()
    }

    /// Retries indexing for stale ids. Returns how many were repaired.
    pub fn repair_stale(&self) -> Result<usize> {
        let ids = self.stale_ids();
        let mut repaired = 0;

        for id in ids {
            self.inner.stale.lock().remove(&id);
            self.inner.apply(IndexOp::Insert(id));
            if !self.inner.stale.lock().contains(&id) {
                repaired += 1;
            }
        }

        if repaired > 0 {
            tracing::info!(repaired, "Repaired stale index entries");
        }
        Ok(repaired)
    }

    /// Blocks until every queued index update has been applied.
    pub fn wait_for_indexing(&self) {
        self.inner.pending.wait();
    }

    pub fn stats(&self) -> EngineStats {
        let index = self.inner.index();
        EngineStats {
            records: self.inner.store.len(),
            store_tombstones: self.inner.store.tombstone_count(),
            index_nodes: index.node_count(),
            index_tombstones: index.tombstone_count(),
            pending_index_ops: self.inner.pending.get(),
            stale_ids: self.inner.stale.lock().len(),
        }
    }

    /// Drains indexing, saves the index snapshot and syncs the store.
    ///
    /// Later writes are still accepted but indexed synchronously.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.stop_worker();
        self.inner.save_index()?;
        self.inner.store.close()?;

        tracing::info!(records = self.inner.store.len(), "Engine closed");
        Ok(())
    }

    fn dispatch(&self, op: IndexOp) {
        let inner = &self.inner;
        if !inner.config.index_enabled {
            return;
        }

        let sender = self.sender.lock().clone();
        match sender {
            Some(tx) => {
                inner.pending.add();
                if tx.send(op).is_err() {
                    inner.pending.done();
                    tracing::warn!(?op, "Index worker gone, applying inline");
                    inner.apply(op);
                }
            }
            None => inner.apply(op),
        }
    }

    fn stop_worker(&self) {
        drop(self.sender.lock().take());
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Index worker panicked");
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

impl Inner {
    fn index(&self) -> Arc<HnswIndex> {
        self.index.read().clone()
    }

    fn exact_search(
        &self,
        query: &[f32],
        k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<VectorMatch>> {
        let mut top = TopK::new(k);
        for (i, record) in self.store.scan().enumerate() {
            if i % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            top.push(self.exact.score(query, record.id, &record.vector));
        }
        Ok(top.into_sorted_vec())
    }

    fn apply(&self, op: IndexOp) {
        match op {
            IndexOp::Insert(id) => self.index_insert(id),
            IndexOp::Delete(id) => {
                {
                    let _guard = self.maintenance.read();
                    let index = self.index();
                    index.delete(id);
                    obs_gauge!(self.meter, "index_tombstones", &[], index.tombstone_count());
                }
                self.stale.lock().remove(&id);
                self.maybe_rebuild();
            }
        }
    }

    fn index_insert(&self, id: u64) {
        // Deleted before the worker got to it
        let record = match self.store.get(id) {
            Ok(record) => record,
            Err(_) => return,
        };

        let _guard = self.maintenance.read();
        let index = self.index();
        let start = Instant::now();
        match self.insert_node(&index, id, record.vector.as_slice()) {
            Ok(()) | Err(HnswError::DuplicateId(_)) => {
                let ms = start.elapsed().as_secs_f64() * 1000.0;
                obs_hist!(self.meter, "index_insert_latency_ms", &[], ms);

                // A delete that ran between the lookup above and the insert
                // found no node to tombstone.
                if !self.store.contains(id) {
                    index.delete(id);
                }
            }
            Err(e) => {
                tracing::warn!(id, error = %e, "Index update failed, marking id stale");
                self.stale.lock().insert(id);
                self.meter.emit(VizEvent::Index(IndexEvt {
                    kind: IndexKind::MarkedStale { id },
                }));
            }
        }
    }

    fn insert_node(
        &self,
        index: &HnswIndex,
        id: u64,
        vector: &[f32],
    ) -> std::result::Result<(), HnswError> {
        #[cfg(test)]
        if self.fail_index_inserts.load(Ordering::Acquire) {
            return Err(HnswError::InvalidConfig("injected index failure".to_string()));
        }
        index.insert(id, vector)
    }

    fn maybe_rebuild(&self) {
        let index = self.index();
        let nodes = index.node_count();
        let tombstones = index.tombstone_count();
        if nodes == 0 || (tombstones as f64) <= self.config.rebuild_tombstone_ratio * nodes as f64 {
            return;
        }

        tracing::info!(nodes, tombstones, "Tombstone ratio exceeded, rebuilding index");
        if let Err(e) = self.rebuild_index() {
            tracing::warn!(error = %e, "Index rebuild failed");
        }
    }

    fn rebuild_index(&self) -> Result<usize> {
        let _guard = self.maintenance.write();
        let start = Instant::now();

        let index = HnswIndex::new(
            self.config.dimensions,
            self.config.metric,
            self.config.hnsw.clone(),
        )?;
        for record in self.store.scan() {
            index.insert(record.id, record.vector.as_slice())?;
        }
        let nodes = index.node_count();

        *self.index.write() = Arc::new(index);
        self.stale.lock().clear();

        let ms = start.elapsed().as_millis() as u32;
        tracing::info!(nodes, ms, "Index rebuilt from store");
        self.meter.emit(VizEvent::Index(IndexEvt {
            kind: IndexKind::Rebuilt {
                nodes: nodes as u64,
                ms,
            },
        }));
        obs_gauge!(self.meter, "index_tombstones", &[], 0);

        Ok(nodes)
    }

    fn load_or_rebuild_index(&self) -> Result<()> {
        let path = match &self.snapshot_path {
            Some(path) if path.exists() => path,
            _ => {
                self.rebuild_index()?;
                return Ok(());
            }
        };

        let loaded = IndexSnapshot::read_from(path).and_then(|snapshot| {
            HnswIndex::from_snapshot(
                &snapshot,
                self.config.dimensions,
                self.config.metric,
                self.config.hnsw.clone(),
                |id| self.store.get_any(id).map(|r| Arc::from(r.vector.as_slice())),
            )
        });

        let index = match loaded {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Index snapshot unusable, rebuilding");
                self.rebuild_index()?;
                return Ok(());
            }
        };

        // Catch up with writes made after the snapshot was taken
        let mut caught_up = 0u64;
        for record in self.store.scan() {
            if !index.is_indexed(record.id) {
                index.insert(record.id, record.vector.as_slice())?;
                caught_up += 1;
            }
        }
        for id in index.live_ids() {
            if !self.store.contains(id) {
                index.delete(id);
                caught_up += 1;
            }
        }

        let nodes = index.node_count() as u64;
        tracing::info!(nodes, caught_up, "Index snapshot loaded");
        self.meter.emit(VizEvent::Index(IndexEvt {
            kind: IndexKind::SnapshotLoaded { nodes, caught_up },
        }));

        *self.index.write() = Arc::new(index);
        self.maybe_rebuild();
        Ok(())
    }

    fn save_index(&self) -> Result<u64> {
        let path = match &self.snapshot_path {
            Some(path) if self.config.index_enabled => path,
            _ => return Ok(0),
        };

        self.pending.wait();
        let _guard = self.maintenance.write();
        let index = self.index();
        let bytes = index.save(path)?;

        tracing::info!(path = %path.display(), nodes = index.node_count(), bytes, "Index snapshot saved");
        self.meter.emit(VizEvent::Index(IndexEvt {
            kind: IndexKind::SnapshotSaved {
                nodes: index.node_count() as u64,
                bytes,
            },
        }));
        Ok(bytes)
    }
}
