//! The record store: id assignment, lookups, tombstones, scans and compaction.

use crate::log::{FsyncPolicy, RecordLog};
use crate::record::encode_frame;
use crate::{Result, StoreError};
use ember_observe::{obs_count, obs_gauge, Meter, NoopMeter, StoreEvt, StoreKind, VizEvent};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for an on-disk store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding `records.log`.
    pub dir: PathBuf,
    /// Fixed vector dimension `D` for every record.
    pub dimensions: usize,
    pub fsync_policy: FsyncPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            dimensions: 768,
            fsync_policy: FsyncPolicy::default(),
        }
    }
}

impl StoreConfig {
    pub fn new(dir: impl Into<PathBuf>, dimensions: usize) -> Self {
        Self {
            dir: dir.into(),
            dimensions,
            ..Default::default()
        }
    }

    /// Rejects configurations the store cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.dimensions == 0 {
            return Err(StoreError::InvalidConfig(
                "dimensions must be greater than zero".into(),
            ));
        }
        if let FsyncPolicy::Batch(window) = self.fsync_policy {
            if window.is_zero() || window > Duration::from_secs(1) {
                return Err(StoreError::InvalidConfig(format!(
                    "fsync batch window must be within (0, 1s], got {:?}",
                    window
                )));
            }
        }
        Ok(())
    }
}

/// A stored text + embedding pair. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub id: u64,
    pub text: String,
    pub vector: Vec<f32>,
}

/// Outcome of [`RecordStore::compact`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Tombstoned ids physically dropped, ascending.
    pub reclaimed: Vec<u64>,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

#[derive(Debug, Clone)]
struct Slot {
    record: Arc<EmbeddingRecord>,
    tombstoned: bool,
}

struct Writer {
    /// `None` for in-memory stores.
    log: Option<RecordLog>,
    next_id: u64,
}

/// Durable store of [`EmbeddingRecord`]s keyed by a monotonically assigned id.
///
/// Ids are assigned and logged under a single writer lock, so log order
/// equals id order. Readers only take the record map's read lock and get
/// `Arc`s to fully built records.
pub struct RecordStore {
    dimensions: usize,
    writer: Mutex<Writer>,
    records: RwLock<BTreeMap<u64, Slot>>,
    tombstones: AtomicUsize,
    meter: Arc<dyn Meter>,
}

impl RecordStore {
    /// Opens (or creates) an on-disk store, replaying its log.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_meter(config, Arc::new(NoopMeter))
    }

    pub fn open_with_meter(config: StoreConfig, meter: Arc<dyn Meter>) -> Result<Self> {
        config.validate()?;

        let (log, frames, info) =
            RecordLog::open(&config.dir, config.fsync_policy, meter.clone())?;

        let mut records: BTreeMap<u64, Slot> = BTreeMap::new();
        let mut next_id = 1u64;
        let mut tombstones = 0usize;

        for frame in frames {
            next_id = next_id.max(frame.id + 1);

            if frame.tombstone {
                // A tombstone with no matching put only carries the id watermark.
                if let Some(slot) = records.get_mut(&frame.id) {
                    if !slot.tombstoned {
                        slot.tombstoned = true;
                        tombstones += 1;
                    }
                }
                continue;
            }

            if frame.vector.len() != config.dimensions {
                return Err(StoreError::InvalidConfig(format!(
                    "store at {} holds {}-dimensional vectors, configured for {}",
                    config.dir.display(),
                    frame.vector.len(),
                    config.dimensions
                )));
            }

            records.insert(
                frame.id,
                Slot {
                    record: Arc::new(EmbeddingRecord {
                        id: frame.id,
                        text: frame.text,
                        vector: frame.vector,
                    }),
                    tombstoned: false,
                },
            );
        }

        let live = records.len() - tombstones;
        tracing::info!(
            dir = %config.dir.display(),
            live,
            tombstones,
            next_id,
            bytes_truncated = info.bytes_truncated,
            "Record store opened"
        );

        meter.emit(VizEvent::Store(StoreEvt {
            kind: StoreKind::Recovered {
                records: live as u64,
                tombstones: tombstones as u64,
                bytes_truncated: info.bytes_truncated,
            },
        }));
        obs_gauge!(meter, "store_live_records", &[], live);

        Ok(Self {
            dimensions: config.dimensions,
            writer: Mutex::new(Writer {
                log: Some(log),
                next_id,
            }),
            records: RwLock::new(records),
            tombstones: AtomicUsize::new(tombstones),
            meter,
        })
    }

    /// Creates a store with no backing file.
    pub fn in_memory(dimensions: usize) -> Self {
        Self::in_memory_with_meter(dimensions, Arc::new(NoopMeter))
    }

    pub fn in_memory_with_meter(dimensions: usize, meter: Arc<dyn Meter>) -> Self {
        Self {
            dimensions,
            writer: Mutex::new(Writer {
                log: None,
                next_id: 1,
            }),
            records: RwLock::new(BTreeMap::new()),
            tombstones: AtomicUsize::new(0),
            meter,
        }
    }

    /// Persists a new record and returns its id.
    ///
    /// The record is visible to [`get`](Self::get) and [`scan`](Self::scan)
    /// before this returns. A rejected vector leaves the store untouched.
    pub fn insert(&self, text: impl Into<String>, vector: Vec<f32>) -> Result<u64> {
        ember_vector::validate_vector(self.dimensions, &vector)?;
        let text = text.into();

        let mut writer = self.writer.lock();
        let id = writer.next_id;

        if let Some(log) = writer.log.as_mut() {
            log.append(&encode_frame(id, false, &text, &vector))?;
        }
        writer.next_id += 1;

        let record = Arc::new(EmbeddingRecord { id, text, vector });
        self.records.write().insert(
            id,
            Slot {
                record,
                tombstoned: false,
            },
        );
        drop(writer);

        obs_count!(self.meter, "store_inserts_total", &[], 1);
        obs_gauge!(self.meter, "store_live_records", &[], self.len());
        tracing::debug!(id, "Inserted record");

        Ok(id)
    }

    /// Returns a live record.
    pub fn get(&self, id: u64) -> Result<Arc<EmbeddingRecord>> {
        match self.records.read().get(&id) {
            Some(slot) if !slot.tombstoned => Ok(slot.record.clone()),
            _ => Err(StoreError::NotFound(id)),
        }
    }

    /// Returns a record even if it is tombstoned, as long as it has not
    /// been compacted away.
    pub fn get_any(&self, id: u64) -> Option<Arc<EmbeddingRecord>> {
        self.records.read().get(&id).map(|slot| slot.record.clone())
    }

    pub fn contains(&self, id: u64) -> bool {
        matches!(self.records.read().get(&id), Some(slot) if !slot.tombstoned)
    }

    /// Tombstones a live record.
    pub fn delete(&self, id: u64) -> Result<()> {
        let mut writer = self.writer.lock();

        if !self.contains(id) {
            return Err(StoreError::NotFound(id));
        }

        if let Some(log) = writer.log.as_mut() {
            log.append(&encode_frame(id, true, "", &[]))?;
        }

        if let Some(slot) = self.records.write().get_mut(&id) {
            slot.tombstoned = true;
        }
        self.tombstones.fetch_add(1, Ordering::Relaxed);
        drop(writer);

        obs_count!(self.meter, "store_deletes_total", &[], 1);
        obs_gauge!(self.meter, "store_live_records", &[], self.len());
        tracing::debug!(id, "Deleted record");

        Ok(())
    }

    /// Lazy scan over live records in ascending id order.
    pub fn scan(&self) -> Scan<'_> {
        self.scan_from(1)
    }

    /// Lazy scan starting at `start` (inclusive).
    pub fn scan_from(&self, start: u64) -> Scan<'_> {
        Scan {
            store: self,
            start,
            cursor: Bound::Included(start),
        }
    }

    /// Rewrites the log without tombstoned records and drops them from memory.
    pub fn compact(&self) -> Result<CompactionStats> {
        let mut writer = self.writer.lock();
        let last_id = writer.next_id - 1;

        let (frames, reclaimed) = {
            let records = self.records.read();
            let mut frames = Vec::with_capacity(records.len());
            let mut reclaimed = Vec::new();
            for (id, slot) in records.iter() {
                if slot.tombstoned {
                    reclaimed.push(*id);
                } else {
                    frames.push(encode_frame(
                        *id,
                        false,
                        &slot.record.text,
                        &slot.record.vector,
                    ));
                }
            }
            (frames, reclaimed)
        };

        let mut stats = CompactionStats {
            reclaimed,
            ..Default::default()
        };

        if let Some(log) = writer.log.as_mut() {
            let mut frames = frames;
            // Keep the id watermark when the newest record was deleted.
            if last_id > 0 && !self.contains(last_id) {
                frames.push(encode_frame(last_id, true, "", &[]));
            }
            stats.bytes_before = log.size();
            stats.bytes_after = log.rewrite(&frames)?;
        }

        {
            let mut records = self.records.write();
            for id in &stats.reclaimed {
                records.remove(id);
            }
        }
        self.tombstones.fetch_sub(stats.reclaimed.len(), Ordering::Relaxed);
        drop(writer);

        tracing::info!(
            reclaimed = stats.reclaimed.len(),
            bytes_before = stats.bytes_before,
            bytes_after = stats.bytes_after,
            "Compacted record store"
        );
        self.meter.emit(VizEvent::Store(StoreEvt {
            kind: StoreKind::Compacted {
                reclaimed: stats.reclaimed.len() as u64,
                bytes: stats.bytes_after,
            },
        }));

        Ok(stats)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let total = self.records.read().len();
        total.saturating_sub(self.tombstones.load(Ordering::Relaxed))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tombstoned records not yet compacted.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.load(Ordering::Relaxed)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Highest id ever assigned, 0 if none.
    pub fn last_id(&self) -> u64 {
        self.writer.lock().next_id - 1
    }

    /// Forces buffered log writes to disk.
    pub fn sync(&self) -> Result<()> {
        if let Some(log) = self.writer.lock().log.as_mut() {
            log.sync()?;
        }
        Ok(())
    }

    /// Syncs outstanding writes. The store stays usable afterwards.
    pub fn close(&self) -> Result<()> {
        self.sync()?;
        tracing::info!(live = self.len(), "Record store closed");
        Ok(())
    }

    fn next_live_after(&self, cursor: Bound<u64>) -> Option<Arc<EmbeddingRecord>> {
        let records = self.records.read();
        records
            .range((cursor, Bound::Unbounded))
            .find(|(_, slot)| !slot.tombstoned)
            .map(|(_, slot)| slot.record.clone())
    }
}

/// Lazy iterator over live records in ascending id order.
///
/// Each step takes the map's read lock briefly; no lock is held between
/// items, so writers are never blocked by a slow consumer. Records inserted
/// after the cursor are observed; records deleted ahead of it are skipped.
pub struct Scan<'a> {
    store: &'a RecordStore,
    start: u64,
    cursor: Bound<u64>,
}

impl Scan<'_> {
    /// Rewinds to the scan's starting id.
    pub fn restart(&mut self) {
        self.cursor = Bound::Included(self.start);
    }
}

impl Iterator for Scan<'_> {
    type Item = Arc<EmbeddingRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.store.next_live_after(self.cursor)?;
        self.cursor = Bound::Excluded(record.id);
        Some(record)
    }
}
