//! Integration tests for the on-disk record store.
//!
//! These tests verify the store lifecycle across process restarts:
//! 1. Insert and delete records
//! 2. Close and reopen the store
//! 3. Verify the replayed state matches

use ember_store::{FsyncPolicy, RecordStore, StoreConfig, StoreError, LOG_FILE_NAME};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn config(dir: &TempDir, dimensions: usize) -> StoreConfig {
    StoreConfig {
        dir: dir.path().to_path_buf(),
        dimensions,
        fsync_policy: FsyncPolicy::Always,
    }
}

#[test]
fn test_reopen_preserves_records() {
    let dir = TempDir::new().unwrap();

    {
        let store = RecordStore::open(config(&dir, 3)).unwrap();
        for i in 0..10 {
            let id = store
                .insert(format!("record {}", i), vec![i as f32, 1.0, -1.0])
                .unwrap();
            assert_eq!(id, i + 1);
        }
        store.delete(4).unwrap();
        store.close().unwrap();
    }

    let store = RecordStore::open(config(&dir, 3)).unwrap();
    assert_eq!(store.len(), 9);
    assert_eq!(store.tombstone_count(), 1);
    assert_eq!(store.last_id(), 10);
    assert!(matches!(store.get(4), Err(StoreError::NotFound(4))));

    let record = store.get(7).unwrap();
    assert_eq!(record.text, "record 6");
    assert_eq!(record.vector, vec![6.0, 1.0, -1.0]);

    // Ids continue after the replayed watermark
    assert_eq!(store.insert("next", vec![0.0; 3]).unwrap(), 11);
}

#[test]
fn test_torn_tail_is_truncated() {
    let dir = TempDir::new().unwrap();

    {
        let store = RecordStore::open(config(&dir, 2)).unwrap();
        store.insert("one", vec![1.0, 1.0]).unwrap();
        store.insert("two", vec![2.0, 2.0]).unwrap();
        store.close().unwrap();
    }

    let log_path = dir.path().join(LOG_FILE_NAME);
    let good_len = std::fs::metadata(&log_path).unwrap().len();

    // Simulate a crash halfway through a third append
    {
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(&[0x03, 0x00, 0x05, 0x02, b't', b'h']).unwrap();
    }

    let store = RecordStore::open(config(&dir, 2)).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(std::fs::metadata(&log_path).unwrap().len(), good_len);

    // The torn id is reassigned since it was never durable
    assert_eq!(store.insert("three", vec![3.0, 3.0]).unwrap(), 3);
    store.close().unwrap();
    drop(store);

    let store = RecordStore::open(config(&dir, 2)).unwrap();
    assert_eq!(store.get(3).unwrap().text, "three");
}

#[test]
fn test_compaction_survives_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let store = RecordStore::open(config(&dir, 2)).unwrap();
        for i in 0..20 {
            store.insert("x".repeat(64), vec![i as f32, 0.0]).unwrap();
        }
        for id in (2..=20).step_by(2) {
            store.delete(id).unwrap();
        }

        let stats = store.compact().unwrap();
        assert_eq!(stats.reclaimed.len(), 10);
        assert!(stats.bytes_after < stats.bytes_before);
        assert_eq!(store.len(), 10);
        store.close().unwrap();
    }

    let store = RecordStore::open(config(&dir, 2)).unwrap();
    assert_eq!(store.len(), 10);
    assert_eq!(store.tombstone_count(), 0);

    let ids: Vec<_> = store.scan().map(|r| r.id).collect();
    assert_eq!(ids, (1..=19).step_by(2).collect::<Vec<_>>());

    // Id 20 was deleted and compacted away, but is never reused
    assert_eq!(store.last_id(), 20);
    assert_eq!(store.insert("after", vec![0.0, 0.0]).unwrap(), 21);
}

#[test]
fn test_dimension_change_rejected_on_open() {
    let dir = TempDir::new().unwrap();

    {
        let store = RecordStore::open(config(&dir, 4)).unwrap();
        store.insert("four", vec![0.0; 4]).unwrap();
        store.close().unwrap();
    }

    let err = RecordStore::open(config(&dir, 8)).err().unwrap();
    assert!(matches!(err, StoreError::InvalidConfig(_)));
}

#[test]
fn test_concurrent_inserts_get_unique_ids() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir, 2);
    cfg.fsync_policy = FsyncPolicy::Os;
    let store = Arc::new(RecordStore::open(cfg.clone()).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = store.clone();
            thread::spawn(move || {
                (0..50)
                    .map(|i| {
                        store
                            .insert(format!("t{}-{}", t, i), vec![t as f32, i as f32])
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=200).collect::<Vec<_>>());

    store.close().unwrap();
    drop(store);

    // Every record's text matches its vector after replay
    let store = RecordStore::open(cfg).unwrap();
    for record in store.scan() {
        let expected = format!("t{}-{}", record.vector[0] as u32, record.vector[1] as u32);
        assert_eq!(record.text, expected);
    }
    assert_eq!(store.len(), 200);
}
