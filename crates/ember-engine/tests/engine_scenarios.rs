//! End-to-end engine scenarios, in memory and on disk.

use ember_engine::{
    CancellationToken, DistanceFunction, Engine, EngineConfig, EngineError, FsyncPolicy,
    HnswConfig, IndexingPolicy, INDEX_FILE_NAME,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ember_engine=debug,ember_hnsw=debug")
        .with_test_writer()
        .try_init();
}

/// Forces the index path even for tiny data sets.
fn indexed(config: EngineConfig) -> EngineConfig {
    EngineConfig {
        exact_threshold: Some(0),
        ..config
    }
}

fn on_disk(dir: &TempDir, dimensions: usize) -> EngineConfig {
    EngineConfig {
        fsync: FsyncPolicy::Always,
        ..indexed(EngineConfig::persistent(dir.path(), dimensions))
    }
}

fn random_vector(rng: &mut StdRng, dimensions: usize) -> Vec<f32> {
    (0..dimensions).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

#[test]
fn test_cat_dog_lion() {
    init_tracing();

    for config in [
        indexed(EngineConfig::in_memory(3)),
        EngineConfig::in_memory(3),
        EngineConfig {
            index_enabled: false,
            ..EngineConfig::in_memory(3)
        },
    ] {
        let engine = Engine::open(config).unwrap();
        engine.insert("cat", vec![1.0, 0.0, 0.0]).unwrap();
        engine.insert("dog", vec![0.0, 1.0, 0.0]).unwrap();
        engine.insert("lion", vec![0.9, 0.1, 0.0]).unwrap();

        let hits = engine.search(&[1.0, 0.0, 0.0], 2, None).unwrap();
        let texts: Vec<_> = hits.iter().map(|h| h.text.as_str()).collect();
        assert_eq!(texts, vec!["cat", "lion"]);
        assert!(hits[0].distance.abs() < 1e-6);
    }
}

#[test]
fn test_empty_store_search() {
    let engine = Engine::open(indexed(EngineConfig::in_memory(4))).unwrap();
    let hits = engine.search(&[0.1, 0.2, 0.3, 0.4], 5, None).unwrap();
    assert!(hits.is_empty());
}

#[test]
fn test_deleted_record_not_returned() {
    let engine = Engine::open(indexed(EngineConfig::in_memory(3))).unwrap();
    let target = engine.insert("target", vec![0.2, 0.4, 0.6]).unwrap();
    engine.insert("other", vec![0.9, 0.0, 0.1]).unwrap();

    engine.delete(target).unwrap();

    let hits = engine.search(&[0.2, 0.4, 0.6], 5, None).unwrap();
    assert!(hits.iter().all(|h| h.id != target));
    assert_eq!(hits.len(), 1);
}

#[test]
fn test_k_above_count_and_sorted() {
    let engine = Engine::open(indexed(EngineConfig::in_memory(8))).unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    for i in 0..25 {
        engine
            .insert(format!("r{}", i), random_vector(&mut rng, 8))
            .unwrap();
    }

    let hits = engine.search(&random_vector(&mut rng, 8), 100, None).unwrap();
    assert_eq!(hits.len(), 25);
    for pair in hits.windows(2) {
        assert!(pair[0].distance <= pair[1].distance);
    }
}

#[test]
fn test_dimension_mismatch_creates_no_record() {
    let engine = Engine::open(EngineConfig::in_memory(3)).unwrap();
    let err = engine.insert("short", vec![1.0, 2.0]).unwrap_err();
    assert!(matches!(
        err,
        EngineError::DimensionMismatch {
            expected: 3,
            actual: 2
        }
    ));
    assert!(engine.is_empty());
    assert_eq!(engine.stats().index_nodes, 0);
}

#[test]
fn test_metric_mismatch_rejected() {
    let engine = Engine::open(EngineConfig::in_memory(2)).unwrap();
    engine.insert("a", vec![1.0, 0.0]).unwrap();

    assert!(engine
        .search(&[1.0, 0.0], 1, Some(DistanceFunction::Cosine))
        .is_ok());
    assert!(matches!(
        engine.search(&[1.0, 0.0], 1, Some(DistanceFunction::SquaredEuclidean)),
        Err(EngineError::InvalidArgument(_))
    ));

    let mixed = EngineConfig {
        search_metric: Some(DistanceFunction::SquaredEuclidean),
        ..EngineConfig::in_memory(2)
    };
    assert!(matches!(
        Engine::open(mixed),
        Err(EngineError::InvalidArgument(_))
    ));
}

#[test]
fn test_cancelled_search() {
    let engine = Engine::open(EngineConfig::in_memory(2)).unwrap();
    engine.insert("a", vec![1.0, 0.0]).unwrap();

    let token = CancellationToken::new();
    token.cancel();
    assert!(matches!(
        engine.search_with_cancel(&[1.0, 0.0], 1, None, &token),
        Err(EngineError::Cancelled)
    ));
}

#[test]
fn test_async_indexing_catches_up() {
    init_tracing();
    let engine = Engine::open(EngineConfig {
        policy: IndexingPolicy::Asynchronous,
        ..indexed(EngineConfig::in_memory(4))
    })
    .unwrap();

    let mut rng = StdRng::seed_from_u64(8);
    let mut ids = Vec::new();
    for i in 0..300 {
        ids.push(
            engine
                .insert(format!("r{}", i), random_vector(&mut rng, 4))
                .unwrap(),
        );
    }
    engine.delete(ids[10]).unwrap();

    // Visible to get immediately, whatever the indexer has done so far
    assert_eq!(engine.get(ids[299]).unwrap().text, "r299");

    engine.wait_for_indexing();
    let stats = engine.stats();
    assert_eq!(stats.pending_index_ops, 0);
    assert_eq!(stats.index_nodes - stats.index_tombstones, 299);

    let target = engine.get(ids[42]).unwrap();
    let hits = engine.search(&target.vector, 1, None).unwrap();
    assert_eq!(hits[0].id, ids[42]);

    engine.close().unwrap();
}

#[test]
fn test_concurrent_inserts_and_searches() {
    let engine = Arc::new(Engine::open(indexed(EngineConfig::in_memory(8))).unwrap());

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let engine = engine.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t);
                for i in 0..100 {
                    engine
                        .insert(format!("t{}-{}", t, i), random_vector(&mut rng, 8))
                        .unwrap();
                }
            })
        })
        .collect();

    let reader = {
        let engine = engine.clone();
        thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(99);
            for _ in 0..100 {
                let hits = engine.search(&random_vector(&mut rng, 8), 5, None).unwrap();
                assert!(hits.len() <= 5);
            }
        })
    };

    for w in writers {
        w.join().unwrap();
    }
    reader.join().unwrap();

    assert_eq!(engine.len(), 400);
    assert_eq!(engine.stats().index_nodes, 400);
}

#[test]
fn test_snapshot_reload_gives_identical_results() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(21);
    let queries: Vec<_> = (0..20).map(|_| random_vector(&mut rng, 8)).collect();

    let before = {
        let engine = Engine::open(on_disk(&dir, 8)).unwrap();
        for i in 0..500 {
            engine
                .insert(format!("r{}", i), random_vector(&mut rng, 8))
                .unwrap();
        }
        engine.delete(7).unwrap();

        let results: Vec<_> = queries
            .iter()
            .map(|q| engine.search(q, 10, None).unwrap())
            .collect();
        engine.close().unwrap();
        results
    };

    assert!(dir.path().join(INDEX_FILE_NAME).exists());

    let engine = Engine::open(on_disk(&dir, 8)).unwrap();
    assert_eq!(engine.len(), 499);
    for (q, expected) in queries.iter().zip(&before) {
        assert_eq!(&engine.search(q, 10, None).unwrap(), expected);
    }
}

#[test]
fn test_stale_snapshot_is_caught_up() {
    let dir = TempDir::new().unwrap();

    {
        let engine = Engine::open(on_disk(&dir, 3)).unwrap();
        engine.insert("a", vec![1.0, 0.0, 0.0]).unwrap();
        engine.insert("b", vec![0.0, 1.0, 0.0]).unwrap();
        engine.save_index().unwrap();

        // Writes after the snapshot; no close, so no second save
        engine.insert("c", vec![0.0, 0.0, 1.0]).unwrap();
        engine.delete(1).unwrap();
    }

    let engine = Engine::open(on_disk(&dir, 3)).unwrap();
    let stats = engine.stats();
    assert_eq!(stats.records, 2);
    assert_eq!(stats.index_nodes - stats.index_tombstones, 2);

    let hits = engine.search(&[0.0, 0.0, 1.0], 3, None).unwrap();
    let texts: Vec<_> = hits.iter().map(|h| h.text.as_str()).collect();
    assert_eq!(texts, vec!["c", "b"]);
}

#[test]
fn test_corrupt_snapshot_triggers_rebuild() {
    let dir = TempDir::new().unwrap();

    {
        let engine = Engine::open(on_disk(&dir, 2)).unwrap();
        engine.insert("left", vec![-1.0, 0.0]).unwrap();
        engine.insert("right", vec![1.0, 0.0]).unwrap();
        engine.close().unwrap();
    }

    std::fs::write(dir.path().join(INDEX_FILE_NAME), b"not a snapshot").unwrap();

    let engine = Engine::open(on_disk(&dir, 2)).unwrap();
    assert_eq!(engine.stats().index_nodes, 2);
    let hits = engine.search(&[1.0, 0.1], 1, None).unwrap();
    assert_eq!(hits[0].text, "right");
}

#[test]
fn test_compact_then_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let engine = Engine::open(on_disk(&dir, 2)).unwrap();
        for i in 0..10 {
            engine.insert(format!("r{}", i), vec![i as f32, 1.0]).unwrap();
        }
        for id in [2, 4, 6] {
            engine.delete(id).unwrap();
        }

        let stats = engine.compact().unwrap();
        assert_eq!(stats.reclaimed, vec![2, 4, 6]);
        assert_eq!(engine.stats().index_tombstones, 0);
        assert_eq!(engine.stats().index_nodes, 7);
        engine.close().unwrap();
    }

    // The snapshot written at close no longer references compacted ids
    let engine = Engine::open(on_disk(&dir, 2)).unwrap();
    assert_eq!(engine.len(), 7);
    assert_eq!(engine.stats().index_nodes, 7);
    assert_eq!(engine.insert("new", vec![0.0, 1.0]).unwrap(), 11);

    let ids: Vec<_> = engine.list(0, 100).iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1, 3, 5, 7, 8, 9, 10, 11]);
    let page: Vec<_> = engine.list(2, 3).iter().map(|r| r.id).collect();
    assert_eq!(page, vec![5, 7, 8]);
}

#[test]
fn test_repair_stale_noop_when_healthy() {
    let engine = Engine::open(EngineConfig::in_memory(2)).unwrap();
    engine.insert("a", vec![1.0, 0.0]).unwrap();
    assert!(engine.stale_ids().is_empty());
    assert_eq!(engine.repair_stale().unwrap(), 0);
}

#[test]
fn test_k_above_count_returns_every_record_with_small_m() {
    init_tracing();
    let engine = Engine::open(EngineConfig {
        hnsw: HnswConfig::with_m(3),
        ..EngineConfig::in_memory(8)
    })
    .unwrap();

    let mut rng = StdRng::seed_from_u64(0);
    for i in 0..3000 {
        engine
            .insert(format!("r{}", i), random_vector(&mut rng, 8))
            .unwrap();
    }

    for k in [3000, 3010] {
        let hits = engine.search(&[0.0; 8], k, None).unwrap();
        assert_eq!(hits.len(), 3000);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));

        let mut ids: Vec<_> = hits.iter().map(|h| h.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3000);
    }

    // Below the count the graph answers.
    assert_eq!(engine.search(&[0.0; 8], 10, None).unwrap().len(), 10);
}
