//! ember-observe: vendor-neutral observability ABI.
//!
//! Core crates depend only on these traits and event types. Backends (the
//! Prometheus meter in `ember-server`) live elsewhere.

pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}
pub trait Gauge: Send + Sync {
    fn set(&self, v: i64);
}
pub trait Histogram: Send + Sync {
    fn observe(&self, v: f64);
}

pub trait Meter: Send + Sync + 'static {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter>;
    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge>;
    fn histo(
        &self,
        name: &'static str,
        _buckets: &'static [f64],
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram>;
    fn emit(&self, evt: VizEvent);
}

/// A do-nothing meter for tests and users who don't care about telemetry.
#[derive(Clone, Default)]
pub struct NoopMeter;
struct NoopC;
impl Counter for NoopC {
    fn inc(&self, _v: u64) {}
}
struct NoopG;
impl Gauge for NoopG {
    fn set(&self, _v: i64) {}
}
struct NoopH;
impl Histogram for NoopH {
    fn observe(&self, _v: f64) {}
}
impl Meter for NoopMeter {
    fn counter(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(NoopC)
    }
    fn gauge(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(NoopG)
    }
    fn histo(
        &self,
        _n: &'static str,
        _b: &'static [f64],
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(NoopH)
    }
    fn emit(&self, _e: VizEvent) {}
}

/// Typed events for live visualization (record text and vectors never included).
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum VizEvent {
    Store(StoreEvt),
    Index(IndexEvt),
}

#[derive(Clone, Debug)]
pub struct StoreEvt {
    pub kind: StoreKind,
}
#[derive(Clone, Debug)]
pub enum StoreKind {
    /// Log replayed on open.
    Recovered {
        records: u64,
        tombstones: u64,
        bytes_truncated: u64,
    },
    Fsync { ms: u32 },
    /// Log rewritten without tombstoned records.
    Compacted { reclaimed: u64, bytes: u64 },
}

#[derive(Clone, Debug)]
pub struct IndexEvt {
    pub kind: IndexKind,
}
#[derive(Clone, Debug)]
pub enum IndexKind {
    /// Graph rebuilt from the record store.
    Rebuilt { nodes: u64, ms: u32 },
    SnapshotSaved { nodes: u64, bytes: u64 },
    SnapshotLoaded { nodes: u64, caught_up: u64 },
    /// Ids whose index update failed after a durable insert.
    MarkedStale { id: u64 },
}

/// Macros (simple versions). Can be feature-gated if desired.
#[macro_export]
macro_rules! obs_count {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.counter($name, $labels).inc($v as u64);
    }};
}
#[macro_export]
macro_rules! obs_gauge {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.gauge($name, $labels).set($v as i64);
    }};
}
#[macro_export]
macro_rules! obs_hist {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.histo($name, &[], $labels).observe($v as f64);
    }};
}
#[macro_export]
macro_rules! obs_timed {
    ($m:expr, $name:expr, $labels:expr, $body:block) => {{
        let __t = std::time::Instant::now();
        let __ret = { $body };
        let __ms = __t.elapsed().as_secs_f64() * 1000.0;
        $m.histo($name, &[], $labels).observe(__ms);
        __ret
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct CountingC(Arc<AtomicU64>);
    impl Counter for CountingC {
        fn inc(&self, v: u64) {
            self.0.fetch_add(v, Ordering::Relaxed);
        }
    }

    #[derive(Default)]
    struct CountingMeter {
        total: Arc<AtomicU64>,
        timed: Arc<AtomicU64>,
    }
    struct TimedH(Arc<AtomicU64>);
    impl Histogram for TimedH {
        fn observe(&self, _v: f64) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }
    impl Meter for CountingMeter {
        fn counter(
            &self,
            _n: &'static str,
            _l: &'static [(&'static str, &'static str)],
        ) -> Box<dyn Counter> {
            Box::new(CountingC(self.total.clone()))
        }
        fn gauge(
            &self,
            _n: &'static str,
            _l: &'static [(&'static str, &'static str)],
        ) -> Box<dyn Gauge> {
            Box::new(NoopG)
        }
        fn histo(
            &self,
            _n: &'static str,
            _b: &'static [f64],
            _l: &'static [(&'static str, &'static str)],
        ) -> Box<dyn Histogram> {
            Box::new(TimedH(self.timed.clone()))
        }
        fn emit(&self, _e: VizEvent) {}
    }

    #[test]
    fn test_macros_route_to_meter() {
        let meter = CountingMeter::default();
        obs_count!(meter, "store_inserts_total", &[], 3);
        obs_count!(meter, "store_inserts_total", &[], 2);
        assert_eq!(meter.total.load(Ordering::Relaxed), 5);

        let value = obs_timed!(meter, "engine_search_latency_ms", &[], { 40 + 2 });
        assert_eq!(value, 42);
        assert_eq!(meter.timed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_noop_meter_accepts_everything() {
        let meter = NoopMeter;
        obs_gauge!(meter, "store_live_records", &[], 10);
        obs_hist!(meter, "index_insert_latency_ms", &[], 1.5);
        meter.emit(VizEvent::Index(IndexEvt {
            kind: IndexKind::Rebuilt { nodes: 1, ms: 0 },
        }));
    }
}
