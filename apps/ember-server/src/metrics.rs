//! Prometheus metrics implementation.
//!
//! Implements ember-observe::Meter using prometheus-client.

use ember_observe::{Counter, Gauge, Histogram, IndexKind, Meter, StoreKind, VizEvent};
use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter as PromCounter;
use prometheus_client::metrics::family::{Family, MetricConstructor};
use prometheus_client::metrics::gauge::Gauge as PromGauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram as PromHistogram};
use prometheus_client::registry::Registry;
use std::collections::HashMap;

type Labels = Vec<(String, String)>;

/// Builds histograms with the buckets the first caller asked for.
#[derive(Debug, Clone)]
struct Buckets(&'static [f64]);

impl MetricConstructor<PromHistogram> for Buckets {
    fn new_metric(&self) -> PromHistogram {
        if self.0.is_empty() {
            // 0.25ms .. ~128ms
            PromHistogram::new(exponential_buckets(0.25, 2.0, 10))
        } else {
            PromHistogram::new(self.0.iter().copied())
        }
    }
}

/// Prometheus metrics collector.
pub struct PrometheusMeter {
    registry: Mutex<Registry>,
    counters: Mutex<HashMap<&'static str, Family<Labels, PromCounter>>>,
    gauges: Mutex<HashMap<&'static str, Family<Labels, PromGauge>>>,
    histograms: Mutex<HashMap<&'static str, Family<Labels, PromHistogram, Buckets>>>,
}

impl PrometheusMeter {
    /// Create a new Prometheus meter with a fresh registry.
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let registry = self.registry.lock();
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &registry) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    fn get_or_create_counter(&self, name: &'static str) -> Family<Labels, PromCounter> {
        let mut counters = self.counters.lock();

        if let Some(family) = counters.get(name) {
            return family.clone();
        }

        let family = Family::<Labels, PromCounter>::default();

        // The text encoder appends `_total` to counters itself.
        let base = name.strip_suffix("_total").unwrap_or(name);
        self.registry
            .lock()
            .register(base, "Counter", family.clone());

        counters.insert(name, family.clone());
        family
    }

    fn get_or_create_gauge(&self, name: &'static str) -> Family<Labels, PromGauge> {
        let mut gauges = self.gauges.lock();

        if let Some(family) = gauges.get(name) {
            return family.clone();
        }

        let family = Family::<Labels, PromGauge>::default();
        self.registry.lock().register(name, "Gauge", family.clone());

        gauges.insert(name, family.clone());
        family
    }

    fn get_or_create_histogram(
        &self,
        name: &'static str,
        buckets: &'static [f64],
    ) -> Family<Labels, PromHistogram, Buckets> {
        let mut histograms = self.histograms.lock();

        if let Some(family) = histograms.get(name) {
            return family.clone();
        }

        let family = Family::new_with_constructor(Buckets(buckets));
        self.registry
            .lock()
            .register(name, "Histogram", family.clone());

        histograms.insert(name, family.clone());
        family
    }
}

impl Default for PrometheusMeter {
    fn default() -> Self {
        Self::new()
    }
}

fn label_vec(labels: &'static [(&'static str, &'static str)]) -> Labels {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

struct PrometheusCounter {
    counter: PromCounter,
}

impl Counter for PrometheusCounter {
    fn inc(&self, v: u64) {
        self.counter.inc_by(v);
    }
}

struct PrometheusGauge {
    gauge: PromGauge,
}

impl Gauge for PrometheusGauge {
    fn set(&self, v: i64) {
        self.gauge.set(v);
    }
}

struct PrometheusHistogram {
    histogram: PromHistogram,
}

impl Histogram for PrometheusHistogram {
    fn observe(&self, v: f64) {
        self.histogram.observe(v);
    }
}

impl Meter for PrometheusMeter {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        let family = self.get_or_create_counter(name);
        let counter = family.get_or_create(&label_vec(labels)).clone();
        Box::new(PrometheusCounter { counter })
    }

    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        let family = self.get_or_create_gauge(name);
        let gauge = family.get_or_create(&label_vec(labels)).clone();
        Box::new(PrometheusGauge { gauge })
    }

    fn histo(
        &self,
        name: &'static str,
        buckets: &'static [f64],
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        let family = self.get_or_create_histogram(name, buckets);
        let histogram = family.get_or_create(&label_vec(labels)).clone();
        Box::new(PrometheusHistogram { histogram })
    }

    fn emit(&self, evt: VizEvent) {
        // Events have no Prometheus shape; they go to the log instead.
        match evt {
            VizEvent::Store(e) => match e.kind {
                StoreKind::Fsync { .. } => {}
                kind => tracing::debug!(event = ?kind, "store event"),
            },
            VizEvent::Index(e) => match e.kind {
                IndexKind::MarkedStale { id } => tracing::debug!(id, "index marked stale"),
                kind => tracing::debug!(event = ?kind, "index event"),
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_observe::StoreEvt;

    #[test]
    fn test_counter() {
        let meter = PrometheusMeter::new();
        let counter = meter.counter("test_requests_total", &[("path", "exact")]);
        counter.inc(5);
        counter.inc(3);

        let output = meter.export();
        assert!(output.contains("test_requests_total{path=\"exact\"} 8"));
        assert!(!output.contains("total_total"));
    }

    #[test]
    fn test_gauge() {
        let meter = PrometheusMeter::new();
        let gauge = meter.gauge("test_gauge", &[("label", "value")]);
        gauge.set(42);

        let output = meter.export();
        assert!(output.contains("test_gauge{label=\"value\"} 42"));
    }

    #[test]
    fn test_histogram_custom_buckets() {
        let meter = PrometheusMeter::new();
        let histo = meter.histo("test_histogram", &[1.0, 10.0], &[]);
        histo.observe(0.5);
        histo.observe(5.0);

        let output = meter.export();
        assert!(output.contains("test_histogram_count 2"));
        assert!(output.contains("test_histogram_bucket"));
    }

    #[test]
    fn test_same_name_shares_family() {
        let meter = PrometheusMeter::new();
        meter.counter("shared_total", &[]).inc(1);
        meter.counter("shared_total", &[]).inc(2);

        assert!(meter.export().contains("shared_total 3"));
    }

    #[test]
    fn test_emit_does_not_panic() {
        let meter = PrometheusMeter::new();
        meter.emit(VizEvent::Store(StoreEvt {
            kind: StoreKind::Compacted {
                reclaimed: 1,
                bytes: 10,
            },
        }));
    }
}
