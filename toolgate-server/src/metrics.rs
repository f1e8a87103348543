//! Metrics collection for the gateway.
//!
//! Counters, gauges, and histograms with label maps. Histograms keep the
//! last 1000 samples per series; retrieval copies under the lock and
//! derives summary statistics.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Samples retained per histogram series.
const HISTOGRAM_WINDOW: usize = 1000;

#[derive(Debug, Default)]
struct Inner {
    counters: HashMap<String, f64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Vec<f64>>,
}

/// Summary of one histogram series.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistogramSummary {
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

/// Point-in-time copy of all collected metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, f64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramSummary>,
}

/// Thread-safe metrics collector.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    inner: Mutex<Inner>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = metric_key(name, labels);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *inner.counters.entry(key).or_insert(0.0) += value;
    }

    pub fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = metric_key(name, labels);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.gauges.insert(key, value);
    }

    pub fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let key = metric_key(name, labels);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let series = inner.histograms.entry(key).or_default();
        series.push(value);
        if series.len() > HISTOGRAM_WINDOW {
            let excess = series.len() - HISTOGRAM_WINDOW;
            series.drain(..excess);
        }
    }

    /// Copy everything under the lock and summarize histogram series.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            histograms: inner
                .histograms
                .iter()
                .map(|(key, values)| {
                    let count = values.len();
                    let sum: f64 = values.iter().sum();
                    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    (
                        key.clone(),
                        HistogramSummary {
                            count,
                            sum,
                            min: if count == 0 { 0.0 } else { min },
                            max: if count == 0 { 0.0 } else { max },
                            avg: if count == 0 { 0.0 } else { sum / count as f64 },
                        },
                    )
                })
                .collect(),
        }
    }

    /// Clear all series (testing).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.counters.clear();
        inner.gauges.clear();
        inner.histograms.clear();
    }
}

/// `name{k1=v1,k2=v2}` with labels sorted for a stable key.
fn metric_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_by_key(|(k, _)| *k);
    let rendered = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}{{{rendered}}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let metrics = MetricsCollector::new();
        metrics.increment_counter("webhooks_received", 1.0, &[("provider", "github")]);
        metrics.increment_counter("webhooks_received", 1.0, &[("provider", "github")]);
        metrics.increment_counter("webhooks_received", 1.0, &[("provider", "slack")]);

        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot.counters["webhooks_received{provider=github}"],
            2.0
        );
        assert_eq!(snapshot.counters["webhooks_received{provider=slack}"], 1.0);
    }

    #[test]
    fn test_gauge_overwrites() {
        let metrics = MetricsCollector::new();
        metrics.set_gauge("active_triggers", 5.0, &[]);
        metrics.set_gauge("active_triggers", 3.0, &[]);
        assert_eq!(metrics.snapshot().gauges["active_triggers"], 3.0);
    }

    #[test]
    fn test_histogram_summary() {
        let metrics = MetricsCollector::new();
        for v in [1.0, 2.0, 3.0] {
            metrics.record_histogram("latency_ms", v, &[]);
        }
        let summary = &metrics.snapshot().histograms["latency_ms"];
        assert_eq!(summary.count, 3);
        assert_eq!(summary.sum, 6.0);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 3.0);
        assert_eq!(summary.avg, 2.0);
    }

    #[test]
    fn test_histogram_window_bound() {
        let metrics = MetricsCollector::new();
        for i in 0..1500 {
            metrics.record_histogram("latency_ms", i as f64, &[]);
        }
        let summary = &metrics.snapshot().histograms["latency_ms"];
        assert_eq!(summary.count, 1000);
        // The oldest 500 samples were dropped.
        assert_eq!(summary.min, 500.0);
    }

    #[test]
    fn test_metric_key_label_order_stable() {
        assert_eq!(
            metric_key("m", &[("b", "2"), ("a", "1")]),
            metric_key("m", &[("a", "1"), ("b", "2")])
        );
        assert_eq!(metric_key("m", &[]), "m");
    }

    #[test]
    fn test_reset() {
        let metrics = MetricsCollector::new();
        metrics.increment_counter("c", 1.0, &[]);
        metrics.reset();
        assert!(metrics.snapshot().counters.is_empty());
    }
}
