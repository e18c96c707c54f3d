//! Injected metrics collection.
//!
//! The core never owns a process-wide metrics registry; every subsystem
//! receives a `MetricsSink`. The in-memory `AtomicMetrics` implementation
//! backs tests and local scraping.

use std::sync::Arc;

use dashmap::DashMap;

pub trait MetricsSink: Send + Sync {
    fn incr_by(&self, name: &str, delta: u64, labels: &[(&str, &str)]);

    fn incr(&self, name: &str, labels: &[(&str, &str)]) {
        self.incr_by(name, 1, labels);
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Record one sample of a distribution (durations, ages).
    fn observe(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// Series key: metric name plus sorted `k=v` label pairs. Sorting keeps
/// the key independent of call-site label order.
fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    pairs.sort();
    format!("{}{{{}}}", name, pairs.join(","))
}

#[derive(Default)]
pub struct AtomicMetrics {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    observations: DashMap<String, (u64, f64)>,
}

impl AtomicMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current counter value for a series; 0 if never incremented.
    #[must_use]
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(&series_key(name, labels))
            .map_or(0, |v| *v)
    }

    #[must_use]
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges.get(&series_key(name, labels)).map(|v| *v)
    }

    /// (count, sum) of observed samples for a series.
    #[must_use]
    pub fn observation(&self, name: &str, labels: &[(&str, &str)]) -> (u64, f64) {
        self.observations
            .get(&series_key(name, labels))
            .map_or((0, 0.0), |v| *v)
    }

    /// Sum of a counter across all label combinations, for assertions
    /// that do not care about the exact series.
    #[must_use]
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|e| e.key() == name || e.key().starts_with(&format!("{}{{", name)))
            .map(|e| *e.value())
            .sum()
    }
}

impl MetricsSink for AtomicMetrics {
    fn incr_by(&self, name: &str, delta: u64, labels: &[(&str, &str)]) {
        *self.counters.entry(series_key(name, labels)).or_insert(0) += delta;
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.gauges.insert(series_key(name, labels), value);
    }

    fn observe(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let mut entry = self
            .observations
            .entry(series_key(name, labels))
            .or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_order_does_not_split_series() {
        let m = AtomicMetrics::new();
        m.incr("shares_total", &[("peer", "a"), ("outcome", "ok")]);
        m.incr("shares_total", &[("outcome", "ok"), ("peer", "a")]);
        assert_eq!(m.counter("shares_total", &[("peer", "a"), ("outcome", "ok")]), 2);
    }

    #[test]
    fn test_counter_total_across_labels() {
        let m = AtomicMetrics::new();
        m.incr("cycles_total", &[("result", "success")]);
        m.incr("cycles_total", &[("result", "error")]);
        m.incr("other_total", &[]);
        assert_eq!(m.counter_total("cycles_total"), 2);
    }

    #[test]
    fn test_observation_accumulates() {
        let m = AtomicMetrics::new();
        m.observe("cycle_seconds", 1.5, &[]);
        m.observe("cycle_seconds", 2.5, &[]);
        assert_eq!(m.observation("cycle_seconds", &[]), (2, 4.0));
    }
}
