use crate::types::SessionId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Metric labels, kept sorted so the same label set always maps to one series
pub type Labels = BTreeMap<String, String>;

/// Latency buckets in milliseconds
const LATENCY_BUCKETS_MS: [f64; 12] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// Counter - monotonically increasing value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Counter {
    pub name: String,
    pub value: u64,
    pub labels: Labels,
    pub last_updated: DateTime<Utc>,
}

/// Gauge - value that can go up or down
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gauge {
    pub name: String,
    pub value: f64,
    pub labels: Labels,
    pub last_updated: DateTime<Utc>,
}

/// Histogram - cumulative bucket counts over observed values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram {
    pub name: String,
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
    pub labels: Labels,
    pub last_updated: DateTime<Utc>,
}

impl Histogram {
    fn empty(name: &str, labels: Labels) -> Self {
        Self {
            name: name.to_string(),
            buckets: LATENCY_BUCKETS_MS.to_vec(),
            counts: vec![0; LATENCY_BUCKETS_MS.len()],
            sum: 0.0,
            count: 0,
            labels,
            last_updated: Utc::now(),
        }
    }

    fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        for (bucket, count) in self.buckets.iter().zip(self.counts.iter_mut()) {
            if value <= *bucket {
                *count += 1;
            }
        }
        self.last_updated = Utc::now();
    }

    /// Upper bucket bound containing the given percentile (p50, p95, p99, etc.)
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 || !(0.0..=100.0).contains(&p) {
            return None;
        }

        let target_count = ((self.count as f64) * (p / 100.0)).ceil() as u64;
        self.buckets
            .iter()
            .zip(self.counts.iter())
            .find(|(_, count)| **count >= target_count)
            .map(|(bucket, _)| *bucket)
    }

    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

/// Point-in-time copy of every series
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<Counter>,
    pub gauges: Vec<Gauge>,
    pub histograms: Vec<Histogram>,
}

impl MetricsSnapshot {
    /// Find a counter value by name and label set
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        let labels = to_labels(labels);
        self.counters
            .iter()
            .find(|c| c.name == name && c.labels == labels)
            .map(|c| c.value)
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let labels = to_labels(labels);
        self.gauges
            .iter()
            .find(|g| g.name == name && g.labels == labels)
            .map(|g| g.value)
    }

    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Option<&Histogram> {
        let labels = to_labels(labels);
        self.histograms
            .iter()
            .find(|h| h.name == name && h.labels == labels)
    }
}

fn to_labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Default)]
struct Series {
    counters: HashMap<(String, Labels), Counter>,
    gauges: HashMap<(String, Labels), Gauge>,
    histograms: HashMap<(String, Labels), Histogram>,
}

/// Generic labelled metric store
#[derive(Default)]
pub struct MetricsCollector {
    series: Mutex<Series>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: Labels) {
        let mut series = self.series.lock();
        let counter = series
            .counters
            .entry((name.to_string(), labels.clone()))
            .or_insert_with(|| Counter {
                name: name.to_string(),
                value: 0,
                labels,
                last_updated: Utc::now(),
            });
        counter.value += 1;
        counter.last_updated = Utc::now();
    }

    pub fn add_to_gauge(&self, name: &str, delta: f64, labels: Labels) {
        let mut series = self.series.lock();
        let gauge = series
            .gauges
            .entry((name.to_string(), labels.clone()))
            .or_insert_with(|| Gauge {
                name: name.to_string(),
                value: 0.0,
                labels,
                last_updated: Utc::now(),
            });
        gauge.value += delta;
        gauge.last_updated = Utc::now();
    }

    pub fn observe_histogram(&self, name: &str, value: f64, labels: Labels) {
        let mut series = self.series.lock();
        series
            .histograms
            .entry((name.to_string(), labels.clone()))
            .or_insert_with(|| Histogram::empty(name, labels))
            .observe(value);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let series = self.series.lock();
        MetricsSnapshot {
            counters: series.counters.values().cloned().collect(),
            gauges: series.gauges.values().cloned().collect(),
            histograms: series.histograms.values().cloned().collect(),
        }
    }
}

/// Server-level metrics keyed by method, tool and session.
///
/// Callers only record; readers take snapshots.
#[derive(Default)]
pub struct ServerMetrics {
    collector: MetricsCollector,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one inbound request, and attribute it to its session if known
    pub fn record_request(&self, method: &str, session_id: Option<&SessionId>) {
        self.collector
            .increment_counter("requests_total", to_labels(&[("method", method)]));
        if let Some(session_id) = session_id {
            let session = session_id.to_string();
            self.collector.increment_counter(
                "session_requests_total",
                to_labels(&[("session", &session)]),
            );
        }
    }

    pub fn record_tool_call(
        &self,
        tool: &str,
        session_id: Option<&SessionId>,
        duration: Duration,
        success: bool,
    ) {
        let status = if success { "success" } else { "error" };
        self.collector.increment_counter(
            "tool_calls_total",
            to_labels(&[("tool", tool), ("status", status)]),
        );
        self.collector.observe_histogram(
            "tool_call_duration_ms",
            duration.as_secs_f64() * 1000.0,
            to_labels(&[("tool", tool)]),
        );
        if let Some(session_id) = session_id {
            let session = session_id.to_string();
            self.collector.increment_counter(
                "session_tool_calls_total",
                to_labels(&[("session", &session)]),
            );
        }
    }

    pub fn session_opened(&self) {
        self.collector.add_to_gauge("sessions_active", 1.0, Labels::new());
    }

    pub fn session_closed(&self) {
        self.collector.add_to_gauge("sessions_active", -1.0, Labels::new());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.collector.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increment() {
        let collector = MetricsCollector::new();
        let labels = to_labels(&[("method", "ping")]);

        collector.increment_counter("requests_total", labels.clone());
        collector.increment_counter("requests_total", labels);

        let snapshot = collector.snapshot();
        assert_eq!(
            snapshot.counter("requests_total", &[("method", "ping")]),
            Some(2)
        );
    }

    #[test]
    fn test_label_order_does_not_split_series() {
        let collector = MetricsCollector::new();

        collector.increment_counter("calls", to_labels(&[("a", "1"), ("b", "2")]));
        collector.increment_counter("calls", to_labels(&[("b", "2"), ("a", "1")]));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.counters.len(), 1);
        assert_eq!(snapshot.counter("calls", &[("a", "1"), ("b", "2")]), Some(2));
    }

    #[test]
    fn test_histogram_percentile_and_average() {
        let collector = MetricsCollector::new();
        for value in [2.0, 4.0, 20.0, 30.0, 400.0] {
            collector.observe_histogram("latency", value, Labels::new());
        }

        let snapshot = collector.snapshot();
        let histogram = snapshot.histogram("latency", &[]).unwrap();
        assert_eq!(histogram.count, 5);
        assert_eq!(histogram.average(), Some(91.2));
        assert_eq!(histogram.percentile(40.0), Some(5.0));
        assert_eq!(histogram.percentile(100.0), Some(500.0));
        assert_eq!(histogram.percentile(101.0), None);
    }

    #[test]
    fn test_server_metrics_per_tool_and_session() {
        let metrics = ServerMetrics::new();
        let session = SessionId::new();
        let session_label = session.to_string();

        metrics.record_request("tools/call", Some(&session));
        metrics.record_tool_call("echo", Some(&session), Duration::from_millis(3), true);
        metrics.record_tool_call("echo", None, Duration::from_millis(7), false);

        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot.counter("tool_calls_total", &[("tool", "echo"), ("status", "success")]),
            Some(1)
        );
        assert_eq!(
            snapshot.counter("tool_calls_total", &[("tool", "echo"), ("status", "error")]),
            Some(1)
        );
        assert_eq!(
            snapshot.counter("session_requests_total", &[("session", &session_label)]),
            Some(1)
        );
        let histogram = snapshot
            .histogram("tool_call_duration_ms", &[("tool", "echo")])
            .unwrap();
        assert_eq!(histogram.count, 2);
    }

    #[test]
    fn test_sessions_active_gauge() {
        let metrics = ServerMetrics::new();
        metrics.session_opened();
        metrics.session_opened();
        metrics.session_closed();

        assert_eq!(metrics.snapshot().gauge("sessions_active", &[]), Some(1.0));
    }
}
