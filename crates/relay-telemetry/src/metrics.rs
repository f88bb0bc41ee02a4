use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Type of metric.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Point-in-time value of one labelled metric.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
    pub metric_type: MetricType,
}

/// In-memory counter. Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// In-memory gauge. Can go up or down.
struct Gauge {
    // f64 bits, so the value can be updated atomically
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
    fn set(&self, v: f64) {
        self.value.store(v.to_bits() as i64, Ordering::Relaxed);
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed) as u64)
    }
}

/// Most recent observations kept per histogram for percentiles.
const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Default)]
struct HistogramState {
    count: u64,
    sum: f64,
    recent: VecDeque<f64>,
}

/// In-memory histogram. `count` and `sum` cover every observation;
/// percentiles cover the last [`HISTOGRAM_WINDOW`] of them.
struct Histogram {
    state: Mutex<HistogramState>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            state: Mutex::new(HistogramState::default()),
        }
    }
    fn observe(&self, value: f64) {
        let mut state = self.state.lock();
        state.count += 1;
        state.sum += value;
        if state.recent.len() == HISTOGRAM_WINDOW {
            state.recent.pop_front();
        }
        state.recent.push_back(value);
    }
    fn summary(&self) -> HistogramSummary {
        let state = self.state.lock();
        if state.recent.is_empty() {
            return HistogramSummary::default();
        }
        let mut obs: Vec<f64> = state.recent.iter().copied().collect();
        obs.sort_by(|a, b| a.total_cmp(b));
        let n = obs.len();
        HistogramSummary {
            count: state.count,
            sum: state.sum,
            p50: obs[n / 2],
            p95: obs[((n as f64 * 0.95) as usize).min(n - 1)],
            p99: obs[((n as f64 * 0.99) as usize).min(n - 1)],
        }
    }
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric key: name + sorted labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: impl Into<String>, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.into(),
            labels: sorted,
        }
    }
}

/// Thread-safe in-process metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by n.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        let counters = self.counters.read();
        if let Some(c) = counters.get(&key) {
            c.increment(n);
            return;
        }
        drop(counters);
        let mut counters = self.counters.write();
        counters.entry(key).or_insert_with(Counter::new).increment(n);
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(&key) {
            g.set(value);
            return;
        }
        drop(gauges);
        let mut gauges = self.gauges.write();
        gauges.entry(key).or_insert_with(Gauge::new).set(value);
    }

    /// Record a histogram observation.
    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let histograms = self.histograms.read();
        if let Some(h) = histograms.get(&key) {
            h.observe(value);
            return;
        }
        drop(histograms);
        let mut histograms = self.histograms.write();
        histograms.entry(key).or_insert_with(Histogram::new).observe(value);
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(|h| h.summary())
            .unwrap_or_default()
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, |c| c.get())
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, |g| g.get())
    }

    /// Current value of every metric. Histograms report their p50.
    pub fn snapshot(&self) -> Vec<MetricsSnapshot> {
        let mut out = Vec::new();
        for (key, counter) in self.counters.read().iter() {
            out.push(MetricsSnapshot {
                name: key.name.clone(),
                labels: key.labels.clone(),
                value: counter.get() as f64,
                metric_type: MetricType::Counter,
            });
        }
        for (key, gauge) in self.gauges.read().iter() {
            out.push(MetricsSnapshot {
                name: key.name.clone(),
                labels: key.labels.clone(),
                value: gauge.get(),
                metric_type: MetricType::Gauge,
            });
        }
        for (key, histogram) in self.histograms.read().iter() {
            out.push(MetricsSnapshot {
                name: key.name.clone(),
                labels: key.labels.clone(),
                value: histogram.summary().p50,
                metric_type: MetricType::Histogram,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }
}
