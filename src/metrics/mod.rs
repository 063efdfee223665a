//! Metrics registry and metric types.
//!
//! This module provides:
//! - Counters, gauges, histograms, percentile histograms, timers
//! - A process-wide registry keyed by name + sorted labels
//! - A per-thread handle cache so hot-path updates never touch the registry
//! - JSON and Prometheus text exports (see [`export`])
//!
//! Creation goes through a concurrent map; after the first lookup each
//! worker reaches its metrics through a thread-local cache, so a
//! steady-state `counter.inc()` is a single relaxed atomic add.

pub mod export;

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Reservoir size for percentile estimation.
pub const RESERVOIR_SIZE: usize = 1000;

// ============================================================================
// Keys
// ============================================================================

/// Registry lookup key: metric name plus sorted label pairs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    pub fn new(name: &str, labels: &[(&str, &str)]) -> MetricKey {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        MetricKey {
            name: name.to_string(),
            labels,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }
}

// ============================================================================
// Metric types
// ============================================================================

/// Monotonic counter.
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Read/write double value.
#[derive(Default)]
pub struct Gauge {
    bits: AtomicU64,
}

impl Gauge {
    #[inline]
    pub fn set(&self, v: f64) {
        self.bits.store(v.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Add a delta. Non-integer adds need a CAS loop over the bit pattern.
    pub fn add(&self, delta: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .bits
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    pub fn sub(&self, delta: f64) {
        self.add(-delta);
    }

    fn reset(&self) {
        self.set(0.0);
    }
}

/// Count + sum histogram.
#[derive(Default)]
pub struct Histogram {
    count: AtomicU64,
    sum_bits: AtomicU64,
}

impl Histogram {
    pub fn observe(&self, v: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut current = self.sum_bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + v).to_bits();
            match self.sum_bits.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.sum_bits.store(0, Ordering::Relaxed);
    }
}

/// Cached percentile values.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

struct Reservoir {
    samples: Vec<f64>,
    /// Rotating write index once the reservoir is full.
    next: usize,
    cached: Option<Percentiles>,
}

/// Histogram plus a bounded reservoir for percentile queries.
///
/// Writes append at a rotating index; reads sort a copy lazily. Cached
/// percentiles are invalidated on every observe.
pub struct PercentileHistogram {
    totals: Histogram,
    reservoir: Mutex<Reservoir>,
}

impl PercentileHistogram {
    pub fn new() -> PercentileHistogram {
        PercentileHistogram {
            totals: Histogram::default(),
            reservoir: Mutex::new(Reservoir {
                samples: Vec::with_capacity(RESERVOIR_SIZE),
                next: 0,
                cached: None,
            }),
        }
    }

    pub fn observe(&self, v: f64) {
        self.totals.observe(v);
        let mut r = self.reservoir.lock();
        if r.samples.len() < RESERVOIR_SIZE {
            r.samples.push(v);
        } else {
            let i = r.next;
            r.samples[i] = v;
            r.next = (i + 1) % RESERVOIR_SIZE;
        }
        r.cached = None;
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.totals.count()
    }

    #[inline]
    pub fn sum(&self) -> f64 {
        self.totals.sum()
    }

    /// Percentiles over the current reservoir, lazily sorted and cached.
    pub fn percentiles(&self) -> Percentiles {
        let mut r = self.reservoir.lock();
        if let Some(cached) = r.cached {
            return cached;
        }
        if r.samples.is_empty() {
            return Percentiles::default();
        }
        let mut sorted = r.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p = Percentiles {
            p50: rank(&sorted, 0.50),
            p90: rank(&sorted, 0.90),
            p95: rank(&sorted, 0.95),
            p99: rank(&sorted, 0.99),
        };
        r.cached = Some(p);
        p
    }

    fn reset(&self) {
        self.totals.reset();
        let mut r = self.reservoir.lock();
        r.samples.clear();
        r.next = 0;
        r.cached = None;
    }
}

impl Default for PercentileHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Nearest-rank percentile over a sorted sample.
fn rank(sorted: &[f64], q: f64) -> f64 {
    let idx = ((q * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len()) - 1;
    sorted[idx]
}

/// Duration recorder backed by a percentile histogram of seconds.
pub struct Timer {
    hist: PercentileHistogram,
}

impl Timer {
    pub fn new() -> Timer {
        Timer {
            hist: PercentileHistogram::new(),
        }
    }

    #[inline]
    pub fn record(&self, elapsed: Duration) {
        self.hist.observe(elapsed.as_secs_f64());
    }

    /// Start a guard that records on drop.
    pub fn start(&self) -> TimerGuard<'_> {
        TimerGuard {
            timer: self,
            started: Instant::now(),
        }
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.hist.count()
    }

    #[inline]
    pub fn sum_seconds(&self) -> f64 {
        self.hist.sum()
    }

    pub fn percentiles(&self) -> Percentiles {
        self.hist.percentiles()
    }

    fn reset(&self) {
        self.hist.reset();
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TimerGuard<'a> {
    timer: &'a Timer,
    started: Instant,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.timer.record(self.started.elapsed());
    }
}

// ============================================================================
// Registry
// ============================================================================

/// A registered metric handle. Cloning shares the underlying storage.
#[derive(Clone)]
pub enum Metric {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Histogram(Arc<Histogram>),
    Percentile(Arc<PercentileHistogram>),
    Timer(Arc<Timer>),
}

impl Metric {
    fn kind(&self) -> &'static str {
        match self {
            Metric::Counter(_) => "counter",
            Metric::Gauge(_) => "gauge",
            Metric::Histogram(_) => "histogram",
            Metric::Percentile(_) => "percentile_histogram",
            Metric::Timer(_) => "timer",
        }
    }

    fn reset(&self) {
        match self {
            Metric::Counter(c) => c.reset(),
            Metric::Gauge(g) => g.reset(),
            Metric::Histogram(h) => h.reset(),
            Metric::Percentile(p) => p.reset(),
            Metric::Timer(t) => t.reset(),
        }
    }
}

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Per-thread handle cache, keyed by registry id + metric key.
    static HANDLE_CACHE: RefCell<HashMap<(u64, MetricKey), Metric>> =
        RefCell::new(HashMap::new());
}

/// Name + label keyed metric registry.
///
/// Metrics are created on first access and live for the registry lifetime.
/// The shared map is only touched on first per-thread access; afterwards
/// handles come from a thread-local cache.
pub struct MetricsRegistry {
    id: u64,
    metrics: DashMap<MetricKey, Metric>,
}

impl MetricsRegistry {
    pub fn new() -> MetricsRegistry {
        MetricsRegistry {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            metrics: DashMap::new(),
        }
    }

    /// Process-wide registry for applications that want the singleton form.
    pub fn global() -> &'static Arc<MetricsRegistry> {
        static GLOBAL: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(MetricsRegistry::new()))
    }

    fn lookup(&self, key: MetricKey, create: impl FnOnce() -> Metric) -> Metric {
        HANDLE_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            if let Some(m) = cache.get(&(self.id, key.clone())) {
                return m.clone();
            }
            let metric = self
                .metrics
                .entry(key.clone())
                .or_insert_with(create)
                .value()
                .clone();
            cache.insert((self.id, key), metric.clone());
            metric
        })
    }

    pub fn counter(&self, name: &str) -> Arc<Counter> {
        self.counter_with(name, &[])
    }

    pub fn counter_with(&self, name: &str, labels: &[(&str, &str)]) -> Arc<Counter> {
        let m = self.lookup(MetricKey::new(name, labels), || {
            Metric::Counter(Arc::new(Counter::default()))
        });
        match m {
            Metric::Counter(c) => c,
            other => panic!("metric {name:?} already registered as {}", other.kind()),
        }
    }

    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        self.gauge_with(name, &[])
    }

    pub fn gauge_with(&self, name: &str, labels: &[(&str, &str)]) -> Arc<Gauge> {
        let m = self.lookup(MetricKey::new(name, labels), || {
            Metric::Gauge(Arc::new(Gauge::default()))
        });
        match m {
            Metric::Gauge(g) => g,
            other => panic!("metric {name:?} already registered as {}", other.kind()),
        }
    }

    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        self.histogram_with(name, &[])
    }

    pub fn histogram_with(&self, name: &str, labels: &[(&str, &str)]) -> Arc<Histogram> {
        let m = self.lookup(MetricKey::new(name, labels), || {
            Metric::Histogram(Arc::new(Histogram::default()))
        });
        match m {
            Metric::Histogram(h) => h,
            other => panic!("metric {name:?} already registered as {}", other.kind()),
        }
    }

    pub fn percentile_histogram(&self, name: &str) -> Arc<PercentileHistogram> {
        self.percentile_histogram_with(name, &[])
    }

    pub fn percentile_histogram_with(
        &self,
        name: &str,
        labels: &[(&str, &str)],
    ) -> Arc<PercentileHistogram> {
        let m = self.lookup(MetricKey::new(name, labels), || {
            Metric::Percentile(Arc::new(PercentileHistogram::new()))
        });
        match m {
            Metric::Percentile(p) => p,
            other => panic!("metric {name:?} already registered as {}", other.kind()),
        }
    }

    pub fn timer(&self, name: &str) -> Arc<Timer> {
        self.timer_with(name, &[])
    }

    pub fn timer_with(&self, name: &str, labels: &[(&str, &str)]) -> Arc<Timer> {
        let m = self.lookup(MetricKey::new(name, labels), || {
            Metric::Timer(Arc::new(Timer::new()))
        });
        match m {
            Metric::Timer(t) => t,
            other => panic!("metric {name:?} already registered as {}", other.kind()),
        }
    }

    /// Snapshot every registered metric, sorted by key for stable output.
    pub(crate) fn sorted_entries(&self) -> Vec<(MetricKey, Metric)> {
        let mut entries: Vec<(MetricKey, Metric)> = self
            .metrics
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.name.cmp(&b.0.name).then_with(|| a.0.labels.cmp(&b.0.labels)));
        entries
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Zero every metric. Intended for tests; live handles stay valid.
    pub fn reset(&self) {
        for entry in self.metrics.iter() {
            entry.value().reset();
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_basics() {
        let reg = MetricsRegistry::new();
        let c = reg.counter("requests_total");
        c.inc();
        c.add(4);
        assert_eq!(c.get(), 5);
        // Same key returns the same storage.
        assert_eq!(reg.counter("requests_total").get(), 5);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn labels_are_part_of_the_key() {
        let reg = MetricsRegistry::new();
        let a = reg.counter_with("hits", &[("route", "/a")]);
        let b = reg.counter_with("hits", &[("route", "/b")]);
        a.inc();
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 0);
        // Label order does not matter.
        let a2 = reg.counter_with("hits", &[("route", "/a")]);
        assert_eq!(a2.get(), 1);
    }

    #[test]
    fn gauge_cas_add() {
        let reg = MetricsRegistry::new();
        let g = reg.gauge("load");
        g.set(1.5);
        g.add(2.25);
        g.sub(0.75);
        assert!((g.get() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn histogram_tracks_count_and_sum() {
        let h = Histogram::default();
        h.observe(1.0);
        h.observe(2.5);
        assert_eq!(h.count(), 2);
        assert!((h.sum() - 3.5).abs() < f64::EPSILON);
    }

    #[test]
    fn percentiles_over_known_distribution() {
        let p = PercentileHistogram::new();
        for i in 1..=100 {
            p.observe(i as f64);
        }
        let pct = p.percentiles();
        assert_eq!(pct.p50, 50.0);
        assert_eq!(pct.p90, 90.0);
        assert_eq!(pct.p95, 95.0);
        assert_eq!(pct.p99, 99.0);
    }

    #[test]
    fn reservoir_rotates_past_capacity() {
        let p = PercentileHistogram::new();
        for i in 0..(RESERVOIR_SIZE + 500) {
            p.observe(i as f64);
        }
        assert_eq!(p.count(), (RESERVOIR_SIZE + 500) as u64);
        // Reservoir holds the most recent window; p99 must come from it.
        assert!(p.percentiles().p99 >= 500.0);
    }

    #[test]
    fn cache_invalidated_on_observe() {
        let p = PercentileHistogram::new();
        p.observe(10.0);
        assert_eq!(p.percentiles().p50, 10.0);
        p.observe(1000.0);
        assert_eq!(p.percentiles().p99, 1000.0);
    }

    #[test]
    fn timer_records_durations() {
        let t = Timer::new();
        t.record(Duration::from_millis(250));
        {
            let _guard = t.start();
        }
        assert_eq!(t.count(), 2);
        assert!(t.sum_seconds() >= 0.25);
    }

    #[test]
    fn concurrent_counter_is_exact() {
        let reg = Arc::new(MetricsRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            handles.push(std::thread::spawn(move || {
                let c = reg.counter("shared_total");
                for _ in 0..10_000 {
                    c.inc();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.counter("shared_total").get(), 80_000);
    }

    #[test]
    fn reset_zeroes_live_handles() {
        let reg = MetricsRegistry::new();
        let c = reg.counter("to_reset");
        c.add(7);
        reg.reset();
        assert_eq!(c.get(), 0);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn kind_mismatch_panics() {
        let reg = MetricsRegistry::new();
        let _ = reg.counter("dual");
        let _ = reg.gauge("dual");
    }
}
