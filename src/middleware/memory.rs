//! Heap-pressure monitoring and load shedding.
//!
//! The monitor classifies process heap usage against two water marks and
//! exposes the result as an atomic state machine. Its middleware form
//! short-circuits requests with a well-formed 503 while the state is
//! Critical, unless the path is on the bypass list (health and metrics
//! endpoints usually are).
//!
//! There is no tracing collector to kick here, so the `Collect` action
//! degenerates to logging plus the transition callback; classification,
//! counters, and rejection behavior are unaffected.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::System;

use crate::context::Context;
use crate::error::BoxError;
use crate::metrics::{Counter, MetricsRegistry};
use crate::middleware::{Middleware, Next};

/// Heap-pressure classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryState {
    Normal,
    Pressure,
    Critical,
}

impl MemoryState {
    fn from_u8(v: u8) -> MemoryState {
        match v {
            2 => MemoryState::Critical,
            1 => MemoryState::Pressure,
            _ => MemoryState::Normal,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            MemoryState::Normal => 0,
            MemoryState::Pressure => 1,
            MemoryState::Critical => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryState::Normal => "normal",
            MemoryState::Pressure => "pressure",
            MemoryState::Critical => "critical",
        }
    }
}

/// What to do when the state leaves Normal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PressureAction {
    /// Request a collection pass (logged here; no tracing GC exists).
    Collect,
    /// Log the transition only.
    LogOnly,
    /// Rely on the transition callback alone.
    Custom,
    /// Do nothing beyond state tracking.
    None,
}

type TransitionCallback = Arc<dyn Fn(MemoryState, MemoryState) + Send + Sync>;

/// Monitor configuration.
#[derive(Clone)]
pub struct MemoryMonitorConfig {
    /// Heap budget the water marks apply to.
    pub max_heap_bytes: u64,
    /// Pressure threshold as a fraction of `max_heap_bytes`.
    pub high_water_ratio: f64,
    /// Critical threshold as a fraction of `max_heap_bytes`.
    pub critical_water_ratio: f64,
    pub pressure_action: PressureAction,
    /// Minimum spacing between collection requests.
    pub min_collect_interval: Duration,
    /// Minimum spacing between probe reads; checks in between reuse the
    /// cached value.
    pub probe_interval: Duration,
    /// Path globs exempt from Critical rejection. A trailing `*` makes the
    /// entry a prefix match.
    pub bypass_paths: Vec<String>,
    /// `Retry-After` value on rejection responses.
    pub retry_after_seconds: u32,
}

impl Default for MemoryMonitorConfig {
    fn default() -> Self {
        MemoryMonitorConfig {
            max_heap_bytes: 1024 * 1024 * 1024,
            high_water_ratio: 0.8,
            critical_water_ratio: 0.95,
            pressure_action: PressureAction::LogOnly,
            min_collect_interval: Duration::from_secs(5),
            probe_interval: Duration::from_millis(100),
            bypass_paths: Vec::new(),
            retry_after_seconds: 5,
        }
    }
}

/// Monitor counters, resolved once against the metrics registry.
#[derive(Clone)]
pub struct MemoryMonitorStats {
    pub collections: Arc<Counter>,
    pub transitions: Arc<Counter>,
    pub rejections: Arc<Counter>,
    /// Nanoseconds spent in Pressure, accumulated at each transition.
    pub pressure_nanos: Arc<Counter>,
    /// Nanoseconds spent in Critical, accumulated at each transition.
    pub critical_nanos: Arc<Counter>,
}

impl MemoryMonitorStats {
    fn new(registry: &MetricsRegistry) -> MemoryMonitorStats {
        MemoryMonitorStats {
            collections: registry.counter("memory_collections_total"),
            transitions: registry.counter("memory_state_transitions_total"),
            rejections: registry.counter("memory_rejected_requests_total"),
            pressure_nanos: registry.counter("memory_pressure_nanos_total"),
            critical_nanos: registry.counter("memory_critical_nanos_total"),
        }
    }
}

/// Heap-pressure state machine shared across workers.
pub struct MemoryMonitor {
    config: MemoryMonitorConfig,
    probe: Box<dyn Fn() -> u64 + Send + Sync>,
    state: AtomicU8,
    /// Nanos-since-start of the last state change.
    state_since: AtomicU64,
    last_collect: AtomicU64,
    last_probe: AtomicU64,
    cached_used: AtomicU64,
    started: Instant,
    callback: Option<TransitionCallback>,
    stats: MemoryMonitorStats,
}

impl MemoryMonitor {
    /// Monitor backed by the process RSS as reported by the OS.
    pub fn new(config: MemoryMonitorConfig, registry: &MetricsRegistry) -> MemoryMonitor {
        Self::with_probe(config, registry, default_probe())
    }

    /// Monitor with a caller-supplied heap probe (tests use this).
    pub fn with_probe(
        config: MemoryMonitorConfig,
        registry: &MetricsRegistry,
        probe: Box<dyn Fn() -> u64 + Send + Sync>,
    ) -> MemoryMonitor {
        MemoryMonitor {
            probe,
            state: AtomicU8::new(MemoryState::Normal.as_u8()),
            state_since: AtomicU64::new(0),
            last_collect: AtomicU64::new(0),
            last_probe: AtomicU64::new(u64::MAX),
            cached_used: AtomicU64::new(0),
            started: Instant::now(),
            callback: None,
            stats: MemoryMonitorStats::new(registry),
            config,
        }
    }

    /// Install the transition callback, invoked as `(from, to)`.
    pub fn on_transition(mut self, f: impl Fn(MemoryState, MemoryState) + Send + Sync + 'static) -> Self {
        self.callback = Some(Arc::new(f));
        self
    }

    #[inline]
    pub fn state(&self) -> MemoryState {
        MemoryState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> &MemoryMonitorStats {
        &self.stats
    }

    /// Probe (or reuse the cached reading), classify, and handle any state
    /// transition. Returns the current state.
    pub fn check(&self) -> MemoryState {
        let now = self.started.elapsed().as_nanos() as u64;
        let used = self.probe_used(now);

        let max = self.config.max_heap_bytes as f64;
        let new_state = if used as f64 >= max * self.config.critical_water_ratio {
            MemoryState::Critical
        } else if used as f64 >= max * self.config.high_water_ratio {
            MemoryState::Pressure
        } else {
            MemoryState::Normal
        };

        let old = MemoryState::from_u8(
            self.state.swap(new_state.as_u8(), Ordering::AcqRel),
        );
        if old != new_state {
            self.on_state_change(old, new_state, now, used);
        }
        new_state
    }

    fn probe_used(&self, now: u64) -> u64 {
        let last = self.last_probe.load(Ordering::Relaxed);
        let interval = self.config.probe_interval.as_nanos() as u64;
        if last != u64::MAX && now.saturating_sub(last) < interval {
            return self.cached_used.load(Ordering::Relaxed);
        }
        self.last_probe.store(now, Ordering::Relaxed);
        let used = (self.probe)();
        self.cached_used.store(used, Ordering::Relaxed);
        used
    }

    fn on_state_change(&self, old: MemoryState, new_state: MemoryState, now: u64, used: u64) {
        self.stats.transitions.inc();
        let since = self.state_since.swap(now, Ordering::AcqRel);
        let stint = now.saturating_sub(since);
        match old {
            MemoryState::Pressure => self.stats.pressure_nanos.add(stint),
            MemoryState::Critical => self.stats.critical_nanos.add(stint),
            MemoryState::Normal => {}
        }

        tracing::info!(
            from = old.as_str(),
            to = new_state.as_str(),
            used_bytes = used,
            "memory state transition"
        );

        if let Some(cb) = &self.callback {
            cb(old, new_state);
        }

        if new_state != MemoryState::Normal {
            match self.config.pressure_action {
                PressureAction::Collect => self.request_collection(now),
                PressureAction::LogOnly => {
                    tracing::warn!(state = new_state.as_str(), used_bytes = used, "heap pressure");
                }
                PressureAction::Custom | PressureAction::None => {}
            }
        }
    }

    fn request_collection(&self, now: u64) {
        let min = self.config.min_collect_interval.as_nanos() as u64;
        let last = self.last_collect.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < min {
            return;
        }
        if self
            .last_collect
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.stats.collections.inc();
            tracing::warn!("collection requested under heap pressure");
        }
    }

    /// Whether `path` is exempt from Critical rejection.
    pub fn bypassed(&self, path: &str) -> bool {
        self.config.bypass_paths.iter().any(|glob| {
            match glob.strip_suffix('*') {
                Some(prefix) => path.starts_with(prefix),
                None => path == glob,
            }
        })
    }

    pub fn retry_after_seconds(&self) -> u32 {
        self.config.retry_after_seconds
    }
}

fn default_probe() -> Box<dyn Fn() -> u64 + Send + Sync> {
    let pid = sysinfo::get_current_pid().ok();
    let sys = Mutex::new(System::new());
    Box::new(move || {
        let Some(pid) = pid else { return 0 };
        let mut sys = sys.lock();
        sys.refresh_process(pid);
        sys.process(pid).map(|p| p.memory()).unwrap_or(0)
    })
}

// ============================================================================
// Middleware form
// ============================================================================

/// Rejects requests with 503 while the monitor is Critical.
pub struct MemoryPressureMiddleware {
    monitor: Arc<MemoryMonitor>,
}

impl MemoryPressureMiddleware {
    pub fn new(monitor: Arc<MemoryMonitor>) -> MemoryPressureMiddleware {
        MemoryPressureMiddleware { monitor }
    }
}

#[async_trait::async_trait(?Send)]
impl Middleware for MemoryPressureMiddleware {
    async fn handle(&self, ctx: &mut Context<'_>, next: Next<'_>) -> Result<(), BoxError> {
        let bypassed = self.monitor.bypassed(ctx.request().path());
        if !bypassed && self.monitor.check() == MemoryState::Critical {
            self.monitor.stats().rejections.inc();
            let retry_after = self.monitor.retry_after_seconds().to_string();
            ctx.response()
                .status(503)
                .set_header("Retry-After", &retry_after)
                .json(&serde_json::json!({
                    "error": "server is under memory pressure",
                    "reason": "memory_critical",
                }));
            return Ok(());
        }
        next.run(ctx).await
    }
}
