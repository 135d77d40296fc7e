//! In-process metric registry.
//!
//! Counters, timers and callback gauges keyed by dotted names. Gauges can be
//! deregistered again, which the connection pool stats wrapper relies on when a
//! pool is closed. Exporting the values is left to the embedding process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::domain::origin::Origin;

/// Reads the current value of a gauge.
pub type GaugeFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Metric scope of an origin: `origins.<appId>.<originId>`.
pub fn origin_metrics_scope(origin: &Origin) -> String {
    format!("origins.{}.{}", origin.app_id, origin.id)
}

/// A monotonically increasing count.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Add one.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Add `n`.
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current count.
    pub fn count(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Accumulates durations of timed operations.
#[derive(Debug, Default)]
pub struct Timer {
    count: AtomicU64,
    total_nanos: AtomicU64,
}

impl Timer {
    /// Start timing an operation. It is recorded when the context is stopped or dropped.
    pub fn start_timing(self: &Arc<Self>) -> TimerContext {
        TimerContext {
            timer: Arc::clone(self),
            started: Instant::now(),
            stopped: false,
        }
    }

    /// Record one operation of the given duration.
    pub fn record(&self, elapsed: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Number of recorded operations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all recorded durations.
    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed))
    }
}

/// A running measurement of a [`Timer`].
#[derive(Debug)]
pub struct TimerContext {
    timer: Arc<Timer>,
    started: Instant,
    stopped: bool,
}

impl TimerContext {
    /// Record the elapsed time now.
    pub fn stop(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.timer.record(self.started.elapsed());
        }
    }
}

impl Drop for TimerContext {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Registry of named metrics.
///
/// [`scope`](Self::scope) returns a view that prefixes every name it is given and
/// shares storage with its parent.
#[derive(Clone, Default)]
pub struct MetricRegistry {
    prefix: String,
    gauges: Arc<DashMap<String, GaugeFn>>,
    counters: Arc<DashMap<String, Arc<Counter>>>,
    timers: Arc<DashMap<String, Arc<Timer>>>,
}

impl MetricRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A view of the same registry under `name`.
    pub fn scope(&self, name: &str) -> Self {
        Self {
            prefix: self.name(name),
            ..self.clone()
        }
    }

    /// Full name of `name` in this scope.
    pub fn name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.prefix)
        }
    }

    /// Register a gauge, replacing whatever was registered under the name.
    /// Returns the replaced gauge.
    pub fn replace_gauge(&self, name: &str, gauge: GaugeFn) -> Option<GaugeFn> {
        self.gauges.insert(self.name(name), gauge)
    }

    /// Remove a gauge if it is still `gauge`. Returns whether it was removed.
    pub fn deregister_gauge(&self, name: &str, gauge: &GaugeFn) -> bool {
        self.gauges
            .remove_if(&self.name(name), |_, current| Arc::ptr_eq(current, gauge))
            .is_some()
    }

    /// Current value of a gauge.
    pub fn gauge_value(&self, name: &str) -> Option<u64> {
        let gauge = self
            .gauges
            .get(&self.name(name))
            .map(|entry| Arc::clone(entry.value()))?;
        Some(gauge())
    }

    /// Full names of the gauges in this scope, sorted.
    pub fn gauge_names(&self) -> Vec<String> {
        let prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}.", self.prefix)
        };
        let mut names: Vec<String> = self
            .gauges
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|name| name.starts_with(&prefix))
            .collect();
        names.sort();
        names
    }

    /// The counter named `name`, created on first use.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        Arc::clone(self.counters.entry(self.name(name)).or_default().value())
    }

    /// The timer named `name`, created on first use.
    pub fn timer(&self, name: &str) -> Arc<Timer> {
        Arc::clone(self.timers.entry(self.name(name)).or_default().value())
    }
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("prefix", &self.prefix)
            .field("gauges", &self.gauges.len())
            .field("counters", &self.counters.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}
