//! Process-wide counters and timers for compilation and cache activity.
//!
//! Events are keyed by static names (`"op_by_op::compile_cache_miss"`, `"op_by_op::compile"`).
//! Counters are cheap enough to stay enabled; per-executor statistics that tests rely on live on
//! the executor itself, these are for whole-process reports.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metric {
    pub count: u64,
    pub total: Duration,
}

struct Profiler {
    metrics: Mutex<HashMap<&'static str, Metric>>,
}

impl Profiler {
    fn instance() -> &'static Self {
        static INSTANCE: OnceLock<Profiler> = OnceLock::new();
        INSTANCE.get_or_init(|| Profiler {
            metrics: Mutex::new(HashMap::new()),
        })
    }

    fn record(&self, name: &'static str, count: u64, elapsed: Duration) {
        let Ok(mut metrics) = self.metrics.lock() else {
            return;
        };
        let entry = metrics.entry(name).or_default();
        entry.count = entry.count.saturating_add(count);
        entry.total = entry.total.saturating_add(elapsed);
    }
}

/// Counts one occurrence of a cache-related event.
#[inline]
pub fn cache_event(name: &'static str) {
    Profiler::instance().record(name, 1, Duration::ZERO);
}

#[inline]
pub fn counter_add(name: &'static str, count: u64) {
    Profiler::instance().record(name, count, Duration::ZERO);
}

/// Times the enclosing scope under `name`.
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard {
        name,
        start: Instant::now(),
    }
}

pub struct ScopeGuard {
    name: &'static str,
    start: Instant,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        Profiler::instance().record(self.name, 1, self.start.elapsed());
    }
}

pub fn metric(name: &str) -> Metric {
    Profiler::instance()
        .metrics
        .lock()
        .ok()
        .and_then(|metrics| metrics.get(name).copied())
        .unwrap_or_default()
}

pub fn snapshot() -> Report {
    let mut rows: Vec<(&'static str, Metric)> = Profiler::instance()
        .metrics
        .lock()
        .map(|metrics| metrics.iter().map(|(k, v)| (*k, *v)).collect())
        .unwrap_or_default();
    rows.sort_by(|a, b| a.0.cmp(b.0));
    Report { rows }
}

pub fn reset() {
    if let Ok(mut metrics) = Profiler::instance().metrics.lock() {
        metrics.clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct Report {
    pub rows: Vec<(&'static str, Metric)>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .rows
            .iter()
            .map(|(name, _)| name.len())
            .max()
            .unwrap_or(0)
            .max("metric".len());
        writeln!(f, "{:<width$}  {:>10}  {:>12}", "metric", "count", "total_ms")?;
        for (name, metric) in &self.rows {
            writeln!(
                f,
                "{:<width$}  {:>10}  {:>12.3}",
                name,
                metric.count,
                metric.total.as_secs_f64() * 1e3
            )?;
        }
        Ok(())
    }
}
