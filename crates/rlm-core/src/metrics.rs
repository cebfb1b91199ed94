//! Process-wide engine counters.
//!
//! Increments log at `trace` level only; [`Metrics::flush`] reports every
//! value in one `info!` event, which the CLI does before exiting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Relaxed atomics; values are approximate under concurrency.
pub struct Metrics {
    queries_started: AtomicU64,
    iterations: AtomicU64,
    executions: AtomicU64,
    subcalls: AtomicU64,
    executors_recycled: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            queries_started: AtomicU64::new(0),
            iterations: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            subcalls: AtomicU64::new(0),
            executors_recycled: AtomicU64::new(0),
        }
    }

    /// Increment the queries-started counter by one.
    pub fn inc_queries(&self) {
        self.queries_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "queries_started", "counter incremented");
    }

    /// Increment the loop-iteration counter by one.
    pub fn inc_iterations(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "iterations", "counter incremented");
    }

    /// Increment the snippet-execution counter by one.
    pub fn inc_executions(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions", "counter incremented");
    }

    /// Increment the sub-query counter by one.
    pub fn inc_subcalls(&self) {
        self.subcalls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "subcalls", "counter incremented");
    }

    /// Increment the executors-recycled counter by one (a dead or
    /// unresettable executor was replaced).
    pub fn inc_executors_recycled(&self) {
        self.executors_recycled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executors_recycled", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            queries_started = self.queries_started(),
            iterations = self.iterations(),
            executions = self.executions(),
            subcalls = self.subcalls(),
            executors_recycled = self.executors_recycled(),
        );
    }

    /// Current value of the queries-started counter.
    pub fn queries_started(&self) -> u64 {
        self.queries_started.load(Ordering::Relaxed)
    }

    /// Current value of the loop-iteration counter.
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Current value of the snippet-execution counter.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Current value of the sub-query counter.
    pub fn subcalls(&self) -> u64 {
        self.subcalls.load(Ordering::Relaxed)
    }

    /// Current value of the executors-recycled counter.
    pub fn executors_recycled(&self) -> u64 {
        self.executors_recycled.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.queries_started.store(0, Ordering::Relaxed);
        self.iterations.store(0, Ordering::Relaxed);
        self.executions.store(0, Ordering::Relaxed);
        self.subcalls.store(0, Ordering::Relaxed);
        self.executors_recycled.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_queries();
        m.inc_iterations();
        m.inc_iterations();
        assert_eq!(m.queries_started(), 1);
        assert_eq!(m.iterations(), 2);

        m.inc_executions();
        m.inc_subcalls();
        m.inc_executors_recycled();
        assert_eq!(m.executions(), 1);
        assert_eq!(m.subcalls(), 1);
        assert_eq!(m.executors_recycled(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_queries();
        m.inc_executions();
        m.reset();
        assert_eq!(m.queries_started(), 0);
        assert_eq!(m.executions(), 0);
    }
}
