use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Global daemon counters. Updated from control handlers and the resume
/// path, so everything is atomic with relaxed ordering.
pub struct Metrics {
    pub start_time: SystemTime,
    control_ops_total: AtomicU64,
    pauses_total: AtomicU64,
    resumes_total: AtomicU64,
    graph_updates_total: AtomicU64,
    constraint_violations_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            control_ops_total: AtomicU64::new(0),
            pauses_total: AtomicU64::new(0),
            resumes_total: AtomicU64::new(0),
            graph_updates_total: AtomicU64::new(0),
            constraint_violations_total: AtomicU64::new(0),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn inc_control_op(&self) {
        self.control_ops_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn control_ops(&self) -> u64 {
        self.control_ops_total.load(Ordering::Relaxed)
    }

    pub fn inc_pause(&self) {
        self.pauses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pauses(&self) -> u64 {
        self.pauses_total.load(Ordering::Relaxed)
    }

    pub fn inc_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    pub fn inc_graph_update(&self) {
        self.graph_updates_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn graph_updates(&self) -> u64 {
        self.graph_updates_total.load(Ordering::Relaxed)
    }

    pub fn add_constraint_violations(&self, n: u64) {
        self.constraint_violations_total
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn constraint_violations(&self) -> u64 {
        self.constraint_violations_total.load(Ordering::Relaxed)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_count() {
        let m = Metrics::new();
        m.inc_pause();
        m.inc_pause();
        m.inc_resume();
        assert_eq!(m.pauses(), 2);
        assert_eq!(m.resumes(), 1);
    }
}
