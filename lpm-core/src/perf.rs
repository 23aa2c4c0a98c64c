//! Run Metrics and Process Clocks
//!
//! Lightweight counters for interpreter activity, shared by every engine of
//! a runtime, plus the process CPU clocks used by the own-timer report and
//! the time-profiling methods.
//!
//! # Design Goals:
//! - Lock-free atomic counters
//! - Zero-allocation in hot paths

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::config::TimeProfileMethod;

/// Counters for one runtime
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    pub interpreter_runs: AtomicU64,
    pub interpreter_time_ns: AtomicU64,
    pub goals: AtomicU64,
    pub goal_time_ns: AtomicU64,
    pub solutions: AtomicU64,
    pub redos: AtomicU64,
    pub frames_pushed: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one interpreter invocation from the lifecycle run loop
    pub fn record_run(&self, duration: Duration) {
        self.interpreter_runs.fetch_add(1, Ordering::Relaxed);
        self.interpreter_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record one goal taken from the run queue
    pub fn record_goal(&self, duration: Duration) {
        self.goals.fetch_add(1, Ordering::Relaxed);
        self.goal_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_solutions(&self, count: u64) {
        self.solutions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_redo(&self) {
        self.redos.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_push(&self) {
        self.frames_pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            interpreter_runs: self.interpreter_runs.load(Ordering::Relaxed),
            avg_run_ms: avg_duration_ms(&self.interpreter_runs, &self.interpreter_time_ns),
            goals: self.goals.load(Ordering::Relaxed),
            avg_goal_ms: avg_duration_ms(&self.goals, &self.goal_time_ns),
            solutions: self.solutions.load(Ordering::Relaxed),
            redos: self.redos.load(Ordering::Relaxed),
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero
    pub fn reset(&self) {
        for counter in [
            &self.interpreter_runs,
            &self.interpreter_time_ns,
            &self.goals,
            &self.goal_time_ns,
            &self.solutions,
            &self.redos,
            &self.frames_pushed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn avg_duration_ms(count: &AtomicU64, total_ns: &AtomicU64) -> f64 {
    let c = count.load(Ordering::Relaxed);
    if c == 0 {
        return 0.0;
    }
    let total = total_ns.load(Ordering::Relaxed);
    (total as f64) / (c as f64) / 1_000_000.0
}

/// A point-in-time copy of [`RuntimeMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub interpreter_runs: u64,
    pub avg_run_ms: f64,
    pub goals: u64,
    pub avg_goal_ms: f64,
    pub solutions: u64,
    pub redos: u64,
    pub frames_pushed: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "runs={} (avg {:.3} ms) goals={} (avg {:.3} ms) solutions={} redos={} frames={}",
            self.interpreter_runs,
            self.avg_run_ms,
            self.goals,
            self.avg_goal_ms,
            self.solutions,
            self.redos,
            self.frames_pushed
        )
    }
}

/// A scoped timer that records its duration on drop
pub struct ScopedTimer<'a> {
    start: Instant,
    metrics: &'a RuntimeMetrics,
    metric_type: TimerType,
}

pub enum TimerType {
    InterpreterRun,
    Goal,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(metrics: &'a RuntimeMetrics, metric_type: TimerType) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            metric_type,
        }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        match self.metric_type {
            TimerType::InterpreterRun => self.metrics.record_run(duration),
            TimerType::Goal => self.metrics.record_goal(duration),
        }
    }
}

fn timeval_millis(tv: libc::timeval) -> u64 {
    (tv.tv_sec as u64) * 1000 + (tv.tv_usec as u64) / 1000
}

fn rusage() -> Option<libc::rusage> {
    // SAFETY: rusage is plain old data and getrusage only writes into it.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    (rc == 0).then_some(usage)
}

/// User CPU time consumed by the process, in milliseconds.
pub fn user_cpu_millis() -> u64 {
    rusage().map_or(0, |u| timeval_millis(u.ru_utime))
}

/// Clock used by the given time-profiling method, in milliseconds.
pub fn clock_millis(method: TimeProfileMethod) -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    match method {
        TimeProfileMethod::RealTime => {
            EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
        }
        TimeProfileMethod::UserTime => user_cpu_millis(),
        TimeProfileMethod::UserPlusSystemTime => rusage().map_or(0, |u| {
            timeval_millis(u.ru_utime) + timeval_millis(u.ru_stime)
        }),
    }
}

/// Format CPU milliseconds the way the own-timer report prints them.
pub fn format_seconds(millis: u64) -> String {
    format!("{:8.3}u", millis as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = RuntimeMetrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.interpreter_runs, 0);
        assert_eq!(snapshot.avg_run_ms, 0.0);
    }

    #[test]
    fn test_record_operations() {
        let metrics = RuntimeMetrics::new();
        metrics.record_run(Duration::from_millis(100));
        metrics.record_run(Duration::from_millis(200));
        metrics.record_solutions(3);
        metrics.record_redo();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.interpreter_runs, 2);
        assert_eq!(snapshot.avg_run_ms, 150.0);
        assert_eq!(snapshot.solutions, 3);
        assert_eq!(snapshot.redos, 1);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = RuntimeMetrics::new();
        metrics.record_goal(Duration::from_millis(5));
        metrics.record_frame_push();
        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.goals, 0);
        assert_eq!(snapshot.frames_pushed, 0);
    }

    #[test]
    fn test_scoped_timer() {
        let metrics = RuntimeMetrics::new();
        {
            let _timer = ScopedTimer::new(&metrics, TimerType::Goal);
            std::thread::sleep(Duration::from_millis(10));
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.goals, 1);
        assert!(snapshot.avg_goal_ms >= 10.0);
    }

    #[test]
    fn test_clocks_are_monotonic() {
        for method in [
            TimeProfileMethod::RealTime,
            TimeProfileMethod::UserTime,
            TimeProfileMethod::UserPlusSystemTime,
        ] {
            let a = clock_millis(method);
            let b = clock_millis(method);
            assert!(b >= a);
        }
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(1500), "   1.500u");
        assert_eq!(format_seconds(0), "   0.000u");
    }
}
