//! Collaborator interfaces consumed by the lifecycle
//!
//! The garbage collector, the execution tracer and the profiler are
//! external subsystems. The runtime only drives their hooks, in a fixed
//! order, and propagates their failures.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::{self, ThreadId};
use tracing::debug;

use crate::config::TimeProfileMethod;
use crate::perf::clock_millis;

/// Registration hooks of a conservative garbage collector.
pub trait GarbageCollector: Send {
    /// Bring the collector up. `quiet` suppresses its own diagnostics.
    fn init(&mut self, quiet: bool) -> Result<()>;

    /// Treat pointers displaced by `offset` bytes as references to the
    /// start of an object.
    fn register_displacement(&mut self, offset: usize);

    /// Never collect.
    fn disable_collection(&mut self) {}
}

/// Start/stop hooks of the execution tracer.
pub trait Tracer: Send {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Tracing is live from here on if `enabled`.
    fn start(&mut self, _enabled: bool) {}

    fn end(&mut self) -> Result<()> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Hooks of the time profiler. Shared by every engine.
pub trait Profiler: Send + Sync {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn turn_on_time_profiling(&self, _method: TimeProfileMethod) {}

    fn turn_off_time_profiling(&self) {}

    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

/// Collector that records registrations and never collects.
#[derive(Debug, Default)]
pub struct NoGc {
    displacements: Vec<usize>,
}

impl NoGc {
    pub fn displacements(&self) -> &[usize] {
        &self.displacements
    }
}

impl GarbageCollector for NoGc {
    fn init(&mut self, _quiet: bool) -> Result<()> {
        Ok(())
    }

    fn register_displacement(&mut self, offset: usize) {
        self.displacements.push(offset);
    }
}

#[derive(Debug, Default)]
pub struct NoTracer;

impl Tracer for NoTracer {}

#[derive(Debug, Default)]
pub struct NoProfiler;

impl Profiler for NoProfiler {}

/// Profiler that accumulates the time spent with profiling turned on,
/// measured on the configured clock.
#[derive(Debug, Default)]
pub struct ClockProfiler {
    active: Mutex<HashMap<ThreadId, (TimeProfileMethod, u64)>>,
    total_ms: AtomicU64,
    sessions: AtomicU64,
}

impl ClockProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms.load(Ordering::Relaxed)
    }

    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }
}

impl Profiler for ClockProfiler {
    fn turn_on_time_profiling(&self, method: TimeProfileMethod) {
        let started = clock_millis(method);
        self.active
            .lock()
            .expect("profiler lock poisoned")
            .insert(thread::current().id(), (method, started));
    }

    fn turn_off_time_profiling(&self) {
        let entry = self
            .active
            .lock()
            .expect("profiler lock poisoned")
            .remove(&thread::current().id());
        if let Some((method, started)) = entry {
            let elapsed = clock_millis(method).saturating_sub(started);
            self.total_ms.fetch_add(elapsed, Ordering::Relaxed);
            self.sessions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn finish(&self) -> Result<()> {
        debug!(
            sessions = self.sessions(),
            total_ms = self.total_ms(),
            "Time profile finished"
        );
        Ok(())
    }
}

/// The set of collaborators a runtime is built with.
pub struct Collaborators {
    pub gc: Box<dyn GarbageCollector>,
    pub tracer: Box<dyn Tracer>,
    pub profiler: std::sync::Arc<dyn Profiler>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            gc: Box::new(NoGc::default()),
            tracer: Box::new(NoTracer),
            profiler: std::sync::Arc::new(NoProfiler),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_profiler_counts_sessions() {
        let profiler = ClockProfiler::new();
        profiler.turn_on_time_profiling(TimeProfileMethod::RealTime);
        std::thread::sleep(std::time::Duration::from_millis(5));
        profiler.turn_off_time_profiling();
        assert_eq!(profiler.sessions(), 1);
        assert!(profiler.total_ms() >= 5);
    }

    #[test]
    fn test_turn_off_without_turn_on_is_ignored() {
        let profiler = ClockProfiler::new();
        profiler.turn_off_time_profiling();
        assert_eq!(profiler.sessions(), 0);
        assert!(profiler.finish().is_ok());
    }

    #[test]
    fn test_no_gc_records_displacements() {
        let mut gc = NoGc::default();
        gc.init(true).unwrap();
        gc.register_displacement(1);
        gc.register_displacement(2);
        assert_eq!(gc.displacements(), &[1, 2]);
    }
}
