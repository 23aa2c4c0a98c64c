//! Engine Pool and Run Queue
//!
//! A pool of `thread_count` engines. Slot 0 is the primary engine, owned by
//! the thread that boots the runtime; slots `1..thread_count` are secondary
//! engines, each created on and owned by its own OS thread. Idle engines
//! block on a shared run queue until work arrives or shutdown is requested.
//!
//! Shutdown is cooperative: [`RunQueue::shutdown`] raises the exit flag and
//! wakes every blocked engine. Each engine checks the flag after waking and
//! exits rather than taking more work. Engines that are in the middle of a
//! goal finish it first.

use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use super::{Engine, EngineShared};
use crate::error::{Result, RuntimeError};
use crate::interpreter::{CodeAddr, Interpreter, Program, SolutionMode};
use crate::memory::ZoneSummary;
use crate::perf::{ScopedTimer, TimerType};
use crate::runtime::Profiler;

/// Scheduling state of one pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Thread spawned, zones not yet allocated.
    Starting,
    /// Ready for work but not waiting on the queue.
    Runnable,
    /// Waiting on the run queue.
    Blocked,
    /// Executing a goal.
    Running,
    /// Exited its worker loop; the engine is gone or about to be.
    Terminated,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Runnable => write!(f, "runnable"),
            Self::Blocked => write!(f, "blocked"),
            Self::Running => write!(f, "running"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// A unit of work: run the code at `entry` on whichever engine picks it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Goal {
    pub entry: CodeAddr,
    pub mode: SolutionMode,
}

impl Goal {
    pub fn new(entry: CodeAddr) -> Self {
        Self {
            entry,
            mode: SolutionMode::First,
        }
    }

    pub fn all_solutions(entry: CodeAddr) -> Self {
        Self {
            entry,
            mode: SolutionMode::All,
        }
    }
}

struct QueueState {
    goals: VecDeque<Goal>,
    exit_now: bool,
    states: Vec<EngineState>,
}

/// Shared queue of pending goals plus the shutdown flag.
pub struct RunQueue {
    state: Mutex<QueueState>,
    wakeup: Condvar,
}

impl RunQueue {
    pub fn new(slots: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                goals: VecDeque::new(),
                exit_now: false,
                states: vec![EngineState::Starting; slots],
            }),
            wakeup: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("run queue lock poisoned")
    }

    /// Enqueue a goal and wake one idle engine.
    pub fn submit(&self, goal: Goal) {
        let mut state = self.lock();
        state.goals.push_back(goal);
        debug!(entry = %goal.entry, pending = state.goals.len(), "Goal submitted");
        drop(state);
        self.wakeup.notify_one();
    }

    /// Raise the exit flag and wake every blocked engine.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if !state.exit_now {
            info!(abandoned = state.goals.len(), "Engine pool shutting down");
        }
        state.exit_now = true;
        drop(state);
        self.wakeup.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().exit_now
    }

    pub fn pending(&self) -> usize {
        self.lock().goals.len()
    }

    pub fn states(&self) -> Vec<EngineState> {
        self.lock().states.clone()
    }

    pub fn set_state(&self, slot: usize, new_state: EngineState) {
        let mut state = self.lock();
        if let Some(entry) = state.states.get_mut(slot) {
            *entry = new_state;
        }
    }

    /// Take a queued goal without waiting. The slot is marked running when
    /// one is taken.
    fn try_next_goal(&self, slot: usize) -> Option<Goal> {
        let mut state = self.lock();
        if state.exit_now {
            return None;
        }
        let goal = state.goals.pop_front()?;
        state.states[slot] = EngineState::Running;
        Some(goal)
    }

    /// Block until a goal is available or shutdown is requested.
    fn next_goal(&self, slot: usize) -> Option<Goal> {
        let mut state = self.lock();
        loop {
            if state.exit_now {
                return None;
            }
            if let Some(goal) = state.goals.pop_front() {
                state.states[slot] = EngineState::Running;
                return Some(goal);
            }
            state.states[slot] = EngineState::Blocked;
            state = self
                .wakeup
                .wait(state)
                .expect("run queue lock poisoned");
        }
    }
}

/// Clonable handle that requests pool shutdown from any thread.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<RunQueue>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.shutdown();
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("exit_now", &self.0.is_shutting_down())
            .finish()
    }
}

/// What one engine did between startup and exit.
#[derive(Debug, Clone, Default)]
pub struct WorkerReport {
    pub slot: usize,
    pub goals: u64,
    pub solutions: u64,
    pub zones: Vec<ZoneSummary>,
}

impl WorkerReport {
    fn new(slot: usize) -> Self {
        Self {
            slot,
            ..Self::default()
        }
    }
}

type StartupMessage = (usize, Result<Vec<ZoneSummary>>);

/// The primary engine's slot plus any spawned secondary engines.
pub struct EnginePool {
    queue: Arc<RunQueue>,
    size: usize,
    workers: Vec<(usize, JoinHandle<Result<WorkerReport>>)>,
}

impl EnginePool {
    /// A pool with `thread_count` slots; zero is treated as one.
    pub fn new(thread_count: usize) -> Self {
        let size = thread_count.max(1);
        info!(size, "Creating engine pool");
        Self {
            queue: Arc::new(RunQueue::new(size)),
            size,
            workers: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn queue(&self) -> &Arc<RunQueue> {
        &self.queue
    }

    pub fn submit(&self, goal: Goal) {
        self.queue.submit(goal);
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.queue.clone())
    }

    pub fn states(&self) -> Vec<EngineState> {
        self.queue.states()
    }

    pub fn set_state(&self, slot: usize, state: EngineState) {
        self.queue.set_state(slot, state);
    }

    /// Start one OS thread per secondary slot. Each thread allocates its
    /// own engine; this call returns once every engine has reported in.
    ///
    /// If any secondary cannot allocate its zones the pool is shut down and
    /// the allocation error is returned.
    pub fn spawn(
        &mut self,
        program: Arc<Program>,
        shared: EngineShared,
        profiler: Arc<dyn Profiler>,
    ) -> Result<Vec<(usize, Vec<ZoneSummary>)>> {
        if !self.workers.is_empty() {
            return Err(RuntimeError::BootstrapInvariant(
                "engine pool spawned twice".into(),
            ));
        }

        let (tx, rx) = mpsc::channel::<StartupMessage>();
        for slot in 1..self.size {
            let queue = self.queue.clone();
            let program = program.clone();
            let shared = shared.clone();
            let profiler = profiler.clone();
            let tx = tx.clone();
            let handle = thread::Builder::new()
                .name(format!("lpm-engine-{}", slot))
                .spawn(move || worker_main(slot, queue, program, shared, profiler, tx));
            match handle {
                Ok(handle) => self.workers.push((slot, handle)),
                Err(e) => {
                    error!(slot, error = %e, "Failed to spawn engine thread");
                    self.queue.set_state(slot, EngineState::Terminated);
                    self.shutdown();
                    return Err(RuntimeError::BootstrapInvariant(format!(
                        "cannot spawn engine thread {}: {}",
                        slot, e
                    )));
                }
            }
        }
        drop(tx);

        let mut started = Vec::with_capacity(self.workers.len());
        let mut first_error = None;
        for _ in 0..self.workers.len() {
            match rx.recv() {
                Ok((slot, Ok(zones))) => started.push((slot, zones)),
                Ok((slot, Err(e))) => {
                    error!(slot, error = %e, "Secondary engine failed to start");
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(RuntimeError::EnginePanicked { slot: 0 });
                    break;
                }
            }
        }
        if let Some(e) = first_error {
            self.shutdown();
            return Err(e);
        }

        started.sort_by_key(|(slot, _)| *slot);
        info!(secondaries = started.len(), "Engine pool started");
        Ok(started)
    }

    /// Run the worker loop for `engine` on the calling thread until shutdown.
    pub fn serve(
        &self,
        engine: &mut Engine,
        program: &Program,
        profiler: &dyn Profiler,
    ) -> Result<WorkerReport> {
        serve_goals(&self.queue, engine, program, profiler)
    }

    /// Run every goal already queued on `engine`, without waiting for more.
    ///
    /// Used by the primary engine, which never blocks on the queue.
    pub fn drain(
        &self,
        engine: &mut Engine,
        program: &Program,
        profiler: &dyn Profiler,
    ) -> Result<WorkerReport> {
        let slot = engine.id();
        let interpreter = Interpreter::new(program, profiler);
        let mut report = WorkerReport::new(slot);
        while let Some(goal) = self.queue.try_next_goal(slot) {
            run_goal(&self.queue, engine, &interpreter, goal, &mut report)?;
        }
        if report.goals > 0 {
            debug!(slot, goals = report.goals, "Queued goals drained");
        }
        Ok(report)
    }

    /// Wait for every secondary thread to exit.
    ///
    /// All threads are joined even if some fail; the first failure is
    /// returned.
    pub fn join(&mut self) -> Result<Vec<WorkerReport>> {
        let mut reports = Vec::with_capacity(self.workers.len());
        let mut first_error = None;
        for (slot, handle) in self.workers.drain(..) {
            match handle.join() {
                Ok(Ok(report)) => {
                    debug!(slot, goals = report.goals, "Engine thread joined");
                    reports.push(report);
                }
                Ok(Err(e)) => {
                    error!(slot, error = %e, "Engine exited with error");
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    error!(slot, "Engine thread panicked");
                    self.queue.set_state(slot, EngineState::Terminated);
                    first_error.get_or_insert(RuntimeError::EnginePanicked { slot });
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }
}

impl Drop for EnginePool {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shutdown();
        if let Err(e) = self.join() {
            warn!(error = %e, "Engine pool dropped with failed workers");
        }
    }
}

impl fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnginePool")
            .field("size", &self.size)
            .field("spawned", &self.workers.len())
            .field("states", &self.states())
            .finish()
    }
}

fn worker_main(
    slot: usize,
    queue: Arc<RunQueue>,
    program: Arc<Program>,
    shared: EngineShared,
    profiler: Arc<dyn Profiler>,
    startup: mpsc::Sender<StartupMessage>,
) -> Result<WorkerReport> {
    let mut engine = match Engine::new(slot, shared) {
        Ok(engine) => engine,
        Err(e) => {
            queue.set_state(slot, EngineState::Terminated);
            // The receiver only disappears if spawn() itself bailed out.
            let _ = startup.send((slot, Err(e)));
            return Ok(WorkerReport::new(slot));
        }
    };
    queue.set_state(slot, EngineState::Runnable);
    let _ = startup.send((slot, Ok(engine.zone_summary())));
    drop(startup);

    let outcome = serve_goals(&queue, &mut engine, &program, profiler.as_ref());
    let zones = engine.teardown();
    outcome.map(|report| WorkerReport { zones, ..report })
}

fn serve_goals(
    queue: &RunQueue,
    engine: &mut Engine,
    program: &Program,
    profiler: &dyn Profiler,
) -> Result<WorkerReport> {
    let slot = engine.id();
    let interpreter = Interpreter::new(program, profiler);
    let mut report = WorkerReport::new(slot);
    debug!(slot, "Engine entering worker loop");

    while let Some(goal) = queue.next_goal(slot) {
        run_goal(queue, engine, &interpreter, goal, &mut report)?;
    }

    queue.set_state(slot, EngineState::Terminated);
    debug!(slot, goals = report.goals, "Engine left worker loop");
    Ok(report)
}

/// Run one dequeued goal. A fatal error terminates the slot and shuts the
/// whole pool down.
fn run_goal(
    queue: &RunQueue,
    engine: &mut Engine,
    interpreter: &Interpreter<'_>,
    goal: Goal,
    report: &mut WorkerReport,
) -> Result<()> {
    let slot = engine.id();
    let metrics = engine.shared().metrics.clone();
    let outcome = {
        let _timer = ScopedTimer::new(&metrics, TimerType::Goal);
        let mut machine = engine.enter_managed();
        interpreter.run(&mut machine, Some(goal.entry), goal.mode)
    };
    match outcome {
        Ok(run) => {
            report.goals += 1;
            report.solutions += run.solutions;
            queue.set_state(slot, EngineState::Runnable);
            Ok(())
        }
        Err(e) => {
            error!(slot, entry = %goal.entry, error = %e, "Goal failed fatally");
            queue.set_state(slot, EngineState::Terminated);
            queue.shutdown();
            Err(e)
        }
    }
}
