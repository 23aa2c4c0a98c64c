//! Engine & Lifecycle Controller
//!
//! Brings an engine pool from nothing to ready-to-run in a strict order,
//! runs the program entry point on the primary engine, and tears everything
//! down in reverse dependency order.
//!
//! ```text
//! Uninitialized ─init─▶ Initializing ─▶ Ready ─run─▶ Running ─terminate─▶ Terminating ─▶ Terminated
//!                                         └───────────terminate──────────────┘
//! ```

pub mod hooks;

pub use hooks::{
    ClockProfiler, Collaborators, GarbageCollector, NoGc, NoProfiler, NoTracer, Profiler, Tracer,
};

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::config::RuntimeOptions;
use crate::engine::{
    Engine, EnginePool, EngineShared, EngineState, Goal, OnceHook, ShutdownHandle,
};
use crate::error::{Result, RuntimeError};
use crate::interpreter::{Interpreter, Program, RunReport, SolutionMode};
use crate::perf::{user_cpu_millis, MetricsSnapshot, ScopedTimer, TimerType};

/// Low pointer bits used for tags.
pub const TAG_BITS: u32 = if usize::BITS == 64 { 3 } else { 2 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    Running,
    Terminating,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Terminating => write!(f, "terminating"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Everything the run phase observed, over all repeats.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub reports: Vec<RunReport>,
    pub elapsed: Duration,
    /// User CPU milliseconds, when the own timer is enabled.
    pub user_time_ms: Option<u64>,
    /// Queued goals the primary engine ran after the program itself.
    pub goals_drained: u64,
}

impl RunSummary {
    /// Some repetition found a solution.
    pub fn found_solution(&self) -> bool {
        self.reports.iter().any(RunReport::found_solution)
    }

    pub fn repeats(&self) -> usize {
        self.reports.len()
    }

    pub fn solutions(&self) -> u64 {
        self.reports.iter().map(|r| r.solutions).sum()
    }

    pub fn redos(&self) -> u64 {
        self.reports.iter().map(|r| r.redos).sum()
    }
}

/// The lifecycle controller.
pub struct Runtime {
    state: LifecycleState,
    options: Arc<RuntimeOptions>,
    program: Arc<Program>,
    gc: Box<dyn GarbageCollector>,
    tracer: Box<dyn Tracer>,
    profiler: Arc<dyn Profiler>,
    module_init: Arc<OnceHook>,
    shared: EngineShared,
    pool: Option<EnginePool>,
    primary: Option<Engine>,
}

impl Runtime {
    /// Bind configuration, program and collaborators. Nothing is allocated
    /// until [`init`](Self::init).
    pub fn new(options: RuntimeOptions, program: Program, collaborators: Collaborators) -> Self {
        let shared = EngineShared::new(options.normalized());
        let module_init = Arc::new(OnceHook::new(
            "module initializer",
            program.module_initializer(),
        ));
        Self {
            state: LifecycleState::Uninitialized,
            options: shared.options.clone(),
            program: Arc::new(program),
            gc: collaborators.gc,
            tracer: collaborators.tracer,
            profiler: collaborators.profiler,
            module_init,
            shared,
            pool: None,
            primary: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Exit status most recently set by managed code.
    pub fn exit_status(&self) -> i32 {
        self.shared.exit_status.get()
    }

    pub fn primary(&self) -> Option<&Engine> {
        self.primary.as_ref()
    }

    pub fn engine_states(&self) -> Vec<EngineState> {
        self.pool.as_ref().map(EnginePool::states).unwrap_or_default()
    }

    pub fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        self.pool.as_ref().map(EnginePool::shutdown_handle)
    }

    /// Run the program's module initializer unless it already ran.
    pub fn init_modules(&self) -> Result<bool> {
        self.module_init.run()
    }

    fn invalid(&self, operation: &'static str) -> RuntimeError {
        RuntimeError::InvalidState {
            operation,
            state: self.state,
        }
    }

    /// Execute the bootstrap sequence and spawn the secondary engines.
    pub fn init(&mut self) -> Result<()> {
        if self.state != LifecycleState::Uninitialized {
            return Err(self.invalid("initialize"));
        }
        self.state = LifecycleState::Initializing;
        info!("Initializing runtime v{}", env!("CARGO_PKG_VERSION"));

        self.gc
            .init(!self.options.debug.gc_verbose)
            .map_err(|e| RuntimeError::hook("gc init", e))?;
        if self.options.gc_disabled {
            self.gc.disable_collection();
        }
        for tag in 1..(1usize << TAG_BITS) {
            self.gc.register_displacement(tag);
        }
        debug!(tags = (1usize << TAG_BITS) - 1, "Tag displacements registered");

        let options = self.options.clone();
        debug!(?options, "Options resolved");
        if self.program.entry_point().is_none() {
            return Err(RuntimeError::BootstrapInvariant(
                "no program entry point supplied".into(),
            ));
        }
        if options.debug.prog {
            info!(program = ?self.program, "Program loaded");
        }

        let mut pool = EnginePool::new(options.thread_count);
        let mut primary = Engine::new(0, self.shared.clone())?;
        pool.set_state(0, EngineState::Runnable);
        if options.profiling {
            self.profiler
                .init()
                .map_err(|e| RuntimeError::hook("profiler init", e))?;
        }

        let suspension = primary.trace_mut().suspend();

        self.module_init.run()?;
        if let Some(io_init) = self.program.io_initializer() {
            io_init().map_err(|e| RuntimeError::hook("io init", e))?;
        }

        self.tracer
            .init()
            .map_err(|e| RuntimeError::hook("tracer init", e))?;
        if let Some(initializer) = self.program.library_initializer() {
            let mut machine = primary.enter_managed();
            initializer(&mut machine)?;
        }

        primary.save_context();

        let tracing_enabled = primary.trace_mut().resume(suspension);
        self.tracer.start(tracing_enabled);

        let started = pool.spawn(
            self.program.clone(),
            self.shared.clone(),
            self.profiler.clone(),
        )?;
        info!(
            engines = started.len() + 1,
            tracing = tracing_enabled,
            "Runtime ready"
        );

        self.primary = Some(primary);
        self.pool = Some(pool);
        self.state = LifecycleState::Ready;
        Ok(())
    }

    /// Run the entry point on the primary engine, `repeats` times.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.state != LifecycleState::Ready {
            return Err(self.invalid("run"));
        }
        self.state = LifecycleState::Running;

        let options = self.options.clone();
        let mode = if options.benchmark_all_solutions {
            SolutionMode::All
        } else {
            SolutionMode::First
        };
        let primary = self
            .primary
            .as_mut()
            .ok_or_else(|| RuntimeError::BootstrapInvariant("primary engine missing".into()))?;
        let interpreter = Interpreter::new(&self.program, self.profiler.as_ref());
        let entry = self.program.entry_point();

        if let Some(pool) = &self.pool {
            pool.set_state(0, EngineState::Running);
        }
        if options.debug.mem {
            primary.zones_mut().reset_high_water();
        }
        let cpu_start = options.use_own_timer.then(user_cpu_millis);
        let wall_start = Instant::now();

        let mut summary = RunSummary::default();
        for repetition in 0..options.repeats {
            primary.load_context()?;
            let _timer = ScopedTimer::new(&self.shared.metrics, TimerType::InterpreterRun);
            let report = {
                let mut machine = primary.enter_managed();
                interpreter.run(&mut machine, entry, mode)?
            };
            debug!(
                repetition,
                found = report.found_solution(),
                solutions = report.solutions,
                redos = report.redos,
                "Run complete"
            );
            summary.reports.push(report);
        }

        summary.elapsed = wall_start.elapsed();
        summary.user_time_ms = cpu_start.map(|start| user_cpu_millis().saturating_sub(start));
        if options.debug.mem {
            for zone in primary.zone_summary() {
                info!(
                    zone = %zone.kind,
                    max_used_words = zone.max_used_words,
                    capacity_words = zone.capacity_words,
                    "Zone high-water mark"
                );
            }
        }
        if let Some(pool) = &self.pool {
            let drained = pool.drain(primary, &self.program, self.profiler.as_ref())?;
            summary.goals_drained = drained.goals;
            pool.set_state(0, EngineState::Runnable);
        }
        info!(
            repeats = summary.repeats(),
            goals_drained = summary.goals_drained,
            found = summary.found_solution(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Program finished"
        );
        Ok(summary)
    }

    /// Queue a goal for the engine pool.
    ///
    /// Secondary engines pick goals up as they arrive. Goals queued before
    /// [`Runtime::run`] that no secondary took are run by the primary engine
    /// once the program finishes. Without secondaries, goals are only
    /// accepted until `run` starts.
    pub fn submit(&self, goal: Goal) -> Result<()> {
        let Some(pool) = &self.pool else {
            return Err(self.invalid("submit a goal"));
        };
        match self.state {
            LifecycleState::Ready => {}
            LifecycleState::Running if pool.size() > 1 => {}
            LifecycleState::Running => {
                return Err(self.invalid("submit a goal without secondary engines"))
            }
            _ => return Err(self.invalid("submit a goal")),
        }
        pool.submit(goal);
        Ok(())
    }

    /// Run finalization hooks, stop every engine, and return the exit
    /// status. Hook failures are returned as they occur.
    pub fn terminate(&mut self) -> Result<i32> {
        if !matches!(self.state, LifecycleState::Ready | LifecycleState::Running) {
            return Err(self.invalid("terminate"));
        }
        self.state = LifecycleState::Terminating;
        info!("Terminating runtime");

        self.tracer
            .end()
            .map_err(|e| RuntimeError::hook("tracer end", e))?;
        if let (Some(finalizer), Some(primary)) =
            (self.program.library_finalizer(), self.primary.as_mut())
        {
            let mut machine = primary.enter_managed();
            finalizer(&mut machine)?;
        }
        self.tracer
            .finalize()
            .map_err(|e| RuntimeError::hook("tracer final", e))?;
        if self.options.profiling {
            self.profiler
                .finish()
                .map_err(|e| RuntimeError::hook("profiler finish", e))?;
        }

        if let Some(mut pool) = self.pool.take() {
            pool.shutdown();
            let reports = pool.join()?;
            for report in &reports {
                debug!(slot = report.slot, goals = report.goals, "Secondary engine stopped");
            }
            pool.set_state(0, EngineState::Terminated);
        }
        if let Some(primary) = self.primary.take() {
            primary.teardown();
        }

        self.state = LifecycleState::Terminated;
        let status = self.exit_status();
        info!(status, "Runtime terminated");
        Ok(status)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state)
            .field("engines", &self.engine_states())
            .field("module_init", &self.module_init)
            .finish()
    }
}

/// Report a fatal fault and exit the process.
pub fn fatal_error(err: &RuntimeError) -> ! {
    error!(error = %err, "Fatal runtime error");
    let mut message = format!("lpm: {}", err);
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(&format!(": {}", cause));
        source = cause.source();
    }
    eprintln!("{}", message);
    std::process::exit(err.exit_code());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::small_options;
    use crate::interpreter::programs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Journal(Arc<Mutex<Vec<String>>>);

    impl Journal {
        fn push(&self, event: &str) {
            self.0.lock().unwrap().push(event.to_string());
        }
    }

    struct JournalGc(Journal);

    impl GarbageCollector for JournalGc {
        fn init(&mut self, _quiet: bool) -> anyhow::Result<()> {
            self.0.push("gc init");
            Ok(())
        }

        fn register_displacement(&mut self, offset: usize) {
            self.0.push(&format!("displacement {}", offset));
        }
    }

    struct JournalTracer(Journal);

    impl Tracer for JournalTracer {
        fn init(&mut self) -> anyhow::Result<()> {
            self.0.push("tracer init");
            Ok(())
        }

        fn start(&mut self, enabled: bool) {
            self.0.push(&format!("tracer start {}", enabled));
        }

        fn end(&mut self) -> anyhow::Result<()> {
            self.0.push("tracer end");
            Ok(())
        }

        fn finalize(&mut self) -> anyhow::Result<()> {
            self.0.push("tracer final");
            Ok(())
        }
    }

    fn journaled_runtime(options: RuntimeOptions) -> (Runtime, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let journal = || Journal(log.clone());

        let mut builder = Program::builder();
        let entry = builder.label("main", |m| Ok(m.proceed()));
        builder.entry_point(entry);
        let init_journal = journal();
        builder.library_initializer(move |m| {
            init_journal.push(&format!("library init trace={}", m.trace_enabled()));
            Ok(())
        });
        let fin_journal = journal();
        builder.library_finalizer(move |m| {
            fin_journal.push("library final");
            m.set_exit_status(4);
            Ok(())
        });
        let mod_journal = journal();
        builder.module_initializer(move || {
            mod_journal.push("module init");
            Ok(())
        });
        let io_journal = journal();
        builder.io_initializer(move || {
            io_journal.push("io init");
            Ok(())
        });

        let collaborators = Collaborators {
            gc: Box::new(JournalGc(journal())),
            tracer: Box::new(JournalTracer(journal())),
            profiler: Arc::new(NoProfiler),
        };
        let runtime = Runtime::new(options, builder.build().unwrap(), collaborators);
        (runtime, log)
    }

    #[test]
    fn test_bootstrap_and_termination_order() {
        let mut options = small_options();
        options.trace_enabled = true;
        let (mut runtime, log) = journaled_runtime(options);

        runtime.init().unwrap();
        assert_eq!(runtime.state(), LifecycleState::Ready);
        assert!(runtime.primary().unwrap().has_saved_context());
        assert!(runtime.run().unwrap().found_solution());
        assert_eq!(runtime.terminate().unwrap(), 4);
        assert_eq!(runtime.state(), LifecycleState::Terminated);

        let tags = (1usize << TAG_BITS) - 1;
        let mut expected = vec!["gc init".to_string()];
        expected.extend((1..=tags).map(|t| format!("displacement {}", t)));
        expected.extend(
            [
                "module init",
                "io init",
                "tracer init",
                "library init trace=false",
                "tracer start true",
                "tracer end",
                "library final",
                "tracer final",
            ]
            .map(String::from),
        );
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[test]
    fn test_module_init_runs_once_across_paths() {
        let (mut runtime, log) = journaled_runtime(small_options());
        assert!(runtime.init_modules().unwrap());
        runtime.init().unwrap();
        assert!(!runtime.init_modules().unwrap());
        let count = log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == "module init")
            .count();
        assert_eq!(count, 1);
        runtime.terminate().unwrap();
    }

    #[test]
    fn test_out_of_order_calls_rejected() {
        let (mut runtime, _) = journaled_runtime(small_options());
        assert!(matches!(
            runtime.run(),
            Err(RuntimeError::InvalidState { operation: "run", .. })
        ));
        assert!(runtime.terminate().is_err());
        runtime.init().unwrap();
        assert!(runtime.init().is_err());
        runtime.terminate().unwrap();
        assert!(runtime.terminate().is_err());
    }

    #[test]
    fn test_single_engine_runs_goals_queued_before_run() {
        let program = programs::between(1, 4).unwrap();
        let entry = program.entry_point().unwrap();
        let mut runtime = Runtime::new(small_options(), program, Collaborators::default());
        runtime.init().unwrap();
        runtime.submit(Goal::new(entry)).unwrap();
        runtime.submit(Goal::all_solutions(entry)).unwrap();

        let summary = runtime.run().unwrap();
        assert_eq!(summary.goals_drained, 2);
        assert_eq!(runtime.metrics().goals, 2);

        // Nothing would ever run a goal queued now.
        assert!(matches!(
            runtime.submit(Goal::new(entry)),
            Err(RuntimeError::InvalidState { state: LifecycleState::Running, .. })
        ));
        runtime.terminate().unwrap();
        assert_eq!(runtime.metrics().goals, 2);
    }

    #[test]
    fn test_repeats_wrap_all_solutions_mode() {
        let mut options = small_options();
        options.repeats = 3;
        options.benchmark_all_solutions = true;
        let mut runtime = Runtime::new(
            options,
            programs::between(1, 4).unwrap(),
            Collaborators::default(),
        );
        runtime.init().unwrap();
        let summary = runtime.run().unwrap();
        assert_eq!(summary.repeats(), 3);
        assert_eq!(summary.solutions(), 12);
        assert_eq!(summary.redos(), 12);
        for report in &summary.reports {
            assert_eq!(report.frames_discarded, 1);
        }
        assert_eq!(runtime.metrics().interpreter_runs, 3);
        runtime.terminate().unwrap();
    }

    #[test]
    fn test_own_timer_reports_user_time() {
        let mut options = small_options();
        options.use_own_timer = true;
        let mut runtime = Runtime::new(
            options,
            programs::succeed_once().unwrap(),
            Collaborators::default(),
        );
        runtime.init().unwrap();
        assert!(runtime.run().unwrap().user_time_ms.is_some());
        runtime.terminate().unwrap();
    }

    #[test]
    fn test_finalizer_failure_propagates() {
        let mut builder = Program::builder();
        let entry = builder.label("main", |m| Ok(m.proceed()));
        builder.entry_point(entry);
        builder.library_finalizer(|_| {
            Err(RuntimeError::hook(
                "library finalizer",
                anyhow::anyhow!("finalizer raised"),
            ))
        });
        let mut runtime = Runtime::new(
            small_options(),
            builder.build().unwrap(),
            Collaborators::default(),
        );
        runtime.init().unwrap();
        let err = runtime.terminate().unwrap_err();
        assert!(matches!(err, RuntimeError::Hook { .. }));
        assert!(!err.is_fatal());
        assert_eq!(runtime.state(), LifecycleState::Terminating);
    }

    #[test]
    fn test_gc_receives_every_tag() {
        let registered = Arc::new(AtomicUsize::new(0));
        struct CountingGc(Arc<AtomicUsize>);
        impl GarbageCollector for CountingGc {
            fn init(&mut self, _quiet: bool) -> anyhow::Result<()> {
                Ok(())
            }
            fn register_displacement(&mut self, _offset: usize) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let mut runtime = Runtime::new(
            small_options(),
            programs::succeed_once().unwrap(),
            Collaborators {
                gc: Box::new(CountingGc(registered.clone())),
                ..Collaborators::default()
            },
        );
        runtime.init().unwrap();
        assert_eq!(registered.load(Ordering::SeqCst), (1 << TAG_BITS) - 1);
        runtime.terminate().unwrap();
    }
}
