//! Interpreter Core
//!
//! Drives a program entry point inside a choice-point frame of its own.
//! Control flow between labels is an explicit loop over [`Continuation`]:
//! every label returns the address to continue at, and reaching one of the
//! two per-invocation sentinels (`GLOBAL_SUCCESS`, `GLOBAL_FAIL`) turns
//! into a `Success` or `Fail` transition of the loop.

pub mod frames;
pub mod program;
pub mod programs;

pub use frames::{frame_end, FRAME_FIXED_WORDS, NO_FRAME};
pub use program::{LabelFn, ManagedHook, NativeHook, Program, ProgramBuilder};

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::TimeProfileMethod;
use crate::engine::{Machine, Reg};
use crate::error::{Result, RuntimeError};
use crate::memory::{Word, ZoneKind};
use crate::runtime::Profiler;

/// Address of a code label.
///
/// The first few addresses are reserved for runtime sentinels; program
/// labels are numbered after them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeAddr(u32);

impl CodeAddr {
    /// Continuation that must never be taken.
    pub const NOT_REACHED: CodeAddr = CodeAddr(0);
    /// Success continuation of an interpreter invocation.
    pub const GLOBAL_SUCCESS: CodeAddr = CodeAddr(1);
    /// Failure continuation of the interpreter's choice point.
    pub const GLOBAL_FAIL: CodeAddr = CodeAddr(2);
    /// Pops the newest choice point and fails into the next one.
    pub const DO_FAIL: CodeAddr = CodeAddr(3);

    const FIRST_USER: u32 = 4;

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn to_word(self) -> Word {
        self.0 as Word
    }

    /// Decode an address stored in a register or frame slot. Values that do
    /// not fit are mapped to an address no program defines.
    pub fn from_word(word: Word) -> Self {
        Self(u32::try_from(word).unwrap_or(u32::MAX))
    }

    pub(crate) fn from_user_index(index: usize) -> Self {
        let raw = u32::try_from(index)
            .ok()
            .and_then(|i| i.checked_add(Self::FIRST_USER))
            .unwrap_or(u32::MAX);
        Self(raw)
    }

    pub(crate) fn user_index(self) -> Option<usize> {
        self.0.checked_sub(Self::FIRST_USER).map(|i| i as usize)
    }
}

impl fmt::Display for CodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NOT_REACHED => write!(f, "not_reached"),
            Self::GLOBAL_SUCCESS => write!(f, "global_success"),
            Self::GLOBAL_FAIL => write!(f, "global_fail"),
            Self::DO_FAIL => write!(f, "do_fail"),
            Self(raw) => write!(f, "label#{}", raw),
        }
    }
}

/// Whether a run stops at the first solution or enumerates all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SolutionMode {
    First,
    All,
}

/// Outcome of one interpreter invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub solutions: u64,
    pub redos: u64,
    /// Choice points popped during final cleanup, the interpreter's own
    /// frame included.
    pub frames_discarded: usize,
    pub labels_executed: u64,
}

impl RunReport {
    /// At least one solution was found.
    pub fn found_solution(&self) -> bool {
        self.solutions > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Continuation {
    Resume(CodeAddr),
    Success,
    Redo,
    Fail,
}

/// Turns time profiling off when dropped.
struct ProfilingSession<'a> {
    profiler: &'a dyn Profiler,
}

impl<'a> ProfilingSession<'a> {
    fn start(profiler: &'a dyn Profiler, method: TimeProfileMethod) -> Self {
        profiler.turn_on_time_profiling(method);
        Self { profiler }
    }
}

impl Drop for ProfilingSession<'_> {
    fn drop(&mut self) {
        self.profiler.turn_off_time_profiling();
    }
}

/// Runs entry points of one program.
pub struct Interpreter<'p> {
    program: &'p Program,
    profiler: &'p dyn Profiler,
}

impl<'p> Interpreter<'p> {
    pub fn new(program: &'p Program, profiler: &'p dyn Profiler) -> Self {
        Self { program, profiler }
    }

    /// Run `entry` to its first solution, or through all of them.
    ///
    /// `hp`, `succip` and `maxfr` are preserved across the call. Every
    /// invocation sets up its own choice point, so repeated runs never
    /// share frames.
    pub fn run(
        &self,
        m: &mut Machine<'_>,
        entry: Option<CodeAddr>,
        mode: SolutionMode,
    ) -> Result<RunReport> {
        let entry = entry.ok_or_else(|| {
            RuntimeError::BootstrapInvariant("no program entry point supplied".into())
        })?;
        let sp_before = m.reg(Reg::Sp);

        let saved_maxfr = m.reg(Reg::Maxfr);
        for reg in [Reg::Hp, Reg::Succip, Reg::Maxfr] {
            let value = m.reg(reg);
            m.push(value)?;
        }

        m.mkframe("interpreter", 1, CodeAddr::GLOBAL_FAIL)?;
        m.set_stack_trace_bottom(CodeAddr::GLOBAL_SUCCESS);

        let profiling = m.options().profiling.then(|| {
            ProfilingSession::start(self.profiler, m.options().time_profile_method)
        });

        let mut report = RunReport::default();
        let mut next = Continuation::Resume(m.call(entry, CodeAddr::GLOBAL_SUCCESS));
        loop {
            next = match next {
                Continuation::Resume(CodeAddr::GLOBAL_SUCCESS) => Continuation::Success,
                Continuation::Resume(CodeAddr::GLOBAL_FAIL) => Continuation::Fail,
                Continuation::Resume(CodeAddr::DO_FAIL) => {
                    Continuation::Resume(m.discard_and_fail()?)
                }
                Continuation::Resume(addr) => {
                    report.labels_executed += 1;
                    Continuation::Resume(self.step(m, addr)?)
                }
                Continuation::Success => {
                    report.solutions += 1;
                    self.log_final_state(m, "success");
                    match mode {
                        SolutionMode::All => Continuation::Redo,
                        SolutionMode::First => break,
                    }
                }
                Continuation::Redo => {
                    report.redos += 1;
                    Continuation::Resume(m.redo()?)
                }
                Continuation::Fail => {
                    self.log_final_state(m, "failure");
                    break;
                }
            };
        }
        drop(profiling);

        report.frames_discarded = m.discard_frames_to(saved_maxfr)?;
        let maxfr = m.pop()?;
        let succip = m.pop()?;
        let hp = m.pop()?;
        m.set_reg(Reg::Maxfr, maxfr);
        m.set_reg(Reg::Curfr, maxfr);
        m.set_reg(Reg::Succip, succip);
        m.set_reg(Reg::Hp, hp);
        m.zone_mut(ZoneKind::Heap).set_top(hp)?;

        m.metrics().record_solutions(report.solutions);
        if m.options().check_space {
            check_space(m, sp_before, saved_maxfr);
        }
        debug!(
            engine = m.engine_id(),
            solutions = report.solutions,
            redos = report.redos,
            frames_discarded = report.frames_discarded,
            "Interpreter finished"
        );
        Ok(report)
    }

    fn step(&self, m: &mut Machine<'_>, addr: CodeAddr) -> Result<CodeAddr> {
        let (name, code) = self.program.label(addr)?;
        if m.options().debug.call {
            debug!(engine = m.engine_id(), label = name, %addr, "call");
        }
        code(m)
    }

    fn log_final_state(&self, m: &Machine<'_>, outcome: &str) {
        if m.options().debug.final_state {
            let regs = m.registers();
            info!(
                engine = m.engine_id(),
                outcome,
                hp = regs.hp,
                sp = regs.sp,
                curfr = regs.curfr,
                maxfr = regs.maxfr,
                r1 = regs.general[0],
                "Final state"
            );
        }
        if m.options().debug.detail {
            let frames = m.frame_depth().unwrap_or(0);
            info!(engine = m.engine_id(), outcome, frames, "Choice-point stack");
        }
    }
}

fn check_space(m: &Machine<'_>, sp_before: Word, maxfr_before: Word) {
    let sp = m.reg(Reg::Sp);
    let maxfr = m.reg(Reg::Maxfr);
    if sp != sp_before || maxfr != maxfr_before {
        warn!(
            engine = m.engine_id(),
            sp_before, sp, maxfr_before, maxfr, "Stack pointers not restored after run"
        );
    }
    for kind in [ZoneKind::Heap, ZoneKind::DetStack, ZoneKind::NondetStack] {
        let zone = m.zone(kind);
        info!(
            engine = m.engine_id(),
            zone = %kind,
            max_used_words = zone.high_water() - zone.base(),
            capacity_words = zone.capacity(),
            "Space used"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::small_engine;
    use crate::runtime::NoProfiler;

    fn run(program: &Program, mode: SolutionMode) -> Result<RunReport> {
        let mut engine = small_engine(0);
        let mut m = engine.enter_managed();
        Interpreter::new(program, &NoProfiler).run(&mut m, program.entry_point(), mode)
    }

    #[test]
    fn test_succeed_immediately() {
        let program = programs::succeed_once().unwrap();
        let report = run(&program, SolutionMode::First).unwrap();
        assert!(report.found_solution());
        assert_eq!(report.frames_discarded, 1);
        assert_eq!(report.redos, 0);
    }

    #[test]
    fn test_failing_entry_finds_nothing() {
        let program = programs::always_fail().unwrap();
        let report = run(&program, SolutionMode::First).unwrap();
        assert!(!report.found_solution());
        assert_eq!(report.frames_discarded, 1);
    }

    #[test]
    fn test_single_mode_stops_at_first_solution() {
        let program = programs::between(1, 5).unwrap();
        let report = run(&program, SolutionMode::First).unwrap();
        assert_eq!(report.solutions, 1);
        assert_eq!(report.redos, 0);
        // The generator's own choice point is still live at the end.
        assert_eq!(report.frames_discarded, 2);
    }

    #[test]
    fn test_all_mode_enumerates_until_exhausted() {
        let program = programs::between(1, 5).unwrap();
        let report = run(&program, SolutionMode::All).unwrap();
        assert_eq!(report.solutions, 5);
        assert_eq!(report.redos, 5);
        assert_eq!(report.frames_discarded, 1);
    }

    #[test]
    fn test_registers_preserved_across_run() {
        let program = programs::between(1, 3).unwrap();
        let mut engine = small_engine(0);
        let before = *engine.registers();
        {
            let mut m = engine.enter_managed();
            Interpreter::new(&program, &NoProfiler)
                .run(&mut m, program.entry_point(), SolutionMode::All)
                .unwrap();
        }
        let after = engine.registers();
        assert_eq!(after.hp, before.hp);
        assert_eq!(after.sp, before.sp);
        assert_eq!(after.maxfr, before.maxfr);
        assert_eq!(after.succip, before.succip);
    }

    #[test]
    fn test_missing_entry_point() {
        let program = Program::builder().build().unwrap();
        assert!(matches!(
            run(&program, SolutionMode::First),
            Err(RuntimeError::BootstrapInvariant(_))
        ));
    }

    #[test]
    fn test_jump_to_not_reached_is_unknown_label() {
        let mut builder = Program::builder();
        let entry = builder.label("lost", |_| Ok(CodeAddr::NOT_REACHED));
        builder.entry_point(entry);
        let program = builder.build().unwrap();
        assert!(matches!(
            run(&program, SolutionMode::First),
            Err(RuntimeError::UnknownLabel(CodeAddr::NOT_REACHED))
        ));
    }

    #[test]
    fn test_code_addr_word_round_trip() {
        let addr = CodeAddr::new(17);
        assert_eq!(CodeAddr::from_word(addr.to_word()), addr);
        assert_eq!(CodeAddr::from_word(usize::MAX).raw(), u32::MAX);
        assert_eq!(CodeAddr::GLOBAL_FAIL.to_string(), "global_fail");
        assert_eq!(CodeAddr::new(9).to_string(), "label#9");
    }
}
