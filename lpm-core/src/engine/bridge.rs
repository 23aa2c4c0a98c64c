//! Native/Managed Register Bridge
//!
//! The abstract machine keeps its hottest registers (continuation pointer,
//! heap pointer, stack and frame pointers, the first general registers)
//! pinned in the machine register file while managed code runs. Native code
//! uses the same register file for its own callee-saved values, so every
//! crossing is bracketed:
//!
//! ```text
//! native ──enter_managed──▶ snapshot native slots, bind engine registers
//!        ◀──leave_managed── flush engine registers, restore native slots
//! ```
//!
//! [`Machine`] is the managed-side capability. It exists only between the
//! two halves of the bracket; dropping it performs `leave_managed` on every
//! exit path, including `?` propagation and unwinding.

use std::fmt;
use tracing::trace;

use super::{Engine, ExitStatus};
use crate::config::RuntimeOptions;
use crate::error::{Result, RuntimeError};
use crate::interpreter::CodeAddr;
use crate::memory::{Word, Zone, ZoneKind};

/// Slots in the machine register file.
pub const NUM_REAL_REGS: usize = 16;

/// General-purpose registers `r1..=r32` of the abstract machine.
pub const NUM_GENERAL_REGS: usize = 32;

/// General registers that live in real slots while managed code runs.
const NUM_REAL_GENERAL: usize = NUM_REAL_REGS - 8;

/// An abstract machine register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    /// Success continuation.
    Succip,
    /// Heap pointer.
    Hp,
    /// Deterministic stack pointer.
    Sp,
    /// Current choice-point frame.
    Curfr,
    /// Topmost choice-point frame.
    Maxfr,
    /// Solutions heap pointer.
    SolHp,
    /// Global heap pointer.
    GlobalHp,
    /// Trail pointer.
    TrailPtr,
    /// General register, see [`Reg::r`].
    R(GeneralReg),
}

/// Number of a general register, always within `1..=NUM_GENERAL_REGS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeneralReg(u8);

impl GeneralReg {
    pub fn new(number: usize) -> Result<Self> {
        if (1..=NUM_GENERAL_REGS).contains(&number) {
            Ok(Self(number as u8))
        } else {
            Err(RuntimeError::InvalidRegister(number))
        }
    }

    pub fn number(self) -> usize {
        self.0 as usize
    }

    fn index(self) -> usize {
        self.number() - 1
    }
}

impl Reg {
    /// First general register, where results are returned.
    pub const R1: Reg = Reg::R(GeneralReg(1));

    /// General register `r<number>`.
    pub fn r(number: usize) -> Result<Reg> {
        GeneralReg::new(number).map(Self::R)
    }

    /// Slot this register is pinned to while managed code runs.
    fn real_slot(self) -> Option<usize> {
        match self {
            Self::Succip => Some(0),
            Self::Hp => Some(1),
            Self::Sp => Some(2),
            Self::Curfr => Some(3),
            Self::Maxfr => Some(4),
            Self::SolHp => Some(5),
            Self::GlobalHp => Some(6),
            Self::TrailPtr => Some(7),
            Self::R(r) if r.number() <= NUM_REAL_GENERAL => Some(7 + r.number()),
            Self::R(_) => None,
        }
    }

    fn pinned() -> impl Iterator<Item = Reg> {
        [
            Self::Succip,
            Self::Hp,
            Self::Sp,
            Self::Curfr,
            Self::Maxfr,
            Self::SolHp,
            Self::GlobalHp,
            Self::TrailPtr,
        ]
        .into_iter()
        .chain((1..=NUM_REAL_GENERAL).map(|n| Self::R(GeneralReg(n as u8))))
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succip => write!(f, "succip"),
            Self::Hp => write!(f, "hp"),
            Self::Sp => write!(f, "sp"),
            Self::Curfr => write!(f, "curfr"),
            Self::Maxfr => write!(f, "maxfr"),
            Self::SolHp => write!(f, "sol_hp"),
            Self::GlobalHp => write!(f, "global_hp"),
            Self::TrailPtr => write!(f, "trail_ptr"),
            Self::R(r) => write!(f, "r{}", r.number()),
        }
    }
}

/// The emulated machine register file of one native thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterFile {
    slots: [Word; NUM_REAL_REGS],
}

impl RegisterFile {
    pub fn slot(&self, index: usize) -> Word {
        self.slots[index]
    }

    pub fn set_slot(&mut self, index: usize, value: Word) {
        self.slots[index] = value;
    }

    pub fn slots(&self) -> &[Word; NUM_REAL_REGS] {
        &self.slots
    }
}

/// The full abstract register set as stored in an engine context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub succip: Word,
    pub hp: Word,
    pub sp: Word,
    pub curfr: Word,
    pub maxfr: Word,
    pub sol_hp: Word,
    pub global_hp: Word,
    pub trail_ptr: Word,
    pub general: [Word; NUM_GENERAL_REGS],
}

impl Registers {
    pub fn get(&self, reg: Reg) -> Word {
        match reg {
            Reg::Succip => self.succip,
            Reg::Hp => self.hp,
            Reg::Sp => self.sp,
            Reg::Curfr => self.curfr,
            Reg::Maxfr => self.maxfr,
            Reg::SolHp => self.sol_hp,
            Reg::GlobalHp => self.global_hp,
            Reg::TrailPtr => self.trail_ptr,
            Reg::R(r) => self.general[r.index()],
        }
    }

    pub fn set(&mut self, reg: Reg, value: Word) {
        match reg {
            Reg::Succip => self.succip = value,
            Reg::Hp => self.hp = value,
            Reg::Sp => self.sp = value,
            Reg::Curfr => self.curfr = value,
            Reg::Maxfr => self.maxfr = value,
            Reg::SolHp => self.sol_hp = value,
            Reg::GlobalHp => self.global_hp = value,
            Reg::TrailPtr => self.trail_ptr = value,
            Reg::R(r) => self.general[r.index()] = value,
        }
    }

    fn bind(&self, file: &mut RegisterFile) {
        for reg in Reg::pinned() {
            if let Some(slot) = reg.real_slot() {
                file.slots[slot] = self.get(reg);
            }
        }
    }

    fn flush(&mut self, file: &RegisterFile) {
        for reg in Reg::pinned() {
            if let Some(slot) = reg.real_slot() {
                self.set(reg, file.slots[slot]);
            }
        }
    }
}

/// Tracing state that bootstrap code may force off temporarily.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceSwitch {
    enabled: bool,
    suspended: bool,
}

/// Proof that tracing was suspended; carries the value to restore.
#[must_use = "tracing stays disabled until the suspension is resumed"]
#[derive(Debug)]
pub struct TraceSuspension {
    saved: bool,
}

impl TraceSwitch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            suspended: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.suspended
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Force tracing off until [`resume`](Self::resume).
    pub fn suspend(&mut self) -> TraceSuspension {
        let saved = self.enabled;
        self.enabled = false;
        self.suspended = true;
        TraceSuspension { saved }
    }

    /// Restore the pre-suspension value, discarding anything managed code
    /// changed meanwhile. Returns the restored value.
    pub fn resume(&mut self, suspension: TraceSuspension) -> bool {
        self.enabled = suspension.saved;
        self.suspended = false;
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

/// Managed-side view of an engine, live between `enter_managed` and
/// `leave_managed`.
pub struct Machine<'e> {
    engine: &'e mut Engine,
    native: RegisterFile,
}

impl Engine {
    /// Snapshot the native register file and bind this engine's registers
    /// into it. The returned [`Machine`] restores both on drop.
    pub fn enter_managed(&mut self) -> Machine<'_> {
        let native = self.file;
        self.context.regs.bind(&mut self.file);
        trace!(engine = self.id, "Entered managed code");
        Machine {
            engine: self,
            native,
        }
    }
}

impl Drop for Machine<'_> {
    fn drop(&mut self) {
        let engine = &mut *self.engine;
        engine.context.regs.flush(&engine.file);
        engine.file = self.native;
        trace!(engine = engine.id, "Left managed code");
    }
}

impl<'e> Machine<'e> {
    pub fn engine_id(&self) -> usize {
        self.engine.id
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.engine.shared.options
    }

    pub fn exit_status(&self) -> &ExitStatus {
        &self.engine.shared.exit_status
    }

    /// Record the process exit status reported at termination.
    pub fn set_exit_status(&self, status: i32) {
        self.engine.shared.exit_status.set(status);
    }

    pub fn trace_enabled(&self) -> bool {
        self.engine.trace.is_enabled()
    }

    pub fn reg(&self, reg: Reg) -> Word {
        match reg.real_slot() {
            Some(slot) => self.engine.file.slots[slot],
            None => self.engine.context.regs.get(reg),
        }
    }

    pub fn set_reg(&mut self, reg: Reg, value: Word) {
        match reg.real_slot() {
            Some(slot) => self.engine.file.slots[slot] = value,
            None => self.engine.context.regs.set(reg, value),
        }
    }

    /// Current values of every abstract register.
    pub fn registers(&self) -> Registers {
        let mut regs = self.engine.context.regs;
        regs.flush(&self.engine.file);
        regs
    }

    pub fn zone(&self, kind: ZoneKind) -> &Zone {
        self.engine.context.zones.get(kind)
    }

    pub fn zone_mut(&mut self, kind: ZoneKind) -> &mut Zone {
        self.engine.context.zones.get_mut(kind)
    }

    pub(crate) fn metrics(&self) -> &crate::perf::RuntimeMetrics {
        &self.engine.shared.metrics
    }

    pub fn set_stack_trace_bottom(&mut self, label: CodeAddr) {
        self.engine.context.stack_trace_bottom = Some(label);
    }

    pub fn stack_trace_bottom(&self) -> Option<CodeAddr> {
        self.engine.context.stack_trace_bottom
    }

    /// Push a word onto the deterministic stack.
    pub fn push(&mut self, value: Word) -> Result<()> {
        let sp = self.reg(Reg::Sp);
        let zone = self.zone_mut(ZoneKind::DetStack);
        zone.write(sp, value)?;
        zone.set_top(sp + 1)?;
        self.set_reg(Reg::Sp, sp + 1);
        if self.options().debug.detstack {
            trace!(engine = self.engine_id(), sp = sp + 1, value, "detstack push");
        }
        Ok(())
    }

    /// Pop a word from the deterministic stack.
    pub fn pop(&mut self) -> Result<Word> {
        let sp = self.reg(Reg::Sp);
        let zone = self.zone_mut(ZoneKind::DetStack);
        let new_sp = sp.checked_sub(1).ok_or(RuntimeError::ZoneUnderflow {
            zone: ZoneKind::DetStack,
            index: sp,
        })?;
        let value = zone.read(new_sp)?;
        zone.set_top(new_sp)?;
        self.set_reg(Reg::Sp, new_sp);
        if self.options().debug.detstack {
            trace!(engine = self.engine_id(), sp = new_sp, value, "detstack pop");
        }
        Ok(value)
    }

    /// Allocate `count` cells on the heap, returning the first address.
    pub fn alloc_heap(&mut self, count: usize) -> Result<Word> {
        let hp = self.reg(Reg::Hp);
        let end = hp.checked_add(count).ok_or(RuntimeError::ZoneOverflow {
            zone: ZoneKind::Heap,
            index: usize::MAX,
        })?;
        self.zone_mut(ZoneKind::Heap).set_top(end)?;
        self.set_reg(Reg::Hp, end);
        if self.options().debug.heap {
            trace!(engine = self.engine_id(), hp = end, count, "heap alloc");
        }
        Ok(hp)
    }

    pub fn heap_read(&self, address: Word) -> Result<Word> {
        self.zone(ZoneKind::Heap).read(address)
    }

    pub fn heap_write(&mut self, address: Word, value: Word) -> Result<()> {
        self.zone_mut(ZoneKind::Heap).write(address, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::small_engine;

    #[test]
    fn test_round_trip_preserves_native_registers() {
        let mut engine = small_engine(0);
        for i in 0..NUM_REAL_REGS {
            engine.native_registers_mut().set_slot(i, 0x1000 + i * 7);
        }
        let before = *engine.native_registers();
        let context_before = *engine.registers();

        {
            let machine = engine.enter_managed();
            // Engine registers are bound while managed code runs.
            assert_eq!(machine.reg(Reg::Hp), context_before.hp);
        }

        assert_eq!(*engine.native_registers(), before);
        assert_eq!(*engine.registers(), context_before);
    }

    #[test]
    fn test_managed_mutation_reaches_context_only() {
        let mut engine = small_engine(0);
        engine.native_registers_mut().set_slot(1, 42);
        let native = *engine.native_registers();

        {
            let mut machine = engine.enter_managed();
            machine.set_reg(Reg::R1, 99);
            machine.set_reg(Reg::r(20).unwrap(), 7);
            machine.alloc_heap(3).unwrap();
        }

        assert_eq!(*engine.native_registers(), native);
        assert_eq!(engine.registers().general[0], 99);
        assert_eq!(engine.registers().general[19], 7);
        assert_eq!(engine.registers().hp, 3);
    }

    #[test]
    fn test_bracket_restores_on_error_path() {
        fn failing(engine: &mut Engine) -> Result<()> {
            let mut machine = engine.enter_managed();
            machine.set_reg(Reg::Sp, 0);
            machine.pop()?;
            Ok(())
        }

        let mut engine = small_engine(0);
        engine.native_registers_mut().set_slot(2, 0xabc);
        let native = *engine.native_registers();
        assert!(failing(&mut engine).is_err());
        assert_eq!(*engine.native_registers(), native);
    }

    #[test]
    fn test_det_stack_push_pop() {
        let mut engine = small_engine(0);
        let mut machine = engine.enter_managed();
        machine.push(5).unwrap();
        machine.push(6).unwrap();
        assert_eq!(machine.reg(Reg::Sp), 2);
        assert_eq!(machine.pop().unwrap(), 6);
        assert_eq!(machine.pop().unwrap(), 5);
        assert!(machine.pop().is_err());
    }

    #[test]
    fn test_trace_switch_restores_saved_value() {
        let mut switch = TraceSwitch::new(true);
        let suspension = switch.suspend();
        assert!(!switch.is_enabled());
        assert!(switch.is_suspended());
        // A library initializer turning tracing on is undone on resume.
        switch.set_enabled(true);
        switch.set_enabled(false);
        assert!(switch.resume(suspension));
        assert!(switch.is_enabled());
    }

    #[test]
    fn test_register_names() {
        assert_eq!(Reg::Maxfr.to_string(), "maxfr");
        assert_eq!(Reg::r(3).unwrap().to_string(), "r3");
    }

    #[test]
    fn test_general_register_bounds() {
        assert!(matches!(Reg::r(0), Err(RuntimeError::InvalidRegister(0))));
        assert!(matches!(
            Reg::r(NUM_GENERAL_REGS + 1),
            Err(RuntimeError::InvalidRegister(n)) if n == NUM_GENERAL_REGS + 1
        ));
        assert_eq!(Reg::r(1).unwrap(), Reg::R1);

        let mut engine = small_engine(0);
        let mut machine = engine.enter_managed();
        let last = Reg::r(NUM_GENERAL_REGS).unwrap();
        machine.set_reg(last, 11);
        assert_eq!(machine.reg(last), 11);
        assert_eq!(machine.registers().general[NUM_GENERAL_REGS - 1], 11);
    }
}
