//! Engine module - per-thread machine state
//!
//! An [`Engine`] is the complete state of one abstract machine: its six
//! memory zones, its saved register set and the emulated register file of
//! the native thread that drives it. Engines are never shared; the pool
//! hands each one to exactly one OS thread.

pub mod bridge;
pub mod once;
pub mod pool;

pub use bridge::{
    GeneralReg, Machine, Reg, RegisterFile, Registers, TraceSwitch, NUM_GENERAL_REGS,
};
pub use once::OnceHook;
pub use pool::{EnginePool, EngineState, Goal, RunQueue, ShutdownHandle, WorkerReport};

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::RuntimeOptions;
use crate::error::{Result, RuntimeError};
use crate::interpreter::{frames, CodeAddr, NO_FRAME};
use crate::memory::{CacheSlicer, ZoneKind, ZoneSet, ZoneSummary};
use crate::perf::RuntimeMetrics;

/// Process exit status, settable by managed code and read at termination.
#[derive(Debug, Clone, Default)]
pub struct ExitStatus(Arc<AtomicI32>);

impl ExitStatus {
    pub fn get(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, status: i32) {
        self.0.store(status, Ordering::SeqCst);
    }
}

/// State shared by every engine of one runtime.
#[derive(Debug, Clone)]
pub struct EngineShared {
    pub options: Arc<RuntimeOptions>,
    pub exit_status: ExitStatus,
    pub metrics: Arc<RuntimeMetrics>,
}

impl EngineShared {
    pub fn new(options: RuntimeOptions) -> Self {
        Self {
            options: Arc::new(options),
            exit_status: ExitStatus::default(),
            metrics: Arc::new(RuntimeMetrics::new()),
        }
    }
}

/// Zones plus the abstract registers saved outside managed code.
#[derive(Debug)]
pub struct EngineContext {
    pub(crate) zones: ZoneSet,
    pub(crate) regs: Registers,
    pub(crate) stack_trace_bottom: Option<CodeAddr>,
    saved: Option<Registers>,
}

impl EngineContext {
    fn new(zones: ZoneSet) -> Self {
        let regs = Registers {
            succip: CodeAddr::NOT_REACHED.to_word(),
            hp: zones.get(ZoneKind::Heap).base(),
            sp: zones.get(ZoneKind::DetStack).base(),
            curfr: NO_FRAME,
            maxfr: NO_FRAME,
            sol_hp: zones.get(ZoneKind::SolutionsHeap).base(),
            global_hp: zones.get(ZoneKind::GlobalHeap).base(),
            trail_ptr: zones.get(ZoneKind::Trail).base(),
            general: [0; NUM_GENERAL_REGS],
        };
        Self {
            zones,
            regs,
            stack_trace_bottom: None,
            saved: None,
        }
    }

    /// Bring zone tops in line with the register values.
    fn sync_tops(&mut self) -> Result<()> {
        let regs = self.regs;
        self.zones.get_mut(ZoneKind::Heap).set_top(regs.hp)?;
        self.zones.get_mut(ZoneKind::DetStack).set_top(regs.sp)?;
        self.zones
            .get_mut(ZoneKind::SolutionsHeap)
            .set_top(regs.sol_hp)?;
        self.zones
            .get_mut(ZoneKind::GlobalHeap)
            .set_top(regs.global_hp)?;
        self.zones.get_mut(ZoneKind::Trail).set_top(regs.trail_ptr)?;
        let nondet = self.zones.get_mut(ZoneKind::NondetStack);
        let top = frames::frame_end(nondet, regs.maxfr)?;
        nondet.set_top(top)?;
        Ok(())
    }
}

/// One abstract machine, owned by a single OS thread.
pub struct Engine {
    pub(crate) id: usize,
    pub(crate) context: EngineContext,
    pub(crate) file: RegisterFile,
    pub(crate) trace: TraceSwitch,
    pub(crate) shared: EngineShared,
}

impl Engine {
    /// Allocate the zones for pool slot `id` and set up initial registers.
    pub fn new(id: usize, shared: EngineShared) -> Result<Self> {
        let options = &shared.options;
        let mut slicer = CacheSlicer::for_engine(options.pcache_kb, id);
        let zones = ZoneSet::allocate(&options.zones, &mut slicer)?;
        let trace = TraceSwitch::new(options.trace_enabled);
        info!(engine = id, "Engine created");
        Ok(Self {
            id,
            context: EngineContext::new(zones),
            file: RegisterFile::default(),
            trace,
            shared,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn zones(&self) -> &ZoneSet {
        &self.context.zones
    }

    pub fn zones_mut(&mut self) -> &mut ZoneSet {
        &mut self.context.zones
    }

    /// Registers as last flushed from managed code.
    pub fn registers(&self) -> &Registers {
        &self.context.regs
    }

    /// The native thread's view of the machine register file.
    pub fn native_registers(&self) -> &RegisterFile {
        &self.file
    }

    pub fn native_registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.file
    }

    pub fn trace(&self) -> &TraceSwitch {
        &self.trace
    }

    pub fn trace_mut(&mut self) -> &mut TraceSwitch {
        &mut self.trace
    }

    pub fn shared(&self) -> &EngineShared {
        &self.shared
    }

    pub fn has_saved_context(&self) -> bool {
        self.context.saved.is_some()
    }

    /// Snapshot the current register set as the restart point for runs.
    pub fn save_context(&mut self) {
        self.context.saved = Some(self.context.regs);
        debug!(engine = self.id, "Engine context saved");
    }

    /// Restore the register set captured by [`save_context`](Self::save_context).
    pub fn load_context(&mut self) -> Result<()> {
        let saved = self.context.saved.ok_or_else(|| {
            RuntimeError::BootstrapInvariant(format!(
                "engine {} context loaded before it was saved",
                self.id
            ))
        })?;
        self.context.regs = saved;
        self.context.sync_tops()?;
        debug!(engine = self.id, "Engine context loaded");
        Ok(())
    }

    /// Per-zone usage, for reports and diagnostics.
    pub fn zone_summary(&self) -> Vec<ZoneSummary> {
        self.context.zones.summary()
    }

    /// Release the engine, returning its final zone usage.
    pub fn teardown(self) -> Vec<ZoneSummary> {
        let summary = self.zone_summary();
        if self.shared.options.debug.mem {
            for zone in &summary {
                info!(
                    engine = self.id,
                    zone = %zone.kind,
                    max_used_words = zone.max_used_words,
                    capacity_words = zone.capacity_words,
                    "Zone usage"
                );
            }
        }
        info!(engine = self.id, "Engine torn down");
        summary
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("regs", &self.context.regs)
            .field("trace", &self.trace)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ZoneSize;

    pub(crate) fn small_options() -> RuntimeOptions {
        let mut options = RuntimeOptions::default();
        for kind in ZoneKind::ALL {
            *options.zones.get_mut(kind) = ZoneSize {
                size_kb: 16,
                redzone_kb: 4,
            };
        }
        options
    }

    pub(crate) fn small_engine(id: usize) -> Engine {
        Engine::new(id, EngineShared::new(small_options())).unwrap()
    }

    #[test]
    fn test_initial_registers_point_at_zone_bases() {
        let engine = small_engine(0);
        let regs = engine.registers();
        assert_eq!(regs.hp, engine.zones().get(ZoneKind::Heap).base());
        assert_eq!(regs.sp, engine.zones().get(ZoneKind::DetStack).base());
        assert_eq!(regs.maxfr, NO_FRAME);
        assert_eq!(regs.curfr, NO_FRAME);
    }

    #[test]
    fn test_load_before_save_is_invariant_violation() {
        let mut engine = small_engine(0);
        assert!(matches!(
            engine.load_context(),
            Err(RuntimeError::BootstrapInvariant(_))
        ));
    }

    #[test]
    fn test_load_context_restores_saved_registers() {
        let mut engine = small_engine(0);
        engine.save_context();
        let saved = *engine.registers();
        {
            let mut machine = engine.enter_managed();
            machine.push(1).unwrap();
            machine.alloc_heap(10).unwrap();
        }
        assert_ne!(*engine.registers(), saved);
        engine.load_context().unwrap();
        assert_eq!(*engine.registers(), saved);
        assert_eq!(
            engine.zones().get(ZoneKind::Heap).top(),
            saved.hp
        );
    }

    #[test]
    fn test_exit_status_shared_between_clones() {
        let status = ExitStatus::default();
        let other = status.clone();
        other.set(3);
        assert_eq!(status.get(), 3);
    }

    #[test]
    fn test_engines_have_disjoint_zones() {
        let a = small_engine(0);
        let b = small_engine(1);
        for za in a.zones().iter() {
            for zb in b.zones().iter() {
                let (ra, rb) = (za.address_range(), zb.address_range());
                assert!(ra.end <= rb.start || rb.end <= ra.start);
            }
        }
    }
}
