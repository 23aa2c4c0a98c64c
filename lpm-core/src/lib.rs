//! LPM Core - execution core of a logic-programming abstract machine
//!
//! Boots a register-based, non-deterministic interpreter over a pool of
//! engines, each owning its own guarded memory zones.
//!
//! # Layout:
//! - [`config`]: immutable runtime options and option-string parsing
//! - [`memory`]: zones with redzones and cache-staggered bases
//! - [`engine`]: per-thread machine state, register bridge, engine pool
//! - [`interpreter`]: choice-point protocol and the dispatch loop
//! - [`runtime`]: ordered init/run/terminate lifecycle
//! - [`perf`]: counters and process clocks
//! - [`ffi`]: C-ABI host hook table

pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod interpreter;
pub mod memory;
pub mod perf;
pub mod runtime;

pub use config::{RuntimeOptions, TimeProfileMethod, ZoneLayout, ZoneSize};
pub use engine::{Engine, EnginePool, EngineState, Goal, Machine, Reg, ShutdownHandle};
pub use error::{ConfigError, Result, RuntimeError};
pub use interpreter::{CodeAddr, Interpreter, Program, ProgramBuilder, RunReport, SolutionMode};
pub use memory::{allocate_zone, Zone, ZoneKind};
pub use runtime::{Collaborators, LifecycleState, RunSummary, Runtime};

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// Honors `RUST_LOG`, defaulting to `info`. Calling it again is harmless.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        info!("LPM core v{}", env!("CARGO_PKG_VERSION"));
    }
}
