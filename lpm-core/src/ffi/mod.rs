//! FFI Bridge - host collaborators behind a C ABI
//!
//! A host embedding the runtime from C supplies its collaborator hooks as a
//! table of plain function pointers. This module adapts that table into the
//! collaborator traits the lifecycle consumes.
//!
//! # Design:
//! - `#[repr(C)]` table, null pointers mean "not provided"
//! - Integer result codes, no strings cross the boundary

use std::os::raw::c_int;
use tracing::debug;

use crate::error::Result;
use crate::interpreter::ProgramBuilder;
use crate::runtime::{Collaborators, GarbageCollector};

/// C-compatible result code
pub type FfiResult = c_int;

pub const FFI_SUCCESS: FfiResult = 0;
pub const FFI_ERROR: FfiResult = -1;

/// `fn(quiet) -> FfiResult`
pub type HostGcInitFn = extern "C" fn(quiet: c_int) -> FfiResult;

/// `fn(offset_bytes)`
pub type HostDisplacementFn = extern "C" fn(offset: usize);

/// `fn() -> FfiResult`
pub type HostInitFn = extern "C" fn() -> FfiResult;

/// Host hook table
///
/// This struct maps directly to the C layout:
///
/// ```c
/// struct lpm_host_hooks {
///     int  (*gc_init)(int quiet);
///     void (*gc_register_displacement)(size_t offset);
///     int  (*module_init)(void);
/// };
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct HostHooks {
    pub gc_init: Option<HostGcInitFn>,
    pub gc_register_displacement: Option<HostDisplacementFn>,
    pub module_init: Option<HostInitFn>,
}

fn check(hook: &'static str, code: FfiResult) -> anyhow::Result<()> {
    if code == FFI_SUCCESS {
        Ok(())
    } else {
        anyhow::bail!("host hook `{}` returned {}", hook, code)
    }
}

/// Garbage collector implemented by the host.
#[derive(Debug, Clone, Copy)]
pub struct HostGc {
    init: Option<HostGcInitFn>,
    register_displacement: Option<HostDisplacementFn>,
}

impl GarbageCollector for HostGc {
    fn init(&mut self, quiet: bool) -> anyhow::Result<()> {
        match self.init {
            Some(init) => check("gc_init", init(quiet as c_int)),
            None => Ok(()),
        }
    }

    fn register_displacement(&mut self, offset: usize) {
        if let Some(register) = self.register_displacement {
            register(offset);
        }
    }
}

impl HostHooks {
    pub fn gc(&self) -> HostGc {
        HostGc {
            init: self.gc_init,
            register_displacement: self.gc_register_displacement,
        }
    }

    /// Collaborators backed by this table; tracer and profiler are no-ops.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            gc: Box::new(self.gc()),
            ..Collaborators::default()
        }
    }

    /// Register the host's module initializer with a program.
    pub fn install_module_initializer(&self, builder: &mut ProgramBuilder) {
        if let Some(init) = self.module_init {
            debug!("Installing host module initializer");
            builder.module_initializer(move || check("module_init", init()));
        }
    }
}

/// Map a runtime result onto a C result code.
pub fn result_code<T>(result: &Result<T>) -> FfiResult {
    match result {
        Ok(_) => FFI_SUCCESS,
        Err(_) => FFI_ERROR,
    }
}
