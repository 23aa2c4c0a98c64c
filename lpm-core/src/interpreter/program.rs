//! Loaded program: code labels and the hooks the runtime drives
//!
//! Compiled code is a table of labels. Each label is a native function that
//! runs against a [`Machine`] and returns the next code address to jump to,
//! so control transfer between labels is always a return to the dispatch
//! loop rather than a native jump.

use std::fmt;
use std::sync::Arc;

use super::CodeAddr;
use crate::engine::Machine;
use crate::error::{Result, RuntimeError};

/// Body of one code label.
pub type LabelFn = Arc<dyn Fn(&mut Machine<'_>) -> Result<CodeAddr> + Send + Sync>;

/// Hook that runs inside managed code (library initializer and finalizer).
pub type ManagedHook = Arc<dyn Fn(&mut Machine<'_>) -> Result<()> + Send + Sync>;

/// Hook that runs on the native side (module initialization).
pub type NativeHook = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

struct Label {
    name: String,
    code: Option<LabelFn>,
}

/// Immutable program image shared by every engine.
pub struct Program {
    labels: Vec<Label>,
    entry_point: Option<CodeAddr>,
    library_initializer: Option<ManagedHook>,
    library_finalizer: Option<ManagedHook>,
    module_initializer: Option<NativeHook>,
    io_initializer: Option<NativeHook>,
}

impl Program {
    pub fn builder() -> ProgramBuilder {
        ProgramBuilder::default()
    }

    /// The designated entry point, if one was supplied.
    pub fn entry_point(&self) -> Option<CodeAddr> {
        self.entry_point
    }

    pub fn library_initializer(&self) -> Option<&ManagedHook> {
        self.library_initializer.as_ref()
    }

    pub fn library_finalizer(&self) -> Option<&ManagedHook> {
        self.library_finalizer.as_ref()
    }

    pub fn module_initializer(&self) -> Option<NativeHook> {
        self.module_initializer.clone()
    }

    /// Sets up the standard streams; runs right after module init.
    pub fn io_initializer(&self) -> Option<&NativeHook> {
        self.io_initializer.as_ref()
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    fn slot(&self, addr: CodeAddr) -> Option<&Label> {
        addr.user_index().and_then(|i| self.labels.get(i))
    }

    /// Name and body of the label at `addr`.
    pub fn label(&self, addr: CodeAddr) -> Result<(&str, &LabelFn)> {
        match self.slot(addr) {
            Some(Label {
                name,
                code: Some(code),
            }) => Ok((name.as_str(), code)),
            _ => Err(RuntimeError::UnknownLabel(addr)),
        }
    }

    /// Human-readable name for diagnostics.
    pub fn label_name(&self, addr: CodeAddr) -> &str {
        match addr {
            CodeAddr::NOT_REACHED => "not_reached",
            CodeAddr::GLOBAL_SUCCESS => "global_success",
            CodeAddr::GLOBAL_FAIL => "global_fail",
            CodeAddr::DO_FAIL => "do_fail",
            _ => self.slot(addr).map_or("<unknown>", |l| l.name.as_str()),
        }
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field(
                "labels",
                &self.labels.iter().map(|l| &l.name).collect::<Vec<_>>(),
            )
            .field("entry_point", &self.entry_point)
            .field("library_initializer", &self.library_initializer.is_some())
            .field("library_finalizer", &self.library_finalizer.is_some())
            .field("module_initializer", &self.module_initializer.is_some())
            .field("io_initializer", &self.io_initializer.is_some())
            .finish()
    }
}

/// Assembles a [`Program`]. Labels can be declared before they are
/// defined so that code can refer to labels defined later.
#[derive(Default)]
pub struct ProgramBuilder {
    labels: Vec<Label>,
    entry_point: Option<CodeAddr>,
    library_initializer: Option<ManagedHook>,
    library_finalizer: Option<ManagedHook>,
    module_initializer: Option<NativeHook>,
    io_initializer: Option<NativeHook>,
}

impl ProgramBuilder {
    /// Reserve an address for a label defined later.
    pub fn declare(&mut self, name: impl Into<String>) -> CodeAddr {
        let addr = CodeAddr::from_user_index(self.labels.len());
        self.labels.push(Label {
            name: name.into(),
            code: None,
        });
        addr
    }

    /// Give a declared label its body.
    pub fn define<F>(&mut self, addr: CodeAddr, code: F) -> &mut Self
    where
        F: Fn(&mut Machine<'_>) -> Result<CodeAddr> + Send + Sync + 'static,
    {
        if let Some(label) = addr.user_index().and_then(|i| self.labels.get_mut(i)) {
            label.code = Some(Arc::new(code));
        }
        self
    }

    /// Declare and define a label in one step.
    pub fn label<F>(&mut self, name: impl Into<String>, code: F) -> CodeAddr
    where
        F: Fn(&mut Machine<'_>) -> Result<CodeAddr> + Send + Sync + 'static,
    {
        let addr = self.declare(name);
        self.define(addr, code);
        addr
    }

    pub fn entry_point(&mut self, addr: CodeAddr) -> &mut Self {
        self.entry_point = Some(addr);
        self
    }

    pub fn library_initializer<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&mut Machine<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.library_initializer = Some(Arc::new(hook));
        self
    }

    pub fn library_finalizer<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&mut Machine<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.library_finalizer = Some(Arc::new(hook));
        self
    }

    pub fn module_initializer<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.module_initializer = Some(Arc::new(hook));
        self
    }

    pub fn io_initializer<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.io_initializer = Some(Arc::new(hook));
        self
    }

    /// Finish the program. Every declared label must have been defined.
    ///
    /// A missing entry point is not an error here; the runtime rejects it
    /// at initialization.
    pub fn build(self) -> Result<Program> {
        if let Some(undefined) = self.labels.iter().find(|l| l.code.is_none()) {
            return Err(RuntimeError::BootstrapInvariant(format!(
                "label `{}` declared but never defined",
                undefined.name
            )));
        }
        if let Some(entry) = self.entry_point {
            if entry.user_index().map_or(true, |i| i >= self.labels.len()) {
                return Err(RuntimeError::UnknownLabel(entry));
            }
        }
        Ok(Program {
            labels: self.labels,
            entry_point: self.entry_point,
            library_initializer: self.library_initializer,
            library_finalizer: self.library_finalizer,
            module_initializer: self.module_initializer,
            io_initializer: self.io_initializer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_declared_labels() {
        let mut builder = Program::builder();
        let later = builder.declare("later");
        let first = builder.label("first", move |_| Ok(later));
        builder.define(later, |m| Ok(m.proceed()));
        builder.entry_point(first);
        let program = builder.build().unwrap();
        assert_eq!(program.label_count(), 2);
        assert_eq!(program.label(first).unwrap().0, "first");
        assert_eq!(program.label_name(later), "later");
    }

    #[test]
    fn test_undefined_label_rejected() {
        let mut builder = Program::builder();
        builder.declare("dangling");
        assert!(matches!(
            builder.build(),
            Err(RuntimeError::BootstrapInvariant(_))
        ));
    }

    #[test]
    fn test_reserved_addresses_are_not_labels() {
        let program = Program::builder().build().unwrap();
        assert!(program.entry_point().is_none());
        assert!(matches!(
            program.label(CodeAddr::GLOBAL_SUCCESS),
            Err(RuntimeError::UnknownLabel(_))
        ));
        assert_eq!(program.label_name(CodeAddr::GLOBAL_FAIL), "global_fail");
    }

    #[test]
    fn test_entry_point_must_exist() {
        let mut builder = Program::builder();
        builder.entry_point(CodeAddr::new(99));
        assert!(matches!(
            builder.build(),
            Err(RuntimeError::UnknownLabel(_))
        ));
    }
}
