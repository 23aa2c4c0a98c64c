//! Error taxonomy for the execution core
//!
//! Every fault detected by the core is either process-fatal or propagated
//! to the lifecycle caller. Nothing in here is retried locally.

use std::path::PathBuf;
use thiserror::Error;

use crate::interpreter::CodeAddr;
use crate::memory::ZoneKind;
use crate::runtime::LifecycleState;

/// Crate-wide result type
pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

/// A malformed option string or configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unrecognized option `-{0}`")]
    UnknownOption(char),

    #[error("option `-{0}` requires an argument")]
    MissingArgument(char),

    #[error("invalid value `{value}` for option `-{option}`")]
    InvalidValue { option: char, value: String },

    #[error("unterminated quoted string in option string")]
    UnterminatedQuote,

    #[error("unexpected operand `{0}` in option string")]
    UnexpectedOperand(String),

    #[error("failed to read configuration file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration file {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Faults raised while booting, running or terminating the machine.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("cannot allocate {requested} bytes for zone `{zone}`")]
    Resource { zone: ZoneKind, requested: usize },

    #[error("zone `{zone}` overflow: word {index} lies in the redzone")]
    ZoneOverflow { zone: ZoneKind, index: usize },

    #[error("zone `{zone}` underflow at word {index}")]
    ZoneUnderflow { zone: ZoneKind, index: usize },

    #[error("bootstrap invariant violated: {0}")]
    BootstrapInvariant(String),

    #[error("cannot {operation} while the runtime is {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("no general register r{0}, valid registers are r1..=r{max}", max = crate::engine::NUM_GENERAL_REGS)]
    InvalidRegister(usize),

    #[error("jump to unknown code address {0}")]
    UnknownLabel(CodeAddr),

    #[error("collaborator hook `{hook}` failed")]
    Hook {
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("engine {slot} terminated abnormally")]
    EnginePanicked { slot: usize },
}

impl RuntimeError {
    /// Wrap a collaborator failure.
    pub fn hook(hook: &'static str, source: anyhow::Error) -> Self {
        Self::Hook { hook, source }
    }

    /// Whether the process must not continue after this fault.
    ///
    /// Propagated collaborator failures and lifecycle misuse are handed back
    /// to the caller; everything else means machine state can no longer be
    /// trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Hook { .. } | Self::InvalidState { .. })
    }

    /// Process exit status to report for this fault.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let overflow = RuntimeError::ZoneOverflow {
            zone: ZoneKind::DetStack,
            index: 12,
        };
        assert!(overflow.is_fatal());
        assert!(RuntimeError::BootstrapInvariant("x".into()).is_fatal());
        assert!(RuntimeError::from(ConfigError::UnknownOption('q')).is_fatal());

        let hook = RuntimeError::hook("library finalizer", anyhow::anyhow!("boom"));
        assert!(!hook.is_fatal());
        assert_ne!(hook.exit_code(), 0);
    }

    #[test]
    fn test_messages_name_the_zone() {
        let err = RuntimeError::ZoneOverflow {
            zone: ZoneKind::NondetStack,
            index: 7,
        };
        assert!(err.to_string().contains("nondetstack"));
    }

    #[test]
    fn test_invalid_register_is_fatal() {
        let err = RuntimeError::InvalidRegister(0);
        assert!(err.is_fatal());
        assert!(err.to_string().contains("r0"));
    }
}
