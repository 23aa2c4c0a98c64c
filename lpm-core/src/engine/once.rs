//! One-shot initialization guard
//!
//! Module initialization of the loaded program must happen at most once per
//! process no matter how many code paths reach it. [`OnceHook`] wraps the
//! initializer together with a completion flag; concurrent callers are
//! serialized and every caller after the first successful one is a no-op.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use tracing::debug;

use crate::error::{Result, RuntimeError};
use crate::interpreter::NativeHook;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Pending,
    Running(ThreadId),
    Done,
}

pub struct OnceHook {
    name: &'static str,
    hook: Option<NativeHook>,
    progress: Mutex<Progress>,
    finished: Condvar,
}

/// Puts the hook back to pending if it unwinds mid-run.
struct RunningGuard<'a> {
    once: &'a OnceHook,
    armed: bool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.once.finish(false);
        }
    }
}

impl OnceHook {
    pub fn new(name: &'static str, hook: Option<NativeHook>) -> Self {
        Self {
            name,
            hook,
            progress: Mutex::new(Progress::Pending),
            finished: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().expect("once-hook lock poisoned")
    }

    fn finish(&self, completed: bool) {
        *self.lock() = if completed {
            Progress::Done
        } else {
            Progress::Pending
        };
        self.finished.notify_all();
    }

    /// Run the hook unless it already completed. Returns `true` if this
    /// call ran it.
    ///
    /// A failed run does not count as completion. Callers on other threads
    /// wait for a run in progress; a call made from inside the hook itself
    /// returns `Ok(false)` at once.
    pub fn run(&self) -> Result<bool> {
        let me = thread::current().id();
        let mut progress = self.lock();
        loop {
            match *progress {
                Progress::Done => {
                    debug!(hook = self.name, "Already initialized, skipping");
                    return Ok(false);
                }
                Progress::Running(owner) if owner == me => {
                    debug!(hook = self.name, "Re-entered while running, skipping");
                    return Ok(false);
                }
                Progress::Running(_) => {
                    progress = self
                        .finished
                        .wait(progress)
                        .expect("once-hook lock poisoned");
                }
                Progress::Pending => break,
            }
        }
        *progress = Progress::Running(me);
        drop(progress);

        let mut guard = RunningGuard {
            once: self,
            armed: true,
        };
        let outcome = match &self.hook {
            Some(hook) => {
                debug!(hook = self.name, "Running one-shot initializer");
                hook().map_err(|e| RuntimeError::hook(self.name, e))
            }
            None => Ok(()),
        };
        guard.armed = false;
        self.finish(outcome.is_ok());
        outcome.map(|()| true)
    }

    pub fn is_done(&self) -> bool {
        *self.lock() == Progress::Done
    }
}

impl fmt::Debug for OnceHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnceHook")
            .field("name", &self.name)
            .field("has_hook", &self.hook.is_some())
            .field("done", &self.is_done())
            .finish()
    }
}
