//! The pluggable "assert a condition" collaborator.
//!
//! Every fatal condition (corrupted canary, mark past the cursor, bad
//! alignment) goes through an [`AssertHook`] before the operation returns
//! the matching [`MemError`]. With [`PanicHook`] the program stops there;
//! with [`LogHook`] the failure is logged and the caller gets the error.

use std::sync::Arc;

use crate::config::AssertMode;
use crate::error::MemError;
use crate::log::{LogEntry, LogLevel, SharedSink};

pub trait AssertHook: Send + Sync {
    /// Called with the outcome of a check. Only failures carry meaning.
    fn check(&self, condition: bool, message: &str);
}

pub type SharedHook = Arc<dyn AssertHook>;

/// Panics on failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct PanicHook;

impl AssertHook for PanicHook {
    fn check(&self, condition: bool, message: &str) {
        if !condition {
            panic!("assertion failed: {message}");
        }
    }
}

/// Logs failures at `Fatal` and lets execution continue.
pub struct LogHook {
    sink: SharedSink,
}

impl LogHook {
    #[must_use]
    pub fn new(sink: SharedSink) -> Self {
        Self { sink }
    }
}

impl AssertHook for LogHook {
    fn check(&self, condition: bool, message: &str) {
        if !condition {
            self.sink
                .log(&LogEntry::new(LogLevel::Fatal, "assert_failed", message));
        }
    }
}

/// Hook matching a configured [`AssertMode`].
#[must_use]
pub fn hook_for(mode: AssertMode, sink: SharedSink) -> SharedHook {
    match mode {
        AssertMode::Panic => Arc::new(PanicHook),
        AssertMode::Log => Arc::new(LogHook::new(sink)),
    }
}

/// Run `err` through the hook when `condition` is false.
pub(crate) fn ensure(hook: &dyn AssertHook, condition: bool, err: MemError) -> Result<(), MemError> {
    if condition {
        return Ok(());
    }
    hook.check(false, &err.to_string());
    Err(err)
}
