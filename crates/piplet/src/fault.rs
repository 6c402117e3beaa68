//! Fault taxonomy and the first-error-wins monitor.
//!
//! Any participant (the driving task or either drain) may latch a fault; the
//! first one wins and every later `checkpoint` observes it. This is how an
//! asynchronous worker crash becomes a synchronous failure of the record
//! feed.

use std::sync::{Arc, OnceLock};

use thiserror::Error;

/// The one error surfaced for a failed task attempt.
///
/// Cloneable so the latched first error can be handed to every observer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The worker subprocess could not be started.
    #[error("failed to launch worker: {0}")]
    Launch(String),

    /// A record or result could not be delivered onward.
    #[error("write failed: {0}")]
    Write(String),

    /// Framing violated in either direction.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The worker signalled a fatal error or died abnormally.
    #[error("worker fault: {reason}")]
    Worker { reason: String, exit: Option<i32> },
}

impl TaskError {
    pub fn worker(reason: impl Into<String>, exit: Option<i32>) -> Self {
        Self::Worker {
            reason: reason.into(),
            exit,
        }
    }

    /// Worker exit code carried by the error, when known.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Self::Worker { exit, .. } => *exit,
            _ => None,
        }
    }
}

/// Shared single-assignment fault register.
///
/// `set` is an idempotent compare-and-set: only the first caller latches its
/// error. `checkpoint` is a cheap non-blocking read, called at the top of
/// every loop iteration and after every lifecycle transition.
#[derive(Debug, Clone, Default)]
pub struct FaultMonitor {
    first: Arc<OnceLock<TaskError>>,
}

impl FaultMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch `err` unless a fault is already held. Returns whether this call
    /// won the slot.
    pub fn set(&self, err: TaskError) -> bool {
        match self.first.set(err) {
            Ok(()) => true,
            Err(suppressed) => {
                tracing::debug!(suppressed = %suppressed, "fault already latched");
                false
            }
        }
    }

    pub fn is_set(&self) -> bool {
        self.first.get().is_some()
    }

    pub fn first(&self) -> Option<TaskError> {
        self.first.get().cloned()
    }

    /// Propagate the latched fault, if any.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        match self.first.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Latch `err` and return whichever error actually holds the slot.
    pub fn latch(&self, err: TaskError) -> TaskError {
        self.set(err.clone());
        self.first().unwrap_or(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let monitor = FaultMonitor::new();
        assert!(monitor.set(TaskError::Write("first".into())));
        assert!(!monitor.set(TaskError::Write("second".into())));
        assert_eq!(monitor.first(), Some(TaskError::Write("first".into())));
    }

    #[test]
    fn checkpoint_passes_until_set() {
        let monitor = FaultMonitor::new();
        assert!(monitor.checkpoint().is_ok());
        monitor.set(TaskError::MalformedFrame("bad prefix".into()));
        assert_eq!(
            monitor.checkpoint(),
            Err(TaskError::MalformedFrame("bad prefix".into()))
        );
        // Never cleared.
        assert!(monitor.checkpoint().is_err());
    }

    #[test]
    fn latch_returns_the_holding_error() {
        let monitor = FaultMonitor::new();
        monitor.set(TaskError::worker("marker", Some(1)));
        let held = monitor.latch(TaskError::Write("late pipe error".into()));
        assert_eq!(held, TaskError::worker("marker", Some(1)));
    }

    #[test]
    fn set_from_another_thread_is_visible() {
        let monitor = FaultMonitor::new();
        let remote = monitor.clone();
        std::thread::spawn(move || {
            remote.set(TaskError::worker("died", Some(137)));
        })
        .join()
        .unwrap();
        assert_eq!(monitor.checkpoint(), Err(TaskError::worker("died", Some(137))));
    }

    #[test]
    fn exit_status_only_on_worker_faults() {
        assert_eq!(TaskError::worker("x", Some(3)).exit_status(), Some(3));
        assert_eq!(TaskError::Write("x".into()).exit_status(), None);
    }
}
