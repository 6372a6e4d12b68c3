//! Error types: task failures stored in result slots, and runtime misuse.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::task::TaskId;

/// Boxed error accepted from user code (bodies, bulk operations).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A failure shared by every party that observes it.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Failure stored in a result slot and surfaced when the task is awaited.
///
/// Cloneable so one batch failure can be handed to every waiting entry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// The body returned an error.
    #[error("computation failed: {0}")]
    Computation(#[source] SharedError),

    /// The body panicked while being polled.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The bulk operation behind a batched request failed.
    #[error("batch operation failed: {0}")]
    BatchOperation(#[source] SharedError),

    #[error("task was cancelled")]
    Cancelled,

    #[error("task timed out after {0:?}")]
    TimedOut(Duration),

    /// An external operation dropped its resumer without completing.
    #[error("operation dropped its resumer without completing")]
    Abandoned,

    /// The task was torn down (or its executor dropped) before completing.
    #[error("task was destroyed before completing")]
    Destroyed,

    /// Nothing could make progress within the configured stall timeout.
    #[error("no progress after waiting {0:?}")]
    Stalled(Duration),
}

impl TaskError {
    pub fn computation(err: impl Into<BoxError>) -> Self {
        Self::Computation(Arc::from(err.into()))
    }

    pub fn batch(err: impl Into<BoxError>) -> Self {
        Self::BatchOperation(Arc::from(err.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Convert a caught panic payload into a failure.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked(panic_message(payload.as_ref()))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl From<anyhow::Error> for TaskError {
    /// A `TaskError` that travelled inside an `anyhow::Error` comes back out
    /// unchanged; anything else becomes a computation failure.
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<TaskError>() {
            Ok(task_err) => task_err,
            Err(err) => Self::Computation(Arc::from(BoxError::from(err))),
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        Self::computation(err)
    }
}

/// Misuse of a result slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("result slot already filled")]
    AlreadyFilled,

    #[error("result slot is still empty")]
    Empty,

    #[error("result already taken from slot")]
    Consumed,
}

/// Programming errors detected by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("task {0} resumed after it completed")]
    ResumeAfterCompletion(TaskId),

    #[error("task {0} resumed after it was destroyed")]
    ResumeAfterDestroy(TaskId),

    #[error("completion published twice")]
    DoubleCompletion,

    #[error("executor was dropped")]
    ExecutorGone,

    #[error(transparent)]
    Slot(#[from] SlotError),
}
