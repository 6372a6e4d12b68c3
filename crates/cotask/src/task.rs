//! Task handles: single-owner references to one asynchronous computation.

use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::continuation::{Completion, Continuation};
use crate::error::TaskError;
use crate::executor::Core;
use crate::executor::waker::Header;

/// Stable identifier of a task within its executor. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Task lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Created but never polled.
    Created = 0,
    /// Currently being polled by its executor.
    Running = 1,
    /// Waiting for a continuation to be resumed.
    Suspended = 2,
    /// Outcome stored. Terminal.
    Completed = 3,
    /// Torn down before completing. Terminal.
    Destroyed = 4,
}

impl TaskState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Suspended,
            3 => Self::Completed,
            _ => Self::Destroyed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Destroyed)
    }
}

/// Handle to one asynchronous computation owned by an [`Executor`].
///
/// Awaiting the handle yields the body's value or re-raises its failure.
/// Awaiting consumes the handle, so a task has at most one awaiter.
///
/// Dropping the handle of an unfinished task destroys it: its body is
/// dropped right away and never resumed. Use [`Task::detach`] to let it run
/// to completion unobserved instead.
///
/// [`Executor`]: crate::Executor
#[must_use = "dropping an unfinished task destroys it"]
pub struct Task<T> {
    header: Arc<Header>,
    completion: Arc<Completion<T>>,
    core: Weak<Core>,
    detached: bool,
}

impl<T> Task<T> {
    pub(crate) fn new(
        header: Arc<Header>,
        completion: Arc<Completion<T>>,
        core: Weak<Core>,
    ) -> Self {
        Self {
            header,
            completion,
            core,
            detached: false,
        }
    }

    pub fn id(&self) -> TaskId {
        self.header.id()
    }

    pub fn state(&self) -> TaskState {
        self.header.state()
    }

    /// True once the outcome is stored; awaiting will not suspend.
    pub fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }

    /// Hand the task to its executor and forget the handle.
    ///
    /// The task is started if it has not been, runs to completion, and any
    /// failure is reported as unhandled.
    pub fn detach(mut self) {
        self.detached = true;
        let Some(core) = self.core.upgrade() else {
            return;
        };
        // The record is gone once the task finishes, so count it here.
        if self.completion.is_finished() {
            if self.completion.has_unobserved_failure() {
                tracing::warn!(
                    task = %self.header.id(),
                    "Detached task failed with nobody to observe it"
                );
                core.note_unhandled();
            }
            return;
        }
        core.detach(&self.header);
    }

    pub(crate) fn header(&self) -> &Arc<Header> {
        &self.header
    }

    pub(crate) fn belongs_to(&self, core: &Rc<Core>) -> bool {
        std::ptr::eq(self.core.as_ptr(), Rc::as_ptr(core))
    }

    fn take_outcome(&self) -> Result<T, TaskError> {
        match self.completion.take() {
            Ok(outcome) => outcome,
            Err(err) => panic!("{} polled after its result was taken: {err}", self.header.id()),
        }
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        // Fast path: already finished, no suspension.
        if this.completion.is_finished() {
            return Poll::Ready(this.take_outcome());
        }

        let Some(core) = this.core.upgrade() else {
            return Poll::Ready(Err(TaskError::Destroyed));
        };
        if this.header.state() == TaskState::Created {
            core.start(&this.header);
        }
        drop(core);

        if this.completion.attach(Continuation::capture(cx)) {
            tracing::trace!(task = %this.header.id(), "Awaiter suspended");
            Poll::Pending
        } else {
            Poll::Ready(this.take_outcome())
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let core = self.core.upgrade();
        if self.completion.is_finished() {
            if self.completion.has_unobserved_failure() {
                tracing::debug!(
                    task = %self.header.id(),
                    "Dropping failure of a task nobody awaited"
                );
                if let Some(core) = core {
                    core.note_unhandled();
                }
            }
            return;
        }
        if let Some(core) = core {
            core.destroy(self.header.id());
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.header.id())
            .field("state", &self.header.state())
            .finish()
    }
}
