//! Cancellation and timeouts.
//!
//! Neither is built into tasks. A cancellable task races its body against a
//! [`CancellationToken`]; a timeout races a task against a timer and drops
//! the loser.

use std::pin::pin;
use std::time::Duration;

use futures::future::{self, Either};
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::executor::Executor;
use crate::task::Task;

impl Executor {
    /// Create a task that finishes with [`TaskError::Cancelled`] once
    /// `token` is cancelled.
    ///
    /// The token is checked before the body first runs and every time the
    /// task is resumed. Cancelling from another thread wakes a suspended
    /// task. The body is dropped on cancellation, destroying any tasks it
    /// was awaiting.
    pub fn create_cancellable<F, T, E>(&self, token: CancellationToken, body: F) -> Task<T>
    where
        F: Future<Output = Result<T, E>> + 'static,
        T: 'static,
        E: Into<TaskError>,
    {
        self.create(async move {
            if token.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            let cancelled = pin!(token.cancelled());
            let body = pin!(body);
            match future::select(cancelled, body).await {
                Either::Left(((), _)) => {
                    tracing::debug!("Task cancelled");
                    Err(TaskError::Cancelled)
                }
                Either::Right((outcome, _)) => outcome.map_err(Into::into),
            }
        })
    }
}

/// Await `task` unless `timer` finishes first.
///
/// On timeout the task handle is dropped, destroying the task, and
/// [`TaskError::TimedOut`] reports `limit`. If the timer itself fails the
/// task is awaited without a limit.
pub async fn timeout<T, S>(task: Task<T>, limit: Duration, timer: S) -> Result<T, TaskError>
where
    S: Future<Output = Result<(), TaskError>>,
{
    let timer = pin!(timer);
    match future::select(task, timer).await {
        Either::Left((outcome, _)) => outcome,
        Either::Right((Ok(()), task)) => {
            tracing::debug!(task = %task.id(), ?limit, "Task timed out");
            drop(task);
            Err(TaskError::TimedOut(limit))
        }
        Either::Right((Err(err), task)) => {
            tracing::warn!(error = %err, "Timer failed, waiting for task without a limit");
            task.await
        }
    }
}
