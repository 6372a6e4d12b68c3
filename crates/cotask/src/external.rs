//! Wrapping callback-style operations, and the worker pool that runs
//! blocking work and timers off the executor thread.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::continuation::{Completion, Continuation};
use crate::error::TaskError;
use crate::task::Task;

/// One-shot callback handed to an external operation.
///
/// Invoke [`resume`](Self::resume) exactly once, from any thread. Dropping
/// it without resuming completes the operation with
/// [`TaskError::Abandoned`].
#[must_use = "dropping a resumer abandons the operation"]
pub struct Resumer<T> {
    completion: Option<Arc<Completion<T>>>,
}

impl<T> Resumer<T> {
    pub fn resume(mut self, outcome: Result<T, TaskError>) {
        if let Some(completion) = self.completion.take() {
            deliver(&completion, outcome);
        }
    }
}

impl<T> Drop for Resumer<T> {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            tracing::debug!("Resumer dropped without an outcome");
            deliver(&completion, Err(TaskError::Abandoned));
        }
    }
}

fn deliver<T>(completion: &Completion<T>, outcome: Result<T, TaskError>) {
    if let Err(err) = completion.fill(outcome) {
        tracing::error!(error = %err, "External operation completed twice");
        return;
    }
    match completion.publish() {
        Ok(Some(continuation)) => {
            if let Err(err) = continuation.resume() {
                tracing::error!(error = %err, "Could not resume awaiter of external operation");
            }
        }
        Ok(None) => {}
        Err(err) => tracing::error!(error = %err, "External operation published twice"),
    }
}

/// Awaitable for a callback-style operation; see [`external`].
#[must_use = "futures do nothing unless awaited"]
pub struct External<T, F> {
    start: Option<F>,
    completion: Arc<Completion<T>>,
}

// `start` is never pinned.
impl<T, F> Unpin for External<T, F> {}

/// Wrap an operation that reports back through a callback.
///
/// `start` runs on the first poll and receives the [`Resumer`] to invoke
/// when the operation finishes. If it resumes before returning, the awaiter
/// continues without suspending.
pub fn external<T, F>(start: F) -> External<T, F>
where
    F: FnOnce(Resumer<T>),
{
    External {
        start: Some(start),
        completion: Arc::new(Completion::new()),
    }
}

impl<T, F> External<T, F> {
    fn take_outcome(&self) -> Result<T, TaskError> {
        match self.completion.take() {
            Ok(outcome) => outcome,
            Err(err) => panic!("external operation polled after completion: {err}"),
        }
    }
}

impl<T, F> Future for External<T, F>
where
    F: FnOnce(Resumer<T>),
{
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(start) = this.start.take() {
            start(Resumer {
                completion: Some(Arc::clone(&this.completion)),
            });
        }
        if this.completion.is_finished() {
            return Poll::Ready(this.take_outcome());
        }
        if this.completion.attach(Continuation::capture(cx)) {
            Poll::Pending
        } else {
            Poll::Ready(this.take_outcome())
        }
    }
}

impl<T, F> Drop for External<T, F> {
    fn drop(&mut self) {
        self.completion.detach();
    }
}

/// Caller-owned pool of worker threads for blocking calls and timers.
///
/// Completions hop back to the executor through its ready queue, so tasks
/// still only run on the executor's thread. Dropping the pool stops its
/// threads without waiting; pending operations are abandoned.
pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl WorkerPool {
    pub fn new(threads: usize) -> std::io::Result<Self> {
        let threads = threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("cotask-worker")
            .enable_time()
            .build()?;
        tracing::debug!(threads, "Worker pool started");
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `f` on a blocking worker thread.
    pub fn offload<T, F>(
        &self,
        f: F,
    ) -> impl Future<Output = Result<T, TaskError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        let handle = self.handle.clone();
        external(move |resumer: Resumer<T>| {
            handle.spawn_blocking(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(f))
                    .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));
                resumer.resume(outcome);
            });
        })
    }

    /// Complete after `duration`.
    pub fn sleep(
        &self,
        duration: Duration,
    ) -> impl Future<Output = Result<(), TaskError>> + Send + 'static {
        let handle = self.handle.clone();
        external(move |resumer: Resumer<()>| {
            handle.spawn(async move {
                tokio::time::sleep(duration).await;
                resumer.resume(Ok(()));
            });
        })
    }

    pub fn read_to_string(
        &self,
        path: impl Into<PathBuf>,
    ) -> impl Future<Output = Result<String, TaskError>> + Send + 'static {
        let path = path.into();
        self.offload(move || std::fs::read_to_string(&path).map_err(TaskError::from))
    }

    /// Await `task`, giving up after `limit`.
    pub async fn timeout<T>(&self, limit: Duration, task: Task<T>) -> Result<T, TaskError> {
        crate::cancel::timeout(task, limit, self.sleep(limit)).await
    }

    /// Stop the pool, waiting up to `timeout` for running work.
    pub fn shutdown(mut self, timeout: Duration) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(timeout);
            tracing::debug!("Worker pool shut down");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("running", &self.runtime.is_some())
            .finish()
    }
}
