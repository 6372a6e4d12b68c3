//! Request coalescing: many awaiting tasks, one bulk call.
//!
//! Each [`Batcher::request`] appends its input to the open batch and gets
//! back the index it will read its output from. When the batch is sealed
//! (the predicate holds on an awaiter's first poll, or someone calls
//! [`Batcher::maybe_execute`] with `force`), the bulk operation runs once
//! over all inputs and every waiting task is resumed with its own output.

use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use serde::Serialize;

use crate::continuation::{Completion, Continuation, lock};
use crate::error::{BoxError, TaskError, panic_message};

type BulkOp<A, B> = dyn Fn(Vec<A>) -> Result<Vec<B>, BoxError> + Send + Sync;
type Predicate<A> = dyn Fn(&[A]) -> bool + Send + Sync;

/// Why a sealed batch produced no outputs. Every entry of the batch
/// receives it wrapped in [`TaskError::BatchOperation`].
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("bulk operation returned {actual} outputs for {expected} inputs")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("bulk operation panicked: {0}")]
    Panicked(String),

    #[error("batch predicate panicked: {0}")]
    PredicatePanicked(String),

    #[error(transparent)]
    Operation(BoxError),
}

/// Counters for one batcher and its clones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub sealed_batches: u64,
    pub resolved_entries: u64,
    pub failed_batches: u64,
}

#[derive(Default)]
struct Counters {
    sealed: AtomicU64,
    resolved: AtomicU64,
    failed: AtomicU64,
}

/// The open batch. Inputs and entries stay index-aligned.
struct Batch<A, B> {
    inputs: Vec<A>,
    entries: Vec<Arc<Completion<B>>>,
}

impl<A, B> Default for Batch<A, B> {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            entries: Vec::new(),
        }
    }
}

/// Coalesces requests into calls of a bulk operation.
///
/// Clones share the open batch. Safe to use from several threads; the
/// index of each request is fixed under the batch lock at request time.
pub struct Batcher<A, B> {
    op: Arc<BulkOp<A, B>>,
    predicate: Option<Arc<Predicate<A>>>,
    open: Arc<Mutex<Batch<A, B>>>,
    counters: Arc<Counters>,
}

impl<A, B> Clone for Batcher<A, B> {
    fn clone(&self) -> Self {
        Self {
            op: Arc::clone(&self.op),
            predicate: self.predicate.clone(),
            open: Arc::clone(&self.open),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<A: 'static, B: 'static> Batcher<A, B> {
    /// `op` must return exactly one output per input, in input order.
    pub fn new<F, E>(op: F) -> Self
    where
        F: Fn(Vec<A>) -> Result<Vec<B>, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self {
            op: Arc::new(move |inputs| op(inputs).map_err(Into::into)),
            predicate: None,
            open: Arc::new(Mutex::new(Batch::default())),
            counters: Arc::default(),
        }
    }

    /// Batcher over an operation that cannot fail.
    pub fn from_fn<F>(op: F) -> Self
    where
        F: Fn(Vec<A>) -> Vec<B> + Send + Sync + 'static,
    {
        Self::new(move |inputs| Ok::<_, BoxError>(op(inputs)))
    }

    /// Seal automatically once `predicate` holds over the open inputs.
    ///
    /// Without a predicate batches are only sealed by a forced
    /// [`maybe_execute`](Self::maybe_execute).
    ///
    /// The predicate runs under the batch lock and must not call back into
    /// the batcher. If it panics the open batch is sealed and every entry
    /// fails with [`BatchError::PredicatePanicked`].
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&[A]) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Add `arg` to the open batch.
    ///
    /// The returned request resolves to the output at this input's index.
    /// Nothing is evaluated until it is first polled.
    pub fn request(&self, arg: A) -> BatchRequest<A, B> {
        let completion = Arc::new(Completion::new());
        let index = {
            let mut open = lock(&self.open);
            open.inputs.push(arg);
            open.entries.push(Arc::clone(&completion));
            open.inputs.len() - 1
        };
        tracing::trace!(index, "Batch request queued");
        BatchRequest {
            batcher: self.clone(),
            completion,
            index,
            checked: false,
        }
    }

    /// Number of inputs in the open batch.
    pub fn pending(&self) -> usize {
        lock(&self.open).inputs.len()
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            sealed_batches: self.counters.sealed.load(Ordering::Relaxed),
            resolved_entries: self.counters.resolved.load(Ordering::Relaxed),
            failed_batches: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Seal and run the open batch if `force` is set or the predicate holds.
    ///
    /// Returns true if a batch was sealed and its waiters resumed. An empty
    /// batch is never sealed.
    pub fn maybe_execute(&self, force: bool) -> bool {
        let (sealed, rejected) = {
            let mut open = lock(&self.open);
            if open.inputs.is_empty() {
                return false;
            }
            let verdict = match &self.predicate {
                _ if force => Ok(true),
                None => Ok(false),
                Some(predicate) => {
                    panic::catch_unwind(AssertUnwindSafe(|| predicate(&open.inputs))).map_err(
                        |payload| BatchError::PredicatePanicked(panic_message(payload.as_ref())),
                    )
                }
            };
            match verdict {
                Ok(false) => return false,
                Ok(true) => (std::mem::take(&mut *open), None),
                Err(err) => (std::mem::take(&mut *open), Some(err)),
            }
        };

        let Batch { inputs, entries } = sealed;
        let expected = inputs.len();
        tracing::debug!(entries = expected, force, "Sealing batch");

        let result = match rejected {
            Some(err) => Err(err),
            None => match panic::catch_unwind(AssertUnwindSafe(|| (self.op)(inputs))) {
                Ok(Ok(outputs)) if outputs.len() == expected => Ok(outputs),
                Ok(Ok(outputs)) => Err(BatchError::LengthMismatch {
                    expected,
                    actual: outputs.len(),
                }),
                Ok(Err(err)) => Err(BatchError::Operation(err)),
                Err(payload) => Err(BatchError::Panicked(panic_message(payload.as_ref()))),
            },
        };

        self.counters.sealed.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(outputs) => {
                for (entry, output) in entries.iter().zip(outputs) {
                    if let Err(err) = entry.fill(Ok(output)) {
                        tracing::error!(error = %err, "Batch entry already resolved");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, entries = expected, "Batch operation failed");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let failure = TaskError::batch(err);
                for entry in &entries {
                    if let Err(err) = entry.fill(Err(failure.clone())) {
                        tracing::error!(error = %err, "Batch entry already resolved");
                    }
                }
            }
        }
        self.counters
            .resolved
            .fetch_add(expected as u64, Ordering::Relaxed);

        let continuations: Vec<Continuation> = entries
            .iter()
            .filter_map(|entry| match entry.publish() {
                Ok(continuation) => continuation,
                Err(err) => {
                    tracing::error!(error = %err, "Batch entry published twice");
                    None
                }
            })
            .collect();
        let resumed = Continuation::resume_all(continuations);
        tracing::trace!(resumed, "Batch waiters resumed");
        true
    }
}

impl<A, B> std::fmt::Debug for Batcher<A, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher")
            .field("pending", &lock(&self.open).inputs.len())
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

/// A pending batched call, resolved when its batch is sealed.
#[must_use = "futures do nothing unless awaited"]
pub struct BatchRequest<A, B> {
    batcher: Batcher<A, B>,
    completion: Arc<Completion<B>>,
    index: usize,
    checked: bool,
}

impl<A, B> BatchRequest<A, B> {
    /// Position of this request's input within its batch.
    pub fn index(&self) -> usize {
        self.index
    }

    fn take_outcome(&self) -> Result<B, TaskError> {
        match self.completion.take() {
            Ok(outcome) => outcome,
            Err(err) => panic!("batch request {} polled after completion: {err}", self.index),
        }
    }
}

impl<A: 'static, B: 'static> Future for BatchRequest<A, B> {
    type Output = Result<B, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.checked {
            this.checked = true;
            this.batcher.maybe_execute(false);
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

impl<A, B> Drop for BatchRequest<A, B> {
    fn drop(&mut self) {
        self.completion.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Executor, Task, sync_wait};
    use std::sync::atomic::AtomicUsize;

    fn doubler() -> Batcher<u32, u32> {
        Batcher::from_fn(|inputs: Vec<u32>| inputs.into_iter().map(|x| x * 2).collect())
    }

    fn spawn_requests(
        executor: &Executor,
        batcher: &Batcher<u32, u32>,
        inputs: &[u32],
    ) -> Vec<Task<u32>> {
        inputs
            .iter()
            .map(|&x| {
                let request = batcher.request(x);
                executor.spawn(request)
            })
            .collect()
    }

    #[test]
    fn forced_seal_resolves_each_entry_by_index() {
        let executor = Executor::default();
        let batcher = doubler();
        let tasks = spawn_requests(&executor, &batcher, &[5, 1, 9]);

        executor.run_available();
        assert_eq!(batcher.pending(), 3);
        assert!(tasks.iter().all(|t| !t.is_finished()));

        assert!(batcher.maybe_execute(true));
        executor.run_available();

        let outputs: Vec<u32> = tasks
            .into_iter()
            .map(|t| sync_wait(&executor, t).unwrap())
            .collect();
        assert_eq!(outputs, vec![10, 2, 18]);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn full_batch_seals_on_first_poll() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let executor = Executor::default();
        let batcher = Batcher::from_fn(move |inputs: Vec<u32>| {
            seen.fetch_add(1, Ordering::SeqCst);
            inputs.iter().map(|x| x + 100).collect::<Vec<_>>()
        })
        .with_predicate(|inputs| inputs.len() >= 7);

        let tasks = spawn_requests(&executor, &batcher, &[0, 1, 2, 3, 4, 5, 6]);
        executor.run_available();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tasks.iter().all(Task::is_finished));
        let outputs: Vec<u32> = tasks
            .into_iter()
            .map(|t| sync_wait(&executor, t).unwrap())
            .collect();
        assert_eq!(outputs, (100..107).collect::<Vec<_>>());
    }

    #[test]
    fn empty_batch_is_never_sealed() {
        let batcher = doubler();
        assert!(!batcher.maybe_execute(true));
        assert!(!batcher.maybe_execute(true));
        assert_eq!(batcher.stats(), BatchStats::default());
    }

    #[test]
    fn predicate_false_leaves_batch_open() {
        let batcher = doubler().with_predicate(|inputs| inputs.len() >= 2);
        let _first = batcher.request(1);
        assert!(!batcher.maybe_execute(false));
        assert_eq!(batcher.pending(), 1);
    }

    #[test]
    fn operation_failure_fans_out() {
        let executor = Executor::default();
        let batcher: Batcher<u32, u32> =
            Batcher::new(|_inputs: Vec<u32>| Err("backend unavailable"));
        let tasks = spawn_requests(&executor, &batcher, &[1, 2]);
        executor.run_available();
        assert!(batcher.maybe_execute(true));

        for task in tasks {
            let err = sync_wait(&executor, task).unwrap_err();
            assert!(matches!(err, TaskError::BatchOperation(_)));
            assert_eq!(err.to_string(), "batch operation failed: backend unavailable");
        }
        assert_eq!(batcher.stats().failed_batches, 1);
    }

    #[test]
    fn short_output_is_a_length_mismatch() {
        let executor = Executor::default();
        let batcher: Batcher<u32, u32> = Batcher::from_fn(|_inputs: Vec<u32>| vec![1]);
        let tasks = spawn_requests(&executor, &batcher, &[1, 2, 3]);
        executor.run_available();
        batcher.maybe_execute(true);

        let err = sync_wait(&executor, tasks.into_iter().next().unwrap()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "batch operation failed: bulk operation returned 1 outputs for 3 inputs"
        );
    }

    #[test]
    fn panicking_operation_fans_out() {
        let executor = Executor::default();
        let batcher: Batcher<u32, u32> = Batcher::from_fn(|_inputs: Vec<u32>| panic!("kaboom"));
        let tasks = spawn_requests(&executor, &batcher, &[1]);
        executor.run_available();
        batcher.maybe_execute(true);

        let err = sync_wait(&executor, tasks.into_iter().next().unwrap()).unwrap_err();
        assert_eq!(err.to_string(), "batch operation failed: bulk operation panicked: kaboom");
    }

    #[test]
    fn panicking_predicate_fails_the_open_batch() {
        let executor = Executor::default();
        let batcher = doubler().with_predicate(|_inputs| panic!("bad predicate"));
        let tasks = spawn_requests(&executor, &batcher, &[1, 2]);
        executor.run_available();

        assert_eq!(batcher.pending(), 0);
        assert!(tasks.iter().all(Task::is_finished));
        for task in tasks {
            let err = sync_wait(&executor, task).unwrap_err();
            assert_eq!(
                err.to_string(),
                "batch operation failed: batch predicate panicked: bad predicate"
            );
        }
        assert_eq!(batcher.stats().failed_batches, 1);

        // The batcher stays usable after the failure.
        assert_eq!(batcher.request(3).index(), 0);
    }

    #[test]
    fn stats_snapshot() {
        let executor = Executor::default();
        let batcher = doubler();
        let first = spawn_requests(&executor, &batcher, &[1, 2]);
        executor.run_available();
        batcher.maybe_execute(true);
        let second = spawn_requests(&executor, &batcher, &[3]);
        executor.run_available();
        batcher.maybe_execute(true);
        executor.run_available();
        drop((first, second));

        insta::assert_json_snapshot!(batcher.stats(), @r#"
        {
          "sealed_batches": 2,
          "resolved_entries": 3,
          "failed_batches": 0
        }
        "#);
    }

    #[test]
    fn requests_from_many_threads_keep_their_index() {
        let batcher = doubler();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let batcher = batcher.clone();
                std::thread::spawn(move || {
                    (0..50u32)
                        .map(|i| {
                            let request = batcher.request(i);
                            (request.index(), i, request)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let requests: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(batcher.pending(), 400);
        assert!(batcher.maybe_execute(true));

        for (_, input, request) in requests {
            let output = futures::executor::block_on(request).unwrap();
            assert_eq!(output, input * 2);
        }
    }
}
