//! Continuations and the completion handshake between a producer and the
//! single party awaiting it.
//!
//! The handshake is a tri-state flag:
//! - `STARTED`: no outcome yet, nobody waiting
//! - `ATTACHED`: no outcome yet, a continuation is registered
//! - `FINISHED`: outcome stored; terminal
//!
//! The producer swaps to `FINISHED` and resumes the continuation only if it
//! saw `ATTACHED`. The awaiter stores its continuation first and then tries
//! `STARTED -> ATTACHED`; if that fails because the producer already
//! finished, it reads the outcome without suspending. Either way the
//! continuation runs at most once and never before it is registered.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Waker};

use crate::error::{RuntimeError, SlotError, TaskError};
use crate::executor::queue::{Handoff, ReadyQueue};
use crate::executor::waker::{self, Header};
use crate::slot::ResultSlot;
use crate::task::TaskId;

const STARTED: u8 = 0;
const ATTACHED: u8 = 1;
const FINISHED: u8 = 2;

/// Lock a std mutex, recovering from poisoning. Every critical section in
/// this crate leaves the protected state consistent before it can panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An opaque resumption point: "what to run next" once an awaited
/// operation finishes.
///
/// Consumed by [`Continuation::resume`], so a single continuation can never
/// be resumed twice.
pub struct Continuation {
    kind: Kind,
}

enum Kind {
    /// A task owned by one of our executors.
    Local(Arc<Header>),
    /// Whatever drives a future we don't own (another executor, a combinator).
    Foreign(Waker),
}

impl Continuation {
    /// Capture the continuation of whoever is polling with `cx`.
    pub fn capture(cx: &Context<'_>) -> Self {
        let kind = match waker::current_for(cx.waker()) {
            Some(header) => Kind::Local(header),
            None => Kind::Foreign(cx.waker().clone()),
        };
        Self { kind }
    }

    /// Id of the task this continuation resumes, if it belongs to an executor
    /// from this crate.
    pub fn task_id(&self) -> Option<TaskId> {
        match &self.kind {
            Kind::Local(header) => Some(header.id()),
            Kind::Foreign(_) => None,
        }
    }

    /// Submit the continuation to the back of its executor's ready queue.
    ///
    /// Fails if the task it would resume has already completed or been
    /// destroyed.
    pub fn resume(self) -> Result<(), RuntimeError> {
        self.resume_with(Handoff::Back)
    }

    pub(crate) fn resume_with(self, handoff: Handoff) -> Result<(), RuntimeError> {
        match self.kind {
            Kind::Local(header) => header.schedule(handoff),
            Kind::Foreign(waker) => {
                waker.wake();
                Ok(())
            }
        }
    }

    /// Resume several continuations, submitting those that share an executor
    /// in a single enqueue call so they run in the given order.
    pub fn resume_all(continuations: impl IntoIterator<Item = Continuation>) -> usize {
        let mut groups: Vec<(Arc<ReadyQueue>, Vec<Arc<Header>>)> = Vec::new();
        let mut resumed = 0;

        for continuation in continuations {
            match continuation.kind {
                Kind::Local(header) => match header.check_resumable() {
                    Ok(()) => {
                        let queue = header.queue();
                        match groups.iter_mut().find(|(q, _)| Arc::ptr_eq(q, queue)) {
                            Some((_, headers)) => headers.push(header),
                            None => groups.push((Arc::clone(queue), vec![header])),
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "Refusing to resume finished task");
                    }
                },
                Kind::Foreign(waker) => {
                    waker.wake();
                    resumed += 1;
                }
            }
        }

        for (queue, headers) in groups {
            resumed += queue.push_batch(headers);
        }
        resumed
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Local(header) => f
                .debug_tuple("Continuation::Local")
                .field(&header.id())
                .finish(),
            Kind::Foreign(_) => f.write_str("Continuation::Foreign"),
        }
    }
}

/// Outcome cell shared by one producer and one awaiter.
///
/// The producer fills the slot, then publishes; the awaiter attaches a
/// continuation, then reads the slot once published.
pub(crate) struct Completion<T> {
    state: AtomicU8,
    slot: Mutex<ResultSlot<T>>,
    continuation: Mutex<Option<Continuation>>,
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STARTED),
            slot: Mutex::new(ResultSlot::new()),
            continuation: Mutex::new(None),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) == FINISHED
    }

    /// Store the outcome without publishing it.
    pub fn fill(&self, outcome: Result<T, TaskError>) -> Result<(), SlotError> {
        lock(&self.slot).fill(outcome)
    }

    /// Mark the outcome visible. Returns the continuation that must now be
    /// resumed, if the awaiter had already suspended.
    pub fn publish(&self) -> Result<Option<Continuation>, RuntimeError> {
        match self.state.swap(FINISHED, Ordering::AcqRel) {
            ATTACHED => Ok(lock(&self.continuation).take()),
            STARTED => Ok(None),
            _ => Err(RuntimeError::DoubleCompletion),
        }
    }

    /// Register the awaiter's continuation.
    ///
    /// Returns true if the awaiter must suspend. Returns false if the outcome
    /// was published first; the awaiter then reads it immediately.
    pub fn attach(&self, continuation: Continuation) -> bool {
        *lock(&self.continuation) = Some(continuation);
        match self
            .state
            .compare_exchange(STARTED, ATTACHED, Ordering::AcqRel, Ordering::Acquire)
        {
            // Re-registration after a spurious poll replaces the old continuation.
            Ok(_) | Err(ATTACHED) => true,
            Err(_) => {
                lock(&self.continuation).take();
                false
            }
        }
    }

    /// Forget the registered continuation (the awaiter went away).
    pub fn detach(&self) {
        lock(&self.continuation).take();
    }

    pub fn take(&self) -> Result<Result<T, TaskError>, SlotError> {
        lock(&self.slot).take()
    }

    /// True if a failure was stored and nobody has taken it.
    pub fn has_unobserved_failure(&self) -> bool {
        lock(&self.slot).failure().is_some()
    }
}
