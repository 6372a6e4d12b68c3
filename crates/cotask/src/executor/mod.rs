//! Cooperative single-threaded executor.
//!
//! Task bodies live in an arena owned by the executor and are polled one at
//! a time from a ready queue. The queue itself is thread-safe so worker
//! threads can hand completions back; polling never leaves the thread that
//! owns the [`Executor`].

mod arena;
pub(crate) mod queue;
pub(crate) mod waker;

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures::future::LocalBoxFuture;
use serde::Serialize;

use self::arena::{Arena, Record};
use self::queue::{Handoff, ReadyQueue};
use self::waker::Header;
use crate::config::{ExecutorConfig, StartPolicy};
use crate::continuation::Completion;
use crate::error::{RuntimeError, TaskError};
use crate::task::{Task, TaskId, TaskState};

/// Counters describing what an executor has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    /// Times a task body was polled.
    pub polls: u64,
    /// Tasks that finished, with a value or a failure.
    pub completed: u64,
    /// Of those, tasks that finished with a failure.
    pub failed: u64,
    /// Tasks torn down before finishing.
    pub destroyed: u64,
    /// Failures nobody awaited.
    pub unhandled_failures: u64,
    /// Resumes that arrived after their task had finished.
    pub stale_wakes: u64,
}

#[derive(Default)]
struct Counters {
    polls: Cell<u64>,
    completed: Cell<u64>,
    failed: Cell<u64>,
    destroyed: Cell<u64>,
    unhandled: Cell<u64>,
}

fn bump(counter: &Cell<u64>) {
    counter.set(counter.get() + 1);
}

pub(crate) struct Core {
    config: ExecutorConfig,
    arena: RefCell<Arena>,
    queue: Arc<ReadyQueue>,
    counters: Counters,
}

impl Core {
    fn spawn_inner<T: 'static>(
        self: &Rc<Self>,
        build: impl FnOnce(Arc<Completion<T>>) -> LocalBoxFuture<'static, ()>,
    ) -> Task<T> {
        let completion = Arc::new(Completion::new());
        let future = build(Arc::clone(&completion));

        let header = {
            let mut arena = self.arena.borrow_mut();
            let header = Arc::new(Header::new(arena.next_id(), Arc::clone(&self.queue)));
            arena.insert(Record {
                header: Arc::clone(&header),
                future: Some(future),
                finisher: Arc::clone(&completion) as Arc<dyn arena::Finish>,
                detached: false,
            });
            header
        };
        tracing::trace!(task = %header.id(), "Task created");

        let task = Task::new(Arc::clone(&header), completion, Rc::downgrade(self));
        if self.config.start == StartPolicy::Eager {
            self.poll_task(&header);
        }
        task
    }

    /// Queue a task that has never run, honouring the resume policy so that
    /// an awaiter hands control straight to its child.
    pub(crate) fn start(&self, header: &Arc<Header>) {
        self.enqueue(header, self.config.resume.handoff());
    }

    fn enqueue(&self, header: &Arc<Header>, handoff: Handoff) {
        if let Err(err) = header.schedule(handoff) {
            tracing::error!(error = %err, "Failed to queue task");
        }
    }

    pub(crate) fn detach(&self, header: &Arc<Header>) {
        if let Some(record) = self.arena.borrow_mut().get_mut(header.id()) {
            record.detached = true;
        }
        if header.state() == TaskState::Created {
            self.enqueue(header, Handoff::Back);
        }
        tracing::trace!(task = %header.id(), "Task detached");
    }

    pub(crate) fn note_unhandled(&self) {
        bump(&self.counters.unhandled);
    }

    fn poll_task(&self, header: &Arc<Header>) {
        let id = header.id();
        let future = self
            .arena
            .borrow_mut()
            .get_mut(id)
            .and_then(|record| record.future.take());
        // Destroyed, finished, or already on the stack.
        let Some(mut future) = future else {
            return;
        };

        header.set_state(TaskState::Running);
        bump(&self.counters.polls);

        let waker = Waker::from(Arc::clone(header));
        let mut cx = Context::from_waker(&waker);
        let polled = {
            let _enter = waker::enter(Arc::clone(header), waker.clone());
            panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
        };

        match polled {
            Ok(Poll::Pending) => {
                let mut arena = self.arena.borrow_mut();
                if let Some(record) = arena.get_mut(id) {
                    header.set_state(TaskState::Suspended);
                    record.future = Some(future);
                    tracing::trace!(task = %id, "Task suspended");
                } else {
                    // Handle dropped while the body was running.
                    drop(arena);
                    drop(future);
                }
            }
            Ok(Poll::Ready(())) => {
                drop(future);
                self.finish(id, None);
            }
            Err(payload) => {
                drop(future);
                let err = TaskError::from_panic(payload);
                tracing::warn!(task = %id, error = %err, "Task body panicked");
                self.finish(id, Some(err));
            }
        }
    }

    fn finish(&self, id: TaskId, panicked: Option<TaskError>) {
        let Some(record) = self.arena.borrow_mut().remove(id) else {
            return;
        };
        if let Some(err) = panicked {
            record.finisher.fail(err);
        }
        record.header.set_state(TaskState::Completed);
        bump(&self.counters.completed);

        if record.finisher.has_failure() {
            bump(&self.counters.failed);
            if record.detached {
                self.note_unhandled();
                tracing::warn!(task = %id, "Detached task failed with nobody to observe it");
            }
        }
        tracing::debug!(task = %id, "Task completed");

        match record.finisher.publish() {
            Ok(Some(continuation)) => {
                if let Err(err) = continuation.resume_with(self.config.resume.handoff()) {
                    tracing::error!(task = %id, error = %err, "Could not resume awaiter");
                }
            }
            Ok(None) => {}
            Err(err) => tracing::error!(task = %id, error = %err, "Task completed twice"),
        }
    }

    pub(crate) fn destroy(&self, id: TaskId) {
        let record = self.arena.borrow_mut().remove(id);
        if let Some(record) = record {
            record.header.set_state(TaskState::Destroyed);
            bump(&self.counters.destroyed);
            tracing::debug!(task = %id, "Task destroyed before completing");
            drop(record);
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.queue.clear();
        let records = self.arena.get_mut().drain();
        if !records.is_empty() {
            tracing::debug!(tasks = records.len(), "Executor dropped with live tasks");
        }
        for record in &records {
            record.header.set_state(TaskState::Destroyed);
        }
        drop(records);
        // Tasks created while the bodies above were dropped.
        self.queue.clear();
    }
}

/// A cooperative run queue for tasks.
///
/// Cheap to clone; clones share the same queue and tasks. Not `Send`: the
/// executor and all of its task handles stay on the thread that created
/// them, while [`Continuation`](crate::Continuation)s and wakers may travel.
#[derive(Clone)]
pub struct Executor {
    core: Rc<Core>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        tracing::debug!(start = ?config.start, resume = ?config.resume, "Creating executor");
        Self {
            core: Rc::new(Core {
                config,
                arena: RefCell::new(Arena::default()),
                queue: Arc::new(ReadyQueue::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.core.config
    }

    /// Create a task running `body`.
    ///
    /// With [`StartPolicy::Lazy`] nothing runs until the task is awaited,
    /// submitted or detached. With [`StartPolicy::Eager`] the body is polled
    /// right here until it first suspends.
    pub fn create<F, T, E>(&self, body: F) -> Task<T>
    where
        F: Future<Output = Result<T, E>> + 'static,
        T: 'static,
        E: Into<TaskError>,
    {
        self.core.spawn_inner(move |completion: Arc<Completion<T>>| -> LocalBoxFuture<'static, ()> {
            Box::pin(async move {
                let outcome = body.await.map_err(Into::into);
                if let Err(err) = completion.fill(outcome) {
                    tracing::error!(error = %err, "Task outcome already stored");
                }
            })
        })
    }

    /// Create a task and queue it to run.
    pub fn spawn<F, T, E>(&self, body: F) -> Task<T>
    where
        F: Future<Output = Result<T, E>> + 'static,
        T: 'static,
        E: Into<TaskError>,
    {
        let task = self.create(body);
        if task.state() == TaskState::Created {
            self.core.enqueue(task.header(), Handoff::Back);
        }
        task
    }

    /// Append a task to the back of the ready queue.
    pub fn submit<T>(&self, task: &Task<T>) -> Result<(), RuntimeError> {
        if !self.owns(task) {
            return Err(RuntimeError::ExecutorGone);
        }
        task.header().schedule(Handoff::Back)
    }

    /// True if `task` was created by this executor (or a clone of it).
    pub fn owns<T>(&self, task: &Task<T>) -> bool {
        task.belongs_to(&self.core)
    }

    /// Poll ready tasks until the queue is empty. Returns how many ran.
    pub fn run_available(&self) -> usize {
        let mut ran = 0;
        while let Some(header) = self.core.queue.pop() {
            self.core.poll_task(&header);
            ran += 1;
        }
        if ran > 0 {
            tracing::trace!(ran, "Drained ready queue");
        }
        ran
    }

    /// Remove the next ready task, or a no-op if nothing is ready.
    pub fn pop_next(&self) -> Runnable {
        Runnable {
            header: self.core.queue.pop(),
            core: Rc::downgrade(&self.core),
        }
    }

    /// Number of tasks currently queued.
    pub fn ready(&self) -> usize {
        self.core.queue.len()
    }

    /// Number of tasks that have neither finished nor been destroyed.
    pub fn live_tasks(&self) -> usize {
        self.core.arena.borrow().len()
    }

    /// Block the calling thread until some task is queued, or `timeout`
    /// elapses. Returns false on timeout.
    pub fn wait_for_work(&self, timeout: Option<Duration>) -> bool {
        self.core.queue.wait(timeout)
    }

    pub fn stats(&self) -> ExecutorStats {
        let c = &self.core.counters;
        ExecutorStats {
            polls: c.polls.get(),
            completed: c.completed.get(),
            failed: c.failed.get(),
            destroyed: c.destroyed.get(),
            unhandled_failures: c.unhandled.get(),
            stale_wakes: self.core.queue.stale_wakes(),
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.core.config)
            .field("ready", &self.ready())
            .field("live_tasks", &self.live_tasks())
            .finish()
    }
}

/// One unit of ready work taken off the queue by [`Executor::pop_next`].
///
/// Running a no-op does nothing.
#[must_use]
pub struct Runnable {
    header: Option<Arc<Header>>,
    core: Weak<Core>,
}

impl Runnable {
    pub fn is_noop(&self) -> bool {
        self.header.is_none()
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.header.as_ref().map(|h| h.id())
    }

    pub fn run(self) {
        if let (Some(header), Some(core)) = (self.header, self.core.upgrade()) {
            core.poll_task(&header);
        }
    }
}

impl std::fmt::Debug for Runnable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runnable").field("task", &self.task_id()).finish()
    }
}

/// Suspend the current task once, putting it at the back of the ready queue.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
