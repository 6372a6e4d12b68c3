//! Per-task header, its waker, and the "currently polling" context.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::task::{Wake, Waker};

use super::queue::{Handoff, ReadyQueue};
use crate::error::RuntimeError;
use crate::task::{TaskId, TaskState};

/// State shared between a task's arena record, its handle, and every waker
/// or continuation that can resume it.
pub(crate) struct Header {
    id: TaskId,
    state: AtomicU8,
    queued: AtomicBool,
    queue: Arc<ReadyQueue>,
}

impl Header {
    pub fn new(id: TaskId, queue: Arc<ReadyQueue>) -> Self {
        Self {
            id,
            state: AtomicU8::new(TaskState::Created as u8),
            queued: AtomicBool::new(false),
            queue,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn queue(&self) -> &Arc<ReadyQueue> {
        &self.queue
    }

    /// Returns false if the task was already queued.
    pub(super) fn mark_queued(&self) -> bool {
        !self.queued.swap(true, Ordering::AcqRel)
    }

    pub(super) fn clear_queued(&self) {
        self.queued.store(false, Ordering::Release);
    }

    /// Put the task back on its executor's ready queue.
    ///
    /// Refuses tasks that already completed or were destroyed: resuming
    /// those would corrupt their result slot.
    pub fn schedule(self: &Arc<Self>, handoff: Handoff) -> Result<(), RuntimeError> {
        self.check_resumable()?;
        self.queue.push(Arc::clone(self), handoff);
        Ok(())
    }

    pub fn check_resumable(&self) -> Result<(), RuntimeError> {
        match self.state() {
            TaskState::Completed => Err(RuntimeError::ResumeAfterCompletion(self.id)),
            TaskState::Destroyed => Err(RuntimeError::ResumeAfterDestroy(self.id)),
            TaskState::Created | TaskState::Running | TaskState::Suspended => Ok(()),
        }
    }
}

impl Wake for Header {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Err(err) = self.schedule(Handoff::Back) {
            self.queue.record_stale();
            tracing::trace!(task = %self.id, error = %err, "Ignoring wake for finished task");
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<(Arc<Header>, Waker)>> = const { RefCell::new(None) };
}

/// Marks `header` as the task being polled on this thread until dropped.
///
/// Nests: an eagerly started task polled from inside another task's poll
/// restores the outer task when its guard drops.
pub(crate) struct Enter {
    previous: Option<(Arc<Header>, Waker)>,
}

pub(crate) fn enter(header: Arc<Header>, waker: Waker) -> Enter {
    let previous = CURRENT.with(|current| current.borrow_mut().replace((header, waker)));
    Enter { previous }
}

impl Drop for Enter {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// The header of the task being polled, if `waker` is that task's own waker.
///
/// Wakers wrapped by combinators do not match and are treated as foreign.
pub(crate) fn current_for(waker: &Waker) -> Option<Arc<Header>> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .filter(|(_, own)| own.will_wake(waker))
            .map(|(header, _)| Arc::clone(header))
    })
}

pub(crate) fn in_task() -> bool {
    CURRENT.with(|current| current.borrow().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(id: u64) -> Arc<Header> {
        Arc::new(Header::new(TaskId::from_raw(id), Arc::new(ReadyQueue::new())))
    }

    #[test]
    fn wake_enqueues_once() {
        let h = header(1);
        let waker = Waker::from(Arc::clone(&h));
        waker.wake_by_ref();
        waker.wake_by_ref();
        assert_eq!(h.queue().len(), 1);
    }

    #[test]
    fn wake_after_completion_is_stale() {
        let h = header(2);
        h.set_state(TaskState::Completed);
        Waker::from(Arc::clone(&h)).wake();
        assert!(h.queue().is_empty());
        assert_eq!(h.queue().stale_wakes(), 1);
    }

    #[test]
    fn schedule_rejects_destroyed_task() {
        let h = header(3);
        h.set_state(TaskState::Destroyed);
        assert_eq!(
            h.schedule(Handoff::Back),
            Err(RuntimeError::ResumeAfterDestroy(TaskId::from_raw(3)))
        );
    }

    #[test]
    fn enter_sets_and_restores_current() {
        let outer = header(10);
        let inner = header(11);
        let outer_waker = Waker::from(Arc::clone(&outer));
        let inner_waker = Waker::from(Arc::clone(&inner));

        assert!(!in_task());
        {
            let _outer = enter(Arc::clone(&outer), outer_waker.clone());
            {
                let _inner = enter(Arc::clone(&inner), inner_waker.clone());
                assert_eq!(current_for(&inner_waker).unwrap().id(), inner.id());
                assert!(current_for(&outer_waker).is_none());
            }
            assert_eq!(current_for(&outer_waker).unwrap().id(), outer.id());
        }
        assert!(!in_task());
    }
}
