//! Ready queue shared between the executor thread and anything that resumes
//! its tasks (wakers, batch seals, worker threads).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::waker::Header;
use crate::continuation::lock;

/// Where a resumed task lands in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handoff {
    /// Runs next: the trampoline form of a direct transfer.
    Front,
    /// Runs after everything already queued.
    Back,
}

/// FIFO of ready tasks. Mutex-protected so resumes may come from any thread.
///
/// A task appears at most once at a time; the header's `queued` flag is the
/// guard and is only flipped while the queue lock is held.
pub(crate) struct ReadyQueue {
    entries: Mutex<VecDeque<Arc<Header>>>,
    available: Condvar,
    stale_wakes: AtomicU64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stale_wakes: AtomicU64::new(0),
        }
    }

    /// Enqueue one task. Returns false if it was already queued.
    pub fn push(&self, header: Arc<Header>, handoff: Handoff) -> bool {
        let mut entries = lock(&self.entries);
        if !header.mark_queued() {
            return false;
        }
        match handoff {
            Handoff::Front => entries.push_front(header),
            Handoff::Back => entries.push_back(header),
        }
        drop(entries);
        self.available.notify_one();
        true
    }

    /// Enqueue several tasks in one call, preserving their order.
    pub fn push_batch(&self, headers: Vec<Arc<Header>>) -> usize {
        let mut entries = lock(&self.entries);
        let mut pushed = 0;
        for header in headers {
            if header.mark_queued() {
                entries.push_back(header);
                pushed += 1;
            }
        }
        drop(entries);
        if pushed > 0 {
            self.available.notify_one();
        }
        pushed
    }

    pub fn pop(&self) -> Option<Arc<Header>> {
        let mut entries = lock(&self.entries);
        let header = entries.pop_front()?;
        header.clear_queued();
        Some(header)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Block until work is queued. Returns false if `timeout` elapsed first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let entries = lock(&self.entries);
        match timeout {
            Some(timeout) => {
                let (entries, _) = self
                    .available
                    .wait_timeout_while(entries, timeout, |q| q.is_empty())
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                !entries.is_empty()
            }
            None => {
                let entries = self
                    .available
                    .wait_while(entries, |q| q.is_empty())
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                !entries.is_empty()
            }
        }
    }

    /// Drop every queued entry (executor teardown).
    pub fn clear(&self) {
        let drained: Vec<_> = lock(&self.entries).drain(..).collect();
        for header in &drained {
            header.clear_queued();
        }
    }

    pub fn record_stale(&self) {
        self.stale_wakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_wakes(&self) -> u64 {
        self.stale_wakes.load(Ordering::Relaxed)
    }
}
