//! Heap-owned task records indexed by stable ids.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::LocalBoxFuture;

use super::waker::Header;
use crate::continuation::{Completion, Continuation};
use crate::error::{RuntimeError, TaskError};
use crate::task::TaskId;

/// Type-erased view of a task's completion, used by the executor when the
/// body finishes.
pub(crate) trait Finish {
    /// Store a failure the body itself could not report (a panic).
    fn fail(&self, err: TaskError);
    fn has_failure(&self) -> bool;
    fn publish(&self) -> Result<Option<Continuation>, RuntimeError>;
}

impl<T> Finish for Completion<T> {
    fn fail(&self, err: TaskError) {
        if let Err(slot_err) = self.fill(Err(err)) {
            tracing::error!(error = %slot_err, "Failure arrived after the outcome was stored");
        }
    }

    fn has_failure(&self) -> bool {
        self.has_unobserved_failure()
    }

    fn publish(&self) -> Result<Option<Continuation>, RuntimeError> {
        Completion::publish(self)
    }
}

/// Everything the executor owns for one live task.
pub(crate) struct Record {
    pub header: Arc<Header>,
    /// `None` while the body is being polled.
    pub future: Option<LocalBoxFuture<'static, ()>>,
    pub finisher: Arc<dyn Finish>,
    /// Set once the handle was given up; failures are then unhandled.
    pub detached: bool,
}

#[derive(Default)]
pub(crate) struct Arena {
    records: HashMap<TaskId, Record>,
    next_id: u64,
}

impl Arena {
    pub fn next_id(&mut self) -> TaskId {
        self.next_id += 1;
        TaskId::from_raw(self.next_id)
    }

    pub fn insert(&mut self, record: Record) {
        self.records.insert(record.header.id(), record);
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Record> {
        self.records.get_mut(&id)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Record> {
        self.records.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn drain(&mut self) -> Vec<Record> {
        self.records.drain().map(|(_, record)| record).collect()
    }
}
