//! Blocking bridge from synchronous code into an executor.

use futures::channel::oneshot;

use crate::error::TaskError;
use crate::executor::{Executor, waker};
use crate::task::Task;

/// Block the calling thread until `task` finishes, driving `executor` in
/// the meantime, and return the task's value or failure.
///
/// A driver task awaits `task` and sends the outcome over a oneshot
/// channel. Between runs of ready work the thread sleeps until something is
/// queued, e.g. by a worker thread completing an operation. If the
/// executor's stall timeout elapses with nothing queued, the driver and
/// `task` are destroyed and [`TaskError::Stalled`] is returned.
///
/// # Panics
///
/// Panics if called from inside a task body: the body's own executor
/// could never make progress. Also panics if `task` was created by another
/// executor, since nothing would drive it.
pub fn sync_wait<T: 'static>(executor: &Executor, task: Task<T>) -> Result<T, TaskError> {
    assert!(
        !waker::in_task(),
        "sync_wait called from inside a task; await the task instead"
    );
    assert!(
        executor.owns(&task),
        "sync_wait called with {} from another executor; pass the executor that created it",
        task.id()
    );

    let id = task.id();
    let (tx, mut rx) = oneshot::channel();
    let driver = executor.spawn(async move {
        // The receiver only goes away once sync_wait has returned.
        let _ = tx.send(task.await);
        Ok::<_, TaskError>(())
    });
    tracing::debug!(task = %id, driver = %driver.id(), "Blocking until task completes");

    let stall_timeout = executor.config().stall_timeout();
    loop {
        executor.run_available();
        match rx.try_recv() {
            Ok(Some(outcome)) => return outcome,
            Ok(None) => {}
            Err(oneshot::Canceled) => return Err(TaskError::Destroyed),
        }
        if !executor.wait_for_work(stall_timeout) {
            let waited = stall_timeout.unwrap_or_default();
            tracing::warn!(task = %id, ?waited, "No progress, giving up");
            return Err(TaskError::Stalled(waited));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use std::time::Duration;

    #[test]
    fn returns_value_of_finished_task() {
        let executor = Executor::default();
        let task = executor.spawn(async { Ok::<_, TaskError>(String::from("ready")) });
        executor.run_available();
        assert_eq!(sync_wait(&executor, task).unwrap(), "ready");
    }

    #[test]
    fn reraises_failure() {
        let executor = Executor::default();
        let task = executor.create(async { Err::<(), _>(anyhow::anyhow!("bad config")) });
        let err = sync_wait(&executor, task).unwrap_err();
        assert_eq!(err.to_string(), "computation failed: bad config");
    }

    #[test]
    fn stalls_when_nothing_can_progress() {
        let config = ExecutorConfig::default().with_stall_timeout(Duration::from_millis(20));
        let executor = Executor::new(config);
        let stuck = executor.create(async {
            std::future::pending::<()>().await;
            Ok::<_, TaskError>(())
        });

        let err = sync_wait(&executor, stuck).unwrap_err();
        assert!(matches!(err, TaskError::Stalled(d) if d == Duration::from_millis(20)));
        assert_eq!(executor.live_tasks(), 0);
        assert_eq!(executor.stats().destroyed, 2);
    }

    #[test]
    #[should_panic(expected = "from another executor")]
    fn refuses_task_of_another_executor() {
        let config = ExecutorConfig::default().with_stall_timeout(Duration::from_millis(200));
        let owner = Executor::new(config.clone());
        let other = Executor::new(config);
        let task = owner.create(async { Ok::<_, TaskError>(5) });
        let _ = sync_wait(&other, task);
    }

    #[test]
    fn clone_of_executor_can_drive_its_tasks() {
        let executor = Executor::default();
        let task = executor.create(async { Ok::<_, TaskError>(5) });
        assert!(executor.clone().owns(&task));
        assert_eq!(sync_wait(&executor.clone(), task).unwrap(), 5);
    }

    #[test]
    #[should_panic(expected = "inside a task")]
    fn refuses_to_block_inside_task() {
        let executor = Executor::default();
        let inner = executor.clone();
        let outer = executor.spawn(async move {
            let nested = inner.create(async { Ok::<_, TaskError>(()) });
            sync_wait(&inner, nested)
        });
        executor.run_available();
        // The panic was caught at the poll boundary; re-raise it here.
        if let Err(err) = sync_wait(&executor, outer) {
            panic!("{err}");
        }
    }
}
