//! End-to-end runs of the executor, batcher and sync bridge together.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use cotask::{
    Batcher, CancellationToken, Executor, ExecutorConfig, ResumePolicy, StartPolicy, Task,
    TaskError, WorkerPool, sync_wait, timeout,
};

#[derive(Debug, thiserror::Error)]
#[error("sensor {0} offline")]
struct SensorOffline(u32);

#[test]
fn seventh_request_seals_the_batch() {
    let executor = Executor::default();
    let batcher = Batcher::from_fn(|inputs: Vec<u32>| inputs.iter().map(|x| x * x).collect())
        .with_predicate(|inputs| inputs.len() >= 7);

    let tasks: Vec<Task<u32>> = (0..7)
        .map(|i| {
            let batcher = batcher.clone();
            executor.spawn(async move { batcher.request(i).await })
        })
        .collect();

    // Run the first six: each appends its input and suspends.
    for _ in 0..6 {
        executor.pop_next().run();
    }
    assert_eq!(batcher.pending(), 6);
    assert!(tasks.iter().all(|t| !t.is_finished()));

    // The seventh trips the predicate and resolves everyone.
    executor.run_available();
    assert_eq!(batcher.pending(), 0);
    assert_eq!(batcher.stats().sealed_batches, 1);

    let outputs: Vec<u32> = tasks
        .into_iter()
        .map(|t| sync_wait(&executor, t).unwrap())
        .collect();
    assert_eq!(outputs, vec![0, 1, 4, 9, 16, 25, 36]);
}

#[test]
fn sealing_empty_batch_twice_resumes_nothing() {
    let executor = Executor::default();
    let batcher: Batcher<u8, u8> = Batcher::from_fn(|inputs: Vec<u8>| inputs);
    assert!(!batcher.maybe_execute(true));
    assert!(!batcher.maybe_execute(true));
    assert_eq!(executor.run_available(), 0);
}

#[test]
fn nested_failure_reaches_caller_unchanged() {
    let executor = Executor::default();
    let exec = executor.clone();
    let root = executor.create(async move {
        let middle_exec = exec.clone();
        let middle = exec.create(async move {
            let leaf = middle_exec
                .create(async { Err::<u32, _>(TaskError::computation(SensorOffline(7))) });
            let reading = leaf.await?;
            Ok::<_, TaskError>(reading * 2)
        });
        let doubled = middle.await?;
        Ok::<_, TaskError>(doubled + 1)
    });

    let err = sync_wait(&executor, root).unwrap_err();
    let TaskError::Computation(source) = &err else {
        panic!("expected a computation failure, got {err:?}");
    };
    let offline = source
        .downcast_ref::<SensorOffline>()
        .expect("original error type survives");
    assert_eq!(offline.0, 7);
    assert_eq!(err.to_string(), "computation failed: sensor 7 offline");
}

#[test]
fn anyhow_bodies_propagate_task_errors_unchanged() {
    let executor = Executor::default();
    let exec = executor.clone();
    let root = executor.create(async move {
        let inner = exec.create(async { Err::<(), _>(TaskError::Cancelled) });
        inner.await?;
        Ok::<_, anyhow::Error>(())
    });
    assert!(sync_wait(&executor, root).unwrap_err().is_cancelled());
}

fn chain(executor: &Executor, depth: u64) -> Task<u64> {
    let mut task = executor.create(async { Ok::<_, TaskError>(0) });
    for _ in 0..depth {
        let prev = task;
        task = executor.create(async move { Ok::<_, TaskError>(prev.await? + 1) });
    }
    task
}

#[test]
fn deep_chain_does_not_grow_the_stack() {
    for resume in [ResumePolicy::Immediate, ResumePolicy::Queued] {
        let executor = Executor::new(ExecutorConfig::default().with_resume(resume));
        let root = chain(&executor, 10_000);
        assert_eq!(sync_wait(&executor, root).unwrap(), 10_000);
        assert_eq!(executor.live_tasks(), 0);
    }
}

#[test]
fn eager_chain_completes_at_creation() {
    let executor = Executor::new(ExecutorConfig::default().with_start(StartPolicy::Eager));
    let root = chain(&executor, 100);
    assert!(root.is_finished());
    assert_eq!(sync_wait(&executor, root).unwrap(), 100);
}

#[test]
fn awaiter_suspends_once_and_resumes_once() {
    let executor = Executor::default();
    let exec = executor.clone();
    let parent = executor.spawn(async move {
        let child = exec.create(async { Ok::<_, TaskError>(3) });
        child.await
    });
    executor.run_available();
    assert!(parent.is_finished());

    // parent: first poll suspends, second resumes; child: one poll.
    assert_eq!(executor.stats().polls, 3);
    assert_eq!(sync_wait(&executor, parent).unwrap(), 3);
}

#[test]
fn finished_task_is_read_without_suspending() {
    let executor = Executor::default();
    let child = executor.spawn(async { Ok::<_, TaskError>("early") });
    executor.run_available();
    assert!(child.is_finished());

    let polls_before = executor.stats().polls;
    let parent = executor.spawn(async move { child.await });
    executor.run_available();
    assert!(parent.is_finished());
    assert_eq!(executor.stats().polls - polls_before, 1);
}

#[test]
fn batches_fed_by_worker_threads() {
    let pool = Rc::new(WorkerPool::new(4).unwrap());
    let executor = Executor::default();
    let batcher = Batcher::from_fn(|inputs: Vec<u64>| inputs.iter().map(|x| x + 1000).collect())
        .with_predicate(|inputs| inputs.len() >= 4);

    let tasks: Vec<Task<u64>> = (0..8u64)
        .map(|i| {
            let pool = Rc::clone(&pool);
            let batcher = batcher.clone();
            executor.spawn(async move {
                let staged = pool.offload(move || Ok(i * 10)).await?;
                batcher.request(staged).await
            })
        })
        .collect();

    let mut outputs: Vec<u64> = tasks
        .into_iter()
        .map(|t| sync_wait(&executor, t).unwrap())
        .collect();
    outputs.sort_unstable();
    assert_eq!(outputs, (0..8).map(|i| i * 10 + 1000).collect::<Vec<_>>());
    assert_eq!(batcher.stats().sealed_batches, 2);
}

#[test]
fn timeout_destroys_slow_cancellable_task() {
    let pool = Rc::new(WorkerPool::new(1).unwrap());
    let executor = Executor::default();
    let token = CancellationToken::new();
    let log: Rc<RefCell<Vec<&str>>> = Rc::default();

    let slow = {
        let log = Rc::clone(&log);
        let pool = Rc::clone(&pool);
        executor.create_cancellable(token.clone(), async move {
            pool.sleep(Duration::from_secs(30)).await?;
            log.borrow_mut().push("slow finished");
            Ok::<_, TaskError>(())
        })
    };
    let guarded = {
        let pool = Rc::clone(&pool);
        let limit = Duration::from_millis(10);
        executor.create(async move { timeout(slow, limit, pool.sleep(limit)).await })
    };

    assert!(matches!(sync_wait(&executor, guarded), Err(TaskError::TimedOut(_))));
    assert!(log.borrow().is_empty());
    assert!(!token.is_cancelled());
}

#[test]
fn cancellation_from_another_thread_beats_the_timer() {
    let pool = Rc::new(WorkerPool::new(1).unwrap());
    let executor = Executor::default();
    let token = CancellationToken::new();

    let slow = {
        let pool = Rc::clone(&pool);
        executor.create_cancellable(token.clone(), async move {
            pool.sleep(Duration::from_secs(30)).await?;
            Ok::<_, TaskError>("slow finished")
        })
    };
    let guarded = {
        let pool = Rc::clone(&pool);
        let limit = Duration::from_secs(30);
        executor.create(async move { timeout(slow, limit, pool.sleep(limit)).await })
    };

    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        token.cancel();
    });

    let outcome = sync_wait(&executor, guarded);
    canceller.join().unwrap();
    assert!(matches!(outcome, Err(TaskError::Cancelled)));
    assert_eq!(executor.live_tasks(), 0);
}
