//! cotask: a small cooperative task runtime.
//!
//! - [`Executor`] owns tasks and polls them from a ready queue on one thread.
//! - [`Task`] is the single-owner handle to one computation; awaiting it
//!   yields the body's value or re-raises its failure.
//! - [`Batcher`] coalesces requests from many tasks into one bulk call.
//! - [`sync_wait`] blocks ordinary code until a task finishes.
//! - [`WorkerPool`] and [`external`] connect tasks to work done on other
//!   threads.
//!
//! ```
//! use cotask::{Executor, TaskError, sync_wait};
//!
//! let executor = Executor::default();
//! let exec = executor.clone();
//! let task = executor.create(async move {
//!     let child = exec.create(async { Ok::<_, TaskError>(20) });
//!     Ok::<_, TaskError>(child.await? + 1)
//! });
//! assert_eq!(sync_wait(&executor, task).unwrap(), 21);
//! ```

mod batch;
mod cancel;
mod config;
mod continuation;
mod error;
mod executor;
mod external;
mod slot;
mod sync_wait;
mod task;

pub use batch::{BatchError, BatchRequest, BatchStats, Batcher};
pub use cancel::timeout;
pub use config::{ExecutorConfig, ParsePolicyError, ResumePolicy, StartPolicy};
pub use continuation::Continuation;
pub use error::{BoxError, RuntimeError, SharedError, SlotError, TaskError};
pub use executor::{Executor, ExecutorStats, Runnable, YieldNow, yield_now};
pub use external::{External, Resumer, WorkerPool, external};
pub use slot::ResultSlot;
pub use sync_wait::sync_wait;
pub use task::{Task, TaskId, TaskState};

pub use tokio_util::sync::CancellationToken;
