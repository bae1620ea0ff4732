//! `solo` — a single-threaded cooperative task kernel.
//!
//! Many tasks, one OS thread: tasks run until they voluntarily suspend at
//! a *trap*, the kernel multiplexes them over an epoll-driven readiness
//! loop, and cancellation is a cooperative request delivered only at
//! blocking traps. The building blocks are a monotonic timer heap, FIFO
//! wait queues, nested timeout scopes with three distinguishable
//! outcomes, and a structured-concurrency [`TaskGroup`].
//!
//! ```no_run
//! use solo::{run, spawn, sleep, Error};
//!
//! fn main() -> Result<(), Error> {
//!     let value = run(async {
//!         let child = spawn(async {
//!             sleep(0.05).await?;
//!             Ok(42)
//!         })
//!         .await?;
//!         child.join().await
//!     })?;
//!     assert_eq!(value, 42);
//!     Ok(())
//! }
//! ```

pub mod errors;
pub use errors::{Cancellation, Error};

mod clock;
mod context;
mod selector;
mod timer;

pub mod waitq;
pub use waitq::WaitQueue;

pub mod task;
pub use task::{JoinHandle, TaskGroup, TaskId, TaskState, Wait};

pub mod trap;
pub use trap::{
    clock, current_task_id, future_wait, io_waiting, read_wait, schedule, sleep, sleep_until,
    spawn, spawn_daemon, write_wait,
};

pub mod kernel;
pub use kernel::{run, Builder, Kernel};

mod cancel;
pub use cancel::{cancellation_pending, check_cancellation, disable_cancellation};

mod timeout;
pub use timeout::{ignore_after, ignore_at, timeout_after, timeout_at};

pub mod activation;
pub use activation::{Activation, TaskInfo};

pub mod sync;
pub use sync::{Condition, Event, Lock, LockGuard, RLock, Semaphore, SemaphoreGuard};

pub mod queue;
pub use queue::{LifoQueue, PriorityQueue, Queue, UniversalQueue};

#[cfg(test)]
pub(crate) mod test_utils;
