//! The kernel-side task object and its public handles.
//!
//! A task wraps a user coroutine (a boxed future) together with the
//! bookkeeping the kernel needs to schedule, suspend, cancel and reap it.
//! User code never touches `Task` directly; it holds a [`TaskId`] or a
//! typed [`JoinHandle`].

use crate::activation::TaskInfo;
use crate::errors::{Cancellation, Error};
use crate::timer::TimerToken;
use crate::trap::{Blocking, ResumeValue};
use std::any::Any;
use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::task::Waker;

pub mod id;
pub use id::TaskId;

pub mod join;
pub use join::JoinHandle;

pub mod group;
pub use group::{TaskGroup, Wait};

/// Erased task coroutine: the typed output is boxed so all tasks fit one
/// kernel table; `JoinHandle<T>` restores the type on the way out.
pub(crate) type TaskCoro = Pin<Box<dyn Future<Output = Result<Box<dyn Any>, Error>>>>;

bitflags::bitflags! {
    /// Options for a new task.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct TaskOpts: u8 {
        /// Background task: it runs forever by convention, a crash is
        /// logged rather than collected, and nothing waits for it.
        const DAEMON = 1;
    }
}

/// Where a blocked task is parked, so cancellation and cleanup can find
/// and remove it. A task occupies at most one site at a time.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WaitSite {
    ReadFd(RawFd),
    WriteFd(RawFd),
    Timer,
    Queue { q: u64, reason: &'static str },
    Future,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Status {
    Ready,
    Running,
    Blocked(WaitSite),
    Terminated,
}

/// Public view of a task's execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    ReadWait,
    WriteWait,
    TimeSleep,
    FutureWait,
    SchedWait,
    Terminated,
}

pub(crate) struct Task {
    pub(crate) id: TaskId,
    /// Taken out of the slot while the run loop polls it.
    pub(crate) coro: Option<TaskCoro>,
    pub(crate) daemon: bool,
    pub(crate) status: Status,
    /// Times this task has been scheduled.
    pub(crate) cycles: u64,

    /// Cancellation waiting for the next cancellation point.
    pub(crate) cancel_pending: Option<Cancellation>,
    /// Gates delivery; false inside a shielded region.
    pub(crate) allow_cancel: bool,
    /// A cancellation was actually delivered into the task. Blocking again
    /// after that is a policy violation worth a log line.
    pub(crate) cancel_delivered: bool,

    /// Nested timeout-frame deadlines, outermost first.
    pub(crate) frames: Vec<f64>,
    /// Effective deadline: the minimum of `frames`, mirrored here so timer
    /// expiry can be validated without a scan.
    pub(crate) timeout: Option<f64>,
    pub(crate) timeout_token: Option<TimerToken>,
    pub(crate) sleep_token: Option<TimerToken>,

    /// Blocking trap submitted during the current poll, if any.
    pub(crate) pending_trap: Option<Blocking>,
    /// Value or error for the next trap resume.
    pub(crate) resume: Option<Result<ResumeValue, Error>>,

    /// Wait queue woken when this task terminates.
    pub(crate) joiners: u64,
    /// Value xor error; frozen at termination.
    pub(crate) result: Option<Result<Box<dyn Any>, Error>>,
    pub(crate) terminated: bool,
    pub(crate) cancelled: bool,

    /// Owning task group, if any.
    pub(crate) group: Option<u64>,
    /// No handle or group will ever collect the result; reap eagerly.
    pub(crate) detached: bool,

    pub(crate) waker: Waker,
}

impl Task {
    pub(crate) fn new(id: TaskId, coro: TaskCoro, opts: TaskOpts, joiners: u64, waker: Waker) -> Self {
        Self {
            id,
            coro: Some(coro),
            daemon: opts.contains(TaskOpts::DAEMON),
            status: Status::Ready,
            cycles: 0,
            cancel_pending: None,
            allow_cancel: true,
            cancel_delivered: false,
            frames: Vec::new(),
            timeout: None,
            timeout_token: None,
            sleep_token: None,
            pending_trap: None,
            resume: None,
            joiners,
            result: None,
            terminated: false,
            cancelled: false,
            group: None,
            detached: false,
            waker,
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        match self.status {
            Status::Ready => TaskState::Ready,
            Status::Running => TaskState::Running,
            Status::Blocked(WaitSite::ReadFd(_)) => TaskState::ReadWait,
            Status::Blocked(WaitSite::WriteFd(_)) => TaskState::WriteWait,
            Status::Blocked(WaitSite::Timer) => TaskState::TimeSleep,
            Status::Blocked(WaitSite::Queue { .. }) => TaskState::SchedWait,
            Status::Blocked(WaitSite::Future) => TaskState::FutureWait,
            Status::Terminated => TaskState::Terminated,
        }
    }

    pub(crate) fn is_blocked(&self) -> bool {
        matches!(self.status, Status::Blocked(_))
    }

    /// A cancellation has been delivered or is on its way in; a second
    /// request must join the first rather than queue another delivery.
    pub(crate) fn cancel_in_flight(&self) -> bool {
        self.cancel_pending.is_some()
            || matches!(&self.resume, Some(Err(e)) if e.is_cancellation())
    }

    pub(crate) fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            daemon: self.daemon,
            state: self.state(),
            cycles: self.cycles,
            cancelled: self.cancelled,
            terminated: self.terminated,
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("daemon", &self.daemon)
            .field("cycles", &self.cycles)
            .finish()
    }
}
