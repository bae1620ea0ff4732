//! The trap vocabulary: the only way a task asks the kernel for service.
//!
//! Traps come in two kinds. *Blocking* traps may suspend the task for an
//! arbitrarily long time and are the only cancellation points in the
//! system. *Synchronous* traps complete immediately without yielding to
//! other tasks and are never cancellation points. The split is what makes
//! cancellation-point analysis entirely local: if a call can block, it can
//! deliver a cancellation; otherwise it cannot.
//!
//! Every function here must be called from inside a task being driven by a
//! kernel; elsewhere it fails with [`Error::NoKernel`].

use crate::context::with_core;
use crate::errors::Error;
use crate::task::{JoinHandle, TaskCoro, TaskId, TaskOpts};
use crate::waitq::WaitQueue;
use pin_project::pin_project;
use std::any::Any;
use std::future::Future;
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

/// A blocking trap request, parked on the current task until the run loop
/// executes its effect.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Blocking {
    ReadWait(RawFd),
    WriteWait(RawFd),
    SleepUntil(f64),
    SchedWait { q: u64, reason: &'static str },
    Join(TaskId),
    FutureWait,
}

/// Payload delivered when a blocking trap resumes successfully.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ResumeValue {
    Unit,
    Clock(f64),
}

impl ResumeValue {
    fn into_clock(self) -> f64 {
        match self {
            ResumeValue::Clock(t) => t,
            // Reschedules for timed waits always carry the clock; tolerate
            // a bare wakeup rather than poison the task.
            ResumeValue::Unit => {
                debug_assert!(false, "timed trap resumed without a clock value");
                0.0
            }
        }
    }
}

/// Outcome of submitting a blocking trap.
pub(crate) enum Submitted {
    /// The task will suspend; the run loop owns it from here.
    Wait,
    /// The trap completed synchronously (e.g. joining an already
    /// terminated task).
    Done(ResumeValue),
}

/// Two-phase future behind every blocking trap: the first poll submits the
/// request to the kernel, the second poll (after the kernel reschedules
/// the task) collects the value or the injected error.
pub(crate) struct TrapFuture {
    request: Option<Blocking>,
}

impl TrapFuture {
    pub(crate) fn new(request: Blocking) -> Self {
        Self {
            request: Some(request),
        }
    }
}

impl Future for TrapFuture {
    type Output = Result<ResumeValue, Error>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.request.take() {
            Some(request) => match with_core(|core| core.submit_trap(request)) {
                Ok(Ok(Submitted::Wait)) => Poll::Pending,
                Ok(Ok(Submitted::Done(value))) => Poll::Ready(Ok(value)),
                Ok(Err(e)) | Err(e) => Poll::Ready(Err(e)),
            },
            None => match with_core(|core| core.take_resume()) {
                Ok(Some(resume)) => Poll::Ready(resume),
                // Spurious poll while still suspended.
                Ok(None) => Poll::Pending,
                Err(e) => Poll::Ready(Err(e)),
            },
        }
    }
}

/// Wait until `fd` is readable. At most one task may read-wait on a given
/// fd; a second concurrent attempt fails with [`Error::ReadBusy`].
pub async fn read_wait(fd: &impl AsRawFd) -> Result<(), Error> {
    TrapFuture::new(Blocking::ReadWait(fd.as_raw_fd()))
        .await
        .map(drop)
}

/// Wait until `fd` is writable. Single-writer, like [`read_wait`].
pub async fn write_wait(fd: &impl AsRawFd) -> Result<(), Error> {
    TrapFuture::new(Blocking::WriteWait(fd.as_raw_fd()))
        .await
        .map(drop)
}

/// Sleep for `seconds`, returning the kernel clock at wakeup. A zero (or
/// negative) duration still suspends: the task re-runs in the next loop
/// iteration, after pending timers and I/O have been serviced — the
/// cooperative yield.
pub async fn sleep(seconds: f64) -> Result<f64, Error> {
    let deadline = with_core(|core| core.now())? + seconds.max(0.0);
    sleep_until(deadline).await
}

/// Sleep until the kernel clock reaches `deadline`.
pub async fn sleep_until(deadline: f64) -> Result<f64, Error> {
    TrapFuture::new(Blocking::SleepUntil(deadline))
        .await
        .map(ResumeValue::into_clock)
}

/// Yield to other ready tasks, resuming after already-ready tasks have
/// run and pending timers and I/O have been serviced.
pub async fn schedule() -> Result<(), Error> {
    sleep(0.0).await.map(drop)
}

/// Suspend on a wait queue until woken (or cancelled). `reason` labels the
/// wait for introspection, e.g. `"LOCK_ACQUIRE"`.
pub async fn scheduler_wait(queue: &WaitQueue, reason: &'static str) -> Result<(), Error> {
    scheduler_wait_raw(queue.id(), reason).await
}

/// Raw-id flavor of [`scheduler_wait`], for kernel-internal queues that
/// have no `WaitQueue` handle (joiners, group completion).
pub(crate) async fn scheduler_wait_raw(q: u64, reason: &'static str) -> Result<(), Error> {
    TrapFuture::new(Blocking::SchedWait { q, reason })
        .await
        .map(drop)
}

/// Move up to `n` tasks from the wait queue to the ready queue, in FIFO
/// order. Synchronous: never a cancellation point. Returns the number of
/// tasks actually woken.
pub fn scheduler_wake(queue: &WaitQueue, n: usize) -> Result<usize, Error> {
    with_core(|core| core.queue_wake(queue.id(), n))
}

/// Block until the given task terminates. Synchronous completion when it
/// already has.
pub(crate) async fn join_task(id: TaskId) -> Result<(), Error> {
    TrapFuture::new(Blocking::Join(id)).await.map(drop)
}

pub(crate) fn erase<F, T>(coro: F) -> TaskCoro
where
    F: Future<Output = Result<T, Error>> + 'static,
    T: 'static,
{
    Box::pin(async move { coro.await.map(|v| Box::new(v) as Box<dyn Any>) })
}

/// Create a new task running `coro` and return its handle. The task is
/// appended to the ready queue and first runs when the spawner next
/// suspends.
pub async fn spawn<F, T>(coro: F) -> Result<JoinHandle<T>, Error>
where
    F: Future<Output = Result<T, Error>> + 'static,
    T: 'static,
{
    let id = with_core(|core| core.spawn_erased(erase(coro), TaskOpts::empty()))?;
    Ok(JoinHandle::new(id))
}

/// Like [`spawn`] but the task is daemonic: it is expected to run forever
/// in the background, and a crash is logged instead of being treated as an
/// interesting result.
pub async fn spawn_daemon<F, T>(coro: F) -> Result<JoinHandle<T>, Error>
where
    F: Future<Output = Result<T, Error>> + 'static,
    T: 'static,
{
    let id = with_core(|core| core.spawn_erased(erase(coro), TaskOpts::DAEMON))?;
    Ok(JoinHandle::new(id))
}

/// Id of the currently running task.
pub async fn current_task_id() -> Result<TaskId, Error> {
    with_core(|core| core.current_id())?.ok_or(Error::Misuse("no task is running"))
}

/// Current kernel clock, without yielding.
pub async fn clock() -> Result<f64, Error> {
    with_core(|core| core.now())
}

/// The `(reader, writer)` tasks waiting on `fd`, if any.
pub async fn io_waiting(fd: &impl AsRawFd) -> Result<(Option<TaskId>, Option<TaskId>), Error> {
    let raw = fd.as_raw_fd();
    with_core(|core| core.io_waiting(raw))
}

/// Await an arbitrary (foreign) future as a blocking trap.
///
/// The inner future is polled with the task's kernel waker, so it may be
/// completed from another thread (worker pools, channels); the kernel is
/// woken through its wake pipe. Unlike a bare `.await`, this wrapper is a
/// cancellation point: a cancellation injected while waiting surfaces as
/// the `Err`, and the inner future is dropped.
pub fn future_wait<F: Future>(inner: F) -> FutureWait<F> {
    FutureWait {
        inner,
        suspended: false,
    }
}

#[pin_project]
pub struct FutureWait<F> {
    #[pin]
    inner: F,
    suspended: bool,
}

impl<F: Future> Future for FutureWait<F> {
    type Output = Result<F::Output, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if *this.suspended {
            *this.suspended = false;
            match with_core(|core| core.take_resume()) {
                Ok(Some(Err(e))) => return Poll::Ready(Err(e)),
                Ok(Some(Ok(_))) | Ok(None) => {}
                Err(e) => return Poll::Ready(Err(e)),
            }
        } else {
            // Entry is a cancellation point even if the future is already
            // complete.
            match with_core(|core| core.precheck_cancellation()) {
                Ok(Some(c)) => return Poll::Ready(Err(c.into())),
                Ok(None) => {}
                Err(e) => return Poll::Ready(Err(e)),
            }
        }

        match this.inner.poll(cx) {
            Poll::Ready(v) => Poll::Ready(Ok(v)),
            Poll::Pending => match with_core(|core| core.submit_trap(Blocking::FutureWait)) {
                Ok(Ok(_)) => {
                    *this.suspended = true;
                    Poll::Pending
                }
                Ok(Err(e)) | Err(e) => Poll::Ready(Err(e)),
            },
        }
    }
}
