//! Nested timeout scopes.
//!
//! Each scope pushes a frame (an absolute deadline) onto the task's
//! timeout stack; the kernel arms the minimum live deadline and injects a
//! cancellation when it expires. Scope exit classifies what flowed out of
//! the body so callers can distinguish three outcomes:
//!
//! * exactly my deadline fired → [`Error::Timeout`] (or `None` from the
//!   `ignore_*` variants),
//! * some outer scope's deadline fired → [`Error::OuterTimeout`], which
//!   must be propagated,
//! * an inner scope's timeout escaped unhandled → [`Error::UncaughtTimeout`].

use crate::context::{try_with_core, with_core};
use crate::errors::Error;
use pin_project::{pin_project, pinned_drop};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Run `inner` with a deadline `seconds` from now; its expiry surfaces as
/// [`Error::Timeout`].
pub fn timeout_after<F, T>(seconds: f64, inner: F) -> Timeout<F>
where
    F: Future<Output = Result<T, Error>>,
{
    Timeout(Frame::new(Deadline::After(seconds), false, inner))
}

/// Like [`timeout_after`] with an absolute kernel-clock deadline.
pub fn timeout_at<F, T>(clock: f64, inner: F) -> Timeout<F>
where
    F: Future<Output = Result<T, Error>>,
{
    Timeout(Frame::new(Deadline::At(clock), false, inner))
}

/// Run `inner` with a deadline `seconds` from now, swallowing this
/// scope's own expiry: the result is `None` when time ran out.
pub fn ignore_after<F, T>(seconds: f64, inner: F) -> Ignore<F>
where
    F: Future<Output = Result<T, Error>>,
{
    Ignore(Frame::new(Deadline::After(seconds), true, inner))
}

/// Like [`ignore_after`] with an absolute kernel-clock deadline.
pub fn ignore_at<F, T>(clock: f64, inner: F) -> Ignore<F>
where
    F: Future<Output = Result<T, Error>>,
{
    Ignore(Frame::new(Deadline::At(clock), true, inner))
}

#[derive(Debug, Clone, Copy)]
enum Deadline {
    After(f64),
    At(f64),
}

enum FrameOut<T> {
    Value(T),
    Expired,
}

#[pin_project]
pub struct Timeout<F>(#[pin] Frame<F>);

impl<F, T> Future for Timeout<F>
where
    F: Future<Output = Result<T, Error>>,
{
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().0.poll(cx).map(|out| match out? {
            FrameOut::Value(v) => Ok(v),
            // Unreachable for non-ignore frames; fail closed.
            FrameOut::Expired => Err(Error::UncaughtTimeout),
        })
    }
}

#[pin_project]
pub struct Ignore<F>(#[pin] Frame<F>);

impl<F, T> Future for Ignore<F>
where
    F: Future<Output = Result<T, Error>>,
{
    type Output = Result<Option<T>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().0.poll(cx).map(|out| match out? {
            FrameOut::Value(v) => Ok(Some(v)),
            FrameOut::Expired => Ok(None),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    NotEntered,
    Entered,
    Exited,
}

/// One timeout frame wrapping the body future. Entry pushes the deadline
/// onto the kernel-side stack; exit pops it and classifies the outcome.
/// The pop also runs on early drop so the stack never leaks a frame.
#[pin_project(PinnedDrop)]
struct Frame<F> {
    #[pin]
    inner: F,
    deadline: Deadline,
    ignore: bool,
    resolved: Option<f64>,
    state: FrameState,
}

impl<F> Frame<F> {
    fn new(deadline: Deadline, ignore: bool, inner: F) -> Self {
        Self {
            inner,
            deadline,
            ignore,
            resolved: None,
            state: FrameState::NotEntered,
        }
    }
}

impl<F, T> Frame<F>
where
    F: Future<Output = Result<T, Error>>,
{
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<FrameOut<T>, Error>> {
        let this = self.project();

        if *this.state == FrameState::NotEntered {
            let entered = with_core(|core| -> Result<f64, Error> {
                let deadline = match *this.deadline {
                    Deadline::After(secs) => core.now() + secs.max(0.0),
                    Deadline::At(clock) => clock,
                };
                core.push_timeout_frame(deadline)?;
                Ok(deadline)
            });
            match entered {
                Ok(Ok(deadline)) => {
                    *this.resolved = Some(deadline);
                    *this.state = FrameState::Entered;
                }
                Ok(Err(e)) | Err(e) => return Poll::Ready(Err(e)),
            }
        }

        let result = match this.inner.poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };

        *this.state = FrameState::Exited;
        let exit = match with_core(|core| core.pop_timeout_frame()) {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) | Err(e) => return Poll::Ready(Err(e)),
        };

        let own_deadline = this.resolved.unwrap_or(f64::INFINITY);
        let out = match result {
            Ok(value) => Ok(FrameOut::Value(value)),
            Err(e) => match e.timeout_clock() {
                Some(at) => {
                    if exit.remaining_min.is_some_and(|outer| outer <= at) {
                        // An enclosing scope's deadline is also up: the
                        // timeout belongs out there, whatever flavor we saw.
                        Err(Error::OuterTimeout(at))
                    } else if own_deadline <= at {
                        // Ours.
                        if *this.ignore {
                            Ok(FrameOut::Expired)
                        } else {
                            Err(Error::Timeout(at))
                        }
                    } else {
                        // No live deadline explains it: an inner scope's
                        // timeout escaped without a handler.
                        Err(Error::UncaughtTimeout)
                    }
                }
                None => Err(e),
            },
        };
        Poll::Ready(out)
    }
}

#[pinned_drop]
impl<F> PinnedDrop for Frame<F> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.state == FrameState::Entered {
            try_with_core(|core| core.pop_timeout_frame());
        }
    }
}

/// Kernel-side info returned when a frame pops: the minimum deadline of
/// the frames that remain (i.e. of the enclosing scopes).
pub(crate) struct FrameExit {
    pub(crate) remaining_min: Option<f64>,
}
