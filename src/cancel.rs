//! Shielded regions and cancellation inspection.
//!
//! Cancellation is a request, not a preemption: the kernel parks the
//! request in the task's pending slot and delivers it at the next
//! blocking trap. A shielded region defers that delivery; inspecting the
//! slot lets cleanup code decide what to do with a deferred request.

use crate::context::with_core;
use crate::errors::{Cancellation, Error};
use pin_project::{pin_project, pinned_drop};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Run `inner` with cancellation delivery disabled.
///
/// Blocking traps inside the region complete normally even when a
/// cancellation arrives; the request stays pending and is raised at the
/// first blocking trap after the region ends. Regions nest: the previous
/// mask is restored on exit (including early drop).
pub fn disable_cancellation<F, T>(inner: F) -> DisableCancellation<F>
where
    F: Future<Output = Result<T, Error>>,
{
    DisableCancellation {
        inner,
        shield: ShieldState::NotEntered,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShieldState {
    NotEntered,
    Entered { prior: bool },
    Exited,
}

#[pin_project(PinnedDrop)]
pub struct DisableCancellation<F> {
    #[pin]
    inner: F,
    shield: ShieldState,
}

impl<F, T> Future for DisableCancellation<F>
where
    F: Future<Output = Result<T, Error>>,
{
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if *this.shield == ShieldState::NotEntered {
            match with_core(|core| core.set_allow_cancel(false)) {
                Ok(Ok(prior)) => *this.shield = ShieldState::Entered { prior },
                Ok(Err(e)) | Err(e) => return Poll::Ready(Err(e)),
            }
        }

        let outcome = this.inner.poll(cx);
        if let Poll::Ready(_) = &outcome {
            if let ShieldState::Entered { prior } = *this.shield {
                *this.shield = ShieldState::Exited;
                let _ = with_core(|core| core.set_allow_cancel(prior));
            }
        }
        outcome
    }
}

#[pinned_drop]
impl<F> PinnedDrop for DisableCancellation<F> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if let ShieldState::Entered { prior } = *this.shield {
            let _ = with_core(|core| core.set_allow_cancel(prior));
        }
    }
}

/// Return the pending cancellation (if any) without delivering it,
/// clearing the slot when `clear_if` matches it.
///
/// Typical use inside a shielded region: decide whether a deferred
/// cancellation should still fire after cleanup, and swallow it if not.
pub async fn check_cancellation<P>(clear_if: P) -> Result<Option<Cancellation>, Error>
where
    P: FnOnce(&Cancellation) -> bool,
{
    with_core(|core| core.clear_pending_if(clear_if))?
}

/// Whether a cancellation is currently pending for this task.
pub async fn cancellation_pending() -> Result<bool, Error> {
    Ok(with_core(|core| core.pending_cancellation())??.is_some())
}
