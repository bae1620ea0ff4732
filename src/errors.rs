use std::io;
use std::os::fd::RawFd;

/// A centralized error type for all kernel and task operations.
///
/// The cancellation family (`Cancelled`, `Timeout`, `OuterTimeout`) is
/// injected by the kernel at blocking traps; everything else is either a
/// programmer error surfaced synchronously at the offending call, or an
/// ordinary failure propagated out of a task.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The task was cancelled by another task (or by kernel shutdown).
    #[error("task was cancelled")]
    Cancelled,

    /// The innermost enclosing timeout scope expired. The payload is the
    /// kernel clock at expiry.
    #[error("operation timed out at clock {0}")]
    Timeout(f64),

    /// A timeout expired, but it belongs to an *outer* scope: the code that
    /// observes this error is not the code that set the deadline, so it must
    /// let the error propagate.
    #[error("an enclosing timeout expired at clock {0}")]
    OuterTimeout(f64),

    /// A `Timeout` from an inner scope escaped through an outer timeout
    /// scope without being handled anywhere inside it.
    #[error("a timeout from an inner scope escaped without a handler")]
    UncaughtTimeout,

    /// Wrapper produced by `JoinHandle::join` when the joined task failed.
    /// The original error is the source.
    #[error("task failed")]
    TaskFailed(#[source] Box<Error>),

    /// Another task is already waiting for read readiness on this fd.
    #[error("file descriptor {0} already has a task waiting to read")]
    ReadBusy(RawFd),

    /// Another task is already waiting for write readiness on this fd.
    #[error("file descriptor {0} already has a task waiting to write")]
    WriteBusy(RawFd),

    /// The task's result was requested before it terminated.
    #[error("task has not terminated")]
    NotTerminated,

    /// A task attempted to cancel itself.
    #[error("a task may not cancel itself")]
    SelfCancel,

    /// A kernel operation was invoked on a thread with no running kernel.
    #[error("no kernel is running on this thread")]
    NoKernel,

    /// Misuse of the kernel or of a synchronization primitive, e.g.
    /// releasing a lock that the caller does not own.
    #[error("misuse: {0}")]
    Misuse(&'static str),

    /// An I/O error from the readiness machinery.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A catch-all for application-level task failures.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for the cancellation family: errors the kernel injects at a
    /// cancellation point. `UncaughtTimeout` is deliberately *not* part of
    /// the family: it is raised by timeout-scope unwinding, not injected.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::Cancelled | Error::Timeout(_) | Error::OuterTimeout(_)
        )
    }

    /// True for either flavor of fd-busy error.
    pub fn is_resource_busy(&self) -> bool {
        matches!(self, Error::ReadBusy(_) | Error::WriteBusy(_))
    }

    /// The expiry clock carried by a timeout-flavored cancellation.
    pub(crate) fn timeout_clock(&self) -> Option<f64> {
        match self {
            Error::Timeout(at) | Error::OuterTimeout(at) => Some(*at),
            _ => None,
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Cancelled, Self::Cancelled) => true,
            (Self::Timeout(a), Self::Timeout(b)) => a == b,
            (Self::OuterTimeout(a), Self::OuterTimeout(b)) => a == b,
            (Self::UncaughtTimeout, Self::UncaughtTimeout) => true,
            (Self::TaskFailed(a), Self::TaskFailed(b)) => a == b,
            (Self::ReadBusy(a), Self::ReadBusy(b)) => a == b,
            (Self::WriteBusy(a), Self::WriteBusy(b)) => a == b,
            (Self::NotTerminated, Self::NotTerminated) => true,
            (Self::SelfCancel, Self::SelfCancel) => true,
            (Self::NoKernel, Self::NoKernel) => true,
            (Self::Misuse(a), Self::Misuse(b)) => a == b,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

/// The value held in a task's pending-cancellation slot.
///
/// Only the cancellation family can be pending, which keeps the slot a
/// small `Copy` value that can be inspected (`check_cancellation`) without
/// consuming it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cancellation {
    /// Plain cancellation, delivered as [`Error::Cancelled`].
    Cancelled,
    /// The innermost timeout scope expired at the given clock.
    Timeout { at: f64 },
    /// An outer timeout scope expired at the given clock.
    OuterTimeout { at: f64 },
}

impl Cancellation {
    /// The expiry clock, for timeout-flavored cancellations.
    pub fn timeout_clock(&self) -> Option<f64> {
        match self {
            Cancellation::Cancelled => None,
            Cancellation::Timeout { at } | Cancellation::OuterTimeout { at } => Some(*at),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.timeout_clock().is_some()
    }

    pub(crate) fn from_error(err: &Error) -> Option<Cancellation> {
        match err {
            Error::Cancelled => Some(Cancellation::Cancelled),
            Error::Timeout(at) => Some(Cancellation::Timeout { at: *at }),
            Error::OuterTimeout(at) => Some(Cancellation::OuterTimeout { at: *at }),
            _ => None,
        }
    }
}

impl From<Cancellation> for Error {
    fn from(c: Cancellation) -> Error {
        match c {
            Cancellation::Cancelled => Error::Cancelled,
            Cancellation::Timeout { at } => Error::Timeout(at),
            Cancellation::OuterTimeout { at } => Error::OuterTimeout(at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: Send, Sync);
    assert_impl_all!(Cancellation: Copy, Send, Sync);

    #[test]
    fn test_cancellation_family() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::Timeout(1.0).is_cancellation());
        assert!(Error::OuterTimeout(1.0).is_cancellation());
        assert!(!Error::UncaughtTimeout.is_cancellation());
        assert!(!Error::ReadBusy(3).is_cancellation());
    }

    #[test]
    fn test_io_errors_compare_by_kind() {
        let a = Error::Io(io::Error::new(io::ErrorKind::WouldBlock, "a"));
        let b = Error::Io(io::Error::new(io::ErrorKind::WouldBlock, "b"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_cancellation_round_trips_through_error() {
        let c = Cancellation::Timeout { at: 2.5 };
        let e = Error::from(c);
        assert_eq!(Cancellation::from_error(&e), Some(c));
    }
}
