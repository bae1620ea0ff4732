use crate::errors::Error;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};

/// Direction of a readiness registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// Batch of readiness events from one poll. Sized so a typical poll never
/// spills to the heap.
pub(crate) type ReadyEvents = SmallVec<[(RawFd, Direction); 16]>;

const EVENT_BATCH: usize = 64;

/// Thin portable wrapper over the OS readiness primitive (epoll).
///
/// Registrations are per-fd, per-direction; the selector folds both
/// directions into the fd's single epoll registration and unfolds events
/// back into `(fd, direction)` pairs. Who is waiting on what is tracked by
/// the kernel, not here.
#[derive(Debug)]
pub(crate) struct ReadinessSelector {
    epoll: Epoll,
    interest: HashMap<RawFd, EpollFlags>,
}

impl ReadinessSelector {
    pub(crate) fn new() -> Result<Self, Error> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| Error::Io(std::io::Error::from(e)))?;
        Ok(Self {
            epoll,
            interest: HashMap::new(),
        })
    }

    fn flags_for(dir: Direction) -> EpollFlags {
        match dir {
            Direction::Read => EpollFlags::EPOLLIN,
            Direction::Write => EpollFlags::EPOLLOUT,
        }
    }

    pub(crate) fn register(&mut self, fd: RawFd, dir: Direction) -> Result<(), Error> {
        // Safety: the kernel only registers fds that a suspended task is
        // actively waiting on; the registration is removed before the fd
        // can be closed by the resumed task.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let bit = Self::flags_for(dir);

        match self.interest.get_mut(&fd) {
            Some(flags) => {
                *flags |= bit;
                let mut event = EpollEvent::new(*flags, fd as u64);
                self.epoll
                    .modify(borrowed, &mut event)
                    .map_err(|e| Error::Io(std::io::Error::from(e)))?;
            }
            None => {
                self.epoll
                    .add(borrowed, EpollEvent::new(bit, fd as u64))
                    .map_err(|e| Error::Io(std::io::Error::from(e)))?;
                self.interest.insert(fd, bit);
            }
        }
        Ok(())
    }

    pub(crate) fn unregister(&mut self, fd: RawFd, dir: Direction) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let bit = Self::flags_for(dir);

        let Some(flags) = self.interest.get_mut(&fd) else {
            return;
        };
        *flags &= !bit;

        // Deregistration failures are not actionable: the waiter is already
        // being resumed or discarded, and a closed fd leaves epoll on its own.
        if flags.is_empty() {
            self.interest.remove(&fd);
            let _ = self.epoll.delete(borrowed);
        } else {
            let mut event = EpollEvent::new(*flags, fd as u64);
            let _ = self.epoll.modify(borrowed, &mut event);
        }
    }

    /// Wait up to `timeout` seconds (`None` blocks indefinitely) and
    /// collect `(fd, direction)` readiness pairs into `out`.
    ///
    /// The timeout is clamped to the epoll millisecond range; a too-early
    /// return is harmless because the caller re-derives its sleep bound
    /// every iteration.
    pub(crate) fn wait(
        &mut self,
        timeout: Option<f64>,
        out: &mut ReadyEvents,
    ) -> Result<(), Error> {
        let timeout = match timeout {
            None => EpollTimeout::NONE,
            Some(secs) => {
                let ms = (secs.max(0.0) * 1000.0).ceil();
                EpollTimeout::from(ms.min(f64::from(u16::MAX)) as u16)
            }
        };

        let mut events = [EpollEvent::empty(); EVENT_BATCH];
        let n = match self.epoll.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(Error::Io(std::io::Error::from(e))),
        };

        for event in &events[..n] {
            let fd = event.data() as RawFd;
            let got = event.events();
            let Some(flags) = self.interest.get(&fd) else {
                continue;
            };

            // Errors and hangups wake every waiter on the fd so the actual
            // I/O attempt can observe the failure.
            let fault = got.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP);
            if flags.contains(EpollFlags::EPOLLIN)
                && (fault || got.contains(EpollFlags::EPOLLIN))
            {
                out.push((fd, Direction::Read));
            }
            if flags.contains(EpollFlags::EPOLLOUT)
                && (fault || got.contains(EpollFlags::EPOLLOUT))
            {
                out.push((fd, Direction::Write));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_read_readiness_reported_once_data_arrives() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut selector = ReadinessSelector::new().unwrap();
        selector.register(b.as_raw_fd(), Direction::Read).unwrap();

        let mut out: ReadyEvents = smallvec![];
        selector.wait(Some(0.0), &mut out).unwrap();
        assert!(out.is_empty());

        a.write_all(b"x").unwrap();
        selector.wait(Some(1.0), &mut out).unwrap();
        assert_eq!(out.as_slice(), &[(b.as_raw_fd(), Direction::Read)]);
    }

    #[test]
    fn test_write_readiness_on_fresh_stream() {
        let (_a, b) = UnixStream::pair().unwrap();
        let mut selector = ReadinessSelector::new().unwrap();
        selector.register(b.as_raw_fd(), Direction::Write).unwrap();

        let mut out: ReadyEvents = smallvec![];
        selector.wait(Some(1.0), &mut out).unwrap();
        assert_eq!(out.as_slice(), &[(b.as_raw_fd(), Direction::Write)]);
    }

    #[test]
    fn test_unregister_one_direction_keeps_the_other() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();
        let mut selector = ReadinessSelector::new().unwrap();
        selector.register(fd, Direction::Read).unwrap();
        selector.register(fd, Direction::Write).unwrap();
        selector.unregister(fd, Direction::Write);

        a.write_all(b"x").unwrap();
        let mut out: ReadyEvents = smallvec![];
        selector.wait(Some(1.0), &mut out).unwrap();
        assert_eq!(out.as_slice(), &[(fd, Direction::Read)]);
    }
}
