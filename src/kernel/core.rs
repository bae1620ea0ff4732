//! Kernel-owned state and the effects behind every trap.
//!
//! `Core` is the single shared structure of the whole system. It is owned
//! by a [`Kernel`](crate::kernel::Kernel) behind `Rc<RefCell<..>>`, bound
//! to the thread while `run` is active, and accessed in short exclusive
//! borrows: by the run loop between task polls, and by trap functions
//! inside a poll. No borrow is ever held across user code.

use crate::activation::TaskInfo;
use crate::clock::Clock;
use crate::errors::{Cancellation, Error};
use crate::selector::{Direction, ReadinessSelector, ReadyEvents};
use crate::task::{Status, Task, TaskCoro, TaskId, TaskOpts, WaitSite};
use crate::timeout::FrameExit;
use crate::timer::{TimerEntry, TimerHeap, TimerKind};
use crate::trap::{Blocking, ResumeValue, Submitted};
use crate::waitq;
use futures::task::ArcWake;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::task::{Poll, Waker};

/// Per-fd readiness slots: at most one reader and one writer.
#[derive(Debug, Default)]
pub(crate) struct IoWaiters {
    pub(crate) reader: Option<TaskId>,
    pub(crate) writer: Option<TaskId>,
}

#[derive(Debug, Default)]
struct QueueState {
    waiters: VecDeque<TaskId>,
}

#[derive(Debug)]
struct GroupState {
    done: VecDeque<TaskId>,
    waitq: u64,
    members: Vec<TaskId>,
}

/// Task-lifecycle moments reported to scheduler activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Created,
    Running,
    Suspended,
    Terminated,
}

/// User-owned payloads reaped from the task table. Their `Drop` impls may
/// re-enter the kernel (a stored value can own a `WaitQueue`, say), so
/// they must never be dropped while the core is borrowed; the run loop
/// drains them in between.
pub(crate) enum Reaped {
    Coro(TaskCoro),
    Value(Result<Box<dyn Any>, Error>),
}

/// Foreign-thread wake bridge: a mutex-guarded id list plus a sentinel
/// byte on the wake pipe so a kernel blocked in the selector notices.
pub(crate) struct WakeShared {
    ids: Mutex<Vec<TaskId>>,
    notify: UnixStream,
}

impl WakeShared {
    fn push(&self, id: TaskId) {
        self.ids.lock().push(id);
        // A full pipe already guarantees a pending wakeup.
        let _ = (&self.notify).write(&[1u8]);
    }
}

struct KernelWaker {
    id: TaskId,
    shared: Arc<WakeShared>,
}

impl ArcWake for KernelWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.shared.push(arc_self.id);
    }
}

pub(crate) struct Core {
    clock: Clock,
    tasks: HashMap<TaskId, Task>,
    ready: VecDeque<TaskId>,
    timers: TimerHeap,
    selector: ReadinessSelector,
    io: HashMap<RawFd, IoWaiters>,
    queues: HashMap<u64, QueueState>,
    groups: HashMap<u64, GroupState>,
    next_group: u64,
    current: Option<TaskId>,
    wake_rx: UnixStream,
    wake_shared: Arc<WakeShared>,
    /// Activation callbacks recorded here and dispatched by the run loop
    /// once the core borrow is released.
    pub(crate) events: Vec<(Phase, TaskInfo)>,
    /// Deferred drops of user-owned payloads; see [`Reaped`].
    pub(crate) graveyard: Vec<Reaped>,
}

impl Core {
    pub(crate) fn new() -> Result<Self, Error> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;

        let mut selector = ReadinessSelector::new()?;
        selector.register(wake_rx.as_raw_fd(), Direction::Read)?;

        Ok(Self {
            clock: Clock::new(),
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            timers: TimerHeap::new(),
            selector,
            io: HashMap::new(),
            queues: HashMap::new(),
            groups: HashMap::new(),
            next_group: 1,
            current: None,
            wake_rx,
            wake_shared: Arc::new(WakeShared {
                ids: Mutex::new(Vec::new()),
                notify: wake_tx,
            }),
            events: Vec::new(),
            graveyard: Vec::new(),
        })
    }

    /// Drop a reaped task entry without running user `Drop` code inside
    /// the core borrow.
    fn bury(&mut self, mut task: Task) {
        if let Some(coro) = task.coro.take() {
            self.graveyard.push(Reaped::Coro(coro));
        }
        if let Some(result) = task.result.take() {
            self.graveyard.push(Reaped::Value(result));
        }
    }

    pub(crate) fn now(&self) -> f64 {
        self.clock.now()
    }

    pub(crate) fn current_id(&self) -> Option<TaskId> {
        self.current
    }

    fn push_event(&mut self, phase: Phase, id: TaskId) {
        if let Some(task) = self.tasks.get(&id) {
            self.events.push((phase, task.info()));
        }
    }

    // --- Spawning -------------------------------------------------------

    pub(crate) fn spawn_erased(&mut self, coro: TaskCoro, opts: TaskOpts) -> TaskId {
        let id = TaskId::next();
        let joiners = waitq::alloc_queue_id();
        let waker = futures::task::waker(Arc::new(KernelWaker {
            id,
            shared: self.wake_shared.clone(),
        }));

        self.tasks
            .insert(id, Task::new(id, coro, opts, joiners, waker));
        self.ready.push_back(id);
        tracing::debug!(task = %id, ?opts, "task spawned");
        self.push_event(Phase::Created, id);
        id
    }

    // --- Trap submission (runs inside a task's poll) --------------------

    pub(crate) fn submit_trap(&mut self, req: Blocking) -> Result<Submitted, Error> {
        let id = self
            .current
            .ok_or(Error::Misuse("trap invoked outside a running task"))?;

        {
            let task = self
                .tasks
                .get_mut(&id)
                .ok_or(Error::Misuse("current task missing from kernel table"))?;

            if task.pending_trap.is_some() {
                return Err(Error::Misuse(
                    "a blocking trap is already pending; tasks issue one at a time",
                ));
            }
            // An unconsumed resume belongs to a trap future that was
            // dropped mid-flight; it must not leak into this trap.
            task.resume = None;

            if task.cancel_delivered {
                task.cancel_delivered = false;
                tracing::warn!(
                    task = %id,
                    "task is blocking again after a cancellation was delivered; \
                     other waiters may hang"
                );
            }

            // Every blocking trap is a cancellation point, checked before
            // suspending.
            if task.allow_cancel {
                if let Some(c) = task.cancel_pending.take() {
                    task.cancel_delivered = true;
                    return Err(c.into());
                }
            }
        }

        match req {
            Blocking::ReadWait(fd) => {
                if self.io.get(&fd).is_some_and(|w| w.reader.is_some()) {
                    return Err(Error::ReadBusy(fd));
                }
            }
            Blocking::WriteWait(fd) => {
                if self.io.get(&fd).is_some_and(|w| w.writer.is_some()) {
                    return Err(Error::WriteBusy(fd));
                }
            }
            Blocking::Join(target) => {
                if target == id {
                    return Err(Error::Misuse("task cannot join itself"));
                }
                let done = self.tasks.get(&target).map_or(true, |t| t.terminated);
                if done {
                    return Ok(Submitted::Done(ResumeValue::Unit));
                }
            }
            _ => {}
        }

        if let Some(task) = self.tasks.get_mut(&id) {
            task.pending_trap = Some(req);
        }
        Ok(Submitted::Wait)
    }

    pub(crate) fn take_resume(&mut self) -> Option<Result<ResumeValue, Error>> {
        let id = self.current?;
        let task = self.tasks.get_mut(&id)?;
        let resume = task.resume.take();
        if let Some(Err(e)) = &resume {
            if e.is_cancellation() {
                task.cancel_delivered = true;
            }
        }
        resume
    }

    /// Deliver a pending cancellation right now, if allowed. Used by traps
    /// that may complete without suspending but must still be cancellation
    /// points.
    pub(crate) fn precheck_cancellation(&mut self) -> Option<Cancellation> {
        let id = self.current?;
        let task = self.tasks.get_mut(&id)?;
        if !task.allow_cancel {
            return None;
        }
        let c = task.cancel_pending.take()?;
        task.cancel_delivered = true;
        Some(c)
    }

    // --- Dispatch (run loop side) ---------------------------------------

    pub(crate) fn next_ready(&mut self) -> Option<TaskId> {
        self.ready.pop_front()
    }

    pub(crate) fn begin_dispatch(&mut self, id: TaskId) -> Option<(TaskCoro, Waker)> {
        let task = self.tasks.get_mut(&id)?;
        if task.terminated {
            return None;
        }
        let coro = task.coro.take()?;
        task.status = Status::Running;
        task.cycles += 1;
        let waker = task.waker.clone();
        self.current = Some(id);
        self.push_event(Phase::Running, id);
        Some((coro, waker))
    }

    pub(crate) fn finish_dispatch(
        &mut self,
        id: TaskId,
        outcome: Poll<Result<Box<dyn Any>, Error>>,
        coro: Option<TaskCoro>,
    ) {
        self.current = None;
        match outcome {
            Poll::Ready(result) => self.terminate(id, result),
            Poll::Pending => {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.coro = coro;
                }
                self.park(id);
            }
        }
    }

    /// Execute the effect of the task's submitted trap (or park it as an
    /// implicit future wait) after its poll returned `Pending`.
    fn park(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        let req = task.pending_trap.take();

        match req {
            Some(Blocking::ReadWait(fd)) => {
                task.status = Status::Blocked(WaitSite::ReadFd(fd));
                match self.selector.register(fd, Direction::Read) {
                    Ok(()) => self.io.entry(fd).or_default().reader = Some(id),
                    Err(e) => {
                        self.reschedule(id, Err(e));
                        return;
                    }
                }
            }
            Some(Blocking::WriteWait(fd)) => {
                task.status = Status::Blocked(WaitSite::WriteFd(fd));
                match self.selector.register(fd, Direction::Write) {
                    Ok(()) => self.io.entry(fd).or_default().writer = Some(id),
                    Err(e) => {
                        self.reschedule(id, Err(e));
                        return;
                    }
                }
            }
            Some(Blocking::SleepUntil(deadline)) => {
                // An elapsed deadline (the cooperative yield) still goes
                // through the heap: the task must leave the ready queue so
                // the loop polls timers and I/O before it runs again.
                task.status = Status::Blocked(WaitSite::Timer);
                let token = self.timers.push(deadline, id, TimerKind::Sleep);
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.sleep_token = Some(token);
                }
            }
            Some(Blocking::SchedWait { q, reason }) => {
                task.status = Status::Blocked(WaitSite::Queue { q, reason });
                self.queues.entry(q).or_default().waiters.push_back(id);
            }
            Some(Blocking::Join(target)) => {
                // Submit guaranteed the target was alive; park on its
                // joiners queue.
                let jq = match self.tasks.get(&target) {
                    Some(t) if !t.terminated => t.joiners,
                    _ => {
                        // Terminated in the meantime is impossible (no task
                        // ran since submit), but resume rather than strand.
                        self.reschedule(id, Ok(ResumeValue::Unit));
                        return;
                    }
                };
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.status = Status::Blocked(WaitSite::Queue {
                        q: jq,
                        reason: "TASK_JOIN",
                    });
                }
                self.queues.entry(jq).or_default().waiters.push_back(id);
            }
            Some(Blocking::FutureWait) => {
                task.status = Status::Blocked(WaitSite::Future);
            }
            None => {
                // No trap was submitted: either a bare foreign `.await`
                // (implicit future wait) or a trap future that was dropped
                // before consuming its resume. An undelivered cancellation
                // goes back to pending.
                if let Some(Err(e)) = task.resume.take() {
                    match Cancellation::from_error(&e) {
                        Some(c) if task.cancel_pending.is_none() => {
                            task.cancel_pending = Some(c);
                        }
                        Some(_) => {}
                        None => {
                            tracing::warn!(task = %id, error = %e, "undeliverable trap error dropped");
                        }
                    }
                }
                task.status = Status::Blocked(WaitSite::Future);
            }
        }
        self.push_event(Phase::Suspended, id);
    }

    /// Move a task to the tail of the ready queue with the given resume.
    fn reschedule(&mut self, id: TaskId, resume: Result<ResumeValue, Error>) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        if task.terminated {
            return;
        }
        task.resume = Some(resume);
        task.status = Status::Ready;
        self.ready.push_back(id);
    }

    /// Remove a blocked task from whatever wait structure holds it.
    fn unwait(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        let Status::Blocked(site) = task.status else {
            return;
        };
        match site {
            WaitSite::ReadFd(fd) => {
                if let Some(w) = self.io.get_mut(&fd) {
                    w.reader = None;
                    if w.writer.is_none() {
                        self.io.remove(&fd);
                    }
                }
                self.selector.unregister(fd, Direction::Read);
            }
            WaitSite::WriteFd(fd) => {
                if let Some(w) = self.io.get_mut(&fd) {
                    w.writer = None;
                    if w.reader.is_none() {
                        self.io.remove(&fd);
                    }
                }
                self.selector.unregister(fd, Direction::Write);
            }
            WaitSite::Timer => {
                if let Some(token) = task.sleep_token.take() {
                    self.timers.cancel(token);
                }
            }
            WaitSite::Queue { q, .. } => {
                if let Some(qs) = self.queues.get_mut(&q) {
                    qs.waiters.retain(|w| *w != id);
                }
            }
            WaitSite::Future => {}
        }
    }

    // --- Cancellation ---------------------------------------------------

    /// Request cancellation of `id`. Returns false if the task has already
    /// terminated. A request that overlaps an in-flight cancellation joins
    /// it instead of queuing a second delivery.
    pub(crate) fn request_cancel(&mut self, id: TaskId, c: Cancellation) -> Result<bool, Error> {
        if self.current == Some(id) {
            return Err(Error::SelfCancel);
        }
        let Some(task) = self.tasks.get(&id) else {
            return Ok(false);
        };
        if task.terminated {
            return Ok(false);
        }
        if task.cancel_in_flight() {
            return Ok(true);
        }
        if task.is_blocked() && task.allow_cancel {
            self.unwait(id);
            self.reschedule(id, Err(c.into()));
        } else if let Some(task) = self.tasks.get_mut(&id) {
            task.cancel_pending = Some(c);
        }
        Ok(true)
    }

    pub(crate) fn set_allow_cancel(&mut self, allow: bool) -> Result<bool, Error> {
        let id = self
            .current
            .ok_or(Error::Misuse("no task is running"))?;
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(Error::Misuse("current task missing from kernel table"))?;
        let prior = task.allow_cancel;
        task.allow_cancel = allow;
        Ok(prior)
    }

    pub(crate) fn pending_cancellation(&self) -> Result<Option<Cancellation>, Error> {
        let id = self
            .current
            .ok_or(Error::Misuse("no task is running"))?;
        Ok(self.tasks.get(&id).and_then(|t| t.cancel_pending))
    }

    pub(crate) fn clear_pending_if(
        &mut self,
        matches: impl FnOnce(&Cancellation) -> bool,
    ) -> Result<Option<Cancellation>, Error> {
        let id = self
            .current
            .ok_or(Error::Misuse("no task is running"))?;
        let Some(task) = self.tasks.get_mut(&id) else {
            return Ok(None);
        };
        match task.cancel_pending {
            Some(c) if matches(&c) => {
                task.cancel_pending = None;
                Ok(Some(c))
            }
            other => Ok(other),
        }
    }

    // --- Timeout frames -------------------------------------------------

    pub(crate) fn push_timeout_frame(&mut self, deadline: f64) -> Result<(), Error> {
        let id = self
            .current
            .ok_or(Error::Misuse("no task is running"))?;
        let Some(task) = self.tasks.get_mut(&id) else {
            return Err(Error::Misuse("current task missing from kernel table"));
        };
        task.frames.push(deadline);
        if task.timeout.map_or(true, |e| deadline < e) {
            let stale = task.timeout_token.take();
            task.timeout = Some(deadline);
            if let Some(token) = stale {
                self.timers.cancel(token);
            }
            let token = self.timers.push(deadline, id, TimerKind::Timeout);
            if let Some(task) = self.tasks.get_mut(&id) {
                task.timeout_token = Some(token);
            }
        }
        Ok(())
    }

    pub(crate) fn pop_timeout_frame(&mut self) -> Result<FrameExit, Error> {
        let id = self
            .current
            .ok_or(Error::Misuse("no task is running"))?;
        let Some(task) = self.tasks.get_mut(&id) else {
            return Err(Error::Misuse("current task missing from kernel table"));
        };
        task.frames.pop();
        let remaining_min = task
            .frames
            .iter()
            .copied()
            .fold(None, |acc: Option<f64>, d| {
                Some(acc.map_or(d, |a| a.min(d)))
            });

        // Re-arm the effective deadline when it changed, including the
        // corner where a restored outer deadline already passed: the fresh
        // heap entry fires on the next loop iteration.
        if task.timeout != remaining_min {
            let stale = task.timeout_token.take();
            task.timeout = remaining_min;
            if let Some(token) = stale {
                self.timers.cancel(token);
            }
            if let Some(deadline) = remaining_min {
                let token = self.timers.push(deadline, id, TimerKind::Timeout);
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.timeout_token = Some(token);
                }
            }
        }

        // A pending timeout none of the remaining frames could have fired
        // belonged to the popped frame; the task has left that scope.
        if let Some(task) = self.tasks.get_mut(&id) {
            if let Some(at) = task.cancel_pending.and_then(|c| c.timeout_clock()) {
                if remaining_min.map_or(true, |m| m > at) {
                    task.cancel_pending = None;
                }
            }
        }

        Ok(FrameExit { remaining_min })
    }

    // --- Timers ---------------------------------------------------------

    fn fire_timer(&mut self, entry: TimerEntry, now: f64) {
        let id = entry.task;
        match entry.kind {
            TimerKind::Sleep => {
                let Some(task) = self.tasks.get_mut(&id) else {
                    return;
                };
                if task.sleep_token != Some(entry.token) {
                    return;
                }
                task.sleep_token = None;
                self.reschedule(id, Ok(ResumeValue::Clock(now)));
            }
            TimerKind::Timeout => {
                let Some(task) = self.tasks.get_mut(&id) else {
                    return;
                };
                if task.timeout_token != Some(entry.token) {
                    return;
                }
                task.timeout_token = None;
                task.timeout = None;

                // Ownership discrimination: the expiry belongs to the
                // innermost frame only if that frame's own deadline is up.
                let c = match task.frames.last().copied() {
                    Some(d) if d <= entry.deadline => Cancellation::Timeout { at: now },
                    Some(_) => Cancellation::OuterTimeout { at: now },
                    None => return,
                };

                if task.cancel_in_flight() {
                    return;
                }
                if task.is_blocked() && task.allow_cancel {
                    self.unwait(id);
                    self.reschedule(id, Err(c.into()));
                } else if let Some(task) = self.tasks.get_mut(&id) {
                    task.cancel_pending = Some(c);
                }
            }
        }
    }

    // --- Readiness ------------------------------------------------------

    fn wake_io(&mut self, fd: RawFd, dir: Direction) {
        let Some(w) = self.io.get_mut(&fd) else {
            return;
        };
        let id = match dir {
            Direction::Read => w.reader.take(),
            Direction::Write => w.writer.take(),
        };
        if w.reader.is_none() && w.writer.is_none() {
            self.io.remove(&fd);
        }
        self.selector.unregister(fd, dir);
        if let Some(id) = id {
            self.reschedule(id, Ok(ResumeValue::Unit));
        }
    }

    pub(crate) fn io_waiting(&self, fd: RawFd) -> (Option<TaskId>, Option<TaskId>) {
        self.io
            .get(&fd)
            .map_or((None, None), |w| (w.reader, w.writer))
    }

    // --- Event loop step ------------------------------------------------

    fn drain_wake_pipe(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wake_rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    pub(crate) fn drain_foreign_wakes(&mut self) {
        let ids: SmallVec<[TaskId; 16]> = {
            let mut pending = self.wake_shared.ids.lock();
            pending.drain(..).collect()
        };
        for id in ids {
            let parked = self
                .tasks
                .get(&id)
                .is_some_and(|t| matches!(t.status, Status::Blocked(WaitSite::Future)));
            if parked {
                self.reschedule(id, Ok(ResumeValue::Unit));
            }
        }
    }

    /// Block for readiness (bounded by the nearest live timer), wake the
    /// affected tasks, then fire expired timers.
    pub(crate) fn poll_events(&mut self) -> Result<(), Error> {
        let timeout = if self.ready.is_empty() {
            let now = self.now();
            self.timers.next_deadline().map(|d| (d - now).max(0.0))
        } else {
            Some(0.0)
        };

        let mut events = ReadyEvents::new();
        self.selector.wait(timeout, &mut events)?;

        let wake_fd = self.wake_rx.as_raw_fd();
        for (fd, dir) in events {
            if fd == wake_fd {
                self.drain_wake_pipe();
            } else {
                self.wake_io(fd, dir);
            }
        }
        self.drain_foreign_wakes();

        let now = self.now();
        while let Some(entry) = self.timers.pop_expired(now) {
            self.fire_timer(entry, now);
        }
        Ok(())
    }

    // --- Termination and results ----------------------------------------

    fn terminate(&mut self, id: TaskId, result: Result<Box<dyn Any>, Error>) {
        // Defensive sweep: a terminating task should hold no registrations,
        // but a dropped-in-flight trap future could have left some behind.
        self.unwait(id);

        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        let stale_timeout = task.timeout_token.take();
        let stale_sleep = task.sleep_token.take();
        task.pending_trap = None;
        task.resume = None;
        task.timeout = None;
        task.frames.clear();

        task.cancelled = result.as_ref().err().is_some_and(|e| e.is_cancellation());
        if task.daemon {
            if let Err(e) = &result {
                if !e.is_cancellation() {
                    tracing::error!(task = %id, error = %e, "daemon task crashed");
                }
            }
        }
        task.result = Some(result);
        task.terminated = true;
        task.status = Status::Terminated;
        task.coro = None;

        let joiners = task.joiners;
        let group = task.group;
        let detached = task.detached;

        for token in [stale_timeout, stale_sleep].into_iter().flatten() {
            self.timers.cancel(token);
        }

        // Joiners resume in FIFO order; the joiners queue dies with the task.
        if let Some(qs) = self.queues.remove(&joiners) {
            for waiter in qs.waiters {
                self.reschedule(waiter, Ok(ResumeValue::Unit));
            }
        }

        if let Some(gid) = group {
            if let Some(gs) = self.groups.get_mut(&gid) {
                gs.done.push_back(id);
                let wq = gs.waitq;
                self.queue_wake(wq, 1);
            }
        }

        tracing::debug!(task = %id, "task terminated");
        self.push_event(Phase::Terminated, id);

        if detached && group.is_none() {
            if let Some(task) = self.tasks.remove(&id) {
                self.bury(task);
            }
        }
    }

    pub(crate) fn task_terminated(&self, id: TaskId) -> bool {
        self.tasks.get(&id).map_or(true, |t| t.terminated)
    }

    pub(crate) fn task_cancelled(&self, id: TaskId) -> bool {
        self.tasks.get(&id).is_some_and(|t| t.cancelled)
    }

    pub(crate) fn take_result(&mut self, id: TaskId) -> Result<Result<Box<dyn Any>, Error>, Error> {
        let Some(task) = self.tasks.get_mut(&id) else {
            return Err(Error::Misuse("task result no longer available"));
        };
        if !task.terminated {
            return Err(Error::NotTerminated);
        }
        let result = task
            .result
            .take()
            .ok_or(Error::Misuse("task result already taken"))?;
        self.tasks.remove(&id);
        Ok(result)
    }

    /// A handle to the task went away without collecting the result.
    pub(crate) fn release_handle(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        if task.terminated && task.group.is_none() {
            if let Some(task) = self.tasks.remove(&id) {
                self.bury(task);
            }
        } else {
            task.detached = true;
        }
    }

    pub(crate) fn live_task_ids(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| !t.terminated)
            .map(|t| t.id)
            .collect()
    }

    /// Whether blocking in the selector can still make progress: a live
    /// timer or a real fd registration exists (the wake pipe is excluded).
    pub(crate) fn can_block(&mut self) -> bool {
        !self.ready.is_empty() || self.timers.next_deadline().is_some() || !self.io.is_empty()
    }

    /// Shutdown hammer: drop the coroutine of every remaining live task
    /// and record a cancellation result. The coroutines land in the
    /// graveyard so their drop runs outside the core borrow.
    pub(crate) fn force_terminate_live(&mut self) {
        for id in self.live_task_ids() {
            tracing::warn!(task = %id, "dropping task unreachable by cooperative cancellation");
            if let Some(task) = self.tasks.get_mut(&id) {
                if let Some(coro) = task.coro.take() {
                    self.graveyard.push(Reaped::Coro(coro));
                }
            }
            self.terminate(id, Err(Error::Cancelled));
        }
    }

    // --- Wait queues ----------------------------------------------------

    pub(crate) fn queue_len(&self, q: u64) -> usize {
        self.queues.get(&q).map_or(0, |qs| qs.waiters.len())
    }

    pub(crate) fn queue_wake(&mut self, q: u64, n: usize) -> usize {
        let mut woken: SmallVec<[TaskId; 8]> = SmallVec::new();
        if let Some(qs) = self.queues.get_mut(&q) {
            while woken.len() < n {
                match qs.waiters.pop_front() {
                    Some(id) => woken.push(id),
                    None => break,
                }
            }
        }
        let count = woken.len();
        for id in woken {
            self.reschedule(id, Ok(ResumeValue::Unit));
        }
        count
    }

    pub(crate) fn queue_drop(&mut self, q: u64) {
        if let Some(qs) = self.queues.remove(&q) {
            for id in qs.waiters {
                self.reschedule(
                    id,
                    Err(Error::Misuse("wait queue dropped while tasks were waiting")),
                );
            }
        }
    }

    // --- Task groups ----------------------------------------------------

    pub(crate) fn group_create(&mut self) -> (u64, u64) {
        let gid = self.next_group;
        self.next_group += 1;
        let wq = waitq::alloc_queue_id();
        self.groups.insert(
            gid,
            GroupState {
                done: VecDeque::new(),
                waitq: wq,
                members: Vec::new(),
            },
        );
        (gid, wq)
    }

    pub(crate) fn group_attach(&mut self, gid: u64, tid: TaskId) -> Result<(), Error> {
        let terminated = {
            let task = self
                .tasks
                .get_mut(&tid)
                .ok_or(Error::Misuse("task no longer exists"))?;
            if task.group.is_some() {
                return Err(Error::Misuse("task already belongs to a group"));
            }
            task.group = Some(gid);
            task.detached = false;
            task.terminated
        };
        let gs = self
            .groups
            .get_mut(&gid)
            .ok_or(Error::Misuse("group no longer exists"))?;
        gs.members.push(tid);
        if terminated {
            gs.done.push_back(tid);
            let wq = gs.waitq;
            self.queue_wake(wq, 1);
        }
        Ok(())
    }

    pub(crate) fn group_pop_done(&mut self, gid: u64) -> Option<TaskId> {
        self.groups.get_mut(&gid).and_then(|gs| gs.done.pop_front())
    }

    pub(crate) fn group_drop(&mut self, gid: u64) {
        let Some(gs) = self.groups.remove(&gid) else {
            return;
        };
        self.queue_drop(gs.waitq);
        for tid in gs.members {
            let Some(task) = self.tasks.get_mut(&tid) else {
                continue;
            };
            task.group = None;
            if task.terminated {
                if let Some(task) = self.tasks.remove(&tid) {
                    self.bury(task);
                }
            } else {
                task.detached = true;
            }
        }
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("tasks", &self.tasks.len())
            .field("ready", &self.ready.len())
            .field("current", &self.current)
            .finish()
    }
}
