//! Task synchronization primitives: events, locks, semaphores, condition
//! variables. All of them are thin state machines over [`WaitQueue`];
//! none are thread safe — they coordinate tasks within one kernel.
//!
//! Cancellation policy: a suspended acquirer that gets cancelled is
//! removed from the wait queue by the kernel without touching the
//! primitive's counters, so the primitive's invariant holds by
//! construction. Ownership that was already granted travels in an RAII
//! guard, whose drop restores the invariant even if the new owner is
//! cancelled before it ever runs.

use crate::errors::Error;
use crate::task::TaskId;
use crate::trap::{current_task_id, scheduler_wait, scheduler_wake};
use crate::waitq::WaitQueue;
use std::cell::Cell;

/// Sticky boolean flag. `wait` suspends until the flag is set; `set`
/// wakes all waiters and stays set until [`Event::clear`].
#[derive(Debug, Default)]
pub struct Event {
    is_set: Cell<bool>,
    waiting: WaitQueue,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.is_set.get()
    }

    pub fn clear(&self) {
        self.is_set.set(false);
    }

    /// Wait until the event is set. Returns immediately (and without a
    /// cancellation check) when it already is.
    pub async fn wait(&self) -> Result<(), Error> {
        if self.is_set.get() {
            return Ok(());
        }
        scheduler_wait(&self.waiting, "EVENT_WAIT").await
    }

    /// Set the flag and wake every waiter, in FIFO order.
    pub fn set(&self) -> Result<usize, Error> {
        self.is_set.set(true);
        if self.waiting.is_empty() {
            return Ok(0);
        }
        scheduler_wake(&self.waiting, usize::MAX)
    }
}

/// Mutual exclusion between tasks.
///
/// `acquire` returns an RAII guard; releasing hands the lock directly to
/// the next waiter (FIFO), so no task can barge in between a release and
/// the waiter actually running.
#[derive(Debug, Default)]
pub struct Lock {
    locked: Cell<bool>,
    waiting: WaitQueue,
}

impl Lock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locked(&self) -> bool {
        self.locked.get()
    }

    pub async fn acquire(&self) -> Result<LockGuard<'_>, Error> {
        self.acquire_raw().await?;
        Ok(LockGuard { lock: self })
    }

    pub(crate) async fn acquire_raw(&self) -> Result<(), Error> {
        if self.locked.get() {
            // On wakeup the releaser has already transferred ownership to
            // us; `locked` stayed true the whole time.
            scheduler_wait(&self.waiting, "LOCK_ACQUIRE").await?;
        }
        self.locked.set(true);
        Ok(())
    }

    pub(crate) fn release_raw(&self) {
        if self.waiting.is_empty() {
            self.locked.set(false);
        } else {
            let _ = scheduler_wake(&self.waiting, 1);
        }
    }
}

/// Holds a [`Lock`]; releases it on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_raw();
    }
}

/// Re-entrant lock: tracks the owning task and a recursion depth.
/// Unlike [`Lock`], acquire/release are explicit and `release` by a
/// non-owner fails.
#[derive(Debug, Default)]
pub struct RLock {
    lock: Lock,
    owner: Cell<Option<TaskId>>,
    count: Cell<u32>,
}

impl RLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.owner.get()
    }

    pub fn locked(&self) -> bool {
        self.owner.get().is_some()
    }

    pub async fn acquire(&self) -> Result<(), Error> {
        let me = current_task_id().await?;
        if self.owner.get() == Some(me) {
            self.count.set(self.count.get() + 1);
            return Ok(());
        }
        self.lock.acquire_raw().await?;
        self.owner.set(Some(me));
        self.count.set(1);
        Ok(())
    }

    pub async fn release(&self) -> Result<(), Error> {
        let me = current_task_id().await?;
        if self.owner.get() != Some(me) {
            return Err(Error::Misuse(
                "recursive lock released by a task that does not own it",
            ));
        }
        let remaining = self.count.get() - 1;
        self.count.set(remaining);
        if remaining == 0 {
            self.owner.set(None);
            self.lock.release_raw();
        }
        Ok(())
    }
}

/// Counting semaphore. `acquire` suspends while the count is zero;
/// releasing hands the permit straight to the next waiter.
#[derive(Debug)]
pub struct Semaphore {
    value: Cell<usize>,
    waiting: WaitQueue,
}

impl Semaphore {
    pub fn new(value: usize) -> Self {
        Self {
            value: Cell::new(value),
            waiting: WaitQueue::new(),
        }
    }

    pub fn value(&self) -> usize {
        self.value.get()
    }

    pub async fn acquire(&self) -> Result<SemaphoreGuard<'_>, Error> {
        if self.value.get() == 0 {
            // Handoff: the releaser skipped the increment for us.
            scheduler_wait(&self.waiting, "SEMA_ACQUIRE").await?;
        } else {
            self.value.set(self.value.get() - 1);
        }
        Ok(SemaphoreGuard { sema: self })
    }

    fn release_raw(&self) {
        if self.waiting.is_empty() {
            self.value.set(self.value.get() + 1);
        } else {
            let _ = scheduler_wake(&self.waiting, 1);
        }
    }
}

/// Holds one semaphore permit; returns it on drop.
#[derive(Debug)]
pub struct SemaphoreGuard<'a> {
    sema: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.sema.release_raw();
    }
}

/// Condition variable bound to its own internal [`Lock`].
///
/// `wait` atomically releases the lock and suspends, then reacquires on
/// wakeup — also on cancellation, so the caller always gets the lock back
/// before seeing the error's effect on its own state.
#[derive(Debug, Default)]
pub struct Condition {
    lock: Lock,
    waiting: WaitQueue,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> Result<LockGuard<'_>, Error> {
        self.lock.acquire().await
    }

    pub fn locked(&self) -> bool {
        self.lock.locked()
    }

    fn check_guard(&self, guard: &LockGuard<'_>) -> Result<(), Error> {
        if std::ptr::eq(guard.lock, &self.lock) {
            Ok(())
        } else {
            Err(Error::Misuse(
                "condition used with a guard from a different lock",
            ))
        }
    }

    /// Release the lock, wait to be notified, reacquire.
    pub async fn wait<'a>(&'a self, guard: LockGuard<'a>) -> Result<LockGuard<'a>, Error> {
        self.check_guard(&guard)?;
        drop(guard);
        let waited = scheduler_wait(&self.waiting, "COND_WAIT").await;
        let reacquired = self.lock.acquire().await?;
        waited?;
        Ok(reacquired)
    }

    /// Wait until `pred` holds, re-checking after every notification.
    pub async fn wait_for<'a, P>(
        &'a self,
        mut guard: LockGuard<'a>,
        mut pred: P,
    ) -> Result<LockGuard<'a>, Error>
    where
        P: FnMut() -> bool,
    {
        loop {
            if pred() {
                return Ok(guard);
            }
            guard = self.wait(guard).await?;
        }
    }

    /// Wake up to `n` waiters. The caller must hold the condition's lock.
    pub fn notify(&self, guard: &LockGuard<'_>, n: usize) -> Result<usize, Error> {
        self.check_guard(guard)?;
        scheduler_wake(&self.waiting, n)
    }

    pub fn notify_all(&self, guard: &LockGuard<'_>) -> Result<usize, Error> {
        self.notify(guard, usize::MAX)
    }
}
