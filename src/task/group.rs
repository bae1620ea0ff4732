//! Structured concurrency: a supervisor over a dynamically-grown set of
//! child tasks.
//!
//! A group is created inside a running kernel, children are spawned into
//! it (or adopted with [`TaskGroup::add_task`]), and the owning task ends
//! the scope with [`TaskGroup::join`], which waits according to the wait
//! policy fixed at construction. After `join` returns, every child has
//! terminated; a child failure cancels its siblings and surfaces later,
//! on result access.
//!
//! `join().await` *is* the scope exit and must be called; dropping an
//! unjoined group is a safety net that cancels the remaining children
//! without waiting for them.

use crate::context::{try_with_core, with_core};
use crate::errors::{Cancellation, Error};
use crate::task::{JoinHandle, TaskId, TaskOpts};
use crate::trap::{self, erase};
use std::future::Future;

/// Wait policy of a [`TaskGroup`], fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// `join` waits for all children.
    All,
    /// `join` waits for the first child to terminate, then cancels the rest.
    Any,
    /// `join` waits for the first child producing a present (`Some`)
    /// value, then cancels the rest. Built with [`TaskGroup::object`].
    Object,
    /// `join` cancels all children immediately.
    None,
}

pub struct TaskGroup<T: 'static> {
    gid: u64,
    waitq: u64,
    wait: Wait,
    object_filter: Option<fn(&T) -> bool>,
    /// Children in spawn order; task ids are creation-ordered.
    children: Vec<TaskId>,
    /// Children seen by `next_done` so far.
    completed: usize,
    /// Results in completion order. `next_result` consumes entries, so
    /// this can be shorter than `completed`.
    collected: Vec<(TaskId, Result<T, Error>)>,
    winner: Option<TaskId>,
    first_error: Option<TaskId>,
    joined: bool,
}

impl<T: 'static> TaskGroup<T> {
    /// A group with the default `All` policy.
    pub fn new() -> Result<Self, Error> {
        Self::with_wait(Wait::All)
    }

    /// A group with an explicit wait policy.
    ///
    /// # Panics
    ///
    /// `Wait::Object` needs option-shaped children and its own
    /// constructor; passing it here panics.
    #[track_caller]
    pub fn with_wait(wait: Wait) -> Result<Self, Error> {
        assert!(
            wait != Wait::Object,
            "object-policy groups are built with TaskGroup::object()"
        );
        Self::build(wait, None)
    }

    fn build(wait: Wait, object_filter: Option<fn(&T) -> bool>) -> Result<Self, Error> {
        let (gid, waitq) = with_core(|core| core.group_create())?;
        Ok(Self {
            gid,
            waitq,
            wait,
            object_filter,
            children: Vec::new(),
            completed: 0,
            collected: Vec::new(),
            winner: None,
            first_error: None,
            joined: false,
        })
    }

    /// Spawn a child into the group.
    pub async fn spawn<F>(&mut self, coro: F) -> Result<TaskId, Error>
    where
        F: Future<Output = Result<T, Error>> + 'static,
    {
        if self.joined {
            return Err(Error::Misuse("task group already joined"));
        }
        let id = with_core(|core| core.spawn_erased(erase(coro), TaskOpts::empty()))?;
        with_core(|core| core.group_attach(self.gid, id))??;
        self.children.push(id);
        Ok(id)
    }

    /// Adopt an already spawned task as a child. A task belongs to at
    /// most one group.
    pub async fn add_task(&mut self, handle: JoinHandle<T>) -> Result<TaskId, Error> {
        if self.joined {
            return Err(Error::Misuse("task group already joined"));
        }
        let id = handle.into_raw();
        with_core(|core| core.group_attach(self.gid, id))??;
        self.children.push(id);
        Ok(id)
    }

    /// Ids of the children spawned so far, in creation order.
    pub fn children(&self) -> &[TaskId] {
        &self.children
    }

    /// The next child to terminate, in completion order; `None` once all
    /// children have been seen. The child's result is collected into the
    /// group as a side effect.
    pub async fn next_done(&mut self) -> Result<Option<TaskId>, Error> {
        if self.completed == self.children.len() {
            return Ok(None);
        }
        loop {
            if let Some(id) = with_core(|core| core.group_pop_done(self.gid))? {
                let result = self.fetch(id)?;
                self.completed += 1;
                self.collected.push((id, result));
                return Ok(Some(id));
            }
            trap::scheduler_wait_raw(self.waitq, "GROUP_NEXT").await?;
        }
    }

    /// The next completed child's value, unwrapped: a child error is
    /// re-raised here. `None` once all children have been seen.
    pub async fn next_result(&mut self) -> Result<Option<T>, Error> {
        match self.next_done().await? {
            None => Ok(None),
            Some(id) => {
                let idx = self
                    .collected
                    .iter()
                    .position(|(tid, _)| *tid == id)
                    .expect("completed child missing from collected results");
                let (_, result) = self.collected.remove(idx);
                result.map(Some)
            }
        }
    }

    fn fetch(&self, id: TaskId) -> Result<Result<T, Error>, Error> {
        let raw = with_core(|core| core.take_result(id))??;
        Ok(raw.map(|boxed| {
            *boxed
                .downcast::<T>()
                .expect("group child result type does not match the group")
        }))
    }

    fn entry(&self, id: TaskId) -> Option<&Result<T, Error>> {
        self.collected
            .iter()
            .find(|(tid, _)| *tid == id)
            .map(|(_, r)| r)
    }

    fn note_failure(&mut self, id: TaskId) -> bool {
        let failed = self
            .entry(id)
            .and_then(|r| r.as_ref().err())
            .is_some_and(|e| !e.is_cancellation());
        if failed && self.first_error.is_none() {
            self.first_error = Some(id);
        }
        failed
    }

    fn request_cancel_unseen(&self) -> Result<(), Error> {
        // Cancelling a child that actually terminated already (but has not
        // been seen by next_done yet) is a no-op in the kernel.
        let seen: Vec<TaskId> = self.collected.iter().map(|(id, _)| *id).collect();
        with_core(|core| {
            for id in &self.children {
                if !seen.contains(id) {
                    let _ = core.request_cancel(*id, Cancellation::Cancelled);
                }
            }
        })
    }

    /// Cancel all children that have not yet terminated and wait for them.
    pub async fn cancel_remaining(&mut self) -> Result<(), Error> {
        self.request_cancel_unseen()?;
        while self.next_done().await?.is_some() {}
        Ok(())
    }

    /// Wait for the group according to its policy. This is the scope
    /// exit: after it returns, every child has terminated. A child
    /// failure (non-cancellation) cancels the remaining children here and
    /// surfaces on [`result`](Self::result)/[`results`](Self::results).
    pub async fn join(&mut self) -> Result<(), Error> {
        if self.joined {
            return Err(Error::Misuse("task group already joined"));
        }
        self.joined = true;

        match self.wait {
            Wait::None => {
                self.cancel_remaining().await?;
            }
            Wait::All => {
                while let Some(id) = self.next_done().await? {
                    if self.note_failure(id) {
                        self.request_cancel_unseen()?;
                    }
                }
            }
            Wait::Any => {
                if let Some(id) = self.next_done().await? {
                    if !self.note_failure(id) {
                        self.winner = Some(id);
                    }
                }
                self.cancel_remaining().await?;
            }
            Wait::Object => {
                let filter = self
                    .object_filter
                    .expect("object-policy group without a filter");
                while let Some(id) = self.next_done().await? {
                    if self.note_failure(id) {
                        break;
                    }
                    if self.entry(id).and_then(|r| r.as_ref().ok()).is_some_and(filter) {
                        self.winner = Some(id);
                        break;
                    }
                }
                self.cancel_remaining().await?;
            }
        }
        Ok(())
    }

    fn take_entry(&mut self, id: TaskId) -> Result<T, Error> {
        let idx = self
            .collected
            .iter()
            .position(|(tid, _)| *tid == id)
            .expect("group bookkeeping lost a collected child");
        self.collected.remove(idx).1
    }

    /// The group's result under the `Any`/`Object` policies: the winning
    /// child's value, or the first child failure re-raised.
    pub fn result(mut self) -> Result<T, Error> {
        if let Some(id) = self.first_error {
            return self.take_entry(id);
        }
        match self.winner {
            Some(id) => self.take_entry(id),
            None => Err(Error::Misuse("group finished without producing a result")),
        }
    }

    /// All child values ordered by task id (creation order), or the first
    /// child failure re-raised.
    pub fn results(mut self) -> Result<Vec<T>, Error> {
        if let Some(id) = self.first_error {
            return Err(self.take_entry(id).err().unwrap_or(Error::Misuse(
                "group error bookkeeping pointed at a successful child",
            )));
        }
        self.collected.sort_by_key(|(id, _)| *id);
        self.collected
            .drain(..)
            .map(|(_, result)| result)
            .collect()
    }

    /// Whether the given child terminated due to cancellation.
    pub fn cancelled(&self, id: TaskId) -> bool {
        self.entry(id)
            .and_then(|r| r.as_ref().err())
            .is_some_and(|e| e.is_cancellation())
    }
}

impl<U: 'static> TaskGroup<Option<U>> {
    /// A group with the `Object` policy: `join` waits for the first child
    /// that produces `Some(..)`; children producing `None` are ignored.
    pub fn object() -> Result<Self, Error> {
        Self::build(Wait::Object, Some(|v: &Option<U>| v.is_some()))
    }
}

impl<T: 'static> Drop for TaskGroup<T> {
    fn drop(&mut self) {
        if !self.joined && self.completed < self.children.len() {
            tracing::warn!(
                group = self.gid,
                "task group dropped without join; cancelling remaining children"
            );
            let _ = self.request_cancel_unseen();
        }
        try_with_core(|core| core.group_drop(self.gid));
    }
}

impl<T: 'static> std::fmt::Debug for TaskGroup<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("id", &self.gid)
            .field("wait", &self.wait)
            .field("children", &self.children.len())
            .field("collected", &self.collected.len())
            .field("joined", &self.joined)
            .finish()
    }
}
