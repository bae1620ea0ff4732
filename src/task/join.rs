//! Typed handles to spawned tasks.

use crate::context::{try_with_core, with_core};
use crate::errors::{Cancellation, Error};
use crate::task::TaskId;
use crate::trap;
use std::marker::PhantomData;

/// An owned permission to join on a task: await its termination and
/// collect its result.
///
/// The task starts running as soon as the spawner suspends, whether or
/// not the handle is ever used. Dropping the handle *detaches* the task:
/// it keeps running, and its result is discarded on termination.
pub struct JoinHandle<T> {
    id: TaskId,
    consumed: bool,
    _marker: PhantomData<T>,
}

impl<T: 'static> JoinHandle<T> {
    pub(crate) fn new(id: TaskId) -> Self {
        Self {
            id,
            consumed: false,
            _marker: PhantomData,
        }
    }

    /// The id of the task this handle refers to.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the task has terminated (true also after the result has
    /// been collected).
    pub fn is_terminated(&self) -> bool {
        try_with_core(|core| core.task_terminated(self.id)).unwrap_or(false)
    }

    /// Whether the task terminated due to a cancellation.
    pub fn is_cancelled(&self) -> bool {
        try_with_core(|core| core.task_cancelled(self.id)).unwrap_or(false)
    }

    /// Consume the handle without detaching the task; the result then
    /// belongs to whoever holds the id (used by task groups).
    pub(crate) fn into_raw(mut self) -> TaskId {
        self.consumed = true;
        self.id
    }

    /// The task's stored result: `Ok` with its value, or `Err` with the
    /// error it terminated with. The outer layer carries failures of the
    /// retrieval itself (e.g. [`Error::NotTerminated`]).
    fn collect(mut self) -> Result<Result<T, Error>, Error> {
        self.consumed = true;
        let result = with_core(|core| core.take_result(self.id))??;
        Ok(result.map(|boxed| {
            *boxed
                .downcast::<T>()
                .expect("task result type does not match its JoinHandle")
        }))
    }

    /// Wait for the task to terminate and return its value. A task that
    /// failed surfaces as [`Error::TaskFailed`] with the original error as
    /// the source.
    pub async fn join(self) -> Result<T, Error> {
        trap::join_task(self.id).await?;
        match self.collect()? {
            Ok(value) => Ok(value),
            Err(cause) => Err(Error::TaskFailed(Box::new(cause))),
        }
    }

    /// The task's result, re-raising its error directly (no wrapper).
    /// Fails with [`Error::NotTerminated`] while the task is running.
    pub fn result(self) -> Result<T, Error> {
        self.collect()?
    }

    /// Cancel the task and wait for it to actually terminate.
    ///
    /// Returns false if the task had already terminated. A cancellation
    /// that overlaps an earlier one joins it: both callers wait, one
    /// delivery happens.
    pub async fn cancel(&self) -> Result<bool, Error> {
        let live = with_core(|core| core.request_cancel(self.id, Cancellation::Cancelled))??;
        if !live {
            return Ok(false);
        }
        trap::join_task(self.id).await?;
        Ok(true)
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if !self.consumed {
            try_with_core(|core| core.release_handle(self.id));
        }
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle").field("id", &self.id).finish()
    }
}
