//! The kernel: construction, the run loop, and shutdown.
//!
//! One kernel drives one OS thread. `run` drives a root coroutine to
//! completion while multiplexing every other spawned task; repeated `run`
//! calls on the same kernel amortise setup and keep leftover tasks alive
//! between calls. `close` cancels everything that remains.

use crate::activation::Activation;
use crate::context::CoreGuard;
use crate::errors::{Cancellation, Error};
use crate::task::{JoinHandle, TaskId, TaskOpts};
use crate::trap;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::task::{Context, Poll};

pub(crate) mod core;
use self::core::{Core, Phase};

#[cfg(test)]
mod tests;

// Tracks whether a kernel run loop is active on this thread: running a
// kernel from inside a task (or two kernels at once) is an error.
thread_local! {
    static IS_KERNEL_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

struct ActiveGuard;

impl ActiveGuard {
    fn enter() -> Result<Self, Error> {
        IS_KERNEL_ACTIVE.with(|active| {
            if active.get() {
                Err(Error::Misuse(
                    "a kernel is already running on this thread",
                ))
            } else {
                active.set(true);
                Ok(ActiveGuard)
            }
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        IS_KERNEL_ACTIVE.with(|active| active.set(false));
    }
}

/// Configures and builds a [`Kernel`].
#[derive(Default)]
pub struct Builder {
    activations: Vec<Box<dyn Activation>>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Attach a scheduler activation: an observer invoked at task
    /// lifecycle transitions. Activations must not block the kernel.
    pub fn activation(mut self, activation: Box<dyn Activation>) -> Self {
        self.activations.push(activation);
        self
    }

    /// Creates the configured `Kernel`, ready to spawn and run tasks.
    pub fn try_build(self) -> anyhow::Result<Kernel> {
        let core = Core::new()?;
        let mut kernel = Kernel {
            core: Rc::new(RefCell::new(core)),
            activations: self.activations,
        };
        for activation in &mut kernel.activations {
            activation.activated();
        }
        Ok(kernel)
    }
}

/// A single-threaded cooperative task kernel.
///
/// Not `Send`: a kernel binds to the thread that runs it by construction
/// (its state is `Rc`-shared with the tasks it polls).
pub struct Kernel {
    core: Rc<RefCell<Core>>,
    activations: Vec<Box<dyn Activation>>,
}

impl Kernel {
    pub fn new() -> anyhow::Result<Kernel> {
        Builder::new().try_build()
    }

    /// Spawn a task onto the kernel without running it yet; it first runs
    /// inside the next `run` call.
    pub fn spawn<F, T>(&mut self, coro: F) -> JoinHandle<T>
    where
        F: Future<Output = Result<T, Error>> + 'static,
        T: 'static,
    {
        let id = self
            .core
            .borrow_mut()
            .spawn_erased(trap::erase(coro), TaskOpts::empty());
        JoinHandle::new(id)
    }

    /// Drive `coro` to completion, returning its value or its error.
    ///
    /// Other (previously spawned or newly spawned) tasks are multiplexed
    /// alongside it; tasks still alive when the root completes stay parked
    /// until the next `run` or `close`.
    pub fn run<F, T>(&mut self, coro: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>> + 'static,
        T: 'static,
    {
        let _active = ActiveGuard::enter()?;
        let _ctx = CoreGuard::enter(self.core.clone());

        let root = self
            .core
            .borrow_mut()
            .spawn_erased(trap::erase(coro), TaskOpts::empty());
        self.flush_activations();

        self.drive_until(|core| core.task_terminated(root))?;

        let result = self.core.borrow_mut().take_result(root)?;
        self.flush_activations();
        match result {
            Ok(boxed) => Ok(*boxed
                .downcast::<T>()
                .expect("root task produced a result of the wrong type")),
            Err(e) => Err(e),
        }
    }

    /// Cancel all remaining tasks and wait for them to terminate.
    ///
    /// Tasks that can never observe the cancellation (parked on a foreign
    /// future with nothing left to wake them) are dropped outright.
    pub fn close(&mut self) -> Result<(), Error> {
        let _active = ActiveGuard::enter()?;
        let _ctx = CoreGuard::enter(self.core.clone());

        loop {
            let live = self.core.borrow().live_task_ids();
            if live.is_empty() {
                self.flush_activations();
                return Ok(());
            }
            {
                let mut core = self.core.borrow_mut();
                for id in live {
                    let _ = core.request_cancel(id, Cancellation::Cancelled);
                }
            }
            self.drain_ready();
            if self.core.borrow().live_task_ids().is_empty() {
                self.flush_activations();
                return Ok(());
            }
            // With no timer and no fd able to wake the stragglers, the
            // remaining tasks are unreachable; drop them.
            let can_block = self.core.borrow_mut().can_block();
            if can_block {
                self.core.borrow_mut().poll_events()?;
                self.flush_activations();
            } else {
                self.core.borrow_mut().force_terminate_live();
                self.flush_activations();
                return Ok(());
            }
        }
    }

    fn drive_until(&mut self, done: impl Fn(&Core) -> bool) -> Result<(), Error> {
        loop {
            self.drain_ready();
            if done(&self.core.borrow()) {
                return Ok(());
            }
            self.core.borrow_mut().poll_events()?;
            self.flush_activations();
        }
    }

    fn drain_ready(&mut self) {
        loop {
            let next = self.core.borrow_mut().next_ready();
            match next {
                Some(id) => self.dispatch(id),
                None => break,
            }
        }
    }

    /// Advance one task by a single step: poll it until its next trap (or
    /// termination), then execute the trap's effect.
    fn dispatch(&mut self, id: TaskId) {
        let Some((mut coro, waker)) = self.core.borrow_mut().begin_dispatch(id) else {
            return;
        };
        self.flush_activations();

        // The core borrow is released here: the task's poll re-enters the
        // kernel through the thread-local context for every trap.
        let mut cx = Context::from_waker(&waker);
        let poll = coro.as_mut().poll(&mut cx);

        let coro_back = match &poll {
            Poll::Pending => Some(coro),
            Poll::Ready(_) => None,
        };
        self.core.borrow_mut().finish_dispatch(id, poll, coro_back);
        self.flush_activations();
    }

    fn flush_activations(&mut self) {
        // Deferred drops of reaped user payloads run here, outside the
        // core borrow, where their Drop impls may legally re-enter the
        // kernel.
        let graveyard = std::mem::take(&mut self.core.borrow_mut().graveyard);
        drop(graveyard);

        if self.activations.is_empty() {
            self.core.borrow_mut().events.clear();
            return;
        }
        let events = std::mem::take(&mut self.core.borrow_mut().events);
        for (phase, info) in events {
            for activation in &mut self.activations {
                let outcome = catch_unwind(AssertUnwindSafe(|| match phase {
                    Phase::Created => activation.created(&info),
                    Phase::Running => activation.running(&info),
                    Phase::Suspended => activation.suspended(&info),
                    Phase::Terminated => activation.terminated(&info),
                }));
                if outcome.is_err() {
                    tracing::error!(task = %info.id, ?phase, "scheduler activation panicked");
                }
            }
        }
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if !self.core.borrow().live_task_ids().is_empty() {
            let _ = self.close();
        }
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("core", &self.core.borrow())
            .field("activations", &self.activations.len())
            .finish()
    }
}

/// Build a fresh kernel, drive `coro` to completion on it, and tear the
/// kernel down again. The one-shot entry point.
pub fn run<F, T>(coro: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>> + 'static,
    T: 'static,
{
    let mut kernel = Builder::new().try_build().map_err(Error::Other)?;
    let result = kernel.run(coro);
    let _ = kernel.close();
    result
}
