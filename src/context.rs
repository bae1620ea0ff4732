//! Thread-local binding between the running kernel and the tasks it polls.
//!
//! Trap functions execute inside a task's `poll`, which itself executes
//! inside the kernel's run loop; the only channel between the two is this
//! thread-local slot. The run loop installs the kernel core for the
//! duration of `run`/`close` via a scoped guard so the slot is cleared
//! even on an exceptional exit.

use crate::errors::Error;
use crate::kernel::core::Core;
use std::cell::RefCell;
use std::rc::Rc;

thread_local! {
    static CURRENT: RefCell<Option<Rc<RefCell<Core>>>> = const { RefCell::new(None) };
}

/// Run `f` against the kernel core bound to this thread.
///
/// Fails with [`Error::NoKernel`] outside a running kernel. The borrow is
/// exclusive and must not be held across user code; every caller does its
/// work and returns.
pub(crate) fn with_core<R>(f: impl FnOnce(&mut Core) -> R) -> Result<R, Error> {
    CURRENT.with(|slot| {
        let slot = slot.borrow();
        let core = slot.as_ref().ok_or(Error::NoKernel)?;
        let result = f(&mut core.borrow_mut());
        Ok(result)
    })
}

/// Like [`with_core`] but quiet about a missing kernel. For `Drop` impls
/// of user-held objects, which may outlive the kernel.
pub(crate) fn try_with_core<R>(f: impl FnOnce(&mut Core) -> R) -> Option<R> {
    with_core(f).ok()
}

/// Installs `core` as the thread's kernel for the guard's lifetime.
pub(crate) struct CoreGuard;

impl CoreGuard {
    pub(crate) fn enter(core: Rc<RefCell<Core>>) -> Self {
        CURRENT.with(|slot| {
            let prev = slot.borrow_mut().replace(core);
            debug_assert!(prev.is_none(), "kernel context installed twice");
        });
        CoreGuard
    }
}

impl Drop for CoreGuard {
    fn drop(&mut self) {
        CURRENT.with(|slot| slot.borrow_mut().take());
    }
}
