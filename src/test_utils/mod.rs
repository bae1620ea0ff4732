//! Shared helpers for the test suites.

use crate::activation::{Activation, TaskInfo};
use crate::task::TaskId;
use std::cell::RefCell;
use std::rc::Rc;

/// A recorded activation callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Activated,
    Created(TaskId),
    Running(TaskId),
    Suspended(TaskId),
    Terminated(TaskId),
}

/// Shared recorder handed to a [`SpyActivation`]; the test keeps a clone
/// and inspects the call log after the kernel ran.
#[derive(Debug, Clone, Default)]
pub(crate) struct SpyState {
    calls: Rc<RefCell<Vec<Call>>>,
}

impl SpyState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub(crate) fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.borrow().iter().filter(|c| matches(c)).count()
    }
}

/// Activation that records every callback it receives.
pub(crate) struct SpyActivation {
    state: SpyState,
}

impl SpyActivation {
    pub(crate) fn new(state: SpyState) -> Self {
        Self { state }
    }
}

impl Activation for SpyActivation {
    fn activated(&mut self) {
        self.state.record(Call::Activated);
    }

    fn created(&mut self, task: &TaskInfo) {
        self.state.record(Call::Created(task.id));
    }

    fn running(&mut self, task: &TaskInfo) {
        self.state.record(Call::Running(task.id));
    }

    fn suspended(&mut self, task: &TaskInfo) {
        self.state.record(Call::Suspended(task.id));
    }

    fn terminated(&mut self, task: &TaskInfo) {
        self.state.record(Call::Terminated(task.id));
    }
}

/// Activation that panics on every task event; for checking that kernel
/// dispatch survives misbehaving observers.
pub(crate) struct PanickingActivation;

impl Activation for PanickingActivation {
    fn created(&mut self, _task: &TaskInfo) {
        panic!("activation failure");
    }

    fn terminated(&mut self, _task: &TaskInfo) {
        panic!("activation failure");
    }
}
