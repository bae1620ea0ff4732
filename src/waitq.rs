//! The uniform rendezvous primitive.
//!
//! A `WaitQueue` is a handle to a kernel-owned FIFO of suspended tasks.
//! Everything that parks tasks — locks, events, semaphores, conditions,
//! queues, task joining — goes through one of these. The handle is just a
//! process-unique id; the queue itself materializes in whichever kernel
//! first parks a task on it, and the id is never reused, so a stale handle
//! can at worst address an empty queue.

use crate::context::try_with_core;
use std::sync::atomic::{AtomicU64, Ordering};

/// Allocate a process-unique wait-queue id. Also used by the kernel for
/// internal queues (per-task joiners, group completion).
pub(crate) fn alloc_queue_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

pub struct WaitQueue {
    id: u64,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            id: alloc_queue_id(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Number of tasks currently suspended on this queue (0 outside a
    /// running kernel).
    pub fn len(&self) -> usize {
        try_with_core(|core| core.queue_len(self.id)).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitQueue {
    fn drop(&mut self) {
        // Waiters stranded on a dropped queue are resumed with an error
        // rather than parked forever.
        try_with_core(|core| core.queue_drop(self.id));
    }
}

impl std::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitQueue")
            .field("id", &self.id)
            .field("waiters", &self.len())
            .finish()
    }
}
