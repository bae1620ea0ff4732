//! Queues for passing items between tasks — and, for
//! [`UniversalQueue`], between tasks and foreign OS threads.
//!
//! The task-side queues share one engine, [`QueueCore`], parameterized by
//! a storage [`Discipline`]: FIFO, LIFO or priority order. Two wait
//! queues (getters and putters) plus an unfinished-item counter provide
//! the blocking `get`/`put`/`join` protocol.

use crate::errors::Error;
use crate::trap::{future_wait, scheduler_wait, scheduler_wake};
use crate::waitq::WaitQueue;
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::io::Write;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Storage discipline of a [`QueueCore`]: the order items come back out.
pub trait Discipline<T>: Default {
    fn push(&mut self, item: T);
    fn pop(&mut self) -> Option<T>;
    fn len(&self) -> usize;
}

/// First in, first out.
pub struct Fifo<T>(VecDeque<T>);

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self(VecDeque::new())
    }
}

impl<T> Discipline<T> for Fifo<T> {
    fn push(&mut self, item: T) {
        self.0.push_back(item);
    }
    fn pop(&mut self) -> Option<T> {
        self.0.pop_front()
    }
    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Last in, first out.
pub struct Lifo<T>(Vec<T>);

impl<T> Default for Lifo<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> Discipline<T> for Lifo<T> {
    fn push(&mut self, item: T) {
        self.0.push(item);
    }
    fn pop(&mut self) -> Option<T> {
        self.0.pop()
    }
    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Smallest item first.
pub struct Priority<T: Ord>(BinaryHeap<Reverse<T>>);

impl<T: Ord> Default for Priority<T> {
    fn default() -> Self {
        Self(BinaryHeap::new())
    }
}

impl<T: Ord> Discipline<T> for Priority<T> {
    fn push(&mut self, item: T) {
        self.0.push(Reverse(item));
    }
    fn pop(&mut self) -> Option<T> {
        self.0.pop().map(|Reverse(item)| item)
    }
    fn len(&self) -> usize {
        self.0.len()
    }
}

pub type Queue<T> = QueueCore<T, Fifo<T>>;
pub type LifoQueue<T> = QueueCore<T, Lifo<T>>;
pub type PriorityQueue<T> = QueueCore<T, Priority<T>>;

/// Task-side queue engine. Not thread safe; see [`UniversalQueue`] for
/// crossing threads.
pub struct QueueCore<T, D: Discipline<T>> {
    storage: RefCell<D>,
    maxsize: usize,
    getters: WaitQueue,
    putters: WaitQueue,
    unfinished: Cell<usize>,
    all_done: WaitQueue,
    _marker: PhantomData<T>,
}

impl<T, D: Discipline<T>> QueueCore<T, D> {
    /// An unbounded queue.
    pub fn new() -> Self {
        Self::with_maxsize(0)
    }

    /// A bounded queue; `put` suspends while `maxsize` items are stored.
    /// A `maxsize` of zero means unbounded.
    pub fn with_maxsize(maxsize: usize) -> Self {
        Self {
            storage: RefCell::new(D::default()),
            maxsize,
            getters: WaitQueue::new(),
            putters: WaitQueue::new(),
            unfinished: Cell::new(0),
            all_done: WaitQueue::new(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.storage.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.maxsize > 0 && self.len() >= self.maxsize
    }

    /// Remove and return an item, suspending while the queue is empty.
    pub async fn get(&self) -> Result<T, Error> {
        loop {
            let item = self.storage.borrow_mut().pop();
            if let Some(item) = item {
                if !self.putters.is_empty() {
                    scheduler_wake(&self.putters, 1)?;
                }
                return Ok(item);
            }
            scheduler_wait(&self.getters, "QUEUE_GET").await?;
        }
    }

    /// Add an item, suspending while a bounded queue is full.
    pub async fn put(&self, item: T) -> Result<(), Error> {
        while self.is_full() {
            scheduler_wait(&self.putters, "QUEUE_PUT").await?;
        }
        self.storage.borrow_mut().push(item);
        self.unfinished.set(self.unfinished.get() + 1);
        if !self.getters.is_empty() {
            scheduler_wake(&self.getters, 1)?;
        }
        Ok(())
    }

    /// Mark one previously fetched item as processed.
    pub fn task_done(&self) -> Result<(), Error> {
        let unfinished = self.unfinished.get();
        if unfinished == 0 {
            return Err(Error::Misuse(
                "task_done called more times than items were put",
            ));
        }
        self.unfinished.set(unfinished - 1);
        if unfinished == 1 && !self.all_done.is_empty() {
            scheduler_wake(&self.all_done, usize::MAX)?;
        }
        Ok(())
    }

    /// Wait until every item ever put has been marked done.
    pub async fn join(&self) -> Result<(), Error> {
        while self.unfinished.get() > 0 {
            scheduler_wait(&self.all_done, "QUEUE_JOIN").await?;
        }
        Ok(())
    }
}

impl<T, D: Discipline<T>> Default for QueueCore<T, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, D: Discipline<T>> std::fmt::Debug for QueueCore<T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.len())
            .field("maxsize", &self.maxsize)
            .field("unfinished", &self.unfinished.get())
            .finish()
    }
}

// ---------------------------------------------------------------------
// UniversalQueue
// ---------------------------------------------------------------------

struct UqState<T> {
    items: VecDeque<T>,
    maxsize: usize,
    unfinished: usize,
    getter_wakers: VecDeque<Waker>,
    putter_wakers: VecDeque<Waker>,
    done_wakers: Vec<Waker>,
    /// `with_fd` loopback: one sentinel byte per put.
    wake_tx: Option<UnixStream>,
}

struct UqInner<T> {
    state: Mutex<UqState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    all_done: Condvar,
    /// Read half of the `with_fd` loopback, for foreign event loops.
    wake_rx: Option<UnixStream>,
}

impl<T> UqInner<T> {
    fn item_added(&self, state: &mut UqState<T>) {
        if let Some(waker) = state.getter_wakers.pop_front() {
            waker.wake();
        }
        self.not_empty.notify_one();
        if let Some(tx) = &state.wake_tx {
            // A full loopback already carries a pending sentinel.
            let _ = (&*tx).write(&[1u8]);
        }
    }

    fn slot_freed(&self, state: &mut UqState<T>) {
        if let Some(waker) = state.putter_wakers.pop_front() {
            waker.wake();
        }
        self.not_full.notify_one();
    }

    fn is_full(state: &UqState<T>) -> bool {
        state.maxsize > 0 && state.items.len() >= state.maxsize
    }
}

/// A queue usable from tasks *and* from foreign OS threads.
///
/// The thread side blocks on a mutex/condvar pair; the task side suspends
/// through [`future_wait`] and is woken via the task's kernel waker, so a
/// thread-side `put_sync` wakes a kernel blocked in its selector. Clones
/// share the queue.
pub struct UniversalQueue<T> {
    inner: Arc<UqInner<T>>,
}

impl<T> UniversalQueue<T> {
    pub fn new() -> Self {
        Self::with_maxsize(0)
    }

    pub fn with_maxsize(maxsize: usize) -> Self {
        Self::build(maxsize, None, None)
    }

    /// A queue with a loopback fd: every put writes a sentinel byte, so a
    /// foreign event loop can poll [`wake_fd`](Self::wake_fd) for
    /// activity.
    pub fn with_fd() -> Result<Self, Error> {
        let (rx, tx) = UnixStream::pair()?;
        rx.set_nonblocking(true)?;
        tx.set_nonblocking(true)?;
        Ok(Self::build(0, Some(tx), Some(rx)))
    }

    fn build(maxsize: usize, wake_tx: Option<UnixStream>, wake_rx: Option<UnixStream>) -> Self {
        Self {
            inner: Arc::new(UqInner {
                state: Mutex::new(UqState {
                    items: VecDeque::new(),
                    maxsize,
                    unfinished: 0,
                    getter_wakers: VecDeque::new(),
                    putter_wakers: VecDeque::new(),
                    done_wakers: Vec::new(),
                    wake_tx,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                all_done: Condvar::new(),
                wake_rx,
            }),
        }
    }

    /// The readable loopback fd, when built with [`with_fd`](Self::with_fd).
    pub fn wake_fd(&self) -> Option<RawFd> {
        self.inner.wake_rx.as_ref().map(|rx| rx.as_raw_fd())
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Thread-side put: blocks the calling OS thread while the queue is
    /// full. Never call from inside a kernel.
    pub fn put_sync(&self, item: T) {
        let mut state = self.inner.state.lock();
        while UqInner::is_full(&state) {
            self.inner.not_full.wait(&mut state);
        }
        state.items.push_back(item);
        state.unfinished += 1;
        self.inner.item_added(&mut state);
    }

    /// Thread-side get: blocks the calling OS thread while the queue is
    /// empty.
    pub fn get_sync(&self) -> T {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.inner.slot_freed(&mut state);
                return item;
            }
            self.inner.not_empty.wait(&mut state);
        }
    }

    /// Task-side put; a cancellation point.
    pub async fn put(&self, item: T) -> Result<(), Error> {
        future_wait(UqPut {
            inner: &self.inner,
            item: Some(item),
        })
        .await
    }

    /// Task-side get; a cancellation point.
    pub async fn get(&self) -> Result<T, Error> {
        future_wait(UqGet { inner: &self.inner }).await
    }

    /// Mark one previously fetched item as processed. Usable from both
    /// sides.
    pub fn task_done(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        if state.unfinished == 0 {
            return Err(Error::Misuse(
                "task_done called more times than items were put",
            ));
        }
        state.unfinished -= 1;
        if state.unfinished == 0 {
            for waker in state.done_wakers.drain(..) {
                waker.wake();
            }
            self.inner.all_done.notify_all();
        }
        Ok(())
    }

    /// Task-side join: wait until every item ever put has been marked done.
    pub async fn join(&self) -> Result<(), Error> {
        future_wait(UqJoin { inner: &self.inner }).await
    }

    /// Thread-side join.
    pub fn join_sync(&self) {
        let mut state = self.inner.state.lock();
        while state.unfinished > 0 {
            self.inner.all_done.wait(&mut state);
        }
    }
}

impl<T> Clone for UniversalQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for UniversalQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for UniversalQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniversalQueue")
            .field("len", &self.len())
            .finish()
    }
}

struct UqGet<'a, T> {
    inner: &'a Arc<UqInner<T>>,
}

impl<T> Future for UqGet<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock();
        if let Some(item) = state.items.pop_front() {
            self.inner.slot_freed(&mut state);
            Poll::Ready(item)
        } else {
            state.getter_wakers.push_back(cx.waker().clone());
            Poll::Pending
        }
    }
}

struct UqPut<'a, T> {
    inner: &'a Arc<UqInner<T>>,
    item: Option<T>,
}

// Sound: the future is not self-referential; `item` is only moved out,
// never pinned.
impl<T> Unpin for UqPut<'_, T> {}

impl<T> Future for UqPut<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.inner.state.lock();
        if UqInner::is_full(&state) {
            state.putter_wakers.push_back(cx.waker().clone());
            Poll::Pending
        } else {
            let item = this.item.take().expect("queue put polled after completion");
            state.items.push_back(item);
            state.unfinished += 1;
            this.inner.item_added(&mut state);
            Poll::Ready(())
        }
    }
}

struct UqJoin<'a, T> {
    inner: &'a Arc<UqInner<T>>,
}

impl<T> Future for UqJoin<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock();
        if state.unfinished == 0 {
            Poll::Ready(())
        } else {
            state.done_wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::run;
    use crate::trap::{schedule, spawn};
    use rstest::rstest;
    use static_assertions::assert_impl_all;
    use std::rc::Rc;

    assert_impl_all!(UniversalQueue<u32>: Send, Sync, Clone);

    #[test]
    fn test_fifo_order() -> Result<(), Error> {
        run(async {
            let q: Queue<u32> = Queue::new();
            for n in [1, 2, 3] {
                q.put(n).await?;
            }
            assert_eq!(q.get().await?, 1);
            assert_eq!(q.get().await?, 2);
            assert_eq!(q.get().await?, 3);
            Ok(())
        })
    }

    #[test]
    fn test_lifo_order() -> Result<(), Error> {
        run(async {
            let q: LifoQueue<u32> = LifoQueue::new();
            for n in [1, 2, 3] {
                q.put(n).await?;
            }
            assert_eq!(q.get().await?, 3);
            assert_eq!(q.get().await?, 2);
            assert_eq!(q.get().await?, 1);
            Ok(())
        })
    }

    #[test]
    fn test_priority_order_smallest_first() -> Result<(), Error> {
        run(async {
            let q: PriorityQueue<u32> = PriorityQueue::new();
            for n in [5, 1, 3] {
                q.put(n).await?;
            }
            assert_eq!(q.get().await?, 1);
            assert_eq!(q.get().await?, 3);
            assert_eq!(q.get().await?, 5);
            Ok(())
        })
    }

    #[test]
    fn test_get_suspends_until_put() -> Result<(), Error> {
        run(async {
            let q = Rc::new(Queue::<&'static str>::new());
            let getter = {
                let q = q.clone();
                spawn(async move { q.get().await }).await?
            };
            schedule().await?;
            assert!(!getter.is_terminated());

            q.put("hello").await?;
            assert_eq!(getter.join().await?, "hello");
            Ok(())
        })
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    fn test_bounded_put_suspends_when_full(#[case] maxsize: usize) -> Result<(), Error> {
        run(async move {
            let q = Rc::new(Queue::<u32>::with_maxsize(maxsize));
            for n in 0..maxsize as u32 {
                q.put(n).await?;
            }
            assert!(q.is_full());

            let putter = {
                let q = q.clone();
                spawn(async move { q.put(99).await }).await?
            };
            schedule().await?;
            assert!(!putter.is_terminated());

            assert_eq!(q.get().await?, 0);
            putter.join().await?;
            Ok(())
        })
    }

    #[test]
    fn test_join_waits_for_task_done() -> Result<(), Error> {
        run(async {
            let q = Rc::new(Queue::<u32>::new());
            q.put(1).await?;
            q.put(2).await?;

            let joiner = {
                let q = q.clone();
                spawn(async move {
                    q.join().await?;
                    Ok(true)
                })
                .await?
            };
            schedule().await?;
            assert!(!joiner.is_terminated());

            for _ in 0..2 {
                q.get().await?;
                q.task_done()?;
            }
            assert!(joiner.join().await?);
            Ok(())
        })
    }

    #[test]
    fn test_universal_queue_thread_to_task() -> Result<(), Error> {
        let q: UniversalQueue<u32> = UniversalQueue::new();
        let producer = {
            let q = q.clone();
            std::thread::spawn(move || {
                for n in 0..3 {
                    q.put_sync(n);
                    std::thread::sleep(std::time::Duration::from_millis(2));
                }
            })
        };

        let got = run(async move {
            let mut got = Vec::new();
            for _ in 0..3 {
                got.push(q.get().await?);
            }
            Ok(got)
        })?;

        producer.join().expect("producer thread panicked");
        assert_eq!(got, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_universal_queue_task_to_thread() -> Result<(), Error> {
        let q: UniversalQueue<u32> = UniversalQueue::new();
        let consumer = {
            let q = q.clone();
            std::thread::spawn(move || (0..3).map(|_| q.get_sync()).sum::<u32>())
        };

        run(async move {
            for n in [10, 20, 30] {
                q.put(n).await?;
            }
            Ok(())
        })?;

        assert_eq!(consumer.join().expect("consumer thread panicked"), 60);
        Ok(())
    }

    #[test]
    fn test_universal_queue_with_fd_writes_sentinels() -> Result<(), Error> {
        use std::io::Read;

        let q: UniversalQueue<u32> = UniversalQueue::with_fd()?;
        let fd = q.wake_fd().expect("loopback fd missing");
        assert!(fd >= 0);

        q.put_sync(1);
        q.put_sync(2);

        let mut rx = q.inner.wake_rx.as_ref().expect("read half missing");
        let mut buf = [0u8; 8];
        let n = rx.read(&mut buf).expect("sentinel bytes missing");
        assert!(n >= 1);
        Ok(())
    }
}
