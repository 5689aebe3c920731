use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

/// Why a blocking pop failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    Empty,
    Aborted,
}

/// Why a push failed. The rejected value is handed back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    Full(T),
    Aborted(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(v) | PushError::Aborted(v) => v,
        }
    }
}

/// Thread-safe, capacity-bounded FIFO shared by every pipeline stage.
///
/// Blocking `push`/`pop` park on condvars until there is room/an item, or
/// until `abort` is called. `abort` is idempotent and wakes all current and
/// future waiters, which observe a distinguishable aborted outcome instead
/// of unwinding. Under multiple producers/consumers each item is delivered
/// exactly once to exactly one consumer; strict FIFO holds for a single
/// producer/consumer pair.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    aborted: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> BoundedQueue<T> {
        assert!(capacity >= 1, "queue capacity must be at least 1");
        BoundedQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                capacity,
                aborted: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Blocks while the queue is full. Returns the value on abort.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.aborted {
                return Err(value);
            }
            if inner.items.len() < inner.capacity {
                inner.items.push_back(value);
                drop(inner);
                self.not_empty.notify_one();
                return Ok(());
            }
            inner = self.not_full.wait(inner).unwrap();
        }
    }

    /// Blocks while the queue is empty.
    pub fn pop(&self) -> Result<T, PopError> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(value) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Ok(value);
            }
            if inner.aborted {
                return Err(PopError::Aborted);
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Never blocks, not even for a scheduler quantum.
    pub fn try_push(&self, value: T) -> Result<(), PushError<T>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.aborted {
            return Err(PushError::Aborted(value));
        }
        if inner.items.len() >= inner.capacity {
            return Err(PushError::Full(value));
        }
        inner.items.push_back(value);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Never blocks.
    pub fn try_pop(&self) -> Result<T, PopError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.items.pop_front() {
            Some(value) => {
                drop(inner);
                self.not_full.notify_one();
                Ok(value)
            }
            None if inner.aborted => Err(PopError::Aborted),
            None => Err(PopError::Empty),
        }
    }

    /// Polls `try_push` every `poll_interval` until `timeout` elapses.
    pub fn try_push_for(
        &self,
        mut value: T,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), PushError<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_push(value) {
                Ok(()) => return Ok(()),
                Err(PushError::Aborted(v)) => return Err(PushError::Aborted(v)),
                Err(PushError::Full(v)) => {
                    if Instant::now() >= deadline {
                        return Err(PushError::Full(v));
                    }
                    value = v;
                }
            }
            std::thread::sleep(poll_interval.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// Polls `try_pop` every `poll_interval` until `timeout` elapses.
    pub fn try_pop_for(&self, timeout: Duration, poll_interval: Duration) -> Result<T, PopError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_pop() {
                Ok(value) => return Ok(value),
                Err(PopError::Aborted) => return Err(PopError::Aborted),
                Err(PopError::Empty) => {
                    if Instant::now() >= deadline {
                        return Err(PopError::Empty);
                    }
                }
            }
            std::thread::sleep(poll_interval.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// Wakes every waiter; all subsequent blocking calls return the aborted
    /// outcome immediately. Items already queued stay poppable via `pop`.
    pub fn abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.aborted = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().unwrap().aborted
    }

    /// Growing the capacity releases blocked producers. Shrinking below the
    /// current length keeps the queued items; producers block until the
    /// backlog drains under the new bound.
    pub fn set_capacity(&self, capacity: usize) {
        assert!(capacity >= 1, "queue capacity must be at least 1");
        let mut inner = self.inner.lock().unwrap();
        inner.capacity = capacity;
        drop(inner);
        self.not_full.notify_all();
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }
}
