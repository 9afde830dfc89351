//! Bounded single-producer single-consumer ring.
//!
//! Lamport-style queue with locally cached indices: the producer caches the
//! consumer's tail and the consumer caches the producer's head, so the shared
//! atomics are touched only when the cached view runs out. Unlike a
//! `Copy`-only channel, slots hold `MaybeUninit<T>` and ownership moves
//! through the ring, so boxed work items can cross threads without locks.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Pad to a cache line so head and tail never share one.
#[repr(align(64))]
struct CachePadded<T>(T);

struct Inner<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Published by the producer.
    head: CachePadded<AtomicUsize>,
    /// Published by the consumer.
    tail: CachePadded<AtomicUsize>,
    tx_alive: AtomicBool,
    rx_alive: AtomicBool,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let mut buffer = Vec::with_capacity(capacity);
        buffer.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
        Self {
            buffer: buffer.into_boxed_slice(),
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
            tx_alive: AtomicBool::new(true),
            rx_alive: AtomicBool::new(true),
        }
    }
}

/// Error returned by [`Producer::try_send`], handing the value back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError<T> {
    /// The ring is full.
    Full(T),
    /// The consumer is gone.
    Disconnected(T),
}

impl<T> SendError<T> {
    /// Recover the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            SendError::Full(v) | SendError::Disconnected(v) => v,
        }
    }
}

impl<T> std::fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Full(_) => write!(f, "ring is full"),
            SendError::Disconnected(_) => write!(f, "consumer has disconnected"),
        }
    }
}

impl<T: std::fmt::Debug> std::error::Error for SendError<T> {}

/// Error returned by [`Consumer::try_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// The ring is empty.
    Empty,
    /// The producer is gone and the ring has been drained.
    Disconnected,
}

impl std::fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TryRecvError::Empty => write!(f, "ring is empty"),
            TryRecvError::Disconnected => write!(f, "producer has disconnected"),
        }
    }
}

impl std::error::Error for TryRecvError {}

/// Producing half of the ring.
pub struct Producer<T> {
    inner: Arc<Inner<T>>,
    local_head: usize,
    cached_tail: usize,
    mask: usize,
}

unsafe impl<T: Send> Send for Producer<T> {}

/// Consuming half of the ring.
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
    local_tail: usize,
    cached_head: usize,
    mask: usize,
}

unsafe impl<T: Send> Send for Consumer<T> {}

/// Create a ring with the given capacity (rounded up to a power of two).
pub fn channel<T: Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let capacity = capacity.next_power_of_two().max(2);
    let inner = Arc::new(Inner::new(capacity));
    let mask = capacity - 1;
    (
        Producer {
            inner: inner.clone(),
            local_head: 0,
            cached_tail: 0,
            mask,
        },
        Consumer {
            inner,
            local_tail: 0,
            cached_head: 0,
            mask,
        },
    )
}

impl<T> Producer<T> {
    /// Push a value, publishing it immediately.
    pub fn try_send(&mut self, value: T) -> Result<(), SendError<T>> {
        if !self.inner.rx_alive.load(Ordering::Acquire) {
            return Err(SendError::Disconnected(value));
        }

        let next_head = self.local_head.wrapping_add(1);
        if next_head.wrapping_sub(self.cached_tail) > self.mask + 1 {
            self.cached_tail = self.inner.tail.0.load(Ordering::Acquire);
            if next_head.wrapping_sub(self.cached_tail) > self.mask + 1 {
                return Err(SendError::Full(value));
            }
        }

        unsafe {
            (*self.inner.buffer[self.local_head & self.mask].get()).write(value);
        }
        self.local_head = next_head;
        self.inner.head.0.store(self.local_head, Ordering::Release);
        Ok(())
    }

    /// Whether the consumer is still attached.
    pub fn is_connected(&self) -> bool {
        self.inner.rx_alive.load(Ordering::Acquire)
    }

    /// Number of occupied slots from the producer's view.
    pub fn len(&self) -> usize {
        self.local_head
            .wrapping_sub(self.inner.tail.0.load(Ordering::Acquire))
    }

    /// Whether the ring looks empty from the producer's view.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.inner.tx_alive.store(false, Ordering::Release);
    }
}

impl<T> Consumer<T> {
    /// Pop a value if one is available.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        if self.local_tail == self.cached_head {
            self.cached_head = self.inner.head.0.load(Ordering::Acquire);
            if self.local_tail == self.cached_head {
                if !self.inner.tx_alive.load(Ordering::Acquire) {
                    return Err(TryRecvError::Disconnected);
                }
                return Err(TryRecvError::Empty);
            }
        }

        let value = unsafe {
            let slot = &mut *self.inner.buffer[self.local_tail & self.mask].get();
            slot.assume_init_read()
        };
        self.local_tail = self.local_tail.wrapping_add(1);
        self.inner.tail.0.store(self.local_tail, Ordering::Release);
        Ok(value)
    }

    /// Whether the producer is still attached.
    pub fn is_connected(&self) -> bool {
        self.inner.tx_alive.load(Ordering::Acquire)
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        // Drain values the producer published but we never read.
        while let Ok(v) = self.try_recv() {
            drop(v);
        }
        self.inner.rx_alive.store(false, Ordering::Release);
    }
}
