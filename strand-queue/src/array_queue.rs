//! Bounded multi-producer multi-consumer ring.
//!
//! Both ends advance by CAS. Producers claim `tail`, then publish into the
//! claimed slot; consumers wait for the slot at `head` to be published, then
//! claim it by CAS on `head`. Per-producer order is preserved; the order
//! between producers is the order in which their tail CAS succeeded.
//!
//! Unlike the single-consumer queues, the receiver here is `Clone`: any number
//! of consumers may poll concurrently. That makes `peek` meaningless (another
//! consumer could take the element while it is borrowed), so there is none.
//!
//! # Example
//!
//! ```
//! use strand_queue::array_queue;
//! use strand_queue::Full;
//!
//! let (tx, rx) = array_queue::channel::<u32>(2);
//!
//! tx.enq(1).unwrap();
//! tx.enq(2).unwrap();
//! assert_eq!(tx.enq(3), Err(Full(3)));
//!
//! let rx2 = rx.clone();
//! assert_eq!(rx.poll(), Some(1));
//! assert_eq!(rx2.poll(), Some(2));
//! assert_eq!(rx.poll(), None);
//! ```

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::config::{Capacity, ring_capacity};
use crate::error::Full;
use crate::queue::{Dequeue, Enqueue};
use crate::slot::AtomicSlotArray;

/// Creates a bounded MPMC queue.
///
/// The capacity is rounded up to the next power of two (minimum 2).
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner::new(ring_capacity(capacity)));
    (
        Sender {
            inner: Arc::clone(&inner),
            cached_head: Cell::new(0),
        },
        Receiver {
            inner,
            cached_tail: Cell::new(0),
        },
    )
}

struct Inner<T> {
    /// Next index to read.
    head: CachePadded<AtomicU64>,
    /// Next index to write.
    tail: CachePadded<AtomicU64>,
    slots: AtomicSlotArray<T>,
}

impl<T> Inner<T> {
    fn new(capacity: usize) -> Self {
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            slots: AtomicSlotArray::new(capacity),
        }
    }

    #[inline]
    fn lap(&self) -> u64 {
        self.slots.capacity() as u64
    }

    #[allow(clippy::cast_possible_truncation)]
    fn size(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.saturating_sub(head).min(self.lap()) as usize
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        // Safety: last reference, no other thread can reach the slots.
        unsafe { self.slots.drop_published(head, tail) };
    }
}

/// The sending half of an [`array_queue`](self). Clone it for more producers.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
    /// Last head this producer saw. Only refreshed when the ring looks full.
    cached_head: Cell<u64>,
}

impl<T> Sender<T> {
    /// Appends `value` at the tail.
    ///
    /// # Errors
    ///
    /// Returns `Err(Full(value))` if the queue is full.
    pub fn enq(&self, value: T) -> Result<(), Full<T>> {
        let inner = &*self.inner;
        let lap = inner.lap();
        let backoff = Backoff::new();

        let mut tail = inner.tail.load(Ordering::Relaxed);
        loop {
            if tail >= self.cached_head.get() + lap {
                // Only time a producer reads head.
                let head = inner.head.load(Ordering::Acquire);
                self.cached_head.set(head);
                if tail >= head + lap {
                    return Err(Full(value));
                }
            }

            match inner.tail.compare_exchange_weak(
                tail,
                tail + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => {
                    tail = current;
                    backoff.spin();
                }
            }
        }

        // Safety: the CAS gave us exclusive ownership of `tail`.
        unsafe { inner.slots.publish(tail, value) };
        Ok(())
    }

    /// Returns the capacity of the queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.slots.capacity()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            cached_head: Cell::new(self.cached_head.get()),
        }
    }
}

impl<T> Enqueue<T> for Sender<T> {
    fn enq(&self, value: T) -> Result<(), Full<T>> {
        Self::enq(self, value)
    }

    fn capacity(&self) -> Capacity {
        Capacity::Bounded(Self::capacity(self))
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.capacity())
            .field("len", &self.inner.size())
            .finish_non_exhaustive()
    }
}

/// The receiving half of an [`array_queue`](self). Clone it for more
/// consumers.
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
    /// Last tail this consumer saw. Only refreshed when the ring looks empty.
    cached_tail: Cell<u64>,
}

impl<T> Receiver<T> {
    /// Removes and returns the element at the head, or `None` if the queue
    /// is empty.
    ///
    /// May spin briefly if a producer has claimed the head slot but not yet
    /// published into it.
    pub fn poll(&self) -> Option<T> {
        let inner = &*self.inner;
        let backoff = Backoff::new();

        'claim: loop {
            let head = inner.head.load(Ordering::Acquire);

            if head >= self.cached_tail.get() {
                let tail = inner.tail.load(Ordering::Acquire);
                self.cached_tail.set(tail);
                if head >= tail {
                    return None;
                }
            }

            while !inner.slots.is_published(head) {
                // Another consumer may have taken it while we waited.
                if inner.head.load(Ordering::Acquire) != head {
                    continue 'claim;
                }
                backoff.spin();
            }

            if inner
                .head
                .compare_exchange_weak(head, head + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Safety: winning the CAS made `head` ours alone.
                return Some(unsafe { inner.slots.take(head) });
            }
            backoff.spin();
        }
    }

    /// Returns the number of elements in the queue.
    ///
    /// Concurrent producers and consumers make this a snapshot.
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// Returns `true` if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns the capacity of the queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.slots.capacity()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            cached_tail: Cell::new(self.cached_tail.get()),
        }
    }
}

impl<T> Dequeue<T> for Receiver<T> {
    fn poll(&mut self) -> Option<T> {
        Self::poll(self)
    }

    fn size(&self) -> usize {
        Self::size(self)
    }

    fn capacity(&self) -> Capacity {
        Capacity::Bounded(Self::capacity(self))
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.capacity())
            .field("len", &self.size())
            .finish_non_exhaustive()
    }
}
