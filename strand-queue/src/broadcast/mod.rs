//! Overwrite-on-full ring with independent consumers.
//!
//! Producers never block and never fail: once the ring is full each write
//! replaces the oldest element. Every [`Consumer`] owns its own cursor and
//! sees the full stream, minus whatever it let the producers overwrite.
//!
//! A consumer that falls more than a capacity behind jumps forward to the
//! oldest retained element and counts the elements it lost (see
//! [`Consumer::skipped`]). If it is overtaken again on every attempt,
//! [`Consumer::poll`] gives up with a [`CatchUpError`] after
//! [`MAX_CATCH_UP_ATTEMPTS`] tries.
//!
//! A consumer may be reading a slot while a producer rewrites it, so every
//! read is validated against the producers' position afterwards and retried
//! if it lost the race. Two slot layouts implement this:
//!
//! - [`channel`] and [`single_producer`] store `Copy` elements inline and
//!   read them with a racy copy ([`SeqlockSlots`])
//! - [`shared_channel`] and [`shared_single_producer`] store any `Clone`
//!   element behind an epoch-reclaimed pointer and hand each consumer a
//!   clone ([`EpochSlots`])
//!
//! # Example
//!
//! ```
//! use strand_queue::broadcast;
//!
//! let (tx, mut a) = broadcast::channel::<u32>(4);
//! let mut b = a.clone();
//!
//! for i in 0..6 {
//!     tx.enq(i);
//! }
//!
//! // Capacity 4 keeps 2..6; both consumers lost 0 and 1.
//! assert_eq!(a.poll(), Ok(Some(2)));
//! assert_eq!(a.skipped(), 2);
//!
//! assert_eq!(b.poll(), Ok(Some(2)));
//! assert_eq!(b.poll(), Ok(Some(3)));
//! ```

mod ring;
mod slots;

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use ring::Ring;
pub use slots::{EpochSlots, SeqlockSlots, Storage};

use crate::config::{Capacity, Producers, ring_capacity};
use crate::error::{CatchUpError, Full};
use crate::queue::Enqueue;
use crate::trace::{error, warn};

/// How many times a consumer jumps forward before [`Consumer::poll`] fails.
pub const MAX_CATCH_UP_ATTEMPTS: u32 = 30;

/// Creates a broadcast buffer for any number of producers.
///
/// The capacity is rounded up to the next power of two (minimum 2).
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn channel<T: Copy>(capacity: usize) -> (Sender<T>, Consumer<T>) {
    multi(capacity)
}

/// Creates a broadcast buffer with exactly one producer.
///
/// The producer skips the CAS on the write index. Otherwise identical to
/// [`channel`].
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn single_producer<T: Copy>(capacity: usize) -> (SingleSender<T>, Consumer<T>) {
    single(capacity)
}

/// Creates a broadcast buffer of owned elements for any number of
/// producers.
///
/// Every write allocates; every read clones. Use it for `String`s, `Arc`s
/// and other payloads that are not `Copy`.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn shared_channel<T: Clone>(
    capacity: usize,
) -> (Sender<T, EpochSlots<T>>, Consumer<T, EpochSlots<T>>) {
    multi(capacity)
}

/// Creates a broadcast buffer of owned elements with exactly one producer.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn shared_single_producer<T: Clone>(
    capacity: usize,
) -> (SingleSender<T, EpochSlots<T>>, Consumer<T, EpochSlots<T>>) {
    single(capacity)
}

fn multi<T, S: Storage<T>>(capacity: usize) -> (Sender<T, S>, Consumer<T, S>) {
    let ring = Arc::new(Ring::new(ring_capacity(capacity), Producers::Multi));
    (
        Sender {
            ring: Arc::clone(&ring),
        },
        Consumer::new(ring),
    )
}

fn single<T, S: Storage<T>>(capacity: usize) -> (SingleSender<T, S>, Consumer<T, S>) {
    let ring = Arc::new(Ring::new(ring_capacity(capacity), Producers::Single));
    (
        SingleSender {
            ring: Arc::clone(&ring),
            _not_sync: PhantomData,
        },
        Consumer::new(ring),
    )
}

/// A producer handle for a multi-producer broadcast buffer.
pub struct Sender<T, S = SeqlockSlots<T>> {
    ring: Arc<Ring<T, S>>,
}

impl<T, S: Storage<T>> Sender<T, S> {
    /// Appends `value`, overwriting the oldest element if the ring is full.
    #[inline]
    pub fn enq(&self, value: T) {
        self.ring.write_multi(value);
    }

    /// Creates a consumer that starts at the beginning of the stream.
    ///
    /// It sees the oldest retained element first.
    pub fn new_consumer(&self) -> Consumer<T, S> {
        Consumer::new(Arc::clone(&self.ring))
    }

    /// Returns the capacity of the ring.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T, S> Clone for Sender<T, S> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T, S: Storage<T>> Enqueue<T> for Sender<T, S> {
    /// Never fails.
    fn enq(&self, value: T) -> Result<(), Full<T>> {
        Self::enq(self, value);
        Ok(())
    }

    fn capacity(&self) -> Capacity {
        Capacity::Bounded(Self::capacity(self))
    }
}

impl<T, S: Storage<T>> fmt::Debug for Sender<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.capacity())
            .field("tail", &self.ring.tail())
            .finish_non_exhaustive()
    }
}

/// The only producer handle of a single-producer broadcast buffer.
///
/// Neither `Clone` nor `Sync`: there is at most one writer at any time.
pub struct SingleSender<T, S = SeqlockSlots<T>> {
    ring: Arc<Ring<T, S>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T, S: Storage<T>> SingleSender<T, S> {
    /// Appends `value`, overwriting the oldest element if the ring is full.
    #[inline]
    pub fn enq(&self, value: T) {
        // Safety: this handle is the ring's only writer and is not Sync.
        unsafe { self.ring.write_single(value) };
    }

    /// Creates a consumer that starts at the beginning of the stream.
    pub fn new_consumer(&self) -> Consumer<T, S> {
        Consumer::new(Arc::clone(&self.ring))
    }

    /// Returns the capacity of the ring.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T, S: Storage<T>> Enqueue<T> for SingleSender<T, S> {
    /// Never fails.
    fn enq(&self, value: T) -> Result<(), Full<T>> {
        Self::enq(self, value);
        Ok(())
    }

    fn capacity(&self) -> Capacity {
        Capacity::Bounded(Self::capacity(self))
    }
}

impl<T, S: Storage<T>> fmt::Debug for SingleSender<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleSender")
            .field("capacity", &self.capacity())
            .field("tail", &self.ring.tail())
            .finish_non_exhaustive()
    }
}

/// An independent reader of a broadcast buffer.
///
/// Cloning a consumer forks its cursor: the clone continues from the same
/// position and then advances on its own.
pub struct Consumer<T, S = SeqlockSlots<T>> {
    ring: Arc<Ring<T, S>>,
    /// Next index to read.
    head: u64,
    /// Elements lost to overwrite so far.
    skipped: u64,
}

impl<T, S: Storage<T>> Consumer<T, S> {
    const fn new(ring: Arc<Ring<T, S>>) -> Self {
        Self {
            ring,
            head: 0,
            skipped: 0,
        }
    }

    /// Reads the next element.
    ///
    /// Returns `Ok(None)` if this consumer has read everything written so
    /// far. If the producers have overwritten the element at the cursor, the
    /// cursor jumps to the oldest retained element first.
    ///
    /// A `true` from [`has_next`](Self::has_next) does not promise the
    /// element at the cursor: if it was overwritten in between, this read
    /// returns a later one and adds the gap to [`skipped`](Self::skipped).
    ///
    /// # Errors
    ///
    /// Returns [`CatchUpError`] if the producers overwrote the cursor again on
    /// every one of [`MAX_CATCH_UP_ATTEMPTS`] jumps. The cursor is left at the
    /// last jump target, so polling again makes a fresh attempt.
    pub fn poll(&mut self) -> Result<Option<T>, CatchUpError> {
        let mut attempts = 0;

        let mut tail = self.ring.tail();
        if self.head >= tail {
            return Ok(None);
        }

        loop {
            attempts = self.catch_up(tail, attempts)?;

            let ring = &*self.ring;
            ring.wait_written(self.head);
            match ring.read(self.head) {
                Ok(value) => {
                    self.head += 1;
                    return Ok(Some(value));
                }
                Err(observed) => tail = observed,
            }
        }
    }

    /// Moves the cursor to the oldest element retained at `tail` if the
    /// producers have lapped it, and returns the updated jump count.
    ///
    /// Fails instead of jumping once `attempts` jumps have already been made
    /// in this poll; the cursor then stays where the last jump left it.
    fn catch_up(&mut self, tail: u64, attempts: u32) -> Result<u32, CatchUpError> {
        let oldest = self.ring.oldest(tail);
        if self.head >= oldest {
            return Ok(attempts);
        }

        if attempts >= MAX_CATCH_UP_ATTEMPTS {
            error!(
                attempts,
                head = self.head,
                tail,
                "broadcast consumer cannot catch up with producer"
            );
            return Err(CatchUpError {
                attempts,
                head: self.head,
                tail,
            });
        }

        warn!(
            head = self.head,
            oldest,
            lost = oldest - self.head,
            "broadcast consumer lapped, skipping ahead"
        );
        self.skipped += oldest - self.head;
        self.head = oldest;
        Ok(attempts + 1)
    }

    /// Index of the last element read, or `None` before the first read.
    pub const fn last_index_read(&self) -> Option<u64> {
        self.head.checked_sub(1)
    }

    /// Returns `true` if elements were written past this consumer's cursor.
    pub fn has_next(&self) -> bool {
        self.ring.tail() > self.head
    }

    /// Number of elements this consumer has lost to overwrite.
    pub const fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Number of unread elements still retained for this consumer.
    #[allow(clippy::cast_possible_truncation)]
    pub fn size(&self) -> usize {
        let unread = self.ring.tail().saturating_sub(self.head);
        unread.min(self.ring.capacity() as u64) as usize
    }

    /// Returns `true` if there is nothing to read.
    pub fn is_empty(&self) -> bool {
        !self.has_next()
    }

    /// Returns the capacity of the ring.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

impl<T, S> Clone for Consumer<T, S> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
            head: self.head,
            skipped: self.skipped,
        }
    }
}

impl<T, S: Storage<T>> fmt::Debug for Consumer<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("producers", &self.ring.producers())
            .field("head", &self.head)
            .field("tail", &self.ring.tail())
            .field("skipped", &self.skipped)
            .finish_non_exhaustive()
    }
}
