//! Storage for the broadcast buffer.
//!
//! Writers never wait for readers. A slot may be overwritten while a reader
//! copies it, so readers follow the seqlock discipline: copy first, then
//! check that no writer could have reached the slot since. `tail` plays the
//! role of the sequence counter; the slot [`Storage`] decides how the copy
//! is taken.
//!
//! ```text
//!            oldest retained                 tail
//!                 │                           │
//!   ... lost ...  ▼  [ tail - capacity, tail )▼  not yet claimed
//!                 └─────── readable ─────────┘
//! ```
//!
//! `last_written` trails `tail`: it is the count of committed writes, and
//! every index below it holds a complete element (or a newer one).

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering, fence};

use crossbeam_utils::CachePadded;

use super::slots::Storage;
use crate::backoff::spin_until;
use crate::config::Producers;

pub(super) struct Ring<T, S> {
    /// Next index to claim.
    tail: CachePadded<AtomicU64>,
    /// Number of committed writes. Advances in index order.
    last_written: CachePadded<AtomicU64>,
    producers: Producers,
    slots: S,
    _item: PhantomData<fn(T) -> T>,
}

impl<T, S: Storage<T>> Ring<T, S> {
    pub fn new(capacity: usize, producers: Producers) -> Self {
        Self {
            tail: CachePadded::new(AtomicU64::new(0)),
            last_written: CachePadded::new(AtomicU64::new(0)),
            producers,
            slots: S::with_capacity(capacity),
            _item: PhantomData,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    #[inline]
    pub const fn producers(&self) -> Producers {
        self.producers
    }

    #[inline]
    fn lap(&self) -> u64 {
        self.slots.capacity() as u64
    }

    #[inline]
    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// The oldest index still held, given a tail.
    #[inline]
    pub fn oldest(&self, tail: u64) -> u64 {
        tail.saturating_sub(self.lap())
    }

    /// Single-producer write: plain increment of `tail`.
    ///
    /// # Safety
    ///
    /// No other thread may call `write_single` or `write_multi` on this ring.
    #[inline]
    pub unsafe fn write_single(&self, value: T) {
        let tail = self.tail.load(Ordering::Relaxed);
        self.tail.store(tail + 1, Ordering::Relaxed);
        // Readers that see any byte of this write must also see the new tail.
        fence(Ordering::Release);
        unsafe { self.slots.store(tail, value) };
        self.last_written.store(tail + 1, Ordering::Release);
    }

    /// Multi-producer write: CAS on `tail`, commit in index order.
    pub fn write_multi(&self, value: T) {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            match self.tail.compare_exchange_weak(
                tail,
                tail + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => tail = current,
            }
        }
        fence(Ordering::Release);

        // The writer one lap behind must be done with this slot.
        let behind = (tail + 1).saturating_sub(self.lap());
        spin_until(|| self.last_written.load(Ordering::Acquire) >= behind);

        // Safety: the CAS made `tail` ours, and the previous owner of the
        // slot has committed.
        unsafe { self.slots.store(tail, value) };

        spin_until(|| self.last_written.load(Ordering::Acquire) == tail);
        self.last_written.store(tail + 1, Ordering::Release);
    }

    /// Spins until the element at `index` has been committed.
    #[inline]
    pub fn wait_written(&self, index: u64) {
        spin_until(|| self.last_written.load(Ordering::Acquire) > index);
    }

    /// Copies the element at `index` if it was not overwritten during the
    /// copy. Returns the tail observed for validation on failure.
    ///
    /// The caller must have waited for `index` to be committed.
    #[inline]
    pub fn read(&self, index: u64) -> Result<T, u64> {
        let mut tail = 0;
        let value = self.slots.read(index, || {
            tail = self.tail.load(Ordering::Relaxed);
            index >= self.oldest(tail)
        });
        value.ok_or(tail)
    }
}
