//! Fixed-length array of element slots with per-slot stamps.
//!
//! Every ring in the crate stores its elements here. Each slot carries a
//! stamp that says which absolute index it currently belongs to:
//!
//! ```text
//! stamp == index             EMPTY     writable by the producer holding `index`
//! stamp == index + 1         OCCUPIED  holds the element published at `index`
//! stamp == index + capacity  EMPTY     recycled, writable on the next lap
//! ```
//!
//! Capacity is a power of two and at least 2, so "occupied at `index`" and
//! "writable at `index + 1`" never collide in the same slot. A producer that
//! has reserved an index but not yet published it leaves the stamp at
//! `index`; that is the `RESERVED` state, and only the consumer's index
//! bookkeeping distinguishes it from `EMPTY`.
//!
//! Stamps are published with `Release` and read with `Acquire`, which is what
//! makes the element bytes visible to whoever observes the new stamp.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backoff::spin_until;

#[repr(C)]
struct Slot<T> {
    stamp: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// The backing storage for a ring.
///
/// Indices passed in are absolute (monotonically increasing); the array
/// masks them down to a slot.
pub(crate) struct AtomicSlotArray<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
}

// Safety: slot access is coordinated through the stamps; values only move
// between threads, never get shared mutably.
unsafe impl<T: Send> Send for AtomicSlotArray<T> {}
unsafe impl<T: Send> Sync for AtomicSlotArray<T> {}

impl<T> AtomicSlotArray<T> {
    /// Allocates `capacity` empty slots. Slot `k` starts writable at index `k`.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two() && capacity >= 2);

        let slots = (0..capacity as u64)
            .map(|k| Slot {
                stamp: AtomicU64::new(k),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            slots,
            mask: capacity - 1,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn slot(&self, index: u64) -> &Slot<T> {
        // Safety: masked index is always within the slice.
        unsafe { self.slots.get_unchecked(index as usize & self.mask) }
    }

    #[inline]
    const fn lap(&self) -> u64 {
        (self.mask + 1) as u64
    }

    /// Returns `true` if the element for `index` has been published.
    #[inline]
    pub fn is_published(&self, index: u64) -> bool {
        self.slot(index).stamp.load(Ordering::Acquire) == index.wrapping_add(1)
    }

    /// Spins until the element for `index` has been published.
    ///
    /// Only call this for an index some producer has already reserved.
    #[inline]
    pub fn wait_published(&self, index: u64) {
        spin_until(|| self.is_published(index));
    }

    /// Writes `value` at `index` and makes it visible to consumers.
    ///
    /// Spins first if the previous lap's element is still being retired.
    ///
    /// # Safety
    ///
    /// The caller must have exclusively reserved `index`, and must publish it
    /// exactly once.
    #[inline]
    pub unsafe fn publish(&self, index: u64, value: T) {
        let slot = self.slot(index);
        spin_until(|| slot.stamp.load(Ordering::Acquire) == index);
        unsafe { (*slot.value.get()).write(value) };
        slot.stamp.store(index.wrapping_add(1), Ordering::Release);
    }

    /// Borrows the element published at `index`.
    ///
    /// # Safety
    ///
    /// `index` must be published, and the caller must be the only party
    /// allowed to remove it for the lifetime of the borrow.
    #[inline]
    pub unsafe fn get(&self, index: u64) -> &T {
        debug_assert!(self.is_published(index));
        unsafe { (*self.slot(index).value.get()).assume_init_ref() }
    }

    /// Moves the element out and recycles the slot for the next lap.
    ///
    /// # Safety
    ///
    /// `index` must be published and owned by the caller (no other thread
    /// may take it).
    #[inline]
    pub unsafe fn take(&self, index: u64) -> T {
        let slot = self.slot(index);
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.stamp
            .store(index.wrapping_add(self.lap()), Ordering::Release);
        value
    }

    /// Moves the element out and leaves the stamp untouched.
    ///
    /// The slot is logically empty afterwards; the caller must either refill
    /// it with [`move_value`](Self::move_value), [`recycle`](Self::recycle)
    /// it, or [`reopen`](Self::reopen) it.
    ///
    /// # Safety
    ///
    /// Same as [`take`](Self::take).
    #[inline]
    pub unsafe fn take_in_place(&self, index: u64) -> T {
        unsafe { (*self.slot(index).value.get()).assume_init_read() }
    }

    /// Moves the element at `from` into the (logically empty) slot at `to`.
    ///
    /// Stamps are not touched: `to` must already be stamped occupied for its
    /// own index, and `from` is left logically empty.
    ///
    /// # Safety
    ///
    /// Both indices must be in the consumer-owned region and `to` must have
    /// had its element moved out.
    #[inline]
    pub unsafe fn move_value(&self, from: u64, to: u64) {
        let src = self.slot(from).value.get();
        let dst = self.slot(to).value.get();
        unsafe { ptr::copy_nonoverlapping(src, dst, 1) };
    }

    /// Marks the slot at `index` writable for the next lap.
    #[inline]
    pub fn recycle(&self, index: u64) {
        self.slot(index)
            .stamp
            .store(index.wrapping_add(self.lap()), Ordering::Release);
    }

    /// Hands `index` back to producers on the current lap.
    ///
    /// Used when the consumer takes back an index by decrementing the tail.
    #[inline]
    pub fn reopen(&self, index: u64) {
        self.slot(index).stamp.store(index, Ordering::Release);
    }

    /// Drops every published element in `[from, to)`.
    ///
    /// # Safety
    ///
    /// No other thread may access the array, and the range must not contain
    /// elements that were already moved out without recycling.
    pub unsafe fn drop_published(&self, from: u64, to: u64) {
        let mut index = from;
        while index != to {
            let slot = self.slot(index);
            if slot.stamp.load(Ordering::Relaxed) == index.wrapping_add(1) {
                unsafe { (*slot.value.get()).assume_init_drop() };
            }
            index = index.wrapping_add(1);
        }
    }
}

impl<T: Copy> AtomicSlotArray<T> {
    /// Writes `value` at `index` regardless of what the slot holds.
    ///
    /// Readers may be copying the slot concurrently; they must validate what
    /// they read against the writer's position afterwards.
    ///
    /// # Safety
    ///
    /// The caller must have exclusively reserved `index` among writers.
    #[inline]
    pub unsafe fn overwrite(&self, index: u64, value: T) {
        let slot = self.slot(index);
        unsafe { ptr::write_volatile(slot.value.get(), MaybeUninit::new(value)) };
        slot.stamp.store(index.wrapping_add(1), Ordering::Release);
    }

    /// Copies the slot at `index` without synchronizing with writers.
    ///
    /// The result may be torn if a writer overwrote the slot during the copy.
    /// The caller must only `assume_init` it after validating that no writer
    /// could have reached this slot.
    #[inline]
    pub fn read_racy(&self, index: u64) -> MaybeUninit<T> {
        unsafe { ptr::read_volatile(self.slot(index).value.get()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_start_writable() {
        let slots = AtomicSlotArray::<u64>::new(8);
        for i in 0..8 {
            assert!(!slots.is_published(i));
            assert_eq!(slots.slot(i).stamp.load(Ordering::Relaxed), i);
        }
    }

    #[test]
    fn publish_take_recycles_for_next_lap() {
        let slots = AtomicSlotArray::<String>::new(4);

        unsafe {
            slots.publish(1, "one".to_string());
            assert!(slots.is_published(1));
            assert_eq!(slots.get(1), "one");

            assert_eq!(slots.take(1), "one");
            assert!(!slots.is_published(1));

            // Index 5 maps to the same slot on the next lap.
            slots.publish(5, "five".to_string());
            assert!(slots.is_published(5));
            assert_eq!(slots.take(5), "five");
        }
    }

    #[test]
    fn move_value_shifts_element() {
        let slots = AtomicSlotArray::<String>::new(4);

        unsafe {
            slots.publish(0, "a".to_string());
            slots.publish(1, "b".to_string());

            let removed = slots.take_in_place(1);
            slots.move_value(0, 1);
            slots.recycle(0);

            assert_eq!(removed, "b");
            assert_eq!(slots.get(1), "a");
            assert!(!slots.is_published(0));

            slots.drop_published(1, 2);
        }
    }

    #[test]
    fn reopen_returns_index_to_producers() {
        let slots = AtomicSlotArray::<u32>::new(2);

        unsafe {
            slots.publish(0, 7);
            assert_eq!(slots.take_in_place(0), 7);
            slots.reopen(0);
            slots.publish(0, 8);
            assert_eq!(slots.take(0), 8);
        }
    }

    #[test]
    fn overwrite_and_read_racy() {
        let slots = AtomicSlotArray::<u64>::new(2);

        unsafe {
            slots.overwrite(0, 10);
            slots.overwrite(2, 20);
            assert!(slots.is_published(2));
            assert_eq!(slots.read_racy(2).assume_init(), 20);
        }
    }

    #[test]
    fn drop_published_drops_each_once() {
        use std::sync::Arc;

        let counter = Arc::new(());
        let slots = AtomicSlotArray::<Arc<()>>::new(4);

        unsafe {
            slots.publish(0, Arc::clone(&counter));
            slots.publish(1, Arc::clone(&counter));
            slots.publish(2, Arc::clone(&counter));
            drop(slots.take(0));
            assert_eq!(Arc::strong_count(&counter), 3);

            slots.drop_published(1, 3);
        }
        assert_eq!(Arc::strong_count(&counter), 1);
    }
}
