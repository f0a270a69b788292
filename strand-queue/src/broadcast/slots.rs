//! Slot storage behind the broadcast ring.
//!
//! The ring decides which index a writer owns and whether a read is still
//! current; a [`Storage`] only has to put a value into a slot and hand back a
//! candidate copy that the ring then validates.
//!
//! - [`SeqlockSlots`]: values stored inline, read with a racy copy. `Copy`
//!   payloads only, since a torn copy is discarded without being dropped.
//! - [`EpochSlots`]: one heap allocation per write, swapped in atomically
//!   and reclaimed through `crossbeam-epoch`. Readers clone the value they
//!   load, so any `Clone` payload works.

use std::sync::atomic::{Ordering, fence};

use crossbeam_epoch::{self as epoch, Atomic, Owned};

use crate::slot::AtomicSlotArray;

pub(crate) mod sealed {
    /// Operations the ring performs on its storage.
    pub trait Storage<T> {
        fn with_capacity(capacity: usize) -> Self;

        fn capacity(&self) -> usize;

        /// Writes `value` into the slot for `index`.
        ///
        /// # Safety
        ///
        /// The caller must have exclusively reserved `index` among writers.
        unsafe fn store(&self, index: u64, value: T);

        /// Reads the slot for `index`, keeping the result only if
        /// `still_current` confirms afterwards that no writer has reached
        /// the slot for a later lap.
        fn read<F: FnOnce() -> bool>(&self, index: u64, still_current: F) -> Option<T>;
    }
}

/// Slot storage of a broadcast buffer. Implemented by [`SeqlockSlots`] and
/// [`EpochSlots`]; not implementable outside this crate.
pub trait Storage<T>: sealed::Storage<T> {}

impl<T, S: sealed::Storage<T>> Storage<T> for S {}

/// Inline slots read with a validated racy copy.
pub struct SeqlockSlots<T> {
    slots: AtomicSlotArray<T>,
}

impl<T: Copy> sealed::Storage<T> for SeqlockSlots<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: AtomicSlotArray::new(capacity),
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    #[inline]
    unsafe fn store(&self, index: u64, value: T) {
        unsafe { self.slots.overwrite(index, value) };
    }

    #[inline]
    fn read<F: FnOnce() -> bool>(&self, index: u64, still_current: F) -> Option<T> {
        let value = self.slots.read_racy(index);
        fence(Ordering::Acquire);
        // Safety: no writer reached the slot since `index` was committed, so
        // the copy is exactly that element.
        still_current().then(|| unsafe { value.assume_init() })
    }
}

/// Heap-allocated slots, swapped on write and reclaimed by epoch.
pub struct EpochSlots<T> {
    slots: Box<[Atomic<T>]>,
    mask: u64,
}

impl<T> EpochSlots<T> {
    #[inline]
    fn slot(&self, index: u64) -> &Atomic<T> {
        #[allow(clippy::cast_possible_truncation)]
        &self.slots[(index & self.mask) as usize]
    }
}

impl<T: Clone> sealed::Storage<T> for EpochSlots<T> {
    fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            slots: (0..capacity).map(|_| Atomic::null()).collect(),
            mask: capacity as u64 - 1,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    unsafe fn store(&self, index: u64, value: T) {
        let guard = &epoch::pin();
        let old = self
            .slot(index)
            .swap(Owned::new(value), Ordering::AcqRel, guard);
        if !old.is_null() {
            // Safety: swapped out, so unreachable for readers that pin after
            // this point; readers already pinned keep it alive.
            unsafe { guard.defer_destroy(old) };
        }
    }

    fn read<F: FnOnce() -> bool>(&self, index: u64, still_current: F) -> Option<T> {
        let guard = &epoch::pin();
        let current = self.slot(index).load(Ordering::Acquire, guard);
        // Safety: pinned, so the value cannot be reclaimed while we clone it.
        let value = unsafe { current.as_ref() }?.clone();
        still_current().then_some(value)
    }
}

impl<T> Drop for EpochSlots<T> {
    fn drop(&mut self) {
        // Safety: last reference to the ring; no reader or writer is left.
        let guard = unsafe { epoch::unprotected() };
        for slot in &*self.slots {
            let value = slot.swap(epoch::Shared::null(), Ordering::Relaxed, guard);
            if !value.is_null() {
                drop(unsafe { value.into_owned() });
            }
        }
    }
}
