//! Bounded MPSC ring with consumer-side deletion.
//!
//! Producers claim `tail` by CAS, backing off with jitter when they lose,
//! then publish into the claimed slot. The consumer owns `head` and
//! everything in `[head, tail)` that has been published.
//!
//! Removing an element that is neither first nor last shifts every element in
//! front of it one slot toward the tail and advances `head`, so the ring stays
//! dense. Removing the last element first tries to hand its index back to
//! producers by moving `tail` back one; if a producer claimed past it in the
//! meantime, it falls back to the shift. Producers only ever claim indices at
//! or beyond `tail`, which the shift never touches.
//!
//! # Example
//!
//! ```
//! use strand_queue::single_consumer::array;
//!
//! let (tx, mut rx) = array::channel::<u32>(4);
//!
//! for i in 1..=4 {
//!     tx.enq(i).unwrap();
//! }
//! assert!(tx.enq(5).is_err());
//!
//! // Pull out the first even number; everything else keeps its order.
//! assert_eq!(rx.take_first(|v| v % 2 == 0), Some(2));
//! assert_eq!(rx.snapshot(), vec![1, 3, 4]);
//! ```

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::backoff;
use crate::config::{Capacity, ring_capacity};
use crate::error::Full;
use crate::queue::{Dequeue, Enqueue, QueueIterator};
use crate::slot::AtomicSlotArray;
use crate::trace::trace;

/// Creates a bounded single-consumer queue.
///
/// The capacity is rounded up to the next power of two (minimum 2).
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        head: CachePadded::new(AtomicU64::new(0)),
        tail: CachePadded::new(AtomicU64::new(0)),
        slots: AtomicSlotArray::new(ring_capacity(capacity)),
    });

    (
        Sender {
            inner: Arc::clone(&inner),
            cached_head: Cell::new(0),
        },
        Receiver {
            inner,
            cached_tail: 0,
            _not_sync: PhantomData,
        },
    )
}

struct Inner<T> {
    /// Next index to read. Written by the consumer only.
    head: CachePadded<AtomicU64>,
    /// Next index to claim. Producers advance it; the consumer may move it
    /// back by one when it removes the last element.
    tail: CachePadded<AtomicU64>,
    slots: AtomicSlotArray<T>,
}

impl<T> Inner<T> {
    #[inline]
    fn lap(&self) -> u64 {
        self.slots.capacity() as u64
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        // Safety: last reference; removed slots were recycled or reopened.
        unsafe { self.slots.drop_published(head, tail) };
    }
}

/// The sending half. Clone it for more producers.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
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

        let mut tail = inner.tail.load(Ordering::Relaxed);
        loop {
            if tail >= self.cached_head.get() + lap {
                let head = inner.head.load(Ordering::Acquire);
                self.cached_head.set(head);
                if tail >= head + lap {
                    return Err(Full(value));
                }
            }

            match inner.tail.compare_exchange(
                tail,
                tail + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => {
                    tail = current;
                    backoff::contended();
                }
            }
        }

        // Safety: the CAS made `tail` ours.
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
            .finish_non_exhaustive()
    }
}

/// The receiving half. There is exactly one.
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
    /// Last tail seen; everything below it has at least been claimed.
    cached_tail: u64,
    /// Elements are borrowed on the consumer thread only.
    _not_sync: PhantomData<Cell<()>>,
}

impl<T> Receiver<T> {
    #[inline]
    fn head(&self) -> u64 {
        self.inner.head.load(Ordering::Relaxed)
    }

    /// Returns `true` if some producer has claimed `index`.
    #[inline]
    fn is_claimed(&mut self, index: u64) -> bool {
        if index < self.cached_tail {
            return true;
        }
        self.cached_tail = self.inner.tail.load(Ordering::Acquire);
        index < self.cached_tail
    }

    /// Removes and returns the element at the head, or `None` if the queue
    /// is empty.
    pub fn poll(&mut self) -> Option<T> {
        let head = self.head();
        if !self.is_claimed(head) {
            return None;
        }
        let inner = &*self.inner;
        inner.slots.wait_published(head);
        // Safety: published, and only the consumer removes.
        let value = unsafe { inner.slots.take(head) };
        inner.head.store(head + 1, Ordering::Release);
        Some(value)
    }

    /// Borrows the element at the head without removing it.
    pub fn peek(&mut self) -> Option<&T> {
        let head = self.head();
        if !self.is_claimed(head) {
            return None;
        }
        self.inner.slots.wait_published(head);
        // Safety: published, and nothing can remove it while we are borrowed.
        Some(unsafe { self.inner.slots.get(head) })
    }

    /// Returns a cursor that can walk the queue and remove elements from
    /// anywhere in it.
    pub fn iter(&mut self) -> Iter<'_, T> {
        Iter {
            rx: self,
            cursor: None,
            on_element: false,
        }
    }

    /// Removes and returns the first element for which `accept` returns
    /// `true`. Elements before and after it keep their order.
    pub fn take_first(&mut self, accept: impl FnMut(&T) -> bool) -> Option<T> {
        super::take_first(self.iter(), accept)
    }

    /// Copies the current contents in order.
    pub fn snapshot(&mut self) -> Vec<T>
    where
        T: Clone,
    {
        let head = self.head();
        let tail = self.inner.tail.load(Ordering::Acquire);
        self.cached_tail = tail;

        (head..tail)
            .map(|index| {
                self.inner.slots.wait_published(index);
                // Safety: published and consumer-owned.
                unsafe { self.inner.slots.get(index) }.clone()
            })
            .collect()
    }

    /// Returns the number of elements in the queue.
    #[allow(clippy::cast_possible_truncation)]
    pub fn size(&self) -> usize {
        let head = self.head();
        let tail = self.inner.tail.load(Ordering::Acquire);
        tail.saturating_sub(head).min(self.inner.lap()) as usize
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

    /// Deletes the element at `index` and returns it with the cursor
    /// position that keeps an ongoing iteration on track.
    fn delete(&mut self, index: u64) -> (T, Option<u64>) {
        let inner = &*self.inner;
        let head = self.head();
        debug_assert!(head <= index && inner.slots.is_published(index));

        if index == head {
            // Safety: published and consumer-owned.
            let value = unsafe { inner.slots.take(head) };
            inner.head.store(head + 1, Ordering::Release);
            return (value, None);
        }

        // Safety: as above; the slot is refilled, recycled or reopened below.
        let removed = unsafe { inner.slots.take_in_place(index) };

        let tail = index + 1;
        if inner
            .tail
            .compare_exchange(tail, index, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            inner.slots.reopen(index);
            self.cached_tail = index;
            trace!(index, "removed last element, tail moved back");
            return (removed, Some(index - 1));
        }

        let mut to = index;
        while to != head {
            // Safety: every slot in [head, index] is published and ours.
            unsafe { inner.slots.move_value(to - 1, to) };
            to -= 1;
        }
        inner.slots.recycle(head);
        inner.head.store(head + 1, Ordering::Release);
        trace!(index, head, "removed element, compacted toward tail");

        (removed, Some(index))
    }

    /// Published elements from the head, stopping at the first gap.
    fn visible(&self) -> impl Iterator<Item = &T> {
        let head = self.head();
        let tail = self.inner.tail.load(Ordering::Acquire);
        let slots = &self.inner.slots;
        (head..tail)
            .take_while(move |&index| slots.is_published(index))
            // Safety: published; removal needs `&mut self`.
            .map(move |index| unsafe { slots.get(index) })
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

impl<T: fmt::Debug> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.visible()).finish()
    }
}

/// Cursor over a [`Receiver`], created by [`Receiver::iter`].
///
/// Holds the receiver mutably, so polling has to wait until it is dropped.
/// Producers are unaffected.
pub struct Iter<'a, T> {
    rx: &'a mut Receiver<T>,
    /// Index of the last element returned, `None` before the first.
    cursor: Option<u64>,
    /// `false` once the element under the cursor has been removed.
    on_element: bool,
}

impl<T> Iter<'_, T> {
    #[inline]
    fn following(&self) -> u64 {
        self.cursor.map_or_else(|| self.rx.head(), |index| index + 1)
    }
}

impl<T> QueueIterator<T> for Iter<'_, T> {
    fn has_next(&mut self) -> bool {
        let index = self.following();
        self.rx.is_claimed(index)
    }

    fn next(&mut self) -> Option<&T> {
        let index = self.following();
        if !self.rx.is_claimed(index) {
            return None;
        }
        self.rx.inner.slots.wait_published(index);
        self.cursor = Some(index);
        self.on_element = true;
        // Safety: published, and the receiver is borrowed by us.
        Some(unsafe { self.rx.inner.slots.get(index) })
    }

    fn value(&self) -> Option<&T> {
        if !self.on_element {
            return None;
        }
        let index = self.cursor?;
        Some(unsafe { self.rx.inner.slots.get(index) })
    }

    fn remove(&mut self) -> Option<T> {
        if !self.on_element {
            return None;
        }
        let index = self.cursor?;
        let (value, cursor) = self.rx.delete(index);
        self.cursor = cursor;
        self.on_element = false;
        Some(value)
    }

    fn reset(&mut self) {
        self.cursor = None;
        self.on_element = false;
    }
}

impl<T> fmt::Debug for Iter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("cursor", &self.cursor)
            .field("on_element", &self.on_element)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand_pcg::Pcg32;
    use std::collections::VecDeque;

    fn filled(values: &[&'static str]) -> (Sender<&'static str>, Receiver<&'static str>) {
        let (tx, rx) = channel(16);
        for &v in values {
            tx.enq(v).unwrap();
        }
        (tx, rx)
    }

    fn drain_to_end<T>(it: &mut Iter<'_, T>) {
        while it.has_next() {
            it.next();
        }
    }

    #[test]
    fn empty_queue() {
        let (_tx, mut rx) = channel::<u32>(8);
        assert_eq!(rx.size(), 0);
        assert!(rx.is_empty());
        assert_eq!(rx.peek(), None);
        assert_eq!(rx.poll(), None);
        assert!(!rx.iter().has_next());
    }

    #[test]
    fn fifo_and_size() {
        let (_tx, mut rx) = filled(&["one", "two", "three"]);
        assert_eq!(rx.size(), 3);
        assert_eq!(rx.snapshot(), vec!["one", "two", "three"]);
        assert_eq!(rx.peek(), Some(&"one"));
        assert_eq!(rx.poll(), Some("one"));
        assert_eq!(rx.poll(), Some("two"));
        assert_eq!(rx.poll(), Some("three"));
        assert_eq!(rx.poll(), None);
    }

    #[test]
    fn interleaved_enq_and_poll() {
        let (tx, mut rx) = channel::<String>(16);
        let mut j = 1;
        let mut k = 1;

        for _ in 0..8 {
            tx.enq(format!("x{j}")).unwrap();
            j += 1;
            tx.enq(format!("x{j}")).unwrap();
            j += 1;
            assert_eq!(rx.poll(), Some(format!("x{k}")));
            k += 1;
        }
        assert_eq!(rx.size(), 8);
        let expected: Vec<String> = (9..=16).map(|i| format!("x{i}")).collect();
        assert_eq!(rx.snapshot(), expected);

        for _ in 0..8 {
            assert_eq!(rx.poll(), Some(format!("x{k}")));
            k += 1;
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn full_then_poll_frees_one_slot() {
        let (tx, mut rx) = channel::<u32>(4);
        for i in 0..4 {
            tx.enq(i).unwrap();
        }
        assert_eq!(rx.size(), 4);
        assert_eq!(tx.enq(4), Err(Full(4)));

        assert_eq!(rx.poll(), Some(0));
        tx.enq(4).unwrap();
        assert_eq!(rx.snapshot(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn removes_middle_element_keeping_order() {
        let (_tx, mut rx) = filled(&["a", "b", "c", "d"]);

        let mut it = rx.iter();
        while let Some(&v) = it.next() {
            if v == "c" {
                assert_eq!(it.remove(), Some("c"));
                assert_eq!(it.value(), None);
                assert_eq!(it.remove(), None);
            }
        }

        assert_eq!(rx.snapshot(), vec!["a", "b", "d"]);
        assert_eq!(rx.size(), 3);
    }

    #[test]
    fn iterator_removes_every_other() {
        let (tx, mut rx) = channel::<String>(16);
        let mut j = 1;
        for _ in 0..9 {
            tx.enq(format!("x{j}")).unwrap();
            j += 1;
        }

        let mut k = 1;
        let mut it = rx.iter();
        while it.has_next() {
            it.next();
            if k % 2 == 0 {
                it.remove();
            }
            k += 1;
        }
        assert_eq!(rx.snapshot(), ["x1", "x3", "x5", "x7", "x9"]);

        for _ in 0..4 {
            tx.enq(format!("x{j}")).unwrap();
            j += 1;
        }

        let mut k = 1;
        let mut it = rx.iter();
        while it.has_next() {
            it.next();
            if k % 2 != 0 {
                it.remove();
            }
            k += 1;
        }
        assert_eq!(rx.snapshot(), ["x3", "x7", "x10", "x12"]);
    }

    #[test]
    fn iterator_removes_first() {
        let (tx, mut rx) = filled(&["one", "two", "three", "four"]);

        let mut it = rx.iter();
        it.next();
        assert_eq!(it.remove(), Some("one"));
        it.next();
        assert_eq!(it.remove(), Some("two"));

        tx.enq("five").unwrap();
        tx.enq("six").unwrap();

        assert_eq!(it.next(), Some(&"three"));
        it.remove();
        assert_eq!(it.next(), Some(&"four"));
        it.remove();

        assert_eq!(rx.size(), 2);
        assert_eq!(rx.snapshot(), vec!["five", "six"]);
    }

    #[test]
    fn iterator_removes_last() {
        let (tx, mut rx) = filled(&["one", "two", "three", "four"]);

        let mut it = rx.iter();
        drain_to_end(&mut it);
        assert_eq!(it.remove(), Some("four"));
        it.reset();
        drain_to_end(&mut it);
        assert_eq!(it.remove(), Some("three"));
        assert_eq!(rx.snapshot(), vec!["one", "two"]);

        // The tail moved back, so producers reuse the freed indices.
        tx.enq("five").unwrap();
        tx.enq("six").unwrap();
        assert_eq!(rx.size(), 4);

        let mut it = rx.iter();
        drain_to_end(&mut it);
        assert_eq!(it.remove(), Some("six"));
        it.reset();
        drain_to_end(&mut it);
        assert_eq!(it.remove(), Some("five"));

        assert_eq!(rx.size(), 2);
        assert_eq!(rx.snapshot(), vec!["one", "two"]);
    }

    #[test]
    fn iterator_removes_only_element() {
        let (tx, mut rx) = filled(&["one"]);

        for _ in 0..2 {
            let mut it = rx.iter();
            it.next();
            assert_eq!(it.remove(), Some("one"));
            assert!(!it.has_next());
            assert!(rx.is_empty());
            assert_eq!(rx.poll(), None);

            tx.enq("one").unwrap();
            assert_eq!(rx.size(), 1);
            assert_eq!(rx.snapshot(), vec!["one"]);
        }
    }

    #[test]
    fn cursor_sees_elements_enqueued_during_iteration() {
        let (tx, mut rx) = filled(&["a"]);

        let mut it = rx.iter();
        assert_eq!(it.next(), Some(&"a"));
        assert!(!it.has_next());

        tx.enq("b").unwrap();
        assert!(it.has_next());
        assert_eq!(it.next(), Some(&"b"));
        assert_eq!(it.value(), Some(&"b"));
    }

    #[test]
    fn take_first_matching() {
        let (_tx, mut rx) = filled(&["ping", "reply:1", "ping", "reply:2"]);

        assert_eq!(rx.take_first(|m| m.starts_with("reply")), Some("reply:1"));
        assert_eq!(rx.take_first(|m| m.starts_with("pong")), None);
        assert_eq!(rx.snapshot(), vec!["ping", "ping", "reply:2"]);
    }

    #[test]
    fn debug_lists_contents() {
        let (_tx, rx) = filled(&["a", "b"]);
        assert_eq!(format!("{rx:?}"), r#"["a", "b"]"#);
    }

    #[test]
    fn drops_unconsumed_elements() {
        let counter = Arc::new(());
        {
            let (tx, mut rx) = channel::<Arc<()>>(8);
            for _ in 0..6 {
                tx.enq(Arc::clone(&counter)).unwrap();
            }
            // One from the head, one from the middle, one from the end.
            drop(rx.poll());
            let mut it = rx.iter();
            it.next();
            it.next();
            drop(it.remove());
            drain_to_end(&mut it);
            drop(it.remove());
            assert_eq!(Arc::strong_count(&counter), 4);
        }
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[test]
    fn matches_vecdeque_model() {
        let mut rng = Pcg32::from_seed(0xdeadbeefdeadbeefdeadbeefdeadbeefu128.to_le_bytes());
        let (tx, mut rx) = channel::<u32>(32);
        let mut model = VecDeque::new();

        for i in 0u32..20_000 {
            match rng.gen_range(0..10) {
                0..=4 => {
                    let result = tx.enq(i);
                    if model.len() < 32 {
                        assert_eq!(result, Ok(()));
                        model.push_back(i);
                    } else {
                        assert_eq!(result, Err(Full(i)));
                    }
                }
                5..=7 => assert_eq!(rx.poll(), model.pop_front()),
                _ => {
                    if model.is_empty() {
                        continue;
                    }
                    let target = rng.gen_range(0..model.len());
                    let mut it = rx.iter();
                    for _ in 0..=target {
                        it.next();
                    }
                    assert_eq!(it.remove(), model.remove(target));
                }
            }
            assert_eq!(rx.size(), model.len());
        }

        assert_eq!(rx.snapshot(), Vec::from(model));
    }
}
