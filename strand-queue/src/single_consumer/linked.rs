//! Unbounded MPSC queue of linked fixed-size blocks.
//!
//! ```text
//!   head                                   tail
//!    │                                      │
//!    ▼                                      ▼
//!  ┌──────────┐ next ┌──────────┐ next ┌──────────┐
//!  │ ✝ ✝ a ✝ b│ ───▶ │ c d e f g│ ───▶ │ h i ◌ · ·│
//!  │          │ ◀─── │          │ ◀─── │          │
//!  └──────────┘ prev └──────────┘ prev └──────────┘
//!   ✝ tombstone   ◌ reserved   · empty
//! ```
//!
//! Producers claim a slot in the tail node with a per-slot CAS
//! (`EMPTY -> RESERVED`) and publish with a release store
//! (`RESERVED -> OCCUPIED`). When the tail node has no empty slot left, a
//! producer appends a fresh node holding its element and swings `tail` to it
//! by CAS; losers back off and retry against the winner's node.
//!
//! Only the consumer turns slots into tombstones, and only the consumer
//! unlinks nodes: once every slot of the head node is a tombstone and the
//! node is no longer the tail, it is retired through `crossbeam-epoch`, so a
//! producer still holding a stale tail pointer never touches freed memory.
//!
//! Removal through the iterator leaves a tombstone; nothing is compacted.
//! [`Receiver::size`] and [`Receiver::snapshot`] walk the whole chain.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

use crate::backoff::{self, spin_until};
use crate::config::Capacity;
use crate::error::Full;
use crate::queue::{Dequeue, Enqueue, QueueIterator};
use crate::trace::trace;

/// Number of element slots in each node.
pub const BLOCK_SIZE: usize = 16;

const EMPTY: u8 = 0;
const RESERVED: u8 = 1;
const OCCUPIED: u8 = 2;
const TOMBSTONE: u8 = 3;

/// Creates an unbounded single-consumer queue.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    // Safety: the queue is not shared yet.
    let first = Owned::new(Node::new()).into_shared(unsafe { epoch::unprotected() });
    let inner = Arc::new(Inner {
        head: CachePadded::new(Atomic::from(first)),
        tail: CachePadded::new(Atomic::from(first)),
    });

    (
        Sender {
            inner: Arc::clone(&inner),
        },
        Receiver {
            inner,
            _not_sync: PhantomData,
        },
    )
}

struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// Safety: the state machine hands each value to exactly one thread at a time.
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    fn try_push(&self, value: T) -> Result<(), T> {
        if self.state.load(Ordering::Relaxed) != EMPTY
            || self
                .state
                .compare_exchange(EMPTY, RESERVED, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        {
            return Err(value);
        }
        unsafe { (*self.value.get()).write(value) };
        self.state.store(OCCUPIED, Ordering::Release);
        Ok(())
    }

    /// The slot's state, spinning through `RESERVED`.
    #[inline]
    fn settled(&self) -> u8 {
        let mut state = self.state.load(Ordering::Acquire);
        if state == RESERVED {
            spin_until(|| {
                state = self.state.load(Ordering::Acquire);
                state != RESERVED
            });
        }
        state
    }

    /// # Safety
    ///
    /// The slot must be `OCCUPIED` and the caller must be the consumer.
    #[inline]
    unsafe fn get(&self) -> &T {
        unsafe { (*self.value.get()).assume_init_ref() }
    }

    /// # Safety
    ///
    /// Same as [`get`](Self::get).
    #[inline]
    unsafe fn take(&self) -> T {
        let value = unsafe { (*self.value.get()).assume_init_read() };
        self.state.store(TOMBSTONE, Ordering::Relaxed);
        value
    }

    fn put_unshared(&mut self, value: T) {
        self.value.get_mut().write(value);
        *self.state.get_mut() = OCCUPIED;
    }

    fn take_unshared(&mut self) -> T {
        debug_assert_eq!(*self.state.get_mut(), OCCUPIED);
        *self.state.get_mut() = EMPTY;
        unsafe { self.value.get_mut().assume_init_read() }
    }
}

struct Node<T> {
    slots: [Slot<T>; BLOCK_SIZE],
    next: Atomic<Node<T>>,
    prev: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot::new()),
            next: Atomic::null(),
            prev: Atomic::null(),
        }
    }

    fn try_push(&self, mut value: T) -> Result<(), T> {
        for slot in &self.slots {
            match slot.try_push(value) {
                Ok(()) => return Ok(()),
                Err(v) => value = v,
            }
        }
        Err(value)
    }

    fn occupied(&self) -> impl Iterator<Item = &T> {
        self.slots
            .iter()
            .filter(|slot| slot.state.load(Ordering::Acquire) == OCCUPIED)
            // Safety: occupied slots are only emptied by the consumer.
            .map(|slot| unsafe { slot.get() })
    }
}

struct Inner<T> {
    /// Oldest live node. Written by the consumer only.
    head: CachePadded<Atomic<Node<T>>>,
    /// Node producers append to.
    tail: CachePadded<Atomic<Node<T>>>,
}

impl<T> Inner<T> {
    /// Consumer-side guard. Nodes from head to tail are only ever retired by
    /// the consumer, so it does not need to pin to dereference them.
    #[inline]
    fn consumer_guard() -> &'static Guard {
        unsafe { epoch::unprotected() }
    }

    #[inline]
    fn head_node(&self) -> &Node<T> {
        let head = self.head.load(Ordering::Relaxed, Self::consumer_guard());
        // Safety: the head is never null and only the consumer retires it.
        unsafe { head.deref() }
    }

    /// The node after `node`, waiting for the link if a producer has already
    /// moved `tail` past it. `None` if `node` is the tail.
    fn next_of(&self, node: &Node<T>) -> Option<&Node<T>> {
        let guard = Self::consumer_guard();
        let mut next = node.next.load(Ordering::Acquire, guard);
        if next.is_null() {
            let tail = self.tail.load(Ordering::Acquire, guard);
            if std::ptr::eq(tail.as_raw(), node) {
                return None;
            }
            spin_until(|| {
                next = node.next.load(Ordering::Acquire, guard);
                !next.is_null()
            });
        }
        // Safety: linked nodes past the head are live.
        Some(unsafe { next.deref() })
    }

    /// Unlinks and retires the head node, which must be fully consumed.
    /// Returns `false` if it is the tail and has to stay.
    fn retire_head(&self) -> bool {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Relaxed, guard);
        // Safety: the head is never null.
        let node = unsafe { head.deref() };
        let Some(next) = self.next_of(node) else {
            return false;
        };

        next.prev.store(Shared::null(), Ordering::Relaxed);
        node.next.store(Shared::null(), Ordering::Relaxed);
        self.head
            .store(Shared::from(std::ptr::from_ref(next)), Ordering::Release);

        // Safety: unreachable from head and no longer the tail; producers that
        // still see it as the tail are pinned.
        unsafe { guard.defer_destroy(head) };
        trace!("retired drained node");
        true
    }

    /// First occupied slot, retiring drained nodes on the way.
    fn front(&self) -> Option<&Slot<T>> {
        loop {
            let node = self.head_node();
            for slot in &node.slots {
                match slot.settled() {
                    OCCUPIED => return Some(slot),
                    EMPTY => return None,
                    _ => {}
                }
            }
            if !self.retire_head() {
                return None;
            }
        }
    }

    /// Visits every node from tail back to head.
    ///
    /// `prev` links are set before a node is published as the tail, so this
    /// never waits on a producer.
    fn for_each_node_back(&self, mut visit: impl FnMut(&Node<T>)) {
        let guard = Self::consumer_guard();
        let head = self.head.load(Ordering::Relaxed, guard);
        let mut node = self.tail.load(Ordering::Acquire, guard);
        loop {
            // Safety: nodes between head and tail are live.
            let current = unsafe { node.deref() };
            visit(current);
            if node == head {
                break;
            }
            node = current.prev.load(Ordering::Acquire, guard);
            if node.is_null() {
                break;
            }
        }
    }

    fn nodes(&self) -> Vec<&Node<T>> {
        let mut nodes = Vec::new();
        self.for_each_node_back(|node| nodes.push(std::ptr::from_ref(node)));
        nodes.reverse();
        // Safety: as in `for_each_node_back`.
        nodes.into_iter().map(|node| unsafe { &*node }).collect()
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let guard = Self::consumer_guard();
        let mut node = self.head.load(Ordering::Relaxed, guard);
        while !node.is_null() {
            // Safety: last reference; retired nodes are no longer linked.
            unsafe {
                let next = node.deref().next.load(Ordering::Relaxed, guard);
                let mut owned = node.into_owned();
                for slot in &mut owned.slots {
                    if *slot.state.get_mut() == OCCUPIED {
                        slot.value.get_mut().assume_init_drop();
                    }
                }
                drop(owned);
                node = next;
            }
        }
    }
}

/// The sending half. Clone it for more producers.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Sender<T> {
    /// Appends `value` at the tail. Never fails.
    pub fn enq(&self, value: T) {
        let guard = &epoch::pin();
        let mut value = value;
        let mut spare: Option<Owned<Node<T>>> = None;

        loop {
            let tail = self.inner.tail.load(Ordering::Acquire, guard);
            // Safety: pinned, and the consumer never retires the tail.
            let node = unsafe { tail.deref() };

            match node.try_push(value) {
                Ok(()) => return,
                Err(v) => value = v,
            }

            let mut fresh = spare.take().unwrap_or_else(|| Owned::new(Node::new()));
            fresh.prev.store(tail, Ordering::Relaxed);
            fresh.slots[0].put_unshared(value);

            match self.inner.tail.compare_exchange(
                tail,
                fresh,
                Ordering::Release,
                Ordering::Relaxed,
                guard,
            ) {
                Ok(appended) => {
                    node.next.store(appended, Ordering::Release);
                    trace!("appended node");
                    return;
                }
                Err(err) => {
                    let mut fresh = err.new;
                    value = fresh.slots[0].take_unshared();
                    spare = Some(fresh);
                    backoff::contended();
                }
            }
        }
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Enqueue<T> for Sender<T> {
    /// Never fails.
    fn enq(&self, value: T) -> Result<(), Full<T>> {
        Self::enq(self, value);
        Ok(())
    }

    fn capacity(&self) -> Capacity {
        Capacity::Unbounded
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").finish_non_exhaustive()
    }
}

/// The receiving half. There is exactly one.
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T> Receiver<T> {
    /// Removes and returns the oldest element, or `None` if the queue is
    /// empty.
    pub fn poll(&mut self) -> Option<T> {
        let slot = self.inner.front()?;
        // Safety: occupied and we are the consumer.
        Some(unsafe { slot.take() })
    }

    /// Borrows the oldest element without removing it.
    pub fn peek(&mut self) -> Option<&T> {
        let slot = self.inner.front()?;
        Some(unsafe { slot.get() })
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
    /// `true`.
    pub fn take_first(&mut self, accept: impl FnMut(&T) -> bool) -> Option<T> {
        super::take_first(self.iter(), accept)
    }

    /// Copies the current contents in order. Walks every node.
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.inner
            .nodes()
            .into_iter()
            .flat_map(Node::occupied)
            .cloned()
            .collect()
    }

    /// Returns the number of elements. Walks every node.
    pub fn size(&self) -> usize {
        let mut size = 0;
        self.inner
            .for_each_node_back(|node| size += node.occupied().count());
        size
    }

    /// Returns `true` if the queue holds no element.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of nodes currently linked, including the tail.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.inner.for_each_node_back(|_| count += 1);
        count
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
        Capacity::Unbounded
    }
}

impl<T: fmt::Debug> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.inner.nodes().into_iter().flat_map(Node::occupied))
            .finish()
    }
}

/// Cursor over a [`Receiver`], created by [`Receiver::iter`].
pub struct Iter<'a, T> {
    rx: &'a mut Receiver<T>,
    /// Node and slot of the last element returned, `None` before the first.
    cursor: Option<(*const Node<T>, usize)>,
    on_element: bool,
}

impl<T> Iter<'_, T> {
    /// Position of the first live element after the cursor.
    fn following(&self) -> Option<(*const Node<T>, usize)> {
        let inner = &*self.rx.inner;
        let (mut node, mut index) = match self.cursor {
            None => (inner.head_node(), 0),
            // Safety: nodes are not retired while the receiver is borrowed.
            Some((node, index)) => (unsafe { &*node }, index + 1),
        };

        loop {
            while index < BLOCK_SIZE {
                match node.slots[index].settled() {
                    OCCUPIED => return Some((std::ptr::from_ref(node), index)),
                    EMPTY => return None,
                    _ => index += 1,
                }
            }
            node = inner.next_of(node)?;
            index = 0;
        }
    }

    fn slot(&self) -> Option<&Slot<T>> {
        if !self.on_element {
            return None;
        }
        let (node, index) = self.cursor?;
        // Safety: as in `following`.
        Some(unsafe { &(*node).slots[index] })
    }
}

impl<T> QueueIterator<T> for Iter<'_, T> {
    fn has_next(&mut self) -> bool {
        self.following().is_some()
    }

    fn next(&mut self) -> Option<&T> {
        self.cursor = Some(self.following()?);
        self.on_element = true;
        let slot = self.slot()?;
        // Safety: occupied, and the receiver is borrowed by us.
        Some(unsafe { slot.get() })
    }

    fn value(&self) -> Option<&T> {
        let slot = self.slot()?;
        Some(unsafe { slot.get() })
    }

    fn remove(&mut self) -> Option<T> {
        let slot = self.slot()?;
        // Safety: occupied, and the receiver is borrowed by us.
        let value = unsafe { slot.take() };
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
            .field("on_element", &self.on_element)
            .finish_non_exhaustive()
    }
}
