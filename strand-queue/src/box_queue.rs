//! Capacity-1 mailbox.
//!
//! The slot holds at most one element. Two write policies:
//!
//! - [`BoxPolicy::Overwrite`]: every write succeeds and replaces whatever is
//!   held, so the reader only ever observes the latest value (conflation)
//! - [`BoxPolicy::ExactlyOnce`]: a write into an occupied slot fails with
//!   [`Full`] until the held value is consumed
//!
//! and two consumer configurations: a single [`Receiver`] (from [`channel`])
//! or any number of cloned [`SharedReceiver`]s (from [`shared_channel`]).
//!
//! # Example
//!
//! ```
//! use strand_queue::box_queue;
//! use strand_queue::BoxPolicy;
//!
//! let (tx, mut rx) = box_queue::channel::<u32>(BoxPolicy::Overwrite);
//!
//! tx.enq(1).unwrap();
//! tx.enq(2).unwrap();
//!
//! // 1 was replaced before anyone read it.
//! assert_eq!(rx.poll(), Some(2));
//! assert_eq!(rx.poll(), None);
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use crate::config::{BoxPolicy, Capacity, Consumers};
use crate::error::Full;
use crate::queue::{Dequeue, Enqueue};

/// Creates a box queue with a single consumer.
pub fn channel<T>(policy: BoxPolicy) -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner::new(policy, Consumers::Single));
    (
        Sender {
            inner: Arc::clone(&inner),
        },
        Receiver { inner },
    )
}

/// Creates a box queue whose receiver can be cloned for several consumers.
pub fn shared_channel<T>(policy: BoxPolicy) -> (Sender<T>, SharedReceiver<T>) {
    let inner = Arc::new(Inner::new(policy, Consumers::Multi));
    (
        Sender {
            inner: Arc::clone(&inner),
        },
        SharedReceiver { inner },
    )
}

/// The slot. A null pointer is the empty state.
struct Inner<T> {
    slot: CachePadded<AtomicPtr<T>>,
    policy: BoxPolicy,
    consumers: Consumers,
    _marker: PhantomData<T>,
}

// Safety: values are boxed and handed from thread to thread through the
// atomic pointer; no two threads ever hold the same value.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    fn new(policy: BoxPolicy, consumers: Consumers) -> Self {
        Self {
            slot: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            policy,
            consumers,
            _marker: PhantomData,
        }
    }

    fn enq(&self, value: T) -> Result<(), Full<T>> {
        let new = Box::into_raw(Box::new(value));

        match self.policy {
            BoxPolicy::Overwrite => {
                let old = self.slot.swap(new, Ordering::AcqRel);
                if !old.is_null() {
                    // Safety: swapping it out made us its sole owner.
                    drop(unsafe { Box::from_raw(old) });
                }
                Ok(())
            }
            BoxPolicy::ExactlyOnce => {
                match self.slot.compare_exchange(
                    ptr::null_mut(),
                    new,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => Ok(()),
                    // Safety: never published, still ours.
                    Err(_) => Err(Full(*unsafe { Box::from_raw(new) })),
                }
            }
        }
    }

    fn take(&self) -> Option<Box<T>> {
        let taken = if self.consumers == Consumers::Single && self.policy == BoxPolicy::ExactlyOnce
        {
            // Producers only write into an empty slot and we are the only
            // reader, so nobody else can clear it between load and store.
            // Not valid for Overwrite: a swap landing between the load and
            // the store would be lost.
            let current = self.slot.load(Ordering::Acquire);
            if current.is_null() {
                return None;
            }
            self.slot.store(ptr::null_mut(), Ordering::Release);
            current
        } else {
            let mut current = self.slot.load(Ordering::Acquire);
            loop {
                if current.is_null() {
                    return None;
                }
                match self.slot.compare_exchange_weak(
                    current,
                    ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break current,
                    Err(actual) => current = actual,
                }
            }
        };

        // Safety: clearing the slot transferred ownership to us.
        Some(unsafe { Box::from_raw(taken) })
    }

    fn is_occupied(&self) -> bool {
        !self.slot.load(Ordering::Acquire).is_null()
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let last = *self.slot.get_mut();
        if !last.is_null() {
            drop(unsafe { Box::from_raw(last) });
        }
    }
}

/// The sending half of a box queue. Clone it for more producers.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Sender<T> {
    /// Writes `value` into the slot.
    ///
    /// # Errors
    ///
    /// With [`BoxPolicy::ExactlyOnce`], returns `Err(Full(value))` while the
    /// slot is occupied. With [`BoxPolicy::Overwrite`] this never fails.
    #[inline]
    pub fn enq(&self, value: T) -> Result<(), Full<T>> {
        self.inner.enq(value)
    }

    /// The write policy this queue was created with.
    pub fn policy(&self) -> BoxPolicy {
        self.inner.policy
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
    fn enq(&self, value: T) -> Result<(), Full<T>> {
        self.inner.enq(value)
    }

    fn capacity(&self) -> Capacity {
        Capacity::Bounded(1)
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("policy", &self.inner.policy)
            .field("occupied", &self.inner.is_occupied())
            .finish_non_exhaustive()
    }
}

/// The only receiving half of a box queue.
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Receiver<T> {
    /// Takes the held value, leaving the slot empty.
    #[inline]
    pub fn poll(&mut self) -> Option<T> {
        self.inner.take().map(|boxed| *boxed)
    }

    /// Returns a copy of the held value without consuming it.
    ///
    /// Under [`BoxPolicy::Overwrite`] a value written while peeking wins
    /// over the peeked one, exactly as if it had been written just after.
    pub fn peek(&mut self) -> Option<T>
    where
        T: Clone,
    {
        let inner = &*self.inner;
        match inner.policy {
            BoxPolicy::ExactlyOnce => {
                let current = inner.slot.load(Ordering::Acquire);
                // Safety: producers never replace an occupied slot under this
                // policy, and we are the only consumer.
                unsafe { current.as_ref() }.cloned()
            }
            BoxPolicy::Overwrite => {
                let taken = inner.take()?;
                let copy = T::clone(&taken);
                let raw = Box::into_raw(taken);
                if inner
                    .slot
                    .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    // A newer value arrived; it would have replaced this one.
                    drop(unsafe { Box::from_raw(raw) });
                }
                Some(copy)
            }
        }
    }

    /// Returns 1 if a value is held, else 0.
    pub fn size(&self) -> usize {
        usize::from(self.inner.is_occupied())
    }

    /// Returns `true` if no value is held.
    pub fn is_empty(&self) -> bool {
        !self.inner.is_occupied()
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
        Capacity::Bounded(1)
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("policy", &self.inner.policy)
            .field("occupied", &self.inner.is_occupied())
            .finish_non_exhaustive()
    }
}

/// A receiving half that may be cloned; consumers race with CAS.
pub struct SharedReceiver<T> {
    inner: Arc<Inner<T>>,
}

impl<T> SharedReceiver<T> {
    /// Takes the held value, leaving the slot empty. At most one of any
    /// number of racing consumers gets it.
    #[inline]
    pub fn poll(&self) -> Option<T> {
        self.inner.take().map(|boxed| *boxed)
    }

    /// Returns 1 if a value is held, else 0.
    pub fn size(&self) -> usize {
        usize::from(self.inner.is_occupied())
    }

    /// Returns `true` if no value is held.
    pub fn is_empty(&self) -> bool {
        !self.inner.is_occupied()
    }
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Dequeue<T> for SharedReceiver<T> {
    fn poll(&mut self) -> Option<T> {
        Self::poll(self)
    }

    fn size(&self) -> usize {
        Self::size(self)
    }

    fn capacity(&self) -> Capacity {
        Capacity::Bounded(1)
    }
}

impl<T> fmt::Debug for SharedReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedReceiver")
            .field("policy", &self.inner.policy)
            .field("occupied", &self.inner.is_occupied())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EnqError;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn overwrite_keeps_latest() {
        let (tx, mut rx) = channel::<u32>(BoxPolicy::Overwrite);

        tx.enq(1).unwrap();
        tx.enq(2).unwrap();

        assert_eq!(rx.size(), 1);
        assert_eq!(rx.poll(), Some(2));
        assert!(rx.is_empty());
    }

    #[test]
    fn exactly_once_rejects_when_occupied() {
        let (tx, mut rx) = channel::<u32>(BoxPolicy::ExactlyOnce);

        tx.enq(1).unwrap();
        assert_eq!(tx.enq(2), Err(Full(2)));

        assert_eq!(rx.poll(), Some(1));
        tx.enq(2).unwrap();
        assert_eq!(rx.poll(), Some(2));
    }

    #[test]
    fn empty_poll_is_idempotent() {
        let (_tx, mut rx) = channel::<u32>(BoxPolicy::ExactlyOnce);
        for _ in 0..10 {
            assert_eq!(rx.poll(), None);
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn offer_rejects_absent_element() {
        let (tx, mut rx) = channel::<u32>(BoxPolicy::ExactlyOnce);

        assert_eq!(tx.offer(None), Err(EnqError::InvalidElement));
        assert_eq!(tx.offer(Some(3)), Ok(()));
        assert_eq!(tx.offer(Some(4)), Err(EnqError::Full(4)));
        assert_eq!(rx.poll(), Some(3));
    }

    #[test]
    fn peek_does_not_consume() {
        let (tx, mut rx) = channel::<String>(BoxPolicy::ExactlyOnce);
        assert_eq!(rx.peek(), None);

        tx.enq("hello".to_string()).unwrap();
        assert_eq!(rx.peek().as_deref(), Some("hello"));
        assert_eq!(rx.poll().as_deref(), Some("hello"));

        let (tx, mut rx) = channel::<String>(BoxPolicy::Overwrite);
        tx.enq("a".to_string()).unwrap();
        assert_eq!(rx.peek().as_deref(), Some("a"));
        assert_eq!(rx.poll().as_deref(), Some("a"));
    }

    #[test]
    fn capacity_is_one() {
        let (tx, rx) = channel::<u8>(BoxPolicy::Overwrite);
        assert_eq!(Enqueue::capacity(&tx), Capacity::Bounded(1));
        assert_eq!(Dequeue::capacity(&rx), Capacity::Bounded(1));
    }

    #[test]
    fn drops_replaced_and_leftover_values() {
        let drops = Arc::new(AtomicUsize::new(0));

        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (tx, rx) = channel::<DropCounter>(BoxPolicy::Overwrite);
        tx.enq(DropCounter(Arc::clone(&drops))).unwrap();
        tx.enq(DropCounter(Arc::clone(&drops))).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        drop(tx);
        drop(rx);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn shared_receivers_take_each_value_once() {
        const N: u64 = 10_000;

        let (tx, rx) = shared_channel::<u64>(BoxPolicy::ExactlyOnce);
        let taken = Arc::new(AtomicUsize::new(0));
        let sum = Arc::new(AtomicUsize::new(0));

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let rx = rx.clone();
                let taken = Arc::clone(&taken);
                let sum = Arc::clone(&sum);
                thread::spawn(move || {
                    while taken.load(Ordering::SeqCst) < N as usize {
                        if let Some(v) = rx.poll() {
                            sum.fetch_add(v as usize, Ordering::SeqCst);
                            taken.fetch_add(1, Ordering::SeqCst);
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();

        for i in 0..N {
            let mut value = i;
            while let Err(Full(v)) = tx.enq(value) {
                value = v;
                std::hint::spin_loop();
            }
        }

        for c in consumers {
            c.join().unwrap();
        }

        assert_eq!(taken.load(Ordering::SeqCst), N as usize);
        assert_eq!(sum.load(Ordering::SeqCst) as u64, N * (N - 1) / 2);
        assert!(rx.is_empty());
    }
}
