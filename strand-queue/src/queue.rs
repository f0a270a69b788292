//! The contracts a mailbox or channel layer programs against.

use crate::config::Capacity;
use crate::error::{EnqError, Full};

/// Producer side of a queue.
pub trait Enqueue<T> {
    /// Attempts to add `value` at the tail.
    ///
    /// # Errors
    ///
    /// Returns [`Full`] with the value when a bounded queue has no room.
    /// That is backpressure, not a failure: retry, back off or drop.
    fn enq(&self, value: T) -> Result<(), Full<T>>;

    /// The queue's fixed capacity, or [`Capacity::Unbounded`].
    fn capacity(&self) -> Capacity;

    /// Enqueues a possibly absent element.
    ///
    /// # Errors
    ///
    /// Returns [`EnqError::InvalidElement`] for `None`, or
    /// [`EnqError::Full`] when the queue has no room.
    fn offer(&self, value: Option<T>) -> Result<(), EnqError<T>> {
        match value {
            Some(value) => self.enq(value).map_err(EnqError::from),
            None => Err(EnqError::InvalidElement),
        }
    }
}

/// Consumer side of a queue.
pub trait Dequeue<T> {
    /// Removes and returns the head element, or `None` if nothing is
    /// currently visible.
    fn poll(&mut self) -> Option<T>;

    /// Number of elements in the queue. May be stale as soon as it returns.
    fn size(&self) -> usize;

    /// Returns `true` if [`size`](Self::size) is zero.
    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The queue's fixed capacity, or [`Capacity::Unbounded`].
    fn capacity(&self) -> Capacity;
}

/// Consumer-only cursor over a single-consumer queue.
///
/// The cursor starts before the first element. [`next`](Self::next) moves it
/// onto the following element; [`remove`](Self::remove) deletes the element
/// under the cursor, after which `next` continues with the element that
/// followed it. Elements enqueued while iterating become visible when the
/// cursor reaches them.
pub trait QueueIterator<T> {
    /// Returns `true` if there is an element after the cursor.
    fn has_next(&mut self) -> bool;

    /// Advances to the next element and returns it.
    fn next(&mut self) -> Option<&T>;

    /// The element under the cursor, if the cursor is on one.
    fn value(&self) -> Option<&T>;

    /// Removes the element under the cursor and returns it.
    ///
    /// Returns `None` if the cursor is not on an element (before the first
    /// call to `next`, or right after a `remove`).
    fn remove(&mut self) -> Option<T>;

    /// Moves the cursor back before the first element.
    fn reset(&mut self);
}
