//! Multi-producer queues with a single, privileged consumer.
//!
//! Any number of producers append concurrently. The one consumer may poll,
//! peek, and also walk the queue with a [`QueueIterator`] and remove
//! arbitrary elements while producers keep appending. That is the selective
//! receive an actor needs to pick a reply out of a mailbox full of unrelated
//! messages.
//!
//! Two storage strategies share the contract:
//!
//! - [`array`]: bounded ring; removal from the middle compacts the elements
//!   in front of the removed one
//! - [`linked`]: unbounded chain of fixed-size blocks; removal leaves a
//!   tombstone that polling skips
//!
//! The consumer handle of both is neither `Clone` nor shareable for mutation:
//! everything that moves the head takes `&mut self`, so concurrent consumers
//! cannot be expressed.

pub mod array;
pub mod linked;

use crate::queue::QueueIterator;

/// Removes and returns the first element accepted by `accept`, leaving every
/// other element in place.
pub(crate) fn take_first<T, I>(mut iter: I, mut accept: impl FnMut(&T) -> bool) -> Option<T>
where
    I: QueueIterator<T>,
{
    while let Some(value) = iter.next() {
        if accept(value) {
            return iter.remove();
        }
    }
    None
}
