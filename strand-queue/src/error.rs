//! Error types shared by every queue in the crate.
//!
//! Expected conditions are not errors: an empty queue is `None`. The only
//! hard failure is [`CatchUpError`], raised by a broadcast consumer that was
//! lapped by its producer more times than it is willing to retry.

use std::fmt;

use thiserror::Error;

/// Returned when enqueueing into a bounded queue that has no free slot.
///
/// Contains the value that could not be enqueued, so the caller can retry,
/// back off or drop it.
#[derive(Clone, Copy, PartialEq, Eq, Error)]
#[error("queue is full")]
pub struct Full<T>(pub T);

impl<T> Full<T> {
    /// Returns the value that could not be enqueued.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

/// Returned by [`Enqueue::offer`](crate::Enqueue::offer).
#[derive(Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqError<T> {
    /// The queue is full. Contains the rejected value.
    #[error("queue is full")]
    Full(T),
    /// An absent element was offered. Queues never hold absent elements.
    #[error("invalid element: absent values cannot be enqueued")]
    InvalidElement,
}

impl<T> EnqError<T> {
    /// Returns the rejected value, if there was one.
    pub fn into_inner(self) -> Option<T> {
        match self {
            Self::Full(value) => Some(value),
            Self::InvalidElement => None,
        }
    }

    /// Returns `true` if this error is the `Full` variant.
    pub const fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

impl<T> From<Full<T>> for EnqError<T> {
    fn from(full: Full<T>) -> Self {
        Self::Full(full.0)
    }
}

impl<T> fmt::Debug for EnqError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::InvalidElement => f.write_str("InvalidElement"),
        }
    }
}

/// A broadcast consumer could not keep up with its producer.
///
/// The consumer jumped forward to the oldest retained element and was
/// overtaken again on every attempt. This is a capacity mismatch between
/// producer rate and buffer size, not a transient race, so it is not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("producer outran consumer: gave up after {attempts} catch-up attempts (head {head}, tail {tail})")]
pub struct CatchUpError {
    /// Number of catch-up attempts made before giving up.
    pub attempts: u32,
    /// The consumer position at the last attempt.
    pub head: u64,
    /// The producer position observed at the last attempt.
    pub tail: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_returns_value() {
        let err = Full(String::from("msg"));
        assert_eq!(err.to_string(), "queue is full");
        assert_eq!(err.into_inner(), "msg");
    }

    #[test]
    fn enq_error_from_full() {
        let err: EnqError<u32> = Full(7).into();
        assert!(err.is_full());
        assert_eq!(err.into_inner(), Some(7));

        let err = EnqError::<u32>::InvalidElement;
        assert!(!err.is_full());
        assert_eq!(err.into_inner(), None);
    }

    #[test]
    fn catch_up_error_message() {
        let err = CatchUpError {
            attempts: 31,
            head: 10,
            tail: 90,
        };
        assert!(err.to_string().contains("producer outran consumer"));
    }
}
