//! Construction-time configuration shared by the queue constructors.

use std::fmt;

/// Capacity of a queue, as reported by `capacity()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capacity {
    /// Holds at most this many elements.
    Bounded(usize),
    /// Grows without limit.
    Unbounded,
}

impl Capacity {
    /// Returns the bound, or `None` for an unbounded queue.
    pub const fn bound(self) -> Option<usize> {
        match self {
            Self::Bounded(n) => Some(n),
            Self::Unbounded => None,
        }
    }

    /// Returns `true` for [`Capacity::Unbounded`].
    pub const fn is_unbounded(self) -> bool {
        matches!(self, Self::Unbounded)
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(n) => write!(f, "{n}"),
            Self::Unbounded => f.write_str("unbounded"),
        }
    }
}

/// What a [`BoxQueue`](crate::box_queue) does when written while occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BoxPolicy {
    /// Replace the held value. Writes always succeed; the reader only ever
    /// sees the latest value.
    Overwrite,
    /// Reject the write until the held value is consumed.
    #[default]
    ExactlyOnce,
}

/// How many threads may consume from a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Consumers {
    /// One consumer. Removal needs no CAS when producers cannot touch an
    /// occupied slot.
    #[default]
    Single,
    /// Any number of consumers racing via CAS.
    Multi,
}

/// How many threads may produce into a broadcast buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Producers {
    /// One producer. The tail advances with a plain store.
    Single,
    /// Any number of producers racing for the tail via CAS.
    #[default]
    Multi,
}

/// Rounds a requested ring capacity up to a power of two (minimum 2).
///
/// # Panics
///
/// Panics if `capacity` is 0.
pub(crate) fn ring_capacity(capacity: usize) -> usize {
    assert!(capacity > 0, "capacity must be non-zero");
    capacity.next_power_of_two().max(2)
}
