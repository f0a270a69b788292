//! # strand-queue
//!
//! Lock-free queues used as the transport layer beneath a lightweight-thread
//! runtime: actor mailboxes, channels and sampling buffers.
//!
//! ## Queue family
//!
//! - [`box_queue`]: capacity-1 mailbox, either lossy (latest value wins) or
//!   exactly-once (rejects while occupied)
//! - [`array_queue`]: bounded MPMC ring, CAS on both ends
//! - [`broadcast`]: overwrite-on-full ring read by any number of independent
//!   consumers, each with its own cursor
//! - [`single_consumer::array`]: bounded MPSC ring whose consumer may iterate
//!   and remove arbitrary elements (selective receive)
//! - [`single_consumer::linked`]: unbounded MPSC queue of linked blocks with
//!   the same iteration contract
//!
//! ## Design Goals
//!
//! - No locks anywhere: CAS for index advancement, release stores for
//!   publication, acquire loads on the consumer side
//! - Cache-line isolation of independently contended counters
//! - Single-consumer discipline enforced by the type system: consumer-only
//!   operations take `&mut self` on a handle that is neither `Clone` nor `Sync`
//! - No blocking: a full queue returns [`Full`], an empty one returns `None`;
//!   scheduling integration is the caller's job
//!
//! ## Example
//!
//! ```
//! use strand_queue::single_consumer::array;
//! use strand_queue::QueueIterator;
//!
//! let (tx, mut rx) = array::channel::<&str>(8);
//!
//! for msg in ["a", "b", "c", "d"] {
//!     tx.enq(msg).unwrap();
//! }
//!
//! // Selective receive: pull "c" out of the middle of the mailbox.
//! let mut it = rx.iter();
//! while let Some(&msg) = it.next() {
//!     if msg == "c" {
//!         it.remove();
//!     }
//! }
//!
//! assert_eq!(rx.poll(), Some("a"));
//! assert_eq!(rx.poll(), Some("b"));
//! assert_eq!(rx.poll(), Some("d"));
//! assert_eq!(rx.poll(), None);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod backoff;
mod config;
mod error;
mod queue;
mod slot;
mod trace;

pub mod array_queue;
pub mod box_queue;
pub mod broadcast;
pub mod single_consumer;

pub use config::{BoxPolicy, Capacity, Consumers, Producers};
pub use error::{CatchUpError, EnqError, Full};
pub use queue::{Dequeue, Enqueue, QueueIterator};
pub use trace::init_tracing;
