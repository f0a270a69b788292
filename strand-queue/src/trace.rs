//! Event logging for queue internals.
//!
//! Enable with `--features tracing`. Without the feature every macro expands
//! to nothing, so the enqueue and poll paths carry no logging cost.

/// Installs a `tracing` subscriber that prints queue events to stderr.
///
/// The filter is read from `RUST_LOG`, defaulting to `strand_queue=trace`.
/// Call it once at the start of a test or binary. Does nothing if the
/// `tracing` feature is not enabled, or if a global subscriber is already set.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("strand_queue=trace"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false),
        )
        .with(filter)
        .try_init();
}

/// Installs a `tracing` subscriber. No-op: the `tracing` feature is disabled.
#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{error, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! trace_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
macro_rules! error_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use error_noop as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use trace_noop as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use warn_noop as warn;
