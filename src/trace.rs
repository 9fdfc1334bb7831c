//! Logging macros that cost nothing unless the `tracing` feature is on.
//!
//! With the feature enabled they forward to the `tracing` crate, so a
//! subscriber installed by the embedding program sees structural events
//! like root installs and node retirements. Without it they expand to
//! nothing.

/// Trace-level logging. Expands to nothing without the `tracing`
/// feature.
#[cfg(feature = "tracing")]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_log {
    ($($arg:tt)*) => {};
}

/// Debug-level logging. Expands to nothing without the `tracing`
/// feature.
#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_log;
pub(crate) use trace_log;
