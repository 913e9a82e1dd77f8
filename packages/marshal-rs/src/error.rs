//! Structured error type for the marshaling core.
//!
//! `MarshalError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Every fallible operation in the crate returns it.
//!
//! # Fault Boundaries
//!
//! Callable faults are handled differently depending on how the work was
//! submitted:
//!
//! - **Swallowed**: panics from posted work, dispatcher messages, event
//!   handlers and fire-and-forget executor work are caught where they run and
//!   logged. The pump or publish loop keeps going.
//! - **Propagated**: panics from `send` or `execute_async` work are captured as
//!   [`MarshalError::WorkPanicked`] and handed to the one caller waiting on the
//!   result.
//!
//! # Example
//!
//! ```ignore
//! use marshal::{AsyncContext, MarshalError};
//!
//! match context.send(|| load_settings()) {
//!     Ok(settings) => apply(settings),
//!     Err(MarshalError::IllegalState { reason }) => {
//!         tracing::warn!(%reason, "context already shut down");
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::any::Any;
use std::time::Duration;

use thiserror::Error;

/// Structured error type for marshaling operations.
#[derive(Debug, Error)]
pub enum MarshalError {
    /// The operation is not valid in the component's current state.
    ///
    /// Raised for `send` on a shut-down context, pumps called off the home
    /// thread, blocking drains from a worker thread, and registrations on
    /// shut-down components.
    #[error("illegal state: {reason}")]
    IllegalState {
        /// What was violated.
        reason: &'static str,
    },

    /// The submitted work panicked while running.
    #[error("work panicked: {message}")]
    WorkPanicked {
        /// The panic payload, rendered as text.
        message: String,
    },

    /// The awaited operation was cancelled before it produced a result.
    #[error("operation was cancelled")]
    Cancelled,

    /// The result channel was dropped without ever being resolved.
    #[error("result channel dropped before the operation completed")]
    Abandoned,

    /// A bounded wait ran out before the operation completed.
    #[error("operation timed out after {duration:?}")]
    Timeout {
        /// How long we waited.
        duration: Duration,
    },

    /// Schedule options were rejected at registration time.
    #[error("invalid schedule: {reason}")]
    InvalidSchedule {
        /// Why the options were rejected.
        reason: &'static str,
    },

    /// No service is registered under the requested key.
    #[error("service not registered: {key}")]
    ServiceNotRegistered {
        /// The key that was looked up.
        key: String,
    },

    /// A service exists under the key but has a different type.
    #[error("service {key} is not a {expected}")]
    ServiceTypeMismatch {
        /// The key that was looked up.
        key: String,
        /// Type name the caller asked for.
        expected: &'static str,
    },

    /// A service factory failed while constructing an instance.
    #[error("service factory for {key} failed: {source}")]
    ServiceFactory {
        /// The key being resolved.
        key: String,
        /// The factory's error.
        #[source]
        source: anyhow::Error,
    },
}

impl MarshalError {
    /// Build a [`MarshalError::WorkPanicked`] from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        MarshalError::WorkPanicked {
            message: panic_message(payload.as_ref()),
        }
    }

    /// Returns true if this error reports a shut-down or misused component.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, MarshalError::IllegalState { .. })
    }
}

/// Render a panic payload as text.
///
/// `panic!` with a literal yields `&'static str`, with format args a `String`.
/// Anything else gets a generic message.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
