//! Runtime error taxonomy.
//!
//! The runtime never unwinds into the host for recoverable conditions:
//! errors are reported through the process's error callback and the
//! offending operation is dropped or the affected instance halted.
//! Assertion failures terminate the process; invariant violations abort.

use crate::log::MachineState;
use machina_core::ValueError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Error codes surfaced through the error callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
pub enum ErrorCode {
    /// An enqueue exceeded the event's max-instances bound or the queue
    /// capacity.
    #[error("event queue full")]
    QueueFull,

    /// No transition, do-handler, or receive case matched a dequeued event.
    #[error("unhandled event")]
    UnhandledEvent,

    /// A send to a halted or nonexistent machine, or an illegal argument at
    /// a send boundary.
    #[error("illegal send")]
    IllegalSend,

    /// An out-of-range collection access or a bad machine-id lookup.
    #[error("index out of range")]
    BadIndex,

    /// A payload that does not conform to the event's declared payload type.
    #[error("payload type mismatch")]
    TypeMismatch,

    /// A failed language-level assertion.
    #[error("assertion failed")]
    AssertionFailed,

    /// A foreign callback reported failure.
    #[error("foreign callback failed")]
    ForeignError,

    /// A violated runtime invariant. Fatal.
    #[error("runtime invariant violated")]
    InternalInvariant,
}

impl ErrorCode {
    /// Returns `true` for errors the process survives.
    ///
    /// Recoverable errors are reported and the affected operation dropped or
    /// instance halted; `AssertionFailed` terminates the process and
    /// `InternalInvariant` aborts.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ErrorCode::AssertionFailed | ErrorCode::InternalInvariant
        )
    }
}

/// A failure raised from handler code.
#[derive(Clone, Debug, Error)]
#[error("{code}: {message}")]
pub struct MachineError {
    /// The taxonomy code.
    pub code: ErrorCode,
    /// Human-readable detail for the error callback.
    pub message: String,
}

impl MachineError {
    /// Creates an error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates an assertion failure.
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AssertionFailed, message)
    }

    /// Creates a foreign-callback failure.
    pub fn foreign(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ForeignError, message)
    }
}

impl From<ValueError> for MachineError {
    fn from(err: ValueError) -> Self {
        let code = match &err {
            ValueError::IndexOutOfRange { .. } | ValueError::NoSuchField(_) => ErrorCode::BadIndex,
            ValueError::SwapAtBoundary => ErrorCode::IllegalSend,
            ValueError::UnknownForeignType(_) => ErrorCode::ForeignError,
            ValueError::KindMismatch { .. }
            | ValueError::MissingTupleType(_)
            | ValueError::ArityMismatch { .. } => ErrorCode::TypeMismatch,
        };
        Self::new(code, err.to_string())
    }
}

/// The host's error callback.
///
/// Receives the code, a snapshot of the affected machine when one exists,
/// and a message.
pub type ErrorFn = Arc<dyn Fn(ErrorCode, Option<&MachineState>, &str) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability() {
        assert!(ErrorCode::QueueFull.is_recoverable());
        assert!(ErrorCode::UnhandledEvent.is_recoverable());
        assert!(ErrorCode::TypeMismatch.is_recoverable());
        assert!(!ErrorCode::AssertionFailed.is_recoverable());
        assert!(!ErrorCode::InternalInvariant.is_recoverable());
    }

    #[test]
    fn test_value_error_mapping() {
        let err: MachineError = ValueError::NoSuchField("x".into()).into();
        assert_eq!(err.code, ErrorCode::BadIndex);
        let err: MachineError = ValueError::SwapAtBoundary.into();
        assert_eq!(err.code, ErrorCode::IllegalSend);
        let err: MachineError = ValueError::KindMismatch {
            expected: "tuple",
            found: "int",
        }
        .into();
        assert_eq!(err.code, ErrorCode::TypeMismatch);
    }

    #[test]
    fn test_display() {
        let err = MachineError::assertion("count in range");
        assert_eq!(err.to_string(), "assertion failed: count in range");
    }
}
