//! Error types for the marshaling substrate.
//!
//! Two layers live here:
//!
//! - [`ErrorCode`]: the engine's own error table. Every status that crosses the
//!   ABI is one of these integers.
//! - [`BindError`]: the closed set of failures the core surfaces to its
//!   callers. Each variant maps to a stable [`ErrorCode`] through
//!   [`BindError::code`], so a failure can be handed back to the engine's
//!   error-reporting convention without loss.
//!
//! ## Example
//!
//! ```
//! use enginebind_core::{BindError, ErrorCode};
//!
//! assert!(ErrorCode::check(0).is_ok());
//! assert!(matches!(
//!     ErrorCode::check(31),
//!     Err(BindError::Engine(ErrorCode::InvalidParameter))
//! ));
//! ```

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Result alias used throughout the workspace.
pub type BindResult<T> = Result<T, BindError>;

/// Status codes of the engine's error-reporting convention.
///
/// The numeric values are part of the ABI and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum ErrorCode {
    /// Operation completed successfully.
    Ok = 0,
    /// Generic failure.
    Failed = 1,
    /// Resource is unavailable.
    Unavailable = 2,
    /// Resource is not configured.
    Unconfigured = 3,
    /// Caller is not authorized.
    Unauthorized = 4,
    /// Parameter out of the accepted range.
    ParameterRangeError = 5,
    /// Allocation failed.
    OutOfMemory = 6,
    FileNotFound = 7,
    FileBadDrive = 8,
    FileBadPath = 9,
    FileNoPermission = 10,
    FileAlreadyInUse = 11,
    FileCantOpen = 12,
    FileCantWrite = 13,
    FileCantRead = 14,
    FileUnrecognized = 15,
    FileCorrupt = 16,
    FileMissingDependencies = 17,
    FileEof = 18,
    CantOpen = 19,
    /// Object could not be created.
    CantCreate = 20,
    QueryFailed = 21,
    /// Resource is already in use.
    AlreadyInUse = 22,
    Locked = 23,
    /// Operation timed out.
    Timeout = 24,
    /// Connection could not be established.
    CantConnect = 25,
    CantResolve = 26,
    ConnectionError = 27,
    CantAcquireResource = 28,
    CantFork = 29,
    /// Payload is inconsistent.
    InvalidData = 30,
    /// Parameter has the wrong type or value.
    InvalidParameter = 31,
    /// Entity already exists.
    AlreadyExists = 32,
    /// Entity does not exist.
    DoesNotExist = 33,
    DatabaseCantRead = 34,
    DatabaseCantWrite = 35,
    CompilationFailed = 36,
    /// Method-bind lookup failed.
    MethodNotFound = 37,
    LinkFailed = 38,
    ScriptFailed = 39,
    CyclicLink = 40,
    InvalidDeclaration = 41,
    DuplicateSymbol = 42,
    /// Input could not be parsed.
    ParseError = 43,
    Busy = 44,
    Skip = 45,
    Help = 46,
    Bug = 47,
    PrinterOnFire = 48,
}

impl ErrorCode {
    /// Turn a raw status into `Ok(())` or `Err(BindError::Engine(..))`.
    ///
    /// Codes outside the table are reported as [`ErrorCode::Failed`] rather
    /// than dropped, so an engine failure is never swallowed.
    pub fn check(code: i32) -> BindResult<()> {
        match ErrorCode::try_from(code) {
            Ok(ErrorCode::Ok) => Ok(()),
            Ok(other) => Err(BindError::Engine(other)),
            Err(_) => Err(BindError::Engine(ErrorCode::Failed)),
        }
    }

    /// Convert this code into a `Result`, treating [`ErrorCode::Ok`] as success.
    pub fn into_result(self) -> BindResult<()> {
        match self {
            ErrorCode::Ok => Ok(()),
            other => Err(BindError::Engine(other)),
        }
    }

    /// Raw integer value.
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.into()
    }
}

/// Outcome of a reverse call (engine → host), reported back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum CallStatus {
    /// The call completed. Host-side failures are also reported as `Ok`
    /// after being routed to the diagnostic sink.
    Ok = 0,
    /// No host override exists; the engine should run its default behaviour.
    NotOverridden = 1,
    /// The receiver instance is gone.
    InstanceIsNull = 2,
    /// The method is unknown to the callee.
    InvalidMethod = 3,
}

/// Failures surfaced by the core.
#[derive(Debug, Error)]
pub enum BindError {
    /// Downcast to an incompatible class or variant unpack with the wrong
    /// expected type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// The type that was expected.
        expected: String,
        /// The type that was found.
        actual: String,
    },

    /// Use of a handle whose engine object has been released.
    #[error("null handle: {class} object is no longer alive")]
    NullHandle {
        /// Class view of the handle that was used.
        class: String,
    },

    /// Lookup of an unknown class or override.
    #[error("not registered: {class}{}", member.as_deref().map(|m| format!("::{m}")).unwrap_or_default())]
    NotRegistered {
        /// The class that was looked up.
        class: String,
        /// The member (method) that was looked up, if any.
        member: Option<String>,
    },

    /// The engine reported a non-OK status.
    #[error("engine error: {0:?}")]
    Engine(ErrorCode),

    /// A variant or packed buffer carried an inconsistent payload.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the inconsistency.
        message: String,
    },

    /// Argument count does not match the resolved method-bind.
    #[error("arity mismatch calling {method}: expected {expected} argument(s), got {found}")]
    ArityMismatch {
        /// `Class::method` of the call.
        method: String,
        /// Arity reported by the engine.
        expected: u32,
        /// Arguments staged in the frame.
        found: u32,
    },

    /// Handles still owned by the host at shutdown.
    #[error("{count} engine object(s) leaked at shutdown")]
    Leak {
        /// Number of leaked records.
        count: usize,
    },

    /// A host class was registered twice.
    #[error("class '{class}' is already registered")]
    AlreadyRegistered {
        /// The duplicate class tag.
        class: String,
    },

    /// The process-wide runtime was installed twice.
    #[error("runtime already initialized")]
    AlreadyInitialized,

    /// A host callable invoked by the engine failed.
    #[error("host callable failed: {0}")]
    Host(#[from] anyhow::Error),
}

impl BindError {
    /// Build a [`BindError::TypeMismatch`].
    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        BindError::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Build a [`BindError::Codec`].
    pub fn codec(message: impl Into<String>) -> Self {
        BindError::Codec {
            message: message.into(),
        }
    }

    /// Build a [`BindError::NotRegistered`] for a class.
    pub fn not_registered(class: impl Into<String>) -> Self {
        BindError::NotRegistered {
            class: class.into(),
            member: None,
        }
    }

    /// Build a [`BindError::NotRegistered`] for a class member.
    pub fn member_not_registered(class: impl Into<String>, member: impl Into<String>) -> Self {
        BindError::NotRegistered {
            class: class.into(),
            member: Some(member.into()),
        }
    }

    /// Stable engine error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            BindError::TypeMismatch { .. } => ErrorCode::InvalidParameter,
            BindError::NullHandle { .. } => ErrorCode::Unavailable,
            BindError::NotRegistered { .. } => ErrorCode::DoesNotExist,
            BindError::Engine(code) => *code,
            BindError::Codec { .. } => ErrorCode::InvalidData,
            BindError::ArityMismatch { .. } => ErrorCode::ParameterRangeError,
            BindError::Leak { .. } => ErrorCode::Failed,
            BindError::AlreadyRegistered { .. } => ErrorCode::AlreadyExists,
            BindError::AlreadyInitialized => ErrorCode::AlreadyInUse,
            BindError::Host(_) => ErrorCode::Failed,
        }
    }

    /// Whether this failure indicates a code generation bug.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BindError::ArityMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_ok_and_failures() {
        assert!(ErrorCode::check(0).is_ok());
        assert!(matches!(
            ErrorCode::check(22),
            Err(BindError::Engine(ErrorCode::AlreadyInUse))
        ));
    }

    #[test]
    fn check_unknown_code_is_not_swallowed() {
        assert!(matches!(
            ErrorCode::check(9999),
            Err(BindError::Engine(ErrorCode::Failed))
        ));
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::Ok.as_i32(), 0);
        assert_eq!(ErrorCode::Failed.as_i32(), 1);
        assert_eq!(ErrorCode::Unavailable.as_i32(), 2);
        assert_eq!(ErrorCode::OutOfMemory.as_i32(), 6);
        assert_eq!(ErrorCode::CantCreate.as_i32(), 20);
        assert_eq!(ErrorCode::Timeout.as_i32(), 24);
        assert_eq!(ErrorCode::InvalidData.as_i32(), 30);
        assert_eq!(ErrorCode::DoesNotExist.as_i32(), 33);
        assert_eq!(ErrorCode::ParseError.as_i32(), 43);
    }

    #[test]
    fn bind_error_codes() {
        assert_eq!(
            BindError::type_mismatch("int", "string").code(),
            ErrorCode::InvalidParameter
        );
        assert_eq!(BindError::not_registered("Foo").code(), ErrorCode::DoesNotExist);
        assert_eq!(BindError::codec("bad").code(), ErrorCode::InvalidData);
        assert_eq!(
            BindError::Engine(ErrorCode::Timeout).code(),
            ErrorCode::Timeout
        );
    }

    #[test]
    fn display() {
        let err = BindError::type_mismatch("Derived", "Base");
        assert_eq!(format!("{err}"), "type mismatch: expected Derived, got Base");

        let err = BindError::member_not_registered("Player", "poll");
        assert_eq!(format!("{err}"), "not registered: Player::poll");

        let err = BindError::not_registered("Player");
        assert_eq!(format!("{err}"), "not registered: Player");
    }

    #[test]
    fn arity_mismatch_is_fatal() {
        let err = BindError::ArityMismatch {
            method: "Node::add_child".into(),
            expected: 1,
            found: 2,
        };
        assert!(err.is_fatal());
        assert!(!BindError::AlreadyInitialized.is_fatal());
    }
}
