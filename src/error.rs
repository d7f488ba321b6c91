//! Error types for taskforge operations.

use std::fmt;
use thiserror::Error;

/// Result type used throughout taskforge.
pub type ForgeResult<T> = Result<T, ForgeError>;

/// Boxed error used as the wrapped cause of an [`OpError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical error code attached to store-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCode {
    /// No code was given
    #[default]
    Unspecified,
    /// The referenced task or queue does not exist
    NotFound,
    /// The operation was rejected because the system is not in the required state
    FailedPrecondition,
    /// Internal invariant of the store was broken
    Internal,
    /// The entity already exists
    AlreadyExists,
    /// Unknown failure
    Unknown,
}

impl ErrorCode {
    /// Stable upper-case label of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unspecified => "ERROR_CODE_UNSPECIFIED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::Internal => "INTERNAL_ERROR",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coded error raised by a named operation, e.g. `"memory.done"`.
///
/// `Display` gives the terse form (`CODE: cause`), [`OpError::debug_string`]
/// the verbose one which is prefixed by the operation name.
#[derive(Debug)]
pub struct OpError {
    /// Canonical code
    pub code: ErrorCode,
    /// Operation that produced the error
    pub op: Option<&'static str>,
    /// Wrapped cause
    pub source: Option<BoxError>,
}

impl OpError {
    /// Create an error for `op` with the given code and message.
    pub fn new(op: &'static str, code: ErrorCode, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self {
            code,
            op: Some(op),
            source: Some(message.into()),
        }
    }

    /// Create an error for `op` wrapping an underlying error.
    pub fn wrap<E>(op: &'static str, code: ErrorCode, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            code,
            op: Some(op),
            source: Some(Box::new(source)),
        }
    }

    /// Verbose rendering including the operation name.
    pub fn debug_string(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(3);
        if let Some(op) = self.op {
            parts.push(op.to_string());
        }
        if self.code != ErrorCode::Unspecified {
            parts.push(self.code.to_string());
        }
        if let Some(source) = &self.source {
            parts.push(source.to_string());
        }
        parts.join(": ")
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, &self.source) {
            (ErrorCode::Unspecified, Some(source)) => write!(f, "{source}"),
            (ErrorCode::Unspecified, None) => Ok(()),
            (code, Some(source)) => write!(f, "{code}: {source}"),
            (code, None) => write!(f, "{code}"),
        }
    }
}

impl std::error::Error for OpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Main error type for taskforge operations.
#[derive(Error, Debug)]
pub enum ForgeError {
    /// No task is ready in any of the polled queues
    #[error("no tasks are ready for processing")]
    NoProcessableTask,

    /// Another task holds the uniqueness lock for the same key
    #[error("task already exists")]
    DuplicateTask,

    /// Store-level failure carrying a canonical code
    #[error(transparent)]
    Op(#[from] OpError),

    /// The execution context was canceled
    #[error("context canceled")]
    Canceled,

    /// The execution context deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// No handler is registered for the task type
    #[error("handler not found for task {task_type:?}")]
    HandlerNotFound {
        /// The task type that could not be routed
        task_type: String,
    },

    /// Handler reported a failure
    #[error("task execution failed: {message}")]
    TaskFailed {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// Handler panicked while processing a task
    #[error("task handler panicked: {message}")]
    Panicked {
        /// Panic description
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// Engine is already running
    #[error("engine is already running")]
    AlreadyRunning,

    /// Engine is not running
    #[error("engine is not running")]
    NotRunning,
}

impl ForgeError {
    /// Create a handler failure with a message.
    pub fn task_failed(message: impl Into<String>) -> Self {
        Self::TaskFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a handler failure wrapping an underlying error.
    pub fn task_execution<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::TaskFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a coded store error.
    pub fn op(op: &'static str, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Op(OpError::new(op, code, message))
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Canonical code of this error, [`ErrorCode::Unspecified`] for non-store errors.
    pub fn code(&self) -> ErrorCode {
        match self {
            ForgeError::Op(e) => e.code,
            _ => ErrorCode::Unspecified,
        }
    }

    /// Verbose rendering; identical to `Display` except for store errors.
    pub fn debug_string(&self) -> String {
        match self {
            ForgeError::Op(e) => e.debug_string(),
            other => other.to_string(),
        }
    }

    /// Whether the error came from the execution context rather than the handler.
    pub fn is_context_error(&self) -> bool {
        matches!(self, ForgeError::Canceled | ForgeError::DeadlineExceeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_error_renderings() {
        let err = ForgeError::op("memory.done", ErrorCode::NotFound, "no such task: abc");
        assert_eq!(err.to_string(), "NOT_FOUND: no such task: abc");
        assert_eq!(err.debug_string(), "memory.done: NOT_FOUND: no such task: abc");
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_unspecified_code_is_omitted() {
        let err = OpError {
            code: ErrorCode::Unspecified,
            op: Some("memory.ping"),
            source: Some("closed".into()),
        };
        assert_eq!(err.to_string(), "closed");
        assert_eq!(err.debug_string(), "memory.ping: closed");
    }

    #[test]
    fn test_wrapped_source_is_exposed() {
        let io = std::io::Error::other("connection reset");
        let err = OpError::wrap("memory.dequeue", ErrorCode::Internal, io);
        assert_eq!(err.to_string(), "INTERNAL_ERROR: connection reset");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_sentinels_and_not_found() {
        assert_eq!(
            ForgeError::NoProcessableTask.to_string(),
            "no tasks are ready for processing"
        );
        assert_eq!(ForgeError::DuplicateTask.to_string(), "task already exists");

        let err = ForgeError::HandlerNotFound {
            task_type: "xyz".to_string(),
        };
        assert_eq!(err.to_string(), "handler not found for task \"xyz\"");
        assert!(ForgeError::DeadlineExceeded.is_context_error());
        assert!(!err.is_context_error());
    }

    #[test]
    fn test_code_labels() {
        assert_eq!(ErrorCode::Unspecified.as_str(), "ERROR_CODE_UNSPECIFIED");
        assert_eq!(ErrorCode::FailedPrecondition.as_str(), "FAILED_PRECONDITION");
        assert_eq!(ErrorCode::Internal.as_str(), "INTERNAL_ERROR");
        assert_eq!(ErrorCode::AlreadyExists.as_str(), "ALREADY_EXISTS");
        assert_eq!(ErrorCode::Unknown.as_str(), "UNKNOWN");
    }
}
