//! Error types shared across the server.
//!
//! Hook handlers reject with [`HookError`], a `{code, reason, message}`
//! record: `code` maps onto a close code or HTTP status, `reason` is sent to
//! the client, `message` is for the host log. Everything else is a plain
//! `thiserror` enum.

use thiserror::Error;

/// Failure value returned by extension hook handlers.
///
/// All fields are optional; the kernel substitutes protocol-appropriate
/// fallbacks (`Forbidden`, `"permission-denied"`, silence) for whatever the
/// handler leaves out.
#[derive(Debug, Clone, Default)]
pub struct HookError {
    /// Close code (or HTTP status for request-scoped hooks).
    pub code: Option<u16>,
    /// Client-visible reason string.
    pub reason: Option<String>,
    /// Host-visible log message.
    pub message: Option<String>,
}

impl HookError {
    /// A rejection that only carries a log message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// A rejection that carries a client-visible reason.
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Attach a close code (or HTTP status) to the rejection.
    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    /// Whether the error carries a non-empty log message.
    pub fn has_message(&self) -> bool {
        self.message.as_deref().is_some_and(|m| !m.is_empty())
    }
}

impl std::fmt::Display for HookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(message) = self.message.as_deref().filter(|m| !m.is_empty()) {
            return write!(f, "{message}");
        }
        if let Some(reason) = self.reason.as_deref().filter(|r| !r.is_empty()) {
            return write!(f, "{reason}");
        }
        write!(f, "hook rejected")
    }
}

impl std::error::Error for HookError {}

impl From<String> for HookError {
    fn from(message: String) -> Self {
        HookError::message(message)
    }
}

impl From<&str> for HookError {
    fn from(message: &str) -> Self {
        HookError::message(message)
    }
}

/// A hook chain failure, naming the hook and extension that rejected.
#[derive(Debug, Clone, Error)]
#[error("{hook} rejected by extension `{extension}`: {error}")]
pub struct HookChainError {
    /// Name of the hook that failed.
    pub hook: &'static str,
    /// Name of the extension whose handler rejected.
    pub extension: String,
    /// The handler's rejection value.
    pub error: HookError,
}

impl HookChainError {
    pub(crate) fn new(hook: &'static str, extension: &str, error: HookError) -> Self {
        Self {
            hook,
            extension: extension.to_string(),
            error,
        }
    }
}

/// Wire codec failures. Any of these on a live transport is a protocol
/// error and closes the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unexpected end of message")]
    UnexpectedEof,
    #[error("variable-length integer overflows 64 bits")]
    VarIntOverflow,
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("unknown sync subtype {0}")]
    UnknownSyncType(u64),
    #[error("unexpected auth subtype {0}")]
    UnexpectedAuthType(u64),
}

/// Failures while applying protocol payloads to a document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("failed to decode update: {0}")]
    InvalidUpdate(String),
    #[error("failed to apply update: {0}")]
    ApplyFailed(String),
    #[error("awareness update rejected: {0}")]
    Awareness(String),
}

/// Failures while dispatching a message on an attached connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}
