//! Structured error type shared by every layer, the event loop, and the
//! state-machine runtime.
//!
//! The source this crate is modeled on returns sentinel integer codes
//! (`M_IO_ERROR_*`) from nearly every call. Rust's `Result` makes the
//! "success" sentinel redundant, so `IoErrorKind` only enumerates the
//! failure cases; success is simply `Ok(())` / `Ok(n)`.

use std::fmt;
use std::io;

/// The kind of failure carried by an [`IoError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoErrorKind {
    /// The operation could not complete without blocking; not a failure,
    /// callers should retry on the next readiness notification.
    WouldBlock,
    /// The remote end closed the connection.
    Disconnect,
    /// A generic I/O or protocol failure.
    Error,
    /// Caller passed invalid arguments or invoked an operation on a handle
    /// that does not support it (e.g. misuse, not protocol/transport
    /// failure).
    Invalid,
    /// The operation is recognized but not implemented.
    NotImpl,
}

impl IoErrorKind {
    /// Whether this kind should be treated as a real failure rather than a
    /// transient condition a layer can silently retry.
    pub fn is_critical(self) -> bool {
        !matches!(self, IoErrorKind::WouldBlock)
    }

    fn as_str(self) -> &'static str {
        match self {
            IoErrorKind::WouldBlock => "would block",
            IoErrorKind::Disconnect => "disconnected",
            IoErrorKind::Error => "I/O error",
            IoErrorKind::Invalid => "invalid argument",
            IoErrorKind::NotImpl => "not implemented",
        }
    }
}

impl fmt::Display for IoErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error surfaced by a layer, the event loop, or the state-machine
/// runtime.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct IoError {
    pub kind: IoErrorKind,
    pub message: String,
}

impl IoError {
    pub fn new(kind: IoErrorKind, message: impl Into<String>) -> Self {
        IoError {
            kind,
            message: message.into(),
        }
    }

    pub fn would_block() -> Self {
        IoError::new(IoErrorKind::WouldBlock, "operation would block")
    }

    pub fn disconnect() -> Self {
        IoError::new(IoErrorKind::Disconnect, "connection closed")
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        IoError::new(IoErrorKind::Invalid, message)
    }

    pub fn not_impl() -> Self {
        IoError::new(IoErrorKind::NotImpl, "not implemented")
    }

    pub fn is_critical(&self) -> bool {
        self.kind.is_critical()
    }
}

impl From<io::Error> for IoError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => IoError::would_block(),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => IoError::disconnect(),
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                IoError::invalid(e.to_string())
            }
            _ => IoError::new(IoErrorKind::Error, e.to_string()),
        }
    }
}

pub type IoResult<T> = Result<T, IoError>;
