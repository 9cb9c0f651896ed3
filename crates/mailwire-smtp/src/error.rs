//! Error types for SMTP operations.

use std::io;
use std::time::Duration;

use crate::types::Reply;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP error types.
///
/// Variants fall into four groups: transport faults, framing violations,
/// size limits and protocol errors. [`Error::is_fatal`] tells which of them
/// leave the connection unusable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// A read or write did not complete within the configured deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The peer closed the connection.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// A command or reply line exceeded the configured maximum.
    ///
    /// The offending line has already been discarded through its terminator,
    /// so the stream is positioned at the start of the next line.
    #[error("Line exceeds maximum length of {0} bytes")]
    LineTooLong(usize),

    /// The stream ended before the `.` terminator of a DATA body.
    #[error("Connection closed before end of message body")]
    IncompleteBody,

    /// A DATA body exceeded the configured cap.
    ///
    /// Raised only after the body was drained up to its terminator.
    #[error("Message body exceeds limit of {0} bytes")]
    BodyTooLarge(u64),

    /// The stream ended before a BDAT chunk's declared size was read.
    #[error("Connection closed with {missing} bytes of BDAT chunk outstanding")]
    IncompleteChunk {
        /// Bytes still owed by the peer.
        missing: u64,
    },

    /// A BDAT header could not be parsed, so the payload size is unknown.
    #[error("Invalid BDAT header: {0}")]
    InvalidChunkHeader(String),

    /// A single BDAT chunk exceeded the per-chunk cap.
    #[error("BDAT chunk of {size} bytes exceeds limit of {limit} bytes")]
    ChunkTooLarge {
        /// Declared chunk size.
        size: u64,
        /// Configured limit.
        limit: u64,
    },

    /// The message as a whole exceeded the size limit.
    #[error("Message exceeds size limit of {0} bytes")]
    MessageTooLarge(u64),

    /// Command arguments are syntactically invalid.
    #[error("Syntax error: {0}")]
    Syntax(String),

    /// The command verb is not recognized.
    #[error("Unrecognized command: {0}")]
    UnknownCommand(String),

    /// Server returned error response.
    #[error("SMTP error {code}: {message}")]
    SmtpError {
        /// Reply code (e.g., 550).
        code: u16,
        /// Error message from server.
        message: String,
    },

    /// Protocol error (unexpected response).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// Feature not supported by server.
    #[error("Server does not support {0}")]
    NotSupported(String),

    /// Invalid state for operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),
}

impl Error {
    /// Creates an SMTP error from a reply code and message.
    #[must_use]
    pub fn smtp_error(code: u16, message: impl Into<String>) -> Self {
        Self::SmtpError {
            code,
            message: message.into(),
        }
    }

    /// Creates an SMTP error carrying a server reply.
    #[must_use]
    pub fn from_reply(reply: &Reply) -> Self {
        Self::smtp_error(reply.code.as_u16(), reply.message_text())
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::SmtpError { code, .. } if *code >= 500 && *code < 600)
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::SmtpError { code, .. } if *code >= 400 && *code < 500)
    }

    /// Returns true if the connection cannot be used after this error.
    ///
    /// Transport faults and framing violations are fatal. Size limits,
    /// syntax errors and rejected commands leave the stream synchronized.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Tls(_)
                | Self::Timeout(_)
                | Self::ConnectionClosed
                | Self::IncompleteBody
                | Self::IncompleteChunk { .. }
                | Self::InvalidChunkHeader(_)
                | Self::Protocol(_)
        )
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn reply_classification() {
        assert!(Error::smtp_error(550, "no such user").is_permanent());
        assert!(Error::smtp_error(451, "try later").is_transient());
        assert!(!Error::smtp_error(451, "try later").is_permanent());
        assert!(!Error::Protocol("x".into()).is_transient());
    }

    #[test]
    fn framing_errors_are_fatal() {
        assert!(Error::IncompleteBody.is_fatal());
        assert!(Error::IncompleteChunk { missing: 3 }.is_fatal());
        assert!(Error::InvalidChunkHeader("BDAT x".into()).is_fatal());
        assert!(Error::Timeout(Duration::from_secs(1)).is_fatal());
        assert!(Error::ConnectionClosed.is_fatal());
    }

    #[test]
    fn limits_are_recoverable() {
        assert!(!Error::LineTooLong(512).is_fatal());
        assert!(!Error::BodyTooLarge(10).is_fatal());
        assert!(!Error::ChunkTooLarge { size: 10, limit: 5 }.is_fatal());
        assert!(!Error::MessageTooLarge(10).is_fatal());
        assert!(!Error::Syntax("bad".into()).is_fatal());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::ChunkTooLarge { size: 10, limit: 5 };
        assert_eq!(
            err.to_string(),
            "BDAT chunk of 10 bytes exceeds limit of 5 bytes"
        );
        assert_eq!(
            Error::smtp_error(554, "rejected").to_string(),
            "SMTP error 554: rejected"
        );
    }
}
