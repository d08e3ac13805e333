//! Centralized error types for mailcatch.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the mailcatch library.
#[derive(Error, Debug)]
pub enum MailcatchError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Network I/O error on an SMTP connection.
    #[error("Connection error: {0}")]
    Connection(#[source] std::io::Error),

    /// The header block or MIME structure could not be parsed.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// An attachment could not be written.
    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    /// The record database rejected an operation.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored attachment list could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The SMTP peer answered with an unexpected reply.
    #[error("Unexpected SMTP reply {code}: {text}")]
    Protocol { code: u16, text: String },
}

/// A command arrived out of order within an SMTP transaction.
///
/// Recovered inside the session: the client gets a 503 and the
/// transaction state is left untouched.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceError {
    #[error("need MAIL command")]
    NeedMail,
    #[error("need RCPT command")]
    NeedRcpt,
    #[error("nested MAIL command")]
    NestedMail,
}

/// Convenience alias for `Result<T, MailcatchError>`.
pub type Result<T> = std::result::Result<T, MailcatchError>;

impl MailcatchError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the message itself was bad, as opposed to
    /// a failure on our side while storing it.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedMessage(_))
    }
}

impl From<std::io::Error> for MailcatchError {
    fn from(source: std::io::Error) -> Self {
        Self::Connection(source)
    }
}
