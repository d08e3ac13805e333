//! Core message types: the SMTP envelope, the decomposed message, and the
//! persisted record.

use super::attachment::{AttachmentBlob, AttachmentRef};

/// Envelope addresses negotiated during the SMTP transaction
/// (`MAIL FROM` / `RCPT TO`), independent of the message headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
}

/// Raw DATA payload plus its envelope. Lives for one DATA command.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub envelope: Envelope,
    pub content: Vec<u8>,
}

/// Output of the MIME decomposer, before any attachment touches disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecomposedMessage {
    pub sender: String,
    pub recipients: String,
    pub subject: String,
    pub date: String,
    pub body: String,
    /// In the order the attachment parts appear in the message tree.
    pub attachments: Vec<AttachmentBlob>,
}

/// A fully ingested message whose attachments have been stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEmail {
    /// `From:` header, or the envelope sender when absent.
    pub sender: String,

    /// `To:` header, or the envelope recipients joined with `", "`.
    pub recipients: String,

    /// `Subject:` header, or [`NO_SUBJECT`].
    pub subject: String,

    /// `Date:` header, or the local time of receipt.
    pub date: String,

    /// Concatenated decoded text of every non-attachment leaf part.
    pub body: String,

    /// Stored attachments, in message-tree order.
    pub attachments: Vec<AttachmentRef>,
}

/// Subject used when a message carries no `Subject:` header.
pub const NO_SUBJECT: &str = "(No Subject)";

/// One row of the message record store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MessageRecord {
    /// Assigned by the store; strictly increasing.
    pub id: i64,
    pub sender: String,
    pub recipients: String,
    pub subject: String,
    pub body: String,
    pub date: String,
    /// Storage paths of the attachments, in message-tree order.
    pub attachments: Vec<String>,
}
