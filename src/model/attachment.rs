//! Attachment payloads and the references handed out once they are stored.

use std::path::PathBuf;

/// A decoded attachment payload, as produced by the MIME decomposer.
///
/// Exists only between decomposition and the attachment store write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentBlob {
    /// Filename exactly as declared by the part (`filename=` or `name=`).
    pub filename: String,

    /// Payload after transfer decoding (base64, quoted-printable).
    pub data: Vec<u8>,
}

/// Stable reference to an attachment written by the
/// [`AttachmentStore`](crate::store::attachments::AttachmentStore).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AttachmentRef {
    /// Filename as declared in the message.
    pub filename: String,

    /// Where the bytes live on disk. May differ from `filename` after
    /// sanitizing or collision renaming.
    pub storage_path: PathBuf,
}
