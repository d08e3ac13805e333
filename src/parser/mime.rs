//! MIME decomposition: turns a raw RFC 5322 message into header fields,
//! a plain body string, and the list of attachment payloads.
//!
//! Pure: nothing here touches the filesystem.

use mail_parser::{Message, MessageParser, MessagePart, MimeHeaders, PartType};
use tracing::{debug, warn};

use crate::error::{MailcatchError, Result};
use crate::model::attachment::AttachmentBlob;
use crate::model::mail::{DecomposedMessage, Envelope, NO_SUBJECT};
use crate::parser::header;

/// Format of the receipt timestamp used when a message has no `Date:` header.
pub const FALLBACK_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// How a single MIME part contributes to the decomposed message.
///
/// Precedence: a multipart container wins over everything, then an
/// `attachment` disposition with a filename, then an embedded message that
/// is walked in place. Everything else is body text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartClass<'a> {
    /// Groups other parts; contributes nothing itself.
    Container,
    /// Saved to the attachment store under `filename`.
    Attachment { filename: &'a str },
    /// Decoded and appended to the body.
    Body,
}

/// Classify one part of the message tree.
pub fn classify<'a>(part: &'a MessagePart<'_>) -> PartClass<'a> {
    if matches!(part.body, PartType::Multipart(_)) {
        return PartClass::Container;
    }

    let is_attachment = part
        .content_disposition()
        .is_some_and(|d| d.ctype().eq_ignore_ascii_case("attachment"));
    if is_attachment {
        if let Some(filename) = part.attachment_name().filter(|n| !n.is_empty()) {
            return PartClass::Attachment { filename };
        }
    }

    if matches!(part.body, PartType::Message(_)) {
        return PartClass::Container;
    }

    PartClass::Body
}

/// Split a raw message into its header fields, body text and attachments.
///
/// Header fields fall back to the SMTP envelope when absent. Fails with
/// [`MailcatchError::MalformedMessage`] when the header block is not a
/// sequence of RFC 5322 fields.
pub fn decompose(raw: &[u8], envelope: &Envelope) -> Result<DecomposedMessage> {
    let raw = header::skip_preamble(raw);
    let header_end = header::find_header_end(raw).unwrap_or(raw.len());
    let header_block = &raw[..header_end];
    header::validate_header_block(header_block)?;
    let headers = header::unfold_headers(&header::decode_header_bytes(header_block));

    let message = MessageParser::default().parse(raw).ok_or_else(|| {
        MailcatchError::MalformedMessage("MIME structure could not be parsed".into())
    })?;

    let sender = match header::get_header(&headers, "from") {
        Some(raw_from) => message
            .from()
            .map(header::format_address)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| raw_from.to_string()),
        None => envelope.mail_from.clone(),
    };

    let recipients = match header::get_header(&headers, "to") {
        Some(raw_to) => message
            .to()
            .map(header::format_address)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| raw_to.to_string()),
        None => envelope.rcpt_to.join(", "),
    };

    let subject = match header::get_header(&headers, "subject") {
        Some(raw_subject) => message
            .subject()
            .map(str::to_string)
            .unwrap_or_else(|| raw_subject.to_string()),
        None => NO_SUBJECT.to_string(),
    };

    let date = header::get_header(&headers, "date")
        .map(str::to_string)
        .unwrap_or_else(|| chrono::Local::now().format(FALLBACK_DATE_FORMAT).to_string());

    let mut walker = TreeWalker::default();
    match message.parts.first() {
        Some(root) if matches!(root.body, PartType::Multipart(_)) => walker.walk(&message, 0),
        Some(root) => {
            if let Some(text) = decode_body_part(root, 0) {
                walker.body = text;
            }
        }
        None => {}
    }

    debug!(
        sender = %sender,
        body_len = walker.body.len(),
        attachments = walker.attachments.len(),
        "Decomposed message"
    );

    Ok(DecomposedMessage {
        sender,
        recipients,
        subject,
        date,
        body: walker.body,
        attachments: walker.attachments,
    })
}

/// Depth-first, document-order traversal of a multipart tree.
#[derive(Default)]
struct TreeWalker {
    body: String,
    attachments: Vec<AttachmentBlob>,
}

impl TreeWalker {
    fn walk(&mut self, message: &Message<'_>, part_id: usize) {
        let Some(part) = message.parts.get(part_id) else {
            return;
        };

        match classify(part) {
            PartClass::Container => match &part.body {
                PartType::Multipart(children) => {
                    for &child in children {
                        self.walk(message, child);
                    }
                }
                PartType::Message(nested) => self.walk(nested, 0),
                _ => {}
            },
            PartClass::Attachment { filename } => {
                self.attachments.push(AttachmentBlob {
                    filename: filename.to_string(),
                    data: attachment_payload(part),
                });
            }
            PartClass::Body => {
                if let Some(text) = decode_body_part(part, part_id) {
                    self.body.push_str(&text);
                }
            }
        }
    }
}

/// The bytes an attachment is saved with: transfer-decoded, but still in
/// its declared charset.
///
/// `mail-parser` hands text parts back already converted to UTF-8, so those
/// are encoded back to the charset they arrived in.
fn attachment_payload(part: &MessagePart<'_>) -> Vec<u8> {
    let text = match &part.body {
        PartType::Text(text) | PartType::Html(text) => text,
        _ => return part.contents().to_vec(),
    };

    let encoding = part
        .content_type()
        .and_then(|ct| ct.attribute("charset"))
        .and_then(|label| encoding_rs::Encoding::for_label(label.trim().as_bytes()))
        .map(|encoding| encoding.output_encoding())
        .unwrap_or(encoding_rs::UTF_8);
    if encoding == encoding_rs::UTF_8 {
        return text.as_bytes().to_vec();
    }

    let (bytes, _, unmappable) = encoding.encode(text);
    if unmappable {
        warn!(
            charset = encoding.name(),
            "Attachment text has characters outside its charset"
        );
    }
    bytes.into_owned()
}

/// Decode a leaf part to text: transfer decoding (done by `mail-parser`)
/// first, charset decoding second. Empty payloads yield `None`.
fn decode_body_part(part: &MessagePart<'_>, part_id: usize) -> Option<String> {
    let charset = part
        .content_type()
        .and_then(|ct| ct.attribute("charset"))
        .map(str::to_string);

    let (text, lossy) = match &part.body {
        PartType::Text(text) | PartType::Html(text) => {
            let lossy = part.is_encoding_problem || text.contains('\u{FFFD}');
            (text.to_string(), lossy)
        }
        PartType::Binary(data) | PartType::InlineBinary(data) => {
            header::decode_charset(charset.as_deref(), data)
        }
        PartType::Message(_) => header::decode_charset(None, part.contents()),
        PartType::Multipart(_) => return None,
    };

    if lossy {
        warn!(
            part = part_id,
            charset = charset.as_deref().unwrap_or("(none)"),
            "Payload does not decode cleanly, kept with replacement characters"
        );
    }

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
