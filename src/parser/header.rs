//! RFC 5322 header block handling: boundary detection, validation, folding,
//! address formatting and charset decoding.

use mail_parser::Address;
use tracing::warn;

use crate::error::{MailcatchError, Result};

/// Skip what may precede the header block of a submitted message: a UTF-8
/// BOM and an mbox-style `From ` separator line.
pub fn skip_preamble(data: &[u8]) -> &[u8] {
    let data = data.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(data);

    if data.starts_with(b"From ") {
        if let Some(pos) = data.iter().position(|&b| b == b'\n') {
            return &data[pos + 1..];
        }
    }
    data
}

/// Find the byte offset where headers end (position of the first blank line).
///
/// Returns `None` when the message has no blank line, i.e. it is all headers.
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    if data.starts_with(b"\r\n") || data.starts_with(b"\n") {
        return Some(0);
    }
    for i in 0..data.len().saturating_sub(1) {
        if data[i] == b'\n' && data[i + 1] == b'\n' {
            return Some(i);
        }
        if i + 3 < data.len()
            && data[i] == b'\r'
            && data[i + 1] == b'\n'
            && data[i + 2] == b'\r'
            && data[i + 3] == b'\n'
        {
            return Some(i);
        }
    }
    None
}

/// Check that a header block is structured as RFC 5322 fields.
///
/// Every line must be either `name: value` (name being printable US-ASCII
/// without `:`) or a folded continuation of the previous field.
pub fn validate_header_block(block: &[u8]) -> Result<()> {
    let mut seen_field = false;

    for (lineno, line) in block.split(|&b| b == b'\n').enumerate() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        if line[0] == b' ' || line[0] == b'\t' {
            if !seen_field {
                return Err(MailcatchError::MalformedMessage(format!(
                    "line {} is a continuation with no header to continue",
                    lineno + 1
                )));
            }
            continue;
        }

        let colon = line.iter().position(|&b| b == b':').ok_or_else(|| {
            MailcatchError::MalformedMessage(format!(
                "line {} is not a header field",
                lineno + 1
            ))
        })?;
        let name = &line[..colon];
        if name.is_empty() || !name.iter().all(|&b| (33..=126).contains(&b)) {
            return Err(MailcatchError::MalformedMessage(format!(
                "invalid header field name on line {}",
                lineno + 1
            )));
        }
        seen_field = true;
    }

    if seen_field {
        Ok(())
    } else {
        Err(MailcatchError::MalformedMessage(
            "message has no header block".into(),
        ))
    }
}

/// Decode raw header bytes to a string.
///
/// Tries UTF-8 first, then falls back to Windows-1252 (which accepts every byte).
pub fn decode_header_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Unfold headers: join continuation lines (starting with space or tab) with the previous header.
///
/// Returns a list of `(lowercase_name, raw_value)` pairs.
pub fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = result.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some(colon_pos) = line.find(':') {
            let name = line[..colon_pos].trim().to_lowercase();
            let value = line[colon_pos + 1..].trim().to_string();
            result.push((name, value));
        }
    }

    result
}

/// Get the first value for a header name (case-insensitive).
pub fn get_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Render a parsed address header back to `Name <addr>, addr2` form.
///
/// Encoded-words in display names come back decoded. Names containing
/// RFC 5322 specials are re-quoted, and groups keep their `name: ...;` frame.
pub fn format_address(address: &Address<'_>) -> String {
    match address {
        Address::List(list) => format_addr_list(list),
        Address::Group(groups) => groups
            .iter()
            .map(|group| {
                let members = format_addr_list(&group.addresses);
                match group.name.as_deref() {
                    Some(name) if !name.is_empty() => {
                        format!("{}: {members};", quote_display_name(name))
                    }
                    _ => members,
                }
            })
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn format_addr_list(addrs: &[mail_parser::Addr<'_>]) -> String {
    addrs
        .iter()
        .filter_map(|addr| match (addr.name.as_deref(), addr.address.as_deref()) {
            (Some(name), Some(email)) if !name.is_empty() => {
                Some(format!("{} <{email}>", quote_display_name(name)))
            }
            (_, Some(email)) => Some(email.to_string()),
            (Some(name), None) => Some(quote_display_name(name)),
            (None, None) => None,
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Quote a display name when it would otherwise not read back as one phrase.
fn quote_display_name(name: &str) -> String {
    const SPECIALS: &[char] = &['(', ')', '<', '>', '[', ']', ':', ';', '@', '\\', ',', '"'];
    if !name.contains(SPECIALS) {
        return name.to_string();
    }
    let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Decode a payload with its declared charset.
///
/// Absent, unknown, or failing charsets fall back to lossy UTF-8. The returned
/// flag is `true` when the fallback replaced any byte sequence.
pub fn decode_charset(charset: Option<&str>, bytes: &[u8]) -> (String, bool) {
    let encoding = match charset {
        Some(label) => match encoding_rs::Encoding::for_label(label.trim().as_bytes()) {
            Some(encoding) => encoding,
            None => {
                warn!(charset = label, "Unknown charset, falling back to UTF-8 lossy");
                encoding_rs::UTF_8
            }
        },
        None => encoding_rs::UTF_8,
    };

    let (decoded, _, had_errors) = encoding.decode(bytes);
    if had_errors && encoding != encoding_rs::UTF_8 {
        let lossy = String::from_utf8_lossy(bytes);
        let replaced = lossy.contains('\u{FFFD}');
        return (lossy.into_owned(), replaced);
    }
    (decoded.into_owned(), had_errors)
}
