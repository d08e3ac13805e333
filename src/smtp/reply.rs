//! SMTP replies: a three-digit code plus one or more lines of text.

use std::fmt;

use crate::error::SequenceError;

/// A server reply, rendered on the wire as `code text\r\n`, or as
/// `code-line\r\n ... code last\r\n` when it spans several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// First line of text; what most callers want to show.
    pub fn text(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }

    pub fn is_positive(&self) -> bool {
        (200..400).contains(&self.code)
    }

    pub fn greeting(hostname: &str) -> Self {
        Self::new(220, format!("{hostname} ESMTP mailcatch"))
    }

    pub fn ok() -> Self {
        Self::new(250, "OK")
    }

    pub fn accepted() -> Self {
        Self::new(250, "Message accepted for delivery")
    }

    pub fn start_data() -> Self {
        Self::new(354, "End data with <CR><LF>.<CR><LF>")
    }

    pub fn closing() -> Self {
        Self::new(221, "Bye")
    }

    pub fn shutting_down(hostname: &str) -> Self {
        Self::new(
            421,
            format!("{hostname} Service not available, closing transmission channel"),
        )
    }

    pub fn timeout(hostname: &str) -> Self {
        Self::new(421, format!("{hostname} Error: timeout exceeded"))
    }

    pub fn local_error() -> Self {
        Self::new(451, "Requested action aborted: local error in processing")
    }

    pub fn malformed(reason: &str) -> Self {
        Self::new(550, format!("Error: {reason}"))
    }

    pub fn too_big() -> Self {
        Self::new(552, "Error: Too much mail data")
    }

    pub fn line_too_long() -> Self {
        Self::new(500, "Error: line too long")
    }

    /// Parse a single reply line as sent by a server: `250 OK` or `250-SIZE`.
    ///
    /// Returns the code, whether more lines follow, and the text.
    pub fn parse_line(line: &str) -> Option<(u16, bool, &str)> {
        let line = line.trim_end_matches(['\r', '\n']);
        let code = line.get(..3)?.parse::<u16>().ok()?;
        match line.as_bytes().get(3) {
            None => Some((code, false, "")),
            Some(b' ') => Some((code, false, &line[4..])),
            Some(b'-') => Some((code, true, &line[4..])),
            Some(_) => None,
        }
    }
}

impl From<SequenceError> for Reply {
    fn from(err: SequenceError) -> Self {
        Self::new(503, format!("Error: {err}"))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);
        if self.lines.is_empty() {
            return write!(f, "{}\r\n", self.code);
        }
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            write!(f, "{}{}{}\r\n", self.code, sep, line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_wire_format() {
        assert_eq!(Reply::ok().to_string(), "250 OK\r\n");
        assert_eq!(
            Reply::from(SequenceError::NeedRcpt).to_string(),
            "503 Error: need RCPT command\r\n"
        );
    }

    #[test]
    fn test_multiline_wire_format() {
        let reply = Reply::multiline(250, vec!["mx.test".into(), "8BITMIME".into()]);
        assert_eq!(reply.to_string(), "250-mx.test\r\n250 8BITMIME\r\n");
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(Reply::parse_line("250 OK\r\n"), Some((250, false, "OK")));
        assert_eq!(Reply::parse_line("250-SIZE 10"), Some((250, true, "SIZE 10")));
        assert_eq!(Reply::parse_line("354"), Some((354, false, "")));
        assert_eq!(Reply::parse_line("hello"), None);
        assert_eq!(Reply::parse_line("250+x"), None);
    }
}
