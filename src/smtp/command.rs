//! Parsing of SMTP command lines.

use super::reply::Reply;

/// Commands understood by the session handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    /// Reverse-path; empty for the null sender `<>`.
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Vrfy(String),
    Help,
    Quit,
}

impl Command {
    /// Parse one command line (without its trailing CRLF).
    ///
    /// Errors come back as the reply the client should receive.
    pub fn parse(line: &str) -> Result<Self, Reply> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => Ok(Self::Helo(arg.to_string())),
            "EHLO" => Ok(Self::Ehlo(arg.to_string())),
            "MAIL" => parse_path(arg, "FROM:")
                .map(Self::MailFrom)
                .ok_or_else(|| Reply::new(501, "Syntax: MAIL FROM:<address>")),
            "RCPT" => parse_path(arg, "TO:")
                .filter(|addr| !addr.is_empty())
                .map(Self::RcptTo)
                .ok_or_else(|| Reply::new(501, "Syntax: RCPT TO:<address>")),
            "DATA" => Ok(Self::Data),
            "RSET" => Ok(Self::Rset),
            "NOOP" => Ok(Self::Noop),
            "VRFY" => Ok(Self::Vrfy(arg.to_string())),
            "HELP" => Ok(Self::Help),
            "QUIT" => Ok(Self::Quit),
            _ => Err(Reply::new(
                500,
                format!("Error: command \"{}\" not recognized", verb.to_ascii_uppercase()),
            )),
        }
    }
}

/// Extract the address from `FROM:<addr> [params]` / `TO:<addr> [params]`.
///
/// Tolerates a missing angle-bracket pair and a space after the colon.
fn parse_path(arg: &str, keyword: &str) -> Option<String> {
    let head = arg.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = arg[keyword.len()..].trim_start();

    if let Some(inner) = rest.strip_prefix('<') {
        let end = inner.find('>')?;
        return Some(inner[..end].trim().to_string());
    }

    let addr = rest.split_whitespace().next()?;
    Some(addr.to_string())
}
