//! Minimal SMTP submission client.
//!
//! Speaks just enough of the protocol to hand a message to a listener:
//! EHLO, MAIL, RCPT, DATA, QUIT. Used by `mailcatch send` and the tests.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{MailcatchError, Result};
use crate::smtp::reply::Reply;

/// An SMTP client over any byte stream.
pub struct SmtpClient<S> {
    stream: BufReader<S>,
}

impl SmtpClient<TcpStream> {
    /// Connect and consume the server greeting.
    pub async fn connect(addr: SocketAddr) -> Result<(Self, Reply)> {
        let stream = TcpStream::connect(addr).await?;
        let mut client = Self::new(stream);
        let greeting = client.read_reply().await?;
        Ok((client, greeting))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Read one (possibly multi-line) reply.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if self.stream.read_line(&mut line).await? == 0 {
                return Err(MailcatchError::Connection(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                )));
            }
            let (code, more, text) = Reply::parse_line(&line).ok_or_else(|| {
                MailcatchError::Protocol {
                    code: 0,
                    text: line.trim_end().to_string(),
                }
            })?;
            lines.push(text.to_string());
            if !more {
                return Ok(Reply::multiline(code, lines));
            }
        }
    }

    /// Send one command line and return the server's reply.
    pub async fn command(&mut self, line: &str) -> Result<Reply> {
        debug!(command = line, "SMTP client >");
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        self.read_reply().await
    }

    /// Send a DATA payload (after a 354) with dot-stuffing and the
    /// terminating `.` line, and return the final reply.
    pub async fn send_payload(&mut self, payload: &[u8]) -> Result<Reply> {
        self.stream.write_all(&dot_stuff(payload)).await?;
        self.stream.flush().await?;
        self.read_reply().await
    }

    /// Run a whole transaction: EHLO, MAIL, RCPT..., DATA, QUIT.
    ///
    /// Returns the reply to the DATA payload, positive or not. Any other
    /// negative reply aborts with [`MailcatchError::Protocol`].
    pub async fn submit(&mut self, from: &str, to: &[String], payload: &[u8]) -> Result<Reply> {
        expect(self.command("EHLO mailcatch.client").await?, 250)?;
        expect(self.command(&format!("MAIL FROM:<{from}>")).await?, 250)?;
        for rcpt in to {
            expect(self.command(&format!("RCPT TO:<{rcpt}>")).await?, 250)?;
        }
        expect(self.command("DATA").await?, 354)?;
        let final_reply = self.send_payload(payload).await?;
        // A failed QUIT does not change the fate of the message.
        let _ = self.command("QUIT").await;
        Ok(final_reply)
    }
}

/// Connect to `addr` and submit one message.
pub async fn send_message(
    addr: SocketAddr,
    from: &str,
    to: &[String],
    payload: &[u8],
) -> Result<Reply> {
    let (mut client, greeting) = SmtpClient::connect(addr).await?;
    expect(greeting, 220)?;
    client.submit(from, to, payload).await
}

fn expect(reply: Reply, code: u16) -> Result<Reply> {
    if reply.code == code {
        Ok(reply)
    } else {
        Err(MailcatchError::Protocol {
            code: reply.code,
            text: reply.text().to_string(),
        })
    }
}

/// Normalize line endings to CRLF, escape leading dots, and append the
/// end-of-data marker.
pub fn dot_stuff(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    let mut at_line_start = true;

    for (i, &b) in payload.iter().enumerate() {
        if at_line_start && b == b'.' {
            out.push(b'.');
        }
        if b == b'\n' && (i == 0 || payload[i - 1] != b'\r') {
            out.push(b'\r');
        }
        out.push(b);
        at_line_start = b == b'\n';
    }

    if !at_line_start {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// Build a plain-text message for `mailcatch send`.
pub fn compose_text(from: &str, to: &[String], subject: &str, body: &str) -> Vec<u8> {
    let date = chrono::Local::now().to_rfc2822();
    format!(
        "From: {from}\r\nTo: {}\r\nSubject: {subject}\r\nDate: {date}\r\n\
         MIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{body}\r\n",
        to.join(", ")
    )
    .into_bytes()
}
