//! Server side of one SMTP session.
//!
//! Commands are handled strictly in order: each one gets its reply flushed
//! before the next line is read.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{MailcatchError, Result, SequenceError};
use crate::model::mail::{Envelope, RawMessage};
use crate::store::mailroom::Mailroom;

use super::command::Command;
use super::reply::Reply;

/// Per-session limits and identity, shared by every connection.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub hostname: String,
    pub max_message_size: usize,
    pub max_line_length: usize,
    /// `None` waits forever for the next command.
    pub idle_timeout: Option<Duration>,
}

impl SessionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            hostname: config.hostname.clone(),
            max_message_size: config.max_message_size,
            max_line_length: config.max_line_length.max(64),
            idle_timeout: (config.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(config.idle_timeout_secs)),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Where the current mail transaction stands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum Transaction {
    #[default]
    Init,
    SenderSet {
        from: String,
    },
    RecipientsSet {
        from: String,
        rcpts: Vec<String>,
    },
}

impl Transaction {
    fn mail(&mut self, from: String) -> std::result::Result<(), SequenceError> {
        match self {
            Self::Init => {
                *self = Self::SenderSet { from };
                Ok(())
            }
            _ => Err(SequenceError::NestedMail),
        }
    }

    fn rcpt(&mut self, to: String) -> std::result::Result<(), SequenceError> {
        match self {
            Self::Init => Err(SequenceError::NeedMail),
            Self::SenderSet { from } => {
                *self = Self::RecipientsSet {
                    from: std::mem::take(from),
                    rcpts: vec![to],
                };
                Ok(())
            }
            Self::RecipientsSet { rcpts, .. } => {
                rcpts.push(to);
                Ok(())
            }
        }
    }

    /// Hand out the envelope for a DATA phase and return to `Init`.
    fn take_envelope(&mut self) -> std::result::Result<Envelope, SequenceError> {
        match self {
            Self::Init => Err(SequenceError::NeedMail),
            Self::SenderSet { .. } => Err(SequenceError::NeedRcpt),
            Self::RecipientsSet { .. } => match std::mem::take(self) {
                Self::RecipientsSet { from, rcpts } => Ok(Envelope {
                    mail_from: from,
                    rcpt_to: rcpts,
                }),
                _ => Err(SequenceError::NeedRcpt),
            },
        }
    }
}

/// Result of reading one line from the client.
enum Line {
    /// Bytes up to and including `\n`, or a chunk of a longer line when
    /// `complete` is false.
    Data { bytes: Vec<u8>, complete: bool },
    Eof,
    TimedOut,
}

/// How a DATA phase ended.
enum DataOutcome {
    Reply(Reply),
    Disconnected,
    TimedOut,
}

/// One SMTP conversation with one client.
pub struct Session<S> {
    stream: BufReader<S>,
    peer: String,
    settings: Arc<SessionSettings>,
    mailroom: Arc<Mailroom>,
    transaction: Transaction,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(
        stream: S,
        peer: impl Into<String>,
        settings: Arc<SessionSettings>,
        mailroom: Arc<Mailroom>,
    ) -> Self {
        Self {
            stream: BufReader::new(stream),
            peer: peer.into(),
            settings,
            mailroom,
            transaction: Transaction::Init,
        }
    }

    /// Drive the session until QUIT, disconnect, timeout, or shutdown.
    ///
    /// Shutdown is only observed between commands, so a command in
    /// progress always gets its reply.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let greeting = Reply::greeting(&self.settings.hostname);
        self.send(&greeting).await?;

        loop {
            let next = tokio::select! {
                line = self.read_line() => Some(line?),
                _ = wait_for_shutdown(&mut shutdown) => None,
            };

            let (bytes, complete) = match next {
                None => {
                    debug!(peer = %self.peer, "Closing session for shutdown");
                    let reply = Reply::shutting_down(&self.settings.hostname);
                    return self.send(&reply).await;
                }
                Some(Line::Eof) => {
                    debug!(peer = %self.peer, "Client closed the connection");
                    return Ok(());
                }
                Some(Line::TimedOut) => {
                    info!(peer = %self.peer, "Idle timeout, closing session");
                    let reply = Reply::timeout(&self.settings.hostname);
                    return self.send(&reply).await;
                }
                Some(Line::Data { bytes, complete }) => (bytes, complete),
            };

            if !complete {
                if self.discard_rest_of_line().await? {
                    return Ok(());
                }
                self.send(&Reply::line_too_long()).await?;
                continue;
            }

            let text = String::from_utf8_lossy(&bytes);
            debug!(peer = %self.peer, command = %text.trim_end(), "SMTP command");

            let reply = match Command::parse(&text) {
                Err(reply) => reply,
                Ok(Command::Quit) => return self.send(&Reply::closing()).await,
                Ok(Command::Data) => match self.transaction.take_envelope() {
                    Err(e) => e.into(),
                    Ok(envelope) => {
                        self.send(&Reply::start_data()).await?;
                        match self.receive_data(envelope).await? {
                            DataOutcome::Reply(reply) => reply,
                            DataOutcome::Disconnected => {
                                info!(peer = %self.peer, "Client disconnected during DATA");
                                return Ok(());
                            }
                            DataOutcome::TimedOut => {
                                let reply = Reply::timeout(&self.settings.hostname);
                                return self.send(&reply).await;
                            }
                        }
                    }
                },
                Ok(command) => self.handle(command),
            };

            self.send(&reply).await?;
        }
    }

    /// Commands that only touch the transaction state.
    fn handle(&mut self, command: Command) -> Reply {
        match command {
            Command::Helo(_) => {
                self.transaction = Transaction::Init;
                Reply::new(250, self.settings.hostname.clone())
            }
            Command::Ehlo(_) => {
                self.transaction = Transaction::Init;
                Reply::multiline(
                    250,
                    vec![
                        self.settings.hostname.clone(),
                        format!("SIZE {}", self.settings.max_message_size),
                        "8BITMIME".into(),
                        "HELP".into(),
                    ],
                )
            }
            Command::MailFrom(from) => match self.transaction.mail(from) {
                Ok(()) => Reply::ok(),
                Err(e) => e.into(),
            },
            Command::RcptTo(to) => match self.transaction.rcpt(to) {
                Ok(()) => Reply::ok(),
                Err(e) => e.into(),
            },
            Command::Rset => {
                self.transaction = Transaction::Init;
                Reply::ok()
            }
            Command::Noop => Reply::ok(),
            Command::Vrfy(_) => Reply::new(
                252,
                "Cannot VRFY user, but will accept message and attempt delivery",
            ),
            Command::Help => Reply::new(
                250,
                "Supported commands: EHLO HELO MAIL RCPT DATA RSET NOOP VRFY HELP QUIT",
            ),
            // Handled by the caller, which owns the socket for these.
            Command::Quit | Command::Data => Reply::local_error(),
        }
    }

    /// Read the payload up to the lone `.` line, then ingest it.
    async fn receive_data(&mut self, envelope: Envelope) -> Result<DataOutcome> {
        let max = self.settings.max_message_size;
        let mut content = Vec::new();
        let mut oversized = false;
        let mut at_line_start = true;

        loop {
            let (bytes, complete) = match self.read_line().await? {
                Line::Eof => return Ok(DataOutcome::Disconnected),
                Line::TimedOut => return Ok(DataOutcome::TimedOut),
                Line::Data { bytes, complete } => (bytes, complete),
            };

            if at_line_start && complete && is_terminator(&bytes) {
                break;
            }

            let payload = if at_line_start && bytes.starts_with(b"..") {
                &bytes[1..]
            } else {
                &bytes[..]
            };

            if !oversized {
                if content.len() + payload.len() > max {
                    oversized = true;
                    content = Vec::new();
                } else {
                    content.extend_from_slice(payload);
                }
            }
            at_line_start = complete;
        }

        if oversized {
            warn!(peer = %self.peer, max_size = max, "Rejected oversized message");
            return Ok(DataOutcome::Reply(Reply::too_big()));
        }

        Ok(DataOutcome::Reply(self.ingest(envelope, content).await))
    }

    /// Decompose and persist off the async runtime; map the outcome to a reply.
    async fn ingest(&self, envelope: Envelope, content: Vec<u8>) -> Reply {
        let raw = RawMessage { envelope, content };
        let mailroom = Arc::clone(&self.mailroom);

        match tokio::task::spawn_blocking(move || mailroom.deliver(&raw)).await {
            Ok(Ok(id)) => {
                debug!(peer = %self.peer, id, "Message accepted");
                Reply::accepted()
            }
            Ok(Err(MailcatchError::MalformedMessage(reason))) => {
                warn!(peer = %self.peer, reason = %reason, "Rejected malformed message");
                Reply::malformed(&reason)
            }
            Ok(Err(e)) => {
                error!(peer = %self.peer, error = %e, "Failed to store message");
                Reply::local_error()
            }
            Err(e) => {
                error!(peer = %self.peer, error = %e, "Ingest task failed");
                Reply::local_error()
            }
        }
    }

    /// Read one line, bounded by `max_line_length` and the idle timeout.
    async fn read_line(&mut self) -> Result<Line> {
        let limit = self.settings.max_line_length;
        let mut bytes = Vec::new();
        let mut limited = (&mut self.stream).take(limit as u64);
        let read = limited.read_until(b'\n', &mut bytes);

        let n = match self.settings.idle_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, read).await {
                Ok(n) => n?,
                Err(_) => return Ok(Line::TimedOut),
            },
            None => read.await?,
        };

        if n == 0 {
            return Ok(Line::Eof);
        }
        let complete = bytes.ends_with(b"\n") || bytes.len() < limit;
        Ok(Line::Data { bytes, complete })
    }

    /// Skip the remainder of an over-long command line.
    ///
    /// Returns `true` if the client went away meanwhile.
    async fn discard_rest_of_line(&mut self) -> Result<bool> {
        loop {
            match self.read_line().await? {
                Line::Eof | Line::TimedOut => return Ok(true),
                Line::Data { complete: true, .. } => return Ok(false),
                Line::Data { .. } => continue,
            }
        }
    }

    async fn send(&mut self, reply: &Reply) -> Result<()> {
        self.stream.write_all(reply.to_string().as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

fn is_terminator(line: &[u8]) -> bool {
    line == b".\r\n" || line == b".\n"
}

/// Resolves once shutdown is requested; never resolves if the sender is gone.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}
