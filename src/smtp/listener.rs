//! TCP accept loop: one task per connection, graceful drain on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::store::mailroom::Mailroom;

use super::session::{wait_for_shutdown, Session, SessionSettings};

/// A bound SMTP listener, ready to [`run`](Listener::run).
pub struct Listener {
    tcp: TcpListener,
    local_addr: SocketAddr,
    settings: Arc<SessionSettings>,
    mailroom: Arc<Mailroom>,
}

impl Listener {
    /// Bind the socket. Port 0 picks a free port; see [`local_addr`](Self::local_addr).
    pub async fn bind(
        addr: SocketAddr,
        settings: SessionSettings,
        mailroom: Arc<Mailroom>,
    ) -> Result<Self> {
        let tcp = TcpListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;
        Ok(Self {
            tcp,
            local_addr,
            settings: Arc::new(settings),
            mailroom,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `must_exit` turns true, then stop accepting
    /// and wait for the open sessions to wind down.
    pub async fn run(self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        info!(addr = %self.local_addr, "SMTP server listening");

        let mut connections = FuturesUnordered::new();

        loop {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };

            let (socket, remote_addr) = tokio::select! {
                accepted = self.tcp.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
                finished = wait_conn_finished => {
                    if let Some(Err(e)) = finished {
                        error!(error = %e, "Session task panicked");
                    }
                    continue;
                }
                _ = wait_for_shutdown(&mut must_exit) => break,
            };

            debug!(peer = %remote_addr, "Accepted connection");
            let session = Session::new(
                socket,
                remote_addr.to_string(),
                Arc::clone(&self.settings),
                Arc::clone(&self.mailroom),
            );
            let shutdown = must_exit.clone();
            connections.push(tokio::spawn(async move {
                if let Err(e) = session.run(shutdown).await {
                    warn!(peer = %remote_addr, error = %e, "Session ended with an error");
                }
                debug!(peer = %remote_addr, "Connection closed");
            }));
        }
        drop(self.tcp);

        info!(
            open_sessions = connections.len(),
            "SMTP server shutting down, draining remaining connections"
        );
        while let Some(finished) = connections.next().await {
            if let Err(e) = finished {
                error!(error = %e, "Session task panicked");
            }
        }

        Ok(())
    }
}
