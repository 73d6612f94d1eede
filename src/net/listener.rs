use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{GeochainError, Result};
use crate::exec::classify::is_benign;
use crate::net::{parse_report, RemoteOutcome};
use crate::store::{CommandState, CommandStore};

/// Long-lived endpoint remote workers call back to report terminal command
/// state. One spawned handler per connection; reports may arrive in any order
/// relative to dispatch, and a duplicate report for an already-terminal
/// command is logged and discarded.
pub struct CompletionListener {
    listener: TcpListener,
}

impl CompletionListener {
    /// Bind immediately so the bound address (relevant with port 0) is known
    /// before the accept loop starts.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Completion listener bound");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, handler: ReportHandler, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Completion listener stopping");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, peer, handler).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept completion connection");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, handler: ReportHandler) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => handler.apply(&line).await,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Completion connection read error");
                break;
            }
        }
    }
}

/// Applies decoded completion reports to the store. Failure diagnostics go
/// through the same benign-error classification as local stderr, so a remote
/// worker relaying tool warning noise does not fail the command.
#[derive(Clone)]
pub struct ReportHandler {
    store: CommandStore,
    benign_patterns: Vec<String>,
}

impl ReportHandler {
    pub fn new(store: CommandStore, benign_patterns: Vec<String>) -> Self {
        Self {
            store,
            benign_patterns,
        }
    }

    /// Decode one report line and apply it to the store.
    pub async fn apply(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let Some((id, outcome)) = parse_report(line) else {
            tracing::warn!(line, "Malformed completion report discarded");
            return;
        };

        let result = match &outcome {
            RemoteOutcome::Success => self.store.set_state(id, CommandState::Done).await,
            RemoteOutcome::Failure { reason } if is_benign(reason, &self.benign_patterns) => {
                tracing::warn!(
                    command_id = id,
                    diagnostic = %reason,
                    "Remote failure classified benign"
                );
                self.store.set_state(id, CommandState::Done).await
            }
            RemoteOutcome::Failure { reason } => self.store.set_failed(id, reason.clone()).await,
        };

        match result {
            Ok(()) => {
                tracing::info!(command_id = id, outcome = ?outcome, "Remote completion applied");
            }
            Err(GeochainError::AlreadyTerminal(_)) => {
                tracing::warn!(command_id = id, "Duplicate completion report discarded");
            }
            Err(GeochainError::CommandNotFound(_)) => {
                tracing::warn!(command_id = id, "Completion report for unknown command discarded");
            }
            Err(e) => {
                tracing::error!(command_id = id, error = %e, "Failed to apply completion report");
            }
        }
    }
}
