use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::{GeochainError, Result};
use crate::store::CommandId;

/// Delivery of one command to a remote worker. Dispatch only; completion
/// always arrives asynchronously through the listener, so `send` returns as
/// soon as the worker has accepted the command.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn send(&self, worker: &str, id: CommandId, text: &str) -> Result<()>;
}

/// Plain TCP transport: one short-lived connection per command, carrying the
/// line `<command-id> <command-text>`.
#[derive(Debug, Default, Clone)]
pub struct TcpTransport;

#[async_trait]
impl RemoteTransport for TcpTransport {
    async fn send(&self, worker: &str, id: CommandId, text: &str) -> Result<()> {
        let mut stream =
            TcpStream::connect(worker)
                .await
                .map_err(|e| GeochainError::RemoteUnreachable {
                    worker: worker.to_string(),
                    id,
                    message: e.to_string(),
                })?;

        let line = format!("{} {}\n", id, text);
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| GeochainError::RemoteUnreachable {
                worker: worker.to_string(),
                id,
                message: e.to_string(),
            })?;
        stream.shutdown().await.ok();

        tracing::debug!(command_id = id, worker, "Command transmitted");
        Ok(())
    }
}
