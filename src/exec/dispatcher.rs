//! The scheduling loop.
//!
//! Each tick scans the store for ready commands and starts them: local
//! commands as bounded concurrent subprocesses, remote commands as one-shot
//! transmissions to their compile-time-assigned worker. The dispatcher never
//! waits for a remote completion itself; that arrives through the completion
//! listener, keeping dispatch throughput decoupled from remote latency.
//!
//! Ordering is enforced solely through the store: a command is started only
//! once `scan_ready` has observed every one of its dependencies Done. A
//! failure under the AbortRun policy stops all new dispatch while in-flight
//! work drains; under Continue, only dependents of the failure are stranded
//! and independent branches keep going.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::exec::local::LocalExecutor;
use crate::net::RemoteTransport;
use crate::store::{Command, CommandState, CommandStore, ErrorPolicy, Target};

#[derive(Clone)]
pub struct Dispatcher {
    store: CommandStore,
    transport: Arc<dyn RemoteTransport>,
    executor: LocalExecutor,
    local_permits: Arc<Semaphore>,
    max_remote: usize,
    retries: u32,
    poll_interval: Duration,
    remote_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(store: CommandStore, config: &RunConfig, transport: Arc<dyn RemoteTransport>) -> Self {
        Self {
            store,
            transport,
            executor: LocalExecutor::new(config.benign_error_patterns.clone()),
            local_permits: Arc::new(Semaphore::new(config.max_local.max(1))),
            max_remote: config.max_remote.max(1),
            retries: config.dispatch_retries,
            poll_interval: config.poll_interval,
            remote_timeout: config.remote_timeout,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Dispatcher stopping, in-flight commands keep running");
                    break;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One scheduling iteration; also drives the remote dead-worker watchdog.
    pub async fn tick(&self) {
        self.expire_overdue_remotes().await;

        let progress = self.store.progress().await;
        if progress.abort_requested {
            // A failed abort-on-failure command halts all new dispatch.
            return;
        }

        let mut remote_in_flight = self.store.remote_in_flight().await;

        for cmd in self.store.scan_ready().await {
            match cmd.target {
                Target::Local => {
                    if self.mark_dispatched(cmd.id).await {
                        let dispatcher = self.clone();
                        tokio::spawn(async move {
                            dispatcher.run_local(cmd).await;
                        });
                    }
                }
                Target::Remote(_) => {
                    if remote_in_flight >= self.max_remote {
                        continue;
                    }
                    if self.mark_dispatched(cmd.id).await {
                        remote_in_flight += 1;
                        let dispatcher = self.clone();
                        tokio::spawn(async move {
                            dispatcher.run_remote(cmd).await;
                        });
                    }
                }
            }
        }
    }

    async fn mark_dispatched(&self, id: u64) -> bool {
        match self.store.set_state(id, CommandState::Dispatched).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(command_id = id, error = %e, "Could not mark command dispatched");
                false
            }
        }
    }

    async fn run_local(self, cmd: Command) {
        // Bounds concurrent local subprocesses; the command stays Dispatched
        // while queued for a permit.
        let _permit = match self.local_permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        if let Err(e) = self.store.set_state(cmd.id, CommandState::Running).await {
            tracing::warn!(command_id = cmd.id, error = %e, "Could not mark command running");
            return;
        }

        let result = self.executor.execute(cmd.id, &cmd.text).await;
        let applied = match result.state {
            CommandState::Done => self.store.set_state(cmd.id, CommandState::Done).await,
            _ => {
                let error = result
                    .error
                    .unwrap_or_else(|| "command failed".to_string());
                self.note_failure(&cmd, &error);
                self.store.set_failed(cmd.id, error).await
            }
        };
        if let Err(e) = applied {
            tracing::error!(command_id = cmd.id, error = %e, "Could not record execution result");
        }
    }

    async fn run_remote(self, cmd: Command) {
        let Target::Remote(worker) = &cmd.target else {
            return;
        };

        let attempts = self.retries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.transport.send(worker, cmd.id, &cmd.text).await {
                Ok(()) => {
                    tracing::info!(
                        command_id = cmd.id,
                        worker,
                        attempt,
                        "Remote command dispatched"
                    );
                    if let Err(e) = self.store.set_state(cmd.id, CommandState::Running).await {
                        tracing::warn!(command_id = cmd.id, error = %e, "Could not mark remote command running");
                    }
                    return;
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        command_id = cmd.id,
                        worker,
                        attempt,
                        error = %last_error,
                        "Remote send failed"
                    );
                    // No backoff after the final attempt; fail immediately.
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                    }
                }
            }
        }

        let error = format!(
            "worker {} unreachable after {} attempts: {}",
            worker, attempts, last_error
        );
        self.note_failure(&cmd, &error);
        if let Err(e) = self.store.set_failed(cmd.id, error).await {
            tracing::error!(command_id = cmd.id, error = %e, "Could not record dispatch failure");
        }
    }

    fn note_failure(&self, cmd: &Command, error: &str) {
        match cmd.on_failure {
            ErrorPolicy::AbortRun => {
                tracing::error!(
                    command_id = cmd.id,
                    error,
                    "Command failed, halting dispatch of new work"
                );
            }
            ErrorPolicy::Continue => {
                tracing::error!(
                    command_id = cmd.id,
                    error,
                    "Command failed, dependent commands stranded"
                );
            }
        }
    }

    /// Mark Running remote commands Failed once they exceed the configured
    /// timeout without a completion report.
    async fn expire_overdue_remotes(&self) {
        let Some(timeout) = self.remote_timeout else {
            return;
        };
        let cutoff = Utc::now() - chrono::Duration::milliseconds(timeout.as_millis() as i64);
        for id in self.store.overdue_remote(cutoff).await {
            tracing::error!(command_id = id, "No completion report within timeout, presumed lost");
            if let Err(e) = self
                .store
                .set_failed(id, "no completion report within timeout")
                .await
            {
                tracing::warn!(command_id = id, error = %e, "Could not expire remote command");
            }
        }
    }
}
