//! Run supervision.
//!
//! A background loop polling the store on an interval, reporting per-state
//! counts, and deciding global completion. The caller awaits the returned
//! future as the one-shot completion signal; there is no shared "done" flag.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::store::{CommandStore, Progress};

/// Terminal verdict of one scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every command reached Done.
    Success { done: usize },
    /// The run can make no further progress and unresolved failures remain.
    Failed { failed: usize, stranded: usize },
    /// Cancelled from outside before reaching a terminal state.
    Aborted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success { .. } => 0,
            RunOutcome::Failed { .. } | RunOutcome::Aborted => 1,
        }
    }
}

pub struct SupervisionMonitor {
    store: CommandStore,
    interval: Duration,
}

impl SupervisionMonitor {
    pub fn new(store: CommandStore, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Poll until the run is terminal or cancelled.
    pub async fn run(self, cancel: CancellationToken) -> RunOutcome {
        let mut interval = tokio::time::interval(self.interval);
        let mut last: Option<Progress> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!("Supervision cancelled before completion");
                    return RunOutcome::Aborted;
                }
                _ = interval.tick() => {
                    let progress = self.store.progress().await;
                    if last.as_ref() != Some(&progress) {
                        tracing::info!(%progress, ready = progress.ready, stranded = progress.stranded, "Run progress");
                        last = Some(progress);
                    }

                    if let Some(outcome) = Self::verdict(&progress) {
                        match outcome {
                            RunOutcome::Success { done } => {
                                tracing::info!(done, "Run complete, all commands done");
                            }
                            RunOutcome::Failed { failed, stranded } => {
                                tracing::error!(failed, stranded, "Run complete with failures");
                            }
                            RunOutcome::Aborted => {}
                        }
                        return outcome;
                    }
                }
            }
        }
    }

    /// Completion rule: nothing may be in flight, and no Pending command may
    /// still be dispatchable. Under an abort request the remaining ready
    /// commands will never be started, so they do not hold the run open.
    fn verdict(progress: &Progress) -> Option<RunOutcome> {
        if progress.in_flight() > 0 {
            return None;
        }
        if progress.ready > 0 && !progress.abort_requested {
            return None;
        }
        if progress.pending == 0 && progress.failed == 0 {
            return Some(RunOutcome::Success {
                done: progress.done,
            });
        }
        Some(RunOutcome::Failed {
            failed: progress.failed,
            stranded: progress.pending,
        })
    }
}
