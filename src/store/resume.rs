//! Restart recovery.
//!
//! A run restarted against an existing store must pick up unfinished work
//! without redoing anything already Done. Failed commands are reset to
//! Pending so the dispatcher retries them. Dispatched and Running commands
//! belong to the previous, now-dead process; their outcome is unknown, so
//! they are conservatively reset and re-executed as well. Done commands are
//! never touched, which makes the pass idempotent.

use crate::error::Result;
use crate::store::{CommandState, CommandStore};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResumeReport {
    pub reset_failed: usize,
    pub reset_interrupted: usize,
    pub kept_done: usize,
}

impl ResumeReport {
    pub fn total_reset(&self) -> usize {
        self.reset_failed + self.reset_interrupted
    }
}

/// Rewrite every non-terminal-failure state back to runnable.
pub async fn resume(store: &CommandStore) -> Result<ResumeReport> {
    let mut report = ResumeReport::default();

    for cmd in store.all().await {
        match cmd.state {
            CommandState::Failed => {
                store.set_state(cmd.id, CommandState::Pending).await?;
                report.reset_failed += 1;
                tracing::info!(
                    command_id = cmd.id,
                    error = cmd.last_error.as_deref().unwrap_or(""),
                    "Failed command reset for retry"
                );
            }
            CommandState::Dispatched | CommandState::Running => {
                store.set_state(cmd.id, CommandState::Pending).await?;
                report.reset_interrupted += 1;
                tracing::warn!(
                    command_id = cmd.id,
                    "Command interrupted by previous shutdown, re-queued"
                );
            }
            CommandState::Done => report.kept_done += 1,
            CommandState::Pending => {}
        }
    }

    tracing::info!(
        reset = report.total_reset(),
        kept_done = report.kept_done,
        "Resume pass complete"
    );
    Ok(report)
}
