use std::process::Stdio;

use tokio::process::Command as ProcessCommand;

use crate::exec::classify::is_benign;
use crate::store::{CommandId, CommandState};

/// Result of one local command execution.
#[derive(Debug)]
pub struct ExecutionResult {
    pub id: CommandId,
    pub state: CommandState,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// Executes commands as local `sh -c` subprocesses and classifies their
/// outcome against the benign-error list.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    benign_patterns: Vec<String>,
}

impl LocalExecutor {
    pub fn new(benign_patterns: Vec<String>) -> Self {
        Self { benign_patterns }
    }

    pub async fn execute(&self, id: CommandId, text: &str) -> ExecutionResult {
        tracing::info!(command_id = id, command = text, "Executing local command");

        let result = ProcessCommand::new("sh")
            .arg("-c")
            .arg(text)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        self.process_output(id, result)
    }

    fn process_output(
        &self,
        id: CommandId,
        result: Result<std::process::Output, std::io::Error>,
    ) -> ExecutionResult {
        match result {
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                let (state, error) = if output.status.success() {
                    (CommandState::Done, None)
                } else if is_benign(&stderr, &self.benign_patterns) {
                    tracing::warn!(
                        command_id = id,
                        exit_code = ?exit_code,
                        stderr = %stderr.trim(),
                        "Nonzero exit classified benign"
                    );
                    (CommandState::Done, None)
                } else {
                    (
                        CommandState::Failed,
                        Some(if stderr.is_empty() {
                            format!("exit code: {:?}", exit_code)
                        } else {
                            stderr.clone()
                        }),
                    )
                };

                tracing::info!(
                    command_id = id,
                    state = %state,
                    exit_code = ?exit_code,
                    "Local command finished"
                );

                ExecutionResult {
                    id,
                    state,
                    exit_code,
                    error,
                }
            }
            Err(e) => {
                tracing::error!(command_id = id, error = %e, "Failed to spawn local command");
                ExecutionResult {
                    id,
                    state: CommandState::Failed,
                    exit_code: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::classify::default_benign_patterns;

    #[tokio::test]
    async fn zero_exit_is_done() {
        let executor = LocalExecutor::new(default_benign_patterns());
        let result = executor.execute(1, "true").await;
        assert_eq!(result.state, CommandState::Done);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed_with_error_text() {
        let executor = LocalExecutor::new(default_benign_patterns());
        let result = executor.execute(2, "echo 'ERROR 4: missing input' >&2; exit 3").await;
        assert_eq!(result.state, CommandState::Failed);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.error.unwrap().contains("ERROR 4"));
    }

    #[tokio::test]
    async fn benign_stderr_is_done_despite_nonzero_exit() {
        let executor = LocalExecutor::new(default_benign_patterns());
        let result = executor
            .execute(3, "echo 'Warning 1: unknown TIFF tag' >&2; exit 1")
            .await;
        assert_eq!(result.state, CommandState::Done);
        assert!(result.error.is_none());
    }
}
