use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process-wide monotonically increasing command identifier, unique across
/// all pipelines compiled together in one scheduler run.
pub type CommandId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandState {
    Pending,
    Dispatched,
    Running,
    Done,
    Failed,
}

impl CommandState {
    /// Done and Failed are terminal; a terminal command is never transitioned
    /// again except by an explicit resume pass (Failed -> Pending).
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Done | CommandState::Failed)
    }
}

impl std::fmt::Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandState::Pending => write!(f, "pending"),
            CommandState::Dispatched => write!(f, "dispatched"),
            CommandState::Running => write!(f, "running"),
            CommandState::Done => write!(f, "done"),
            CommandState::Failed => write!(f, "failed"),
        }
    }
}

/// What a failed command does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Stop dispatching any new work; in-flight commands finish.
    #[default]
    AbortRun,
    /// Only commands depending on the failure are stranded; independent
    /// branches keep running.
    Continue,
}

/// One dependency slot of a command.
///
/// `TaskRef` is the symbolic cross-file placeholder (`pipeline.label.position`)
/// written when the referenced task was not yet compiled. It exists only
/// between compilation and the resolution pass; a store handed to the
/// dispatcher contains `Resolved` entries exclusively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dependency {
    Resolved(CommandId),
    TaskRef(String),
}

/// Execution target, fixed at compile time so the same command always lands
/// on the same worker, even across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Local,
    Remote(String),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Local => write!(f, "local"),
            Target::Remote(addr) => write!(f, "{}", addr),
        }
    }
}

/// The atomic, independently schedulable unit of execution: one external
/// process invocation plus its scheduling metadata. Persisted as one JSON
/// line in the command store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub text: String,
    pub deps: Vec<Dependency>,
    pub target: Target,
    pub state: CommandState,
    pub on_failure: ErrorPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Set when the command enters Running; used by the remote watchdog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl Command {
    pub fn new(
        id: CommandId,
        text: String,
        deps: Vec<Dependency>,
        target: Target,
        on_failure: ErrorPolicy,
    ) -> Self {
        Self {
            id,
            text,
            deps,
            target,
            state: CommandState::Pending,
            on_failure,
            last_error: None,
            started_at: None,
        }
    }

    /// Numeric dependency ids, skipping unresolved placeholders.
    pub fn resolved_deps(&self) -> impl Iterator<Item = CommandId> + '_ {
        self.deps.iter().filter_map(|d| match d {
            Dependency::Resolved(id) => Some(*id),
            Dependency::TaskRef(_) => None,
        })
    }

    /// First unresolved placeholder, if any.
    pub fn placeholder(&self) -> Option<&str> {
        self.deps.iter().find_map(|d| match d {
            Dependency::TaskRef(r) => Some(r.as_str()),
            Dependency::Resolved(_) => None,
        })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.target, Target::Remote(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display() {
        assert_eq!(CommandState::Pending.to_string(), "pending");
        assert_eq!(CommandState::Done.to_string(), "done");
        assert_eq!(CommandState::Failed.to_string(), "failed");
    }

    #[test]
    fn terminal_states() {
        assert!(CommandState::Done.is_terminal());
        assert!(CommandState::Failed.is_terminal());
        assert!(!CommandState::Pending.is_terminal());
        assert!(!CommandState::Dispatched.is_terminal());
        assert!(!CommandState::Running.is_terminal());
    }

    #[test]
    fn record_round_trip() {
        let cmd = Command::new(
            7,
            "gdalwarp -t_srs EPSG:2154 in.tif out.tif".to_string(),
            vec![
                Dependency::Resolved(3),
                Dependency::TaskRef("ortho.mosaic.1".to_string()),
            ],
            Target::Remote("10.0.0.5:7701".to_string()),
            ErrorPolicy::Continue,
        );
        let line = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id, 7);
        assert_eq!(back.deps, cmd.deps);
        assert_eq!(back.target, cmd.target);
        assert_eq!(back.state, CommandState::Pending);
        assert_eq!(back.on_failure, ErrorPolicy::Continue);
    }

    #[test]
    fn dependency_untagged_forms() {
        // Resolved ids serialize as bare integers, placeholders as strings;
        // the on-disk line stays human-readable and diffable.
        let deps = vec![
            Dependency::Resolved(12),
            Dependency::TaskRef("mnt.slope.2".to_string()),
        ];
        let json = serde_json::to_string(&deps).unwrap();
        assert_eq!(json, r#"[12,"mnt.slope.2"]"#);
        let back: Vec<Dependency> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, deps);
    }

    #[test]
    fn placeholder_lookup() {
        let mut cmd = Command::new(
            1,
            "true".to_string(),
            vec![Dependency::Resolved(0)],
            Target::Local,
            ErrorPolicy::AbortRun,
        );
        assert!(cmd.placeholder().is_none());
        cmd.deps.push(Dependency::TaskRef("a.b.1".to_string()));
        assert_eq!(cmd.placeholder(), Some("a.b.1"));
        assert_eq!(cmd.resolved_deps().collect::<Vec<_>>(), vec![0]);
    }
}
