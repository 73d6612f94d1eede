//! Durable, shared command queue.
//!
//! The store is the single source of truth for the whole run: the compiler
//! appends into it, the dispatcher and the completion listener transition
//! command states through it, and the supervision monitor polls it. It is the
//! only shared mutable resource; every mutation goes through the store's
//! atomic operations so a reader never observes a half-applied transition.
//!
//! On disk the store is line-oriented: a header line (run id, creation time)
//! followed by one JSON record per command. The file is append-built at
//! compile time, then rewritten atomically (temp file + rename) on each state
//! mutation so a restarted process can always reload a consistent snapshot.

pub mod command;
pub mod resume;

pub use command::{Command, CommandId, CommandState, Dependency, ErrorPolicy, Target};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{GeochainError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreHeader {
    run_id: Uuid,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct StoreInner {
    header: StoreHeader,
    commands: BTreeMap<CommandId, Command>,
}

/// Per-state counts plus the derived scheduling picture, sampled atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub pending: usize,
    pub dispatched: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    /// Pending commands whose every dependency is Done.
    pub ready: usize,
    /// Pending commands with a (transitively) Failed dependency; they can
    /// never become ready.
    pub stranded: usize,
    /// A command failed whose policy is AbortRun.
    pub abort_requested: bool,
}

impl Progress {
    pub fn total(&self) -> usize {
        self.pending + self.dispatched + self.running + self.done + self.failed
    }

    pub fn in_flight(&self) -> usize {
        self.dispatched + self.running
    }
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pending={} dispatched={} running={} done={} failed={}",
            self.pending, self.dispatched, self.running, self.done, self.failed
        )
    }
}

/// Cheaply cloneable handle; clones share the same in-memory state and the
/// same journal file.
#[derive(Debug, Clone)]
pub struct CommandStore {
    path: PathBuf,
    inner: Arc<RwLock<StoreInner>>,
}

impl CommandStore {
    /// Create a fresh store, truncating any file already at `path`.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let header = StoreHeader {
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        let store = Self {
            path: path.as_ref().to_path_buf(),
            inner: Arc::new(RwLock::new(StoreInner {
                header,
                commands: BTreeMap::new(),
            })),
        };
        {
            let inner = store.inner.read().await;
            store.persist(&inner).await?;
        }
        Ok(store)
    }

    /// Reload an existing store from disk (resume path).
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let contents = tokio::fs::read_to_string(&path).await?;
        let mut lines = contents.lines().filter(|l| !l.trim().is_empty());

        let header_line = lines.next().ok_or_else(|| {
            GeochainError::MalformedRecord(format!("{}: empty store file", path.display()))
        })?;
        let header: StoreHeader = serde_json::from_str(header_line)
            .map_err(|e| GeochainError::MalformedRecord(format!("header: {e}")))?;

        let mut commands = BTreeMap::new();
        for line in lines {
            let cmd: Command = serde_json::from_str(line)
                .map_err(|e| GeochainError::MalformedRecord(format!("{e}: {line}")))?;
            commands.insert(cmd.id, cmd);
        }

        tracing::info!(
            path = %path.display(),
            run_id = %header.run_id,
            commands = commands.len(),
            "Command store loaded"
        );

        Ok(Self {
            path,
            inner: Arc::new(RwLock::new(StoreInner { header, commands })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn run_id(&self) -> Uuid {
        self.inner.read().await.header.run_id
    }

    /// Append a freshly compiled command. The record is appended to the
    /// journal file without rewriting earlier lines.
    pub async fn append(&self, cmd: Command) -> Result<()> {
        let mut inner = self.inner.write().await;
        let line = serde_json::to_string(&cmd)?;
        inner.commands.insert(cmd.id, cmd);

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn get(&self, id: CommandId) -> Option<Command> {
        self.inner.read().await.commands.get(&id).cloned()
    }

    /// All commands, ordered by id.
    pub async fn all(&self) -> Vec<Command> {
        self.inner.read().await.commands.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.commands.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.commands.is_empty()
    }

    /// All Pending commands whose every dependency is Done.
    ///
    /// A command still carrying a placeholder is never ready; the resolver
    /// guarantees none survive to execution.
    pub async fn scan_ready(&self) -> Vec<Command> {
        let inner = self.inner.read().await;
        inner
            .commands
            .values()
            .filter(|c| c.state == CommandState::Pending && Self::deps_done(&inner.commands, c))
            .cloned()
            .collect()
    }

    fn deps_done(commands: &BTreeMap<CommandId, Command>, cmd: &Command) -> bool {
        if cmd.placeholder().is_some() {
            return false;
        }
        cmd.resolved_deps().all(|dep| {
            commands
                .get(&dep)
                .map(|d| d.state == CommandState::Done)
                .unwrap_or(false)
        })
    }

    /// Transition a command's state, atomically with respect to concurrent
    /// readers, and persist the change.
    ///
    /// A terminal command can only move back to Pending (the resume path);
    /// any other transition out of a terminal state is rejected with
    /// `AlreadyTerminal` so duplicate completion reports are discarded rather
    /// than applied.
    pub async fn set_state(&self, id: CommandId, state: CommandState) -> Result<()> {
        self.transition(id, state, None).await
    }

    /// Mark a command Failed with its error text.
    pub async fn set_failed(&self, id: CommandId, error: impl Into<String>) -> Result<()> {
        self.transition(id, CommandState::Failed, Some(error.into()))
            .await
    }

    async fn transition(
        &self,
        id: CommandId,
        state: CommandState,
        error: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let cmd = inner
            .commands
            .get_mut(&id)
            .ok_or(GeochainError::CommandNotFound(id))?;

        if cmd.state.is_terminal() && state != CommandState::Pending {
            return Err(GeochainError::AlreadyTerminal(id));
        }

        let previous = cmd.state;
        cmd.state = state;
        match state {
            CommandState::Running => {
                cmd.started_at = Some(Utc::now());
            }
            CommandState::Pending => {
                cmd.last_error = None;
                cmd.started_at = None;
            }
            _ => {}
        }
        if let Some(error) = error {
            cmd.last_error = Some(error);
        }

        tracing::debug!(command_id = id, from = %previous, to = %state, "State transition");
        self.persist(&inner).await
    }

    pub async fn state_of(&self, id: CommandId) -> Result<CommandState> {
        self.inner
            .read()
            .await
            .commands
            .get(&id)
            .map(|c| c.state)
            .ok_or(GeochainError::CommandNotFound(id))
    }

    /// Rewrite every placeholder dependency slot with the command-id list it
    /// maps to. Returns the number of placeholders replaced; an unknown
    /// reference is fatal.
    pub async fn substitute_placeholders(
        &self,
        table: &HashMap<String, Vec<CommandId>>,
    ) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let mut replaced = 0usize;

        for cmd in inner.commands.values_mut() {
            if cmd.placeholder().is_none() {
                continue;
            }
            let mut deps = Vec::with_capacity(cmd.deps.len());
            let mut seen = HashSet::new();
            for dep in &cmd.deps {
                match dep {
                    Dependency::Resolved(id) => {
                        if seen.insert(*id) {
                            deps.push(Dependency::Resolved(*id));
                        }
                    }
                    Dependency::TaskRef(reference) => {
                        let ids = table.get(reference).ok_or_else(|| {
                            GeochainError::UnresolvedDependency(reference.clone())
                        })?;
                        for &id in ids {
                            if seen.insert(id) {
                                deps.push(Dependency::Resolved(id));
                            }
                        }
                        replaced += 1;
                    }
                }
            }
            cmd.deps = deps;
        }

        if replaced > 0 {
            self.persist(&inner).await?;
        }
        Ok(replaced)
    }

    /// Remaining placeholders, for the post-resolution consistency scan.
    pub async fn placeholders(&self) -> Vec<(CommandId, String)> {
        self.inner
            .read()
            .await
            .commands
            .values()
            .filter_map(|c| c.placeholder().map(|r| (c.id, r.to_string())))
            .collect()
    }

    /// Sample the scheduling picture in one atomic read.
    pub async fn progress(&self) -> Progress {
        let inner = self.inner.read().await;
        let commands = &inner.commands;

        let mut progress = Progress {
            pending: 0,
            dispatched: 0,
            running: 0,
            done: 0,
            failed: 0,
            ready: 0,
            stranded: 0,
            abort_requested: false,
        };

        for cmd in commands.values() {
            match cmd.state {
                CommandState::Pending => progress.pending += 1,
                CommandState::Dispatched => progress.dispatched += 1,
                CommandState::Running => progress.running += 1,
                CommandState::Done => progress.done += 1,
                CommandState::Failed => {
                    progress.failed += 1;
                    if cmd.on_failure == ErrorPolicy::AbortRun {
                        progress.abort_requested = true;
                    }
                }
            }
        }

        let stranded = Self::stranded_set(commands);
        for cmd in commands.values() {
            if cmd.state != CommandState::Pending {
                continue;
            }
            if stranded.contains(&cmd.id) {
                progress.stranded += 1;
            } else if Self::deps_done(commands, cmd) {
                progress.ready += 1;
            }
        }

        progress
    }

    /// Commands whose ancestry contains a Failed command; they can never run.
    fn stranded_set(commands: &BTreeMap<CommandId, Command>) -> HashSet<CommandId> {
        let mut stranded: HashSet<CommandId> = commands
            .values()
            .filter(|c| c.state == CommandState::Failed)
            .map(|c| c.id)
            .collect();

        // Forward cross-pipeline references may point at higher ids, so
        // propagate to a fixpoint. The graph is acyclic; this terminates.
        loop {
            let mut changed = false;
            for cmd in commands.values() {
                if !stranded.contains(&cmd.id)
                    && cmd.resolved_deps().any(|d| stranded.contains(&d))
                {
                    stranded.insert(cmd.id);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        stranded
    }

    /// Remote commands currently Dispatched or Running; bounds how many new
    /// remote commands the dispatcher may start.
    pub async fn remote_in_flight(&self) -> usize {
        self.inner
            .read()
            .await
            .commands
            .values()
            .filter(|c| {
                c.is_remote()
                    && matches!(c.state, CommandState::Dispatched | CommandState::Running)
            })
            .count()
    }

    /// Running remote commands older than `cutoff`, for the dead-worker
    /// watchdog.
    pub async fn overdue_remote(&self, cutoff: DateTime<Utc>) -> Vec<CommandId> {
        self.inner
            .read()
            .await
            .commands
            .values()
            .filter(|c| {
                c.is_remote()
                    && c.state == CommandState::Running
                    && c.started_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|c| c.id)
            .collect()
    }

    /// Serialize the full snapshot and swap it in atomically, so a crash
    /// mid-write never leaves a truncated journal.
    async fn persist(&self, inner: &StoreInner) -> Result<()> {
        let mut contents = serde_json::to_string(&inner.header)?;
        contents.push('\n');
        for cmd in inner.commands.values() {
            contents.push_str(&serde_json::to_string(cmd)?);
            contents.push('\n');
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(id: CommandId, deps: Vec<Dependency>) -> Command {
        Command::new(
            id,
            format!("echo {id}"),
            deps,
            Target::Local,
            ErrorPolicy::AbortRun,
        )
    }

    async fn fresh() -> (tempfile::TempDir, CommandStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CommandStore::create(dir.path().join("run.store"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn scan_ready_respects_dependencies() {
        let (_dir, store) = fresh().await;
        store.append(local(1, vec![])).await.unwrap();
        store
            .append(local(2, vec![Dependency::Resolved(1)]))
            .await
            .unwrap();

        let ready: Vec<CommandId> = store.scan_ready().await.iter().map(|c| c.id).collect();
        assert_eq!(ready, vec![1]);

        store.set_state(1, CommandState::Done).await.unwrap();
        let ready: Vec<CommandId> = store.scan_ready().await.iter().map(|c| c.id).collect();
        assert_eq!(ready, vec![2]);
    }

    #[tokio::test]
    async fn placeholder_is_never_ready() {
        let (_dir, store) = fresh().await;
        store
            .append(local(1, vec![Dependency::TaskRef("p.t.1".to_string())]))
            .await
            .unwrap();
        assert!(store.scan_ready().await.is_empty());
    }

    #[tokio::test]
    async fn terminal_guard_rejects_duplicate_completion() {
        let (_dir, store) = fresh().await;
        store.append(local(1, vec![])).await.unwrap();
        store.set_state(1, CommandState::Done).await.unwrap();

        let err = store.set_state(1, CommandState::Done).await.unwrap_err();
        assert!(matches!(err, GeochainError::AlreadyTerminal(1)));

        // The resume path is the one allowed exit from a terminal state.
        store.set_state(1, CommandState::Pending).await.unwrap();
        assert_eq!(store.state_of(1).await.unwrap(), CommandState::Pending);
    }

    #[tokio::test]
    async fn failed_reset_clears_error() {
        let (_dir, store) = fresh().await;
        store.append(local(1, vec![])).await.unwrap();
        store.set_failed(1, "boom").await.unwrap();
        assert_eq!(store.get(1).await.unwrap().last_error.as_deref(), Some("boom"));

        store.set_state(1, CommandState::Pending).await.unwrap();
        assert!(store.get(1).await.unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn progress_counts_stranded_transitively() {
        let (_dir, store) = fresh().await;
        store.append(local(1, vec![])).await.unwrap();
        store
            .append(local(2, vec![Dependency::Resolved(1)]))
            .await
            .unwrap();
        store
            .append(local(3, vec![Dependency::Resolved(2)]))
            .await
            .unwrap();
        store.append(local(4, vec![])).await.unwrap();

        store.set_failed(1, "no such tool").await.unwrap();
        let progress = store.progress().await;
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.stranded, 2);
        assert_eq!(progress.ready, 1);
        assert!(progress.abort_requested);
    }

    #[tokio::test]
    async fn substitution_replaces_and_dedupes() {
        let (_dir, store) = fresh().await;
        store.append(local(1, vec![])).await.unwrap();
        store.append(local(2, vec![])).await.unwrap();
        store
            .append(local(
                3,
                vec![
                    Dependency::Resolved(1),
                    Dependency::TaskRef("mnt.fusion.1".to_string()),
                ],
            ))
            .await
            .unwrap();

        let mut table = HashMap::new();
        table.insert("mnt.fusion.1".to_string(), vec![1, 2]);

        let replaced = store.substitute_placeholders(&table).await.unwrap();
        assert_eq!(replaced, 1);
        assert!(store.placeholders().await.is_empty());
        assert_eq!(
            store.get(3).await.unwrap().deps,
            vec![Dependency::Resolved(1), Dependency::Resolved(2)]
        );
    }

    #[tokio::test]
    async fn unknown_reference_is_fatal() {
        let (_dir, store) = fresh().await;
        store
            .append(local(1, vec![Dependency::TaskRef("ghost.task.1".to_string())]))
            .await
            .unwrap();

        let err = store
            .substitute_placeholders(&HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GeochainError::UnresolvedDependency(r) if r == "ghost.task.1"));
    }

    #[tokio::test]
    async fn reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.store");

        let store = CommandStore::create(&path).await.unwrap();
        store.append(local(1, vec![])).await.unwrap();
        store
            .append(local(2, vec![Dependency::Resolved(1)]))
            .await
            .unwrap();
        store.set_state(1, CommandState::Done).await.unwrap();
        let run_id = store.run_id().await;
        drop(store);

        let reloaded = CommandStore::open(&path).await.unwrap();
        assert_eq!(reloaded.run_id().await, run_id);
        assert_eq!(reloaded.len().await, 2);
        assert_eq!(reloaded.state_of(1).await.unwrap(), CommandState::Done);
        assert_eq!(reloaded.state_of(2).await.unwrap(), CommandState::Pending);
    }
}
