//! Task graph compilation.
//!
//! Turns a parsed pipeline description into Pending commands appended to the
//! store. Dependencies on tasks already compiled expand to their full
//! command-id list; dependencies on tasks of a pipeline compiled later are
//! written as symbolic placeholders and resolved in a second pass once every
//! description has been read.

use std::collections::HashMap;

use crate::compiler::task::{PipelineSpec, TaskRef};
use crate::error::{GeochainError, Result};
use crate::store::{Command, CommandId, CommandStore, Dependency, Target};

/// Shared allocation state threaded through every compilation in one run.
///
/// Carries the command-id counter, the remote-pool round-robin cursor (one
/// cursor for the whole run, so load balances globally rather than per
/// pipeline), and the symbol table mapping each compiled task to the command
/// ids it produced.
#[derive(Debug)]
pub struct CompilerContext {
    next_id: CommandId,
    pool: Vec<String>,
    cursor: usize,
    symbols: HashMap<String, Vec<CommandId>>,
}

impl CompilerContext {
    pub fn new(pool: Vec<String>) -> Self {
        Self {
            next_id: 1,
            pool,
            cursor: 0,
            symbols: HashMap::new(),
        }
    }

    fn alloc_id(&mut self) -> CommandId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn next_worker(&mut self) -> Option<String> {
        if self.pool.is_empty() {
            return None;
        }
        let worker = self.pool[self.cursor % self.pool.len()].clone();
        self.cursor += 1;
        Some(worker)
    }

    /// Correspondence table: `pipeline.label.position` -> command ids.
    pub fn symbols(&self) -> &HashMap<String, Vec<CommandId>> {
        &self.symbols
    }

    pub fn pool(&self) -> &[String] {
        &self.pool
    }
}

/// Compile one pipeline description into the store.
///
/// Emits one Pending command per command text of each task and records the
/// task's command ids in the context's symbol table. Sequential tasks chain
/// each command on its predecessor within the task; parallel tasks share only
/// the task-level dependencies.
pub async fn compile_pipeline(
    spec: &PipelineSpec,
    ctx: &mut CompilerContext,
    store: &CommandStore,
) -> Result<()> {
    for task in &spec.tasks {
        let task_ref = TaskRef::new(&spec.name, &task.label, task.position);
        let key = task_ref.to_string();
        if ctx.symbols.contains_key(&key) {
            return Err(GeochainError::DuplicateTask(key));
        }

        // Task-level dependencies shared by every command of this task. A
        // dependency on a task is satisfied only when every command of that
        // task is Done, so known tasks expand to their full id list.
        let mut base_deps = Vec::new();
        for reference in &task.depends_on {
            let dep_ref = TaskRef::parse(reference, &spec.name)?.to_string();
            match ctx.symbols.get(&dep_ref) {
                Some(ids) => base_deps.extend(ids.iter().map(|&id| Dependency::Resolved(id))),
                None => base_deps.push(Dependency::TaskRef(dep_ref)),
            }
        }

        let mut emitted: Vec<CommandId> = Vec::with_capacity(task.commands.len());
        for text in &task.commands {
            let id = ctx.alloc_id();
            let mut deps = base_deps.clone();
            if !task.parallel {
                if let Some(&prev) = emitted.last() {
                    deps.push(Dependency::Resolved(prev));
                }
            }

            let target = if task.remote {
                let worker = ctx
                    .next_worker()
                    .ok_or_else(|| GeochainError::NoWorkersConfigured(key.clone()))?;
                Target::Remote(worker)
            } else {
                Target::Local
            };

            store
                .append(Command::new(
                    id,
                    text.clone(),
                    deps,
                    target,
                    task.on_failure,
                ))
                .await?;
            emitted.push(id);
        }

        tracing::debug!(
            task = %key,
            commands = emitted.len(),
            remote = task.remote,
            "Task compiled"
        );
        ctx.symbols.insert(key, emitted);
    }

    tracing::info!(
        pipeline = %spec.name,
        tasks = spec.tasks.len(),
        commands = store.len().await,
        "Pipeline compiled"
    );
    Ok(())
}
