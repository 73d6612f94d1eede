//! Cross-reference resolution.
//!
//! Runs once, after every pipeline description of the run has been compiled.
//! Each symbolic placeholder is rewritten into the command-id list recorded
//! in the symbol table, then the store is verified: zero placeholders remain
//! and the resulting id graph is acyclic. Both checks are fatal before any
//! execution starts.

use std::collections::HashMap;

use crate::compiler::compile::CompilerContext;
use crate::error::{GeochainError, Result};
use crate::store::{Command, CommandId, CommandStore};

/// Resolve all placeholders and verify the store. Returns the number of
/// placeholders replaced.
pub async fn resolve_cross_references(
    store: &CommandStore,
    ctx: &CompilerContext,
) -> Result<usize> {
    let replaced = store.substitute_placeholders(ctx.symbols()).await?;

    // Internal-consistency scan: substitution must not have left anything
    // symbolic behind.
    if let Some((id, reference)) = store.placeholders().await.into_iter().next() {
        return Err(GeochainError::PlaceholderResidue { id, reference });
    }

    detect_cycles(&store.all().await)?;

    tracing::info!(replaced, "Cross-references resolved");
    Ok(replaced)
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Finished,
}

/// Depth-first cycle check over resolved dependency ids.
fn detect_cycles(commands: &[Command]) -> Result<()> {
    let index: HashMap<CommandId, &Command> = commands.iter().map(|c| (c.id, c)).collect();
    let mut marks: HashMap<CommandId, Mark> =
        commands.iter().map(|c| (c.id, Mark::Unvisited)).collect();

    for cmd in commands {
        if marks[&cmd.id] == Mark::Unvisited {
            visit(cmd.id, &index, &mut marks)?;
        }
    }
    Ok(())
}

fn visit(
    id: CommandId,
    index: &HashMap<CommandId, &Command>,
    marks: &mut HashMap<CommandId, Mark>,
) -> Result<()> {
    // Iterative DFS; pipeline graphs can chain thousands of commands deep.
    let mut stack: Vec<(CommandId, usize)> = vec![(id, 0)];
    marks.insert(id, Mark::InProgress);

    while let Some(&(current, dep_idx)) = stack.last() {
        let cmd = index
            .get(&current)
            .ok_or(GeochainError::CommandNotFound(current))?;
        let deps: Vec<CommandId> = cmd.resolved_deps().collect();

        if dep_idx >= deps.len() {
            marks.insert(current, Mark::Finished);
            stack.pop();
            continue;
        }
        if let Some(top) = stack.last_mut() {
            top.1 += 1;
        }

        let dep = deps[dep_idx];
        match marks.get(&dep).copied() {
            Some(Mark::InProgress) => return Err(GeochainError::DependencyCycle(dep)),
            Some(Mark::Unvisited) => {
                marks.insert(dep, Mark::InProgress);
                stack.push((dep, 0));
            }
            Some(Mark::Finished) => {}
            // Dangling id: the referenced command does not exist.
            None => return Err(GeochainError::CommandNotFound(dep)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile::{compile_pipeline, CompilerContext};
    use crate::compiler::task::{PipelineSpec, TaskSpec};
    use crate::store::{Dependency, ErrorPolicy, Target};

    fn task(label: &str, deps: &[&str], commands: &[&str]) -> TaskSpec {
        TaskSpec {
            label: label.to_string(),
            position: 1,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            parallel: false,
            remote: false,
            on_failure: ErrorPolicy::AbortRun,
            commands: commands.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn pipeline(name: &str, tasks: Vec<TaskSpec>) -> PipelineSpec {
        PipelineSpec {
            name: name.to_string(),
            workers: vec![],
            log_file: None,
            tasks,
        }
    }

    async fn fresh() -> (tempfile::TempDir, CommandStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CommandStore::create(dir.path().join("run.store"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn cross_file_forward_reference_resolves() {
        let (_dir, store) = fresh().await;
        let mut ctx = CompilerContext::new(vec![]);

        // ortho references mnt.fusion.1, compiled only afterwards.
        let ortho = pipeline("ortho", vec![task("mosaic", &["mnt.fusion.1"], &["m"])]);
        let mnt = pipeline("mnt", vec![task("fusion", &[], &["f1", "f2"])]);

        compile_pipeline(&ortho, &mut ctx, &store).await.unwrap();
        compile_pipeline(&mnt, &mut ctx, &store).await.unwrap();

        let replaced = resolve_cross_references(&store, &ctx).await.unwrap();
        assert_eq!(replaced, 1);
        assert!(store.placeholders().await.is_empty());
        assert_eq!(
            store.get(1).await.unwrap().deps,
            vec![Dependency::Resolved(2), Dependency::Resolved(3)]
        );
    }

    #[tokio::test]
    async fn unknown_reference_after_all_pipelines_is_fatal() {
        let (_dir, store) = fresh().await;
        let mut ctx = CompilerContext::new(vec![]);
        let spec = pipeline("ortho", vec![task("mosaic", &["mnt.ghost.1"], &["m"])]);
        compile_pipeline(&spec, &mut ctx, &store).await.unwrap();

        let err = resolve_cross_references(&store, &ctx).await.unwrap_err();
        assert!(matches!(err, GeochainError::UnresolvedDependency(r) if r == "mnt.ghost.1"));
    }

    #[tokio::test]
    async fn cyclic_references_are_rejected() {
        let (_dir, store) = fresh().await;
        let mut ctx = CompilerContext::new(vec![]);

        let a = pipeline("a", vec![task("t", &["b.t.1"], &["x"])]);
        let b = pipeline("b", vec![task("t", &["a.t.1"], &["y"])]);
        compile_pipeline(&a, &mut ctx, &store).await.unwrap();
        compile_pipeline(&b, &mut ctx, &store).await.unwrap();

        let err = resolve_cross_references(&store, &ctx).await.unwrap_err();
        assert!(matches!(err, GeochainError::DependencyCycle(_)));
    }

    #[tokio::test]
    async fn acyclic_chain_passes_cycle_check() {
        let cmds: Vec<Command> = (1..=4)
            .map(|id| {
                let deps = if id == 1 {
                    vec![]
                } else {
                    vec![Dependency::Resolved(id - 1)]
                };
                Command::new(id, "true".to_string(), deps, Target::Local, ErrorPolicy::AbortRun)
            })
            .collect();
        assert!(detect_cycles(&cmds).is_ok());
    }

    #[tokio::test]
    async fn self_dependency_is_a_cycle() {
        let cmd = Command::new(
            1,
            "true".to_string(),
            vec![Dependency::Resolved(1)],
            Target::Local,
            ErrorPolicy::AbortRun,
        );
        let err = detect_cycles(&[cmd]).unwrap_err();
        assert!(matches!(err, GeochainError::DependencyCycle(1)));
    }
}
