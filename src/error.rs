use std::path::PathBuf;

use thiserror::Error;

use crate::store::CommandId;

#[derive(Error, Debug)]
pub enum GeochainError {
    #[error("unresolved task reference: {0}")]
    UnresolvedDependency(String),

    #[error("dependency cycle involving command {0}")]
    DependencyCycle(CommandId),

    #[error("placeholder survived resolution on command {id}: {reference}")]
    PlaceholderResidue { id: CommandId, reference: String },

    #[error("invalid task reference syntax: {0:?}")]
    InvalidTaskRef(String),

    #[error("duplicate task definition: {0}")]
    DuplicateTask(String),

    #[error("task {0} is remote-eligible but no remote workers are configured")]
    NoWorkersConfigured(String),

    #[error("command not found: {0}")]
    CommandNotFound(CommandId),

    #[error("command {0} is already in a terminal state")]
    AlreadyTerminal(CommandId),

    #[error("malformed store record: {0}")]
    MalformedRecord(String),

    #[error("pipeline description {path:?}: {message}")]
    Description { path: PathBuf, message: String },

    #[error("remote worker {worker} unreachable for command {id}: {message}")]
    RemoteUnreachable {
        worker: String,
        id: CommandId,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GeochainError>;
