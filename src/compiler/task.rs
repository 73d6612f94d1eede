//! Pipeline description data model.
//!
//! Descriptions are external input; this module only defines the shape the
//! compiler consumes and a thin serde loader. A task is a named unit of work
//! that compiles into one command per entry of `commands`; the task itself is
//! never persisted.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GeochainError, Result};
use crate::store::ErrorPolicy;

/// Task identity: `(pipeline, label, position)`. Position disambiguates
/// repeated use of the same label within one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskRef {
    pub pipeline: String,
    pub label: String,
    pub position: u32,
}

impl TaskRef {
    pub fn new(pipeline: impl Into<String>, label: impl Into<String>, position: u32) -> Self {
        Self {
            pipeline: pipeline.into(),
            label: label.into(),
            position,
        }
    }

    /// Parse a dependency reference, qualifying it against the pipeline it
    /// appears in. Accepted forms:
    ///
    /// - `pipeline.label.position` (fully qualified, cross-file)
    /// - `label.position` (same pipeline)
    /// - `label` (same pipeline, position 1)
    pub fn parse(reference: &str, default_pipeline: &str) -> Result<Self> {
        let parts: Vec<&str> = reference.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(GeochainError::InvalidTaskRef(reference.to_string()));
        }
        let (pipeline, label, position) = match parts.as_slice() {
            [pipeline, label, position] => (pipeline.to_string(), label.to_string(), *position),
            [label, position] => (default_pipeline.to_string(), label.to_string(), *position),
            [label] => {
                return Ok(Self::new(default_pipeline, *label, 1));
            }
            _ => {
                return Err(GeochainError::InvalidTaskRef(reference.to_string()));
            }
        };
        let position: u32 = position
            .parse()
            .map_err(|_| GeochainError::InvalidTaskRef(reference.to_string()))?;
        Ok(Self {
            pipeline,
            label,
            position,
        })
    }
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.pipeline, self.label, self.position)
    }
}

fn default_position() -> u32 {
    1
}

/// One task of a pipeline description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub label: String,
    #[serde(default = "default_position")]
    pub position: u32,
    /// Task references this task waits on, in `TaskRef::parse` syntax.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Parallel-eligible: commands of this task carry no ordering among
    /// themselves. Sequential (the default) chains each command on its
    /// predecessor.
    #[serde(default)]
    pub parallel: bool,
    /// Remote-eligible: commands are assigned a worker from the pool.
    #[serde(default)]
    pub remote: bool,
    #[serde(default)]
    pub on_failure: ErrorPolicy,
    pub commands: Vec<String>,
}

/// A parsed pipeline description file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    /// Remote worker pool contributed by this description (`host:port`).
    #[serde(default)]
    pub workers: Vec<String>,
    /// Optional log file requested by the description.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    pub tasks: Vec<TaskSpec>,
}

impl PipelineSpec {
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&contents).map_err(|e| GeochainError::Description {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}
