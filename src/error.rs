use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Malformed document at {path}: {source}")]
    CorruptDocument {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No home directory")]
    NoHomeDir,

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Ambiguous id '{prefix}' matches {count} entries")]
    AmbiguousId { prefix: String, count: usize },

    #[error("Cannot {verb} plan in stage: {stage}")]
    InvalidPlanStage { verb: &'static str, stage: String },

    #[error("Plan {id} is not a draft (current stage: {stage})")]
    PlanNotDraft { id: String, stage: String },

    #[error("Step index {index} out of range ({range})")]
    StepOutOfRange { index: usize, range: String },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Cannot {verb} execution in stage: {stage}")]
    InvalidExecutionStage { verb: &'static str, stage: String },

    #[error("Cannot complete execution with incomplete tasks")]
    IncompleteTasks,

    #[error("Cannot {verb} task {index} in status: {status}")]
    InvalidTaskStatus {
        verb: &'static str,
        index: usize,
        status: String,
    },

    #[error("Agent runtime error: {0}")]
    Runtime(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid id: {0:?}")]
    InvalidId(String),
}

impl Error {
    /// Bounds error for a step index against a collection of `len` steps.
    pub fn step_out_of_range(index: usize, len: usize) -> Self {
        let range = if len == 0 {
            "plan has no steps".to_string()
        } else {
            format!("valid: 0..={}", len - 1)
        };
        Error::StepOutOfRange { index, range }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
