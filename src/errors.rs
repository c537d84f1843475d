//! Typed error hierarchy for strata.
//!
//! One enum per subsystem:
//! - `StoreError`: context store persistence (the only run-fatal kind)
//! - `ResolveError`: a tier source failed; absorbed by falling to the next tier
//! - `StageError`: stage-specific failure, converted into a degenerate document
//! - `PipelineError`: invalid phase definitions and run-level failures

use std::path::PathBuf;
use strata_common::{QueryError, StageId};
use thiserror::Error;

/// Errors from the context store. Any of these aborts the run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to create context directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write context document at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read context document at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed context document at {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize context document for stage {stage}: {source}")]
    Serialize {
        stage: StageId,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from a single tier source.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{tier} source unavailable: {reason}")]
    Unavailable { tier: &'static str, reason: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(#[from] QueryError),

    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("I/O error while resolving: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by stage-specific logic.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Failed to spawn stage command '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stage command exited with code {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },

    #[error("Stage report is not valid JSON: {0}")]
    MalformedReport(#[source] serde_json::Error),

    #[error("Stage timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Stage panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from phase definitions and run control.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Duplicate phase label: {0}")]
    DuplicatePhase(String),

    #[error("Stage {stage} appears in more than one phase")]
    DuplicateStage { stage: StageId },

    #[error("Phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Dependency cycle detected among phases: {0}")]
    Cycle(String),

    #[error("Phase {phase} has no stages")]
    EmptyPhase { phase: String },

    #[error("Stage {stage} forwards to {target}, which is not in a later phase")]
    BackwardRecommendation { stage: StageId, target: String },

    #[error("Stage {stage} declares an invalid query: {source}")]
    InvalidQuery {
        stage: StageId,
        #[source]
        source: QueryError,
    },

    #[error("No stage implementation registered for {0}")]
    UnregisteredStage(StageId),

    #[error("Another run holds the workspace lock at {0}")]
    Locked(PathBuf),

    #[error(transparent)]
    Persistence(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
