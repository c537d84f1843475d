//! Run and stage state, and the persisted run manifest.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata_common::StageId;

use crate::budget::{BudgetSummary, ProjectSizeClass};
use crate::resolver::ResolverStats;

/// Lifecycle of a run. `Completed` and `Aborted` are absorbing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    #[default]
    NotStarted,
    PhaseRunning {
        index: usize,
        label: String,
    },
    Completed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// Phases only move forward; any live state may abort.
    pub fn can_transition_to(&self, next: &RunState) -> bool {
        match (self, next) {
            (Self::Completed | Self::Aborted, _) => false,
            (_, Self::Aborted) => true,
            (Self::NotStarted, Self::PhaseRunning { .. } | Self::Completed) => true,
            (Self::PhaseRunning { index: from, .. }, Self::PhaseRunning { index: to, .. }) => {
                to > from
            }
            (Self::PhaseRunning { .. }, Self::Completed) => true,
            _ => false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Aborted => 2,
            _ => 0,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::PhaseRunning { index, label } => write!(f, "running phase {} ({label})", index + 1),
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Per-stage status within a run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    /// Wrote its context document.
    Done,
    /// Did not run, or declined to; no document.
    Skipped { reason: String },
    /// Raised an error; a degenerate document records why.
    Failed { error: String },
    /// Cut short by an operator abort.
    Aborted,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Skipped { .. } | Self::Failed { .. } | Self::Aborted
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
            Self::Aborted => "aborted",
        }
    }
}

/// Persisted record of a run, at `.strata/run.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub phases_file: Option<PathBuf>,
    pub size_class: ProjectSizeClass,
    pub limit: u64,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub stages: BTreeMap<StageId, StageStatus>,
}

impl RunManifest {
    pub fn new(run_id: &str, size_class: ProjectSizeClass, limit: u64) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.to_string(),
            phases_file: None,
            size_class,
            limit,
            state: RunState::NotStarted,
            started_at: now,
            updated_at: now,
            stages: BTreeMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).context("Failed to read run manifest")?;
        let manifest = serde_json::from_str(&content).context("Failed to parse run manifest")?;
        Ok(Some(manifest))
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Utc::now();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run manifest")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).context("Failed to write run manifest")?;
        std::fs::rename(&tmp, path).context("Failed to replace run manifest")?;
        Ok(())
    }

    /// Move to `next`, refusing transitions the state machine forbids.
    pub fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            anyhow::bail!("Invalid run state transition: {} -> {}", self.state, next);
        }
        self.state = next;
        Ok(())
    }
}

/// Outcome of a run, returned by the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub state: RunState,
    /// Stage statuses in execution order.
    pub stages: Vec<(StageId, StageStatus)>,
    pub budget: BudgetSummary,
    pub resolver: ResolverStats,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl RunReport {
    pub fn status_of(&self, stage: &StageId) -> Option<&StageStatus> {
        self.stages
            .iter()
            .find(|(id, _)| id == stage)
            .map(|(_, status)| status)
    }

    pub fn count(&self, label: &str) -> usize {
        self.stages
            .iter()
            .filter(|(_, status)| status.label() == label)
            .count()
    }

    pub fn exit_code(&self) -> i32 {
        self.state.exit_code()
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn running(index: usize) -> RunState {
        RunState::PhaseRunning {
            index,
            label: format!("p{index}"),
        }
    }

    #[test]
    fn test_transitions() {
        assert!(RunState::NotStarted.can_transition_to(&running(0)));
        assert!(running(0).can_transition_to(&running(1)));
        assert!(!running(1).can_transition_to(&running(0)));
        assert!(running(1).can_transition_to(&RunState::Completed));
        assert!(running(1).can_transition_to(&RunState::Aborted));
        assert!(RunState::NotStarted.can_transition_to(&RunState::Completed));
        assert!(!RunState::Completed.can_transition_to(&RunState::Aborted));
        assert!(!RunState::Aborted.can_transition_to(&running(0)));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunState::Completed.exit_code(), 0);
        assert_eq!(RunState::Aborted.exit_code(), 2);
    }

    #[test]
    fn test_manifest_round_trip_and_invalid_transition() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".strata/run.json");
        let mut manifest = RunManifest::new("r1", ProjectSizeClass::Small, 175_000);
        manifest.transition(running(0)).unwrap();
        manifest.stages.insert(
            StageId::new("s1").unwrap(),
            StageStatus::Skipped {
                reason: "no frontend".into(),
            },
        );
        manifest.save(&path).unwrap();

        let mut loaded = RunManifest::load(&path).unwrap().unwrap();
        assert_eq!(loaded.state, running(0));
        assert_eq!(loaded.stages.len(), 1);
        assert!(loaded.transition(RunState::NotStarted).is_err());
    }

    #[test]
    fn test_status_json_shape() {
        let json = serde_json::to_value(StageStatus::Failed {
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "boom");
    }
}
