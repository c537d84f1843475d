use crate::{StageId, UsageSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// How the stage that produced a document ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentOutcome {
    #[default]
    Completed,
    Failed,
    /// Written on behalf of a stage cut short by an operator abort.
    Aborted,
}

/// Structured findings handed to downstream stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub priority_items: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Advice addressed to stages in later phases.
    #[serde(default)]
    pub forward_recommendations: BTreeMap<StageId, Vec<String>>,
}

/// One stage's published result for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDocument {
    pub run_id: String,
    pub stage: StageId,
    pub phase_label: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub outcome: DocumentOutcome,
    pub summary: DocumentSummary,
    /// Stage-specific payload; opaque to the pipeline.
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub usage: UsageSummary,
}

impl ContextDocument {
    pub fn new(
        run_id: &str,
        stage: StageId,
        phase_label: &str,
        summary: DocumentSummary,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage,
            phase_label: phase_label.to_string(),
            timestamp: Utc::now(),
            outcome: DocumentOutcome::Completed,
            summary,
            data,
            usage: UsageSummary::default(),
        }
    }

    /// A document recording that the stage produced nothing usable: empty
    /// `data`, the reason as the only warning.
    pub fn degenerate(
        run_id: &str,
        stage: StageId,
        phase_label: &str,
        outcome: DocumentOutcome,
        reason: &str,
    ) -> Self {
        let summary = DocumentSummary {
            warnings: vec![reason.to_string()],
            ..Default::default()
        };
        Self {
            outcome,
            ..Self::new(run_id, stage, phase_label, summary, Map::new())
        }
    }

    pub fn with_usage(mut self, usage: UsageSummary) -> Self {
        self.usage = usage;
        self
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.summary.warnings.push(warning.into());
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == DocumentOutcome::Completed
    }

    /// Recommendations another stage left for `stage`.
    pub fn recommendations_for(&self, stage: &StageId) -> &[String] {
        self.summary
            .forward_recommendations
            .get(stage)
            .map_or(&[], |v| v.as_slice())
    }
}
