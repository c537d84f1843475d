//! Phase definition files.
//!
//! A run is described by a JSON or YAML file listing phases in file order:
//!
//! ```yaml
//! phases:
//!   - label: discovery
//!     stages:
//!       - id: legacy-detective
//!         queries: [{ search_term: springframework }]
//!         forward_to: [security]
//!   - label: analysis
//!     parallel: true
//!     depends_on: [discovery]
//!     stages:
//!       - id: security
//!         command: ./agents/security.sh
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use strata_common::{Query, StageId};

use super::graph::DagBuilder;
use crate::errors::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasesFile {
    pub phases: Vec<PhaseDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDef {
    pub label: String,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: StageId,
    /// Queries resolved before the stage body runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queries: Vec<Query>,
    /// Shell command implementing the stage. Without one the stage is a
    /// survey of its queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Probe that must resolve to non-empty content, or the stage skips.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<Query>,
    /// Per-stage allotment within the run budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forward_to: Vec<StageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StageSpec {
    pub fn new(id: StageId) -> Self {
        Self {
            id,
            queries: Vec::new(),
            command: None,
            requires: None,
            budget: None,
            forward_to: Vec::new(),
            timeout_secs: None,
        }
    }
}

impl PhasesFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phase file {}", path.display()))?;
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
        if is_yaml {
            Self::parse_yaml(&content)
        } else {
            Self::parse_json(&content)
        }
        .with_context(|| format!("Invalid phase file {}", path.display()))
    }

    pub fn parse_json(content: &str) -> anyhow::Result<Self> {
        serde_json::from_str(content).context("Failed to parse phase file as JSON")
    }

    pub fn parse_yaml(content: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse phase file as YAML")
    }
}

/// A validated phase list in execution order.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    phases: Vec<PhaseDef>,
    waves: Vec<Vec<String>>,
    stage_position: HashMap<StageId, usize>,
}

impl PhasePlan {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        Self::new(PhasesFile::load(path)?.phases)
    }

    /// Validate `phases` and order them topologically, ties broken by file
    /// order.
    pub fn new(phases: Vec<PhaseDef>) -> Result<Self, PipelineError> {
        let mut seen = HashSet::new();
        for phase in &phases {
            if phase.stages.is_empty() {
                return Err(PipelineError::EmptyPhase {
                    phase: phase.label.clone(),
                });
            }
            for stage in &phase.stages {
                if !seen.insert(stage.id.clone()) {
                    return Err(PipelineError::DuplicateStage {
                        stage: stage.id.clone(),
                    });
                }
                for query in stage.queries.iter().chain(stage.requires.iter()) {
                    query
                        .validate()
                        .map_err(|source| PipelineError::InvalidQuery {
                            stage: stage.id.clone(),
                            source,
                        })?;
                }
            }
        }

        let graph = DagBuilder::new(phases).build()?;
        let waves = graph.waves();
        let ordered: Vec<PhaseDef> = graph
            .execution_order()
            .into_iter()
            .filter_map(|i| graph.phase(i).cloned())
            .collect();

        let stage_position = ordered
            .iter()
            .enumerate()
            .flat_map(|(i, phase)| phase.stages.iter().map(move |s| (s.id.clone(), i)))
            .collect();

        let plan = Self {
            phases: ordered,
            waves,
            stage_position,
        };

        for phase in &plan.phases {
            for stage in &phase.stages {
                for target in &stage.forward_to {
                    if !plan.is_later(&stage.id, target) {
                        return Err(PipelineError::BackwardRecommendation {
                            stage: stage.id.clone(),
                            target: target.to_string(),
                        });
                    }
                }
            }
        }

        Ok(plan)
    }

    /// Phases in execution order.
    pub fn phases(&self) -> &[PhaseDef] {
        &self.phases
    }

    /// Groups of phases whose dependencies are met together, for display.
    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.phases.iter().flat_map(|p| p.stages.iter())
    }

    pub fn stage(&self, id: &StageId) -> Option<&StageSpec> {
        self.stages().find(|s| &s.id == id)
    }

    pub fn stage_count(&self) -> usize {
        self.stage_position.len()
    }

    /// Whether `to` runs in a strictly later phase than `from`.
    pub fn is_later(&self, from: &StageId, to: &StageId) -> bool {
        match (self.stage_position.get(from), self.stage_position.get(to)) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }

    pub fn allotments(&self) -> HashMap<StageId, u64> {
        self.stages()
            .filter_map(|s| s.budget.map(|b| (s.id.clone(), b)))
            .collect()
    }
}
