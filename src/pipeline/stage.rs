//! The stage capability and what a stage sees while it runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use strata_common::{ContextDocument, DocumentSummary, StageId};
use tokio_util::sync::CancellationToken;

use super::definition::StageSpec;
use crate::errors::StageError;
use crate::resolver::StageResolver;

/// What a stage publishes on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    #[serde(default)]
    pub summary: DocumentSummary,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl StageReport {
    /// Data key a stage sets to `false` when it stopped before finishing.
    pub const COMPLETE_KEY: &str = "complete";

    pub fn is_partial(&self) -> bool {
        matches!(self.data.get(Self::COMPLETE_KEY), Some(Value::Bool(false)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed(StageReport),
    /// The stage cannot meaningfully run here. Not a failure.
    Skipped { reason: String },
}

impl StageOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

/// Everything handed to a stage for one execution.
#[derive(Clone)]
pub struct StageContext {
    pub run_id: String,
    pub phase_label: String,
    pub spec: Arc<StageSpec>,
    /// Resolver bound to this stage; usage is attributed automatically.
    pub resolver: StageResolver,
    /// Documents written earlier in this run, keyed by stage.
    pub prior: BTreeMap<StageId, ContextDocument>,
    pub context_dir: PathBuf,
    /// Fires on operator abort. Stages should wrap up and return what they
    /// have.
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn stage(&self) -> &StageId {
        &self.spec.id
    }

    /// Recommendations earlier stages addressed to this one, by author.
    pub fn recommendations(&self) -> BTreeMap<&StageId, &[String]> {
        self.prior
            .iter()
            .map(|(author, doc)| (author, doc.recommendations_for(&self.spec.id)))
            .filter(|(_, recs)| !recs.is_empty())
            .collect()
    }
}

/// One unit of analysis work.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> &StageId;

    async fn run(&self, ctx: StageContext) -> Result<StageOutcome, StageError>;
}

/// Stage implementations by id.
#[derive(Default, Clone)]
pub struct StageRegistry {
    stages: HashMap<StageId, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `stage`, replacing any earlier implementation for its id.
    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.id().clone(), stage);
    }

    pub fn with(mut self, stage: Arc<dyn Stage>) -> Self {
        self.register(stage);
        self
    }

    pub fn get(&self, id: &StageId) -> Option<Arc<dyn Stage>> {
        self.stages.get(id).cloned()
    }

    pub fn contains(&self, id: &StageId) -> bool {
        self.stages.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(StageId);

    #[async_trait]
    impl Stage for Named {
        fn id(&self) -> &StageId {
            &self.0
        }

        async fn run(&self, _ctx: StageContext) -> Result<StageOutcome, StageError> {
            Ok(StageOutcome::skipped("noop"))
        }
    }

    #[test]
    fn test_registry_replaces_by_id() {
        let id = StageId::new("s").unwrap();
        let registry = StageRegistry::new()
            .with(Arc::new(Named(id.clone())))
            .with(Arc::new(Named(id.clone())));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&id));
        assert!(registry.get(&StageId::new("other").unwrap()).is_none());
    }

    #[test]
    fn test_report_parses_partial_json() {
        let report: StageReport =
            serde_json::from_str(r#"{"summary":{"key_findings":["uses JSF"]}}"#).unwrap();
        assert_eq!(report.summary.key_findings, vec!["uses JSF".to_string()]);
        assert!(report.data.is_empty());
    }
}
