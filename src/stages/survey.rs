use async_trait::async_trait;
use serde_json::{Map, Value};
use strata_common::{DocumentSummary, StageId};

use super::{interrupted_warning, resolve_queries, unmet_requirement};
use crate::errors::StageError;
use crate::pipeline::{Stage, StageContext, StageOutcome, StageReport};

/// Resolves the stage's queries and reports which tier answered each.
pub struct SurveyStage {
    id: StageId,
}

impl SurveyStage {
    pub fn new(id: StageId) -> Self {
        Self { id }
    }
}

#[async_trait]
impl Stage for SurveyStage {
    fn id(&self) -> &StageId {
        &self.id
    }

    async fn run(&self, ctx: StageContext) -> Result<StageOutcome, StageError> {
        if let Some(reason) = unmet_requirement(&ctx).await? {
            return Ok(StageOutcome::Skipped { reason });
        }

        let (resolved, complete) = resolve_queries(&ctx, false).await?;

        let mut summary = DocumentSummary::default();
        for r in &resolved {
            let source = if r.from_cache { "cache" } else { r.tier.as_str() };
            summary.key_findings.push(format!(
                "{} answered from {source} (~{} tokens)",
                r.query, r.tokens
            ));
        }
        for (author, recs) in ctx.recommendations() {
            summary
                .priority_items
                .extend(recs.iter().map(|rec| format!("{author}: {rec}")));
        }
        if !complete {
            summary
                .warnings
                .push(interrupted_warning(resolved.len(), ctx.spec.queries.len()));
        }
        for target in &ctx.spec.forward_to {
            summary
                .forward_recommendations
                .entry(target.clone())
                .or_default()
                .push(format!("review the {} survey before starting", self.id));
        }

        let mut data = Map::new();
        let resolutions =
            serde_json::to_value(&resolved).map_err(|e| StageError::Other(e.into()))?;
        data.insert("resolutions".to_string(), resolutions);
        data.insert(StageReport::COMPLETE_KEY.to_string(), Value::Bool(complete));
        Ok(StageOutcome::Completed(StageReport { summary, data }))
    }
}
