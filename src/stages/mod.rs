//! Built-in stage implementations.
//!
//! A stage with a `command` in the phases file runs that command as a
//! subprocess; one without is a survey that resolves its queries and
//! records where each was answered from.

mod command;
mod survey;

pub use command::CommandStage;
pub use survey::SurveyStage;

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use strata_common::{Query, SourceTier, estimate_tokens};

use crate::errors::StageError;
use crate::pipeline::{PhasePlan, StageContext, StageRegistry};

/// Registry with one built-in stage per stage in `plan`.
pub fn builtin_registry(plan: &PhasePlan, project_dir: &Path) -> StageRegistry {
    let mut registry = StageRegistry::new();
    for spec in plan.stages() {
        match spec.command {
            Some(ref command) => registry.register(Arc::new(CommandStage::new(
                spec.id.clone(),
                command,
                project_dir,
            ))),
            None => registry.register(Arc::new(SurveyStage::new(spec.id.clone()))),
        }
    }
    registry
}

/// One resolved query as stages report it.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct QueryResolution {
    pub query: String,
    pub tier: SourceTier,
    pub satisfied: bool,
    pub from_cache: bool,
    pub tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Probe the stage's `requires` query. Returns the skip reason when it
/// finds nothing.
pub(crate) async fn unmet_requirement(ctx: &StageContext) -> Result<Option<String>, StageError> {
    let Some(ref probe) = ctx.spec.requires else {
        return Ok(None);
    };
    let result = ctx
        .resolver
        .resolve(probe)
        .await
        .map_err(|e| StageError::Other(e.into()))?;
    if result.is_empty() {
        return Ok(Some(format!("required probe found nothing: {probe}")));
    }
    Ok(None)
}

/// Resolve the stage's queries in order, stopping early on abort.
/// The flag is true when every query was resolved.
pub(crate) async fn resolve_queries(
    ctx: &StageContext,
    keep_content: bool,
) -> Result<(Vec<QueryResolution>, bool), StageError> {
    let mut resolved = Vec::with_capacity(ctx.spec.queries.len());
    for query in &ctx.spec.queries {
        if ctx.cancel.is_cancelled() {
            return Ok((resolved, false));
        }
        resolved.push(resolve_one(ctx, query, keep_content).await?);
    }
    Ok((resolved, true))
}

/// Warning for a stage that stopped resolving because of an abort.
pub(crate) fn interrupted_warning(done: usize, total: usize) -> String {
    format!("interrupted by abort after {done} of {total} queries")
}

async fn resolve_one(
    ctx: &StageContext,
    query: &Query,
    keep_content: bool,
) -> Result<QueryResolution, StageError> {
    let result = ctx
        .resolver
        .resolve(query)
        .await
        .map_err(|e| StageError::Other(e.into()))?;
    Ok(QueryResolution {
        query: query.to_string(),
        tier: result.tier,
        satisfied: result.satisfied,
        from_cache: result.from_cache,
        tokens: estimate_tokens(&result.content),
        content: keep_content.then_some(result.content),
    })
}
