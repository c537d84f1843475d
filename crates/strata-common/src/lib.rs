//! Shared domain types for the strata pipeline.
//!
//! These types cross every boundary in the workspace: the resolver produces
//! [`ResolutionResult`]s, the budget tracker records [`UsageRecord`]s, and
//! stages hand each other [`ContextDocument`]s through the context store.

mod document;
mod query;
mod stage;
mod tier;
mod tokens;
mod usage;

pub use document::{ContextDocument, DocumentOutcome, DocumentSummary};
pub use query::{Query, QueryError};
pub use stage::{InvalidStageId, StageId};
pub use tier::{ResolutionResult, SourceTier};
pub use tokens::estimate_tokens;
pub use usage::{UsageRecord, UsageSummary};
