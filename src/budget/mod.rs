//! Budget tracking for tier resolution.
//!
//! Every tier attempt is recorded against a single per-run budget whose
//! limit comes from the project's size class. The tracker is cooperative:
//! crossing the limit never interrupts running work, it only raises
//! signals that the orchestrator turns into warnings and phase gating.
//!
//! - [`ProjectSizeClass`]: size buckets, default limits, detection
//! - [`BudgetTracker`]: the append-only ledger and threshold signals
//! - [`UsageLog`]: the on-disk access log and running-totals report

mod log;
mod size_class;
mod tracker;

pub use log::UsageLog;
pub use size_class::{ProjectSizeClass, SizeDetection, SizeSource};
pub use tracker::{
    BudgetSignal, BudgetSummary, BudgetTracker, RecordOutcome, TierStats, efficiency_rating,
};
