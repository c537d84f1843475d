//! Phased execution of analysis stages.
//!
//! A run is described by a phases file: an ordered set of labelled phases,
//! each holding stages that run in parallel or one after another. Phases
//! may name the phases they depend on; the [`PhasePlan`] orders them and
//! rejects cycles, duplicate stages and recommendations that point
//! backwards. The [`Orchestrator`] then drives the plan, persisting one
//! context document per stage and a run manifest as it goes.

pub mod definition;
pub mod graph;
pub mod orchestrator;
pub mod stage;
pub mod state;

pub use definition::{PhaseDef, PhasePlan, PhasesFile, StageSpec};
pub use graph::{DagBuilder, PhaseGraph};
pub use orchestrator::{Orchestrator, RunEvent, RunOptions};
pub use stage::{Stage, StageContext, StageOutcome, StageRegistry, StageReport};
pub use state::{RunManifest, RunReport, RunState, StageStatus};
