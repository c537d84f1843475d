//! Phase-by-phase run execution.
//!
//! Phases run one at a time in plan order. Within a parallel phase every
//! stage is spawned at once, bounded by `max_parallel`; a sequential phase
//! spawns them one after another. Each stage runs in its own task so a
//! panic is contained and becomes a failed stage. The orchestrator is the
//! only writer of context documents: stages hand back a report, and the
//! orchestrator persists it (or a degenerate document on failure).

use anyhow::anyhow;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_common::{ContextDocument, DocumentOutcome, StageId};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::definition::{PhaseDef, PhasePlan, StageSpec};
use super::stage::{StageContext, StageOutcome, StageRegistry};
use super::state::{RunManifest, RunReport, RunState, StageStatus};
use crate::budget::{BudgetSignal, BudgetTracker, ProjectSizeClass, UsageLog};
use crate::config::Config;
use crate::context::ContextStore;
use crate::errors::{PipelineError, StageError};
use crate::resolver::{SourceResolver, StageResolver};

const ABORT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Progress events emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    PhaseStarted { index: usize, label: String },
    StageStarted { stage: StageId, phase: String },
    StageFinished { stage: StageId, status: StageStatus },
    PhaseFinished { index: usize, label: String },
    Budget { signal: BudgetSignal },
    RunFinished { state: RunState },
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub size_class: ProjectSizeClass,
    pub limit: u64,
    /// Continue the run recorded in the manifest instead of starting anew.
    pub resume: bool,
    pub phases_file: Option<std::path::PathBuf>,
}

impl RunOptions {
    pub fn new(size_class: ProjectSizeClass, limit: u64) -> Self {
        Self {
            size_class,
            limit,
            resume: false,
            phases_file: None,
        }
    }
}

/// Exclusive lock on the workspace for the lifetime of a run. Released
/// when dropped.
struct RunLock {
    _file: std::fs::File,
}

impl RunLock {
    fn acquire(path: &Path) -> Result<Self, PipelineError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| anyhow!("Failed to open run lock {}: {e}", path.display()))?;
        fs2::FileExt::try_lock_exclusive(&file)
            .map_err(|_| PipelineError::Locked(path.to_path_buf()))?;
        Ok(Self { _file: file })
    }
}

/// State owned by one run.
struct ActiveRun {
    run_id: String,
    resume: bool,
    tracker: Arc<BudgetTracker>,
    resolver: Arc<SourceResolver>,
    store: ContextStore,
    manifest: RunManifest,
    signals: mpsc::UnboundedReceiver<BudgetSignal>,
}

pub struct Orchestrator {
    config: Config,
    plan: PhasePlan,
    registry: StageRegistry,
    event_tx: Option<mpsc::Sender<RunEvent>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Config, plan: PhasePlan, registry: StageRegistry) -> Self {
        Self {
            config,
            plan,
            registry,
            event_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Token that aborts the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    pub async fn run(&self, options: RunOptions) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        if let Some(missing) = self.plan.stages().find(|s| !self.registry.contains(&s.id)) {
            return Err(PipelineError::UnregisteredStage(missing.id.clone()));
        }

        self.config.ensure_directories()?;
        let _lock = RunLock::acquire(&self.config.lock_file)?;
        self.clear_abort_signal();

        let mut manifest = self.open_manifest(&options)?;
        let run_id = manifest.run_id.clone();
        if options.phases_file.is_some() {
            manifest.phases_file = options.phases_file.clone();
        }
        for stage in self.plan.stages() {
            manifest.stages.insert(stage.id.clone(), StageStatus::Pending);
        }
        manifest.save(&self.config.manifest_file)?;

        let log = UsageLog::new(self.config.data_access_log(), self.config.token_usage_log());
        let prior_usage = if options.resume {
            log.load_records(&run_id)?
        } else {
            Vec::new()
        };
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let tracker = Arc::new(
            BudgetTracker::new(&run_id, manifest.size_class, manifest.limit)
                .with_log(log)
                .with_signal_channel(signal_tx)
                .with_allotments(self.plan.allotments())
                .with_records(&prior_usage),
        );
        let resolver = Arc::new(SourceResolver::from_config(&self.config, tracker.clone()));
        let store = ContextStore::open(&self.config.context_dir, &run_id)?;

        tracing::info!(
            run_id = %run_id,
            phases = self.plan.phases().len(),
            stages = self.plan.stage_count(),
            size_class = %manifest.size_class,
            limit = manifest.limit,
            resume = options.resume,
            "run started"
        );

        let mut run = ActiveRun {
            run_id,
            resume: options.resume,
            tracker,
            resolver,
            store,
            manifest,
            signals,
        };

        let watcher = self.spawn_abort_watcher();
        let outcome = self.run_phases(&mut run).await;
        watcher.abort();
        self.clear_abort_signal();
        self.drain_signals(&mut run).await;

        let state = match outcome {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(error = %e, "run aborted by unrecoverable error");
                run.manifest.state = RunState::Aborted;
                if let Err(save) = run.manifest.save(&self.config.manifest_file) {
                    tracing::error!(error = %save, "failed to record aborted run state");
                }
                self.emit(RunEvent::RunFinished {
                    state: RunState::Aborted,
                })
                .await;
                return Err(e);
            }
        };

        run.manifest.transition(state.clone())?;
        run.manifest.save(&self.config.manifest_file)?;

        let report = RunReport {
            run_id: run.run_id.clone(),
            state: state.clone(),
            stages: self
                .plan
                .stages()
                .map(|s| {
                    let status = run.manifest.stages.get(&s.id).cloned().unwrap_or_default();
                    (s.id.clone(), status)
                })
                .collect(),
            budget: run.tracker.summary(),
            resolver: run.resolver.stats(),
            duration: started.elapsed(),
        };

        tracing::info!(
            run_id = %report.run_id,
            state = %state,
            consumed = report.budget.consumed,
            limit = report.budget.limit,
            efficiency = report.budget.efficiency_score,
            "run finished"
        );
        self.emit(RunEvent::RunFinished { state }).await;
        Ok(report)
    }

    fn open_manifest(&self, options: &RunOptions) -> Result<RunManifest, PipelineError> {
        if options.resume {
            match RunManifest::load(&self.config.manifest_file)? {
                Some(mut manifest) => {
                    tracing::info!(run_id = %manifest.run_id, previous = %manifest.state, "resuming run");
                    manifest.state = RunState::NotStarted;
                    return Ok(manifest);
                }
                None => tracing::warn!("no previous run to resume, starting a new one"),
            }
        }
        Ok(RunManifest::new(
            &Uuid::new_v4().to_string(),
            options.size_class,
            options.limit,
        ))
    }

    async fn run_phases(&self, run: &mut ActiveRun) -> Result<RunState, PipelineError> {
        let phases = self.plan.phases();
        for (index, phase) in phases.iter().enumerate() {
            self.drain_signals(run).await;

            if self.cancel.is_cancelled() {
                self.skip_phases(run, &phases[index..], "run aborted before phase started")
                    .await?;
                return Ok(RunState::Aborted);
            }

            if run.tracker.is_exhausted() {
                let reason = format!(
                    "budget exhausted ({} of {} used)",
                    run.tracker.consumed(),
                    run.tracker.limit()
                );
                tracing::warn!(phase = %phase.label, "refusing to start phase: {reason}");
                self.skip_phases(run, std::slice::from_ref(phase), &reason)
                    .await?;
                continue;
            }

            run.manifest.transition(RunState::PhaseRunning {
                index,
                label: phase.label.clone(),
            })?;
            run.manifest.save(&self.config.manifest_file)?;
            tracing::info!(phase = %phase.label, index, parallel = phase.parallel, "phase started");
            self.emit(RunEvent::PhaseStarted {
                index,
                label: phase.label.clone(),
            })
            .await;

            self.run_phase(run, phase).await?;

            tracing::info!(phase = %phase.label, index, "phase finished");
            self.emit(RunEvent::PhaseFinished {
                index,
                label: phase.label.clone(),
            })
            .await;

            if self.cancel.is_cancelled() {
                self.skip_phases(run, &phases[index + 1..], "run aborted before phase started")
                    .await?;
                return Ok(RunState::Aborted);
            }
        }
        Ok(RunState::Completed)
    }

    async fn run_phase(&self, run: &mut ActiveRun, phase: &PhaseDef) -> Result<(), PipelineError> {
        let mut todo = Vec::new();
        for spec in &phase.stages {
            if self.completed_earlier(run, &spec.id)? {
                tracing::info!(stage = %spec.id, "stage completed earlier in this run, not re-running");
                self.set_status(run, &spec.id, StageStatus::Done).await?;
                continue;
            }
            todo.push(spec.clone());
        }

        if phase.parallel {
            return self.run_batch(run, phase, todo).await;
        }
        for (i, spec) in todo.iter().enumerate() {
            if self.cancel.is_cancelled() {
                for rest in &todo[i..] {
                    let status = StageStatus::Skipped {
                        reason: "run aborted before stage started".to_string(),
                    };
                    self.set_status(run, &rest.id, status).await?;
                }
                break;
            }
            self.run_batch(run, phase, vec![spec.clone()]).await?;
        }
        Ok(())
    }

    fn completed_earlier(&self, run: &ActiveRun, stage: &StageId) -> Result<bool, PipelineError> {
        if !run.resume {
            return Ok(false);
        }
        Ok(run
            .store
            .read(stage)?
            .is_some_and(|doc| doc.is_completed()))
    }

    /// Spawn `specs` and wait for each to reach a terminal state. After an
    /// abort, stages still running once the grace period ends are killed
    /// and recorded as aborted.
    async fn run_batch(
        &self,
        run: &mut ActiveRun,
        phase: &PhaseDef,
        specs: Vec<StageSpec>,
    ) -> Result<(), PipelineError> {
        if specs.is_empty() {
            return Ok(());
        }
        let prior = run.store.read_all()?;
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel));
        let mut aborts = Vec::with_capacity(specs.len());
        let mut pending = FuturesUnordered::new();

        for spec in specs {
            let stage = self
                .registry
                .get(&spec.id)
                .ok_or_else(|| PipelineError::UnregisteredStage(spec.id.clone()))?;
            let spec = Arc::new(spec);
            let ctx = StageContext {
                run_id: run.run_id.clone(),
                phase_label: phase.label.clone(),
                spec: spec.clone(),
                resolver: StageResolver::new(run.resolver.clone(), spec.id.clone(), &phase.label),
                prior: prior.clone(),
                context_dir: self.config.context_dir.clone(),
                cancel: self.cancel.clone(),
            };
            let timeout = spec
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| self.config.stage_timeout());

            self.set_status(run, &spec.id, StageStatus::Running).await?;
            let handle = spawn_stage(
                stage,
                ctx,
                semaphore.clone(),
                timeout,
                self.event_tx.clone(),
            );
            aborts.push((spec.id.clone(), handle.abort_handle()));
            let id = spec.id.clone();
            pending.push(async move { (id, handle.await) });
        }

        let grace = self.config.grace_period();
        let mut deadline: Option<tokio::time::Instant> = None;
        let mut finished: HashSet<StageId> = HashSet::new();

        loop {
            let wake = deadline.unwrap_or_else(|| tokio::time::Instant::now() + grace);
            tokio::select! {
                next = pending.next() => {
                    let Some((id, joined)) = next else { break };
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => Err(StageError::Panicked(panic_message(e))),
                        Err(e) => Err(StageError::Other(anyhow!("stage task cancelled: {e}"))),
                    };
                    if let Err(e) = self.finalize(run, &id, &phase.label, result).await {
                        aborts.iter().for_each(|(_, handle)| handle.abort());
                        return Err(e);
                    }
                    finished.insert(id);
                }
                _ = self.cancel.cancelled(), if deadline.is_none() => {
                    tracing::warn!(
                        phase = %phase.label,
                        grace_secs = grace.as_secs(),
                        "abort requested, waiting for in-flight stages"
                    );
                    deadline = Some(tokio::time::Instant::now() + grace);
                }
                _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                    for (id, handle) in &aborts {
                        if !finished.contains(id) {
                            handle.abort();
                            self.record_aborted(run, id, &phase.label, grace).await?;
                        }
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Turn a stage result into its persisted document and final status.
    async fn finalize(
        &self,
        run: &mut ActiveRun,
        stage: &StageId,
        phase_label: &str,
        result: Result<StageOutcome, StageError>,
    ) -> Result<(), PipelineError> {
        let status = match result {
            Ok(StageOutcome::Completed(report)) => {
                let interrupted = self.cancel.is_cancelled() || report.is_partial();
                let mut doc = ContextDocument::new(
                    &run.run_id,
                    stage.clone(),
                    phase_label,
                    report.summary,
                    report.data,
                );
                self.drop_backward_recommendations(&mut doc);
                if interrupted {
                    // partial results are kept but never count as completed on resume
                    doc.outcome = DocumentOutcome::Aborted;
                    doc.push_warning("run aborted before the stage finished; results are partial");
                    self.write_document(run, doc)?;
                    tracing::warn!(%stage, "stage interrupted by abort, partial results kept");
                    StageStatus::Aborted
                } else {
                    self.write_document(run, doc)?;
                    tracing::info!(%stage, "stage done");
                    StageStatus::Done
                }
            }
            Ok(StageOutcome::Skipped { reason }) => {
                tracing::info!(%stage, reason, "stage skipped");
                StageStatus::Skipped { reason }
            }
            Err(e) => {
                let error = e.to_string();
                tracing::error!(%stage, error, "stage failed");
                let doc = ContextDocument::degenerate(
                    &run.run_id,
                    stage.clone(),
                    phase_label,
                    DocumentOutcome::Failed,
                    &error,
                );
                self.write_document(run, doc)?;
                StageStatus::Failed { error }
            }
        };
        self.set_status(run, stage, status).await?;
        self.drain_signals(run).await;
        Ok(())
    }

    async fn record_aborted(
        &self,
        run: &mut ActiveRun,
        stage: &StageId,
        phase_label: &str,
        grace: Duration,
    ) -> Result<(), PipelineError> {
        tracing::warn!(%stage, "stage still running after grace period, terminated");
        let reason = format!(
            "run aborted; stage terminated after a {}s grace period",
            grace.as_secs()
        );
        let doc = ContextDocument::degenerate(
            &run.run_id,
            stage.clone(),
            phase_label,
            DocumentOutcome::Aborted,
            &reason,
        );
        self.write_document(run, doc)?;
        self.set_status(run, stage, StageStatus::Aborted).await
    }

    fn write_document(
        &self,
        run: &ActiveRun,
        mut doc: ContextDocument,
    ) -> Result<(), PipelineError> {
        doc.usage = run.tracker.stage_usage(&doc.stage);
        if run.tracker.is_exhausted() {
            doc.push_warning(format!(
                "budget exhausted: {} of {} used",
                run.tracker.consumed(),
                run.tracker.limit()
            ));
        }
        run.store.write(&doc)?;
        Ok(())
    }

    /// Recommendations may only target stages of later phases.
    fn drop_backward_recommendations(&self, doc: &mut ContextDocument) {
        let dropped: Vec<StageId> = doc
            .summary
            .forward_recommendations
            .keys()
            .filter(|target| !self.plan.is_later(&doc.stage, target))
            .cloned()
            .collect();
        for target in dropped {
            doc.summary.forward_recommendations.remove(&target);
            tracing::warn!(stage = %doc.stage, %target, "dropped recommendation to a stage that is not in a later phase");
            doc.push_warning(format!(
                "dropped recommendations for {target}: not a stage in a later phase"
            ));
        }
    }

    async fn skip_phases(
        &self,
        run: &mut ActiveRun,
        phases: &[PhaseDef],
        reason: &str,
    ) -> Result<(), PipelineError> {
        for phase in phases {
            for spec in &phase.stages {
                let status = if self.completed_earlier(run, &spec.id)? {
                    StageStatus::Done
                } else {
                    StageStatus::Skipped {
                        reason: reason.to_string(),
                    }
                };
                self.set_status(run, &spec.id, status).await?;
            }
        }
        Ok(())
    }

    async fn set_status(
        &self,
        run: &mut ActiveRun,
        stage: &StageId,
        status: StageStatus,
    ) -> Result<(), PipelineError> {
        let terminal = status.is_terminal();
        run.manifest.stages.insert(stage.clone(), status.clone());
        run.manifest.save(&self.config.manifest_file)?;
        if terminal {
            self.emit(RunEvent::StageFinished {
                stage: stage.clone(),
                status,
            })
            .await;
        }
        Ok(())
    }

    async fn drain_signals(&self, run: &mut ActiveRun) {
        while let Ok(signal) = run.signals.try_recv() {
            self.emit(RunEvent::Budget { signal }).await;
        }
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }

    fn clear_abort_signal(&self) {
        if self.config.abort_file.exists()
            && let Err(e) = std::fs::remove_file(&self.config.abort_file)
        {
            tracing::warn!(error = %e, "failed to remove abort signal file");
        }
    }

    /// Cancel the run on Ctrl-C or when the abort file appears.
    fn spawn_abort_watcher(&self) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let abort_file = self.config.abort_file.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            let mut ctrl_c_live = true;
            let mut poll = tokio::time::interval(ABORT_POLL_INTERVAL);
            loop {
                tokio::select! {
                    result = &mut ctrl_c, if ctrl_c_live => {
                        ctrl_c_live = false;
                        if result.is_ok() {
                            tracing::warn!("interrupt received, aborting run");
                            cancel.cancel();
                            break;
                        }
                    }
                    _ = poll.tick() => {
                        if abort_file.exists() {
                            tracing::warn!(path = %abort_file.display(), "abort signal found, aborting run");
                            cancel.cancel();
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

fn spawn_stage(
    stage: Arc<dyn super::stage::Stage>,
    ctx: StageContext,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    events: Option<mpsc::Sender<RunEvent>>,
) -> JoinHandle<Result<StageOutcome, StageError>> {
    tokio::spawn(async move {
        let Ok(_permit) = semaphore.acquire_owned().await else {
            return Ok(StageOutcome::skipped("stage scheduler closed"));
        };
        if ctx.cancel.is_cancelled() {
            return Ok(StageOutcome::skipped("run aborted before stage started"));
        }
        let stage_id = ctx.stage().clone();
        tracing::info!(stage = %stage_id, phase = %ctx.phase_label, "stage started");
        if let Some(tx) = &events {
            tx.send(RunEvent::StageStarted {
                stage: stage_id,
                phase: ctx.phase_label.clone(),
            })
            .await
            .ok();
        }
        match tokio::time::timeout(timeout, stage.run(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout {
                secs: timeout.as_secs(),
            }),
        }
    })
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "stage panicked".to_string()
    }
}
