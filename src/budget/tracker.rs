use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use strata_common::{SourceTier, StageId, UsageRecord, UsageSummary};
use tokio::sync::mpsc;

use super::{ProjectSizeClass, UsageLog};

/// Run-level thresholds as percentages of the limit, in crossing order.
const THRESHOLDS: [u64; 3] = [75, 90, 100];

/// Per-stage caution threshold as a percentage of the stage allotment.
const STAGE_CAUTION_PERCENT: u64 = 80;

/// Signals raised when consumption crosses a threshold. Each fires at most
/// once per run (per stage for `StageOverBudget`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BudgetSignal {
    /// 75% of the run limit
    Warning { consumed: u64, limit: u64 },
    /// 90% of the run limit
    Critical { consumed: u64, limit: u64 },
    /// 100% of the run limit; no new phase may start
    Exhausted { consumed: u64, limit: u64 },
    StageOverBudget {
        stage: StageId,
        consumed: u64,
        allotment: u64,
    },
}

impl BudgetSignal {
    fn for_threshold(percent: u64, consumed: u64, limit: u64) -> Self {
        match percent {
            75 => Self::Warning { consumed, limit },
            90 => Self::Critical { consumed, limit },
            _ => Self::Exhausted { consumed, limit },
        }
    }
}

impl std::fmt::Display for BudgetSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warning { consumed, limit } => write!(f, "warning: {consumed} of {limit} used"),
            Self::Critical { consumed, limit } => write!(f, "critical: {consumed} of {limit} used"),
            Self::Exhausted { consumed, limit } => {
                write!(f, "exhausted: {consumed} of {limit} used")
            }
            Self::StageOverBudget {
                stage,
                consumed,
                allotment,
            } => write!(f, "stage {stage} over its allotment: {consumed} of {allotment}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Accepted { signals: Vec<BudgetSignal> },
    Rejected { reason: String },
}

impl RecordOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    pub amount: u64,
    pub attempts: u64,
}

/// Snapshot of the ledger. Also the content of `token-usage-log.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub run_id: String,
    pub size_class: ProjectSizeClass,
    pub consumed: u64,
    pub limit: u64,
    pub remaining: u64,
    pub efficiency_score: f64,
    pub rating: String,
    pub by_tier: BTreeMap<SourceTier, TierStats>,
    pub by_stage: BTreeMap<StageId, UsageSummary>,
    #[serde(default)]
    pub cache_hits: u64,
    #[serde(default)]
    pub raw_accesses: u64,
    #[serde(default)]
    pub signals: Vec<BudgetSignal>,
    pub exhausted: bool,
    #[serde(default)]
    pub log_failures: u64,
    pub updated_at: DateTime<Utc>,
}

/// Rating label for an efficiency score. Runs that consumed nothing have
/// no meaningful score.
pub fn efficiency_rating(score: f64, total: u64) -> &'static str {
    if total == 0 {
        return "N/A";
    }
    if score >= 80.0 {
        "Excellent"
    } else if score >= 60.0 {
        "Good"
    } else if score >= 40.0 {
        "Fair"
    } else {
        "Poor"
    }
}

/// Weighted savings actually achieved over the maximum possible savings
/// (everything resolved at the compressed tier), as a percentage.
fn efficiency_score(by_tier: &BTreeMap<SourceTier, TierStats>, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let achieved: f64 = by_tier
        .iter()
        .map(|(tier, stats)| stats.amount as f64 * tier.savings_weight())
        .sum();
    let possible = total as f64 * SourceTier::Compressed.savings_weight();
    (100.0 * achieved / possible).clamp(0.0, 100.0)
}

fn percent_reached(consumed: u64, limit: u64, percent: u64) -> bool {
    consumed as u128 * 100 >= limit as u128 * percent as u128
}

#[derive(Debug, Default)]
struct Ledger {
    consumed: u64,
    by_tier: BTreeMap<SourceTier, TierStats>,
    by_stage: BTreeMap<StageId, UsageSummary>,
    fired: HashSet<u64>,
    stage_cautioned: HashSet<StageId>,
    stage_over: HashSet<StageId>,
    signals: Vec<BudgetSignal>,
    cache_hits: u64,
    log_failures: u64,
}

impl Ledger {
    fn apply(&mut self, record: &UsageRecord) {
        self.consumed = self.consumed.saturating_add(record.amount);
        let tier = self.by_tier.entry(record.tier).or_default();
        tier.amount += record.amount;
        tier.attempts += 1;
        self.by_stage
            .entry(record.stage.clone())
            .or_default()
            .add(record.tier, record.amount);
    }
}

/// Append-only usage ledger for one run.
///
/// `consumed` is only ever the sum of accepted records. All mutation goes
/// through one mutex held for the duration of a single record, so
/// concurrent stages never lose updates and each threshold is observed
/// crossing exactly once.
pub struct BudgetTracker {
    run_id: String,
    size_class: ProjectSizeClass,
    limit: u64,
    allotments: HashMap<StageId, u64>,
    log: Option<UsageLog>,
    signal_tx: Option<mpsc::UnboundedSender<BudgetSignal>>,
    ledger: Mutex<Ledger>,
}

impl BudgetTracker {
    pub fn new(run_id: impl Into<String>, size_class: ProjectSizeClass, limit: u64) -> Self {
        Self {
            run_id: run_id.into(),
            size_class,
            limit,
            allotments: HashMap::new(),
            log: None,
            signal_tx: None,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn with_log(mut self, log: UsageLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_signal_channel(mut self, tx: mpsc::UnboundedSender<BudgetSignal>) -> Self {
        self.signal_tx = Some(tx);
        self
    }

    pub fn with_allotments(mut self, allotments: HashMap<StageId, u64>) -> Self {
        self.allotments = allotments;
        self
    }

    /// Seed the ledger with records from an earlier attempt at this run.
    /// Thresholds those records already crossed are marked as fired without
    /// being re-emitted.
    pub fn with_records(self, records: &[UsageRecord]) -> Self {
        {
            let mut ledger = self.lock();
            for record in records.iter().filter(|r| r.run_id == self.run_id) {
                ledger.apply(record);
            }
            for percent in THRESHOLDS {
                if percent_reached(ledger.consumed, self.limit, percent) {
                    ledger.fired.insert(percent);
                }
            }
            let stage_totals: Vec<(StageId, u64)> = ledger
                .by_stage
                .iter()
                .map(|(stage, usage)| (stage.clone(), usage.total))
                .collect();
            for (stage, total) in stage_totals {
                let Some(&allotment) = self.allotments.get(&stage) else {
                    continue;
                };
                if percent_reached(total, allotment, STAGE_CAUTION_PERCENT) {
                    ledger.stage_cautioned.insert(stage.clone());
                }
                if percent_reached(total, allotment, 100) {
                    ledger.stage_over.insert(stage);
                }
            }
        }
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn size_class(&self) -> ProjectSizeClass {
        self.size_class
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one tier attempt. Zero amounts are rejected and leave the
    /// ledger untouched.
    pub fn record(
        &self,
        stage: &StageId,
        tier: SourceTier,
        amount: u64,
        phase_label: &str,
    ) -> RecordOutcome {
        if amount == 0 {
            let reason = format!("zero-amount record from stage {stage} at tier {tier}");
            tracing::warn!(%stage, %tier, "rejected usage record: {reason}");
            return RecordOutcome::Rejected { reason };
        }

        let record = UsageRecord {
            run_id: self.run_id.clone(),
            stage: stage.clone(),
            tier,
            amount,
            phase_label: phase_label.to_string(),
            timestamp: Utc::now(),
        };

        let mut ledger = self.lock();
        ledger.apply(&record);
        let signals = self.crossed_thresholds(&mut ledger, stage);
        ledger.signals.extend(signals.iter().cloned());

        tracing::debug!(
            %stage,
            %tier,
            amount,
            consumed = ledger.consumed,
            limit = self.limit,
            "recorded usage"
        );

        if let Some(log) = &self.log {
            let summary = self.summarize(&ledger);
            if let Err(e) = log
                .append(&record)
                .and_then(|()| log.write_summary(&summary))
            {
                ledger.log_failures += 1;
                tracing::warn!(error = %e, "failed to write budget report");
            }
        }
        drop(ledger);

        for signal in &signals {
            log_signal(signal);
            if let Some(tx) = &self.signal_tx {
                let _ = tx.send(signal.clone());
            }
        }

        RecordOutcome::Accepted { signals }
    }

    fn crossed_thresholds(&self, ledger: &mut Ledger, stage: &StageId) -> Vec<BudgetSignal> {
        let mut signals = Vec::new();
        for percent in THRESHOLDS {
            if !ledger.fired.contains(&percent)
                && percent_reached(ledger.consumed, self.limit, percent)
            {
                ledger.fired.insert(percent);
                signals.push(BudgetSignal::for_threshold(
                    percent,
                    ledger.consumed,
                    self.limit,
                ));
            }
        }

        if let Some(&allotment) = self.allotments.get(stage) {
            let used = ledger.by_stage.get(stage).map_or(0, |u| u.total);
            if percent_reached(used, allotment, STAGE_CAUTION_PERCENT)
                && ledger.stage_cautioned.insert(stage.clone())
            {
                tracing::warn!(
                    %stage,
                    used,
                    allotment,
                    "stage has used {STAGE_CAUTION_PERCENT}% of its allotment"
                );
            }
            if percent_reached(used, allotment, 100) && ledger.stage_over.insert(stage.clone()) {
                signals.push(BudgetSignal::StageOverBudget {
                    stage: stage.clone(),
                    consumed: used,
                    allotment,
                });
            }
        }
        signals
    }

    /// Count a resolution served from the cache. Cache hits cost nothing.
    pub fn record_cache_hit(&self) {
        self.lock().cache_hits += 1;
    }

    pub fn consumed(&self) -> u64 {
        self.lock().consumed
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.consumed())
    }

    pub fn is_exhausted(&self) -> bool {
        self.consumed() >= self.limit
    }

    pub fn stage_usage(&self, stage: &StageId) -> UsageSummary {
        self.lock().by_stage.get(stage).cloned().unwrap_or_default()
    }

    pub fn summary(&self) -> BudgetSummary {
        self.summarize(&self.lock())
    }

    fn summarize(&self, ledger: &Ledger) -> BudgetSummary {
        let efficiency_score = efficiency_score(&ledger.by_tier, ledger.consumed);
        BudgetSummary {
            run_id: self.run_id.clone(),
            size_class: self.size_class,
            consumed: ledger.consumed,
            limit: self.limit,
            remaining: self.limit.saturating_sub(ledger.consumed),
            efficiency_score,
            rating: efficiency_rating(efficiency_score, ledger.consumed).to_string(),
            by_tier: ledger.by_tier.clone(),
            by_stage: ledger.by_stage.clone(),
            cache_hits: ledger.cache_hits,
            raw_accesses: ledger
                .by_tier
                .get(&SourceTier::Raw)
                .map_or(0, |s| s.attempts),
            signals: ledger.signals.clone(),
            exhausted: ledger.consumed >= self.limit,
            log_failures: ledger.log_failures,
            updated_at: Utc::now(),
        }
    }
}

fn log_signal(signal: &BudgetSignal) {
    match signal {
        BudgetSignal::Warning { consumed, limit } => {
            tracing::warn!(consumed, limit, "budget warning: 75% of limit used")
        }
        BudgetSignal::Critical { consumed, limit } => {
            tracing::error!(consumed, limit, "budget critical: 90% of limit used")
        }
        BudgetSignal::Exhausted { consumed, limit } => tracing::error!(
            consumed,
            limit,
            "budget exhausted: no new phases will start"
        ),
        BudgetSignal::StageOverBudget {
            stage,
            consumed,
            allotment,
        } => tracing::warn!(%stage, consumed, allotment, "stage exceeded its allotment"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn id(s: &str) -> StageId {
        StageId::new(s).unwrap()
    }

    #[test]
    fn test_small_run_over_limit() {
        let tracker = BudgetTracker::new("run-1", ProjectSizeClass::Small, 1000);
        let stage = id("detective");
        tracker.record(&stage, SourceTier::Compressed, 200, "discovery");
        let outcome = tracker.record(&stage, SourceTier::Raw, 850, "discovery");

        let summary = tracker.summary();
        assert_eq!(summary.consumed, 1050);
        assert_eq!(summary.remaining, 0);
        assert!(summary.exhausted);
        assert!(tracker.is_exhausted());
        // 160 achieved out of 840 possible
        assert!((summary.efficiency_score - 19.047).abs() < 0.01);
        assert_eq!(summary.rating, "Poor");
        assert_eq!(summary.raw_accesses, 1);

        let RecordOutcome::Accepted { signals } = outcome else {
            panic!("record should be accepted");
        };
        assert_eq!(signals.len(), 3);
        assert!(matches!(signals[2], BudgetSignal::Exhausted { consumed: 1050, .. }));
    }

    #[test]
    fn test_consumed_is_exact_running_sum() {
        let tracker = BudgetTracker::new("r", ProjectSizeClass::Medium, 1_000_000);
        let stage = id("s");
        let mut expected = 0;
        let mut last = 0;
        for amount in [3, 1, 400, 17, 9999, 2] {
            tracker.record(&stage, SourceTier::Indexed, amount, "p");
            expected += amount;
            let consumed = tracker.consumed();
            assert!(consumed >= last);
            assert_eq!(consumed, expected);
            last = consumed;
        }
    }

    #[test]
    fn test_zero_amount_rejected() {
        let tracker = BudgetTracker::new("r", ProjectSizeClass::Small, 100);
        let outcome = tracker.record(&id("s"), SourceTier::Raw, 0, "p");
        assert!(!outcome.is_accepted());
        assert_eq!(tracker.consumed(), 0);
        assert!(tracker.summary().by_stage.is_empty());
    }

    #[test]
    fn test_thresholds_fire_once_each() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker =
            BudgetTracker::new("r", ProjectSizeClass::Small, 100).with_signal_channel(tx);
        let stage = id("s");
        for _ in 0..30 {
            tracker.record(&stage, SourceTier::Raw, 10, "p");
        }

        let mut received = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            received.push(signal);
        }
        assert_eq!(
            received,
            vec![
                BudgetSignal::Warning {
                    consumed: 80,
                    limit: 100
                },
                BudgetSignal::Critical {
                    consumed: 90,
                    limit: 100
                },
                BudgetSignal::Exhausted {
                    consumed: 100,
                    limit: 100
                },
            ]
        );
        assert_eq!(tracker.summary().signals.len(), 3);
    }

    #[test]
    fn test_stage_allotment_signal() {
        let stage = id("security");
        let tracker = BudgetTracker::new("r", ProjectSizeClass::Large, 10_000)
            .with_allotments(HashMap::from([(stage.clone(), 50)]));
        tracker.record(&stage, SourceTier::Raw, 45, "p");
        let outcome = tracker.record(&stage, SourceTier::Raw, 10, "p");
        let again = tracker.record(&stage, SourceTier::Raw, 10, "p");

        assert_eq!(
            outcome,
            RecordOutcome::Accepted {
                signals: vec![BudgetSignal::StageOverBudget {
                    stage: stage.clone(),
                    consumed: 55,
                    allotment: 50
                }]
            }
        );
        assert_eq!(again, RecordOutcome::Accepted { signals: vec![] });
    }

    #[test]
    fn test_concurrent_records_lose_nothing() {
        let tracker = Arc::new(BudgetTracker::new("r", ProjectSizeClass::Medium, 1_000_000));
        let handles: Vec<_> = [("a", 50u64), ("b", 30), ("c", 0)]
            .into_iter()
            .map(|(name, count)| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    let stage = id(name);
                    for i in 1..=count {
                        tracker.record(&stage, SourceTier::Raw, i, "parallel");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let expected: u64 = (1..=50).sum::<u64>() + (1..=30).sum::<u64>();
        let summary = tracker.summary();
        assert_eq!(summary.consumed, expected);
        assert_eq!(summary.by_tier[&SourceTier::Raw].attempts, 80);
        assert_eq!(summary.by_stage[&id("a")].records, 50);
    }

    #[test]
    fn test_seeded_records_do_not_refire() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let seed = UsageRecord {
            run_id: "r".into(),
            stage: id("s"),
            tier: SourceTier::Raw,
            amount: 80,
            phase_label: "p".into(),
            timestamp: Utc::now(),
        };
        let other_run = UsageRecord {
            run_id: "other".into(),
            ..seed.clone()
        };
        let tracker = BudgetTracker::new("r", ProjectSizeClass::Small, 100)
            .with_signal_channel(tx)
            .with_records(&[seed, other_run]);
        assert_eq!(tracker.consumed(), 80);

        tracker.record(&id("s"), SourceTier::Raw, 15, "p");
        assert_eq!(
            rx.try_recv().unwrap(),
            BudgetSignal::Critical {
                consumed: 95,
                limit: 100
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cache_hits_are_free() {
        let tracker = BudgetTracker::new("r", ProjectSizeClass::Small, 100);
        tracker.record_cache_hit();
        tracker.record_cache_hit();
        let summary = tracker.summary();
        assert_eq!(summary.cache_hits, 2);
        assert_eq!(summary.consumed, 0);
        assert_eq!(summary.rating, "N/A");
    }

    #[test]
    fn test_reports_written_after_each_record() {
        let dir = tempdir().unwrap();
        let log = UsageLog::new(
            dir.path().join("data-access-log.jsonl"),
            dir.path().join("token-usage-log.json"),
        );
        let tracker =
            BudgetTracker::new("r", ProjectSizeClass::Small, 1000).with_log(log.clone());
        tracker.record(&id("s"), SourceTier::Compressed, 40, "p");
        tracker.record(&id("s"), SourceTier::Raw, 60, "p");

        assert_eq!(log.load_records("r").unwrap().len(), 2);
        let written = log.load_summary().unwrap().unwrap();
        assert_eq!(written.consumed, 100);
        assert_eq!(tracker.summary().log_failures, 0);
    }

    #[test]
    fn test_rating_bands() {
        assert_eq!(efficiency_rating(95.0, 10), "Excellent");
        assert_eq!(efficiency_rating(60.0, 10), "Good");
        assert_eq!(efficiency_rating(45.5, 10), "Fair");
        assert_eq!(efficiency_rating(0.0, 10), "Poor");
        assert_eq!(efficiency_rating(0.0, 0), "N/A");
    }
}
