use crate::{SourceTier, StageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One resource-consuming tier attempt. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub run_id: String,
    pub stage: StageId,
    pub tier: SourceTier,
    pub amount: u64,
    pub phase_label: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-stage roll-up of usage records, embedded in context documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total: u64,
    pub records: usize,
    #[serde(default)]
    pub by_tier: BTreeMap<SourceTier, u64>,
}

impl UsageSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a UsageRecord>) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.add(record.tier, record.amount);
        }
        summary
    }

    pub fn add(&mut self, tier: SourceTier, amount: u64) {
        self.total += amount;
        self.records += 1;
        *self.by_tier.entry(tier).or_default() += amount;
    }
}
