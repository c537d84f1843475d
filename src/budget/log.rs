use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use strata_common::UsageRecord;

use super::BudgetSummary;

/// On-disk reports kept by the budget tracker.
///
/// `data-access-log.jsonl` is append-only, one `UsageRecord` per line.
/// `token-usage-log.json` holds the latest `BudgetSummary` and is rewritten
/// after every accepted record.
#[derive(Debug, Clone)]
pub struct UsageLog {
    access_log: PathBuf,
    totals_file: PathBuf,
}

impl UsageLog {
    pub fn new(access_log: PathBuf, totals_file: PathBuf) -> Self {
        Self {
            access_log,
            totals_file,
        }
    }

    pub fn access_log(&self) -> &Path {
        &self.access_log
    }

    pub fn totals_file(&self) -> &Path {
        &self.totals_file
    }

    pub fn append(&self, record: &UsageRecord) -> Result<()> {
        if let Some(parent) = self.access_log.parent() {
            fs::create_dir_all(parent).context("Failed to create reports directory")?;
        }
        let mut line = serde_json::to_string(record).context("Failed to serialize usage record")?;
        line.push('\n');

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.access_log)
            .context("Failed to open data access log")?
            .write_all(line.as_bytes())
            .context("Failed to append usage record")?;
        Ok(())
    }

    pub fn write_summary(&self, summary: &BudgetSummary) -> Result<()> {
        let json =
            serde_json::to_string_pretty(summary).context("Failed to serialize budget summary")?;
        let tmp = self.totals_file.with_extension("json.tmp");
        fs::write(&tmp, json).context("Failed to write token usage log")?;
        fs::rename(&tmp, &self.totals_file).context("Failed to replace token usage log")?;
        Ok(())
    }

    pub fn load_summary(&self) -> Result<Option<BudgetSummary>> {
        if !self.totals_file.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&self.totals_file).context("Failed to read token usage log")?;
        let summary = serde_json::from_str(&content).context("Failed to parse token usage log")?;
        Ok(Some(summary))
    }

    /// Records previously logged for `run_id`, in log order. Malformed
    /// lines are skipped.
    pub fn load_records(&self, run_id: &str) -> Result<Vec<UsageRecord>> {
        if !self.access_log.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.access_log).context("Failed to open data access log")?;

        let mut records = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.context("Failed to read data access log")?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UsageRecord>(&line) {
                Ok(record) if record.run_id == run_id => records.push(record),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(line = line_no + 1, error = %e, "skipping malformed usage record")
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use strata_common::{SourceTier, StageId};
    use tempfile::tempdir;

    fn record(run: &str, amount: u64) -> UsageRecord {
        UsageRecord {
            run_id: run.to_string(),
            stage: StageId::new("detective").unwrap(),
            tier: SourceTier::Raw,
            amount,
            phase_label: "discovery".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_append_then_load_filters_by_run() {
        let dir = tempdir().unwrap();
        let log = UsageLog::new(
            dir.path().join("reports/data-access-log.jsonl"),
            dir.path().join("reports/token-usage-log.json"),
        );
        log.append(&record("a", 10)).unwrap();
        log.append(&record("b", 20)).unwrap();
        log.append(&record("a", 30)).unwrap();

        let loaded = log.load_records("a").unwrap();
        assert_eq!(loaded.iter().map(|r| r.amount).collect::<Vec<_>>(), vec![10, 30]);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let access = dir.path().join("log.jsonl");
        let log = UsageLog::new(access.clone(), dir.path().join("totals.json"));
        log.append(&record("a", 5)).unwrap();
        let mut f = OpenOptions::new().append(true).open(&access).unwrap();
        writeln!(f, "{{not json").unwrap();

        assert_eq!(log.load_records("a").unwrap().len(), 1);
    }

    #[test]
    fn test_missing_files_load_empty() {
        let dir = tempdir().unwrap();
        let log = UsageLog::new(dir.path().join("x.jsonl"), dir.path().join("y.json"));
        assert!(log.load_records("a").unwrap().is_empty());
        assert!(log.load_summary().unwrap().is_none());
    }
}
