//! Run inspection and control: `strata status`, `strata abort`.

use anyhow::{Context, Result};
use console::style;
use strata::budget::UsageLog;
use strata::config::Config;
use strata::context::ContextStore;
use strata::pipeline::RunManifest;

pub fn cmd_status(config: &Config) -> Result<()> {
    let Some(manifest) = RunManifest::load(&config.manifest_file)? else {
        println!("No run recorded in this workspace.");
        return Ok(());
    };

    println!();
    println!("{}", style("Strata Run Status").bold().cyan());
    println!("  run:        {}", manifest.run_id);
    println!("  state:      {}", manifest.state);
    println!("  size class: {} (limit {})", manifest.size_class, manifest.limit);
    if let Some(ref file) = manifest.phases_file {
        println!("  phases:     {}", file.display());
    }
    println!("  updated:    {}", manifest.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if config.abort_file.exists() {
        println!("  {}", style("abort requested").yellow());
    }

    println!();
    println!("{}", style("Stages").bold());
    for (stage, status) in &manifest.stages {
        println!("  {:<28} {}", stage.as_str(), status.label());
    }

    let log = UsageLog::new(config.data_access_log(), config.token_usage_log());
    if let Some(summary) = log.load_summary()?
        && summary.run_id == manifest.run_id
    {
        println!();
        println!("{}", style("Budget").bold());
        println!(
            "  {} of {} used ({} remaining), efficiency {:.1} ({})",
            summary.consumed,
            summary.limit,
            summary.remaining,
            summary.efficiency_score,
            summary.rating
        );
        for (tier, stats) in &summary.by_tier {
            println!(
                "  {:<12} {:>8} over {} attempts",
                tier.as_str(),
                stats.amount,
                stats.attempts
            );
        }
        println!("  cache hits: {}", summary.cache_hits);
    }

    if config.context_dir.is_dir() {
        let store = ContextStore::open(&config.context_dir, &manifest.run_id)?;
        let docs = store.read_all()?;
        if !docs.is_empty() {
            println!();
            println!("{}", style("Context documents").bold());
            for (stage, doc) in &docs {
                println!(
                    "  {:<28} {:?}, {} findings, {} warnings",
                    stage.as_str(),
                    doc.outcome,
                    doc.summary.key_findings.len(),
                    doc.summary.warnings.len()
                );
            }
        }
    }
    println!();
    Ok(())
}

/// Write the abort signal file polled by a running pipeline.
pub fn cmd_abort(config: &Config) -> Result<()> {
    std::fs::create_dir_all(&config.state_dir).context("Failed to create .strata directory")?;
    let active = RunManifest::load(&config.manifest_file)?.is_some_and(|m| !m.state.is_terminal());
    std::fs::write(&config.abort_file, chrono::Utc::now().to_rfc3339())
        .context("Failed to write abort signal")?;

    println!("{}", style("Abort signal sent.").yellow());
    if !active {
        println!("No run appears to be active; the signal is cleared when the next run starts.");
    }
    Ok(())
}
