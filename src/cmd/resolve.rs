//! Ad-hoc data access: `strata resolve`, `strata size`.

use anyhow::Result;
use console::style;
use std::sync::Arc;
use strata::budget::{BudgetTracker, SizeSource};
use strata::config::Config;
use strata::resolver::SourceResolver;
use strata_common::{Query, StageId};

use super::effective_budget;

pub fn build_query(
    file: Option<String>,
    pattern: Option<String>,
    search: Option<String>,
    whole_codebase: bool,
) -> Query {
    Query {
        file_path: file,
        pattern,
        search_term: search,
        whole_codebase,
    }
}

/// Resolve one query outside any run. Usage is tallied in memory only, so
/// the run logs are left untouched.
pub async fn cmd_resolve(config: &Config, query: Query, quiet: bool) -> Result<()> {
    query.validate()?;
    let budget = effective_budget(config)?;
    let tracker = Arc::new(BudgetTracker::new(
        format!("adhoc-{}", uuid::Uuid::new_v4()),
        budget.size_class,
        budget.limit,
    ));
    let resolver = SourceResolver::from_config(config, tracker.clone());
    let stage = StageId::new("cli")?;

    let result = resolver.resolve(&stage, "adhoc", &query).await?;
    println!(
        "{} {} ({} tokens charged{})",
        style("tier:").bold(),
        result.tier,
        tracker.consumed(),
        if result.from_cache { ", cached" } else { "" }
    );
    if !quiet {
        println!();
        println!("{}", result.content);
    }
    Ok(())
}

pub fn cmd_size(config: &Config) -> Result<()> {
    let budget = effective_budget(config)?;
    println!("size class: {}", budget.size_class);
    println!("limit:      {}", budget.limit);
    match budget.detection {
        Some(detection) => {
            let source = match detection.source {
                SizeSource::Digest => "digest line count".to_string(),
                SizeSource::FileEstimate { files } => format!("estimate from {files} source files"),
            };
            println!("lines:      {} ({source})", detection.lines);
        }
        None => println!("source:     configured"),
    }
    Ok(())
}
