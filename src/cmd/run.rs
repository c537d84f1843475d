//! Pipeline execution: `strata run`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use strata::config::Config;
use strata::pipeline::{Orchestrator, PhasePlan, RunEvent, RunOptions, RunReport, StageStatus};
use strata::stages::builtin_registry;
use tokio::sync::mpsc;

use super::effective_budget;

pub async fn cmd_run(config: Config, phases_file: &Path, resume: bool) -> Result<i32> {
    let plan = PhasePlan::load(phases_file)
        .with_context(|| format!("Invalid phases file {}", phases_file.display()))?;
    let budget = effective_budget(&config)?;
    let registry = builtin_registry(&plan, &config.project_dir);

    println!();
    println!("{}", style("Strata Run").bold().cyan());
    println!(
        "  {} phases, {} stages, size class {} (limit {})",
        plan.phases().len(),
        plan.stage_count(),
        budget.size_class,
        budget.limit
    );
    println!();

    let (tx, mut rx) = mpsc::channel::<RunEvent>(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let orchestrator = Orchestrator::new(config, plan, registry).with_event_channel(tx);
    let options = RunOptions {
        size_class: budget.size_class,
        limit: budget.limit,
        resume,
        phases_file: Some(phases_file.to_path_buf()),
    };
    let result = orchestrator.run(options).await;
    drop(orchestrator);
    printer.await.ok();

    let report = result.context("Run failed")?;
    print_report(&report);
    Ok(report.exit_code())
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::PhaseStarted { index, label } => {
            println!("{} {}", style(format!("Phase {}", index + 1)).bold(), label);
        }
        RunEvent::StageStarted { stage, .. } => {
            println!("  {} {}", style("→").dim(), stage);
        }
        RunEvent::StageFinished { stage, status } => {
            let (mark, detail) = match status {
                StageStatus::Done => (style("✓").green(), String::new()),
                StageStatus::Skipped { reason } => (style("-").yellow(), format!(" ({reason})")),
                StageStatus::Failed { error } => (style("✗").red(), format!(" ({error})")),
                StageStatus::Aborted => (style("✗").red(), " (aborted)".to_string()),
                StageStatus::Pending | StageStatus::Running => (style("·").dim(), String::new()),
            };
            println!("  {mark} {stage}{}", style(detail).dim());
        }
        RunEvent::Budget { signal } => {
            println!("  {} {signal}", style("budget").yellow().bold());
        }
        RunEvent::PhaseFinished { .. } | RunEvent::RunFinished { .. } => {}
    }
}

fn print_report(report: &RunReport) {
    let state = match report.exit_code() {
        0 => style(report.state.to_string()).green().bold(),
        _ => style(report.state.to_string()).red().bold(),
    };
    println!();
    println!("Run {} {}", report.run_id, state);
    println!(
        "  stages: {} done, {} skipped, {} failed, {} aborted",
        report.count("done"),
        report.count("skipped"),
        report.count("failed"),
        report.count("aborted")
    );
    println!(
        "  budget: {} of {} used, efficiency {:.1} ({})",
        report.budget.consumed,
        report.budget.limit,
        report.budget.efficiency_score,
        report.budget.rating
    );
    println!(
        "  resolutions: {} ({} from cache, {} raw)",
        report.resolver.resolutions,
        report.resolver.cache_hits,
        report.resolver.raw_accesses()
    );
    println!("  duration: {:.1}s", report.duration.as_secs_f64());
    println!();
}
