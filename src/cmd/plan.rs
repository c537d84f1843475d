//! Phases file validation: `strata plan`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use strata::pipeline::PhasePlan;

pub fn cmd_plan(phases_file: &Path) -> Result<()> {
    let plan = PhasePlan::load(phases_file)
        .with_context(|| format!("Invalid phases file {}", phases_file.display()))?;

    println!();
    println!("{}", style("Execution order").bold().cyan());
    for (index, phase) in plan.phases().iter().enumerate() {
        let mode = if phase.parallel { "parallel" } else { "sequential" };
        print!("  {}. {} ({mode})", index + 1, style(&phase.label).bold());
        if !phase.depends_on.is_empty() {
            print!(" after {}", phase.depends_on.join(", "));
        }
        println!();
        for stage in &phase.stages {
            let kind = if stage.command.is_some() { "command" } else { "survey" };
            let mut line = format!("     - {} [{kind}]", stage.id);
            if let Some(budget) = stage.budget {
                line.push_str(&format!(" budget {budget}"));
            }
            if !stage.forward_to.is_empty() {
                let targets: Vec<&str> = stage.forward_to.iter().map(|s| s.as_str()).collect();
                line.push_str(&format!(" -> {}", targets.join(", ")));
            }
            println!("{line}");
        }
    }

    println!();
    println!("{}", style("Waves").bold().cyan());
    for (i, wave) in plan.waves().iter().enumerate() {
        println!("  {}: {}", i + 1, wave.join(", "));
    }
    println!();
    println!(
        "Plan is valid: {} phases, {} stages.",
        plan.phases().len(),
        plan.stage_count()
    );
    Ok(())
}
