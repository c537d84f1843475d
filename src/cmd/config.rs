//! Configuration view and validation commands: `strata config`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use strata::strata_config::{CONFIG_FILE_NAME, StrataConfig};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let strata_dir = project_dir.join(".strata");
    let config_path = strata_dir.join(CONFIG_FILE_NAME);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("Strata Configuration").bold().cyan());
            println!();

            let mut config = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                StrataConfig::load(&config_path)?
            } else {
                println!("No {CONFIG_FILE_NAME} found at {}", config_path.display());
                println!("Using default configuration.");
                StrataConfig::default()
            };

            let applied = config.apply_env_overrides();
            if !applied.is_empty() {
                println!("Environment overrides: {}", applied.join(", "));
            }
            println!();
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{rendered}");

            if !config_path.exists() {
                println!("Run 'strata config init' to create {CONFIG_FILE_NAME}.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {CONFIG_FILE_NAME} found. Using defaults (valid).");
                return Ok(());
            }

            let config = StrataConfig::load(&config_path)?;
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("{}", style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {warning}");
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{CONFIG_FILE_NAME} already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&strata_dir).context("Failed to create .strata directory")?;
            StrataConfig::default().save(&config_path)?;

            println!("Created {CONFIG_FILE_NAME} at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [paths] codebase, output, digests");
            println!("  - [budget] size_class, limit");
            println!("  - [index] endpoint for the indexed tier");
            println!("  - [orchestrator] max_parallel, grace_period_secs");
            println!();
        }
    }

    Ok(())
}
