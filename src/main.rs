use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use strata::budget::ProjectSizeClass;
use strata::config::{CliOverrides, Config};
use strata::logging::{self, LoggingOptions};

mod cmd;

#[derive(Parser)]
#[command(name = "strata")]
#[command(version, about = "Tiered codebase access and phased analysis runs")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a phases file
    Run {
        /// Phase definition file (JSON or YAML)
        phases_file: PathBuf,

        /// small, medium, large or enterprise; detected when omitted
        #[arg(long)]
        size_class: Option<ProjectSizeClass>,

        /// Continue the last run, skipping stages that already completed
        #[arg(long)]
        resume: bool,

        /// Maximum concurrent stages in a parallel phase
        #[arg(long)]
        max_parallel: Option<usize>,
    },
    /// Validate a phases file and print its execution order
    Plan { phases_file: PathBuf },
    /// Show the last run, its budget and context documents
    Status,
    /// Ask the running pipeline to stop
    Abort,
    /// Resolve one query through the tier chain
    Resolve {
        #[arg(long)]
        file: Option<String>,
        #[arg(long)]
        pattern: Option<String>,
        #[arg(long)]
        search: Option<String>,
        /// Ask for the whole codebase
        #[arg(long)]
        all: bool,
        /// Print only the tier line, not the content
        #[arg(long)]
        quiet: bool,
    },
    /// Print the detected project size class and budget
    Size,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default strata.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // `config` must work even when strata.toml is broken.
    if let Commands::Config { command } = &cli.command {
        let _guard = logging::init(&LoggingOptions {
            verbose: cli.verbose,
            json: cli.log_json,
            log_dir: None,
        })?;
        return cmd::cmd_config(&project_dir, command.clone());
    }

    let overrides = match &cli.command {
        Commands::Run {
            size_class,
            max_parallel,
            ..
        } => CliOverrides {
            size_class: *size_class,
            max_parallel: *max_parallel,
            codebase: None,
        },
        _ => CliOverrides::default(),
    };
    let config = Config::new(&project_dir, overrides)?;

    let log_dir = matches!(cli.command, Commands::Run { .. }).then(|| config.log_dir.clone());
    let guard = logging::init(&LoggingOptions {
        verbose: cli.verbose,
        json: cli.log_json,
        log_dir,
    })?;

    let exit_code = match &cli.command {
        Commands::Run {
            phases_file,
            resume,
            ..
        } => cmd::cmd_run(config, phases_file, *resume).await?,
        Commands::Plan { phases_file } => {
            cmd::cmd_plan(phases_file)?;
            0
        }
        Commands::Status => {
            cmd::cmd_status(&config)?;
            0
        }
        Commands::Abort => {
            cmd::cmd_abort(&config)?;
            0
        }
        Commands::Resolve {
            file,
            pattern,
            search,
            all,
            quiet,
        } => {
            let query = cmd::build_query(file.clone(), pattern.clone(), search.clone(), *all);
            cmd::cmd_resolve(&config, query, *quiet).await?;
            0
        }
        Commands::Size => {
            cmd::cmd_size(&config)?;
            0
        }
        Commands::Config { .. } => 0,
    };

    drop(guard);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
