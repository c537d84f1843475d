use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::budget::ProjectSizeClass;
use crate::strata_config::StrataConfig;

/// Overrides supplied on the command line; these win over file and env.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub size_class: Option<ProjectSizeClass>,
    pub max_parallel: Option<usize>,
    pub codebase: Option<PathBuf>,
}

/// Runtime configuration for strata.
///
/// Bridges the layered `StrataConfig` with the absolute paths and durations
/// the resolver, budget tracker, context store and orchestrator need.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    /// `.strata/`: config file, run manifest, lock and abort signal
    pub state_dir: PathBuf,
    pub codebase_dir: PathBuf,
    pub output_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub context_dir: PathBuf,
    pub log_dir: PathBuf,
    pub manifest_file: PathBuf,
    pub abort_file: PathBuf,
    pub lock_file: PathBuf,
    pub digest_candidates: Vec<PathBuf>,
    pub size_class: Option<ProjectSizeClass>,
    pub max_parallel: usize,
    /// The layered file configuration this was derived from
    pub file: StrataConfig,
}

impl Config {
    pub fn new(project_dir: &Path, overrides: CliOverrides) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = project_dir.join(".strata");

        let mut file = StrataConfig::load_or_default(&state_dir)?;
        let applied = file.apply_env_overrides();
        if !applied.is_empty() {
            tracing::debug!(?applied, "applied environment overrides");
        }

        Ok(Self::from_parts(project_dir, file, overrides))
    }

    /// Assemble from an already-loaded file config. Paths in `file` are
    /// resolved against `project_dir`.
    pub fn from_parts(project_dir: PathBuf, file: StrataConfig, overrides: CliOverrides) -> Self {
        let state_dir = project_dir.join(".strata");
        let codebase = overrides
            .codebase
            .clone()
            .unwrap_or_else(|| file.paths.codebase.clone());
        let codebase_dir = absolutize(&project_dir, &codebase);
        let output_dir = absolutize(&project_dir, &file.paths.output);
        let digest_candidates = file
            .paths
            .digests
            .iter()
            .map(|p| absolutize(&project_dir, p))
            .collect();

        Self {
            reports_dir: output_dir.join("reports"),
            context_dir: output_dir.join("context"),
            log_dir: output_dir.join("logs"),
            manifest_file: state_dir.join("run.json"),
            abort_file: state_dir.join("abort"),
            lock_file: state_dir.join("run.lock"),
            size_class: overrides.size_class.or(file.budget.size_class),
            max_parallel: overrides
                .max_parallel
                .unwrap_or(file.orchestrator.max_parallel)
                .max(1),
            project_dir,
            state_dir,
            codebase_dir,
            output_dir,
            digest_candidates,
            file,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create .strata directory")?;
        std::fs::create_dir_all(&self.reports_dir).context("Failed to create reports directory")?;
        std::fs::create_dir_all(&self.context_dir).context("Failed to create context directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// First digest candidate that exists on disk.
    pub fn find_digest(&self) -> Option<PathBuf> {
        self.digest_candidates.iter().find(|p| p.is_file()).cloned()
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.file.orchestrator.grace_period_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.file.orchestrator.stage_timeout_secs)
    }

    pub fn cache_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.file.cache.max_age_hours as i64)
    }

    pub fn data_access_log(&self) -> PathBuf {
        self.reports_dir.join("data-access-log.jsonl")
    }

    pub fn token_usage_log(&self) -> PathBuf {
        self.reports_dir.join("token-usage-log.json")
    }
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
