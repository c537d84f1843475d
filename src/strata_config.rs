//! Unified configuration file for strata.
//!
//! Settings are read from `.strata/strata.toml` and layered
//! file → environment → CLI. Every section is optional.
//!
//! # Configuration File Format
//!
//! ```toml
//! [paths]
//! codebase = "codebase"
//! output = "output"
//! digests = ["output/reports/repomix-summary.md"]
//!
//! [budget]
//! size_class = "medium"
//! limit = 285000
//! raw_alert_threshold = 10
//!
//! [cache]
//! max_age_hours = 24
//! marker = "tree-mtime"
//! marker_refresh_secs = 5
//!
//! [compressed]
//! context_lines = 50
//! max_pattern_matches = 100
//!
//! [index]
//! endpoint = "http://127.0.0.1:9121"
//! timeout_ms = 3000
//!
//! [orchestrator]
//! max_parallel = 4
//! grace_period_secs = 30
//! stage_timeout_secs = 1800
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::budget::ProjectSizeClass;

pub const CONFIG_FILE_NAME: &str = "strata.toml";

/// Where the pipeline reads from and writes to, relative to the project dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root scanned by the raw tier
    #[serde(default = "default_codebase")]
    pub codebase: PathBuf,
    /// Parent of `reports/`, `context/` and `logs/`
    #[serde(default = "default_output")]
    pub output: PathBuf,
    /// Candidate locations of the compressed digest, first existing wins
    #[serde(default = "default_digests")]
    pub digests: Vec<PathBuf>,
}

fn default_codebase() -> PathBuf {
    PathBuf::from("codebase")
}

fn default_output() -> PathBuf {
    PathBuf::from("output")
}

fn default_digests() -> Vec<PathBuf> {
    [
        "output/reports/repomix-summary.md",
        "output/reports/repomix-analysis.md",
        "codebase/repomix-output.md",
        "docs/repomix-summary.md",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            codebase: default_codebase(),
            output: default_output(),
            digests: default_digests(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Size class; detected from the codebase when absent
    #[serde(default)]
    pub size_class: Option<ProjectSizeClass>,
    /// Explicit run limit, overriding the size-class default
    #[serde(default)]
    pub limit: Option<u64>,
    /// Raw resolutions tolerated before recommending a digest
    #[serde(default = "default_raw_alert_threshold")]
    pub raw_alert_threshold: usize,
}

fn default_raw_alert_threshold() -> usize {
    10
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            size_class: None,
            limit: None,
            raw_alert_threshold: default_raw_alert_threshold(),
        }
    }
}

/// How the cache detects that the codebase changed under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkerKind {
    /// Newest modification time under the codebase root
    #[default]
    TreeMtime,
    /// Content hash of the compressed digest
    DigestHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
    #[serde(default)]
    pub marker: MarkerKind,
    #[serde(default = "default_marker_refresh_secs")]
    pub marker_refresh_secs: u64,
}

fn default_max_age_hours() -> u64 {
    24
}

fn default_marker_refresh_secs() -> u64 {
    5
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_hours: default_max_age_hours(),
            marker: MarkerKind::default(),
            marker_refresh_secs: default_marker_refresh_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedConfig {
    /// Lines of context kept around each search-term hit
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,
    #[serde(default = "default_max_pattern_matches")]
    pub max_pattern_matches: usize,
}

fn default_context_lines() -> usize {
    50
}

fn default_max_pattern_matches() -> usize {
    100
}

impl Default for CompressedConfig {
    fn default() -> Self {
        Self {
            context_lines: default_context_lines(),
            max_pattern_matches: default_max_pattern_matches(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Base URL of the index service; the tier is unavailable without one
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_index_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_index_timeout_ms() -> u64 {
    3000
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: default_index_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum stages running at once inside a parallel phase
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Time in-flight stages get to flush after an abort
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
}

fn default_max_parallel() -> usize {
    4
}

fn default_grace_period_secs() -> u64 {
    30
}

fn default_stage_timeout_secs() -> u64 {
    1800
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            grace_period_secs: default_grace_period_secs(),
            stage_timeout_secs: default_stage_timeout_secs(),
        }
    }
}

/// Contents of `.strata/strata.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrataConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub compressed: CompressedConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl StrataConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid strata.toml")
    }

    /// Load `strata.toml` from the state directory, or defaults if absent.
    pub fn load_or_default(strata_dir: &Path) -> Result<Self> {
        let path = strata_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Apply `STRATA_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. Returns the keys applied;
    /// unparsable values are logged and ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut applied = Vec::new();

        if let Some(raw) = lookup("STRATA_TOKEN_BUDGET") {
            match raw.trim().parse::<u64>() {
                Ok(limit) => {
                    self.budget.limit = Some(limit);
                    applied.push("STRATA_TOKEN_BUDGET".to_string());
                }
                Err(_) => tracing::warn!(value = %raw, "ignoring non-numeric STRATA_TOKEN_BUDGET"),
            }
        }
        if let Some(raw) = lookup("STRATA_SIZE_CLASS") {
            match raw.parse::<ProjectSizeClass>() {
                Ok(class) => {
                    self.budget.size_class = Some(class);
                    applied.push("STRATA_SIZE_CLASS".to_string());
                }
                Err(e) => tracing::warn!(error = %e, "ignoring STRATA_SIZE_CLASS"),
            }
        }
        if let Some(endpoint) = lookup("STRATA_INDEX_ENDPOINT") {
            self.index.endpoint = if endpoint.trim().is_empty() {
                None
            } else {
                Some(endpoint)
            };
            applied.push("STRATA_INDEX_ENDPOINT".to_string());
        }
        if let Some(dir) = lookup("STRATA_CODEBASE_DIR") {
            self.paths.codebase = PathBuf::from(dir);
            applied.push("STRATA_CODEBASE_DIR".to_string());
        }

        applied
    }

    /// Return human-readable warnings for suspicious settings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.budget.limit == Some(0) {
            warnings.push("budget.limit is 0: every phase after the first will be blocked".into());
        }
        if self.paths.digests.is_empty() {
            warnings.push("paths.digests is empty: the compressed tier will never be used".into());
        }
        if self.orchestrator.max_parallel == 0 {
            warnings.push("orchestrator.max_parallel is 0: treated as 1".into());
        }
        if self.cache.max_age_hours == 0 {
            warnings.push("cache.max_age_hours is 0: every cache entry is immediately stale".into());
        }
        if self.budget.raw_alert_threshold == 0 {
            warnings.push("budget.raw_alert_threshold is 0: the first raw access will alert".into());
        }
        if let Some(ref endpoint) = self.index.endpoint
            && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            warnings.push(format!("index.endpoint '{}' is not an http(s) URL", endpoint));
        }

        warnings
    }
}
