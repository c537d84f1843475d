//! Project size classes and their default budgets.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use walkdir::WalkDir;

/// Lines assumed per source file when no digest reports a line count.
const LINES_PER_FILE_ESTIMATE: u64 = 150;

const SOURCE_EXTENSIONS: &[&str] = &[
    "java", "py", "js", "ts", "tsx", "jsx", "cs", "rs", "go", "rb", "php", "kt", "swift", "c",
    "cc", "cpp", "h", "hpp", "scala", "vb", "cbl", "cob", "sql",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectSizeClass {
    /// Under 10K lines
    Small,
    /// 10K to 100K lines
    #[default]
    Medium,
    /// 100K to 1M lines
    Large,
    /// 1M lines and up
    Enterprise,
}

impl ProjectSizeClass {
    /// Run budget in token-estimate units. Enterprise has no established
    /// figure; 600k extends the progression of the smaller classes.
    pub fn default_limit(self) -> u64 {
        match self {
            Self::Small => 175_000,
            Self::Medium => 285_000,
            Self::Large => 420_000,
            Self::Enterprise => 600_000,
        }
    }

    pub fn from_line_count(lines: u64) -> Self {
        match lines {
            0..10_000 => Self::Small,
            10_000..100_000 => Self::Medium,
            100_000..1_000_000 => Self::Large,
            _ => Self::Enterprise,
        }
    }

    /// Detect the size class from the digest's reported line count, falling
    /// back to a file-count estimate over the codebase.
    pub fn detect(digest: Option<&Path>, codebase: &Path) -> Result<SizeDetection> {
        if let Some(digest) = digest
            && let Ok(content) = std::fs::read_to_string(digest)
            && let Some(lines) = parse_total_lines(&content)
        {
            return Ok(SizeDetection {
                class: Self::from_line_count(lines),
                lines,
                source: SizeSource::Digest,
            });
        }

        let files = count_source_files(codebase);
        let lines = files * LINES_PER_FILE_ESTIMATE;
        Ok(SizeDetection {
            class: Self::from_line_count(lines),
            lines,
            source: SizeSource::FileEstimate { files },
        })
    }
}

impl std::fmt::Display for ProjectSizeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Small => write!(f, "small"),
            Self::Medium => write!(f, "medium"),
            Self::Large => write!(f, "large"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

impl std::str::FromStr for ProjectSizeClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            "enterprise" => Ok(Self::Enterprise),
            _ => anyhow::bail!(
                "Invalid size class '{}'. Valid values: small, medium, large, enterprise",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSource {
    Digest,
    FileEstimate { files: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeDetection {
    pub class: ProjectSizeClass,
    pub lines: u64,
    pub source: SizeSource,
}

/// Parse `Total lines: 12,345` from a digest header.
fn parse_total_lines(content: &str) -> Option<u64> {
    let rest = content.split("Total lines:").nth(1)?;
    let token = rest.split_whitespace().next()?;
    let digits: String = token.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn count_source_files(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        })
        .count() as u64
}
