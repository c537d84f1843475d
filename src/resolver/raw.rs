//! Raw tier: direct reads and scans of the codebase tree.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use strata_common::{Query, SourceTier};
use walkdir::WalkDir;

use super::{Probe, TierSource};
use crate::errors::ResolveError;

/// Resolver of last resort. Always answers, possibly with empty content.
pub struct RawSource {
    root: PathBuf,
}

impl RawSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl TierSource for RawSource {
    fn tier(&self) -> SourceTier {
        SourceTier::Raw
    }

    async fn probe(&self, query: &Query) -> Result<Probe, ResolveError> {
        let root = self.root.clone();
        let query = query.clone();
        let content = tokio::task::spawn_blocking(move || scan(&root, &query))
            .await
            .map_err(|e| ResolveError::Io(std::io::Error::other(e)))??;
        Ok(Probe::hit(content))
    }
}

/// Evaluate every selector and concatenate the non-empty answers in
/// file, pattern, search order.
fn scan(root: &Path, query: &Query) -> Result<String, ResolveError> {
    let mut parts = Vec::new();

    if let Some(path) = &query.file_path {
        parts.push(read_file(root, path));
    }
    if let Some(pattern) = &query.pattern {
        parts.push(glob_files(root, pattern)?.join("\n"));
    }
    if let Some(term) = &query.search_term {
        parts.push(grep_files(root, term).join("\n"));
    }
    if query.is_whole_codebase() {
        parts.push(list_all(root).join("\n"));
    }

    parts.retain(|p| !p.is_empty());
    Ok(parts.join("\n"))
}

/// Contents of `root/path`; empty when missing, unreadable, or outside
/// the tree.
fn read_file(root: &Path, path: &str) -> String {
    let relative = Path::new(path);
    let escapes = relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes {
        tracing::warn!(path, "raw read outside codebase root refused");
        return String::new();
    }
    std::fs::read_to_string(root.join(relative)).unwrap_or_default()
}

fn glob_files(root: &Path, pattern: &str) -> Result<Vec<String>, ResolveError> {
    let full = root.join("**").join(pattern);
    let full = full.to_string_lossy();
    let paths = glob::glob(&full).map_err(|e| ResolveError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;

    let mut found: Vec<String> = paths
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .filter_map(|p| relative(root, &p))
        .collect();
    found.sort();
    Ok(found)
}

/// Relative paths of UTF-8 files containing `term`, case-insensitively.
fn grep_files(root: &Path, term: &str) -> Vec<String> {
    let needle = term.to_lowercase();
    let mut found: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            std::fs::read_to_string(e.path())
                .is_ok_and(|content| content.to_lowercase().contains(&needle))
        })
        .filter_map(|e| relative(root, e.path()))
        .collect();
    found.sort();
    found
}

fn list_all(root: &Path) -> Vec<String> {
    let mut found: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| relative(root, e.path()))
        .collect();
    found.sort();
    found
}

fn relative(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn tree() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/main/java")).unwrap();
        fs::write(
            dir.path().join("src/main/java/App.java"),
            "@SpringBootApplication\nclass App {}",
        )
        .unwrap();
        fs::write(dir.path().join("src/main/java/Util.java"), "class Util {}").unwrap();
        fs::write(dir.path().join("config.yml"), "port: 8080").unwrap();
        fs::write(dir.path().join("blob.bin"), [0xff, 0xfe, 0x00]).unwrap();
        dir
    }

    #[test]
    fn test_read_file_and_missing() {
        let dir = tree();
        assert_eq!(read_file(dir.path(), "config.yml"), "port: 8080");
        assert_eq!(read_file(dir.path(), "nope.yml"), "");
        assert_eq!(read_file(dir.path(), "../etc/passwd"), "");
    }

    #[test]
    fn test_glob_is_recursive() {
        let dir = tree();
        let found = glob_files(dir.path(), "*.java").unwrap();
        assert_eq!(
            found,
            vec!["src/main/java/App.java", "src/main/java/Util.java"]
        );
    }

    #[test]
    fn test_grep_skips_non_utf8() {
        let dir = tree();
        assert_eq!(
            grep_files(dir.path(), "springbootapplication"),
            vec!["src/main/java/App.java"]
        );
        assert!(grep_files(dir.path(), "kafka").is_empty());
    }

    #[tokio::test]
    async fn test_multiple_selectors_concatenate() {
        let dir = tree();
        let source = RawSource::new(dir.path());
        let query = Query::file("config.yml").with_search("class Util");
        let Probe::Hit { content, .. } = source.probe(&query).await.unwrap() else {
            panic!("raw always hits");
        };
        assert_eq!(content, "port: 8080\nsrc/main/java/Util.java");
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_hit() {
        let dir = tree();
        let source = RawSource::new(dir.path());
        let probe = source.probe(&Query::file("absent.yml")).await.unwrap();
        assert!(matches!(probe, Probe::Hit { ref content, cost: 1 } if content.is_empty()));
    }
}
