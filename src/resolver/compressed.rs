//! Compressed tier: lookups against a pre-built whole-codebase digest.

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use std::path::PathBuf;
use std::sync::Arc;
use strata_common::{Query, SourceTier};
use tokio::sync::OnceCell;

use super::{Probe, TierSource, attempt_cost};
use crate::errors::ResolveError;

pub struct CompressedSource {
    digest: Option<PathBuf>,
    context_lines: usize,
    max_pattern_matches: usize,
    content: OnceCell<Option<Arc<str>>>,
}

impl CompressedSource {
    pub fn new(digest: Option<PathBuf>, context_lines: usize, max_pattern_matches: usize) -> Self {
        Self {
            digest,
            context_lines,
            max_pattern_matches,
            content: OnceCell::new(),
        }
    }

    /// Read the digest once per run. A missing or unreadable digest makes
    /// the tier unavailable.
    async fn load(&self) -> Option<Arc<str>> {
        self.content
            .get_or_init(|| async {
                let path = self.digest.as_ref()?;
                match tokio::fs::read_to_string(path).await {
                    Ok(content) => {
                        tracing::info!(digest = %path.display(), "using compressed digest");
                        Some(Arc::from(content))
                    }
                    Err(e) => {
                        tracing::warn!(digest = %path.display(), error = %e, "compressed digest unreadable");
                        None
                    }
                }
            })
            .await
            .clone()
    }
}

#[async_trait]
impl TierSource for CompressedSource {
    fn tier(&self) -> SourceTier {
        SourceTier::Compressed
    }

    async fn probe(&self, query: &Query) -> Result<Probe, ResolveError> {
        let Some(content) = self.load().await else {
            return Err(ResolveError::Unavailable {
                tier: "compressed",
                reason: "no compressed digest found".to_string(),
            });
        };

        if query.is_whole_codebase() {
            return Ok(Probe::hit(content.to_string()));
        }

        if let Some(term) = &query.search_term
            && let Some(found) = extract_context(&content, term, self.context_lines)
        {
            return Ok(Probe::hit(found));
        }
        if let Some(path) = &query.file_path
            && let Some(found) = extract_file(&content, path)?
        {
            return Ok(Probe::hit(found));
        }
        if let Some(pattern) = &query.pattern
            && let Some(found) = extract_pattern(&content, pattern, self.max_pattern_matches)?
        {
            return Ok(Probe::hit(found));
        }

        Ok(Probe::Miss {
            cost: attempt_cost(&query.to_string()),
        })
    }
}

/// Lines around each case-insensitive occurrence of `term`, one block per
/// hit, blocks terminated by `---`.
pub fn extract_context(content: &str, term: &str, context_lines: usize) -> Option<String> {
    let needle = term.to_lowercase();
    let lines: Vec<&str> = content.lines().collect();
    let mut blocks = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        if line.to_lowercase().contains(&needle) {
            let start = i.saturating_sub(context_lines);
            let end = (i + context_lines + 1).min(lines.len());
            blocks.extend_from_slice(&lines[start..end]);
            blocks.push("---");
        }
    }

    (!blocks.is_empty()).then(|| blocks.join("\n"))
}

/// Body of the fenced block that belongs to `path`: either the opening fence
/// line names the path, or a heading line naming it sits directly above the
/// fence. Empty bodies do not count as found.
pub fn extract_file(content: &str, path: &str) -> Result<Option<String>, ResolveError> {
    let escaped = regex::escape(path);
    let in_header = build(
        &format!(r"(?m)^```[^\n`]*{escaped}[^\n]*\n(.*?)^```"),
        path,
    )?;
    let before_fence = build(
        &format!(r"(?m)^#+[^\n]*[ \t/:]{escaped}[ \t]*\n(?:[ \t]*\n)*```[^\n]*\n(.*?)^```"),
        path,
    )?;

    Ok([in_header, before_fence].iter().find_map(|re| {
        re.captures_iter(content)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .find(|body| !body.trim().is_empty())
            .map(str::to_string)
    }))
}

/// Digest lines matching a glob-style `pattern`, at most `max_matches`.
pub fn extract_pattern(
    content: &str,
    pattern: &str,
    max_matches: usize,
) -> Result<Option<String>, ResolveError> {
    let re = glob_regex(pattern)?;
    let matches: Vec<&str> = content
        .lines()
        .filter(|line| re.is_match(line))
        .take(max_matches)
        .collect();
    Ok((!matches.is_empty()).then(|| matches.join("\n")))
}

/// `*` matches any run of characters, `?` exactly one; everything else is
/// literal.
pub fn glob_regex(pattern: &str) -> Result<Regex, ResolveError> {
    let mut source = String::with_capacity(pattern.len() * 2);
    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            _ => source.push_str(&regex::escape(&c.to_string())),
        }
    }
    RegexBuilder::new(&source)
        .case_insensitive(true)
        .build()
        .map_err(|e| ResolveError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

fn build(source: &str, original: &str) -> Result<Regex, ResolveError> {
    RegexBuilder::new(source)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| ResolveError::InvalidPattern {
            pattern: original.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DIGEST: &str = "\
# Repository digest
Total lines: 1200

## File: src/main/resources/config.yml
```yaml
server:
  port: 8080
```

## File: src/main/java/App.java
```java
@SpringBootApplication
public class App {}
```
";

    #[test]
    fn test_context_blocks() {
        let content = "a\nb\nneedle here\nc\nd\nNEEDLE again";
        let found = extract_context(content, "Needle", 1).unwrap();
        assert_eq!(found, "b\nneedle here\nc\n---\nd\nNEEDLE again\n---");
        assert!(extract_context(content, "absent", 1).is_none());
    }

    #[test]
    fn test_extract_file_by_preceding_header() {
        let body = extract_file(DIGEST, "config.yml").unwrap().unwrap();
        assert!(body.contains("port: 8080"));
        assert!(!body.contains("SpringBootApplication"));
        assert!(extract_file(DIGEST, "missing.txt").unwrap().is_none());
    }

    #[test]
    fn test_extract_file_after_the_first_block() {
        let body = extract_file(DIGEST, "src/main/java/App.java")
            .unwrap()
            .unwrap();
        assert!(body.contains("SpringBootApplication"));
        assert!(!body.contains("port: 8080"));

        let body = extract_file(DIGEST, "App.java").unwrap().unwrap();
        assert!(body.starts_with("@SpringBootApplication"));
    }

    #[test]
    fn test_empty_block_is_not_found() {
        let digest = "## File: empty.txt\n```\n```\n";
        assert!(extract_file(digest, "empty.txt").unwrap().is_none());
    }

    #[test]
    fn test_path_in_a_body_line_is_not_a_header() {
        let digest = "## File: a.md\n```\nsee notes.txt\n```\n```\nunrelated\n```\n";
        assert!(extract_file(digest, "notes.txt").unwrap().is_none());
    }

    #[test]
    fn test_extract_file_by_fence_header() {
        let digest = "```src/lib.rs\nfn main() {}\n```\n";
        assert_eq!(
            extract_file(digest, "src/lib.rs").unwrap().unwrap(),
            "fn main() {}\n"
        );
    }

    #[test]
    fn test_pattern_is_glob_not_regex() {
        let found = extract_pattern(DIGEST, "*.java", 100).unwrap().unwrap();
        assert_eq!(found, "## File: src/main/java/App.java");
        // the dot is literal
        assert!(extract_pattern("Appxjava", "*.java", 100).unwrap().is_none());
    }

    #[test]
    fn test_pattern_match_cap() {
        let content = (0..10).map(|i| format!("f{i}.rs")).collect::<Vec<_>>().join("\n");
        let found = extract_pattern(&content, "*.rs", 3).unwrap().unwrap();
        assert_eq!(found.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_missing_digest_is_unavailable() {
        let source = CompressedSource::new(None, 50, 100);
        let err = source.probe(&Query::search("x")).await.unwrap_err();
        assert!(matches!(err, ResolveError::Unavailable { .. }));

        let dir = tempdir().unwrap();
        let source = CompressedSource::new(Some(dir.path().join("nope.md")), 50, 100);
        assert!(source.probe(&Query::search("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_field_order_and_miss() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("digest.md");
        std::fs::write(&path, DIGEST).unwrap();
        let source = CompressedSource::new(Some(path), 0, 100);

        // the search term misses, so the file path answers
        let query = Query::search("kafka").with_file("config.yml");
        let Probe::Hit { content, cost } = source.probe(&query).await.unwrap() else {
            panic!("expected hit");
        };
        assert!(content.contains("port: 8080"));
        assert!(cost >= 1);

        let miss = source.probe(&Query::search("kafka")).await.unwrap();
        assert!(matches!(miss, Probe::Miss { cost } if cost >= 1));

        // every field misses, so the tier does not answer
        let query = Query::search("kafka")
            .with_file("src/Missing.java")
            .with_pattern("*.gradle");
        assert!(matches!(
            source.probe(&query).await.unwrap(),
            Probe::Miss { .. }
        ));

        let whole = source.probe(&Query::whole_codebase()).await.unwrap();
        assert!(matches!(whole, Probe::Hit { ref content, .. } if content == DIGEST));
    }
}
