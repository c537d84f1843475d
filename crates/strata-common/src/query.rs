use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// A request for codebase facts.
///
/// At least one of the selectors must be set. `whole_codebase` asks for the
/// entire compressed digest rather than a specific target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_term: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub whole_codebase: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("query has no file_path, pattern, search_term or whole_codebase selector")]
    Empty,
    #[error("query selector '{0}' is blank")]
    Blank(&'static str),
}

impl Query {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            file_path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Default::default()
        }
    }

    pub fn search(term: impl Into<String>) -> Self {
        Self {
            search_term: Some(term.into()),
            ..Default::default()
        }
    }

    pub fn whole_codebase() -> Self {
        Self {
            whole_codebase: true,
            ..Default::default()
        }
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_search(mut self, term: impl Into<String>) -> Self {
        self.search_term = Some(term.into());
        self
    }

    /// True when no specific target is named.
    pub fn is_whole_codebase(&self) -> bool {
        self.whole_codebase
            && self.file_path.is_none()
            && self.pattern.is_none()
            && self.search_term.is_none()
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        for (name, value) in [
            ("file_path", &self.file_path),
            ("pattern", &self.pattern),
            ("search_term", &self.search_term),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(QueryError::Blank(name));
            }
        }
        if !self.whole_codebase
            && self.file_path.is_none()
            && self.pattern.is_none()
            && self.search_term.is_none()
        {
            return Err(QueryError::Empty);
        }
        Ok(())
    }

    /// Stable SHA-256 fingerprint used as the cache key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (tag, value) in [
            ("file", self.file_path.as_deref()),
            ("pattern", self.pattern.as_deref()),
            ("search", self.search_term.as_deref()),
        ] {
            hasher.update(tag.as_bytes());
            hasher.update([0u8]);
            if let Some(value) = value {
                hasher.update(value.as_bytes());
            }
            hasher.update([0xffu8]);
        }
        hasher.update([self.whole_codebase as u8]);
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(ref p) = self.file_path {
            parts.push(format!("file={p}"));
        }
        if let Some(ref p) = self.pattern {
            parts.push(format!("pattern={p}"));
        }
        if let Some(ref t) = self.search_term {
            parts.push(format!("search={t}"));
        }
        if parts.is_empty() && self.whole_codebase {
            parts.push("whole-codebase".to_string());
        }
        write!(f, "{}", parts.join(" "))
    }
}
