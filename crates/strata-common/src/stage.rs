use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identity of a stage within a run.
///
/// Stage ids double as file-name stems in the context store, so they are
/// restricted to ASCII alphanumerics plus `.`, `_` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StageId(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid stage id '{0}': use letters, digits, '.', '_' or '-'")]
pub struct InvalidStageId(pub String);

impl StageId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidStageId> {
        let id = id.into();
        if Self::is_valid(&id) {
            Ok(Self(id))
        } else {
            Err(InvalidStageId(id))
        }
    }

    pub fn is_valid(id: &str) -> bool {
        !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StageId {
    type Err = InvalidStageId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for StageId {
    type Error = InvalidStageId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StageId> for String {
    fn from(id: StageId) -> Self {
        id.0
    }
}

impl AsRef<str> for StageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_kebab_and_dotted_ids() {
        assert!(StageId::new("security-analyst").is_ok());
        assert!(StageId::new("phase_2.business").is_ok());
    }

    #[test]
    fn rejects_path_like_ids() {
        assert!(StageId::new("../etc").is_err());
        assert!(StageId::new("a/b").is_err());
        assert!(StageId::new("").is_err());
        assert!(StageId::new(".hidden").is_err());
    }

    #[test]
    fn deserialize_validates() {
        let ok: StageId = serde_json::from_str("\"detective\"").unwrap();
        assert_eq!(ok.as_str(), "detective");
        assert!(serde_json::from_str::<StageId>("\"bad id\"").is_err());
    }
}
