use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ranked data sources, cheapest first.
///
/// The derived `Ord` follows declaration order and is the fallback order:
/// resolution only ever moves from a lower variant to a higher one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    /// Pre-built whole-codebase digest.
    Compressed,
    /// Semantic/symbol index service.
    Indexed,
    /// Direct filesystem scan.
    Raw,
}

impl SourceTier {
    pub const ALL: [SourceTier; 3] = [Self::Compressed, Self::Indexed, Self::Raw];

    /// Assumed cost reduction relative to a raw scan.
    pub fn savings_weight(self) -> f64 {
        match self {
            Self::Compressed => 0.8,
            Self::Indexed => 0.6,
            Self::Raw => 0.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compressed => "compressed",
            Self::Indexed => "indexed",
            Self::Raw => "raw",
        }
    }
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compressed" => Ok(Self::Compressed),
            "indexed" => Ok(Self::Indexed),
            "raw" => Ok(Self::Raw),
            other => Err(format!(
                "Invalid tier '{}'. Valid values: compressed, indexed, raw",
                other
            )),
        }
    }
}

/// Outcome of one `resolve` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult {
    /// Tier that produced `content`.
    pub tier: SourceTier,
    pub content: String,
    pub satisfied: bool,
    /// Served from the cache layer without attempting any tier.
    #[serde(default)]
    pub from_cache: bool,
}

impl ResolutionResult {
    pub fn satisfied(tier: SourceTier, content: impl Into<String>) -> Self {
        Self {
            tier,
            content: content.into(),
            satisfied: true,
            from_cache: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}
