//! Tiered codebase data access.
//!
//! A [`SourceResolver`] answers a [`Query`] by trying its tier sources in
//! fallback order (compressed digest, then index service, then the raw
//! tree). Unavailable tiers are skipped at no cost; every attempted tier is
//! charged to the [`BudgetTracker`] before the next one is tried. Satisfied
//! results are memoized in the [`CacheLayer`].

mod cache;
mod compressed;
mod indexed;
mod raw;

pub use cache::{CacheEntry, CacheLayer, MarkerSource};
pub use compressed::{CompressedSource, extract_context, extract_file, extract_pattern};
pub use indexed::{HttpIndexService, IndexService, IndexedSource, NoIndexService};
pub use raw::RawSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use strata_common::{Query, ResolutionResult, SourceTier, StageId, estimate_tokens};

use crate::budget::{BudgetTracker, RecordOutcome};
use crate::config::Config;
use crate::errors::ResolveError;

/// Answer from one tier attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    Hit { content: String, cost: u64 },
    Miss { cost: u64 },
}

impl Probe {
    /// A hit charged for the content it returns.
    pub fn hit(content: String) -> Self {
        let cost = attempt_cost(&content);
        Self::Hit { content, cost }
    }
}

/// Token estimate of `text`, never less than one unit: an attempt always
/// costs something.
pub fn attempt_cost(text: &str) -> u64 {
    estimate_tokens(text).max(1)
}

/// One ranked data source.
///
/// `Err(ResolveError::Unavailable)` means the backing source could not be
/// reached and the tier is skipped for free. Any other error counts as an
/// attempt that found nothing.
#[async_trait]
pub trait TierSource: Send + Sync {
    fn tier(&self) -> SourceTier;

    async fn probe(&self, query: &Query) -> Result<Probe, ResolveError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverStats {
    pub resolutions: u64,
    pub cache_hits: u64,
    pub skipped_unavailable: u64,
    pub satisfied_by_tier: BTreeMap<SourceTier, u64>,
    pub attempts_by_tier: BTreeMap<SourceTier, u64>,
}

impl ResolverStats {
    pub fn raw_accesses(&self) -> u64 {
        self.attempts_by_tier
            .get(&SourceTier::Raw)
            .copied()
            .unwrap_or(0)
    }
}

pub struct SourceResolver {
    /// Higher tiers in fallback order.
    tiers: Vec<Arc<dyn TierSource>>,
    fallback: Arc<dyn TierSource>,
    cache: Option<Arc<CacheLayer>>,
    budget: Arc<BudgetTracker>,
    stats: Mutex<ResolverStats>,
    raw_alert_threshold: u64,
    raw_alert_fired: AtomicBool,
}

impl SourceResolver {
    /// `fallback` answers whatever no higher tier satisfied.
    pub fn new(fallback: Arc<dyn TierSource>, budget: Arc<BudgetTracker>) -> Self {
        Self {
            tiers: Vec::new(),
            fallback,
            cache: None,
            budget,
            stats: Mutex::new(ResolverStats::default()),
            raw_alert_threshold: u64::MAX,
            raw_alert_fired: AtomicBool::new(false),
        }
    }

    /// Add a higher tier. Tiers are kept sorted so insertion order does
    /// not matter.
    pub fn with_tier(mut self, source: Arc<dyn TierSource>) -> Self {
        self.tiers.push(source);
        self.tiers.sort_by_key(|s| s.tier());
        self
    }

    pub fn with_cache(mut self, cache: Arc<CacheLayer>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_raw_alert_threshold(mut self, threshold: u64) -> Self {
        self.raw_alert_threshold = threshold;
        self
    }

    /// Wire up the standard tiers from configuration.
    pub fn from_config(config: &Config, budget: Arc<BudgetTracker>) -> Self {
        let digest = config.find_digest();
        let compressed = CompressedSource::new(
            digest.clone(),
            config.file.compressed.context_lines,
            config.file.compressed.max_pattern_matches,
        );

        let service: Arc<dyn IndexService> = match &config.file.index.endpoint {
            Some(endpoint) => {
                let timeout = Duration::from_millis(config.file.index.timeout_ms);
                match HttpIndexService::new(endpoint, timeout) {
                    Ok(service) => Arc::new(service),
                    Err(e) => {
                        tracing::warn!(error = %e, "index client unavailable");
                        Arc::new(NoIndexService)
                    }
                }
            }
            None => Arc::new(NoIndexService),
        };

        let cache = CacheLayer::new(config.cache_max_age()).with_marker(MarkerSource {
            kind: config.file.cache.marker,
            codebase: config.codebase_dir.clone(),
            digest,
            refresh: Duration::from_secs(config.file.cache.marker_refresh_secs),
        });

        Self::new(Arc::new(RawSource::new(&config.codebase_dir)), budget)
            .with_tier(Arc::new(compressed))
            .with_tier(Arc::new(IndexedSource::new(service)))
            .with_cache(Arc::new(cache))
            .with_raw_alert_threshold(config.file.budget.raw_alert_threshold as u64)
    }

    pub fn budget(&self) -> &Arc<BudgetTracker> {
        &self.budget
    }

    pub fn stats(&self) -> ResolverStats {
        self.lock_stats().clone()
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, ResolverStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve `query` on behalf of `stage`.
    pub async fn resolve(
        &self,
        stage: &StageId,
        phase_label: &str,
        query: &Query,
    ) -> Result<ResolutionResult, ResolveError> {
        query.validate()?;
        self.lock_stats().resolutions += 1;
        let fingerprint = query.fingerprint();

        if let Some(cache) = &self.cache {
            cache.refresh_marker().await;
            if let Some(entry) = cache.get(&fingerprint) {
                tracing::debug!(%stage, %query, tier = %entry.tier, "cache hit");
                self.lock_stats().cache_hits += 1;
                self.budget.record_cache_hit();
                return Ok(ResolutionResult {
                    tier: entry.tier,
                    content: entry.content,
                    satisfied: true,
                    from_cache: true,
                });
            }
        }

        for source in &self.tiers {
            let tier = source.tier();
            match source.probe(query).await {
                Err(ResolveError::Unavailable { reason, .. }) => {
                    tracing::debug!(%stage, %tier, reason, "tier unavailable, skipped");
                    self.lock_stats().skipped_unavailable += 1;
                }
                Ok(Probe::Hit { content, cost }) => {
                    self.charge(stage, tier, cost, phase_label);
                    tracing::debug!(%stage, %query, %tier, cost, "tier satisfied query");
                    return Ok(self.satisfied(&fingerprint, tier, content));
                }
                Ok(Probe::Miss { cost }) => {
                    self.charge(stage, tier, cost, phase_label);
                    tracing::debug!(%stage, %query, %tier, cost, "tier missed");
                }
                Err(e) => {
                    self.charge(stage, tier, attempt_cost(&query.to_string()), phase_label);
                    tracing::debug!(%stage, %query, %tier, error = %e, "tier attempt failed");
                }
            }
        }

        let tier = self.fallback.tier();
        tracing::warn!(%stage, %query, "falling back to raw codebase access");
        let content = match self.fallback.probe(query).await {
            Ok(Probe::Hit { content, cost }) => {
                self.charge(stage, tier, cost, phase_label);
                content
            }
            Ok(Probe::Miss { cost }) => {
                self.charge(stage, tier, cost, phase_label);
                String::new()
            }
            Err(e) => {
                self.charge(stage, tier, attempt_cost(&query.to_string()), phase_label);
                tracing::warn!(%stage, %query, error = %e, "raw access failed, returning empty result");
                String::new()
            }
        };
        self.check_raw_alert();
        Ok(self.satisfied(&fingerprint, tier, content))
    }

    fn charge(&self, stage: &StageId, tier: SourceTier, cost: u64, phase_label: &str) {
        *self.lock_stats().attempts_by_tier.entry(tier).or_default() += 1;
        self.budget.record(stage, tier, cost.max(1), phase_label);
    }

    fn satisfied(&self, fingerprint: &str, tier: SourceTier, content: String) -> ResolutionResult {
        *self.lock_stats().satisfied_by_tier.entry(tier).or_default() += 1;
        if let Some(cache) = &self.cache {
            cache.put(fingerprint, tier, &content);
        }
        ResolutionResult::satisfied(tier, content)
    }

    fn check_raw_alert(&self) {
        let raw = self.lock_stats().raw_accesses();
        if raw > self.raw_alert_threshold && !self.raw_alert_fired.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                raw_accesses = raw,
                threshold = self.raw_alert_threshold,
                "high raw codebase access; generate the compressed digest to cut token usage"
            );
        }
    }
}

/// A resolver bound to one stage, so budget attribution is automatic.
#[derive(Clone)]
pub struct StageResolver {
    resolver: Arc<SourceResolver>,
    stage: StageId,
    phase_label: String,
}

impl StageResolver {
    pub fn new(resolver: Arc<SourceResolver>, stage: StageId, phase_label: &str) -> Self {
        Self {
            resolver,
            stage,
            phase_label: phase_label.to_string(),
        }
    }

    pub async fn resolve(&self, query: &Query) -> Result<ResolutionResult, ResolveError> {
        self.resolver
            .resolve(&self.stage, &self.phase_label, query)
            .await
    }

    /// Charge stage-side work (for example model tokens spent on resolved
    /// content) to this stage.
    pub fn record_usage(&self, tier: SourceTier, amount: u64) -> RecordOutcome {
        self.resolver
            .budget
            .record(&self.stage, tier, amount, &self.phase_label)
    }
}

#[cfg(test)]
mod tests {
    use super::indexed::tests::FakeIndex;
    use super::*;
    use crate::budget::ProjectSizeClass;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    /// Tier stub with a scripted answer and a call counter.
    struct Scripted {
        tier: SourceTier,
        answer: fn() -> Result<Probe, ResolveError>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(tier: SourceTier, answer: fn() -> Result<Probe, ResolveError>) -> Arc<Self> {
            Arc::new(Self {
                tier,
                answer,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TierSource for Scripted {
        fn tier(&self) -> SourceTier {
            self.tier
        }

        async fn probe(&self, _query: &Query) -> Result<Probe, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.answer)()
        }
    }

    fn tracker() -> Arc<BudgetTracker> {
        Arc::new(BudgetTracker::new("run", ProjectSizeClass::Small, 10_000))
    }

    fn stage() -> StageId {
        StageId::new("detective").unwrap()
    }

    #[tokio::test]
    async fn test_compressed_hit_never_consults_lower_tiers() {
        let compressed = Scripted::new(SourceTier::Compressed, || {
            Ok(Probe::Hit {
                content: "found".into(),
                cost: 7,
            })
        });
        let indexed = Scripted::new(SourceTier::Indexed, || Ok(Probe::Miss { cost: 1 }));
        let raw = Scripted::new(SourceTier::Raw, || Ok(Probe::hit(String::new())));
        let budget = tracker();
        let resolver = SourceResolver::new(raw.clone(), budget.clone())
            .with_tier(indexed.clone())
            .with_tier(compressed.clone());

        let result = resolver
            .resolve(&stage(), "discovery", &Query::search("x"))
            .await
            .unwrap();
        assert_eq!(result.tier, SourceTier::Compressed);
        assert!(result.satisfied);
        assert_eq!(indexed.calls(), 0);
        assert_eq!(raw.calls(), 0);
        assert_eq!(budget.consumed(), 7);
    }

    #[tokio::test]
    async fn test_every_attempt_is_charged_before_falling_through() {
        let compressed = Scripted::new(SourceTier::Compressed, || Ok(Probe::Miss { cost: 3 }));
        let indexed = Scripted::new(SourceTier::Indexed, || {
            Err(ResolveError::InvalidPattern {
                pattern: "[".into(),
                message: "bad".into(),
            })
        });
        let raw = Scripted::new(SourceTier::Raw, || {
            Ok(Probe::Hit {
                content: "raw".into(),
                cost: 5,
            })
        });
        let budget = tracker();
        let resolver = SourceResolver::new(raw, budget.clone())
            .with_tier(compressed)
            .with_tier(indexed);

        let result = resolver
            .resolve(&stage(), "p", &Query::pattern("*.rs"))
            .await
            .unwrap();
        assert_eq!(result.tier, SourceTier::Raw);

        let summary = budget.summary();
        assert_eq!(summary.by_tier[&SourceTier::Compressed].attempts, 1);
        assert_eq!(summary.by_tier[&SourceTier::Indexed].attempts, 1);
        assert_eq!(summary.by_tier[&SourceTier::Raw].amount, 5);
    }

    #[tokio::test]
    async fn test_no_digest_and_unreachable_index_falls_to_raw() {
        let dir = tempdir().unwrap();
        let index = FakeIndex {
            unreachable: true,
            ..Default::default()
        };
        let budget = tracker();
        let resolver = SourceResolver::new(Arc::new(RawSource::new(dir.path())), budget.clone())
            .with_tier(Arc::new(CompressedSource::new(None, 50, 100)))
            .with_tier(Arc::new(IndexedSource::new(Arc::new(index))));

        let result = resolver
            .resolve(&stage(), "p", &Query::file("config.yml"))
            .await
            .unwrap();
        assert_eq!(result.tier, SourceTier::Raw);
        assert!(result.satisfied);
        assert!(result.content.is_empty());

        let summary = budget.summary();
        assert_eq!(summary.by_tier.len(), 1);
        assert_eq!(summary.by_tier[&SourceTier::Raw].attempts, 1);
        assert_eq!(resolver.stats().skipped_unavailable, 2);
    }

    #[tokio::test]
    async fn test_digest_answers_later_file_and_misses_fall_to_raw() {
        let dir = tempdir().unwrap();
        let digest = dir.path().join("digest.md");
        std::fs::write(
            &digest,
            "## File: a.yml\n```yaml\nkey: 1\n```\n\n## File: src/App.java\n```java\nclass App {}\n```\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/Other.java"), "class Other {}").unwrap();
        let budget = tracker();
        let resolver = SourceResolver::new(Arc::new(RawSource::new(dir.path())), budget.clone())
            .with_tier(Arc::new(CompressedSource::new(Some(digest), 0, 100)));

        let found = resolver
            .resolve(&stage(), "p", &Query::file("src/App.java"))
            .await
            .unwrap();
        assert_eq!(found.tier, SourceTier::Compressed);
        assert_eq!(found.content, "class App {}\n");

        let query = Query::file("src/Other.java")
            .with_pattern("*.gradle")
            .with_search("kafka");
        let fallback = resolver.resolve(&stage(), "p", &query).await.unwrap();
        assert_eq!(fallback.tier, SourceTier::Raw);
        assert_eq!(fallback.content, "class Other {}");
        assert_eq!(budget.summary().by_tier[&SourceTier::Compressed].attempts, 2);
    }

    #[tokio::test]
    async fn test_cache_hit_is_free() {
        let raw = Scripted::new(SourceTier::Raw, || {
            Ok(Probe::Hit {
                content: "x".into(),
                cost: 4,
            })
        });
        let budget = tracker();
        let resolver = SourceResolver::new(raw.clone(), budget.clone())
            .with_cache(Arc::new(CacheLayer::new(chrono::Duration::hours(24))));

        let query = Query::search("x");
        let first = resolver.resolve(&stage(), "p", &query).await.unwrap();
        let second = resolver.resolve(&stage(), "p", &query).await.unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.content, "x");
        assert_eq!(raw.calls(), 1);
        assert_eq!(budget.consumed(), 4);
        assert_eq!(budget.summary().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_raw_failure_still_satisfies() {
        let raw = Scripted::new(SourceTier::Raw, || {
            Err(ResolveError::Io(std::io::Error::other("disk gone")))
        });
        let budget = tracker();
        let resolver = SourceResolver::new(raw, budget.clone());
        let result = resolver
            .resolve(&stage(), "p", &Query::file("a"))
            .await
            .unwrap();
        assert!(result.satisfied);
        assert!(result.content.is_empty());
        assert!(budget.consumed() >= 1);
    }

    #[tokio::test]
    async fn test_invalid_query_is_rejected_without_charge() {
        let raw = Scripted::new(SourceTier::Raw, || Ok(Probe::hit(String::new())));
        let budget = tracker();
        let resolver = SourceResolver::new(raw.clone(), budget.clone());
        let err = resolver
            .resolve(&stage(), "p", &Query::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidQuery(_)));
        assert_eq!(raw.calls(), 0);
        assert_eq!(budget.consumed(), 0);
    }

    #[tokio::test]
    async fn test_stage_resolver_attributes_usage() {
        let raw = Scripted::new(SourceTier::Raw, || {
            Ok(Probe::Hit {
                content: "x".into(),
                cost: 2,
            })
        });
        let budget = tracker();
        let resolver = Arc::new(SourceResolver::new(raw, budget.clone()));
        let handle = StageResolver::new(resolver, StageId::new("security").unwrap(), "analysis");
        handle.resolve(&Query::search("auth")).await.unwrap();

        assert_eq!(
            budget.stage_usage(&StageId::new("security").unwrap()).total,
            2
        );
    }
}
