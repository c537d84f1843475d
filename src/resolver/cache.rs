use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use strata_common::SourceTier;
use walkdir::WalkDir;

use crate::strata_config::MarkerKind;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub tier: SourceTier,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Where the cache looks to decide whether the codebase moved on.
#[derive(Debug, Clone)]
pub struct MarkerSource {
    pub kind: MarkerKind,
    pub codebase: PathBuf,
    pub digest: Option<PathBuf>,
    pub refresh: Duration,
}

#[derive(Debug, Default)]
struct MarkerState {
    checked_at: Option<Instant>,
    digest_hash: Option<String>,
    /// Entries created before this instant are stale.
    changed_at: Option<DateTime<Utc>>,
}

/// Memoized resolution results, shared by every stage of a run.
///
/// At most one entry lives per fingerprint. Concurrent `put`s for the same
/// fingerprint are last-writer-wins; `get` never returns an entry older
/// than `max_age` or older than the last observed codebase change.
pub struct CacheLayer {
    entries: DashMap<String, CacheEntry>,
    max_age: chrono::Duration,
    marker: Option<MarkerSource>,
    marker_state: Mutex<MarkerState>,
}

impl CacheLayer {
    pub fn new(max_age: chrono::Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_age,
            marker: None,
            marker_state: Mutex::new(MarkerState::default()),
        }
    }

    pub fn with_marker(mut self, marker: MarkerSource) -> Self {
        self.marker = Some(marker);
        self
    }

    pub fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        self.get_at(fingerprint, Utc::now())
    }

    /// Look up `fingerprint` as of `now`. Stale entries are evicted and
    /// reported as a miss.
    pub fn get_at(&self, fingerprint: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let changed_at = self.changed_at();
        let entry = self.entries.get(fingerprint)?;
        let expired = now - entry.created_at > self.max_age;
        let outdated = changed_at.is_some_and(|changed| entry.created_at < changed);
        if expired || outdated {
            drop(entry);
            self.entries.remove(fingerprint);
            tracing::debug!(fingerprint, expired, outdated, "cache entry stale");
            return None;
        }
        Some(entry.clone())
    }

    pub fn put(&self, fingerprint: &str, tier: SourceTier, content: &str) {
        self.put_at(fingerprint, tier, content, Utc::now());
    }

    pub fn put_at(
        &self,
        fingerprint: &str,
        tier: SourceTier,
        content: &str,
        created_at: DateTime<Utc>,
    ) {
        self.entries.insert(
            fingerprint.to_string(),
            CacheEntry {
                fingerprint: fingerprint.to_string(),
                tier,
                content: content.to_string(),
                created_at,
            },
        );
    }

    pub fn invalidate(&self, fingerprint: &str) -> bool {
        self.entries.remove(fingerprint).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn changed_at(&self) -> Option<DateTime<Utc>> {
        self.marker_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .changed_at
    }

    /// Re-read the modification marker if the refresh interval has passed.
    /// The scan runs on the blocking pool.
    pub async fn refresh_marker(&self) {
        let Some(marker) = self.marker.clone() else {
            return;
        };
        {
            let state = self
                .marker_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state
                .checked_at
                .is_some_and(|at| at.elapsed() < marker.refresh)
            {
                return;
            }
        }

        let kind = marker.kind;
        let observed = tokio::task::spawn_blocking(move || match kind {
            MarkerKind::TreeMtime => Observation::Mtime(newest_mtime(
                &marker.codebase,
                marker.digest.as_deref(),
            )),
            MarkerKind::DigestHash => {
                Observation::Hash(marker.digest.as_deref().and_then(hash_file))
            }
        })
        .await;

        let observed = match observed {
            Ok(observed) => observed,
            Err(e) => {
                tracing::warn!(error = %e, "modification marker scan failed");
                return;
            }
        };

        let mut state = self
            .marker_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.checked_at = Some(Instant::now());
        match observed {
            Observation::Mtime(mtime) => {
                if mtime > state.changed_at {
                    state.changed_at = mtime;
                }
            }
            Observation::Hash(hash) => {
                if state.digest_hash.is_some() && hash != state.digest_hash {
                    tracing::debug!("compressed digest changed, invalidating cached results");
                    state.changed_at = Some(Utc::now());
                }
                state.digest_hash = hash;
            }
        }
    }
}

enum Observation {
    Mtime(Option<DateTime<Utc>>),
    Hash(Option<String>),
}

fn newest_mtime(codebase: &Path, digest: Option<&Path>) -> Option<DateTime<Utc>> {
    let tree = WalkDir::new(codebase)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .filter_map(|meta| meta.modified().ok());
    let digest = digest
        .and_then(|p| std::fs::metadata(p).ok())
        .and_then(|meta| meta.modified().ok());
    tree.chain(digest)
        .max()
        .map(|t: SystemTime| DateTime::<Utc>::from(t))
}

fn hash_file(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    Some(hex::encode(Sha256::digest(&bytes)))
}
