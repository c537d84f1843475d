//! Indexed tier: an external semantic/symbol index reached over RPC.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_common::{Query, SourceTier};

use super::{Probe, TierSource, attempt_cost};
use crate::errors::ResolveError;

/// Operations an index service answers. Returning
/// `ResolveError::Unavailable` means the service cannot be used at all.
#[async_trait]
pub trait IndexService: Send + Sync {
    async fn find_symbol(&self, name: &str) -> Result<Vec<String>, ResolveError>;
    async fn search_pattern(&self, pattern: &str) -> Result<Vec<String>, ResolveError>;
    async fn list_dir(&self, path: &str) -> Result<Vec<String>, ResolveError>;
}

/// Used when no index endpoint is configured.
pub struct NoIndexService;

fn not_configured() -> ResolveError {
    ResolveError::Unavailable {
        tier: "indexed",
        reason: "no index endpoint configured".to_string(),
    }
}

#[async_trait]
impl IndexService for NoIndexService {
    async fn find_symbol(&self, _name: &str) -> Result<Vec<String>, ResolveError> {
        Err(not_configured())
    }

    async fn search_pattern(&self, _pattern: &str) -> Result<Vec<String>, ResolveError> {
        Err(not_configured())
    }

    async fn list_dir(&self, _path: &str) -> Result<Vec<String>, ResolveError> {
        Err(not_configured())
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum IndexRequest<'a> {
    Symbol { name: &'a str },
    Pattern { pattern: &'a str },
    Dir { path: &'a str },
}

#[derive(Debug, Deserialize)]
struct IndexResponse {
    #[serde(default)]
    matches: Vec<String>,
}

/// JSON-over-HTTP index client. Each operation is a POST to
/// `<endpoint>/<operation>` answering `{"matches": [...]}`.
pub struct HttpIndexService {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpIndexService {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ResolveError::Unavailable {
                tier: "indexed",
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn call(
        &self,
        operation: &str,
        body: IndexRequest<'_>,
    ) -> Result<Vec<String>, ResolveError> {
        let url = format!("{}/{operation}", self.endpoint);
        let unavailable = |reason: String| ResolveError::Unavailable {
            tier: "indexed",
            reason,
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| unavailable(format!("{url}: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(unavailable(format!("{url} returned {}", resp.status())));
        }

        let parsed: IndexResponse = resp
            .json()
            .await
            .map_err(|e| unavailable(format!("malformed response from {url}: {e}")))?;
        Ok(parsed.matches)
    }
}

#[async_trait]
impl IndexService for HttpIndexService {
    async fn find_symbol(&self, name: &str) -> Result<Vec<String>, ResolveError> {
        self.call("find_symbol", IndexRequest::Symbol { name }).await
    }

    async fn search_pattern(&self, pattern: &str) -> Result<Vec<String>, ResolveError> {
        self.call("search_pattern", IndexRequest::Pattern { pattern })
            .await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>, ResolveError> {
        self.call("list_dir", IndexRequest::Dir { path }).await
    }
}

/// Tier adapter over an [`IndexService`].
///
/// The first `Unavailable` answer disables the tier for the rest of the
/// run, so an unreachable service is only paid for once.
pub struct IndexedSource {
    service: Arc<dyn IndexService>,
    disabled: AtomicBool,
}

impl IndexedSource {
    pub fn new(service: Arc<dyn IndexService>) -> Self {
        Self {
            service,
            disabled: AtomicBool::new(false),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    async fn lookup(&self, query: &Query) -> Result<Option<String>, ResolveError> {
        if let Some(term) = &query.search_term {
            let mut found = self.service.find_symbol(term).await?;
            if found.is_empty() {
                found = self.service.search_pattern(term).await?;
            }
            if !found.is_empty() {
                return Ok(Some(found.join("\n")));
            }
        }
        if let Some(path) = &query.file_path {
            let found = self.service.list_dir(path).await?;
            if !found.is_empty() {
                return Ok(Some(found.join("\n")));
            }
        }
        if let Some(pattern) = &query.pattern {
            let found = self.service.search_pattern(pattern).await?;
            if !found.is_empty() {
                return Ok(Some(found.join("\n")));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl TierSource for IndexedSource {
    fn tier(&self) -> SourceTier {
        SourceTier::Indexed
    }

    async fn probe(&self, query: &Query) -> Result<Probe, ResolveError> {
        if self.is_disabled() {
            return Err(ResolveError::Unavailable {
                tier: "indexed",
                reason: "index service failed to activate earlier in this run".to_string(),
            });
        }
        // A whole-codebase request has no index equivalent.
        if query.is_whole_codebase() {
            return Ok(Probe::Miss {
                cost: attempt_cost(&query.to_string()),
            });
        }

        match self.lookup(query).await {
            Ok(Some(content)) => Ok(Probe::hit(content)),
            Ok(None) => Ok(Probe::Miss {
                cost: attempt_cost(&query.to_string()),
            }),
            Err(e @ ResolveError::Unavailable { .. }) => {
                if !self.disabled.swap(true, Ordering::AcqRel) {
                    tracing::warn!(error = %e, "index service unavailable, skipping tier for this run");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
