//! Knowledge routing and caching
//!
//! Given a free-text query, the router decides which source can best answer
//! it, queries that source (falling back to the other when the primary
//! yields nothing), ranks the snippets, and caches the unified result keyed
//! by `(scope, normalized query)`. Knowledge lookups dominate the latency of
//! a generation step, so repeated queries across retries and tournament
//! branches must become memory hits.

pub mod cache;
pub mod source;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use conductor_sdk::{KnowledgeSource, OrchestratorError, QueryResult, Result, Snippet};

use crate::batch::execute_bounded;
use self::cache::TtlCache;

/// Which source family a query belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryRoute {
    /// Plain lookups answered by the local index.
    Factual,
    /// Evaluative or causal questions routed to the research service.
    Analytical,
}

/// Replaceable classification policy. The default keyword heuristic is a
/// starting point, not a contract; swap in something smarter behind this
/// trait without touching the router.
pub trait QueryClassifier: Send + Sync {
    fn classify(&self, query: &str) -> QueryRoute;
}

/// Classifies a query as analytical when it carries evaluative or causal
/// language, factual otherwise.
pub struct KeywordClassifier {
    markers: Vec<&'static str>,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self {
            markers: vec![
                "why", "because", "compare", "versus", "vs", "better", "worse", "should",
                "evaluate", "analyze", "analyse", "impact", "cause", "effect", "tradeoff",
                "trade-off", "implication", "recommend",
            ],
        }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClassifier for KeywordClassifier {
    fn classify(&self, query: &str) -> QueryRoute {
        let lower = query.to_lowercase();
        let analytical = lower
            .split(|c: char| !c.is_alphanumeric() && c != '-')
            .any(|word| self.markers.contains(&word));
        if analytical {
            QueryRoute::Analytical
        } else {
            QueryRoute::Factual
        }
    }
}

/// Router tunables.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Keep the top K snippets by relevance.
    pub top_k: usize,
    /// How long a cached result stays valid.
    pub cache_ttl: Duration,
    /// Concurrency bound for batch queries.
    pub batch_concurrency: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            cache_ttl: Duration::from_secs(600),
            batch_concurrency: 4,
        }
    }
}

/// Routes queries to the factual or analytical source, merging and caching
/// results.
pub struct KnowledgeRouter {
    factual: Arc<dyn KnowledgeSource>,
    analytical: Arc<dyn KnowledgeSource>,
    classifier: Arc<dyn QueryClassifier>,
    cache: Arc<TtlCache<QueryResult>>,
    config: RouterConfig,
}

impl KnowledgeRouter {
    pub fn new(
        factual: Arc<dyn KnowledgeSource>,
        analytical: Arc<dyn KnowledgeSource>,
        config: RouterConfig,
    ) -> Self {
        Self {
            factual,
            analytical,
            classifier: Arc::new(KeywordClassifier::new()),
            cache: Arc::new(TtlCache::new()),
            config,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn QueryClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// The shared cache, for wiring a background sweeper.
    pub fn cache(&self) -> Arc<TtlCache<QueryResult>> {
        self.cache.clone()
    }

    fn cache_key(scope: &str, query: &str) -> String {
        format!("{scope}\u{1f}{}", normalize_query(query))
    }

    /// Answer a query, consulting the cache first. On a miss the query is
    /// classified, the primary source is searched, and the secondary source
    /// serves as fallback when the primary fails or returns nothing usable.
    pub async fn query(
        &self,
        query: &str,
        scope: &str,
        cancel: &CancellationToken,
    ) -> Result<QueryResult> {
        let key = Self::cache_key(scope, query);
        if let Some(mut hit) = self.cache.get(&key) {
            hit.from_cache = true;
            debug!(scope, query, "knowledge cache hit");
            return Ok(hit);
        }

        let route = self.classifier.classify(query);
        let (primary, secondary) = match route {
            QueryRoute::Factual => (&self.factual, &self.analytical),
            QueryRoute::Analytical => (&self.analytical, &self.factual),
        };

        let snippets = match primary.search(query, self.config.top_k, cancel).await {
            Ok(snippets) if !snippets.is_empty() => snippets,
            Ok(_) => {
                debug!(origin = primary.origin(), "primary source empty, falling back");
                self.fallback(secondary.as_ref(), query, cancel, None).await?
            }
            Err(OrchestratorError::Cancelled) => return Err(OrchestratorError::Cancelled),
            Err(primary_err) => {
                warn!(
                    origin = primary.origin(),
                    error = %primary_err,
                    "primary source failed, falling back"
                );
                self.fallback(secondary.as_ref(), query, cancel, Some(primary_err))
                    .await?
            }
        };

        let result = QueryResult {
            answer: compose_answer(&snippets),
            snippets,
            from_cache: false,
        };
        self.cache.set(key, result.clone(), self.config.cache_ttl);
        Ok(result)
    }

    async fn fallback(
        &self,
        secondary: &dyn KnowledgeSource,
        query: &str,
        cancel: &CancellationToken,
        primary_err: Option<OrchestratorError>,
    ) -> Result<Vec<Snippet>> {
        match secondary.search(query, self.config.top_k, cancel).await {
            Ok(snippets) if !snippets.is_empty() => Ok(snippets),
            Ok(_) => Err(OrchestratorError::KnowledgeUnavailable(format!(
                "no source returned a usable result for '{}'",
                normalize_query(query)
            ))),
            Err(OrchestratorError::Cancelled) => Err(OrchestratorError::Cancelled),
            Err(secondary_err) => Err(OrchestratorError::KnowledgeUnavailable(match primary_err {
                Some(p) => format!("primary: {p}; secondary: {secondary_err}"),
                None => secondary_err.to_string(),
            })),
        }
    }

    /// Execute independent queries concurrently (bounded), preserving input
    /// order. Fails on the first query whose sources are both unavailable.
    pub async fn batch_query(
        &self,
        queries: Vec<String>,
        scope: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueryResult>> {
        let router = self.clone_shared();
        let scope = scope.to_string();
        let cancel = cancel.clone();

        let results = execute_bounded(
            queries,
            self.config.batch_concurrency,
            move |_, query| {
                let router = router.clone();
                let scope = scope.clone();
                let cancel = cancel.clone();
                async move { router.query(&query, &scope, &cancel).await }
            },
        )
        .await;

        results.into_iter().collect()
    }

    // The router itself is cheap to clone through its Arcs; batch_query needs
    // an owned handle to move into spawned futures.
    fn clone_shared(&self) -> Arc<Self> {
        Arc::new(Self {
            factual: self.factual.clone(),
            analytical: self.analytical.clone(),
            classifier: self.classifier.clone(),
            cache: self.cache.clone(),
            config: self.config.clone(),
        })
    }
}

fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn compose_answer(snippets: &[Snippet]) -> String {
    snippets
        .iter()
        .map(|s| s.excerpt.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_routes_causal_language_to_analytical() {
        let classifier = KeywordClassifier::new();
        assert_eq!(
            classifier.classify("Why does the scheduler starve long tasks?"),
            QueryRoute::Analytical
        );
        assert_eq!(
            classifier.classify("Compare sharded locks versus a global mutex"),
            QueryRoute::Analytical
        );
        assert_eq!(
            classifier.classify("session token expiry configuration"),
            QueryRoute::Factual
        );
    }

    #[test]
    fn test_normalization_collapses_whitespace_and_case() {
        assert_eq!(
            normalize_query("  How   DOES auth\twork "),
            "how does auth work"
        );
    }

    #[test]
    fn test_cache_key_separates_scopes() {
        let a = KnowledgeRouter::cache_key("project-a", "auth flow");
        let b = KnowledgeRouter::cache_key("project-b", "auth flow");
        assert_ne!(a, b);
    }
}
