use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use conductor::knowledge::source::LocalIndexSource;
use conductor::{KnowledgeRouter, RouterConfig};
use conductor_sdk::{async_trait, KnowledgeSource, OrchestratorError, Result, Snippet};

/// Source that counts invocations and answers every query with one snippet
/// echoing it, so tests can assert both call counts and result routing.
struct CountingSource {
    origin: String,
    calls: AtomicUsize,
    fail: bool,
}

impl CountingSource {
    fn answering(origin: &str) -> Arc<Self> {
        Arc::new(Self {
            origin: origin.to_string(),
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    fn failing(origin: &str) -> Arc<Self> {
        Arc::new(Self {
            origin: origin.to_string(),
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KnowledgeSource for CountingSource {
    fn origin(&self) -> &str {
        &self.origin
    }

    async fn search(
        &self,
        query: &str,
        _max_results: usize,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Snippet>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(OrchestratorError::KnowledgeUnavailable(format!(
                "{} is down",
                self.origin
            )));
        }
        Ok(vec![Snippet {
            origin: self.origin.clone(),
            excerpt: format!("{}: {}", self.origin, query),
            relevance: 1.0,
        }])
    }
}

/// Source that always returns nothing.
struct EmptySource;

#[async_trait]
impl KnowledgeSource for EmptySource {
    fn origin(&self) -> &str {
        "empty"
    }

    async fn search(
        &self,
        _query: &str,
        _max_results: usize,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Snippet>> {
        Ok(Vec::new())
    }
}

fn short_ttl() -> RouterConfig {
    RouterConfig {
        cache_ttl: Duration::from_millis(30),
        ..RouterConfig::default()
    }
}

#[tokio::test]
async fn test_factual_queries_hit_the_factual_source() {
    let factual = CountingSource::answering("index");
    let analytical = CountingSource::answering("research");
    let router = KnowledgeRouter::new(
        factual.clone(),
        analytical.clone(),
        RouterConfig::default(),
    );
    let cancel = CancellationToken::new();

    let result = router
        .query("session token expiry", "s", &cancel)
        .await
        .unwrap();
    assert!(result.answer.starts_with("index:"));
    assert_eq!(factual.calls(), 1);
    assert_eq!(analytical.calls(), 0);
}

#[tokio::test]
async fn test_analytical_queries_hit_the_analytical_source() {
    let factual = CountingSource::answering("index");
    let analytical = CountingSource::answering("research");
    let router = KnowledgeRouter::new(
        factual.clone(),
        analytical.clone(),
        RouterConfig::default(),
    );
    let cancel = CancellationToken::new();

    let result = router
        .query("why do tokens expire early", "s", &cancel)
        .await
        .unwrap();
    assert!(result.answer.starts_with("research:"));
    assert_eq!(analytical.calls(), 1);
    assert_eq!(factual.calls(), 0);
}

#[tokio::test]
async fn test_repeated_query_is_served_from_cache() {
    let factual = CountingSource::answering("index");
    let router = KnowledgeRouter::new(
        factual.clone(),
        CountingSource::answering("research"),
        RouterConfig::default(),
    );
    let cancel = CancellationToken::new();

    let first = router.query("token expiry", "s", &cancel).await.unwrap();
    assert!(!first.from_cache);

    // Whitespace and case variations normalize to the same key.
    let second = router
        .query("  Token   EXPIRY ", "s", &cancel)
        .await
        .unwrap();
    assert!(second.from_cache);
    assert_eq!(second.answer, first.answer);
    assert_eq!(factual.calls(), 1);
}

#[tokio::test]
async fn test_cache_entries_expire_after_ttl() {
    let factual = CountingSource::answering("index");
    let router = KnowledgeRouter::new(
        factual.clone(),
        CountingSource::answering("research"),
        short_ttl(),
    );
    let cancel = CancellationToken::new();

    router.query("token expiry", "s", &cancel).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    let again = router.query("token expiry", "s", &cancel).await.unwrap();

    assert!(!again.from_cache);
    assert_eq!(factual.calls(), 2);
}

#[tokio::test]
async fn test_scopes_do_not_share_cache_entries() {
    let factual = CountingSource::answering("index");
    let router = KnowledgeRouter::new(
        factual.clone(),
        CountingSource::answering("research"),
        RouterConfig::default(),
    );
    let cancel = CancellationToken::new();

    router.query("token expiry", "scope-a", &cancel).await.unwrap();
    let other = router.query("token expiry", "scope-b", &cancel).await.unwrap();

    assert!(!other.from_cache);
    assert_eq!(factual.calls(), 2);
}

#[tokio::test]
async fn test_empty_primary_falls_back_to_secondary() {
    let analytical = CountingSource::answering("research");
    let router = KnowledgeRouter::new(
        Arc::new(EmptySource),
        analytical.clone(),
        RouterConfig::default(),
    );
    let cancel = CancellationToken::new();

    // Factual query; the empty index falls through to the research source.
    let result = router.query("token expiry", "s", &cancel).await.unwrap();
    assert!(result.answer.starts_with("research:"));
    assert_eq!(analytical.calls(), 1);
}

#[tokio::test]
async fn test_failed_primary_falls_back_to_secondary() {
    let analytical = CountingSource::answering("research");
    let router = KnowledgeRouter::new(
        CountingSource::failing("index"),
        analytical.clone(),
        RouterConfig::default(),
    );
    let cancel = CancellationToken::new();

    let result = router.query("token expiry", "s", &cancel).await.unwrap();
    assert!(result.answer.starts_with("research:"));
}

#[tokio::test]
async fn test_both_sources_failing_surfaces_unavailable() {
    let router = KnowledgeRouter::new(
        CountingSource::failing("index"),
        CountingSource::failing("research"),
        RouterConfig::default(),
    );
    let cancel = CancellationToken::new();

    let err = router.query("token expiry", "s", &cancel).await.unwrap_err();
    match err {
        OrchestratorError::KnowledgeUnavailable(msg) => {
            assert!(msg.contains("index"));
            assert!(msg.contains("research"));
        }
        other => panic!("expected KnowledgeUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn test_batch_results_preserve_input_order() {
    let factual = CountingSource::answering("index");
    let router = KnowledgeRouter::new(
        factual.clone(),
        CountingSource::answering("research"),
        RouterConfig::default(),
    );
    let cancel = CancellationToken::new();

    let queries = vec![
        "alpha topic".to_string(),
        "beta topic".to_string(),
        "gamma topic".to_string(),
    ];
    let results = router.batch_query(queries, "s", &cancel).await.unwrap();

    assert_eq!(results.len(), 3);
    assert!(results[0].answer.contains("alpha"));
    assert!(results[1].answer.contains("beta"));
    assert!(results[2].answer.contains("gamma"));
}

#[tokio::test]
async fn test_cancelled_query_is_not_cached() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    // The local index rejects cancelled searches before touching documents.
    let local = KnowledgeRouter::new(
        Arc::new(LocalIndexSource::new()),
        CountingSource::answering("research"),
        RouterConfig::default(),
    );
    let err = local.query("token expiry", "s", &cancel).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled));

    // A fresh token gets a fresh answer rather than a poisoned cache entry.
    let fresh = CancellationToken::new();
    let result = local.query("token expiry", "s", &fresh).await;
    // Local index is empty, so this falls back to the counting source.
    assert!(result.unwrap().answer.starts_with("research:"));
}
