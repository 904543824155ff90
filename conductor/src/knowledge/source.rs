//! Concrete knowledge sources consumed by the router
//!
//! Two kinds exist: a local indexed full-text store for factual lookups,
//! and an external analytical research service reached over HTTP.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use conductor_sdk::{async_trait, KnowledgeSource, OrchestratorError, Result, Snippet};

/// In-memory full-text store scoring documents by term overlap with the
/// query. Documents are registered up front (or as steps discover them).
pub struct LocalIndexSource {
    origin: String,
    documents: RwLock<Vec<Document>>,
}

struct Document {
    title: String,
    body: String,
}

impl LocalIndexSource {
    pub fn new() -> Self {
        Self {
            origin: "local-index".to_string(),
            documents: RwLock::new(Vec::new()),
        }
    }

    pub fn add_document(&self, title: impl Into<String>, body: impl Into<String>) {
        if let Ok(mut docs) = self.documents.write() {
            docs.push(Document {
                title: title.into(),
                body: body.into(),
            });
        }
    }

    /// Fraction of query terms present in the document body.
    fn score(query_terms: &[String], body: &str) -> f64 {
        if query_terms.is_empty() {
            return 0.0;
        }
        let body_lower = body.to_lowercase();
        let hits = query_terms
            .iter()
            .filter(|term| body_lower.contains(term.as_str()))
            .count();
        hits as f64 / query_terms.len() as f64
    }

    /// Byte offset in `body` where the lowercase `term` first matches,
    /// folding `body` char by char. Offsets into a `to_lowercase()` copy
    /// must never be reused on the original: case folding can change byte
    /// lengths.
    fn find_term(body: &str, term: &str) -> Option<usize> {
        if term.is_empty() {
            return Some(0);
        }
        for (i, _) in body.char_indices() {
            let mut haystack = body[i..].chars().flat_map(char::to_lowercase);
            if term.chars().all(|t| haystack.next() == Some(t)) {
                return Some(i);
            }
        }
        None
    }

    fn excerpt_around(body: &str, term: &str, radius: usize) -> String {
        match Self::find_term(body, term) {
            Some(pos) => {
                let start = body[..pos]
                    .char_indices()
                    .rev()
                    .take(radius)
                    .last()
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                let end = body[pos..]
                    .char_indices()
                    .take(radius)
                    .last()
                    .map(|(i, c)| pos + i + c.len_utf8())
                    .unwrap_or(body.len());
                body[start..end].trim().to_string()
            }
            None => body.chars().take(radius).collect(),
        }
    }
}

impl Default for LocalIndexSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KnowledgeSource for LocalIndexSource {
    fn origin(&self) -> &str {
        &self.origin
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Snippet>> {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .filter(|t| t.len() > 2)
            .map(str::to_string)
            .collect();

        let docs = self
            .documents
            .read()
            .map_err(|_| OrchestratorError::KnowledgeUnavailable("index poisoned".into()))?;

        let mut scored: Vec<Snippet> = docs
            .iter()
            .filter_map(|doc| {
                let relevance = Self::score(&terms, &doc.body);
                if relevance <= 0.0 {
                    return None;
                }
                let anchor = terms
                    .iter()
                    .find(|t| doc.body.to_lowercase().contains(t.as_str()))?;
                Some(Snippet {
                    origin: format!("{}:{}", self.origin, doc.title),
                    excerpt: Self::excerpt_around(&doc.body, anchor, 160),
                    relevance,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        scored.truncate(max_results);
        Ok(scored)
    }
}

/// External analytical research service queried over HTTP. The service
/// accepts a JSON body and returns ranked findings.
pub struct ResearchServiceSource {
    origin: String,
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ResearchFinding {
    excerpt: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    score: f64,
}

#[derive(Debug, Deserialize)]
struct ResearchResponse {
    findings: Vec<ResearchFinding>,
}

impl ResearchServiceSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            origin: "research-service".to_string(),
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl KnowledgeSource for ResearchServiceSource {
    fn origin(&self) -> &str {
        &self.origin
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Snippet>> {
        let mut body = HashMap::new();
        body.insert("query", serde_json::json!(query));
        body.insert("max_results", serde_json::json!(max_results));

        let request = self.client.post(&self.endpoint).json(&body).send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            resp = request => resp.map_err(|e| {
                OrchestratorError::KnowledgeUnavailable(format!(
                    "research service unreachable: {e}"
                ))
            })?,
        };

        if !response.status().is_success() {
            return Err(OrchestratorError::KnowledgeUnavailable(format!(
                "research service returned {}",
                response.status()
            )));
        }

        let parsed: ResearchResponse = response.json().await.map_err(|e| {
            OrchestratorError::KnowledgeUnavailable(format!("malformed research response: {e}"))
        })?;

        let mut snippets: Vec<Snippet> = parsed
            .findings
            .into_iter()
            .map(|f| Snippet {
                origin: f
                    .source
                    .map(|s| format!("{}:{}", self.origin, s))
                    .unwrap_or_else(|| self.origin.clone()),
                excerpt: f.excerpt,
                relevance: f.score,
            })
            .collect();

        snippets.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        snippets.truncate(max_results);
        Ok(snippets)
    }
}
