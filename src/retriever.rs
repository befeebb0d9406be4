//! Query-time retrieval: embed the query, search, threshold, dedup, truncate.
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::config::{DedupPolicy, RetrievalConfig};
use crate::embedder::retry::{RetryPolicy, embed_with_retry};
use crate::embedder::{Embedder, EmbedderError};
use crate::index::{Generation, IndexError, SearchHit, VectorIndex};
use crate::models::{Chunk, SymbolKind};

#[derive(Error, Debug)]
pub enum RetrieveError {
    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbedderError),

    #[error("index search failed: {0}")]
    Index(#[from] IndexError),
}

/// Outcome of a retrieval.
#[derive(Debug)]
pub enum Retrieval {
    Found(RetrievalResult),
    /// No chunk met the similarity threshold.
    NoRelevantContext,
}

impl Retrieval {
    pub fn is_found(&self) -> bool {
        matches!(self, Retrieval::Found(_))
    }
}

/// Ranked hits and the generation they were read from.
#[derive(Debug)]
pub struct RetrievalResult {
    pub hits: Vec<SearchHit>,
    generation: Arc<Generation>,
}

impl RetrievalResult {
    pub fn generation_id(&self) -> u64 {
        self.generation.id()
    }

    /// Enclosing chunk of a hit, from the same generation as the hit.
    pub fn parent(&self, hit: &SearchHit) -> Option<&Arc<Chunk>> {
        self.generation.parent(&hit.chunk)
    }
}

pub struct Retriever {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
    query_policy: RetryPolicy,
}

impl Retriever {
    /// `timeout` bounds the single query embedding attempt.
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            index,
            embedder,
            config,
            query_policy: RetryPolicy::single_attempt(timeout),
        }
    }

    /// Retrieve with the configured `top_k` and `min_score`.
    pub async fn retrieve_default(&self, query: &str) -> Result<Retrieval, RetrieveError> {
        self.retrieve(query, self.config.top_k, self.config.min_score)
            .await
    }

    /// Return at most `k` hits scoring at least `min_score`, best first.
    ///
    /// # Errors
    ///
    /// Fails when the query cannot be embedded or its vector does not match
    /// the index dimension.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        min_score: f32,
    ) -> Result<Retrieval, RetrieveError> {
        let vector = embed_with_retry(self.embedder.as_ref(), query, &self.query_policy).await?;

        let generation = self.index.current_generation();
        let fetch = k.max(self.config.overfetch);
        let mut candidates = generation.search(&vector, fetch)?;
        candidates.retain(|hit| hit.score >= min_score);

        let hits = dedup(candidates, self.config.dedup, k);
        debug!(
            "Query matched {} chunks in generation {} (k={k}, min_score={min_score})",
            hits.len(),
            generation.id()
        );

        if hits.is_empty() {
            return Ok(Retrieval::NoRelevantContext);
        }
        Ok(Retrieval::Found(RetrievalResult { hits, generation }))
    }
}

/// Greedily keep candidates in score order, skipping those the policy
/// considers redundant with an already kept hit, until `k` are kept.
pub fn dedup(candidates: Vec<SearchHit>, policy: DedupPolicy, k: usize) -> Vec<SearchHit> {
    let mut kept: Vec<SearchHit> = Vec::with_capacity(k);
    for candidate in candidates {
        if kept.len() >= k {
            break;
        }
        let redundant = kept
            .iter()
            .any(|selected| is_redundant(&selected.chunk, &candidate.chunk, policy));
        if !redundant {
            kept.push(candidate);
        }
    }
    kept
}

fn is_redundant(selected: &Chunk, candidate: &Chunk, policy: DedupPolicy) -> bool {
    // A module chunk spans its file but holds none of the declarations' text.
    if selected.kind == SymbolKind::Module {
        return false;
    }
    match policy {
        DedupPolicy::Off => false,
        DedupPolicy::Nesting => selected.contains_span(candidate),
        DedupPolicy::Overlap { threshold } => {
            if selected.file_path != candidate.file_path {
                return false;
            }
            let start = selected.start_line.max(candidate.start_line);
            let end = selected.end_line.min(candidate.end_line);
            if start > end {
                return false;
            }
            let covered = (end - start + 1) as f32 / candidate.line_count() as f32;
            covered >= threshold
        }
    }
}

/// Render hits as a context block for an answer-generation prompt.
#[must_use]
pub fn format_as_context(result: &RetrievalResult) -> String {
    let mut out = String::from("<code_context>\n");
    for hit in &result.hits {
        let chunk = &hit.chunk;
        let _ = writeln!(
            out,
            "  <chunk file=\"{}\" lines=\"{}-{}\" kind=\"{}\" name=\"{}\" score=\"{:.2}\">",
            chunk.file_path,
            chunk.start_line,
            chunk.end_line,
            chunk.kind,
            chunk.qualified_name,
            hit.score,
        );
        out.push_str(&chunk.text);
        out.push_str("\n  </chunk>\n");
    }
    out.push_str("</code_context>");
    out
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use async_trait::async_trait;

    use super::*;
    use crate::embedder::mock::FlakyEmbedder;
    use crate::models::{CodeMetadata, EmbeddedChunk, Signature, SymbolKind};

    /// Returns a fixed vector per query string.
    struct TableEmbedder(HashMap<&'static str, Vec<f32>>);

    #[async_trait]
    impl Embedder for TableEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
            self.0
                .get(text)
                .cloned()
                .ok_or_else(|| EmbedderError::Rejected(format!("unknown query {text}")))
        }
        fn dimensions(&self) -> usize {
            3
        }
        fn name(&self) -> &str {
            "table"
        }
    }

    fn chunk(id: &str, kind: SymbolKind, span: (usize, usize), parent: Option<&str>) -> Chunk {
        Chunk {
            id: id.to_string(),
            file_path: "shop.py".to_string(),
            start_line: span.0,
            end_line: span.1,
            kind,
            qualified_name: format!("shop.{id}"),
            docstring: None,
            signature: Signature::default(),
            metadata: CodeMetadata::default(),
            text: format!("# {id}"),
            truncated: false,
            parent_id: parent.map(str::to_string),
        }
    }

    /// module(1-40) > Cart(1-20) > Cart.add(5-9); checkout(22-30)
    fn index() -> Arc<VectorIndex> {
        let index = VectorIndex::new(3);
        index
            .build(
                vec![
                    EmbeddedChunk {
                        chunk: chunk("module", SymbolKind::Module, (1, 40), None),
                        vector: Some(vec![0.0, 0.0, 1.0]),
                    },
                    EmbeddedChunk {
                        chunk: chunk("cart", SymbolKind::Class, (1, 20), Some("module")),
                        vector: Some(vec![1.0, 0.1, 0.0]),
                    },
                    EmbeddedChunk {
                        chunk: chunk("add", SymbolKind::Method, (5, 9), Some("cart")),
                        vector: Some(vec![1.0, 0.2, 0.0]),
                    },
                    EmbeddedChunk {
                        chunk: chunk("checkout", SymbolKind::Function, (22, 30), Some("module")),
                        vector: Some(vec![0.6, 0.8, 0.0]),
                    },
                ],
                BTreeMap::new(),
            )
            .unwrap();
        Arc::new(index)
    }

    fn retriever(index: Arc<VectorIndex>, dedup: DedupPolicy) -> Retriever {
        let embedder = TableEmbedder(HashMap::from([
            ("cart", vec![1.0, 0.0, 0.0]),
            ("settings", vec![0.3, 0.0, 1.0]),
            ("unrelated", vec![0.0, -1.0, 0.0]),
        ]));
        let config = RetrievalConfig {
            dedup,
            ..RetrievalConfig::default()
        };
        Retriever::new(index, Arc::new(embedder), config, Duration::from_secs(5))
    }

    fn ids(retrieval: &Retrieval) -> Vec<&str> {
        match retrieval {
            Retrieval::Found(result) => result.hits.iter().map(|h| h.chunk.id.as_str()).collect(),
            Retrieval::NoRelevantContext => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_nesting_dedup_drops_nested_hits() {
        let r = retriever(index(), DedupPolicy::Nesting);
        let retrieval = r.retrieve("cart", 5, 0.1).await.unwrap();
        // cart (0.995) is kept, add (0.98) nests inside it, checkout (0.6) stays
        assert_eq!(ids(&retrieval), vec!["cart", "checkout"]);
    }

    #[tokio::test]
    async fn test_module_hit_does_not_hide_declarations() {
        // module (0.96) spans the file; cart (0.29) and checkout (0.17) survive,
        // add (0.28) still nests inside cart
        for policy in [DedupPolicy::Nesting, DedupPolicy::Overlap { threshold: 0.5 }] {
            let r = retriever(index(), policy);
            let retrieval = r.retrieve("settings", 5, 0.1).await.unwrap();
            assert_eq!(ids(&retrieval), vec!["module", "cart", "checkout"]);
        }
    }

    #[tokio::test]
    async fn test_dedup_off_keeps_overlap() {
        let r = retriever(index(), DedupPolicy::Off);
        let retrieval = r.retrieve("cart", 5, 0.1).await.unwrap();
        assert_eq!(ids(&retrieval), vec!["cart", "add", "checkout"]);
    }

    #[tokio::test]
    async fn test_overlap_dedup_threshold() {
        let r = retriever(index(), DedupPolicy::Overlap { threshold: 0.5 });
        let retrieval = r.retrieve("cart", 5, 0.1).await.unwrap();
        assert_eq!(ids(&retrieval), vec!["cart", "checkout"]);
    }

    #[tokio::test]
    async fn test_truncates_to_k() {
        let r = retriever(index(), DedupPolicy::Off);
        let retrieval = r.retrieve("cart", 1, 0.0).await.unwrap();
        assert_eq!(ids(&retrieval), vec!["cart"]);
    }

    #[tokio::test]
    async fn test_no_relevant_context_below_threshold() {
        let r = retriever(index(), DedupPolicy::Nesting);
        let retrieval = r.retrieve("unrelated", 5, 0.8).await.unwrap();
        assert!(matches!(retrieval, Retrieval::NoRelevantContext));
        assert!(!retrieval.is_found());
    }

    #[tokio::test]
    async fn test_empty_index_is_no_relevant_context() {
        let r = retriever(Arc::new(VectorIndex::new(3)), DedupPolicy::Nesting);
        let retrieval = r.retrieve_default("cart").await.unwrap();
        assert!(matches!(retrieval, Retrieval::NoRelevantContext));
    }

    #[tokio::test]
    async fn test_query_embedding_failure_surfaces() {
        let embedder = FlakyEmbedder::failing_first(1, 3, EmbedderError::Unavailable("down".into()));
        let r = Retriever::new(
            index(),
            Arc::new(embedder),
            RetrievalConfig::default(),
            Duration::from_secs(5),
        );
        let err = r.retrieve("cart", 5, 0.0).await.unwrap_err();
        assert!(matches!(err, RetrieveError::Embedding(EmbedderError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_parent_and_context_block() {
        let r = retriever(index(), DedupPolicy::Off);
        let Retrieval::Found(result) = r.retrieve("cart", 3, 0.1).await.unwrap() else {
            panic!("expected hits");
        };
        let add = result.hits.iter().find(|h| h.chunk.id == "add").unwrap();
        assert_eq!(result.parent(add).unwrap().id, "cart");
        assert_eq!(result.generation_id(), 1);

        let context = format_as_context(&result);
        assert!(context.starts_with("<code_context>\n"));
        assert!(context.contains("file=\"shop.py\" lines=\"5-9\" kind=\"method\" name=\"shop.add\""));
        assert!(context.ends_with("</code_context>"));
    }
}
