use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{QueryConfig, SourceTag};
use crate::embeddings::FallbackChain;
use crate::error::MemoryError;
use crate::store::{IndexStore, StoredChunk};

/// Longest snippet derived from a chunk, in characters.
const SNIPPET_MAX_CHARS: usize = 160;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// A single search result: a citable slice of the corpus with its fused
/// relevance score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// Source file path (relative to its index root).
    pub path: String,
    /// First line of the matched chunk (1-based, inclusive).
    pub start_line: u32,
    /// Last line of the matched chunk (1-based, inclusive).
    pub end_line: u32,
    /// Full chunk text.
    pub text: String,
    /// Combined relevance score (vector and lexical signals fused).
    pub score: f64,
    /// Short lead-in derived from the chunk text.
    pub snippet: String,
}

/// Search response for the tool contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    /// Active embedding backend, when the vector channel contributed.
    pub provider_used: Option<String>,
    /// Active embedding model identity.
    pub model_used: Option<String>,
}

// ---------------------------------------------------------------------------
// Score conversion
// ---------------------------------------------------------------------------

/// Convert a cosine distance (ascending, closer = smaller) to a 0–1
/// higher-is-better score.
pub(crate) fn vector_score(distance: f64) -> f64 {
    1.0 - distance
}

/// Convert an FTS5 BM25 rank (lower/more negative = more relevant) to a
/// bounded higher-is-better score: `1 / (1 + |rank|)`.
pub(crate) fn lexical_score(rank: f64) -> f64 {
    1.0 / (1.0 + rank.abs())
}

/// Merge vector and lexical candidate lists by chunk rowid into combined
/// scores. A chunk present in only one list contributes zero from the
/// missing channel — absence is no signal, not a neutral midpoint — so a
/// lexical-only match is capped at `text_weight`.
pub(crate) fn fuse_candidates(
    vector_hits: &[(i64, f64)],
    lexical_hits: &[(i64, f64)],
    vector_weight: f64,
    text_weight: f64,
) -> HashMap<i64, f64> {
    let mut combined: HashMap<i64, f64> = HashMap::new();
    for &(rowid, distance) in vector_hits {
        *combined.entry(rowid).or_default() += vector_weight * vector_score(distance);
    }
    for &(rowid, rank) in lexical_hits {
        *combined.entry(rowid).or_default() += text_weight * lexical_score(rank);
    }
    combined
}

// ---------------------------------------------------------------------------
// Query tokenization
// ---------------------------------------------------------------------------

/// Extract alphanumeric/underscore runs as lowercase tokens.
pub(crate) fn tokenize_query(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in query.chars() {
        if c.is_alphanumeric() || c == '_' {
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Build an FTS5 MATCH expression requiring every token to be present
/// (logical AND — simultaneous presence, not a verbatim phrase). Tokens are
/// quoted so query punctuation can never inject FTS syntax.
pub(crate) fn build_match_expr(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Derive a short display snippet: the first sentence when one ends early
/// enough, otherwise a truncated lead-in. Newlines collapse to spaces.
pub(crate) fn derive_snippet(text: &str) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Some(end) = flat
        .char_indices()
        .find(|(i, c)| matches!(c, '.' | '!' | '?') && *i < SNIPPET_MAX_CHARS)
        .map(|(i, c)| i + c.len_utf8())
    {
        return flat[..end].to_string();
    }
    if flat.chars().count() <= SNIPPET_MAX_CHARS {
        return flat;
    }
    let truncated: String = flat.chars().take(SNIPPET_MAX_CHARS).collect();
    format!("{}…", truncated.trim_end())
}

// ---------------------------------------------------------------------------
// HybridSearcher
// ---------------------------------------------------------------------------

/// Read-only hybrid query engine over one agent's index.
///
/// Issues the vector and lexical candidate queries concurrently, fuses the
/// two independently-normalized signals with the configured weights, and
/// materialises citation records. When no vector signal is available the
/// lexical channel proceeds alone with the configured weights as-is (no
/// renormalization), so lexical-only scores sit below the hybrid ceiling.
pub struct HybridSearcher {
    store: IndexStore,
    chain: Arc<FallbackChain>,
    query: QueryConfig,
    sources: Vec<SourceTag>,
}

impl HybridSearcher {
    pub fn new(
        store: IndexStore,
        chain: Arc<FallbackChain>,
        query: QueryConfig,
        sources: Vec<SourceTag>,
    ) -> Self {
        Self {
            store,
            chain,
            query,
            sources,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        max_results: Option<u32>,
        min_score: Option<f64>,
    ) -> Result<SearchResponse, MemoryError> {
        let max_results = max_results.unwrap_or_else(|| self.query.max_results());
        let min_score = min_score.unwrap_or_else(|| self.query.min_score());
        let pool = self.query.candidate_pool(max_results);

        let tokens = tokenize_query(query);
        let match_expr = build_match_expr(&tokens);

        // Both channels run concurrently: end-to-end latency is bounded by
        // the slower of the two, not their sum.
        let vector_channel = async {
            let query_text = vec![query.to_string()];
            match self.chain.embed(&query_text).await {
                Some(batch) if !batch.vectors.is_empty() => self
                    .store
                    .vector_query(&batch.vectors[0], &batch.model_id, &self.sources, pool)
                    .map(|hits| Some((hits, batch.provider, batch.model_id))),
                _ => Ok(None),
            }
        };
        let lexical_channel = async {
            if tokens.is_empty() {
                return Ok(Vec::new());
            }
            self.store.lexical_query(&match_expr, &self.sources, pool)
        };
        let (vector_outcome, lexical_outcome) = tokio::join!(vector_channel, lexical_channel);

        // A corrupt index is not a degraded-mode case: surface it so the
        // manager can trigger a rebuild.
        for outcome in [
            vector_outcome.as_ref().err(),
            lexical_outcome.as_ref().err(),
        ]
        .into_iter()
        .flatten()
        {
            if outcome.is_corrupt() {
                return Err(MemoryError::IndexCorrupt(outcome.to_string()));
            }
        }

        if let (Err(ve), Err(le)) = (&vector_outcome, &lexical_outcome) {
            return Err(MemoryError::SearchUnavailable(format!(
                "both channels failed: vector: {ve}; lexical: {le}"
            )));
        }

        let (vector_hits, provider_used, model_used) = match vector_outcome {
            Ok(Some((hits, provider, model))) => (hits, Some(provider), Some(model)),
            Ok(None) => (Vec::new(), None, None),
            Err(e) => {
                warn!("vector channel failed, degrading to lexical-only: {e}");
                (Vec::new(), None, None)
            }
        };
        let lexical_hits = match lexical_outcome {
            Ok(hits) => hits,
            Err(e) => {
                warn!("lexical channel failed, degrading to vector-only: {e}");
                Vec::new()
            }
        };

        let combined = fuse_candidates(
            &vector_hits,
            &lexical_hits,
            self.query.vector_weight(),
            self.query.text_weight(),
        );

        let surviving: Vec<i64> = combined
            .iter()
            .filter(|(_, &score)| score >= min_score)
            .map(|(&rowid, _)| rowid)
            .collect();
        let chunks = self.store.get_chunks(&surviving)?;

        let mut scored: Vec<(StoredChunk, f64)> = chunks
            .into_iter()
            .map(|c| {
                let score = combined[&c.rowid];
                (c, score)
            })
            .collect();
        // Descending by score; deterministic path+line tie-break.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.path.cmp(&b.0.path))
                .then_with(|| a.0.start_line.cmp(&b.0.start_line))
        });
        scored.truncate(max_results as usize);

        debug!(
            query_tokens = tokens.len(),
            vector_candidates = vector_hits.len(),
            lexical_candidates = lexical_hits.len(),
            results = scored.len(),
            "hybrid search complete"
        );

        let results = scored
            .into_iter()
            .map(|(chunk, score)| SearchResult {
                snippet: derive_snippet(&chunk.text),
                path: chunk.path,
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                text: chunk.text,
                score,
            })
            .collect();

        Ok(SearchResponse {
            results,
            provider_used,
            model_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{EmbeddingProvider, ProviderError};
    use crate::store::{chunk_identity, ChunkRecord};
    use async_trait::async_trait;

    // A provider that embeds by keyword features, so vector similarity in
    // tests is predictable without a network.
    struct KeywordProvider;

    fn keyword_vector(text: &str) -> Vec<f64> {
        let lower = text.to_lowercase();
        vec![
            lower.contains("jwt") as u8 as f64,
            lower.contains("expir") as u8 as f64,
            lower.contains("token") as u8 as f64,
        ]
    }

    #[async_trait]
    impl EmbeddingProvider for KeywordProvider {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, ProviderError> {
            Ok(texts.iter().map(|t| keyword_vector(t)).collect())
        }
        fn name(&self) -> &'static str {
            "stub"
        }
        fn model(&self) -> &str {
            "keywords"
        }
        fn dimensions(&self) -> usize {
            3
        }
        fn available(&self) -> bool {
            true
        }
    }

    fn seeded_store() -> (IndexStore, Vec<i64>) {
        let store = IndexStore::open_in_memory().unwrap();
        let texts = [
            "JWT authentication tokens expire after 24 hours.",
            "Grocery list: apples, bread, coffee.",
        ];
        let records: Vec<ChunkRecord> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let line = (i as u32) * 2 + 1;
                ChunkRecord {
                    identity: chunk_identity(SourceTag::Memory, "notes.md", line, line),
                    path: "notes.md".to_string(),
                    source: SourceTag::Memory,
                    text: text.to_string(),
                    start_line: line,
                    end_line: line,
                    token_count: text.split_whitespace().count() as u32,
                }
            })
            .collect();
        let rowids = store
            .upsert_chunks("notes.md", SourceTag::Memory, "h", &records)
            .unwrap();
        (store, rowids)
    }

    fn searcher_with_chain(
        store: &IndexStore,
        providers: Vec<Arc<dyn EmbeddingProvider>>,
    ) -> HybridSearcher {
        let chain = Arc::new(FallbackChain::new(
            providers,
            store.embedding_cache(true),
            8,
            2,
        ));
        HybridSearcher::new(
            store.clone(),
            chain,
            QueryConfig::default(),
            vec![SourceTag::Memory],
        )
    }

    #[test]
    fn lexical_rank_conversion_table() {
        assert!((lexical_score(-5.0) - 0.1667).abs() < 1e-3);
        assert!((lexical_score(-10.0) - 0.0909).abs() < 1e-3);
        assert!((lexical_score(0.0) - 1.0).abs() < f64::EPSILON);
        assert!((lexical_score(3.0) - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn fusion_example_from_weights() {
        // vector_score 0.9 → distance 0.1; lexical_score 0.2 → |rank| 4.
        let combined = fuse_candidates(&[(1, 0.1)], &[(1, 4.0)], 0.7, 0.3);
        assert!((combined[&1] - 0.69).abs() < 1e-9);
    }

    #[test]
    fn missing_signal_contributes_zero() {
        let combined = fuse_candidates(&[(1, 0.0)], &[(2, 0.0)], 0.7, 0.3);
        // Chunk 1: vector only → 0.7; chunk 2: lexical only, capped at the
        // text weight even with a perfect rank.
        assert!((combined[&1] - 0.7).abs() < 1e-9);
        assert!((combined[&2] - 0.3).abs() < 1e-9);
    }

    #[test]
    fn tokenize_extracts_word_runs() {
        assert_eq!(
            tokenize_query("What's the token_expiry policy (v2)?"),
            vec!["what", "s", "the", "token_expiry", "policy", "v2"]
        );
        assert!(tokenize_query("!!! ...").is_empty());
    }

    #[test]
    fn match_expr_quotes_and_ands() {
        let tokens = vec!["jwt".to_string(), "expiry".to_string()];
        assert_eq!(build_match_expr(&tokens), "\"jwt\" AND \"expiry\"");
    }

    #[test]
    fn snippet_prefers_first_sentence() {
        let text = "Tokens expire after 24 hours. Refresh tokens last longer and rotate.";
        assert_eq!(derive_snippet(text), "Tokens expire after 24 hours.");

        let long = "word ".repeat(100);
        let snippet = derive_snippet(&long);
        assert!(snippet.chars().count() <= SNIPPET_MAX_CHARS + 1);
        assert!(snippet.ends_with('…'));
    }

    #[tokio::test]
    async fn hybrid_search_returns_relevant_chunk() {
        let (store, rowids) = seeded_store();
        store
            .attach_vectors(
                "stub:keywords",
                &[
                    (rowids[0], keyword_vector("JWT authentication tokens expire after 24 hours.")),
                    (rowids[1], keyword_vector("Grocery list: apples, bread, coffee.")),
                ],
            )
            .unwrap();

        let searcher = searcher_with_chain(&store, vec![Arc::new(KeywordProvider)]);
        let response = searcher
            .search("token expiration policy", None, None)
            .await
            .unwrap();

        assert_eq!(response.provider_used.as_deref(), Some("stub"));
        assert_eq!(response.model_used.as_deref(), Some("stub:keywords"));
        assert_eq!(response.results.len(), 1);
        let top = &response.results[0];
        assert_eq!(top.path, "notes.md");
        assert!(top.score >= 0.35, "score {} below floor", top.score);
        assert!(top.text.contains("JWT"));
    }

    #[tokio::test]
    async fn lexical_only_when_chain_disabled() {
        let (store, _) = seeded_store();
        // No candidates: the chain disables and only the lexical channel
        // contributes, scored with the configured weights as-is.
        let searcher = searcher_with_chain(&store, Vec::new());
        let response = searcher
            .search("grocery apples", None, Some(0.01))
            .await
            .unwrap();

        assert!(response.provider_used.is_none());
        assert_eq!(response.results.len(), 1);
        let top = &response.results[0];
        assert!(top.text.contains("Grocery"));
        // Ceiling check: without a vector signal the score cannot exceed
        // the text weight.
        assert!(top.score <= 0.3 + 1e-9);
    }

    #[tokio::test]
    async fn min_score_filters_weak_matches() {
        let (store, _) = seeded_store();
        let searcher = searcher_with_chain(&store, Vec::new());
        // Default min_score 0.35 is above the lexical-only ceiling of 0.3.
        let response = searcher.search("grocery apples", None, None).await.unwrap();
        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn ties_break_by_path_and_line_order() {
        let store = IndexStore::open_in_memory().unwrap();
        for (path, lines) in [("b.md", vec![1u32]), ("a.md", vec![1u32, 5u32])] {
            let records: Vec<ChunkRecord> = lines
                .iter()
                .map(|&line| ChunkRecord {
                    identity: chunk_identity(SourceTag::Memory, path, line, line),
                    path: path.to_string(),
                    source: SourceTag::Memory,
                    text: "identical searchable words".to_string(),
                    start_line: line,
                    end_line: line,
                    token_count: 3,
                })
                .collect();
            store
                .upsert_chunks(path, SourceTag::Memory, &format!("h-{path}"), &records)
                .unwrap();
        }

        let searcher = searcher_with_chain(&store, Vec::new());
        let response = searcher
            .search("identical searchable words", None, Some(0.0))
            .await
            .unwrap();
        let order: Vec<(String, u32)> = response
            .results
            .iter()
            .map(|r| (r.path.clone(), r.start_line))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a.md".to_string(), 1),
                ("a.md".to_string(), 5),
                ("b.md".to_string(), 1)
            ]
        );
    }
}
