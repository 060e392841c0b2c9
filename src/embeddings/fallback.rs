use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{build_candidates, EmbeddingProvider, ProviderError};
use crate::cache::EmbeddingCache;
use crate::config::MemoryConfig;

/// Rate-limit retries per sub-batch before falling through to the next
/// candidate.
const MAX_RATE_LIMIT_RETRIES: u32 = 2;
const BACKOFF_BASE_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainState {
    /// No probe has run yet, or the active provider failed and the next use
    /// re-resolves.
    Unresolved,
    /// Candidate at this index passed its probe and serves embeddings.
    Active(usize),
    /// Every candidate failed. Terminal: callers degrade to lexical-only
    /// search for the lifetime of this index.
    Disabled,
}

/// Snapshot of the chain for the diagnostics surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChainStatus {
    pub provider: Option<String>,
    pub model: Option<String>,
    /// True when the active provider is not the first-preference candidate.
    pub fallback_active: bool,
    pub disabled: bool,
}

/// One successful embedding round.
pub struct EmbedBatch {
    /// One vector per input text, in input order.
    pub vectors: Vec<Vec<f64>>,
    pub provider: String,
    pub model_id: String,
}

/// Ordered provider-selection policy with caching.
///
/// Holds the candidate providers in priority order. The first candidate
/// passing its availability probe is pinned as the active provider; an
/// embed failure unpins it so the next use re-resolves, and exhausting all
/// candidates in one round disables the chain for good. Every embedding
/// call consults the content-addressed cache first, and cache misses are
/// embedded in bounded-concurrency sub-batches reassembled in input order.
pub struct FallbackChain {
    candidates: Vec<Arc<dyn EmbeddingProvider>>,
    state: RwLock<ChainState>,
    cache: EmbeddingCache,
    batch_size: usize,
    concurrency: usize,
}

impl FallbackChain {
    pub fn new(
        candidates: Vec<Arc<dyn EmbeddingProvider>>,
        cache: EmbeddingCache,
        batch_size: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            candidates,
            state: RwLock::new(ChainState::Unresolved),
            cache,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    pub fn from_config(config: &MemoryConfig, cache: EmbeddingCache) -> Self {
        Self::new(
            build_candidates(config),
            cache,
            config.batch.size(),
            config.batch.concurrency(),
        )
    }

    /// Resolve the active provider, skipping candidates that already failed
    /// in the current round. Sets the terminal disabled state when nothing
    /// is left.
    fn resolve_skipping(&self, skip: &HashSet<usize>) -> Option<(usize, Arc<dyn EmbeddingProvider>)> {
        match *self.state.read() {
            ChainState::Disabled => return None,
            ChainState::Active(i) if !skip.contains(&i) => {
                return Some((i, self.candidates[i].clone()));
            }
            _ => {}
        }

        for (i, candidate) in self.candidates.iter().enumerate() {
            if skip.contains(&i) || !candidate.available() {
                continue;
            }
            *self.state.write() = ChainState::Active(i);
            info!(
                provider = candidate.name(),
                model = %candidate.model(),
                fallback = i > 0,
                "embedding provider resolved"
            );
            return Some((i, candidate.clone()));
        }

        *self.state.write() = ChainState::Disabled;
        warn!("no embedding provider available; degrading to lexical-only search");
        None
    }

    /// Embed `texts`, trying candidates in order. `None` means the chain is
    /// disabled — no vector signal, not an error.
    pub async fn embed(&self, texts: &[String]) -> Option<EmbedBatch> {
        let mut skip = HashSet::new();
        loop {
            let (index, provider) = self.resolve_skipping(&skip)?;
            match self.embed_via(provider.as_ref(), texts).await {
                Ok(vectors) => {
                    return Some(EmbedBatch {
                        vectors,
                        provider: provider.name().to_string(),
                        model_id: provider.model_id(),
                    });
                }
                Err(e) => {
                    warn!(
                        provider = provider.name(),
                        "embedding failed, advancing fallback chain: {e}"
                    );
                    skip.insert(index);
                    *self.state.write() = ChainState::Unresolved;
                }
            }
        }
    }

    /// One provider round: cache lookups, sub-batched network calls for the
    /// misses, cache write-back, reassembly in input order.
    async fn embed_via(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
    ) -> Result<Vec<Vec<f64>>, ProviderError> {
        let name = provider.name();
        let model = provider.model().to_string();
        let fingerprint = provider.key_fingerprint();

        let hashes: Vec<String> = texts.iter().map(|t| EmbeddingCache::content_hash(t)).collect();
        let mut results: Vec<Option<Vec<f64>>> = hashes
            .iter()
            .map(|h| self.cache.get(name, &model, &fingerprint, h))
            .collect();

        let missing: Vec<usize> = results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.is_none().then_some(i))
            .collect();

        if !missing.is_empty() {
            debug!(
                provider = name,
                cached = texts.len() - missing.len(),
                to_embed = missing.len(),
                "embedding batch"
            );

            let sub_batches: Vec<Vec<String>> = missing
                .chunks(self.batch_size)
                .map(|idxs| idxs.iter().map(|&i| texts[i].clone()).collect())
                .collect();

            // buffered() bounds in-flight sub-batches while keeping output
            // in input order.
            let outputs: Vec<Result<Vec<Vec<f64>>, ProviderError>> =
                stream::iter(
                    sub_batches
                        .into_iter()
                        .map(|batch| async move { embed_with_retry(provider, &batch).await }),
                )
                .buffered(self.concurrency)
                .collect()
                .await;

            let mut fresh = Vec::with_capacity(missing.len());
            for output in outputs {
                fresh.extend(output?);
            }
            if fresh.len() != missing.len() {
                return Err(ProviderError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    missing.len(),
                    fresh.len()
                )));
            }

            for (slot, vector) in missing.into_iter().zip(fresh) {
                self.cache.put(name, &model, &fingerprint, &hashes[slot], &vector);
                results[slot] = Some(vector);
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.ok_or_else(|| {
                    ProviderError::InvalidResponse("embedding missing after batch".to_string())
                })
            })
            .collect()
    }

    /// Resolve (or re-use) the active provider and return its model
    /// identity. `None` when the chain is (or becomes) disabled.
    pub fn resolve(&self) -> Option<String> {
        self.resolve_skipping(&HashSet::new())
            .map(|(_, provider)| provider.model_id())
    }

    /// Current chain snapshot for status reporting.
    pub fn status(&self) -> ChainStatus {
        match *self.state.read() {
            ChainState::Active(i) => ChainStatus {
                provider: Some(self.candidates[i].name().to_string()),
                model: Some(self.candidates[i].model_id()),
                fallback_active: i > 0,
                disabled: false,
            },
            ChainState::Disabled => ChainStatus {
                provider: None,
                model: None,
                fallback_active: false,
                disabled: true,
            },
            ChainState::Unresolved => ChainStatus {
                provider: None,
                model: None,
                fallback_active: false,
                disabled: false,
            },
        }
    }

    pub fn is_disabled(&self) -> bool {
        *self.state.read() == ChainState::Disabled
    }
}

/// Call one provider with rate-limit backoff. Other failures (including
/// timeouts, which the HTTP clients surface as unavailable) propagate
/// immediately so the chain can advance.
async fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
) -> Result<Vec<Vec<f64>>, ProviderError> {
    let mut attempt = 0u32;
    loop {
        match provider.embed(texts).await {
            Err(ProviderError::RateLimited) if attempt < MAX_RATE_LIMIT_RETRIES => {
                let delay = Duration::from_millis(BACKOFF_BASE_MS << attempt);
                debug!(provider = provider.name(), delay_ms = delay.as_millis() as u64, "rate limited, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IndexStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubProvider {
        name: &'static str,
        available: bool,
        /// Errors returned before succeeding (drained per call).
        failures: parking_lot::Mutex<Vec<ProviderError>>,
        calls: AtomicU32,
    }

    impl StubProvider {
        fn ok(name: &'static str) -> Self {
            Self {
                name,
                available: true,
                failures: parking_lot::Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
            }
        }

        fn failing(name: &'static str, failures: Vec<ProviderError>) -> Self {
            Self {
                failures: parking_lot::Mutex::new(failures),
                ..Self::ok(name)
            }
        }

        fn unavailable(name: &'static str) -> Self {
            Self {
                available: false,
                ..Self::ok(name)
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for StubProvider {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.failures.lock().pop() {
                return Err(err);
            }
            Ok(texts.iter().map(|t| vec![t.len() as f64, 1.0]).collect())
        }

        fn name(&self) -> &'static str {
            self.name
        }
        fn model(&self) -> &str {
            "stub-model"
        }
        fn dimensions(&self) -> usize {
            2
        }
        fn available(&self) -> bool {
            self.available
        }
    }

    fn cache() -> EmbeddingCache {
        IndexStore::open_in_memory().unwrap().embedding_cache(true)
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn resolves_first_available_candidate() {
        let unavailable = Arc::new(StubProvider::unavailable("a"));
        let available = Arc::new(StubProvider::ok("b"));
        let chain = FallbackChain::new(vec![unavailable, available], cache(), 8, 2);

        let batch = chain.embed(&texts(&["hi"])).await.unwrap();
        assert_eq!(batch.provider, "b");
        assert!(chain.status().fallback_active);
    }

    #[tokio::test]
    async fn advances_past_failing_provider() {
        let flaky = Arc::new(StubProvider::failing(
            "flaky",
            vec![ProviderError::Unavailable("down".into())],
        ));
        let steady = Arc::new(StubProvider::ok("steady"));
        let chain = FallbackChain::new(vec![flaky.clone(), steady], cache(), 8, 2);

        let batch = chain.embed(&texts(&["hi"])).await.unwrap();
        assert_eq!(batch.provider, "steady");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disables_when_all_candidates_fail() {
        let down = Arc::new(StubProvider::failing(
            "down",
            vec![ProviderError::Unavailable("down".into())],
        ));
        let chain = FallbackChain::new(vec![down.clone()], cache(), 8, 2);

        assert!(chain.embed(&texts(&["hi"])).await.is_none());
        assert!(chain.is_disabled());
        // Terminal: no further provider calls even though the stub would
        // now succeed.
        assert!(chain.embed(&texts(&["hi"])).await.is_none());
        assert_eq!(down.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_hit_skips_provider_call() {
        let provider = Arc::new(StubProvider::ok("p"));
        let chain = FallbackChain::new(vec![provider.clone()], cache(), 8, 2);

        let first = chain.embed(&texts(&["same text"])).await.unwrap();
        let second = chain.embed(&texts(&["same text"])).await.unwrap();
        assert_eq!(first.vectors, second.vectors);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sub_batches_reassemble_in_input_order() {
        let provider = Arc::new(StubProvider::ok("p"));
        // batch_size 2 over 5 texts → 3 sub-batches, 2 in flight.
        let chain = FallbackChain::new(vec![provider], cache(), 2, 2);

        let input = texts(&["a", "bb", "ccc", "dddd", "eeeee"]);
        let batch = chain.embed(&input).await.unwrap();
        let lens: Vec<f64> = batch.vectors.iter().map(|v| v[0]).collect();
        assert_eq!(lens, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[tokio::test]
    async fn rate_limit_retries_with_backoff_then_succeeds() {
        let provider = Arc::new(StubProvider::failing(
            "p",
            vec![ProviderError::RateLimited, ProviderError::RateLimited],
        ));
        let chain = FallbackChain::new(vec![provider.clone()], cache(), 8, 2);

        let batch = chain.embed(&texts(&["hi"])).await;
        assert!(batch.is_some());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_chain_reports_disabled_status() {
        let chain = FallbackChain::new(Vec::new(), cache(), 8, 2);
        assert!(chain.embed(&texts(&["hi"])).await.is_none());
        let status = chain.status();
        assert!(status.disabled);
        assert!(status.provider.is_none());
    }
}
