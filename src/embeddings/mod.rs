mod fallback;
mod gemini;
mod local;
mod openai;

pub use fallback::{ChainStatus, EmbedBatch, FallbackChain};
pub use gemini::GeminiEmbeddingProvider;
pub use local::LocalEmbeddingProvider;
pub use openai::OpenAiEmbeddingProvider;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{MemoryConfig, ProviderSelection};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure modes of a single embedding provider. These never reach the
/// search caller: the [`FallbackChain`] absorbs them and either falls back
/// to the next candidate or degrades to lexical-only search.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Network/credential/local-model failure, including timeouts. Triggers
    /// fallback to the next candidate.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// HTTP 429. Retried with backoff before falling through to fallback.
    #[error("provider rate limited")]
    RateLimited,

    /// Malformed or wrong-shape provider output. Treated as unavailable for
    /// that provider.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            if status.as_u16() == 429 {
                return ProviderError::RateLimited;
            }
        }
        if e.is_decode() {
            return ProviderError::InvalidResponse(e.to_string());
        }
        ProviderError::Unavailable(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A provider that turns text into dense vector embeddings.
///
/// Concrete backends differ only in how they reach the network or local
/// inference; selection and fallback logic operates purely on this
/// interface.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Compute embeddings for a batch of texts, one vector per input,
    /// aligned index-for-index with the input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, ProviderError>;

    /// Short backend name (e.g. `openai`), used in cache keys and status.
    fn name(&self) -> &'static str;

    /// The model identifier used by this provider.
    fn model(&self) -> &str;

    /// Identity of (backend, model) — dense entries in the index are scoped
    /// by this value so vectors from different models never mix in a query.
    fn model_id(&self) -> String {
        format!("{}:{}", self.name(), self.model())
    }

    /// Dimensionality of vectors produced by [`Self::embed`].
    fn dimensions(&self) -> usize;

    /// Credential fingerprint for the embedding cache key; `"none"` for
    /// keyless providers.
    fn key_fingerprint(&self) -> String {
        "none".to_string()
    }

    /// Lightweight availability probe: credential presence for cloud
    /// backends, model weight presence for local inference. Never touches
    /// the network.
    fn available(&self) -> bool;
}

/// Check that a provider response is shaped like the request: one vector
/// per input, uniform non-zero dimensionality.
pub(crate) fn validate_response(
    texts: &[String],
    vectors: &[Vec<f64>],
) -> Result<(), ProviderError> {
    if vectors.len() != texts.len() {
        return Err(ProviderError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            texts.len(),
            vectors.len()
        )));
    }
    let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
    if texts.is_empty() {
        return Ok(());
    }
    if dims == 0 || vectors.iter().any(|v| v.len() != dims) {
        return Err(ProviderError::InvalidResponse(
            "embeddings have inconsistent or zero dimensions".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Candidate construction
// ---------------------------------------------------------------------------

/// Build the ordered provider candidate list from configuration.
///
/// `auto` probes local availability first, then each cloud provider's
/// credential presence. Pinning a provider puts it first, with the
/// configured fallback (or the remaining auto order for `fallback: auto`)
/// behind it. The model override only applies to an explicitly pinned
/// provider; auto candidates keep their backend defaults.
pub fn build_candidates(config: &MemoryConfig) -> Vec<Arc<dyn EmbeddingProvider>> {
    let timeout = config.batch.timeout();

    let make = |selection: ProviderSelection, model: Option<String>| -> Option<Arc<dyn EmbeddingProvider>> {
        match selection {
            ProviderSelection::Auto => None,
            ProviderSelection::Openai => Some(Arc::new(OpenAiEmbeddingProvider::new(
                config.openai.api_key.clone().unwrap_or_default(),
                config.openai.base_url.clone(),
                model,
                timeout,
            ))),
            ProviderSelection::Gemini => Some(Arc::new(GeminiEmbeddingProvider::new(
                config.gemini.api_key.clone().unwrap_or_default(),
                model,
                timeout,
            ))),
            ProviderSelection::Local => Some(Arc::new(LocalEmbeddingProvider::new(
                config.model_cache_dir(),
                config.local.allow_download.unwrap_or(false),
            ))),
        }
    };

    const AUTO_ORDER: [ProviderSelection; 3] = [
        ProviderSelection::Local,
        ProviderSelection::Openai,
        ProviderSelection::Gemini,
    ];

    let mut selections: Vec<(ProviderSelection, Option<String>)> = Vec::new();
    match config.provider {
        ProviderSelection::Auto => {
            selections.extend(AUTO_ORDER.iter().map(|&s| (s, None)));
        }
        pinned => {
            selections.push((pinned, config.model.clone()));
            match config.fallback {
                Some(ProviderSelection::Auto) => {
                    selections.extend(
                        AUTO_ORDER.iter().filter(|&&s| s != pinned).map(|&s| (s, None)),
                    );
                }
                Some(fb) if fb != pinned => selections.push((fb, None)),
                _ => {}
            }
        }
    }

    selections
        .into_iter()
        .filter_map(|(s, model)| make(s, model))
        .collect()
}
