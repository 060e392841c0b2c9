use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{validate_response, EmbeddingProvider, ProviderError};

const MODEL_NAME: &str = "all-minilm-l6-v2";
const DIMENSIONS: usize = 384;

/// On-device embeddings via fastembed (ONNX inference, AllMiniLM-L6-v2).
///
/// Model weights are materialised into the configured cache directory.
/// When downloads are disallowed, the provider only reports itself
/// available if weights are already present, so `auto` resolution never
/// stalls on a first-run download nobody asked for. The inference engine
/// is loaded lazily on first embed call.
pub struct LocalEmbeddingProvider {
    cache_dir: PathBuf,
    allow_download: bool,
    engine: Mutex<Option<TextEmbedding>>,
}

impl LocalEmbeddingProvider {
    pub fn new(cache_dir: PathBuf, allow_download: bool) -> Self {
        Self {
            cache_dir,
            allow_download,
            engine: Mutex::new(None),
        }
    }

    fn weights_present(&self) -> bool {
        std::fs::read_dir(&self.cache_dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    fn load_engine(&self) -> Result<TextEmbedding, ProviderError> {
        info!(cache_dir = %self.cache_dir.display(), "loading local embedding model");
        let options = InitOptions::new(EmbeddingModel::AllMiniLML6V2)
            .with_cache_dir(self.cache_dir.clone())
            .with_show_download_progress(false);
        TextEmbedding::try_new(options)
            .map_err(|e| ProviderError::Unavailable(format!("local model init failed: {e}")))
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut guard = self.engine.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_engine()?);
        }
        let Some(engine) = guard.as_mut() else {
            return Err(ProviderError::Unavailable("local model not loaded".to_string()));
        };

        let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
        let embedded = engine
            .embed(refs, None)
            .map_err(|e| ProviderError::Unavailable(format!("local inference failed: {e}")))?;

        let vectors: Vec<Vec<f64>> = embedded
            .into_iter()
            .map(|v| v.into_iter().map(f64::from).collect())
            .collect();
        validate_response(texts, &vectors)?;
        debug!(count = vectors.len(), "local embeddings computed");
        Ok(vectors)
    }

    fn name(&self) -> &'static str {
        "local"
    }

    fn model(&self) -> &str {
        MODEL_NAME
    }

    fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    fn available(&self) -> bool {
        self.allow_download || self.weights_present()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_without_weights_or_download_permission() {
        let dir = tempfile::TempDir::new().unwrap();
        let provider = LocalEmbeddingProvider::new(dir.path().join("missing"), false);
        assert!(!provider.available());
    }

    #[test]
    fn available_when_download_allowed() {
        let dir = tempfile::TempDir::new().unwrap();
        let provider = LocalEmbeddingProvider::new(dir.path().to_path_buf(), true);
        assert!(provider.available());
    }

    #[test]
    fn available_when_weights_present() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("model.onnx"), b"stub").unwrap();
        let provider = LocalEmbeddingProvider::new(dir.path().to_path_buf(), false);
        assert!(provider.available());
        assert_eq!(provider.model_id(), "local:all-minilm-l6-v2");
    }
}
