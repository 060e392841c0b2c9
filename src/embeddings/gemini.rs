use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{validate_response, EmbeddingProvider, ProviderError};
use crate::cache::EmbeddingCache;

const DEFAULT_MODEL: &str = "text-embedding-004";

/// Calls the Google Generative AI embedding endpoint. The API embeds one
/// content item per request, so batches loop per text.
pub struct GeminiEmbeddingProvider {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiEmbeddingProvider {
    pub fn new(api_key: String, model: Option<String>, timeout: Duration) -> Self {
        Self {
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[derive(Serialize)]
struct GeminiEmbeddingRequest {
    model: String,
    content: GeminiContent,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiEmbeddingResponse {
    embedding: GeminiEmbeddingValues,
}

#[derive(Deserialize)]
struct GeminiEmbeddingValues {
    values: Vec<f64>,
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, ProviderError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let body = GeminiEmbeddingRequest {
                model: format!("models/{}", self.model),
                content: GeminiContent {
                    parts: vec![GeminiPart { text: text.clone() }],
                },
            };

            let url = format!(
                "https://generativelanguage.googleapis.com/v1beta/models/{}:embedContent?key={}",
                self.model, self.api_key
            );

            let resp = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await?
                .error_for_status()?
                .json::<GeminiEmbeddingResponse>()
                .await?;

            vectors.push(resp.embedding.values);
        }
        validate_response(texts, &vectors)?;
        Ok(vectors)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        768
    }

    fn key_fingerprint(&self) -> String {
        EmbeddingCache::key_fingerprint(Some(&self.api_key))
    }

    fn available(&self) -> bool {
        !self.api_key.is_empty()
    }
}
