use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::store::{decode_embedding, encode_embedding};

/// Hit/miss counters, exposed so callers (and tests) can verify that
/// unchanged content never re-triggers a network embedding call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Content-addressed store of previously computed embeddings.
///
/// Entries are keyed by `(provider, model, key_fingerprint, content_hash)`
/// and live in the `embedding_cache` table of the same per-agent SQLite file
/// as the index, so cache scope follows index scope. Writes are idempotent
/// per-key upserts: concurrent duplicate computation of one key is wasteful
/// but never incorrect, and last-writer-wins is fine because values are
/// deterministic for a given key.
#[derive(Clone)]
pub struct EmbeddingCache {
    db: Arc<Mutex<Connection>>,
    enabled: bool,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl EmbeddingCache {
    pub(crate) fn new(db: Arc<Mutex<Connection>>, enabled: bool) -> Self {
        Self {
            db,
            enabled,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// sha256 hex digest of `text`, the content half of the cache key.
    pub fn content_hash(text: &str) -> String {
        hex::encode(Sha256::digest(text.as_bytes()))
    }

    /// Short fingerprint of a credential, so rotating an API key invalidates
    /// cached vectors computed under the old key without storing the key.
    pub fn key_fingerprint(credential: Option<&str>) -> String {
        match credential {
            Some(key) if !key.is_empty() => {
                hex::encode(Sha256::digest(key.as_bytes()))[..12].to_string()
            }
            _ => "none".to_string(),
        }
    }

    pub fn get(
        &self,
        provider: &str,
        model: &str,
        fingerprint: &str,
        content_hash: &str,
    ) -> Option<Vec<f64>> {
        if !self.enabled {
            return None;
        }

        let blob: Option<Vec<u8>> = {
            let conn = self.db.lock();
            conn.query_row(
                "SELECT embedding FROM embedding_cache
                 WHERE provider = ?1 AND model = ?2 AND key_fingerprint = ?3 AND content_hash = ?4",
                rusqlite::params![provider, model, fingerprint, content_hash],
                |row| row.get(0),
            )
            .ok()
        };

        match blob.and_then(|b| decode_embedding(&b).ok()) {
            Some(vector) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(vector)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(
        &self,
        provider: &str,
        model: &str,
        fingerprint: &str,
        content_hash: &str,
        vector: &[f64],
    ) {
        if !self.enabled {
            return;
        }

        let conn = self.db.lock();
        let result = conn.execute(
            "INSERT OR REPLACE INTO embedding_cache
             (provider, model, key_fingerprint, content_hash, dimensions, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                provider,
                model,
                fingerprint,
                content_hash,
                vector.len() as i64,
                encode_embedding(vector),
                Utc::now().to_rfc3339(),
            ],
        );
        if let Err(e) = result {
            // A failed cache write is a lost optimisation, not an error.
            debug!(provider, model, "embedding cache write failed: {e}");
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
