//! mnemo — per-agent long-term memory retrieval.
//!
//! Turns a corpus of markdown notes (and optionally exported session
//! transcripts) into a per-agent searchable index and answers natural
//! language queries with ranked, citable snippets. Retrieval is hybrid:
//! a dense vector index (embeddings from a configurable provider chain)
//! fused with a sparse FTS5/BM25 lexical index, both stored in one SQLite
//! file per agent.
//!
//! The main entry point is [`MemoryIndexManager`]: open one per agent
//! identity, feed it corpus change notifications (or let it sweep), and
//! call [`MemoryIndexManager::search`].

pub mod cache;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod logging;
pub mod manager;
pub mod search;
pub mod snippet;
pub mod store;
pub mod sync;

pub use config::{MemoryConfig, SourceTag};
pub use error::MemoryError;
pub use manager::{MemoryIndexManager, MemoryStatus, ManagerState};
pub use search::{SearchResponse, SearchResult};
pub use sync::SyncReport;

/// Search an agent's memory for content relevant to `query`.
///
/// Convenience wrapper over [`MemoryIndexManager::get`] +
/// [`MemoryIndexManager::search`]: initialises (or re-uses) the manager
/// registered for `agent_id`, syncs any dirty corpus files, and runs a
/// hybrid search.
///
/// # Arguments
///
/// * `config`      - Memory configuration (provider selection, index roots,
///                   chunking/query tuning, storage location).
/// * `agent_id`    - Agent identity; selects which index file is queried.
/// * `query`       - Natural-language search query.
/// * `max_results` - Overrides the configured result cap when set.
/// * `min_score`   - Overrides the configured score floor when set.
pub async fn search(
    config: &MemoryConfig,
    agent_id: &str,
    query: &str,
    max_results: Option<u32>,
    min_score: Option<f64>,
) -> Result<SearchResponse, MemoryError> {
    let manager = MemoryIndexManager::get(config, agent_id)
        .await
        .map_err(|e| MemoryError::SearchUnavailable(format!("memory index unavailable: {e}")))?;
    manager.search(query, max_results, min_score).await
}
