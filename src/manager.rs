use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{IndexRoot, MemoryConfig};
use crate::embeddings::FallbackChain;
use crate::error::MemoryError;
use crate::search::{HybridSearcher, SearchResponse};
use crate::snippet;
use crate::store::{IndexStore, SourceCounts};
use crate::sync::{SyncEngine, SyncReport, TokioClock};

/// Process-wide registry: one manager per agent identity, created lazily on
/// first use. Indexes are fully isolated — nothing is shared between
/// entries except this map.
static REGISTRY: Lazy<DashMap<String, MemoryIndexManager>> = Lazy::new(DashMap::new);

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`MemoryIndexManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
    /// Initialised and serving queries.
    Ready,
    /// A full sweep is in progress.
    Syncing,
    /// Closed; no longer usable.
    Closed,
}

/// Answer for the diagnostics surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MemoryStatus {
    pub agent_id: String,
    pub enabled: bool,
    pub state: ManagerState,
    /// Active embedding backend, if one has resolved.
    pub provider: Option<String>,
    /// Active embedding model identity.
    pub model: Option<String>,
    /// True when the active provider is a fallback rather than the
    /// first-preference candidate.
    pub fallback_active: bool,
    /// Vector queries can currently produce results.
    pub vector_ready: bool,
    /// Lexical queries can currently produce results.
    pub lexical_ready: bool,
    /// Per-source file/chunk counters.
    pub sources: Vec<SourceCounts>,
}

// ---------------------------------------------------------------------------
// MemoryIndexManager
// ---------------------------------------------------------------------------

/// Owns one agent's memory index: the SQLite store, the embedding provider
/// chain, the sync engine and the hybrid searcher.
///
/// Create one via [`MemoryIndexManager::get`] (process-wide, registered per
/// agent id) or [`MemoryIndexManager::open`] (unregistered). The instance is
/// cheaply cloneable; all clones share the same index.
#[derive(Clone)]
pub struct MemoryIndexManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    agent_id: String,
    enabled: bool,
    roots: Vec<IndexRoot>,
    store: IndexStore,
    chain: Arc<FallbackChain>,
    sync: Arc<SyncEngine>,
    searcher: HybridSearcher,
    state: Mutex<ManagerState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryIndexManager {
    /// Fetch (or lazily create) the registered manager for `agent_id`.
    ///
    /// The index lives at `<store_dir>/<agent_id>.db`. Configuration is read
    /// at first creation; later calls re-use the existing instance.
    pub async fn get(config: &MemoryConfig, agent_id: &str) -> anyhow::Result<Self> {
        if let Some(existing) = REGISTRY.get(agent_id) {
            return Ok(existing.clone());
        }
        let manager = Self::open(config, agent_id).await?;
        REGISTRY.insert(agent_id.to_string(), manager.clone());
        Ok(manager)
    }

    /// Open the index for `agent_id` without registering it.
    pub async fn open(config: &MemoryConfig, agent_id: &str) -> anyhow::Result<Self> {
        let db_path = config.index_path(agent_id);
        let store = IndexStore::open(&db_path)
            .with_context(|| format!("opening memory index at {}", db_path.display()))?;
        let cache = store.embedding_cache(config.cache.enabled());
        let chain = Arc::new(FallbackChain::from_config(config, cache));
        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            chain.clone(),
            config,
            Arc::new(TokioClock),
        ));
        let searcher = HybridSearcher::new(
            store.clone(),
            chain.clone(),
            config.query.clone(),
            config.sources(),
        );

        let manager = Self {
            inner: Arc::new(ManagerInner {
                agent_id: agent_id.to_string(),
                enabled: config.enabled(),
                roots: config.index_roots(),
                store,
                chain,
                sync,
                searcher,
                state: Mutex::new(ManagerState::Ready),
                tasks: Mutex::new(Vec::new()),
            }),
        };
        manager.spawn_background(config);

        info!(
            agent_id,
            db = %db_path.display(),
            enabled = manager.inner.enabled,
            "memory index manager ready"
        );
        Ok(manager)
    }

    fn spawn_background(&self, config: &MemoryConfig) {
        if !self.inner.enabled {
            return;
        }
        let mut tasks = self.inner.tasks.lock();

        if config.sync.on_boot() {
            let sync = self.inner.sync.clone();
            tasks.push(tokio::spawn(async move {
                sync.sweep(false).await;
            }));
        }

        // Debounce poller: flushes files whose change-notification deadline
        // has passed.
        let poll = (config.sync.debounce() / 4).max(Duration::from_millis(100));
        let sync = self.inner.sync.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll).await;
                sync.sync_due().await;
            }
        }));

        if let Some(interval) = config.sync.interval() {
            let sync = self.inner.sync.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    sync.sweep(false).await;
                }
            }));
        }
    }

    // -----------------------------------------------------------------------
    // Tool contract
    // -----------------------------------------------------------------------

    /// Hybrid search over this agent's index.
    ///
    /// Dirty corpus files are synced first, so a query issued after an edit
    /// observes the new content. A corrupt index triggers one rebuild +
    /// retry; only total channel failure surfaces as an error.
    pub async fn search(
        &self,
        query: &str,
        max_results: Option<u32>,
        min_score: Option<f64>,
    ) -> Result<SearchResponse, MemoryError> {
        if !self.inner.enabled {
            return Err(MemoryError::SearchUnavailable(
                "memory search is disabled by configuration".to_string(),
            ));
        }
        if *self.inner.state.lock() == ManagerState::Closed {
            return Err(MemoryError::SearchUnavailable(
                "memory index manager is closed".to_string(),
            ));
        }

        if self.inner.sync.has_dirty() {
            self.inner.sync.sync_dirty().await;
        }

        match self.inner.searcher.search(query, max_results, min_score).await {
            Err(e) if e.is_corrupt() => {
                warn!(agent_id = %self.inner.agent_id, "index corrupt, rebuilding: {e}");
                self.rebuild().await?;
                self.inner.searcher.search(query, max_results, min_score).await
            }
            other => other,
        }
    }

    /// Read a raw line slice from a corpus file (citation follow-up).
    pub fn read_snippet(
        &self,
        path: &str,
        from_line: Option<u32>,
        line_count: Option<u32>,
    ) -> Result<String, MemoryError> {
        snippet::read_slice(&self.inner.roots, path, from_line, line_count)
    }

    /// Run a full corpus sweep now. `force` re-chunks unchanged files too.
    pub async fn sync(&self, force: bool) -> SyncReport {
        *self.inner.state.lock() = ManagerState::Syncing;
        let report = self.inner.sync.sweep(force).await;
        *self.inner.state.lock() = ManagerState::Ready;
        report
    }

    /// Record a corpus change notification (debounced re-index).
    pub fn notify_change(&self, path: &str) {
        self.inner.sync.notify_change(path);
    }

    /// Drop all corpus-derived rows and re-index from scratch. Invoked
    /// automatically when a sub-index invariant violation is detected.
    pub async fn rebuild(&self) -> Result<(), MemoryError> {
        info!(agent_id = %self.inner.agent_id, "rebuilding memory index");
        *self.inner.state.lock() = ManagerState::Syncing;
        let result = self.inner.store.rebuild();
        if result.is_ok() {
            self.inner.sync.sweep(true).await;
        }
        *self.inner.state.lock() = ManagerState::Ready;
        result
    }

    /// Current diagnostics snapshot.
    pub fn status(&self) -> MemoryStatus {
        let chain = self.inner.chain.status();
        let sources = self.inner.store.counts().unwrap_or_default();
        let chunks: u64 = sources.iter().map(|s| s.chunks).sum();
        let embedded: u64 = sources.iter().map(|s| s.embedded_chunks).sum();

        MemoryStatus {
            agent_id: self.inner.agent_id.clone(),
            enabled: self.inner.enabled,
            state: *self.inner.state.lock(),
            provider: chain.provider,
            model: chain.model,
            fallback_active: chain.fallback_active,
            vector_ready: !chain.disabled && embedded > 0,
            lexical_ready: chunks > 0,
            sources,
        }
    }

    /// Stop background tasks and deregister. The index file persists; it is
    /// never implicitly deleted.
    pub async fn close(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        *self.inner.state.lock() = ManagerState::Closed;
        REGISTRY.remove(&self.inner.agent_id);
        info!(agent_id = %self.inner.agent_id, "memory index manager closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexRoot, SourceTag};

    fn test_config(state: &std::path::Path, corpus: Option<&std::path::Path>) -> MemoryConfig {
        let mut config = MemoryConfig::default();
        config.state_dir = Some(state.to_path_buf());
        config.sync.on_boot = Some(false);
        if let Some(corpus) = corpus {
            config.paths = vec![IndexRoot::new(corpus.to_path_buf(), SourceTag::Memory)];
        }
        config
    }

    #[tokio::test]
    async fn open_creates_index_file_and_reports_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(dir.path(), None);
        let manager = MemoryIndexManager::open(&config, "agent-a").await.unwrap();

        assert!(dir.path().join("memory/agent-a.db").exists());
        let status = manager.status();
        assert_eq!(status.agent_id, "agent-a");
        assert_eq!(status.state, ManagerState::Ready);
        assert!(!status.lexical_ready);
        assert!(!status.vector_ready);
        manager.close().await;
    }

    #[tokio::test]
    async fn disabled_config_fails_search_with_typed_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(dir.path(), None);
        config.enabled = Some(false);
        let manager = MemoryIndexManager::open(&config, "agent-off").await.unwrap();

        let err = manager.search("anything", None, None).await.unwrap_err();
        assert!(matches!(err, MemoryError::SearchUnavailable(_)));
        manager.close().await;
    }

    #[tokio::test]
    async fn registry_returns_same_instance_per_agent() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(dir.path(), None);

        let a = MemoryIndexManager::get(&config, "agent-reg").await.unwrap();
        let b = MemoryIndexManager::get(&config, "agent-reg").await.unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));

        a.close().await;
        let c = MemoryIndexManager::get(&config, "agent-reg").await.unwrap();
        assert!(!Arc::ptr_eq(&a.inner, &c.inner));
        c.close().await;
    }

    #[tokio::test]
    async fn rebuild_reindexes_from_corpus() {
        let state = tempfile::TempDir::new().unwrap();
        let corpus = tempfile::TempDir::new().unwrap();
        std::fs::write(corpus.path().join("notes.md"), "durable facts live here").unwrap();

        let config = test_config(state.path(), Some(corpus.path()));
        let manager = MemoryIndexManager::open(&config, "agent-rb").await.unwrap();

        manager.sync(false).await;
        assert!(manager.status().lexical_ready);

        manager.rebuild().await.unwrap();
        // Rebuild drops and re-indexes; content is still searchable.
        let response = manager
            .search("durable facts", None, Some(0.0))
            .await
            .unwrap();
        assert_eq!(response.results.len(), 1);
        manager.close().await;
    }
}
