use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chunking::chunk_text;
use crate::config::{IndexRoot, MemoryConfig, SourceTag};
use crate::embeddings::FallbackChain;
use crate::error::MemoryError;
use crate::store::{chunk_identity, ChunkRecord, IndexStore};

/// Chunks embedded per backfill round.
const EMBED_BATCH: u32 = 64;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Injected time source so debounce behavior is testable without real
/// timers or filesystem events.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The production clock.
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// ---------------------------------------------------------------------------
// File states
// ---------------------------------------------------------------------------

/// Per-file indexing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Changed since last index (or never indexed).
    Dirty,
    /// Re-index in progress.
    Indexing,
    /// Index matches file content.
    Clean,
    /// Last attempt failed; retried on the next trigger, never in a hot
    /// loop.
    Error,
}

#[derive(Debug, Clone, Copy)]
struct FileEntry {
    state: FileState,
    /// Debounce deadline for change notifications.
    due: Option<Instant>,
}

/// Outcome of syncing one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOutcome {
    Indexed,
    Unchanged,
    Deleted,
}

/// Counters from one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub indexed: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// SyncEngine
// ---------------------------------------------------------------------------

/// Drives re-chunking, re-embedding and re-indexing of the corpus.
///
/// The engine is the only writer of corpus-derived index rows. Each file
/// moves through a dirty-state machine: change notifications mark it dirty
/// with a debounce deadline (rapid successive writes coalesce into one
/// re-index of the final content), queries flush dirty files explicitly,
/// and full sweeps discover new and deleted files.
///
/// For a dirty file, chunk text rows are upserted first — the file is
/// lexically searchable immediately — and vectors are attached afterwards;
/// a chunk missing its vector is simply absent from vector queries until
/// embedding completes.
pub struct SyncEngine {
    store: IndexStore,
    chain: Arc<FallbackChain>,
    roots: Vec<IndexRoot>,
    tokens: u32,
    overlap: u32,
    debounce: Duration,
    states: DashMap<String, FileEntry>,
    clock: Arc<dyn Clock>,
}

impl SyncEngine {
    pub fn new(
        store: IndexStore,
        chain: Arc<FallbackChain>,
        config: &MemoryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            chain,
            roots: config.index_roots(),
            tokens: config.chunking.tokens(),
            overlap: config.chunking.overlap(),
            debounce: config.sync.debounce(),
            states: DashMap::new(),
            clock,
        }
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    /// Record a file-change notification. Marks the file dirty and (re)arms
    /// its debounce deadline, so bursts of writes collapse to one re-index.
    /// Accepts absolute paths (resolved against the roots) or stored
    /// relative paths.
    pub fn notify_change(&self, path: &str) {
        let rel = self.to_rel(path);
        let due = self.clock.now() + self.debounce;
        self.states
            .entry(rel.clone())
            .and_modify(|e| {
                e.state = FileState::Dirty;
                e.due = Some(due);
            })
            .or_insert(FileEntry {
                state: FileState::Dirty,
                due: Some(due),
            });
        debug!(path = %rel, "file marked dirty");
    }

    /// Whether any file is waiting to be (re-)indexed.
    pub fn has_dirty(&self) -> bool {
        self.states
            .iter()
            .any(|e| matches!(e.state, FileState::Dirty | FileState::Error))
    }

    pub fn file_state(&self, path: &str) -> Option<FileState> {
        self.states.get(&self.to_rel(path)).map(|e| e.state)
    }

    /// Sync every file whose debounce deadline has passed.
    pub async fn sync_due(&self) -> SyncReport {
        let now = self.clock.now();
        let due: Vec<String> = self
            .states
            .iter()
            .filter(|e| e.state == FileState::Dirty && e.due.is_some_and(|d| d <= now))
            .map(|e| e.key().clone())
            .collect();
        self.sync_paths(&due).await
    }

    /// Sync every dirty or errored file immediately, ignoring debounce.
    /// This is the sync-on-query trigger: a query issued after it returns
    /// observes the new content.
    pub async fn sync_dirty(&self) -> SyncReport {
        let dirty: Vec<String> = self
            .states
            .iter()
            .filter(|e| matches!(e.state, FileState::Dirty | FileState::Error))
            .map(|e| e.key().clone())
            .collect();
        self.sync_paths(&dirty).await
    }

    /// Full-corpus pass: walk the configured roots, index new or changed
    /// files, drop chunks of files that disappeared, then backfill missing
    /// vectors. `force` re-chunks even when content hashes are unchanged.
    pub async fn sweep(&self, force: bool) -> SyncReport {
        let discovered = self.discover();
        let mut report = self.sync_paths_inner(&discovered, force).await;

        // Deleted files: indexed paths no discovery pass produced.
        let discovered_set: HashSet<&String> = discovered.iter().collect();
        match self.store.indexed_files() {
            Ok(indexed) => {
                for (path, _) in indexed {
                    if !discovered_set.contains(&path) {
                        match self.store.delete_by_path(&path) {
                            Ok(_) => {
                                self.states.remove(&path);
                                report.deleted += 1;
                            }
                            Err(e) => {
                                warn!(path = %path, "failed to delete vanished file: {e}");
                                report.failed += 1;
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("could not enumerate indexed files for deletion sweep: {e}"),
        }

        let embedded = self.embed_pending().await;
        info!(
            indexed = report.indexed,
            unchanged = report.unchanged,
            deleted = report.deleted,
            failed = report.failed,
            embedded,
            "corpus sweep complete"
        );
        report
    }

    async fn sync_paths(&self, paths: &[String]) -> SyncReport {
        self.sync_paths_inner(paths, false).await
    }

    async fn sync_paths_inner(&self, paths: &[String], force: bool) -> SyncReport {
        let mut report = SyncReport::default();
        for path in paths {
            match self.sync_file(path, force).await {
                Ok(SyncOutcome::Indexed) => report.indexed += 1,
                Ok(SyncOutcome::Unchanged) => report.unchanged += 1,
                Ok(SyncOutcome::Deleted) => report.deleted += 1,
                Err(e) => {
                    warn!(path = %path, "sync failed: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    // -----------------------------------------------------------------------
    // Per-file pipeline
    // -----------------------------------------------------------------------

    async fn sync_file(&self, rel: &str, force: bool) -> Result<SyncOutcome, MemoryError> {
        self.set_state(rel, FileState::Indexing);

        let Some((abs, source)) = self.resolve_abs(rel) else {
            let removed = self.store.delete_by_path(rel)?;
            self.states.remove(rel);
            debug!(path = rel, removed, "source file gone, chunks deleted");
            return Ok(SyncOutcome::Deleted);
        };

        let content = match std::fs::read_to_string(&abs) {
            Ok(content) => content,
            Err(e) => {
                self.set_state(rel, FileState::Error);
                return Err(e.into());
            }
        };

        // Spurious touch events (mtime changed, content identical) must not
        // re-chunk.
        let hash = hex::encode(Sha256::digest(content.as_bytes()));
        if !force && self.store.file_hash(rel)?.as_deref() == Some(hash.as_str()) {
            self.set_state(rel, FileState::Clean);
            return Ok(SyncOutcome::Unchanged);
        }

        let chunks = chunk_text(&content, self.tokens, self.overlap);
        let records: Vec<ChunkRecord> = chunks
            .into_iter()
            .map(|c| ChunkRecord {
                identity: chunk_identity(source, rel, c.start_line, c.end_line),
                path: rel.to_string(),
                source,
                text: c.text,
                start_line: c.start_line,
                end_line: c.end_line,
                token_count: c.token_count,
            })
            .collect();

        // Stale eviction + text upsert are one transaction; the file is
        // lexically searchable as soon as this returns.
        let rowids = match self.store.upsert_chunks(rel, source, &hash, &records) {
            Ok(rowids) => rowids,
            Err(e) => {
                self.set_state(rel, FileState::Error);
                return Err(e);
            }
        };

        // Vector attachment happens outside the text transaction so lexical
        // availability never waits on embedding latency. A disabled chain
        // leaves the chunks lexical-only.
        let texts: Vec<String> = records.iter().map(|r| r.text.clone()).collect();
        if let Some(batch) = self.chain.embed(&texts).await {
            if batch.vectors.len() == rowids.len() {
                let pairs: Vec<(i64, Vec<f64>)> =
                    rowids.into_iter().zip(batch.vectors).collect();
                if let Err(e) = self.store.attach_vectors(&batch.model_id, &pairs) {
                    self.set_state(rel, FileState::Error);
                    return Err(e);
                }
            }
        }

        self.set_state(rel, FileState::Clean);
        debug!(path = rel, chunks = records.len(), "file indexed");
        Ok(SyncOutcome::Indexed)
    }

    /// Embed chunks that have no vector under the active model — retries
    /// after earlier provider outages and re-embeds after a model switch.
    pub async fn embed_pending(&self) -> usize {
        let Some(mut model_id) = self.chain.resolve() else {
            return 0;
        };

        let mut attached = 0usize;
        loop {
            let pending = match self.store.pending_chunks(&model_id, EMBED_BATCH) {
                Ok(pending) => pending,
                Err(e) => {
                    warn!("could not list pending chunks: {e}");
                    break;
                }
            };
            if pending.is_empty() {
                break;
            }

            let texts: Vec<String> = pending.iter().map(|(_, t)| t.clone()).collect();
            let Some(batch) = self.chain.embed(&texts).await else {
                break;
            };
            if batch.vectors.len() != pending.len() {
                warn!("embedding batch size mismatch, aborting backfill");
                break;
            }

            let pairs: Vec<(i64, Vec<f64>)> = pending
                .iter()
                .map(|(rowid, _)| *rowid)
                .zip(batch.vectors)
                .collect();
            if let Err(e) = self.store.attach_vectors(&batch.model_id, &pairs) {
                warn!("could not attach vectors: {e}");
                break;
            }
            attached += pairs.len();

            // The chain may have advanced to a fallback mid-backfill; track
            // its model so the pending query converges.
            if batch.model_id != model_id {
                model_id = batch.model_id;
            }
        }

        if attached > 0 {
            debug!(attached, "pending embeddings backfilled");
        }
        attached
    }

    // -----------------------------------------------------------------------
    // Corpus discovery
    // -----------------------------------------------------------------------

    /// Walk the configured roots and return stored-relative paths of all
    /// indexable files, deterministic order, first root wins on collision.
    fn discover(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for root in &self.roots {
            if !root.path.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&root.path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if !matches_pattern(root, &name) {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&root.path)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .to_string();
                if seen.insert(rel.clone()) {
                    found.push(rel);
                }
            }
        }
        found
    }

    /// Resolve a stored relative path back to its file and source tag.
    fn resolve_abs(&self, rel: &str) -> Option<(PathBuf, SourceTag)> {
        for root in &self.roots {
            let candidate = root.path.join(rel);
            if candidate.is_file() {
                return Some((candidate, root.source));
            }
        }
        None
    }

    fn to_rel(&self, path: &str) -> String {
        let p = std::path::Path::new(path);
        if p.is_absolute() {
            for root in &self.roots {
                if let Ok(rel) = p.strip_prefix(&root.path) {
                    return rel.to_string_lossy().to_string();
                }
            }
        }
        path.to_string()
    }

    fn set_state(&self, rel: &str, state: FileState) {
        self.states
            .entry(rel.to_string())
            .and_modify(|e| {
                e.state = state;
                if state != FileState::Dirty {
                    e.due = None;
                }
            })
            .or_insert(FileEntry { state, due: None });
    }
}

fn matches_pattern(root: &IndexRoot, file_name: &str) -> bool {
    match &root.pattern {
        Some(suffix) => file_name.ends_with(suffix),
        None => file_name.ends_with(".md") || file_name.ends_with(".markdown"),
    }
}
