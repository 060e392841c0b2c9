pub mod schema;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use ndarray::ArrayView1;
use parking_lot::Mutex;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache::EmbeddingCache;
use crate::config::SourceTag;
use crate::error::MemoryError;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A chunk ready for insertion, before it has a rowid or a vector.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// Deterministic identity key derived from provenance; see
    /// [`chunk_identity`].
    pub identity: String,
    pub path: String,
    pub source: SourceTag,
    pub text: String,
    pub start_line: u32,
    pub end_line: u32,
    pub token_count: u32,
}

/// A chunk row as stored in the index.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub rowid: i64,
    pub identity: String,
    pub path: String,
    pub source: SourceTag,
    pub text: String,
    pub start_line: u32,
    pub end_line: u32,
    pub model_id: Option<String>,
}

/// Per-source-tag counters for the diagnostics surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceCounts {
    pub source: SourceTag,
    pub files: u64,
    pub chunks: u64,
    pub embedded_chunks: u64,
}

/// Deterministic chunk identity: a function of provenance only
/// (`source|path|start-end`), so re-chunking identical content upserts the
/// same rows and repeated indexing is a no-op.
pub fn chunk_identity(source: SourceTag, path: &str, start_line: u32, end_line: u32) -> String {
    let digest = Sha256::digest(format!("{source}|{path}|{start_line}-{end_line}").as_bytes());
    hex::encode(&digest[..8])
}

// ---------------------------------------------------------------------------
// Embedding blobs
// ---------------------------------------------------------------------------

/// Encode a vector as little-endian f64 bytes for BLOB storage.
pub(crate) fn encode_embedding(vector: &[f64]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 8);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

/// Decode a stored BLOB back into a vector. A blob whose length is not a
/// multiple of 8 violates the dense-index invariant.
pub(crate) fn decode_embedding(blob: &[u8]) -> Result<Vec<f64>, MemoryError> {
    if blob.len() % 8 != 0 {
        return Err(MemoryError::IndexCorrupt(format!(
            "embedding blob length {} is not a multiple of 8",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

fn cosine_distance(a: &[f64], b: &[f64]) -> f64 {
    let av = ArrayView1::from(a);
    let bv = ArrayView1::from(b);
    let dot = av.dot(&bv);
    let norm_a = av.dot(&av).sqrt();
    let norm_b = bv.dot(&bv).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

// ---------------------------------------------------------------------------
// IndexStore
// ---------------------------------------------------------------------------

/// Durable dual index for one agent: chunk table, dense vector entries and
/// FTS5 lexical entries, all in one SQLite file.
///
/// Writes are serialized behind the connection mutex and run inside
/// transactions, so readers observe either the pre- or post-state of an
/// upsert, never a chunk present in one sub-index but not the other. The
/// sync engine is the only corpus writer; searchers only read.
#[derive(Clone)]
pub struct IndexStore {
    db: Arc<Mutex<Connection>>,
}

impl IndexStore {
    /// Open (or create) the index file at `path` and apply migrations.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        schema::run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory index for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// The embedding cache living in this index's database file.
    pub fn embedding_cache(&self, enabled: bool) -> EmbeddingCache {
        EmbeddingCache::new(self.db.clone(), enabled)
    }

    // -----------------------------------------------------------------------
    // Corpus writes (sync engine only)
    // -----------------------------------------------------------------------

    /// Replace the indexed content of one file: evicts chunks whose identity
    /// no longer exists, upserts all current chunks, and records the file's
    /// content hash — in a single transaction. Returns the chunk rowids in
    /// input order.
    ///
    /// Upserting an identity whose text is unchanged keeps its embedding;
    /// changed text clears the vector so the chunk drops out of vector
    /// queries until re-embedded.
    pub fn upsert_chunks(
        &self,
        path: &str,
        source: SourceTag,
        content_hash: &str,
        records: &[ChunkRecord],
    ) -> Result<Vec<i64>, MemoryError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO files (path, source, hash, indexed_at, chunk_count)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET
                source = excluded.source,
                hash = excluded.hash,
                indexed_at = excluded.indexed_at,
                chunk_count = excluded.chunk_count",
            rusqlite::params![
                path,
                source.as_str(),
                content_hash,
                Utc::now().to_rfc3339(),
                records.len() as i64,
            ],
        )?;
        let file_id: i64 =
            tx.query_row("SELECT id FROM files WHERE path = ?1", [path], |r| r.get(0))?;

        // Stale-chunk eviction: anything previously stored for this path
        // that no new chunk identity covers.
        let keep: HashSet<&str> = records.iter().map(|r| r.identity.as_str()).collect();
        let stale: Vec<String> = {
            let mut stmt = tx.prepare("SELECT identity FROM chunks WHERE path = ?1")?;
            let rows = stmt.query_map([path], |r| r.get::<_, String>(0))?;
            rows.filter_map(|r| r.ok())
                .filter(|id| !keep.contains(id.as_str()))
                .collect()
        };
        for identity in &stale {
            tx.execute("DELETE FROM chunks WHERE identity = ?1", [identity])?;
        }

        let mut rowids = Vec::with_capacity(records.len());
        for record in records {
            tx.execute(
                "INSERT INTO chunks
                    (file_id, identity, path, source, text, start_line, end_line, token_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(identity) DO UPDATE SET
                    file_id = excluded.file_id,
                    text = excluded.text,
                    start_line = excluded.start_line,
                    end_line = excluded.end_line,
                    token_count = excluded.token_count,
                    model_id = CASE WHEN chunks.text = excluded.text
                                    THEN chunks.model_id ELSE NULL END,
                    embedding = CASE WHEN chunks.text = excluded.text
                                     THEN chunks.embedding ELSE NULL END",
                rusqlite::params![
                    file_id,
                    record.identity,
                    record.path,
                    record.source.as_str(),
                    record.text,
                    record.start_line,
                    record.end_line,
                    record.token_count,
                ],
            )?;
            let rowid: i64 = tx.query_row(
                "SELECT id FROM chunks WHERE identity = ?1",
                [&record.identity],
                |r| r.get(0),
            )?;
            rowids.push(rowid);
        }

        tx.commit()?;
        debug!(path, upserted = records.len(), evicted = stale.len(), "chunks upserted");
        Ok(rowids)
    }

    /// Attach embedding vectors to chunk rows in one transaction.
    pub fn attach_vectors(
        &self,
        model_id: &str,
        vectors: &[(i64, Vec<f64>)],
    ) -> Result<(), MemoryError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        for (rowid, vector) in vectors {
            tx.execute(
                "UPDATE chunks SET model_id = ?1, embedding = ?2 WHERE id = ?3",
                rusqlite::params![model_id, encode_embedding(vector), rowid],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove every chunk whose provenance path matches, plus the file row.
    /// Used when a source file disappears or is excluded from configuration.
    pub fn delete_by_path(&self, path: &str) -> Result<usize, MemoryError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM chunks WHERE path = ?1", [path])?;
        tx.execute("DELETE FROM files WHERE path = ?1", [path])?;
        tx.commit()?;
        debug!(path, removed, "chunks deleted by path");
        Ok(removed)
    }

    /// Drop all corpus-derived rows. The rebuild path after an
    /// [`MemoryError::IndexCorrupt`]; the embedding cache is preserved.
    pub fn rebuild(&self) -> Result<(), MemoryError> {
        let conn = self.db.lock();
        schema::clear_corpus_tables(&conn)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Brute-force cosine scan over embeddings of `model_id`, restricted to
    /// `sources`. Returns `(rowid, cosine_distance)` ascending (closer
    /// first), truncated to `limit`. Rows embedded under a different model
    /// or not yet embedded are excluded, never silently mixed.
    pub fn vector_query(
        &self,
        query: &[f64],
        model_id: &str,
        sources: &[SourceTag],
        limit: u32,
    ) -> Result<Vec<(i64, f64)>, MemoryError> {
        if sources.is_empty() || query.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT id, embedding FROM chunks
             WHERE model_id = ?1 AND embedding IS NOT NULL AND source IN ({})",
            source_list(sources)
        );

        let mut scored: Vec<(i64, f64)> = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([model_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;

            let mut scored = Vec::new();
            for row in rows {
                let (rowid, blob) = row?;
                let vector = decode_embedding(&blob)?;
                if vector.len() != query.len() {
                    return Err(MemoryError::IndexCorrupt(format!(
                        "chunk {rowid} has {} dims under model {model_id}, query has {}",
                        vector.len(),
                        query.len()
                    )));
                }
                scored.push((rowid, cosine_distance(query, &vector)));
            }
            scored
        };

        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit as usize);
        Ok(scored)
    }

    /// FTS5 BM25 query restricted to `sources`. Returns `(rowid, rank)`
    /// with rank ascending — lower (more negative) is more relevant.
    pub fn lexical_query(
        &self,
        match_expr: &str,
        sources: &[SourceTag],
        limit: u32,
    ) -> Result<Vec<(i64, f64)>, MemoryError> {
        if sources.is_empty() || match_expr.trim().is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT c.id, bm25(chunks_fts) AS rank
             FROM chunks_fts
             JOIN chunks c ON c.id = chunks_fts.rowid
             WHERE chunks_fts MATCH ?1 AND c.source IN ({})
             ORDER BY rank ASC
             LIMIT ?2",
            source_list(sources)
        );

        let conn = self.db.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![match_expr, limit], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Load one chunk row.
    pub fn get_chunk(&self, rowid: i64) -> Result<Option<StoredChunk>, MemoryError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, identity, path, source, text, start_line, end_line, model_id
             FROM chunks WHERE id = ?1",
        )?;
        let mut rows = stmt.query([rowid])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_chunk_row(row)?)),
            None => Ok(None),
        }
    }

    /// Load chunk rows for a candidate list. A rowid with no chunk row
    /// violates the sub-index invariant (the FTS index referenced it) and
    /// reports the index as corrupt.
    pub fn get_chunks(&self, rowids: &[i64]) -> Result<Vec<StoredChunk>, MemoryError> {
        let mut chunks = Vec::with_capacity(rowids.len());
        for &rowid in rowids {
            match self.get_chunk(rowid)? {
                Some(chunk) => chunks.push(chunk),
                None => {
                    return Err(MemoryError::IndexCorrupt(format!(
                        "sub-index entry references missing chunk row {rowid}"
                    )))
                }
            }
        }
        Ok(chunks)
    }

    // -----------------------------------------------------------------------
    // File bookkeeping (sync engine)
    // -----------------------------------------------------------------------

    /// The content hash recorded when `path` was last indexed.
    pub fn file_hash(&self, path: &str) -> Result<Option<String>, MemoryError> {
        let conn = self.db.lock();
        let hash = conn
            .query_row("SELECT hash FROM files WHERE path = ?1", [path], |r| {
                r.get::<_, String>(0)
            })
            .ok();
        Ok(hash)
    }

    /// All indexed paths with their source tags, for deletion sweeps.
    pub fn indexed_files(&self) -> Result<Vec<(String, SourceTag)>, MemoryError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT path, source FROM files ORDER BY path")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut files = Vec::new();
        for row in rows {
            let (path, source) = row?;
            files.push((path, parse_tag(&source)?));
        }
        Ok(files)
    }

    /// Chunks not yet embedded under `model_id` (never embedded, or embedded
    /// under a different model). Backfilled by the sync engine.
    pub fn pending_chunks(
        &self,
        model_id: &str,
        limit: u32,
    ) -> Result<Vec<(i64, String)>, MemoryError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, text FROM chunks
             WHERE embedding IS NULL OR model_id IS NULL OR model_id != ?1
             ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![model_id, limit], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Per-source file/chunk/embedded counters.
    pub fn counts(&self) -> Result<Vec<SourceCounts>, MemoryError> {
        let conn = self.db.lock();
        let mut by_source: std::collections::BTreeMap<String, SourceCounts> = Default::default();

        let mut stmt = conn.prepare("SELECT source, COUNT(*) FROM files GROUP BY source")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (source, files) = row?;
            let tag = parse_tag(&source)?;
            by_source
                .entry(source)
                .or_insert_with(|| SourceCounts {
                    source: tag,
                    files: 0,
                    chunks: 0,
                    embedded_chunks: 0,
                })
                .files = files as u64;
        }

        let mut stmt = conn.prepare(
            "SELECT source, COUNT(*), COALESCE(SUM(embedding IS NOT NULL), 0)
             FROM chunks GROUP BY source",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (source, chunks, embedded) = row?;
            let tag = parse_tag(&source)?;
            let entry = by_source.entry(source).or_insert_with(|| SourceCounts {
                source: tag,
                files: 0,
                chunks: 0,
                embedded_chunks: 0,
            });
            entry.chunks = chunks as u64;
            entry.embedded_chunks = embedded as u64;
        }

        Ok(by_source.into_values().collect())
    }
}

fn read_chunk_row(row: &rusqlite::Row<'_>) -> Result<StoredChunk, MemoryError> {
    let source: String = row.get(3)?;
    Ok(StoredChunk {
        rowid: row.get(0)?,
        identity: row.get(1)?,
        path: row.get(2)?,
        source: parse_tag(&source)?,
        text: row.get(4)?,
        start_line: row.get(5)?,
        end_line: row.get(6)?,
        model_id: row.get(7)?,
    })
}

fn parse_tag(source: &str) -> Result<SourceTag, MemoryError> {
    source
        .parse()
        .map_err(|_| MemoryError::IndexCorrupt(format!("unknown source tag '{source}'")))
}

/// SQL literal list for a source filter. Tag names come from the enum, so
/// inlining them is safe.
fn source_list(sources: &[SourceTag]) -> String {
    sources
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, source: SourceTag, text: &str, start: u32, end: u32) -> ChunkRecord {
        ChunkRecord {
            identity: chunk_identity(source, path, start, end),
            path: path.to_string(),
            source,
            text: text.to_string(),
            start_line: start,
            end_line: end,
            token_count: text.split_whitespace().count() as u32,
        }
    }

    fn fts_count(store: &IndexStore) -> i64 {
        let conn = store.db.lock();
        conn.query_row("SELECT COUNT(*) FROM chunks_fts", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn upsert_is_idempotent() {
        let store = IndexStore::open_in_memory().unwrap();
        let records = vec![
            record("notes.md", SourceTag::Memory, "alpha beta", 1, 2),
            record("notes.md", SourceTag::Memory, "gamma delta", 3, 4),
        ];

        let first = store
            .upsert_chunks("notes.md", SourceTag::Memory, "h1", &records)
            .unwrap();
        let second = store
            .upsert_chunks("notes.md", SourceTag::Memory, "h1", &records)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(fts_count(&store), 2);
        let counts = store.counts().unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].chunks, 2);
        assert_eq!(counts[0].files, 1);
    }

    #[test]
    fn unchanged_text_keeps_embedding_changed_text_clears_it() {
        let store = IndexStore::open_in_memory().unwrap();
        let records = vec![record("notes.md", SourceTag::Memory, "alpha beta", 1, 2)];
        let rowids = store
            .upsert_chunks("notes.md", SourceTag::Memory, "h1", &records)
            .unwrap();
        store
            .attach_vectors("openai:test", &[(rowids[0], vec![1.0, 0.0])])
            .unwrap();

        // Re-upsert with identical text: vector survives.
        store
            .upsert_chunks("notes.md", SourceTag::Memory, "h1", &records)
            .unwrap();
        let hits = store
            .vector_query(&[1.0, 0.0], "openai:test", &[SourceTag::Memory], 10)
            .unwrap();
        assert_eq!(hits.len(), 1);

        // Changed text under the same identity: vector cleared.
        let changed = vec![record("notes.md", SourceTag::Memory, "alpha CHANGED", 1, 2)];
        store
            .upsert_chunks("notes.md", SourceTag::Memory, "h2", &changed)
            .unwrap();
        let hits = store
            .vector_query(&[1.0, 0.0], "openai:test", &[SourceTag::Memory], 10)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn stale_chunks_evicted_on_reindex() {
        let store = IndexStore::open_in_memory().unwrap();
        let v1 = vec![
            record("notes.md", SourceTag::Memory, "alpha beta", 1, 2),
            record("notes.md", SourceTag::Memory, "gamma delta", 3, 4),
        ];
        store
            .upsert_chunks("notes.md", SourceTag::Memory, "h1", &v1)
            .unwrap();

        // File shrank to one chunk; the other identity must disappear from
        // both sub-indexes.
        let v2 = vec![record("notes.md", SourceTag::Memory, "alpha beta", 1, 2)];
        store
            .upsert_chunks("notes.md", SourceTag::Memory, "h2", &v2)
            .unwrap();

        assert_eq!(store.counts().unwrap()[0].chunks, 1);
        assert_eq!(fts_count(&store), 1);
        let hits = store
            .lexical_query("\"gamma\"", &[SourceTag::Memory], 10)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn lexical_query_ranks_matches() {
        let store = IndexStore::open_in_memory().unwrap();
        let records = vec![
            record(
                "a.md",
                SourceTag::Memory,
                "token expiration policy for JWT auth",
                1,
                1,
            ),
            record("a.md", SourceTag::Memory, "unrelated grocery list", 2, 2),
        ];
        store
            .upsert_chunks("a.md", SourceTag::Memory, "h", &records)
            .unwrap();

        let hits = store
            .lexical_query("\"token\" AND \"expiration\"", &[SourceTag::Memory], 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        // FTS5 bm25 rank: lower is better, matches are negative.
        assert!(hits[0].1 < 0.0);
    }

    #[test]
    fn vector_query_orders_by_distance_and_isolates_models() {
        let store = IndexStore::open_in_memory().unwrap();
        let records = vec![
            record("a.md", SourceTag::Memory, "one", 1, 1),
            record("a.md", SourceTag::Memory, "two", 2, 2),
            record("a.md", SourceTag::Memory, "three", 3, 3),
        ];
        let ids = store
            .upsert_chunks("a.md", SourceTag::Memory, "h", &records)
            .unwrap();

        store
            .attach_vectors(
                "model-a",
                &[(ids[0], vec![1.0, 0.0]), (ids[1], vec![0.0, 1.0])],
            )
            .unwrap();
        store
            .attach_vectors("model-b", &[(ids[2], vec![1.0, 0.0])])
            .unwrap();

        let hits = store
            .vector_query(&[1.0, 0.0], "model-a", &[SourceTag::Memory], 10)
            .unwrap();
        // Only model-a rows; unembedded/model-b rows never mix in.
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, ids[0]);
        assert!(hits[0].1 < hits[1].1);
        assert!(hits[0].1.abs() < 1e-9);
    }

    #[test]
    fn vector_query_rejects_mismatched_dimensions() {
        let store = IndexStore::open_in_memory().unwrap();
        let records = vec![record("a.md", SourceTag::Memory, "one", 1, 1)];
        let ids = store
            .upsert_chunks("a.md", SourceTag::Memory, "h", &records)
            .unwrap();
        store
            .attach_vectors("model-a", &[(ids[0], vec![1.0, 0.0, 0.0])])
            .unwrap();

        let err = store
            .vector_query(&[1.0, 0.0], "model-a", &[SourceTag::Memory], 10)
            .unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn delete_by_path_clears_both_sub_indexes() {
        let store = IndexStore::open_in_memory().unwrap();
        let records = vec![record("gone.md", SourceTag::Memory, "alpha beta", 1, 1)];
        let ids = store
            .upsert_chunks("gone.md", SourceTag::Memory, "h", &records)
            .unwrap();
        store
            .attach_vectors("m", &[(ids[0], vec![1.0])])
            .unwrap();

        let removed = store.delete_by_path("gone.md").unwrap();
        assert_eq!(removed, 1);
        assert_eq!(fts_count(&store), 0);
        assert!(store
            .vector_query(&[1.0], "m", &[SourceTag::Memory], 10)
            .unwrap()
            .is_empty());
        assert!(store.file_hash("gone.md").unwrap().is_none());
    }

    #[test]
    fn source_filter_restricts_queries() {
        let store = IndexStore::open_in_memory().unwrap();
        store
            .upsert_chunks(
                "notes.md",
                SourceTag::Memory,
                "h1",
                &[record("notes.md", SourceTag::Memory, "shared words", 1, 1)],
            )
            .unwrap();
        store
            .upsert_chunks(
                "chat.md",
                SourceTag::Sessions,
                "h2",
                &[record("chat.md", SourceTag::Sessions, "shared words", 1, 1)],
            )
            .unwrap();

        let memory_only = store
            .lexical_query("\"shared\"", &[SourceTag::Memory], 10)
            .unwrap();
        assert_eq!(memory_only.len(), 1);
        let both = store
            .lexical_query(
                "\"shared\"",
                &[SourceTag::Memory, SourceTag::Sessions],
                10,
            )
            .unwrap();
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn pending_chunks_tracks_unembedded_and_model_switches() {
        let store = IndexStore::open_in_memory().unwrap();
        let records = vec![
            record("a.md", SourceTag::Memory, "one", 1, 1),
            record("a.md", SourceTag::Memory, "two", 2, 2),
        ];
        let ids = store
            .upsert_chunks("a.md", SourceTag::Memory, "h", &records)
            .unwrap();

        assert_eq!(store.pending_chunks("model-a", 10).unwrap().len(), 2);
        store
            .attach_vectors("model-a", &[(ids[0], vec![1.0])])
            .unwrap();
        assert_eq!(store.pending_chunks("model-a", 10).unwrap().len(), 1);
        // Switching the active model makes previously embedded rows pending
        // again.
        assert_eq!(store.pending_chunks("model-b", 10).unwrap().len(), 2);
    }

    #[test]
    fn embedding_blob_round_trip() {
        let vector = vec![0.5, -1.25, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&vector)).unwrap(), vector);
        assert!(decode_embedding(&[1, 2, 3]).unwrap_err().is_corrupt());
    }

    #[test]
    fn chunk_identity_is_deterministic_and_provenance_scoped() {
        let a = chunk_identity(SourceTag::Memory, "x.md", 1, 5);
        assert_eq!(a, chunk_identity(SourceTag::Memory, "x.md", 1, 5));
        assert_ne!(a, chunk_identity(SourceTag::Memory, "x.md", 1, 6));
        assert_ne!(a, chunk_identity(SourceTag::Sessions, "x.md", 1, 5));
        assert_ne!(a, chunk_identity(SourceTag::Memory, "y.md", 1, 5));
    }
}
