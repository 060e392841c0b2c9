use anyhow::Result;
use rusqlite::Connection;
use tracing::debug;

/// Current schema version.  Increment when adding new migrations.
const SCHEMA_VERSION: u32 = 1;

/// Apply all pending migrations to `conn`.
///
/// Migrations are idempotent — tables are created with `IF NOT EXISTS` and the
/// `meta` table tracks which version has been applied so we only run new ones.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    // WAL for concurrent readers; enforced foreign keys so chunk rows can
    // never outlive their file row.
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    // ------------------------------------------------------------------
    // meta — tracks schema version and arbitrary key/value pairs.
    // ------------------------------------------------------------------
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;

    let current_version = get_schema_version(conn);

    if current_version >= SCHEMA_VERSION {
        debug!(version = current_version, "index schema up to date");
        return Ok(());
    }

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    debug!(version = SCHEMA_VERSION, "index schema migrated");
    Ok(())
}

// ---------------------------------------------------------------------------
// v1 — initial tables
// ---------------------------------------------------------------------------

fn migrate_v1(conn: &Connection) -> Result<()> {
    // ------------------------------------------------------------------
    // files — indexed source files, their content hashes and source tags.
    // ------------------------------------------------------------------
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS files (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            path         TEXT    NOT NULL UNIQUE,
            source       TEXT    NOT NULL,
            hash         TEXT    NOT NULL,
            indexed_at   TEXT    NOT NULL,
            chunk_count  INTEGER NOT NULL DEFAULT 0
        );",
    )?;

    // ------------------------------------------------------------------
    // chunks — retrieval units. `identity` is the deterministic key
    // derived from provenance (source|path|lines), so re-indexing
    // unchanged content upserts in place. The integer id doubles as the
    // FTS5 content rowid. `embedding` is NULL until the chunk is embedded;
    // such rows are lexically searchable but excluded from vector queries.
    // ------------------------------------------------------------------
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chunks (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id     INTEGER NOT NULL REFERENCES files(id),
            identity    TEXT    NOT NULL UNIQUE,
            path        TEXT    NOT NULL,
            source      TEXT    NOT NULL,
            text        TEXT    NOT NULL,
            start_line  INTEGER NOT NULL,
            end_line    INTEGER NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0,
            model_id    TEXT,
            embedding   BLOB
        );",
    )?;

    conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_chunks_file_id ON chunks(file_id);")?;
    conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path);")?;
    conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_chunks_model ON chunks(model_id);")?;

    // ------------------------------------------------------------------
    // embedding_cache — content-addressed vectors keyed by provider,
    // model, credential fingerprint and content hash, so unchanged
    // content never re-triggers a network embedding call.
    // ------------------------------------------------------------------
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS embedding_cache (
            provider        TEXT NOT NULL,
            model           TEXT NOT NULL,
            key_fingerprint TEXT NOT NULL,
            content_hash    TEXT NOT NULL,
            dimensions      INTEGER NOT NULL,
            embedding       BLOB NOT NULL,
            created_at      TEXT NOT NULL,
            PRIMARY KEY (provider, model, key_fingerprint, content_hash)
        );",
    )?;

    // ------------------------------------------------------------------
    // chunks_fts — FTS5 virtual table for BM25 lexical search.
    // ------------------------------------------------------------------
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            text,
            content='chunks',
            content_rowid='id',
            tokenize='porter unicode61'
        );",
    )?;

    // Triggers keep the FTS index in sync with the chunks table, so a chunk
    // can never exist in one sub-index without the other.
    conn.execute_batch(
        "CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
            INSERT INTO chunks_fts(rowid, text) VALUES (new.id, new.text);
        END;",
    )?;
    conn.execute_batch(
        "CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.id, old.text);
        END;",
    )?;
    conn.execute_batch(
        "CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE OF text ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.id, old.text);
            INSERT INTO chunks_fts(rowid, text) VALUES (new.id, new.text);
        END;",
    )?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn get_schema_version(conn: &Connection) -> u32 {
    conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version'",
        [],
        |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<u32>().unwrap_or(0))
        },
    )
    .unwrap_or(0)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
        [version.to_string()],
    )?;
    Ok(())
}

/// Drop all corpus-derived rows. Used by the rebuild path after an
/// [`crate::error::MemoryError::IndexCorrupt`]; the embedding cache survives
/// so the rebuild re-embeds from cache where possible.
pub fn clear_corpus_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("DELETE FROM chunks;")?;
    conn.execute_batch("DELETE FROM files;")?;
    // Rebuild the FTS shadow tables from (now empty) content.
    conn.execute_batch("INSERT INTO chunks_fts(chunks_fts) VALUES ('rebuild');")?;
    Ok(())
}
