use std::path::PathBuf;

/// Errors surfaced by the memory engine's public contract.
///
/// Provider-level failures (network, credentials, rate limits) never appear
/// here — they are absorbed by the embedding fallback chain, which degrades
/// queries to lexical-only search instead. Only total query failure, snippet
/// path resolution failure, and store-level faults reach callers.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Neither the vector nor the lexical channel produced a result set.
    #[error("memory search unavailable: {0}")]
    SearchUnavailable(String),

    /// Snippet path is missing or outside the configured index roots.
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A sub-index invariant was violated (e.g. a dense entry whose blob
    /// length does not match the model dimensionality, or an FTS row with no
    /// chunk). Fatal for the index; the manager responds by rebuilding.
    #[error("memory index corrupt: {0}")]
    IndexCorrupt(String),

    /// Underlying SQLite failure.
    #[error("memory store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Filesystem failure while reading corpus or state files.
    #[error("memory io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MemoryError {
    /// Whether this error should trigger the index rebuild path.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, MemoryError::IndexCorrupt(_))
    }
}
