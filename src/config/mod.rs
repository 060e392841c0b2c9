use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Source tags
// ============================================================================

/// Provenance category for indexed content. Queries are restricted to an
/// allowed subset of tags; `sessions` content is only indexed and searched
/// when explicitly enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    /// Long-lived markdown notes.
    Memory,
    /// Exported conversation transcripts.
    Sessions,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Memory => "memory",
            SourceTag::Sessions => "sessions",
        }
    }
}

impl std::str::FromStr for SourceTag {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "sessions" => Ok(Self::Sessions),
            _ => Err(format!("invalid source tag: {s}")),
        }
    }
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Provider selection
// ============================================================================

/// Which embedding backend to use. `Auto` probes candidates in a fixed
/// priority order (local model availability, then each cloud provider's
/// credential presence) and pins the first that passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderSelection {
    #[default]
    Auto,
    Openai,
    Gemini,
    Local,
}

// ============================================================================
// Index roots
// ============================================================================

/// One indexable directory root with its provenance tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRoot {
    /// Directory scanned for source files.
    pub path: PathBuf,
    /// Tag attached to every chunk indexed from this root.
    #[serde(default = "default_memory_tag")]
    pub source: SourceTag,
    /// Optional filename suffix filter (e.g. `.session.md`). Defaults to
    /// markdown files.
    pub pattern: Option<String>,
}

impl IndexRoot {
    pub fn new(path: impl Into<PathBuf>, source: SourceTag) -> Self {
        Self {
            path: path.into(),
            source,
            pattern: None,
        }
    }
}

fn default_memory_tag() -> SourceTag {
    SourceTag::Memory
}

// ============================================================================
// Provider credentials / endpoints
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpenAiEmbeddingConfig {
    pub api_key: Option<String>,
    /// Base URL for OpenAI-compatible endpoints. Default
    /// `https://api.openai.com/v1`.
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GeminiEmbeddingConfig {
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocalEmbeddingConfig {
    /// Directory holding downloaded model weights. Default
    /// `<state_dir>/models`.
    pub model_cache_dir: Option<PathBuf>,
    /// Whether the local provider may download weights on first use. When
    /// false, the provider is only considered available if the cache
    /// directory already exists and is non-empty.
    pub allow_download: Option<bool>,
}

// ============================================================================
// Tuning sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChunkingConfig {
    /// Target chunk size in (whitespace-heuristic) tokens. Default 400.
    pub tokens: Option<u32>,
    /// Overlap between consecutive chunks, in tokens. Default 80.
    pub overlap: Option<u32>,
}

impl ChunkingConfig {
    pub fn tokens(&self) -> u32 {
        self.tokens.unwrap_or(400)
    }
    pub fn overlap(&self) -> u32 {
        self.overlap.unwrap_or(80)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Debounce window for file-change notifications. Default 1500ms;
    /// rapid successive writes to one file coalesce into a single re-index.
    pub debounce_ms: Option<u64>,
    /// Optional periodic full-corpus sweep interval. Off when unset.
    pub interval_ms: Option<u64>,
    /// Run a full sweep when the manager is first opened. Default true.
    pub on_boot: Option<bool>,
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.unwrap_or(1500))
    }
    pub fn interval(&self) -> Option<Duration> {
        self.interval_ms.map(Duration::from_millis)
    }
    pub fn on_boot(&self) -> bool {
        self.on_boot.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueryConfig {
    /// Maximum results returned. Default 6.
    pub max_results: Option<u32>,
    /// Combined-score floor below which results are dropped. Default 0.35.
    pub min_score: Option<f64>,
    /// Weight of the vector channel in score fusion. Default 0.7.
    pub vector_weight: Option<f64>,
    /// Weight of the lexical channel in score fusion. Default 0.3.
    pub text_weight: Option<f64>,
    /// Candidate pool per channel is `max_results * candidate_multiplier`.
    /// Default 4.
    pub candidate_multiplier: Option<u32>,
}

impl QueryConfig {
    pub fn max_results(&self) -> u32 {
        self.max_results.unwrap_or(6)
    }
    pub fn min_score(&self) -> f64 {
        self.min_score.unwrap_or(0.35)
    }
    pub fn vector_weight(&self) -> f64 {
        self.vector_weight.unwrap_or(0.7)
    }
    pub fn text_weight(&self) -> f64 {
        self.text_weight.unwrap_or(0.3)
    }
    pub fn candidate_multiplier(&self) -> u32 {
        self.candidate_multiplier.unwrap_or(4)
    }
    pub fn candidate_pool(&self, max_results: u32) -> u32 {
        max_results.max(1).saturating_mul(self.candidate_multiplier().max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Whether the content-addressed embedding cache is consulted. Default
    /// true.
    pub enabled: Option<bool>,
}

impl CacheConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    /// Texts per provider request. Default 32.
    pub size: Option<u32>,
    /// In-flight sub-batches per embed call. Default 2.
    pub concurrency: Option<u32>,
    /// Per-request timeout. A timed-out call counts as provider-unavailable
    /// for fallback purposes. Default 30s.
    pub timeout_ms: Option<u64>,
}

impl BatchConfig {
    pub fn size(&self) -> usize {
        self.size.unwrap_or(32).max(1) as usize
    }
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(2).max(1) as usize
    }
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(30_000))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Directory holding the per-agent index files. Default
    /// `<state_dir>/memory`.
    pub path: Option<PathBuf>,
}

// ============================================================================
// Top-level configuration
// ============================================================================

/// Complete configuration consumed by the memory engine. Supplied by the
/// host's configuration layer; every field is optional with a documented
/// default so a `MemoryConfig::default()` engine works out of the box
/// (lexical-only until a provider becomes available).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    /// Master switch. Default true.
    pub enabled: Option<bool>,
    /// Source tags a query may touch. Default `[memory]`; add `sessions`
    /// to search transcript exports.
    #[serde(default)]
    pub sources: Vec<SourceTag>,
    /// Embedding backend selection. Default `auto`.
    #[serde(default)]
    pub provider: ProviderSelection,
    /// Backend to append as the last fallback candidate when `provider`
    /// pins a specific backend.
    pub fallback: Option<ProviderSelection>,
    /// Embedding model override (provider-specific default otherwise).
    pub model: Option<String>,
    /// Indexable roots, each with a provenance tag.
    #[serde(default)]
    pub paths: Vec<IndexRoot>,
    /// Additional `memory`-tagged roots (host convenience mirror of
    /// `paths`).
    #[serde(default)]
    pub extra_paths: Vec<PathBuf>,
    /// State directory for index files and model cache. Default
    /// `~/.mnemo`.
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub openai: OpenAiEmbeddingConfig,
    #[serde(default)]
    pub gemini: GeminiEmbeddingConfig,
    #[serde(default)]
    pub local: LocalEmbeddingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

impl MemoryConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Source tags enabled for indexing and search. `sessions` must be
    /// opted into explicitly.
    pub fn sources(&self) -> Vec<SourceTag> {
        if self.sources.is_empty() {
            vec![SourceTag::Memory]
        } else {
            self.sources.clone()
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".mnemo")
        })
    }

    /// Directory holding per-agent index databases.
    pub fn store_dir(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("memory"))
    }

    /// Path of the index database for one agent identity.
    pub fn index_path(&self, agent_id: &str) -> PathBuf {
        self.store_dir().join(format!("{agent_id}.db"))
    }

    pub fn model_cache_dir(&self) -> PathBuf {
        self.local
            .model_cache_dir
            .clone()
            .unwrap_or_else(|| self.state_dir().join("models"))
    }

    /// All indexable roots: `paths` plus `extra_paths` (tagged `memory`),
    /// filtered to the enabled source tags.
    pub fn index_roots(&self) -> Vec<IndexRoot> {
        let enabled = self.sources();
        let mut roots = self.paths.clone();
        roots.extend(
            self.extra_paths
                .iter()
                .map(|p| IndexRoot::new(p.clone(), SourceTag::Memory)),
        );
        roots.retain(|r| enabled.contains(&r.source));
        roots
    }

    /// Whether `path` (relative, as stored in the index) resolves to a file
    /// under one of the configured roots.
    pub fn resolve_in_roots(&self, path: &Path) -> Option<PathBuf> {
        for root in self.index_roots() {
            let candidate = root.path.join(path);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_documented_values() {
        let cfg = MemoryConfig::default();
        assert!(cfg.enabled());
        assert_eq!(cfg.sources(), vec![SourceTag::Memory]);
        assert_eq!(cfg.chunking.tokens(), 400);
        assert_eq!(cfg.chunking.overlap(), 80);
        assert_eq!(cfg.query.max_results(), 6);
        assert!((cfg.query.min_score() - 0.35).abs() < f64::EPSILON);
        assert!((cfg.query.vector_weight() - 0.7).abs() < f64::EPSILON);
        assert!((cfg.query.text_weight() - 0.3).abs() < f64::EPSILON);
        assert_eq!(cfg.query.candidate_pool(6), 24);
        assert_eq!(cfg.sync.debounce(), Duration::from_millis(1500));
        assert_eq!(cfg.batch.concurrency(), 2);
    }

    #[test]
    fn sessions_root_excluded_unless_enabled() {
        let mut cfg = MemoryConfig::default();
        cfg.paths = vec![
            IndexRoot::new("/tmp/notes", SourceTag::Memory),
            IndexRoot::new("/tmp/sessions", SourceTag::Sessions),
        ];
        assert_eq!(cfg.index_roots().len(), 1);

        cfg.sources = vec![SourceTag::Memory, SourceTag::Sessions];
        assert_eq!(cfg.index_roots().len(), 2);
    }

    #[test]
    fn camel_case_round_trip() {
        let json = r#"{
            "provider": "auto",
            "sources": ["memory", "sessions"],
            "query": { "maxResults": 3, "minScore": 0.5 },
            "sync": { "debounceMs": 250 }
        }"#;
        let cfg: MemoryConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.query.max_results(), 3);
        assert_eq!(cfg.sync.debounce(), Duration::from_millis(250));
        assert_eq!(cfg.sources().len(), 2);
    }

    #[test]
    fn source_tag_parse() {
        assert_eq!("memory".parse::<SourceTag>().unwrap(), SourceTag::Memory);
        assert!("bogus".parse::<SourceTag>().is_err());
    }
}
