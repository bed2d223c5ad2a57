use serde::{Deserialize, Serialize};

/// Maximum allowed length for search queries (characters).
pub const MAX_SEARCH_QUERY_LENGTH: usize = 1000;

/// Noise floor shared by every retrieval signal: a candidate whose strongest
/// signal falls below this is discarded before composite scoring, regardless
/// of the caller's min-score cut-off. Also serves as the neighbour floor in
/// graph-enhanced similar-to-seed.
pub const VECTOR_MIN_RELEVANCE: f32 = 0.35;

/// Score multiplier for 2-hop siblings reached through a topic node in
/// ontology-mode neighbor queries.
pub const SIBLING_DECAY: f32 = 0.8;

/// Bonus applied when a candidate is surfaced by both the vector and the
/// keyword retriever (deep mode), or by both the vector scan and the link
/// graph (similar-to-seed).
pub const HYBRID_BOOST: f32 = 0.15;

/// Bonus applied when a query token matches the document title.
pub const TITLE_MATCH_BOOST: f32 = 0.10;

// Composite weights. Linear, so the composite is monotone in each signal.
pub const WEIGHT_SIMILARITY: f32 = 0.60;
pub const WEIGHT_CENTRALITY: f32 = 0.15;
pub const WEIGHT_ACTIVATION: f32 = 0.25;

/// A pooled candidate becomes an expansion seed only if its score reaches
/// both this fraction of the top score and ABSOLUTE_MIN_EXPANSION_SCORE.
pub const EXPANSION_THRESHOLD: f32 = 0.6;
pub const ABSOLUTE_MIN_EXPANSION_SCORE: f32 = 0.5;
pub const MAX_EXPANSION_SEEDS: usize = 5;
pub const MAX_NEIGHBORS_PER_NODE: usize = 8;

/// Keyword (reflex) scoring: short queries get a flat fuzzy base score,
/// long queries accumulate per-token hits up to the cap.
pub const FUZZY_SCORE_CAP: f32 = 0.9;
pub const FUZZY_HIT_MULTIPLIER: f32 = 0.15;
pub const SHORT_QUERY_BASE_SCORE: f32 = 0.55;
pub const SHORT_QUERY_TOKEN_LIMIT: usize = 4;

/// Per-hop damping applied while spreading activation from seeds.
pub const ACTIVATION_DECAY: f32 = 0.6;

/// Semantic edges are refreshed per document update from its nearest
/// neighbours in vector space.
pub const SEMANTIC_EDGE_K: usize = 4;
pub const SEMANTIC_EDGE_MIN_SIMILARITY: f32 = 0.6;

/// Reflex vector scans visit at most LATENCY_BUDGET_FACTOR * k rows
/// sequentially; rows beyond the budget are sampled by stride.
pub const LATENCY_BUDGET_FACTOR: usize = 64;

/// Overshoot factors for deep-mode candidate pooling.
pub const DEEP_VECTOR_OVERSHOOT: usize = 4;
pub const DEEP_KEYWORD_OVERSHOOT: usize = 2;

/// Bytes scanned on each side of a stored chunk range when the anchor hash
/// no longer matches at the recorded offsets.
pub const HYDRATION_SEARCH_RANGE: usize = 1024;

/// Anchor hashes cover at most this many leading bytes of a chunk.
pub const ANCHOR_HASH_PREFIX_BYTES: usize = 4096;

/// Token estimate when the embedder cannot count: ceil(chars / this).
pub const CHARS_PER_TOKEN_ESTIMATE: usize = 4;

/// Embedding queue back-off: after this many consecutive errors the worker
/// stops pulling embedding work for BACKOFF_DELAY_MS.
pub const MAX_ERRORS_BEFORE_BACKOFF: u32 = 5;
pub const BACKOFF_DELAY_MS: u64 = 10_000;

/// Per-request embedding timeout.
pub const EMBED_TIMEOUT_MS: u64 = 60_000;

/// Saves are coalesced by an idle timer; a dirty index is flushed once no
/// mutation has arrived for this long. Shutdown forces a flush.
pub const SAVE_IDLE_SECS: u64 = 30;

/// Shard blob schema version. Blobs without a version field are legacy.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    pub vault_dir: String,
    pub data_dir: String,
    pub hot_cache_dir: String,
    pub global_idle_debounce_ms: u64,
    pub active_file_debounce_ms: u64,
    pub update_batch_size: usize,
    pub enable_file_watcher: bool,
    pub engine: EngineConfig,
}

/// Runtime-tunable engine settings. Staged by `update_config` and applied
/// atomically by `commit_config`; a model/dimension change swaps the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub embedding_model_id: String,
    pub embedding_dimension: usize,
    pub max_chunk_chars: usize,
    pub overlap_ratio: f32,
    /// Folder whose topic notes mediate ontology-mode sibling discovery.
    pub ontology_folder: String,
    /// Vault-relative folder prefixes excluded from indexing entirely.
    pub excluded_folders: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            embedding_model_id: "Qwen/Qwen3-Embedding-0.6B".to_string(),
            embedding_dimension: 1024,
            max_chunk_chars: 2000,
            overlap_ratio: 0.1,
            ontology_folder: "Ontology".to_string(),
            excluded_folders: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// The frozen identity tuple that keys persisted shards.
    pub fn model_identity(&self) -> (String, usize) {
        (self.embedding_model_id.clone(), self.embedding_dimension)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("NOTEGRAPH_PORT").unwrap_or_else(|_| "9731".to_string());

        let vault_dir = std::env::var("NOTEGRAPH_VAULT_DIR").unwrap_or_else(|_| ".".to_string());

        // Cold tier lives inside the vault so it travels with the notes.
        let data_dir = std::env::var("NOTEGRAPH_DATA_DIR")
            .unwrap_or_else(|_| format!("{}/.notegraph", vault_dir.trim_end_matches('/')));

        let hot_cache_dir = std::env::var("NOTEGRAPH_HOT_CACHE_DIR").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("notegraph-backend").to_string_lossy().to_string())
                .unwrap_or_else(|| ".notegraph-cache".to_string())
        });

        let mut engine = EngineConfig::default();
        if let Ok(model) = std::env::var("NOTEGRAPH_EMBEDDING_MODEL") {
            engine.embedding_model_id = model;
        }
        if let Some(dim) = std::env::var("NOTEGRAPH_EMBEDDING_DIM")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            engine.embedding_dimension = dim;
        }
        if let Ok(folder) = std::env::var("NOTEGRAPH_ONTOLOGY_FOLDER") {
            engine.ontology_folder = folder;
        }

        Self {
            listen_addr: format!("127.0.0.1:{}", port),
            vault_dir,
            data_dir,
            hot_cache_dir,
            global_idle_debounce_ms: std::env::var("NOTEGRAPH_IDLE_DEBOUNCE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
            active_file_debounce_ms: std::env::var("NOTEGRAPH_ACTIVE_DEBOUNCE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30_000),
            update_batch_size: std::env::var("NOTEGRAPH_UPDATE_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
            enable_file_watcher: std::env::var("NOTEGRAPH_ENABLE_WATCHER")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            engine,
        }
    }
}
