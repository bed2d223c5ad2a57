use serde::{Deserialize, Serialize};

/// Per-document metadata tracked by the worker. Identity is the
/// vault-relative path; a rename is a delete plus a create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub path: String,
    pub mtime: u64,
    pub size: u64,
    pub content_hash: String,
    pub title: Option<String>,
    pub headers: Vec<String>,
    pub tags: Vec<String>,
    pub token_count: usize,
}

/// A contiguous byte range of a document's sanitised body, independently
/// embedded. Offsets are relative to the original file so hydration can
/// re-locate the bytes without re-deriving the frontmatter split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub start: usize,
    pub end: usize,
    pub anchor_hash: u32,
    pub token_count: usize,
}

impl ChunkMeta {
    pub fn chunk_id(path: &str, index: usize) -> String {
        format!("{path}#{index}")
    }
}

/// Snapshot row returned by `file_states()`; the orchestrator diffs this
/// against the live vault to plan a delta scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub mtime: u64,
    pub size: u64,
    pub content_hash: String,
}

/// One incoming document mutation. `links` is an optional pre-extracted
/// override; when absent the parser's scanner output is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileUpdate {
    pub path: String,
    pub content: String,
    pub mtime: u64,
    pub size: u64,
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<String>>,
}

/// A scored chunk reference as produced by the scorer, before hydration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredRef {
    pub path: String,
    pub start: usize,
    pub end: usize,
    pub anchor_hash: u32,
    pub score: f32,
}

/// Hydration outcome for a single result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HydrationStatus {
    /// Anchor verified at the stored offsets.
    Exact,
    /// Anchor found at shifted offsets inside the search window.
    Healed,
    /// No matching window; excerpt is a placeholder and the document has
    /// been queued for re-indexing.
    Drifted,
}

/// A fully hydrated search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: String,
    pub title: Option<String>,
    pub score: f32,
    pub excerpt: String,
    pub start: usize,
    pub end: usize,
    pub hydration: HydrationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub query_time_ms: u64,
}

/// A neighbor row from the graph store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborHit {
    pub path: String,
    pub score: f32,
    pub edge_type: String,
    /// Present in ontology mode: the topic node the sibling was reached
    /// through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborDirection {
    Inbound,
    Outbound,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborMode {
    Simple,
    Ontology,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborOptions {
    pub direction: NeighborDirection,
    pub mode: NeighborMode,
    pub limit: usize,
}

impl Default for NeighborOptions {
    fn default() -> Self {
        Self {
            direction: NeighborDirection::Both,
            mode: NeighborMode::Simple,
            limit: 32,
        }
    }
}

/// Layout-ready subgraph for visualisation callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subgraph {
    pub update_id: u64,
    pub nodes: Vec<SubgraphNode>,
    pub edges: Vec<SubgraphEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphNode {
    pub id: String,
    pub label: String,
    pub kind: String,
    pub centrality: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<(f32, f32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphEdge {
    pub from: String,
    pub to: String,
    pub edge_type: String,
    pub weight: f32,
}

/// Engine status snapshot for the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub phase: String,
    pub session_id: u64,
    pub documents: usize,
    pub chunks: usize,
    pub vector_rows: usize,
    pub nodes: usize,
    pub edges: usize,
    pub embedding_model: String,
    pub embedding_dimension: usize,
}
