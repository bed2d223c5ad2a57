//! Versioned, model-sharded persistence of engine state.
//!
//! Each `(embedding model, dimension)` pair owns one MessagePack shard in
//! the cold tier, `graph-state-<identity>.msgpack`, plus a best-effort hot
//! cache entry. Loading never crosses shards: a blob whose identity tuple
//! differs from the active one is simply not offered to the worker.

use crate::config::SCHEMA_VERSION;
use crate::error::{EngineError, EngineResult};
use crate::storage::StorageProvider;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// Cold-tier store name for shard blobs.
const STATE_STORE: &str = "state";
/// Pre-sharding file name probed for migration.
const LEGACY_FILE: &str = "graph-state.msgpack";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub schema_version: u32,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub nodes: Vec<PersistedNode>,
    pub edges: Vec<PersistedEdge>,
    pub chunks: Vec<PersistedChunk>,
    /// Packed row-major f32 embeddings; row i belongs to `chunks[i]`.
    pub vectors: Vec<f32>,
    /// Case-folded alias -> canonical path.
    pub aliases: Vec<(String, String)>,
}

/// File nodes carry the document attributes; topic nodes leave them unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedNode {
    pub path: String,
    pub kind: String,
    #[serde(default)]
    pub mtime: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub token_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedEdge {
    pub from: String,
    pub to: String,
    pub edge_type: String,
    pub weight: f32,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedChunk {
    pub path: String,
    pub start: usize,
    pub end: usize,
    pub anchor_hash: u32,
    pub token_count: usize,
}

/// Minimal shape probed during legacy migration: the blob must carry the
/// `{embeddingModel, embeddingDimension, nodes}` triple to qualify.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyProbe {
    embedding_model: String,
    embedding_dimension: usize,
    #[allow(dead_code)]
    nodes: Vec<serde_json::Value>,
}

/// Sanitised identity string shared by the shard file and the hot key.
pub fn model_identity_string(model_id: &str, dim: usize) -> String {
    let sanitised: String = model_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.update(b":");
    hasher.update(dim.to_string().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{sanitised}-dim{dim}-{}", &digest[..8])
}

pub fn shard_file_name(model_id: &str, dim: usize) -> String {
    format!("graph-state-{}.msgpack", model_identity_string(model_id, dim))
}

fn hot_key(model_id: &str, dim: usize) -> String {
    format!("orama_index_buffer_{}", model_identity_string(model_id, dim))
}

pub struct PersistenceManager {
    storage: StorageProvider,
}

impl PersistenceManager {
    pub fn new(storage: StorageProvider) -> Self {
        Self { storage }
    }

    pub fn encode(state: &PersistedState) -> EngineResult<Vec<u8>> {
        rmp_serde::to_vec_named(state).map_err(|e| EngineError::Decode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> EngineResult<PersistedState> {
        let state: PersistedState =
            rmp_serde::from_slice(bytes).map_err(|e| EngineError::Decode(e.to_string()))?;
        if state.vectors.len() != state.chunks.len() * state.embedding_dimension {
            return Err(EngineError::Decode(format!(
                "vector buffer length {} does not cover {} chunks at dimension {}",
                state.vectors.len(),
                state.chunks.len(),
                state.embedding_dimension
            )));
        }
        Ok(state)
    }

    /// Cold tier first, then best-effort hot tier. The rename inside the
    /// cold put is the commit point.
    pub fn save_state(&self, state: &PersistedState) -> EngineResult<()> {
        let bytes = Self::encode(state)?;
        self.save_bytes(&bytes, &state.embedding_model, state.embedding_dimension)
    }

    pub fn save_bytes(&self, bytes: &[u8], model_id: &str, dim: usize) -> EngineResult<()> {
        let file = shard_file_name(model_id, dim);
        self.storage.put(STATE_STORE, &file, bytes)?;
        self.storage
            .hot_put(STATE_STORE, &hot_key(model_id, dim), bytes);
        info!(
            shard = %file,
            bytes = bytes.len(),
            "Persisted engine state"
        );
        Ok(())
    }

    /// Probes the shard for `(model, dim)`; on a miss, probes the legacy
    /// single-path file and migrates it when it carries the identity triple.
    /// Returns None when the caller should start with an empty index.
    pub fn load_state(&self, model_id: &str, dim: usize) -> EngineResult<Option<PersistedState>> {
        let file = shard_file_name(model_id, dim);
        if let Some(bytes) = self.storage.get_cold(STATE_STORE, &file)? {
            match Self::decode(&bytes) {
                Ok(state) => return Ok(Some(state)),
                Err(e) => {
                    warn!(shard = %file, "Discarding undecodable shard: {e}");
                    self.storage.delete(STATE_STORE, &file)?;
                    return Ok(None);
                }
            }
        }
        self.migrate_legacy(model_id, dim)
    }

    fn migrate_legacy(
        &self,
        model_id: &str,
        dim: usize,
    ) -> EngineResult<Option<PersistedState>> {
        let Some(bytes) = self.storage.get_cold(STATE_STORE, LEGACY_FILE)? else {
            return Ok(None);
        };

        let probe: Result<LegacyProbe, _> = rmp_serde::from_slice(&bytes);
        if probe.is_err() {
            // Malformed legacy blob: remove it and start clean, writing no
            // new shard.
            warn!("Removing malformed legacy state file");
            self.storage.delete(STATE_STORE, LEGACY_FILE)?;
            return Ok(None);
        }

        match Self::decode(&bytes) {
            Ok(state) => {
                let owned_by_caller =
                    state.embedding_model == model_id && state.embedding_dimension == dim;
                info!(
                    model = %state.embedding_model,
                    dim = state.embedding_dimension,
                    adopted = owned_by_caller,
                    "Migrating legacy state file into a model shard"
                );
                // Re-home under the blob's own identity either way.
                self.save_bytes(&bytes, &state.embedding_model, state.embedding_dimension)?;
                self.storage.delete(STATE_STORE, LEGACY_FILE)?;
                Ok(owned_by_caller.then_some(state))
            }
            Err(e) => {
                warn!("Legacy state carries the identity triple but fails to decode, removing: {e}");
                self.storage.delete(STATE_STORE, LEGACY_FILE)?;
                Ok(None)
            }
        }
    }

    pub fn delete_state(&self, file_name: &str) -> EngineResult<()> {
        self.storage.delete(STATE_STORE, file_name)?;
        // The hot buffer rides under its own key; drop it so a future load
        // cannot resurrect a deleted shard from the cache.
        if let Some(identity) = file_name
            .strip_prefix("graph-state-")
            .and_then(|rest| rest.strip_suffix(".msgpack"))
        {
            self.storage
                .hot_delete(STATE_STORE, &format!("orama_index_buffer_{identity}"));
        }
        Ok(())
    }

    pub fn list_shards(&self) -> EngineResult<Vec<String>> {
        Ok(self
            .storage
            .list_keys(STATE_STORE)?
            .into_iter()
            .filter(|k| k.starts_with("graph-state-") && k.ends_with(".msgpack"))
            .collect())
    }

    pub fn purge_all_data(&self) -> EngineResult<()> {
        self.storage.purge()
    }

    pub fn storage(&self) -> &StorageProvider {
        &self.storage
    }
}

pub fn empty_state(model_id: &str, dim: usize) -> PersistedState {
    PersistedState {
        schema_version: SCHEMA_VERSION,
        embedding_model: model_id.to_string(),
        embedding_dimension: dim,
        nodes: Vec::new(),
        edges: Vec::new(),
        chunks: Vec::new(),
        vectors: Vec::new(),
        aliases: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, PersistenceManager) {
        let dir = TempDir::new().unwrap();
        let storage =
            StorageProvider::open(&dir.path().join("cold"), &dir.path().join("hot")).unwrap();
        (dir, PersistenceManager::new(storage))
    }

    fn sample_state(model: &str, dim: usize) -> PersistedState {
        let mut state = empty_state(model, dim);
        state.nodes.push(PersistedNode {
            path: "notes/a.md".into(),
            kind: "file".into(),
            mtime: 100,
            size: 5,
            content_hash: "abc".into(),
            title: Some("A".into()),
            headers: vec![],
            tags: vec![],
            token_count: 2,
        });
        state.chunks.push(PersistedChunk {
            path: "notes/a.md".into(),
            start: 0,
            end: 5,
            anchor_hash: 42,
            token_count: 2,
        });
        state.vectors = vec![0.5; dim];
        state.aliases.push(("a".into(), "notes/a.md".into()));
        state
    }

    #[test]
    fn save_then_load_is_identity() {
        let (_dir, pm) = manager();
        let state = sample_state("model-a", 4);
        pm.save_state(&state).unwrap();
        let loaded = pm.load_state("model-a", 4).unwrap().unwrap();
        assert_eq!(loaded.nodes.len(), 1);
        assert_eq!(loaded.chunks[0].anchor_hash, 42);
        assert_eq!(loaded.vectors, state.vectors);
        assert_eq!(loaded.aliases, state.aliases);
    }

    #[test]
    fn shards_do_not_cross_models() {
        let (_dir, pm) = manager();
        pm.save_state(&sample_state("model-a", 4)).unwrap();
        assert!(pm.load_state("model-b", 4).unwrap().is_none());
        assert!(pm.load_state("model-a", 8).unwrap().is_none());
    }

    #[test]
    fn identity_string_is_filename_safe() {
        let id = model_identity_string("org/Model:v2", 768);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
        assert!(id.contains("-dim768-"));
    }

    #[test]
    fn legacy_blob_with_triple_is_migrated() {
        let (_dir, pm) = manager();
        let bytes = PersistenceManager::encode(&sample_state("model-a", 4)).unwrap();
        pm.storage.put(STATE_STORE, LEGACY_FILE, &bytes).unwrap();

        let loaded = pm.load_state("model-a", 4).unwrap().unwrap();
        assert_eq!(loaded.embedding_model, "model-a");
        // Legacy file removed, shard written under the new name.
        assert!(pm.storage.get_cold(STATE_STORE, LEGACY_FILE).unwrap().is_none());
        assert!(pm
            .storage
            .get_cold(STATE_STORE, &shard_file_name("model-a", 4))
            .unwrap()
            .is_some());
    }

    #[test]
    fn malformed_legacy_blob_is_deleted_without_new_shard() {
        let (_dir, pm) = manager();
        pm.storage
            .put(STATE_STORE, LEGACY_FILE, b"not msgpack at all")
            .unwrap();

        assert!(pm.load_state("model-a", 4).unwrap().is_none());
        assert!(pm.storage.get_cold(STATE_STORE, LEGACY_FILE).unwrap().is_none());
        assert!(pm.list_shards().unwrap().is_empty());
    }

    #[test]
    fn legacy_blob_for_other_model_is_rehomed_not_adopted() {
        let (_dir, pm) = manager();
        let bytes = PersistenceManager::encode(&sample_state("model-b", 4)).unwrap();
        pm.storage.put(STATE_STORE, LEGACY_FILE, &bytes).unwrap();

        assert!(pm.load_state("model-a", 4).unwrap().is_none());
        // The blob still migrated under its own identity.
        assert!(pm.load_state("model-b", 4).unwrap().is_some());
    }

    #[test]
    fn truncated_vector_buffer_is_rejected() {
        let mut state = sample_state("model-a", 4);
        state.vectors.pop();
        let bytes = rmp_serde::to_vec_named(&state).unwrap();
        assert!(PersistenceManager::decode(&bytes).is_err());
    }

    #[test]
    fn delete_state_is_idempotent() {
        let (_dir, pm) = manager();
        pm.save_state(&sample_state("model-a", 4)).unwrap();
        let file = shard_file_name("model-a", 4);
        pm.delete_state(&file).unwrap();
        pm.delete_state(&file).unwrap();
        assert!(pm.load_state("model-a", 4).unwrap().is_none());
    }
}
