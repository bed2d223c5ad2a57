//! Typed facade over the indexer worker.
//!
//! Callers never see the command channel: every operation is a method that
//! builds a command envelope, stamps it with the current session and a
//! fresh correlation id, and awaits the matching reply variant. User-
//! initiated calls ride the high-priority lane; background indexing rides
//! the low lane so interactive queries pre-empt it.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{
    EngineStatus, FileState, FileUpdate, NeighborHit, NeighborOptions, SearchResponse, Subgraph,
};
use crate::worker::{Command, Envelope, ReplyPayload, UpdateOutcome, WorkerChannels};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Priority {
    High,
    Low,
}

#[derive(Clone)]
pub struct EngineHandle {
    high_tx: mpsc::UnboundedSender<Envelope>,
    low_tx: mpsc::UnboundedSender<Envelope>,
    session: Arc<AtomicU64>,
    correlation: Arc<AtomicU64>,
}

impl EngineHandle {
    pub fn new(channels: WorkerChannels) -> Self {
        Self {
            high_tx: channels.high_tx,
            low_tx: channels.low_tx,
            session: channels.session,
            correlation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    async fn call(&self, command: Command, priority: Priority) -> EngineResult<ReplyPayload> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let correlation_id = self.correlation.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = Envelope {
            correlation_id,
            session_id: self.session.load(Ordering::SeqCst),
            command,
            reply: reply_tx,
        };
        let sender = match priority {
            Priority::High => &self.high_tx,
            Priority::Low => &self.low_tx,
        };
        sender
            .send(envelope)
            .map_err(|_| EngineError::Fatal("worker terminated".into()))?;
        let reply = reply_rx
            .await
            .map_err(|_| EngineError::Fatal("worker dropped the reply channel".into()))?;
        debug_assert_eq!(reply.correlation_id, correlation_id);
        Ok(reply.payload)
    }

    // -- queries ------------------------------------------------------------

    /// Reflex mode: keyword-dominant, low latency, no graph expansion.
    pub async fn keyword_search(&self, query: &str, k: usize) -> EngineResult<SearchResponse> {
        match self
            .call(
                Command::KeywordSearch {
                    query: query.to_string(),
                    k,
                },
                Priority::High,
            )
            .await?
        {
            ReplyPayload::Search(result) => result,
            other => Err(unexpected(other)),
        }
    }

    /// Deep hybrid search with graph expansion.
    pub async fn search(&self, query: &str, k: usize) -> EngineResult<SearchResponse> {
        self.search_cancellable(query, k, 0.0, CancellationToken::new())
            .await
    }

    pub async fn search_cancellable(
        &self,
        query: &str,
        k: usize,
        min_score: f32,
        cancel: CancellationToken,
    ) -> EngineResult<SearchResponse> {
        match self
            .call(
                Command::Search {
                    query: query.to_string(),
                    k,
                    min_score,
                    cancel,
                },
                Priority::High,
            )
            .await?
        {
            ReplyPayload::Search(result) => result,
            other => Err(unexpected(other)),
        }
    }

    /// Graph-enhanced similar-to-seed.
    pub async fn similar(
        &self,
        path: &str,
        k: usize,
        min_score: f32,
    ) -> EngineResult<SearchResponse> {
        match self
            .call(
                Command::Similar {
                    path: path.to_string(),
                    k,
                    min_score,
                },
                Priority::High,
            )
            .await?
        {
            ReplyPayload::Search(result) => result,
            other => Err(unexpected(other)),
        }
    }

    pub async fn neighbors(
        &self,
        path: &str,
        options: NeighborOptions,
    ) -> EngineResult<Vec<NeighborHit>> {
        match self
            .call(
                Command::Neighbors {
                    path: path.to_string(),
                    options,
                },
                Priority::High,
            )
            .await?
        {
            ReplyPayload::Neighbors(result) => result,
            other => Err(unexpected(other)),
        }
    }

    pub async fn subgraph(
        &self,
        center: &str,
        update_id: u64,
        positions: Option<HashMap<String, (f32, f32)>>,
    ) -> EngineResult<Subgraph> {
        match self
            .call(
                Command::Subgraph {
                    center: center.to_string(),
                    update_id,
                    positions,
                },
                Priority::High,
            )
            .await?
        {
            ReplyPayload::Subgraph(result) => result,
            other => Err(unexpected(other)),
        }
    }

    pub async fn file_states(&self) -> EngineResult<HashMap<String, FileState>> {
        match self.call(Command::FileStates, Priority::High).await? {
            ReplyPayload::FileStates(result) => result,
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&self) -> EngineResult<EngineStatus> {
        match self.call(Command::Status, Priority::High).await? {
            ReplyPayload::Status(result) => *result,
            other => Err(unexpected(other)),
        }
    }

    // -- mutations ----------------------------------------------------------

    /// Caller-initiated update: rides the high lane so a query issued
    /// afterwards observes it.
    pub async fn update_files(&self, updates: Vec<FileUpdate>) -> EngineResult<UpdateOutcome> {
        self.update_with_priority(updates, Priority::High).await
    }

    /// Background (scan/watcher) update: pre-empted by interactive work.
    pub async fn update_files_background(
        &self,
        updates: Vec<FileUpdate>,
    ) -> EngineResult<UpdateOutcome> {
        self.update_with_priority(updates, Priority::Low).await
    }

    async fn update_with_priority(
        &self,
        updates: Vec<FileUpdate>,
        priority: Priority,
    ) -> EngineResult<UpdateOutcome> {
        match self.call(Command::UpdateFiles { updates }, priority).await? {
            ReplyPayload::Update(result) => result,
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_file(&self, path: &str) -> EngineResult<()> {
        match self
            .call(
                Command::DeleteFile {
                    path: path.to_string(),
                },
                Priority::High,
            )
            .await?
        {
            ReplyPayload::Ack(result) => result,
            other => Err(unexpected(other)),
        }
    }

    pub async fn rename_file(&self, old_path: &str, new_path: &str) -> EngineResult<()> {
        match self
            .call(
                Command::RenameFile {
                    old_path: old_path.to_string(),
                    new_path: new_path.to_string(),
                },
                Priority::High,
            )
            .await?
        {
            ReplyPayload::Ack(result) => result,
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_config(&self, config: EngineConfig) -> EngineResult<()> {
        match self
            .call(Command::UpdateConfig { config }, Priority::High)
            .await?
        {
            ReplyPayload::Ack(result) => result,
            other => Err(unexpected(other)),
        }
    }

    pub async fn commit_config(&self) -> EngineResult<()> {
        match self.call(Command::CommitConfig, Priority::High).await? {
            ReplyPayload::Ack(result) => result,
            other => Err(unexpected(other)),
        }
    }

    pub async fn prune_orphans(&self, current_paths: Vec<String>) -> EngineResult<()> {
        match self
            .call(Command::PruneOrphans { current_paths }, Priority::Low)
            .await?
        {
            ReplyPayload::Ack(result) => result,
            other => Err(unexpected(other)),
        }
    }

    /// Persists the current shard and returns its encoded bytes.
    pub async fn save_index(&self) -> EngineResult<Vec<u8>> {
        match self.call(Command::SaveIndex, Priority::High).await? {
            ReplyPayload::SavedIndex(result) => result,
            other => Err(unexpected(other)),
        }
    }

    pub async fn load_index(&self, bytes: Vec<u8>) -> EngineResult<()> {
        match self
            .call(Command::LoadIndex { bytes }, Priority::High)
            .await?
        {
            ReplyPayload::Ack(result) => result,
            other => Err(unexpected(other)),
        }
    }

    pub async fn full_reset(&self) -> EngineResult<()> {
        match self.call(Command::FullReset, Priority::High).await? {
            ReplyPayload::Ack(result) => result,
            other => Err(unexpected(other)),
        }
    }

    pub async fn shutdown(&self) -> EngineResult<()> {
        match self.call(Command::Shutdown, Priority::High).await? {
            ReplyPayload::Ack(result) => result,
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(payload: ReplyPayload) -> EngineError {
    EngineError::Fatal(format!("reply payload mismatch: {payload:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::embedder::testing::HashEmbedder;
    use crate::embedder::Embedder;
    use crate::fsadapter::{FsAdapter, VaultFs};
    use crate::model::NeighborMode;
    use crate::persist::PersistenceManager;
    use crate::state::ServerEvent;
    use crate::storage::StorageProvider;
    use crate::worker::IndexerWorker;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    struct Harness {
        _dir: TempDir,
        fs: Arc<VaultFs>,
        handle: EngineHandle,
        app_config: AppConfig,
        _event_tx: broadcast::Sender<ServerEvent>,
    }

    fn app_config(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::from_env();
        config.vault_dir = dir.path().join("vault").to_string_lossy().to_string();
        config.data_dir = dir.path().join("vault/.notegraph").to_string_lossy().to_string();
        config.hot_cache_dir = dir.path().join("hot").to_string_lossy().to_string();
        config.engine.embedding_model_id = "test/hash-embedder".to_string();
        config.engine.embedding_dimension = 32;
        config
    }

    fn spawn_engine(dir: TempDir, app_config: AppConfig) -> Harness {
        std::fs::create_dir_all(&app_config.vault_dir).unwrap();
        let fs = Arc::new(VaultFs::new(&app_config.vault_dir));
        let storage = StorageProvider::open(
            std::path::Path::new(&app_config.data_dir),
            std::path::Path::new(&app_config.hot_cache_dir),
        )
        .unwrap();
        let persistence = Arc::new(PersistenceManager::new(storage));
        let (event_tx, _) = broadcast::channel(256);
        let factory: crate::worker::EmbedderFactory = Arc::new(|config| {
            Arc::new(HashEmbedder::with_model_id(
                config.embedding_dimension,
                &config.embedding_model_id,
            )) as Arc<dyn Embedder>
        });
        let channels = IndexerWorker::spawn(
            &app_config,
            factory,
            persistence,
            fs.clone(),
            event_tx.clone(),
        )
        .unwrap();
        Harness {
            _dir: dir,
            fs,
            handle: EngineHandle::new(channels),
            app_config,
            _event_tx: event_tx,
        }
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let config = app_config(&dir);
        spawn_engine(dir, config)
    }

    fn update(path: &str, content: &str) -> FileUpdate {
        FileUpdate {
            path: path.to_string(),
            content: content.to_string(),
            mtime: 1000,
            size: content.len() as u64,
            title: None,
            links: None,
        }
    }

    #[tokio::test]
    async fn new_file_appears_in_file_states_and_similar_is_empty() {
        let h = harness();
        let states = h.handle.file_states().await.unwrap();
        assert!(states.is_empty());

        h.fs.write("notes/a.md", b"Hello").unwrap();
        h.handle
            .update_files(vec![update("notes/a.md", "Hello")])
            .await
            .unwrap();

        let states = h.handle.file_states().await.unwrap();
        let state = states.get("notes/a.md").expect("indexed file state");
        assert!(state.size > 0);

        // Sole document in the vault: nothing is similar to it.
        let similar = h.handle.similar("notes/a.md", 10, 0.0).await.unwrap();
        assert!(similar.hits.is_empty());
    }

    #[tokio::test]
    async fn update_is_idempotent() {
        let h = harness();
        h.fs.write("a.md", b"some body of text here").unwrap();
        h.handle
            .update_files(vec![update("a.md", "some body of text here")])
            .await
            .unwrap();
        let before = h.handle.status().await.unwrap();
        h.handle
            .update_files(vec![update("a.md", "some body of text here")])
            .await
            .unwrap();
        let after = h.handle.status().await.unwrap();
        assert_eq!(before.documents, after.documents);
        assert_eq!(before.chunks, after.chunks);
        assert_eq!(before.vector_rows, after.vector_rows);
        assert_eq!(before.edges, after.edges);
    }

    #[tokio::test]
    async fn delete_then_update_equals_update() {
        let h = harness();
        h.fs.write("a.md", b"alpha body").unwrap();
        h.handle
            .update_files(vec![update("a.md", "alpha body")])
            .await
            .unwrap();
        h.handle.delete_file("a.md").await.unwrap();
        h.handle
            .update_files(vec![update("a.md", "alpha body")])
            .await
            .unwrap();

        let states = h.handle.file_states().await.unwrap();
        assert!(states.contains_key("a.md"));
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.documents, 1);
    }

    #[tokio::test]
    async fn path_traversal_is_refused_without_state_change() {
        let h = harness();
        let err = h
            .handle
            .update_files(vec![update("Allowed/../Secret/stolen.md", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.documents, 0);
        assert_eq!(status.nodes, 0);
    }

    #[tokio::test]
    async fn empty_query_returns_empty_not_error() {
        let h = harness();
        let reflex = h.handle.keyword_search("", 10).await.unwrap();
        assert!(reflex.hits.is_empty());
        let deep = h.handle.search("   ", 10).await.unwrap();
        assert!(deep.hits.is_empty());
    }

    #[tokio::test]
    async fn keyword_search_hydrates_excerpt_from_live_file() {
        let h = harness();
        let content = "The retrieval engine blends vectors with a link graph.";
        h.fs.write("engine.md", content.as_bytes()).unwrap();
        h.handle
            .update_files(vec![update("engine.md", content)])
            .await
            .unwrap();

        let response = h.handle.keyword_search("retrieval engine", 5).await.unwrap();
        assert_eq!(response.hits.len(), 1);
        let hit = &response.hits[0];
        assert_eq!(hit.path, "engine.md");
        assert!(hit.excerpt.contains("retrieval engine"));
        assert_eq!(hit.hydration, crate::model::HydrationStatus::Exact);
    }

    #[tokio::test]
    async fn linked_notes_show_up_as_neighbors_and_similar() {
        let h = harness();
        let a = "Notes about the graph engine.\n\nSee [[b]] for more.";
        let b = "More notes about the graph engine internals.";
        h.fs.write("a.md", a.as_bytes()).unwrap();
        h.fs.write("b.md", b.as_bytes()).unwrap();
        h.handle
            .update_files(vec![update("a.md", a), update("b.md", b)])
            .await
            .unwrap();

        let neighbors = h
            .handle
            .neighbors("a.md", NeighborOptions::default())
            .await
            .unwrap();
        assert!(neighbors.iter().any(|n| n.path == "b.md"));

        let similar = h.handle.similar("a.md", 5, 0.0).await.unwrap();
        assert!(similar.hits.iter().any(|hit| hit.path == "b.md"));
    }

    #[tokio::test]
    async fn ontology_siblings_via_facade() {
        let h = harness();
        let journal = "Daily log. Related: [[Ontology/Project FooBar]]";
        let flux = "Component notes. Related: [[Ontology/Project FooBar]]";
        h.fs.write("Journal.md", journal.as_bytes()).unwrap();
        h.fs.write("FluxComp.md", flux.as_bytes()).unwrap();
        h.handle
            .update_files(vec![update("Journal.md", journal), update("FluxComp.md", flux)])
            .await
            .unwrap();

        let options = NeighborOptions {
            mode: NeighborMode::Ontology,
            ..Default::default()
        };
        let hits = h.handle.neighbors("Journal.md", options).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "FluxComp.md");
        assert!((hits[0].score - crate::config::SIBLING_DECAY).abs() < 1e-6);
    }

    #[tokio::test]
    async fn rename_roundtrip_is_identity_on_node_sets() {
        let h = harness();
        let content = "body of the renamed note";
        h.fs.write("a.md", content.as_bytes()).unwrap();
        h.handle
            .update_files(vec![update("a.md", content)])
            .await
            .unwrap();

        // rename a -> b on disk, then tell the worker.
        h.fs.write("b.md", content.as_bytes()).unwrap();
        h.fs.remove("a.md").unwrap();
        h.handle.rename_file("a.md", "b.md").await.unwrap();
        let states = h.handle.file_states().await.unwrap();
        assert!(!states.contains_key("a.md"));
        assert!(states.contains_key("b.md"));

        // and back.
        h.fs.write("a.md", content.as_bytes()).unwrap();
        h.fs.remove("b.md").unwrap();
        h.handle.rename_file("b.md", "a.md").await.unwrap();
        let states = h.handle.file_states().await.unwrap();
        assert!(states.contains_key("a.md"));
        assert!(!states.contains_key("b.md"));
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.documents, 1);
    }

    #[tokio::test]
    async fn save_then_reload_preserves_state() {
        let dir = TempDir::new().unwrap();
        let config = app_config(&dir);
        let h = spawn_engine(dir, config.clone());
        let content = "persistent knowledge base entry";
        h.fs.write("keep.md", content.as_bytes()).unwrap();
        h.handle
            .update_files(vec![update("keep.md", content)])
            .await
            .unwrap();
        h.handle.save_index().await.unwrap();
        h.handle.shutdown().await.unwrap();

        // A fresh worker over the same data dir adopts the shard.
        let h2 = spawn_engine(h._dir, config);
        let states = h2.handle.file_states().await.unwrap();
        assert!(states.contains_key("keep.md"));
        let status = h2.handle.status().await.unwrap();
        assert_eq!(status.documents, 1);
        assert!(status.vector_rows > 0);
    }

    #[tokio::test]
    async fn model_switch_starts_clean_with_new_dimension() {
        let h = harness();
        h.fs.write("a.md", b"note body").unwrap();
        h.handle
            .update_files(vec![update("a.md", "note body")])
            .await
            .unwrap();
        h.handle.save_index().await.unwrap();
        let session_before = h.handle.session_id();

        let mut new_config = h.app_config.engine.clone();
        new_config.embedding_model_id = "test/other-model".to_string();
        new_config.embedding_dimension = 16;
        h.handle.update_config(new_config).await.unwrap();
        h.handle.commit_config().await.unwrap();

        assert!(h.handle.session_id() > session_before);
        let states = h.handle.file_states().await.unwrap();
        assert!(states.is_empty());

        // A delta scan re-fills the index under the new identity, and the
        // persisted shard carries the new dimension.
        h.handle
            .update_files(vec![update("a.md", "note body")])
            .await
            .unwrap();
        let bytes = h.handle.save_index().await.unwrap();
        let state = PersistenceManager::decode(&bytes).unwrap();
        assert_eq!(state.embedding_dimension, 16);
        assert_eq!(state.embedding_model, "test/other-model");
    }

    #[tokio::test]
    async fn full_reset_bumps_session_and_clears_state() {
        let h = harness();
        h.fs.write("a.md", b"body").unwrap();
        h.handle
            .update_files(vec![update("a.md", "body")])
            .await
            .unwrap();
        let session_before = h.handle.session_id();
        h.handle.full_reset().await.unwrap();
        assert!(h.handle.session_id() > session_before);
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.documents, 0);
        assert_eq!(status.vector_rows, 0);
        assert_eq!(status.nodes, 0);
    }

    #[tokio::test]
    async fn prune_orphans_removes_missing_paths() {
        let h = harness();
        for path in ["a.md", "b.md"] {
            h.fs.write(path, b"body text").unwrap();
        }
        h.handle
            .update_files(vec![update("a.md", "body text"), update("b.md", "body text")])
            .await
            .unwrap();
        h.handle
            .prune_orphans(vec!["a.md".to_string()])
            .await
            .unwrap();
        let states = h.handle.file_states().await.unwrap();
        assert!(states.contains_key("a.md"));
        assert!(!states.contains_key("b.md"));
    }

    #[tokio::test]
    async fn empty_body_indexes_without_chunks() {
        let h = harness();
        h.fs.write("empty.md", b"").unwrap();
        h.handle
            .update_files(vec![update("empty.md", "")])
            .await
            .unwrap();
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.documents, 1);
        assert_eq!(status.vector_rows, 0);
    }
}
