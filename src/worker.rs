//! Indexer worker.
//!
//! Owns every piece of mutable index state: the vector arena, the link
//! graph, the keyword index and the document/chunk tables. All access is
//! funnelled through one command queue pair (high for user-initiated work,
//! low for background indexing) consumed by a single task, which is what
//! makes the single-writer invariant hold by construction.
//!
//! Commands are a closed sum with typed payloads; replies are a closed sum
//! carrying the command's correlation id. Tasks are stamped with the
//! session id they were enqueued under and are dropped, not executed, when
//! a worker swap has bumped the session since.

use crate::config::{
    AppConfig, EngineConfig, BACKOFF_DELAY_MS, DEEP_KEYWORD_OVERSHOOT, DEEP_VECTOR_OVERSHOOT,
    EMBED_TIMEOUT_MS, MAX_ERRORS_BEFORE_BACKOFF, MAX_SEARCH_QUERY_LENGTH, SAVE_IDLE_SECS,
    SEMANTIC_EDGE_K, SEMANTIC_EDGE_MIN_SIMILARITY, SHORT_QUERY_TOKEN_LIMIT,
};
use crate::embedder::{EmbedRole, Embedder};
use crate::error::{EngineError, EngineResult};
use crate::fsadapter::{validate_vault_path, FsAdapter};
use crate::graph::{EdgeSource, EdgeType, GraphStore, NodeKind};
use crate::hydrator;
use crate::keyword::{tokenize, KeywordIndex};
use crate::model::{
    ChunkMeta, DocumentMeta, EngineStatus, FileState, FileUpdate, NeighborHit, NeighborOptions,
    ScoredRef, SearchHit, SearchResponse, Subgraph, SubgraphEdge, SubgraphNode,
};
use crate::parser::{self, LinkSource};
use crate::persist::{
    self, PersistedChunk, PersistedEdge, PersistedNode, PersistedState, PersistenceManager,
};
use crate::scorer::{self, ScoredDoc, ScorerContext};
use crate::state::ServerEvent;
use crate::vector::VectorIndex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Uninit,
    Initializing,
    Ready,
    Swapping,
    Terminated,
}

impl WorkerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerPhase::Uninit => "uninit",
            WorkerPhase::Initializing => "initializing",
            WorkerPhase::Ready => "ready",
            WorkerPhase::Swapping => "swapping",
            WorkerPhase::Terminated => "terminated",
        }
    }
}

/// Every operation the worker understands. Data-only; the reply channel
/// travels in the envelope.
#[derive(Debug)]
pub enum Command {
    KeywordSearch {
        query: String,
        k: usize,
    },
    Search {
        query: String,
        k: usize,
        min_score: f32,
        cancel: CancellationToken,
    },
    Similar {
        path: String,
        k: usize,
        min_score: f32,
    },
    Neighbors {
        path: String,
        options: NeighborOptions,
    },
    Subgraph {
        center: String,
        update_id: u64,
        positions: Option<HashMap<String, (f32, f32)>>,
    },
    FileStates,
    UpdateFiles {
        updates: Vec<FileUpdate>,
    },
    DeleteFile {
        path: String,
    },
    RenameFile {
        old_path: String,
        new_path: String,
    },
    /// Internal: re-read the given paths from disk and re-index them
    /// (drift healing, rename target pickup).
    ReindexPaths {
        paths: Vec<String>,
    },
    UpdateConfig {
        config: EngineConfig,
    },
    CommitConfig,
    PruneOrphans {
        current_paths: Vec<String>,
    },
    SaveIndex,
    LoadIndex {
        bytes: Vec<u8>,
    },
    FullReset,
    Status,
    Shutdown,
}

#[derive(Debug)]
pub struct Envelope {
    pub correlation_id: u64,
    pub session_id: u64,
    pub command: Command,
    pub reply: oneshot::Sender<Reply>,
}

#[derive(Debug)]
pub struct Reply {
    pub correlation_id: u64,
    pub payload: ReplyPayload,
}

#[derive(Debug)]
pub struct UpdateOutcome {
    pub applied: usize,
    /// Paths whose embeddings failed transiently; callers may re-issue.
    pub failed: Vec<String>,
}

#[derive(Debug)]
pub enum ReplyPayload {
    Search(EngineResult<SearchResponse>),
    Neighbors(EngineResult<Vec<NeighborHit>>),
    Subgraph(EngineResult<Subgraph>),
    FileStates(EngineResult<HashMap<String, FileState>>),
    Update(EngineResult<UpdateOutcome>),
    Ack(EngineResult<()>),
    SavedIndex(EngineResult<Vec<u8>>),
    Status(Box<EngineResult<EngineStatus>>),
}

/// Channel halves handed to the `EngineHandle`.
pub struct WorkerChannels {
    pub high_tx: mpsc::UnboundedSender<Envelope>,
    pub low_tx: mpsc::UnboundedSender<Envelope>,
    pub session: Arc<AtomicU64>,
}

pub type EmbedderFactory = Arc<dyn Fn(&EngineConfig) -> Arc<dyn Embedder> + Send + Sync>;

pub struct IndexerWorker {
    phase: WorkerPhase,
    config: EngineConfig,
    staged_config: Option<EngineConfig>,
    session: Arc<AtomicU64>,
    embedder_factory: EmbedderFactory,
    embedder: Arc<dyn Embedder>,
    persistence: Arc<PersistenceManager>,
    fs: Arc<dyn FsAdapter>,
    keyword_root: PathBuf,

    vectors: VectorIndex,
    graph: GraphStore,
    keyword: KeywordIndex,
    docs: HashMap<String, DocumentMeta>,
    chunks: HashMap<String, Vec<ChunkMeta>>,

    dirty: bool,
    last_mutation: Instant,
    consecutive_embed_errors: u32,
    backoff_until: Option<Instant>,

    low_tx: mpsc::UnboundedSender<Envelope>,
    event_tx: broadcast::Sender<ServerEvent>,
}

impl IndexerWorker {
    /// Spawns the worker task and returns the channel ends for the facade.
    pub fn spawn(
        app_config: &AppConfig,
        embedder_factory: EmbedderFactory,
        persistence: Arc<PersistenceManager>,
        fs: Arc<dyn FsAdapter>,
        event_tx: broadcast::Sender<ServerEvent>,
    ) -> EngineResult<WorkerChannels> {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        let session = Arc::new(AtomicU64::new(1));

        let engine_config = app_config.engine.clone();
        let embedder = embedder_factory(&engine_config);
        let keyword_root = PathBuf::from(&app_config.data_dir).join("keyword");
        let keyword = KeywordIndex::open(&keyword_root.join(persist::model_identity_string(
            &engine_config.embedding_model_id,
            engine_config.embedding_dimension,
        )))?;

        let worker = IndexerWorker {
            phase: WorkerPhase::Uninit,
            vectors: VectorIndex::new(engine_config.embedding_dimension),
            config: engine_config,
            staged_config: None,
            session: session.clone(),
            embedder_factory,
            embedder,
            persistence,
            fs,
            keyword_root,
            graph: GraphStore::new(),
            keyword,
            docs: HashMap::new(),
            chunks: HashMap::new(),
            dirty: false,
            last_mutation: Instant::now(),
            consecutive_embed_errors: 0,
            backoff_until: None,
            low_tx: low_tx.clone(),
            event_tx,
        };

        tokio::spawn(worker.run(high_rx, low_rx));

        Ok(WorkerChannels {
            high_tx,
            low_tx,
            session,
        })
    }

    async fn run(
        mut self,
        mut high_rx: mpsc::UnboundedReceiver<Envelope>,
        mut low_rx: mpsc::UnboundedReceiver<Envelope>,
    ) {
        self.phase = WorkerPhase::Initializing;
        if let Err(e) = self.startup().await {
            warn!("Worker startup degraded: {e}");
        }
        self.phase = WorkerPhase::Ready;
        info!(
            session = self.session.load(Ordering::SeqCst),
            model = %self.config.embedding_model_id,
            documents = self.docs.len(),
            "Indexer worker ready"
        );
        let _ = self.event_tx.send(ServerEvent::SearchReady);

        let mut save_tick = tokio::time::interval(Duration::from_secs(SAVE_IDLE_SECS.max(1)));
        save_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // High is always polled first, which is exactly the two-queue
            // contract: user-initiated work drains before background work.
            tokio::select! {
                biased;
                envelope = high_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if self.dispatch(envelope).await { break; }
                }
                envelope = low_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if self.dispatch(envelope).await { break; }
                }
                _ = save_tick.tick() => {
                    self.idle_save();
                }
            }
        }

        if self.phase != WorkerPhase::Terminated {
            self.force_save();
            self.phase = WorkerPhase::Terminated;
        }
        info!("Indexer worker terminated");
    }

    async fn startup(&mut self) -> EngineResult<()> {
        let embedder = self.embedder.clone();
        let init = tokio::time::timeout(
            Duration::from_millis(EMBED_TIMEOUT_MS),
            tokio::task::spawn_blocking(move || embedder.initialize()),
        )
        .await;
        match init {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("Embedder initialize failed (will retry lazily): {e}"),
            Ok(Err(join)) => warn!("Embedder initialize panicked: {join}"),
            Err(_) => warn!("Embedder initialize timed out"),
        }

        match self.persistence.load_state(
            &self.config.embedding_model_id,
            self.config.embedding_dimension,
        ) {
            Ok(Some(state)) => self.restore_from_state(state)?,
            Ok(None) => {}
            Err(e) => warn!("State load failed, starting empty: {e}"),
        }
        Ok(())
    }

    /// Returns true when the worker should stop consuming.
    async fn dispatch(&mut self, envelope: Envelope) -> bool {
        let current = self.session.load(Ordering::SeqCst);
        if envelope.session_id != current {
            debug!(
                correlation = envelope.correlation_id,
                enqueued = envelope.session_id,
                current,
                "Dropping stale task"
            );
            let payload = stale_payload(
                &envelope.command,
                EngineError::TaskDropped {
                    enqueued: envelope.session_id,
                    current,
                },
            );
            let _ = envelope.reply.send(Reply {
                correlation_id: envelope.correlation_id,
                payload,
            });
            return false;
        }
        if self.phase != WorkerPhase::Ready {
            let payload = stale_payload(
                &envelope.command,
                EngineError::NotReady(format!("worker phase {}", self.phase.as_str())),
            );
            let _ = envelope.reply.send(Reply {
                correlation_id: envelope.correlation_id,
                payload,
            });
            return false;
        }

        let correlation_id = envelope.correlation_id;
        let mut shutdown = false;
        let payload = match envelope.command {
            Command::KeywordSearch { query, k } => {
                ReplyPayload::Search(self.keyword_search(&query, k).await)
            }
            Command::Search {
                query,
                k,
                min_score,
                cancel,
            } => ReplyPayload::Search(self.deep_search(&query, k, min_score, cancel).await),
            Command::Similar { path, k, min_score } => {
                ReplyPayload::Search(self.similar(&path, k, min_score))
            }
            Command::Neighbors { path, options } => {
                ReplyPayload::Neighbors(self.neighbors(&path, options))
            }
            Command::Subgraph {
                center,
                update_id,
                positions,
            } => ReplyPayload::Subgraph(self.subgraph(&center, update_id, positions)),
            Command::FileStates => ReplyPayload::FileStates(Ok(self.file_states())),
            Command::UpdateFiles { updates } => {
                ReplyPayload::Update(self.update_files(updates).await)
            }
            Command::DeleteFile { path } => ReplyPayload::Ack(self.delete_file(&path)),
            Command::RenameFile { old_path, new_path } => {
                ReplyPayload::Ack(self.rename_file(&old_path, &new_path).await)
            }
            Command::ReindexPaths { paths } => {
                ReplyPayload::Update(self.reindex_paths(paths).await)
            }
            Command::UpdateConfig { config } => {
                self.staged_config = Some(config);
                ReplyPayload::Ack(Ok(()))
            }
            Command::CommitConfig => ReplyPayload::Ack(self.commit_config().await),
            Command::PruneOrphans { current_paths } => {
                ReplyPayload::Ack(self.prune_orphans(current_paths))
            }
            Command::SaveIndex => ReplyPayload::SavedIndex(self.save_index()),
            Command::LoadIndex { bytes } => ReplyPayload::Ack(self.load_index(&bytes)),
            Command::FullReset => ReplyPayload::Ack(self.full_reset()),
            Command::Status => ReplyPayload::Status(Box::new(Ok(self.status()))),
            Command::Shutdown => {
                // Flush before replying so a caller awaiting shutdown can
                // immediately reopen the data directory.
                self.force_save();
                self.phase = WorkerPhase::Terminated;
                shutdown = true;
                ReplyPayload::Ack(Ok(()))
            }
        };
        let _ = envelope.reply.send(Reply {
            correlation_id,
            payload,
        });
        shutdown
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    fn scorer_ctx(&self) -> ScorerContext<'_> {
        ScorerContext {
            vectors: &self.vectors,
            graph: &self.graph,
            docs: &self.docs,
            ontology_folder: &self.config.ontology_folder,
        }
    }

    fn validate_query(query: &str) -> EngineResult<()> {
        if query.len() > MAX_SEARCH_QUERY_LENGTH {
            return Err(EngineError::InvalidInput(format!(
                "query too long ({} chars, max {MAX_SEARCH_QUERY_LENGTH})",
                query.len()
            )));
        }
        Ok(())
    }

    async fn keyword_search(&mut self, query: &str, k: usize) -> EngineResult<SearchResponse> {
        Self::validate_query(query)?;
        let started = Instant::now();
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Ok(SearchResponse {
                hits: Vec::new(),
                query_time_ms: 0,
            });
        }
        let fuzzy = tokens.len() < SHORT_QUERY_TOKEN_LIMIT;
        let keyword_hits = self.keyword.collect_hits(&tokens, fuzzy)?;

        // Reflex keeps the fast budgeted vector scan; an unreachable
        // embedder just zeroes the similarity signal.
        let vector_hits = match self.embed_query(query).await {
            Ok(vec) => self
                .vectors
                .similar_search(&vec, k * 2, 0.0, None, true)
                .unwrap_or_default(),
            Err(e) => {
                debug!("Reflex vector scan skipped: {e}");
                Vec::new()
            }
        };

        let scored = scorer::reflex_search(
            &self.scorer_ctx(),
            &keyword_hits,
            &vector_hits,
            tokens.len(),
            k,
            0.0,
        );
        Ok(self.hydrate_scored(scored, started))
    }

    async fn deep_search(
        &mut self,
        query: &str,
        k: usize,
        min_score: f32,
        cancel: CancellationToken,
    ) -> EngineResult<SearchResponse> {
        Self::validate_query(query)?;
        let started = Instant::now();
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Ok(SearchResponse {
                hits: Vec::new(),
                query_time_ms: 0,
            });
        }
        let fuzzy = tokens.len() < SHORT_QUERY_TOKEN_LIMIT;
        let mut keyword_hits = self.keyword.collect_hits(&tokens, fuzzy).unwrap_or_default();
        // Keyword overshoot: keep only the strongest slice of a huge match
        // set before graph work starts.
        if keyword_hits.len() > k * DEEP_KEYWORD_OVERSHOOT * 8 {
            let mut paths: Vec<(String, usize)> = keyword_hits
                .iter()
                .map(|(p, h)| (p.clone(), h.hits))
                .collect();
            paths.sort_by(|a, b| b.1.cmp(&a.1));
            paths.truncate(k * DEEP_KEYWORD_OVERSHOOT * 8);
            let keep: std::collections::HashSet<String> =
                paths.into_iter().map(|(p, _)| p).collect();
            keyword_hits.retain(|p, _| keep.contains(p));
        }

        let vector_hits = match self.embed_query(query).await {
            Ok(vec) => self
                .vectors
                .similar_search(&vec, k * DEEP_VECTOR_OVERSHOOT, 0.0, None, false)
                .unwrap_or_default(),
            Err(e) => {
                debug!("Deep vector retrieval unavailable: {e}");
                Vec::new()
            }
        };

        let scored = scorer::deep_search(
            &self.scorer_ctx(),
            &keyword_hits,
            &vector_hits,
            tokens.len(),
            k,
            min_score,
            &cancel,
        )?;
        Ok(self.hydrate_scored(scored, started))
    }

    fn similar(&mut self, path: &str, k: usize, min_score: f32) -> EngineResult<SearchResponse> {
        validate_vault_path(path)?;
        let started = Instant::now();
        let Some(centroid) = self.vectors.document_centroid(path) else {
            // Unindexed or chunkless seed: nothing to compare against.
            return Ok(SearchResponse {
                hits: Vec::new(),
                query_time_ms: started.elapsed().as_millis() as u64,
            });
        };
        let vector_hits =
            self.vectors
                .similar_search(&centroid, (k + 1) * DEEP_VECTOR_OVERSHOOT, 0.0, None, false)?;
        let scored = scorer::similar_to_seed(&self.scorer_ctx(), path, &vector_hits, k, min_score);
        Ok(self.hydrate_scored(scored, started))
    }

    fn neighbors(
        &self,
        path: &str,
        options: NeighborOptions,
    ) -> EngineResult<Vec<NeighborHit>> {
        validate_vault_path(path)?;
        Ok(self.graph.neighbors(
            path,
            options.direction,
            options.mode,
            &self.config.ontology_folder,
            options.limit,
        ))
    }

    fn subgraph(
        &self,
        center: &str,
        update_id: u64,
        positions: Option<HashMap<String, (f32, f32)>>,
    ) -> EngineResult<Subgraph> {
        validate_vault_path(center)?;
        let mut included: Vec<String> = vec![center.to_string()];
        for hit in self.graph.neighbors(
            center,
            crate::model::NeighborDirection::Both,
            crate::model::NeighborMode::Simple,
            &self.config.ontology_folder,
            24,
        ) {
            included.push(hit.path);
        }
        let positions = positions.unwrap_or_default();
        let in_set: std::collections::HashSet<&str> =
            included.iter().map(String::as_str).collect();

        let nodes = included
            .iter()
            .filter_map(|path| {
                let kind = self.graph.node_kind(path)?;
                Some(SubgraphNode {
                    id: path.clone(),
                    label: self
                        .docs
                        .get(path)
                        .and_then(|d| d.title.clone())
                        .unwrap_or_else(|| stem_label(path)),
                    kind: kind.as_str().to_string(),
                    centrality: self.graph.centrality(path, &self.config.ontology_folder),
                    position: positions.get(path).copied(),
                })
            })
            .collect();

        let edges = self
            .graph
            .edges_of(center)
            .into_iter()
            .filter(|e| in_set.contains(e.from.as_str()) && in_set.contains(e.to.as_str()))
            .map(|e| SubgraphEdge {
                from: e.from,
                to: e.to,
                edge_type: e.edge_type.as_str().to_string(),
                weight: e.weight,
            })
            .collect();

        Ok(Subgraph {
            update_id,
            nodes,
            edges,
        })
    }

    fn file_states(&self) -> HashMap<String, FileState> {
        self.docs
            .iter()
            .map(|(path, doc)| {
                (
                    path.clone(),
                    FileState {
                        mtime: doc.mtime,
                        size: doc.size,
                        content_hash: doc.content_hash.clone(),
                    },
                )
            })
            .collect()
    }

    /// Hydration rewrites excerpts only; ranking is preserved. Drifted
    /// documents are re-queued on the low lane under the current session.
    fn hydrate_scored(&self, scored: Vec<ScoredDoc>, started: Instant) -> SearchResponse {
        let refs: Vec<ScoredRef> = scored
            .iter()
            .map(|doc| {
                let chunk = doc
                    .best_chunk
                    .as_deref()
                    .and_then(|id| self.chunk_by_id(id))
                    .or_else(|| self.chunks.get(&doc.path).and_then(|c| c.first()));
                match chunk {
                    Some(chunk) => ScoredRef {
                        path: doc.path.clone(),
                        start: chunk.start,
                        end: chunk.end,
                        anchor_hash: chunk.anchor_hash,
                        score: doc.score,
                    },
                    // Chunkless documents (empty body) hydrate to an empty
                    // excerpt instead of drifting.
                    None => ScoredRef {
                        path: doc.path.clone(),
                        start: 0,
                        end: 0,
                        anchor_hash: parser::anchor_hash(""),
                        score: doc.score,
                    },
                }
            })
            .collect();

        let outcome = hydrator::hydrate(self.fs.as_ref(), &refs);
        if !outcome.drifted_paths.is_empty() {
            self.enqueue_reindex(outcome.drifted_paths.clone());
        }

        let hits = outcome
            .chunks
            .into_iter()
            .map(|chunk| SearchHit {
                title: self.docs.get(&chunk.path).and_then(|d| d.title.clone()),
                path: chunk.path,
                score: chunk.score,
                excerpt: chunk.excerpt,
                start: chunk.start,
                end: chunk.end,
                hydration: chunk.status,
            })
            .collect();
        SearchResponse {
            hits,
            query_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn chunk_by_id(&self, chunk_id: &str) -> Option<&ChunkMeta> {
        let (path, index) = chunk_id.rsplit_once('#')?;
        let index: usize = index.parse().ok()?;
        self.chunks.get(path)?.get(index)
    }

    fn enqueue_reindex(&self, paths: Vec<String>) {
        let (reply, _discard) = oneshot::channel();
        let envelope = Envelope {
            correlation_id: 0,
            session_id: self.session.load(Ordering::SeqCst),
            command: Command::ReindexPaths { paths },
            reply,
        };
        let _ = self.low_tx.send(envelope);
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    async fn update_files(&mut self, updates: Vec<FileUpdate>) -> EngineResult<UpdateOutcome> {
        for update in &updates {
            validate_vault_path(&update.path)?;
            if self.is_excluded(&update.path) {
                return Err(EngineError::InvalidInput(format!(
                    "path is in an excluded folder: {}",
                    update.path
                )));
            }
        }

        let total = updates.len();
        if total > 1 {
            let _ = self.event_tx.send(ServerEvent::IndexingStarted { total });
        }
        let started = Instant::now();
        let mut applied = 0usize;
        let mut failed = Vec::new();

        let mut kw_writer = self.keyword.begin_batch()?;
        for (i, update) in updates.into_iter().enumerate() {
            let path = update.path.clone();
            match self.apply_update(update, &mut kw_writer).await {
                Ok(()) => applied += 1,
                Err(e) if e.is_retryable() => {
                    debug!(path = %path, "Update deferred: {e}");
                    failed.push(path);
                }
                Err(e) => {
                    warn!(path = %path, "Update failed: {e}");
                    failed.push(path);
                }
            }
            if total > 1 && (i + 1) % 10 == 0 {
                let _ = self.event_tx.send(ServerEvent::IndexingProgress {
                    indexed: i + 1,
                    total,
                });
            }
        }

        self.keyword.commit_batch(kw_writer)?;
        self.mark_dirty();
        if total > 1 {
            let _ = self.event_tx.send(ServerEvent::IndexingCompleted {
                total,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }
        Ok(UpdateOutcome { applied, failed })
    }

    async fn apply_update(
        &mut self,
        update: FileUpdate,
        kw_writer: &mut tantivy::IndexWriter,
    ) -> EngineResult<()> {
        let parsed = parser::parse(
            &update.content,
            self.config.max_chunk_chars,
            self.config.overlap_ratio,
        );

        // Idempotence fast path: unchanged content never re-embeds. A
        // touched mtime (editor save, git checkout) only refreshes the
        // file-state row.
        if let Some(existing) = self.docs.get_mut(&update.path) {
            if existing.content_hash == parsed.content_hash
                && self.vectors.chunk_ids_for_path(&update.path).len() == parsed.chunks.len()
            {
                existing.mtime = update.mtime;
                existing.size = update.size;
                return Ok(());
            }
        }

        let title = update
            .title
            .clone()
            .or_else(|| parsed.title_guess.clone())
            .or_else(|| Some(stem_label(&update.path)));

        // Embed first: a transient embedding failure must leave the old
        // state untouched.
        let chunk_metas = parsed.chunk_metas();
        let mut rows: Vec<(ChunkMeta, Vec<f32>)> = Vec::with_capacity(chunk_metas.len());
        for (meta, raw) in chunk_metas.iter().zip(&parsed.chunks) {
            let text = parsed.sanitised[raw.start..raw.end].to_string();
            let vector = self
                .embed_document(&text, title.as_deref())
                .await?;
            rows.push((meta.clone(), vector));
        }

        let token_count = self
            .embedder
            .count_tokens(&parsed.sanitised[parsed.body_offset..]);
        self.vectors.upsert_chunks(&update.path, &rows)?;
        self.chunks.insert(update.path.clone(), chunk_metas);
        self.docs.insert(
            update.path.clone(),
            DocumentMeta {
                path: update.path.clone(),
                mtime: update.mtime,
                size: update.size,
                content_hash: parsed.content_hash.clone(),
                title: title.clone(),
                headers: parsed.headers.clone(),
                tags: parsed.tags.clone(),
                token_count,
            },
        );

        self.update_graph_for(&update.path, &parsed, update.links.as_deref());
        self.refresh_semantic_edges(&update.path);
        self.keyword.upsert_into(
            kw_writer,
            &update.path,
            title.as_deref(),
            &parsed.sanitised[parsed.body_offset..],
            &parsed.tags,
        )?;
        Ok(())
    }

    fn update_graph_for(
        &mut self,
        path: &str,
        parsed: &parser::ParseResult,
        link_override: Option<&[String]>,
    ) {
        self.graph.ensure_node(path, NodeKind::File);
        self.graph.clear_outbound(path, EdgeType::Link);
        self.graph.remove_aliases_for(path);
        for alias in &parsed.aliases {
            self.graph.set_alias(alias, path);
        }

        let overridden: Vec<parser::LinkRef>;
        let links: &[parser::LinkRef] = match link_override {
            Some(targets) => {
                overridden = targets
                    .iter()
                    .map(|t| parser::LinkRef {
                        target: t.clone(),
                        source: LinkSource::Body,
                    })
                    .collect();
                &overridden
            }
            None => &parsed.links,
        };

        for link in links {
            let (canonical, exists) = self.graph.resolve_target(&link.target);
            if canonical == path {
                continue;
            }
            let kind = if exists { NodeKind::File } else { NodeKind::Topic };
            self.graph.ensure_node(&canonical, kind);
            let source = match link.source {
                LinkSource::Frontmatter => EdgeSource::Frontmatter,
                LinkSource::Body => EdgeSource::Body,
            };
            self.graph
                .add_edge(path, &canonical, EdgeType::Link, 1.0, source);
        }
    }

    /// Derived similarity edges, refreshed from the document's nearest
    /// vector neighbours on every update.
    fn refresh_semantic_edges(&mut self, path: &str) {
        self.graph.clear_outbound(path, EdgeType::Semantic);
        let Some(centroid) = self.vectors.document_centroid(path) else {
            return;
        };
        let Ok(hits) = self.vectors.similar_search(
            &centroid,
            SEMANTIC_EDGE_K + 1,
            SEMANTIC_EDGE_MIN_SIMILARITY,
            None,
            false,
        ) else {
            return;
        };
        let mut seen = std::collections::HashSet::new();
        for hit in hits {
            if hit.path == path || !seen.insert(hit.path.clone()) {
                continue;
            }
            if self.graph.contains(&hit.path) {
                self.graph.add_edge(
                    path,
                    &hit.path,
                    EdgeType::Semantic,
                    hit.score.clamp(0.0, 1.0),
                    EdgeSource::Body,
                );
            }
        }
    }

    fn delete_file(&mut self, path: &str) -> EngineResult<()> {
        let mut kw_writer = self.keyword.begin_batch()?;
        self.delete_file_in(path, &mut kw_writer)?;
        self.keyword.commit_batch(kw_writer)?;
        Ok(())
    }

    fn delete_file_in(
        &mut self,
        path: &str,
        kw_writer: &mut tantivy::IndexWriter,
    ) -> EngineResult<()> {
        validate_vault_path(path)?;
        self.docs.remove(path);
        self.chunks.remove(path);
        self.vectors.delete_document(path);
        self.graph.remove_file(path);
        self.graph.remove_aliases_for(path);
        self.keyword.delete_in(kw_writer, path);
        self.mark_dirty();
        Ok(())
    }

    /// Rename is delete-old then index-new, strictly in that order.
    async fn rename_file(&mut self, old_path: &str, new_path: &str) -> EngineResult<()> {
        validate_vault_path(old_path)?;
        validate_vault_path(new_path)?;
        self.delete_file(old_path)?;
        let outcome = self.reindex_paths(vec![new_path.to_string()]).await?;
        if !outcome.failed.is_empty() {
            return Err(EngineError::Transient(format!(
                "rename target {new_path} could not be indexed yet"
            )));
        }
        Ok(())
    }

    async fn reindex_paths(&mut self, paths: Vec<String>) -> EngineResult<UpdateOutcome> {
        let mut updates = Vec::new();
        for path in paths {
            validate_vault_path(&path)?;
            let Ok(content) = self.fs.read(&path) else {
                // Vanished between the event and now; treat as deleted.
                self.delete_file(&path)?;
                continue;
            };
            let (mtime, size) = self.fs.stat(&path)?.unwrap_or((0, content.len() as u64));
            updates.push(FileUpdate {
                path,
                content,
                mtime,
                size,
                title: None,
                links: None,
            });
        }
        self.update_files(updates).await
    }

    fn prune_orphans(&mut self, current_paths: Vec<String>) -> EngineResult<()> {
        let keep: std::collections::HashSet<&str> =
            current_paths.iter().map(String::as_str).collect();
        let orphans: Vec<String> = self
            .docs
            .keys()
            .filter(|p| !keep.contains(p.as_str()))
            .cloned()
            .collect();
        if orphans.is_empty() {
            return Ok(());
        }
        let mut kw_writer = self.keyword.begin_batch()?;
        for path in &orphans {
            self.delete_file_in(path, &mut kw_writer)?;
        }
        self.keyword.commit_batch(kw_writer)?;
        info!(count = orphans.len(), "Pruned orphaned documents");
        Ok(())
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.config.excluded_folders.iter().any(|folder| {
            let prefix = format!("{}/", folder.trim_end_matches('/'));
            path.starts_with(&prefix)
        })
    }

    // -----------------------------------------------------------------------
    // Embedding with timeout + back-off
    // -----------------------------------------------------------------------

    async fn embed_query(&mut self, text: &str) -> EngineResult<Vec<f32>> {
        self.embed_with_role(text, EmbedRole::Query, None).await
    }

    async fn embed_document(
        &mut self,
        text: &str,
        title: Option<&str>,
    ) -> EngineResult<Vec<f32>> {
        self.embed_with_role(text, EmbedRole::Document, title).await
    }

    async fn embed_with_role(
        &mut self,
        text: &str,
        role: EmbedRole,
        title: Option<&str>,
    ) -> EngineResult<Vec<f32>> {
        if let Some(until) = self.backoff_until {
            if Instant::now() < until {
                return Err(EngineError::Transient(
                    "embedding queue backing off after repeated errors".into(),
                ));
            }
            self.backoff_until = None;
        }

        let embedder = self.embedder.clone();
        let text = text.to_string();
        let title = title.map(str::to_string);
        let result = tokio::time::timeout(
            Duration::from_millis(EMBED_TIMEOUT_MS),
            tokio::task::spawn_blocking(move || embedder.embed(&text, role, title.as_deref())),
        )
        .await;

        let outcome = match result {
            Ok(Ok(inner)) => inner,
            Ok(Err(join)) => Err(EngineError::Fatal(format!("embedding task panicked: {join}"))),
            Err(_) => Err(EngineError::Transient("embedding request timed out".into())),
        };

        match &outcome {
            Ok(_) => self.consecutive_embed_errors = 0,
            Err(e) if e.is_retryable() => {
                self.consecutive_embed_errors += 1;
                if self.consecutive_embed_errors >= MAX_ERRORS_BEFORE_BACKOFF {
                    warn!(
                        errors = self.consecutive_embed_errors,
                        "Embedding back-off window opened"
                    );
                    self.backoff_until =
                        Some(Instant::now() + Duration::from_millis(BACKOFF_DELAY_MS));
                    self.consecutive_embed_errors = 0;
                }
            }
            Err(_) => {}
        }
        outcome
    }

    // -----------------------------------------------------------------------
    // Persistence, config swap, reset
    // -----------------------------------------------------------------------

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.last_mutation = Instant::now();
    }

    fn idle_save(&mut self) {
        if !self.dirty {
            return;
        }
        if self.last_mutation.elapsed() < Duration::from_secs(SAVE_IDLE_SECS) {
            return;
        }
        if let Err(e) = self.save_index() {
            warn!("Idle save failed: {e}");
        }
    }

    fn force_save(&mut self) {
        if self.dirty {
            if let Err(e) = self.save_index() {
                warn!("Shutdown save failed: {e}");
            }
        }
    }

    fn save_index(&mut self) -> EngineResult<Vec<u8>> {
        let state = self.export_state();
        let bytes = PersistenceManager::encode(&state)?;
        self.persistence.save_bytes(
            &bytes,
            &self.config.embedding_model_id,
            self.config.embedding_dimension,
        )?;
        self.dirty = false;
        self.vectors.note_save_cycle();
        Ok(bytes)
    }

    fn export_state(&self) -> PersistedState {
        let mut state = persist::empty_state(
            &self.config.embedding_model_id,
            self.config.embedding_dimension,
        );

        for (path, kind) in self.graph.paths() {
            let doc = self.docs.get(path);
            state.nodes.push(PersistedNode {
                path: path.to_string(),
                kind: kind.as_str().to_string(),
                mtime: doc.map_or(0, |d| d.mtime),
                size: doc.map_or(0, |d| d.size),
                content_hash: doc.map(|d| d.content_hash.clone()).unwrap_or_default(),
                title: doc.and_then(|d| d.title.clone()),
                headers: doc.map(|d| d.headers.clone()).unwrap_or_default(),
                tags: doc.map(|d| d.tags.clone()).unwrap_or_default(),
                token_count: doc.map_or(0, |d| d.token_count),
            });
        }
        state.nodes.sort_by(|a, b| a.path.cmp(&b.path));

        for edge in self.graph.edges_snapshot() {
            state.edges.push(PersistedEdge {
                from: edge.from,
                to: edge.to,
                edge_type: edge.edge_type.as_str().to_string(),
                weight: edge.weight,
                source: edge.source.as_str().to_string(),
            });
        }

        let (order, packed) = self.vectors.export_rows();
        for (path, index) in &order {
            let meta = self
                .chunks
                .get(path)
                .and_then(|c| c.get(*index))
                .cloned()
                .unwrap_or(ChunkMeta {
                    start: 0,
                    end: 0,
                    anchor_hash: 0,
                    token_count: 0,
                });
            state.chunks.push(PersistedChunk {
                path: path.clone(),
                start: meta.start,
                end: meta.end,
                anchor_hash: meta.anchor_hash,
                token_count: meta.token_count,
            });
        }
        state.vectors = packed;

        for (alias, path) in self.graph.aliases() {
            state.aliases.push((alias.clone(), path.clone()));
        }
        state.aliases.sort();
        state
    }

    fn restore_from_state(&mut self, state: PersistedState) -> EngineResult<()> {
        if state.embedding_model != self.config.embedding_model_id
            || state.embedding_dimension != self.config.embedding_dimension
        {
            return Err(EngineError::SchemaMismatch {
                stored_model: state.embedding_model,
                stored_dim: state.embedding_dimension,
                active_model: self.config.embedding_model_id.clone(),
                active_dim: self.config.embedding_dimension,
            });
        }

        self.reset_tables();

        for node in &state.nodes {
            let kind = if node.kind == "file" {
                NodeKind::File
            } else {
                NodeKind::Topic
            };
            self.graph.ensure_node(&node.path, kind);
            if kind == NodeKind::File {
                self.docs.insert(
                    node.path.clone(),
                    DocumentMeta {
                        path: node.path.clone(),
                        mtime: node.mtime,
                        size: node.size,
                        content_hash: node.content_hash.clone(),
                        title: node.title.clone(),
                        headers: node.headers.clone(),
                        tags: node.tags.clone(),
                        token_count: node.token_count,
                    },
                );
            }
        }
        for (alias, path) in &state.aliases {
            self.graph.set_alias(alias, path);
        }
        for edge in &state.edges {
            let edge_type = if edge.edge_type == "semantic" {
                EdgeType::Semantic
            } else {
                EdgeType::Link
            };
            let source = if edge.source == "frontmatter" {
                EdgeSource::Frontmatter
            } else {
                EdgeSource::Body
            };
            self.graph
                .add_edge(&edge.from, &edge.to, edge_type, edge.weight, source);
        }

        // Reassemble per-document chunk lists in their original order so
        // chunk ids line up with row indices again.
        let dim = state.embedding_dimension;
        let mut per_path: HashMap<String, Vec<(usize, ChunkMeta, Vec<f32>)>> = HashMap::new();
        for (row, chunk) in state.chunks.iter().enumerate() {
            let vector = state.vectors[row * dim..(row + 1) * dim].to_vec();
            let meta = ChunkMeta {
                start: chunk.start,
                end: chunk.end,
                anchor_hash: chunk.anchor_hash,
                token_count: chunk.token_count,
            };
            per_path
                .entry(chunk.path.clone())
                .or_default()
                .push((row, meta, vector));
        }
        for (path, mut rows) in per_path {
            rows.sort_by_key(|(_, meta, _)| meta.start);
            let pairs: Vec<(ChunkMeta, Vec<f32>)> = rows
                .into_iter()
                .map(|(_, meta, vector)| (meta, vector))
                .collect();
            self.chunks
                .insert(path.clone(), pairs.iter().map(|(m, _)| m.clone()).collect());
            self.vectors.upsert_chunks(&path, &pairs)?;
        }
        Ok(())
    }

    fn reset_tables(&mut self) {
        self.vectors = VectorIndex::new(self.config.embedding_dimension);
        self.graph = GraphStore::new();
        self.docs.clear();
        self.chunks.clear();
    }

    fn load_index(&mut self, bytes: &[u8]) -> EngineResult<()> {
        let state = PersistenceManager::decode(bytes)?;
        self.restore_from_state(state)?;
        self.mark_dirty();
        Ok(())
    }

    /// Config-change protocol: freeze-save the active identity, swap, load
    /// the matching shard. The session bump drops every queued task from
    /// the previous identity.
    async fn commit_config(&mut self) -> EngineResult<()> {
        let Some(staged) = self.staged_config.take() else {
            return Ok(());
        };
        let identity_changed = staged.model_identity() != self.config.model_identity();
        if !identity_changed {
            self.config = staged;
            self.mark_dirty();
            return Ok(());
        }

        self.phase = WorkerPhase::Swapping;
        // 1. Persist the outgoing worker's state under its frozen identity.
        if self.dirty {
            if let Err(e) = self.save_index() {
                warn!("Freeze-save before swap failed: {e}");
            }
        }

        // 2–3. Terminate the old identity, bump the session, reinitialise.
        let new_session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        self.config = staged;
        self.embedder = (self.embedder_factory)(&self.config);
        let embedder = self.embedder.clone();
        let init = tokio::time::timeout(
            Duration::from_millis(EMBED_TIMEOUT_MS),
            tokio::task::spawn_blocking(move || embedder.initialize()),
        )
        .await;
        if let Ok(Ok(Err(e))) = init {
            warn!("New embedder initialize failed (lazy retry): {e}");
        }

        self.keyword = KeywordIndex::open(&self.keyword_root.join(
            persist::model_identity_string(
                &self.config.embedding_model_id,
                self.config.embedding_dimension,
            ),
        ))?;
        self.reset_tables();

        // 4. Adopt a matching shard when one exists.
        match self.persistence.load_state(
            &self.config.embedding_model_id,
            self.config.embedding_dimension,
        ) {
            Ok(Some(state)) => {
                if let Err(e) = self.restore_from_state(state) {
                    warn!("Shard for new identity rejected: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Shard load for new identity failed: {e}"),
        }

        self.dirty = false;
        self.phase = WorkerPhase::Ready;
        let _ = self.event_tx.send(ServerEvent::ConfigCommitted {
            model: self.config.embedding_model_id.clone(),
            dimension: self.config.embedding_dimension,
        });
        info!(
            session = new_session,
            model = %self.config.embedding_model_id,
            dim = self.config.embedding_dimension,
            "Worker swapped to new model identity"
        );
        Ok(())
    }

    /// Drops all state and pending work for the current identity.
    fn full_reset(&mut self) -> EngineResult<()> {
        self.session.fetch_add(1, Ordering::SeqCst);
        self.reset_tables();
        self.keyword.clear()?;
        self.persistence.delete_state(&persist::shard_file_name(
            &self.config.embedding_model_id,
            self.config.embedding_dimension,
        ))?;
        self.dirty = false;
        self.staged_config = None;
        info!("Full reset complete");
        Ok(())
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            phase: self.phase.as_str().to_string(),
            session_id: self.session.load(Ordering::SeqCst),
            documents: self.docs.len(),
            chunks: self.chunks.values().map(Vec::len).sum(),
            vector_rows: self.vectors.len(),
            nodes: self.graph.node_count(),
            edges: self.graph.edge_count(),
            embedding_model: self.config.embedding_model_id.clone(),
            embedding_dimension: self.config.embedding_dimension,
        }
    }
}

fn stem_label(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.strip_suffix(".md").unwrap_or(name).to_string()
}

/// Builds the reply variant matching a command so even dropped tasks answer
/// with a well-typed payload.
fn stale_payload(command: &Command, error: EngineError) -> ReplyPayload {
    match command {
        Command::KeywordSearch { .. } | Command::Search { .. } | Command::Similar { .. } => {
            ReplyPayload::Search(Err(error))
        }
        Command::Neighbors { .. } => ReplyPayload::Neighbors(Err(error)),
        Command::Subgraph { .. } => ReplyPayload::Subgraph(Err(error)),
        Command::FileStates => ReplyPayload::FileStates(Err(error)),
        Command::UpdateFiles { .. } | Command::ReindexPaths { .. } => {
            ReplyPayload::Update(Err(error))
        }
        Command::SaveIndex => ReplyPayload::SavedIndex(Err(error)),
        Command::Status => ReplyPayload::Status(Box::new(Err(error))),
        _ => ReplyPayload::Ack(Err(error)),
    }
}
