use crate::config::AppConfig;
use crate::embedder::{Embedder, LocalEmbedder};
use crate::engine::EngineHandle;
use crate::error::EngineResult;
use crate::fsadapter::VaultFs;
use crate::persist::PersistenceManager;
use crate::storage::StorageProvider;
use crate::sync::SyncOrchestrator;
use crate::worker::{EmbedderFactory, IndexerWorker};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events broadcast to all connected WebSocket clients.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "index_started")]
    IndexingStarted { total: usize },
    #[serde(rename = "index_progress")]
    IndexingProgress { indexed: usize, total: usize },
    #[serde(rename = "index_complete")]
    IndexingCompleted { total: usize, duration_ms: u64 },
    #[serde(rename = "index_error")]
    IndexingError { error: String },
    #[serde(rename = "file_changed")]
    FileChanged { path: String, change_type: String },
    #[serde(rename = "search_ready")]
    SearchReady,
    #[serde(rename = "config_committed")]
    ConfigCommitted { model: String, dimension: usize },
}

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub engine: EngineHandle,
    pub sync: Arc<SyncOrchestrator>,
    pub event_tx: broadcast::Sender<ServerEvent>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> EngineResult<Self> {
        let (event_tx, _) = broadcast::channel(1024);

        let fs = Arc::new(VaultFs::new(&config.vault_dir));
        let storage = StorageProvider::open(
            Path::new(&config.data_dir),
            Path::new(&config.hot_cache_dir),
        )?;
        let persistence = Arc::new(PersistenceManager::new(storage));

        let factory: EmbedderFactory = Arc::new(|engine_config| {
            Arc::new(LocalEmbedder::new(
                engine_config.embedding_model_id.clone(),
                engine_config.embedding_dimension,
            )) as Arc<dyn Embedder>
        });

        let channels = IndexerWorker::spawn(
            &config,
            factory,
            persistence,
            fs.clone(),
            event_tx.clone(),
        )?;
        let engine = EngineHandle::new(channels);
        let sync = SyncOrchestrator::new(engine.clone(), fs, config.clone(), event_tx.clone());

        Ok(Self {
            config,
            engine,
            sync,
            event_tx,
        })
    }
}
