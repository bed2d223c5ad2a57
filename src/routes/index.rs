use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::model::{EngineStatus, FileState, FileUpdate};
use crate::state::AppState;

pub async fn status(State(state): State<AppState>) -> EngineResult<Json<EngineStatus>> {
    Ok(Json(state.engine.status().await?))
}

pub async fn file_states(
    State(state): State<AppState>,
) -> EngineResult<Json<HashMap<String, FileState>>> {
    Ok(Json(state.engine.file_states().await?))
}

/// Kicks off a delta scan in the background; progress arrives over the
/// WebSocket event stream.
pub async fn trigger_scan(State(state): State<AppState>) -> Json<Value> {
    let sync = state.sync.clone();
    let event_tx = state.event_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = sync.scan().await {
            tracing::error!("Triggered scan failed: {e}");
            let _ = event_tx.send(crate::state::ServerEvent::IndexingError {
                error: e.to_string(),
            });
        }
    });
    Json(json!({ "status": "scan_started" }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateFileRequest {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub mtime: u64,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub links: Option<Vec<String>>,
}

pub async fn update_file(
    State(state): State<AppState>,
    Json(request): Json<UpdateFileRequest>,
) -> EngineResult<Json<Value>> {
    let size = request.size.unwrap_or(request.content.len() as u64);
    let outcome = state
        .engine
        .update_files(vec![FileUpdate {
            path: request.path,
            content: request.content,
            mtime: request.mtime,
            size,
            title: request.title,
            links: request.links,
        }])
        .await?;
    Ok(Json(json!({
        "applied": outcome.applied,
        "failed": outcome.failed,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteFileRequest {
    pub path: String,
}

pub async fn delete_file(
    State(state): State<AppState>,
    Json(request): Json<DeleteFileRequest>,
) -> EngineResult<Json<Value>> {
    state.engine.delete_file(&request.path).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

#[derive(Debug, Deserialize)]
pub struct RenameFileRequest {
    pub old_path: String,
    pub new_path: String,
}

pub async fn rename_file(
    State(state): State<AppState>,
    Json(request): Json<RenameFileRequest>,
) -> EngineResult<Json<Value>> {
    state
        .engine
        .rename_file(&request.old_path, &request.new_path)
        .await?;
    Ok(Json(json!({ "status": "renamed" })))
}

/// Stages a new engine config; nothing changes until commit.
pub async fn update_config(
    State(state): State<AppState>,
    Json(config): Json<EngineConfig>,
) -> EngineResult<Json<Value>> {
    state.engine.update_config(config).await?;
    Ok(Json(json!({ "status": "staged" })))
}

/// Runs the full config-change protocol: freeze-save, worker swap, shard
/// load, delta scan.
pub async fn commit_config(State(state): State<AppState>) -> EngineResult<Json<Value>> {
    let sync = state.sync.clone();
    let status_before = state.engine.status().await?;
    // Commit synchronously so the reply reflects the swap; the follow-up
    // scan runs in the background.
    state.engine.commit_config().await?;
    tokio::spawn(async move {
        if let Err(e) = sync.scan().await {
            tracing::error!("Post-commit scan failed: {e}");
        }
    });
    let status_after = state.engine.status().await?;
    Ok(Json(json!({
        "status": "committed",
        "previous_model": status_before.embedding_model,
        "model": status_after.embedding_model,
        "dimension": status_after.embedding_dimension,
        "session_id": status_after.session_id,
    })))
}

pub async fn save_index(State(state): State<AppState>) -> EngineResult<Json<Value>> {
    let bytes = state.engine.save_index().await?;
    Ok(Json(json!({
        "status": "saved",
        "bytes": bytes.len(),
    })))
}

pub async fn full_reset(State(state): State<AppState>) -> EngineResult<Json<Value>> {
    state.engine.full_reset().await?;
    Ok(Json(json!({ "status": "reset" })))
}

#[derive(Debug, Deserialize)]
pub struct ActiveFileRequest {
    pub path: Option<String>,
}

/// Tells the orchestrator which note is being edited, so its re-index
/// rides the long debounce window.
pub async fn set_active_file(
    State(state): State<AppState>,
    Json(request): Json<ActiveFileRequest>,
) -> Json<Value> {
    state.sync.set_active_file(request.path);
    Json(json!({ "status": "ok" }))
}
