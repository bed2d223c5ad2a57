use axum::{extract::State, Json};
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::EngineResult;
use crate::model::{
    NeighborDirection, NeighborHit, NeighborMode, NeighborOptions, SearchResponse, Subgraph,
};
use crate::state::AppState;

fn default_k() -> usize {
    20
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub min_score: f32,
}

/// Deep hybrid search: vector + keyword retrieval with graph expansion.
pub async fn deep_search(
    State(state): State<AppState>,
    Json(query): Json<SearchQuery>,
) -> EngineResult<Json<SearchResponse>> {
    let k = query.k.min(200);
    let response = state
        .engine
        .search_cancellable(
            &query.query,
            k,
            query.min_score,
            tokio_util::sync::CancellationToken::new(),
        )
        .await?;
    Ok(Json(response))
}

/// Reflex search: keyword-dominant, low latency, no graph work.
pub async fn keyword_search(
    State(state): State<AppState>,
    Json(query): Json<SearchQuery>,
) -> EngineResult<Json<SearchResponse>> {
    let k = query.k.min(200);
    let response = state.engine.keyword_search(&query.query, k).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct SimilarQuery {
    pub path: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub min_score: f32,
}

pub async fn similar(
    State(state): State<AppState>,
    Json(query): Json<SimilarQuery>,
) -> EngineResult<Json<SearchResponse>> {
    let response = state
        .engine
        .similar(&query.path, query.k.min(200), query.min_score)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct NeighborQuery {
    pub path: String,
    #[serde(default)]
    pub direction: Option<NeighborDirection>,
    #[serde(default)]
    pub mode: Option<NeighborMode>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn neighbors(
    State(state): State<AppState>,
    Json(query): Json<NeighborQuery>,
) -> EngineResult<Json<Vec<NeighborHit>>> {
    let defaults = NeighborOptions::default();
    let options = NeighborOptions {
        direction: query.direction.unwrap_or(defaults.direction),
        mode: query.mode.unwrap_or(defaults.mode),
        limit: query.limit.unwrap_or(defaults.limit).min(256),
    };
    let hits = state.engine.neighbors(&query.path, options).await?;
    Ok(Json(hits))
}

#[derive(Debug, Deserialize)]
pub struct SubgraphQuery {
    pub center: String,
    #[serde(default)]
    pub update_id: u64,
    #[serde(default)]
    pub positions: Option<HashMap<String, (f32, f32)>>,
}

/// Layout-ready subgraph for the graph view.
pub async fn subgraph(
    State(state): State<AppState>,
    Json(query): Json<SubgraphQuery>,
) -> EngineResult<Json<Subgraph>> {
    let subgraph = state
        .engine
        .subgraph(&query.center, query.update_id, query.positions)
        .await?;
    Ok(Json(subgraph))
}
