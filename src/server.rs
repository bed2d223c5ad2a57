use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::routes;
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/shutdown", post(routes::health::shutdown_handler))
        // Search surface
        .route("/api/search", post(routes::search::deep_search))
        .route("/api/search/keyword", post(routes::search::keyword_search))
        .route("/api/similar", post(routes::search::similar))
        .route("/api/neighbors", post(routes::search::neighbors))
        .route("/api/subgraph", post(routes::search::subgraph))
        // Index management
        .route("/api/status", get(routes::index::status))
        .route("/api/files/states", get(routes::index::file_states))
        .route("/api/files/update", post(routes::index::update_file))
        .route("/api/files/delete", post(routes::index::delete_file))
        .route("/api/files/rename", post(routes::index::rename_file))
        .route("/api/scan", post(routes::index::trigger_scan))
        .route("/api/active-file", post(routes::index::set_active_file))
        .route("/api/config", post(routes::index::update_config))
        .route("/api/config/commit", post(routes::index::commit_config))
        .route("/api/index/save", post(routes::index::save_index))
        .route("/api/reset", post(routes::index::full_reset))
        // Real-time events
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Forwards engine events (index progress, file changes, search-ready) to
/// the client as JSON; inbound messages are only consumed to detect a
/// closed socket.
async fn handle_socket(socket: WebSocket, state: AppState) {
    tracing::info!("WebSocket client connected");
    let mut rx = state.event_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("WebSocket client lagged, skipped {n} events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => { recv_task.abort(); }
        _ = &mut recv_task => { send_task.abort(); }
    }
    tracing::info!("WebSocket client disconnected");
}
