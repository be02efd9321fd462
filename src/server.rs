use std::net::SocketAddr;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use axum_client_ip::SecureClientIpSource;
use serde::Deserialize;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::error::HandshakeError;
use crate::model::{ClientId, RoomId};
use crate::reaper;
use crate::registry::RoomRegistry;
use crate::session;

#[derive(Debug, Deserialize)]
struct ConnectParams {
    #[serde(rename = "auctionId")]
    auction_id: Option<String>,
    #[serde(rename = "senderId")]
    sender_id: Option<String>,
}

#[derive(Clone)]
struct AppState {
    registry: RoomRegistry,
    config: RelayConfig,
}

/// Binds the listener, wires the routes, and runs until a shutdown signal
/// is received. Returns an error if the listen address cannot be acquired.
pub async fn serve(config: RelayConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = RoomRegistry::new(config.clone());

    tokio::spawn(reaper::run(registry.clone(), config.reaper_interval));

    let state = AppState {
        registry,
        config: config.clone(),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
        .layer(SecureClientIpSource::ConnectInfo.into_extension())
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default().include_headers(true)));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let auction_id = match params.auction_id.filter(|s| !s.is_empty()) {
        Some(id) => id,
        None => return reject_handshake(),
    };
    let sender_id = match params.sender_id.filter(|s| !s.is_empty()) {
        Some(id) => id,
        None => return reject_handshake(),
    };

    debug!(%addr, auction_id = %auction_id, sender_id = %sender_id, "websocket connection established");
    let max_frame_size = state.config.max_frame_size;
    ws.max_frame_size(max_frame_size)
        .max_message_size(max_frame_size)
        .on_upgrade(move |socket| handle_socket(socket, auction_id, sender_id, state))
}

fn reject_handshake() -> axum::response::Response {
    let err = HandshakeError::new("auctionId and senderId are required");
    (StatusCode::BAD_REQUEST, err.to_string()).into_response()
}

async fn handle_socket(socket: axum::extract::ws::WebSocket, auction_id: String, sender_id: String, state: AppState) {
    let room_id = RoomId(auction_id.clone());
    let client_id = ClientId(sender_id);
    let room = state.registry.get_or_create(&room_id).await;

    session::run(socket, room, client_id, auction_id, state.config).await;
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.stats().await)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
