use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tracing::info;

use atc_protocol::defaults;

use crate::{methods::MethodRegistry, state::GatewayState, ws::handle_connection};

#[derive(Clone)]
struct AppState {
    gateway: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
}

pub fn router(gateway: Arc<GatewayState>, methods: Arc<MethodRegistry>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade_handler))
        .route("/health", get(health_handler))
        .with_state(AppState { gateway, methods })
}

/// Bind and serve on `addr` until `shutdown` resolves, then run the
/// shutdown sequence from spec §4.1: stop accepting sockets, stop the
/// rate limiter's cleanup ticker, request Orchestrator shutdown (drained
/// for `shutdown_drain_ms`), then NodeCommunicator shutdown.
pub async fn serve(
    addr: SocketAddr,
    gateway: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(Arc::clone(&gateway), Arc::clone(&methods));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway: listening");

    let cleanup_ticker = spawn_cleanup_ticker(Arc::clone(&gateway));

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("gateway: socket accept loop stopped, draining");
    cleanup_ticker.abort();
    tokio::time::sleep(Duration::from_millis(defaults::SHUTDOWN_DRAIN_MS)).await;
    gateway.node_communicator.shutdown().await;
    info!("gateway: shutdown complete");
    Ok(())
}

/// Periodic sweep of every component's own expiring state (spec §4.1's
/// "RateLimiter cleanup ticker", generalized to the sibling tables that
/// need the same treatment: pending approvals, session mappings, paired
/// nodes, pending node requests).
fn spawn_cleanup_ticker(gateway: Arc<GatewayState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(defaults::RATE_LIMIT_WINDOW_MS));
        loop {
            ticker.tick().await;
            gateway.rate_limiter.sweep();
            gateway.orchestrator.sweep().await;
            gateway.node_sessions.sweep().await;
            gateway.node_communicator.sweep().await;
        }
    })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "uptimeMs": state.gateway.uptime_ms(),
        "connections": state.gateway.client_count().await,
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    // Admission step (1), RateLimiter.check(peerAddress), happens inside
    // handle_connection: a rejected peer still completes the upgrade and
    // is closed with WS code 1008, since a pre-upgrade HTTP rejection
    // can't carry a close code.
    ws.on_upgrade(move |socket| handle_connection(socket, state.gateway, state.methods, addr.ip()))
        .into_response()
}
