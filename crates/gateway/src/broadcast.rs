use std::sync::Arc;

use atc_protocol::RpcNotification;
use serde_json::Value;
use tracing::{debug, warn};

use crate::state::GatewayState;

/// Broadcast a notification to every connected client. A client whose write
/// channel is closed is left for the connection handler's own cleanup to
/// remove; a single slow or dead client never blocks the others.
pub async fn broadcast(state: &Arc<GatewayState>, method: &str, params: Value) {
    let notification = RpcNotification::new(method, params);
    let json = match serde_json::to_string(&notification) {
        Ok(j) => j,
        Err(e) => {
            warn!("failed to serialize broadcast notification: {e}");
            return;
        },
    };

    let clients = state.clients.read().await;
    debug!(method, clients = clients.len(), "broadcasting notification");
    for client in clients.values() {
        let _ = client.send(&json);
    }
}

/// Send a notification to exactly one client, keyed by connection id.
pub async fn send_to_client(state: &Arc<GatewayState>, conn_id: &str, method: &str, params: Value) -> bool {
    let notification = RpcNotification::new(method, params);
    let json = match serde_json::to_string(&notification) {
        Ok(j) => j,
        Err(e) => {
            warn!("failed to serialize targeted notification: {e}");
            return false;
        },
    };
    match state.clients.read().await.get(conn_id) {
        Some(client) => client.send(&json),
        None => false,
    }
}
