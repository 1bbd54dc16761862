use std::{net::IpAddr, sync::Arc, time::Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, stream::SplitStream, stream::StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use atc_protocol::{InboundFrame, RpcError, RpcResponse, defaults, error_codes};

use crate::{
    broadcast::broadcast,
    methods::{Dispatched, MethodContext, MethodRegistry},
    state::{ConnectedClient, GatewayState},
};

/// Handle a single WebSocket connection end to end: admission, handshake,
/// message loop, cleanup (spec §4.1).
///
/// Admission order: (1) rate limit on `peer_ip`, checked here as the very
/// first step, closing the socket with code 1008 (policy violation) and
/// returning before anything else runs. (2)-(4) happen after: register the
/// socket, wait for `connect`, validate the token, assign a `clientId`.
pub async fn handle_connection(mut socket: WebSocket, state: Arc<GatewayState>, methods: Arc<MethodRegistry>, peer_ip: IpAddr) {
    if !state.rate_limiter.check_ip(peer_ip) {
        warn!(%peer_ip, "ws: rate limit exceeded, closing with 1008");
        let frame = CloseFrame { code: 1008, reason: "rate limit exceeded".into() };
        let _ = socket.send(Message::Close(Some(frame))).await;
        return;
    }

    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, %peer_ip, "ws: new connection");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<String>();

    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = client_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                debug!(conn_id = %write_conn_id, "ws: write loop closed");
                break;
            }
        }
    });

    let handshake = tokio::time::timeout(
        std::time::Duration::from_millis(defaults::HANDSHAKE_TIMEOUT_MS),
        wait_for_connect(&mut ws_rx),
    )
    .await;

    let (request_id, params) = match handshake {
        Ok(Ok(parsed)) => parsed,
        Ok(Err(e)) => {
            warn!(conn_id = %conn_id, error = %e, "ws: handshake failed");
            drop(client_tx);
            write_handle.abort();
            return;
        },
        Err(_) => {
            warn!(conn_id = %conn_id, "ws: handshake timeout");
            drop(client_tx);
            write_handle.abort();
            return;
        },
    };

    let token = params.get("token").and_then(Value::as_str).unwrap_or("");
    if let Err(e) = state.authenticator.validate_token(token) {
        warn!(conn_id = %conn_id, error = %e, "ws: auth failed");
        let err = RpcResponse::err(
            request_id,
            RpcError::new(error_codes::INVALID_REQUEST, "authentication failed").with_domain_code(e.domain_code()),
        );
        let _ = client_tx.send(serde_json::to_string(&err).unwrap_or_default());
        drop(client_tx);
        write_handle.abort();
        return;
    }

    let client_type = params.get("clientType").and_then(Value::as_str).unwrap_or("operator").to_string();
    let version = params.get("version").and_then(Value::as_str).unwrap_or("0").to_string();
    let connected_at = Instant::now();
    let connected_at_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let result = RpcResponse::ok(
        request_id,
        json!({
            "clientId": conn_id,
            "type": client_type,
            "version": version,
            "connectedAt": connected_at_ms,
        }),
    );
    let _ = client_tx.send(serde_json::to_string(&result).unwrap_or_default());

    state
        .register_client(ConnectedClient {
            conn_id: conn_id.clone(),
            client_type: client_type.clone(),
            scopes: Vec::new(),
            sender: client_tx.clone(),
            connected_at,
        })
        .await;

    // A `clientType: "node"` connect with a `pairingCode` completes node
    // pairing as part of the handshake, rather than via a separate RPC
    // method (spec §6's RPC table enumerates none for pairing).
    if client_type == "node"
        && let Some(code) = params.get("pairingCode").and_then(Value::as_str)
    {
        let node_id = params.get("nodeId").and_then(Value::as_str).unwrap_or(&conn_id);
        let node_name = params.get("nodeName").and_then(Value::as_str).unwrap_or("node");
        let platform = params.get("platform").and_then(Value::as_str).unwrap_or("unknown");
        match state
            .node_sessions
            .complete_pairing(code, &conn_id, node_id, node_name, platform)
            .await
        {
            Ok(connection) => {
                state.register_node(&connection.node_id, &conn_id, client_tx.clone()).await;
                info!(conn_id = %conn_id, node_id = %connection.node_id, "ws: node paired");
            },
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "ws: pairing failed");
            },
        }
    }

    info!(conn_id = %conn_id, client_type = %client_type, "ws: handshake complete");

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "ws: read error");
                break;
            },
        };

        if text.len() > defaults::MAX_PAYLOAD_BYTES {
            warn!(conn_id = %conn_id, size = text.len(), "ws: payload too large");
            continue;
        }

        let frame: InboundFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "ws: parse error");
                let err = RpcResponse::err(Value::Null, RpcError::new(error_codes::PARSE_ERROR, "invalid JSON"));
                let _ = client_tx.send(serde_json::to_string(&err).unwrap_or_default());
                continue;
            },
        };

        if !frame.is_well_formed_request() {
            warn!(conn_id = %conn_id, "ws: malformed request");
            let err = RpcResponse::err(
                frame.id.unwrap_or(Value::Null),
                RpcError::new(error_codes::INVALID_REQUEST, "malformed JSON-RPC 2.0 request"),
            );
            let _ = client_tx.send(serde_json::to_string(&err).unwrap_or_default());
            continue;
        }

        let Some(id) = frame.id.clone() else {
            debug!(conn_id = %conn_id, "ws: ignoring notification-shaped frame");
            continue;
        };
        let method = frame.method.clone().unwrap_or_default();
        let is_disconnect = method == "disconnect";

        let ctx = MethodContext {
            request_id: id.clone(),
            method,
            params: frame.params.unwrap_or(Value::Null),
            conn_id: conn_id.clone(),
            client_type: client_type.clone(),
            state: Arc::clone(&state),
        };

        let response = match methods.dispatch(ctx).await {
            Dispatched::Ok(payload) => RpcResponse::ok(id, payload),
            Dispatched::Err(err) => RpcResponse::err(id, err),
        };
        let _ = client_tx.send(serde_json::to_string(&response).unwrap_or_default());

        if is_disconnect {
            break;
        }
    }

    state.unregister_node_by_conn(&conn_id).await;
    let duration = state
        .remove_client(&conn_id)
        .await
        .map(|c| c.connected_at.elapsed())
        .unwrap_or_default();
    info!(conn_id = %conn_id, duration_secs = duration.as_secs(), "ws: connection closed");

    broadcast(&state, "presence", json!({ "type": "disconnected", "clientId": conn_id })).await;

    drop(client_tx);
    write_handle.abort();
}

/// Wait for the first `connect` request frame and return its id and params.
async fn wait_for_connect(rx: &mut SplitStream<WebSocket>) -> anyhow::Result<(Value, Value)> {
    while let Some(msg) = rx.next().await {
        let text = match msg? {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => anyhow::bail!("connection closed before handshake"),
            _ => continue,
        };

        let frame: InboundFrame = serde_json::from_str(&text)?;
        if !frame.is_well_formed_request() {
            anyhow::bail!("first message must be a well-formed JSON-RPC request");
        }
        let method = frame.method.clone().unwrap_or_default();
        if method != "connect" {
            anyhow::bail!("first message must be 'connect', got '{method}'");
        }
        let id = frame.id.unwrap_or(Value::Null);
        return Ok((id, frame.params.unwrap_or(Value::Null)));
    }
    anyhow::bail!("connection closed before handshake")
}
