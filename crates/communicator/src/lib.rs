//! Correlated request/response messaging to remote node companions (C7,
//! spec §4.7). Keeps no reference back to the gateway: callers configure a
//! [`NodeTransport`] implementation to avoid the cyclic dependency between
//! the communicator and whatever owns the actual sockets.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use atc_protocol::defaults;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("node '{0}' is not connected")]
    NotConnected(String),
    #[error("send to node failed: {0}")]
    SendFailed(String),
}

/// Abstraction over however the caller actually reaches a node's socket.
/// Implemented by the component that owns node connections; the
/// communicator only ever talks to this trait.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn send_to_node(
        &self,
        node_id: &str,
        method: &str,
        params: Value,
        correlation_id: &str,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum CommunicatorError {
    #[error("node '{0}' is not connected")]
    NotConnected(String),
    #[error("node request timed out")]
    Timeout,
    #[error("node disconnected while request was pending")]
    NodeDisconnected,
    #[error("communicator is shutting down")]
    Shutdown,
    #[error("node request failed: {0}")]
    Remote(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<TransportError> for CommunicatorError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotConnected(node_id) => CommunicatorError::NotConnected(node_id),
            TransportError::SendFailed(msg) => CommunicatorError::Transport(msg),
        }
    }
}

type NodeResult = Result<Value, CommunicatorError>;

struct PendingNodeRequest {
    node_id: String,
    deadline: Instant,
    tx: oneshot::Sender<NodeResult>,
}

pub struct NodeCommunicator<T: NodeTransport> {
    transport: T,
    pending: Mutex<HashMap<String, PendingNodeRequest>>,
    sweep_ttl: Duration,
    shutting_down: AtomicBool,
}

impl<T: NodeTransport> NodeCommunicator<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            sweep_ttl: Duration::from_millis(defaults::PENDING_NODE_REQUEST_SWEEP_TTL_MS),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Send `method`/`params` to `node_id` and await its correlated
    /// response, or time out after `timeout_ms` (defaults to the node RPC
    /// timeout if `None`).
    pub async fn send_and_wait(
        &self,
        node_id: &str,
        method: &str,
        params: Value,
        timeout_ms: Option<u64>,
    ) -> NodeResult {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(CommunicatorError::Shutdown);
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(defaults::NODE_RPC_TIMEOUT_MS));
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                correlation_id.clone(),
                PendingNodeRequest {
                    node_id: node_id.to_string(),
                    deadline: Instant::now() + timeout,
                    tx,
                },
            );
        }

        if let Err(e) = self
            .transport
            .send_to_node(node_id, method, params, &correlation_id)
            .await
        {
            self.pending.lock().await.remove(&correlation_id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CommunicatorError::NodeDisconnected),
            Err(_) => {
                self.pending.lock().await.remove(&correlation_id);
                debug!(node_id, correlation_id, "node request timed out");
                Err(CommunicatorError::Timeout)
            },
        }
    }

    /// Deliver a node's response for `correlation_id`. Returns `false` if
    /// no such request is pending (already resolved, timed out, or
    /// unknown).
    pub async fn resolve(&self, correlation_id: &str, result: Result<Value, String>) -> bool {
        let Some(pending) = self.pending.lock().await.remove(correlation_id) else {
            return false;
        };
        let mapped = result.map_err(CommunicatorError::Remote);
        pending.tx.send(mapped).is_ok()
    }

    /// Reject every request pending against `node_id`, e.g. on disconnect.
    /// Returns the number of requests cancelled.
    pub async fn cancel_for_node(&self, node_id: &str) -> usize {
        let mut pending = self.pending.lock().await;
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.node_id == node_id)
            .map(|(id, _)| id.clone())
            .collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some(p) = pending.remove(&id) {
                let _ = p.tx.send(Err(CommunicatorError::NodeDisconnected));
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            warn!(node_id, cancelled, "cancelled pending node requests on disconnect");
        }
        cancelled
    }

    /// Remove and reject requests whose deadline has passed. Call
    /// periodically (default every [`defaults::PENDING_NODE_REQUEST_SWEEP_TTL_MS`]).
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    async fn sweep_at(&self, now: Instant) -> usize {
        let mut pending = self.pending.lock().await;
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(id, _)| id.clone())
            .collect();
        let count = expired.len();
        for id in expired {
            if let Some(p) = pending.remove(&id) {
                let _ = p.tx.send(Err(CommunicatorError::Timeout));
            }
        }
        count
    }

    pub fn sweep_ttl(&self) -> Duration {
        self.sweep_ttl
    }

    /// The configured transport, for callers that need to finish wiring it
    /// up (e.g. binding a back-reference) after construction.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Reject every pending request and stop accepting new ones.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let mut pending = self.pending.lock().await;
        for (_, p) in pending.drain() {
            let _ = p.tx.send(Err(CommunicatorError::Shutdown));
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        sent: StdMutex<Vec<(String, String, String)>>,
        fail_node: Option<String>,
    }

    #[async_trait]
    impl NodeTransport for RecordingTransport {
        async fn send_to_node(
            &self,
            node_id: &str,
            method: &str,
            _params: Value,
            correlation_id: &str,
        ) -> Result<(), TransportError> {
            if self.fail_node.as_deref() == Some(node_id) {
                return Err(TransportError::NotConnected(node_id.to_string()));
            }
            self.sent.lock().unwrap().push((
                node_id.to_string(),
                method.to_string(),
                correlation_id.to_string(),
            ));
            Ok(())
        }
    }

    #[tokio::test]
    async fn resolves_matching_correlation_id() {
        let comm = NodeCommunicator::new(RecordingTransport::default());
        let comm = std::sync::Arc::new(comm);
        let c2 = comm.clone();
        let handle = tokio::spawn(async move {
            c2.send_and_wait("node-1", "exec", serde_json::json!({}), Some(1_000))
                .await
        });

        // Give the request a moment to register, then resolve it as the
        // node would.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let correlation_id = {
            let pending = comm.pending.lock().await;
            pending.keys().next().unwrap().clone()
        };
        assert!(
            comm.resolve(&correlation_id, Ok(serde_json::json!({"ok": true})))
                .await
        );

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn unknown_node_rejects_immediately() {
        let comm = NodeCommunicator::new(RecordingTransport {
            fail_node: Some("node-x".to_string()),
            ..Default::default()
        });
        let result = comm
            .send_and_wait("node-x", "exec", serde_json::json!({}), Some(1_000))
            .await;
        assert!(matches!(result, Err(CommunicatorError::NotConnected(_))));
    }

    #[tokio::test]
    async fn times_out_when_unresolved() {
        let comm = NodeCommunicator::new(RecordingTransport::default());
        let result = comm
            .send_and_wait("node-1", "exec", serde_json::json!({}), Some(10))
            .await;
        assert!(matches!(result, Err(CommunicatorError::Timeout)));
        assert_eq!(comm.pending_count().await, 0);
    }

    #[tokio::test]
    async fn cancel_for_node_rejects_only_that_nodes_requests() {
        let comm = std::sync::Arc::new(NodeCommunicator::new(RecordingTransport::default()));
        let c1 = comm.clone();
        let c2 = comm.clone();
        let h1 = tokio::spawn(async move {
            c1.send_and_wait("node-1", "exec", serde_json::json!({}), Some(5_000))
                .await
        });
        let h2 = tokio::spawn(async move {
            c2.send_and_wait("node-2", "exec", serde_json::json!({}), Some(5_000))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let cancelled = comm.cancel_for_node("node-1").await;
        assert_eq!(cancelled, 1);

        let r1 = h1.await.unwrap();
        assert!(matches!(r1, Err(CommunicatorError::NodeDisconnected)));
        assert_eq!(comm.pending_count().await, 1);

        comm.resolve(
            comm.pending.lock().await.keys().next().unwrap(),
            Ok(serde_json::json!(null)),
        )
        .await;
        let _ = h2.await.unwrap();
    }

    #[tokio::test]
    async fn sweep_expires_past_deadline_requests() {
        let comm = NodeCommunicator::new(RecordingTransport::default());
        let (tx, _rx) = oneshot::channel();
        comm.pending.lock().await.insert(
            "corr-1".to_string(),
            PendingNodeRequest {
                node_id: "node-1".to_string(),
                deadline: Instant::now() - Duration::from_secs(1),
                tx,
            },
        );
        let swept = comm.sweep_at(Instant::now()).await;
        assert_eq!(swept, 1);
        assert_eq!(comm.pending_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_pending_and_future_requests() {
        let comm = std::sync::Arc::new(NodeCommunicator::new(RecordingTransport::default()));
        let c2 = comm.clone();
        let handle = tokio::spawn(async move {
            c2.send_and_wait("node-1", "exec", serde_json::json!({}), Some(5_000))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        comm.shutdown().await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(CommunicatorError::Shutdown)));

        let post_shutdown = comm
            .send_and_wait("node-1", "exec", serde_json::json!({}), Some(1_000))
            .await;
        assert!(matches!(post_shutdown, Err(CommunicatorError::Shutdown)));
    }
}
