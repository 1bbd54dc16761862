use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use tokio::sync::{RwLock, mpsc};

use atc_auth::Authenticator;
use atc_communicator::NodeCommunicator;
use atc_nodes::NodeSessionManager;
use atc_orchestrator::TaskOrchestrator;
use atc_ratelimit::RateLimiter;

use crate::node_transport::GatewayNodeTransport;

/// A WebSocket client currently connected to the gateway.
pub struct ConnectedClient {
    pub conn_id: String,
    pub client_type: String,
    pub scopes: Vec<String>,
    pub sender: mpsc::UnboundedSender<String>,
    pub connected_at: Instant,
}

impl ConnectedClient {
    pub fn send(&self, frame: &str) -> bool {
        self.sender.send(frame.to_string()).is_ok()
    }
}

/// A node's socket, registered once its `connect` handshake completes with
/// `clientType: "node"`. [`GatewayNodeTransport`] looks these up to deliver
/// [`atc_communicator::NodeCommunicator`] requests.
pub struct NodeSocket {
    pub node_id: String,
    pub conn_id: String,
    pub sender: mpsc::UnboundedSender<String>,
}

/// Everything a gateway connection handler or method handler needs, wired
/// together once at startup and shared via `Arc`.
pub struct GatewayState {
    pub clients: RwLock<HashMap<String, ConnectedClient>>,
    pub node_sockets: RwLock<HashMap<String, NodeSocket>>,
    pub seq: AtomicU64,
    pub started_at: Instant,
    pub rate_limiter: Arc<RateLimiter>,
    pub authenticator: Arc<Authenticator>,
    pub node_sessions: Arc<NodeSessionManager>,
    pub node_communicator: Arc<NodeCommunicator<GatewayNodeTransport>>,
    pub orchestrator: Arc<TaskOrchestrator>,
}

impl GatewayState {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        authenticator: Arc<Authenticator>,
        node_sessions: Arc<NodeSessionManager>,
        orchestrator: Arc<TaskOrchestrator>,
    ) -> Arc<Self> {
        let state = Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            node_sockets: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            started_at: Instant::now(),
            rate_limiter,
            authenticator,
            node_sessions,
            node_communicator: Arc::new(NodeCommunicator::new(GatewayNodeTransport::new())),
            orchestrator,
        });
        state.node_communicator.transport().bind(Arc::clone(&state));
        state
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn register_client(&self, client: ConnectedClient) {
        self.clients.write().await.insert(client.conn_id.clone(), client);
    }

    pub async fn remove_client(&self, conn_id: &str) -> Option<ConnectedClient> {
        self.clients.write().await.remove(conn_id)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn register_node(&self, node_id: &str, conn_id: &str, sender: mpsc::UnboundedSender<String>) {
        self.node_sockets.write().await.insert(
            node_id.to_string(),
            NodeSocket {
                node_id: node_id.to_string(),
                conn_id: conn_id.to_string(),
                sender,
            },
        );
    }

    /// Unregister the node socket for `conn_id`, if any, and cancel any of
    /// the communicator's requests still pending against it (spec §4.7:
    /// only requests targeting the disconnecting node are rejected).
    pub async fn unregister_node_by_conn(&self, conn_id: &str) {
        let node_id = {
            let mut sockets = self.node_sockets.write().await;
            let node_id = sockets
                .values()
                .find(|s| s.conn_id == conn_id)
                .map(|s| s.node_id.clone());
            if let Some(id) = &node_id {
                sockets.remove(id);
            }
            node_id
        };
        if let Some(node_id) = node_id {
            self.node_communicator.cancel_for_node(&node_id).await;
            self.node_sessions.mark_offline(&node_id).await;
        }
    }

    pub async fn node_count(&self) -> usize {
        self.node_sockets.read().await.len()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}
