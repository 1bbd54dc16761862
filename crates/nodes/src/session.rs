use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use {
    rand::Rng,
    serde::{Deserialize, Serialize},
    tokio::sync::RwLock,
    tracing::{debug, warn},
};

use atc_protocol::{PAIRING_ALPHABET, PAIRING_CODE_LEN, defaults};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node '{0}' not found")]
    NodeNotFound(String),
    #[error("pairing code not found or already consumed")]
    PairingCodeNotFound,
    #[error("pairing code expired")]
    PairingCodeExpired,
    #[error("user already has the maximum of {0} paired nodes")]
    NodeLimitReached(usize),
}

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Paired,
    Pending,
    Offline,
    Expired,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub screen_capture: bool,
    pub command_exec: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Consent {
    pub granted: bool,
    pub granted_at: Option<Instant>,
    pub expires_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct NodeConnection {
    pub node_id: String,
    pub socket_id: String,
    pub user_id: String,
    pub node_name: String,
    pub platform: String,
    pub capabilities: Capabilities,
    pub consent: Consent,
    pub status: NodeStatus,
    pub paired_at: Instant,
    pub last_seen: Instant,
}

#[derive(Debug, Clone)]
pub struct PairingCode {
    pub code: String,
    pub user_id: String,
    pub created_at: Instant,
    pub expires_at: Instant,
}

struct SessionManagerState {
    nodes: HashMap<String, NodeConnection>,
    pairing_codes: HashMap<String, PairingCode>,
}

pub struct NodeSessionManager {
    state: RwLock<SessionManagerState>,
    max_nodes_per_user: usize,
    pairing_ttl: Duration,
    idle_timeout: Duration,
}

impl Default for NodeSessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeSessionManager {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SessionManagerState {
                nodes: HashMap::new(),
                pairing_codes: HashMap::new(),
            }),
            max_nodes_per_user: defaults::MAX_NODES_PER_USER,
            pairing_ttl: Duration::from_millis(defaults::PAIRING_CODE_TTL_MS),
            idle_timeout: Duration::from_millis(defaults::SESSION_TASK_MAPPING_TTL_MS),
        }
    }

    /// Draw a fresh, unique 8-character pairing code for `user_id`. Fails
    /// once the user already owns `nodesPerUser` paired nodes.
    pub async fn generate_pairing_code(&self, user_id: &str) -> Result<String> {
        let mut state = self.state.write().await;
        let paired_count = state
            .nodes
            .values()
            .filter(|n| n.user_id == user_id && n.status == NodeStatus::Paired)
            .count();
        if paired_count >= self.max_nodes_per_user {
            return Err(NodeError::NodeLimitReached(self.max_nodes_per_user));
        }

        let now = Instant::now();
        let code = loop {
            let candidate = random_code();
            if !state.pairing_codes.contains_key(&candidate) {
                break candidate;
            }
        };
        state.pairing_codes.insert(
            code.clone(),
            PairingCode {
                code: code.clone(),
                user_id: user_id.to_string(),
                created_at: now,
                expires_at: now + self.pairing_ttl,
            },
        );
        debug!(user_id, code = %code, "pairing code generated");
        Ok(code)
    }

    /// Consume a pairing code and register (or update) the node connection.
    pub async fn complete_pairing(
        &self,
        code: &str,
        socket_id: &str,
        node_id: &str,
        node_name: &str,
        platform: &str,
    ) -> Result<NodeConnection> {
        let mut state = self.state.write().await;
        let pairing = state
            .pairing_codes
            .remove(code)
            .ok_or(NodeError::PairingCodeNotFound)?;
        if Instant::now() > pairing.expires_at {
            return Err(NodeError::PairingCodeExpired);
        }

        let now = Instant::now();
        // Update an existing connection for the same (userId, nodeName) pair
        // rather than creating a duplicate.
        let existing_key = state
            .nodes
            .values()
            .find(|n| n.user_id == pairing.user_id && n.node_name == node_name)
            .map(|n| n.node_id.clone());

        let connection = NodeConnection {
            node_id: node_id.to_string(),
            socket_id: socket_id.to_string(),
            user_id: pairing.user_id.clone(),
            node_name: node_name.to_string(),
            platform: platform.to_string(),
            capabilities: Capabilities::default(),
            consent: Consent::default(),
            status: NodeStatus::Paired,
            paired_at: now,
            last_seen: now,
        };

        if let Some(old_id) = existing_key {
            state.nodes.remove(&old_id);
        }
        state.nodes.insert(node_id.to_string(), connection.clone());
        debug!(node_id, user_id = %pairing.user_id, "node paired");
        Ok(connection)
    }

    pub async fn grant_screen_capture_consent(
        &self,
        node_id: &str,
        duration_ms: Option<u64>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| NodeError::NodeNotFound(node_id.to_string()))?;
        let now = Instant::now();
        node.consent = Consent {
            granted: true,
            granted_at: Some(now),
            expires_at: duration_ms.map(|ms| now + Duration::from_millis(ms)),
        };
        Ok(())
    }

    /// Whether screen-capture consent is currently active, lazily revoking
    /// an expired grant.
    pub async fn has_screen_capture_consent(&self, node_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(node) = state.nodes.get_mut(node_id) else {
            return false;
        };
        if !node.consent.granted {
            return false;
        }
        if let Some(expires_at) = node.consent.expires_at
            && Instant::now() > expires_at
        {
            node.consent = Consent::default();
            return false;
        }
        true
    }

    pub async fn touch(&self, node_id: &str) {
        if let Some(node) = self.state.write().await.nodes.get_mut(node_id) {
            node.last_seen = Instant::now();
        }
    }

    pub async fn mark_offline(&self, node_id: &str) {
        if let Some(node) = self.state.write().await.nodes.get_mut(node_id) {
            node.status = NodeStatus::Offline;
        }
    }

    pub async fn get(&self, node_id: &str) -> Option<NodeConnection> {
        self.state.read().await.nodes.get(node_id).cloned()
    }

    pub async fn is_paired(&self, node_id: &str) -> bool {
        self.state
            .read()
            .await
            .nodes
            .get(node_id)
            .is_some_and(|n| n.status == NodeStatus::Paired)
    }

    pub async fn list_for_user(&self, user_id: &str) -> Vec<NodeConnection> {
        self.state
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Evict offline nodes past the idle timeout and expired pairing codes.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let idle_timeout = self.idle_timeout;
        let mut state = self.state.write().await;
        state.nodes.retain(|_, n| {
            !(n.status == NodeStatus::Offline && now.duration_since(n.last_seen) > idle_timeout)
        });
        state.pairing_codes.retain(|_, p| now <= p.expires_at);
    }
}

fn random_code() -> String {
    let mut rng = rand::rng();
    (0..PAIRING_CODE_LEN)
        .map(|_| {
            let idx = rng.random_range(0..PAIRING_ALPHABET.len());
            PAIRING_ALPHABET[idx] as char
        })
        .collect()
}
