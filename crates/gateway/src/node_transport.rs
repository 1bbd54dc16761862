use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use atc_communicator::{NodeTransport, TransportError};
use atc_protocol::RpcRequest;
use serde_json::Value;

use crate::state::GatewayState;

/// Delivers [`atc_communicator::NodeCommunicator`] requests over whichever
/// node socket is currently registered for a `nodeId`. Holds only a `Weak`
/// back-reference to [`GatewayState`] (bound once at startup via [`bind`])
/// so `GatewayState -> NodeCommunicator -> GatewayNodeTransport -> GatewayState`
/// never keeps the state alive past its last strong owner.
#[derive(Default)]
pub struct GatewayNodeTransport {
    state: OnceLock<Weak<GatewayState>>,
}

impl GatewayNodeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the transport to the gateway state it delivers into. Called
    /// exactly once, from `GatewayState::new`, immediately after the state
    /// (and thus its `Arc`) exists.
    pub fn bind(&self, state: Arc<GatewayState>) {
        let _ = self.state.set(Arc::downgrade(&state));
    }
}

#[async_trait]
impl NodeTransport for GatewayNodeTransport {
    async fn send_to_node(
        &self,
        node_id: &str,
        method: &str,
        params: Value,
        correlation_id: &str,
    ) -> Result<(), TransportError> {
        let state = self
            .state
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::SendFailed("gateway state no longer available".into()))?;

        let sockets = state.node_sockets.read().await;
        let socket = sockets
            .get(node_id)
            .ok_or_else(|| TransportError::NotConnected(node_id.to_string()))?;

        let request = RpcRequest::new(Value::String(correlation_id.to_string()), method, params);
        let frame = serde_json::to_string(&request)
            .map_err(|e| TransportError::SendFailed(format!("failed to serialize request: {e}")))?;

        socket
            .sender
            .send(frame)
            .map_err(|_| TransportError::SendFailed(format!("node '{node_id}' write channel closed")))
    }
}
