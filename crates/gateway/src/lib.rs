//! Gateway: the loopback WebSocket/JSON-RPC 2.0 server (spec §4.1, §6).
//!
//! Lifecycle:
//! 1. Construct the already-built components (rate limiter, authenticator,
//!    node sessions, orchestrator) and wire them into a [`GatewayState`].
//! 2. Spawn the event bridge that turns orchestrator events into client
//!    notifications.
//! 3. Serve the WebSocket/HTTP router until shutdown.
//!
//! All task and tool logic lives in the other `atc-*` crates; this crate is
//! wire protocol, admission, and connection bookkeeping only.

mod bridge;
mod broadcast;
mod methods;
mod node_transport;
mod server;
mod state;
mod ws;

pub use broadcast::{broadcast, send_to_client};
pub use methods::{MethodContext, MethodRegistry, MethodResult};
pub use server::{router, serve};
pub use state::{ConnectedClient, GatewayState};

use std::sync::Arc;

use atc_auth::Authenticator;
use atc_nodes::NodeSessionManager;
use atc_orchestrator::TaskOrchestrator;
use atc_ratelimit::RateLimiter;

/// Build a [`GatewayState`] from its already-constructed dependencies and
/// spawn the orchestrator event bridge. The returned `Arc` is what
/// [`server::serve`] expects.
pub fn build(
    rate_limiter: Arc<RateLimiter>,
    authenticator: Arc<Authenticator>,
    node_sessions: Arc<NodeSessionManager>,
    orchestrator: Arc<TaskOrchestrator>,
) -> Arc<GatewayState> {
    let state = GatewayState::new(rate_limiter, authenticator, node_sessions, orchestrator);
    tokio::spawn(bridge::run(Arc::clone(&state)));
    state
}
