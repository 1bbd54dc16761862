//! Minimal event bus for approval signals. Spec §4.6: "`emit` is a minimal
//! event bus; subscribers register by event name."

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum ToolEvent {
    ApprovalRequested {
        request_id: String,
        session_id: String,
        tool_id: String,
        input: serde_json::Value,
    },
    ApprovalResolved {
        request_id: String,
        approved: bool,
    },
    ApprovalCancelled {
        request_id: String,
    },
}

/// Broadcast bus: every subscriber sees every event and filters for the
/// ones it cares about. Lagging subscribers drop old events rather than
/// block publishers (spec §5: no suspension-point locks).
#[derive(Clone)]
pub struct ToolEventBus {
    tx: broadcast::Sender<ToolEvent>,
}

impl Default for ToolEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolEventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ToolEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ToolEvent) {
        // No subscribers is not an error; approvals still resolve via the
        // pending table, events are purely observational for the gateway.
        let _ = self.tx.send(event);
    }
}
