use atc_protocol::{ChatStatus, TaskState};
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    TaskState {
        task_id: String,
        channel_id: String,
        previous: TaskState,
        current: TaskState,
        timestamp_ms: u64,
    },
    ChatResponse {
        task_id: String,
        channel_id: String,
        text: Option<String>,
        status: ChatStatus,
        metadata: Value,
    },
    ApprovalRequested {
        task_id: String,
        channel_id: String,
        tool_id: String,
        input: Value,
        request_id: String,
    },
    ApprovalResolved {
        task_id: String,
        channel_id: String,
        approved: bool,
        request_id: String,
    },
}

/// Fan-out of orchestrator state changes to subscribers (`onResponse` /
/// `onTaskState` / `onApprovalRequest` / `onApprovalResolved` in spec
/// terms). A lagging or dropped subscriber only affects itself.
pub struct OrchestratorEventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl Default for OrchestratorEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(512);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: OrchestratorEvent) {
        // No receivers is a legitimate state (no subscribers yet); ignore.
        let _ = self.sender.send(event);
    }
}
