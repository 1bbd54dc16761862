//! Forwards [`atc_orchestrator::OrchestratorEvent`]s onto connected clients
//! as the notifications spec §6 defines: `chat.response`,
//! `approval.requested`, `approval.resolved`. `TaskState` transitions are
//! internal bookkeeping (spec §6 names no wire shape for them) and are only
//! logged.

use std::sync::Arc;

use atc_orchestrator::OrchestratorEvent;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::{broadcast::broadcast, state::GatewayState};

pub async fn run(state: Arc<GatewayState>) {
    let mut rx = state.orchestrator.events().subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => handle(&state, event).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "gateway: event bridge fell behind orchestrator");
            },
            Err(RecvError::Closed) => {
                debug!("gateway: orchestrator event bus closed, bridge stopping");
                return;
            },
        }
    }
}

async fn handle(state: &Arc<GatewayState>, event: OrchestratorEvent) {
    match event {
        OrchestratorEvent::TaskState {
            task_id,
            current,
            previous,
            ..
        } => {
            debug!(task_id, ?previous, ?current, "gateway: task state transition");
        },
        OrchestratorEvent::ChatResponse {
            task_id,
            channel_id,
            text,
            status,
            metadata,
        } => {
            broadcast(
                state,
                "chat.response",
                json!({
                    "taskId": task_id,
                    "channelId": channel_id,
                    "text": text,
                    "status": status,
                    "metadata": metadata,
                }),
            )
            .await;
        },
        OrchestratorEvent::ApprovalRequested {
            task_id,
            channel_id,
            tool_id,
            input,
            request_id,
        } => {
            broadcast(
                state,
                "approval.requested",
                json!({
                    "taskId": task_id,
                    "channelId": channel_id,
                    "toolId": tool_id,
                    "input": input,
                    "requestId": request_id,
                }),
            )
            .await;
        },
        OrchestratorEvent::ApprovalResolved {
            task_id,
            channel_id,
            approved,
            request_id,
        } => {
            broadcast(
                state,
                "approval.resolved",
                json!({
                    "taskId": task_id,
                    "channelId": channel_id,
                    "approved": approved,
                    "requestId": request_id,
                }),
            )
            .await;
        },
    }
}
