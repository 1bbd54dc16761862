use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use atc_protocol::{RpcError, TaskState, error_codes};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::state::GatewayState;

/// Context passed to every method handler (spec §6 RPC table).
pub struct MethodContext {
    pub request_id: Value,
    pub method: String,
    pub params: Value,
    pub conn_id: String,
    pub client_type: String,
    pub state: Arc<GatewayState>,
}

/// The result a method handler produces; `Err` is mapped onto a JSON-RPC
/// error response by [`MethodRegistry::dispatch`].
pub type MethodResult = Result<Value, RpcError>;

pub type HandlerFn =
    Box<dyn Fn(MethodContext) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

/// A response ready to serialize back onto the wire, distinguishing `Ok`
/// from `Err` the way [`atc_protocol::RpcResponse::ok`]/`::err` do.
pub enum Dispatched {
    Ok(Value),
    Err(RpcError),
}

pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register_defaults();
        registry
    }

    pub fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(method.into(), handler);
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up and invoke the handler for `ctx.method`. Unknown methods
    /// yield `-32601` (spec §4.1); a handler returning `Err` is never
    /// treated as a crash -- it is just mapped to a normal error response.
    pub async fn dispatch(&self, ctx: MethodContext) -> Dispatched {
        let method = ctx.method.clone();
        let conn_id = ctx.conn_id.clone();

        let Some(handler) = self.handlers.get(&method) else {
            warn!(method, conn_id = %conn_id, "unknown method");
            return Dispatched::Err(RpcError::new(
                error_codes::METHOD_NOT_FOUND,
                format!("unknown method: {method}"),
            ));
        };

        debug!(method, conn_id = %conn_id, "dispatching method");
        match handler(ctx).await {
            Ok(payload) => Dispatched::Ok(payload),
            Err(err) => {
                warn!(method, conn_id = %conn_id, code = err.code, msg = %err.message, "method error");
                Dispatched::Err(err)
            },
        }
    }

    fn register_defaults(&mut self) {
        self.register("chat.send", Box::new(|ctx| Box::pin(chat_send(ctx))));
        self.register("approval.list", Box::new(|ctx| Box::pin(approval_list(ctx))));
        self.register("approval.grant", Box::new(|ctx| Box::pin(approval_grant(ctx))));
        self.register("session.get", Box::new(|ctx| Box::pin(session_get(ctx))));
        self.register("disconnect", Box::new(|ctx| Box::pin(disconnect(ctx))));
        self.register("health", Box::new(|ctx| Box::pin(health(ctx))));
    }
}

fn invalid_params(message: impl Into<String>) -> RpcError {
    RpcError::new(error_codes::INVALID_PARAMS, message.into())
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn task_state_str(state: TaskState) -> &'static str {
    match state {
        TaskState::Pending => "PENDING",
        TaskState::Running => "RUNNING",
        TaskState::Paused => "PAUSED",
        TaskState::Done => "DONE",
        TaskState::Failed => "FAILED",
        TaskState::Aborted => "ABORTED",
    }
}

// ── chat.send ────────────────────────────────────────────────────────────────

async fn chat_send(ctx: MethodContext) -> MethodResult {
    let agent_id = ctx
        .params
        .get("agentId")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_params("chat.send requires 'agentId'"))?;
    let user_id = ctx
        .params
        .get("userId")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_params("chat.send requires 'userId'"))?;
    let channel_id = ctx
        .params
        .get("channelId")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_params("chat.send requires 'channelId'"))?;
    let text = ctx
        .params
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_params("chat.send requires 'text'"))?;
    let metadata = ctx.params.get("metadata").cloned().unwrap_or(Value::Null);

    let result = ctx
        .state
        .orchestrator
        .create_task(agent_id, user_id, channel_id, text, metadata)
        .await;

    Ok(json!({
        "taskId": result.task_id,
        "state": task_state_str(result.state),
        "status": "queued",
    }))
}

// ── approval.list ────────────────────────────────────────────────────────────

async fn approval_list(ctx: MethodContext) -> MethodResult {
    let pending = ctx.state.orchestrator.list_pending_approvals().await;
    let now = now_ms();
    let entries: Vec<Value> = pending
        .iter()
        .map(|p| {
            json!({
                "taskId": p.task_id,
                "channelId": p.channel_id,
                "toolId": p.tool_id,
                "requestedAt": now.saturating_sub(p.requested_at.elapsed().as_millis() as u64),
            })
        })
        .collect();
    Ok(json!({ "pending": entries, "count": entries.len() }))
}

// ── approval.grant ───────────────────────────────────────────────────────────

async fn approval_grant(ctx: MethodContext) -> MethodResult {
    let task_id = ctx
        .params
        .get("taskId")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_params("approval.grant requires 'taskId'"))?
        .to_string();
    let approved = ctx
        .params
        .get("approved")
        .and_then(Value::as_bool)
        .ok_or_else(|| invalid_params("approval.grant requires 'approved'"))?;

    let success = ctx.state.orchestrator.grant(&task_id, approved).await.map_err(|e| {
        RpcError::new(error_codes::INVALID_PARAMS, e.to_string()).with_domain_code(error_codes::TASK_NOT_FOUND)
    })?;

    Ok(json!({ "success": success, "taskId": task_id, "approved": approved }))
}

// ── session.get ──────────────────────────────────────────────────────────────

async fn session_get(ctx: MethodContext) -> MethodResult {
    let session_id = ctx
        .params
        .get("sessionId")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_params("session.get requires 'sessionId'"))?;

    // `sessionId` and `taskId` are the same identifier (orchestrator
    // convention: a task's tool calls all run under `sessionId == taskId`).
    match ctx.state.orchestrator.task(session_id) {
        Some(task) => Ok(json!({
            "sessionId": session_id,
            "exists": true,
            "channelId": task.channel_id,
            "state": task_state_str(task.state),
            "updatedAt": task.updated_at_ms,
        })),
        None => Ok(json!({ "sessionId": session_id, "exists": false })),
    }
}

// ── disconnect ───────────────────────────────────────────────────────────────

async fn disconnect(ctx: MethodContext) -> MethodResult {
    let client_id = ctx
        .params
        .get("clientId")
        .and_then(Value::as_str)
        .unwrap_or(&ctx.conn_id);
    let success = client_id == ctx.conn_id;
    Ok(json!({ "success": success }))
}

// ── health ───────────────────────────────────────────────────────────────────

async fn health(ctx: MethodContext) -> MethodResult {
    let state = &ctx.state;
    let counters = state.orchestrator.counters();
    Ok(json!({
        "uptimeMs": state.uptime_ms(),
        "tasksTotal": state.orchestrator.task_count(),
        "tasksQueued": state.orchestrator.total_queued().await,
        "tasksCreated": counters.created,
        "tasksCompleted": counters.completed,
        "tasksFailed": counters.failed,
        "tasksAborted": counters.aborted,
        "connectedClients": state.client_count().await,
        "connectedNodes": state.node_count().await,
    }))
}
