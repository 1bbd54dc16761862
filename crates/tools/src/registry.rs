use std::{sync::Arc, time::Instant};

use {
    dashmap::DashMap,
    serde::{Deserialize, Serialize},
    tokio::sync::{Mutex, oneshot},
    tracing::{debug, warn},
};

use atc_protocol::error_codes;

use crate::{ToolEvent, ToolEventBus, ToolResult, ToolRunError, ToolSpec};

#[derive(Debug, thiserror::Error)]
pub enum ToolRegistrationError {
    #[error("tool schema is not a valid JSON Schema: {0}")]
    InvalidSchema(String),
}

/// Per-invocation execution policy (spec §4.5: "a `policy` block
/// (allowlist, denylist, maxBytes, timeoutMs)").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub denylist: Vec<String>,
    pub max_bytes: Option<usize>,
    pub timeout_ms: Option<u64>,
}

impl ToolPolicy {
    pub fn permits(&self, tool_id: &str) -> bool {
        if self.denylist.iter().any(|d| d == tool_id) {
            return false;
        }
        self.allowlist.is_empty() || self.allowlist.iter().any(|a| a == tool_id)
    }
}

/// Everything a running tool needs to know about the task that invoked it.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub workspace_root: std::path::PathBuf,
    pub policy: ToolPolicy,
}

struct ToolEntry {
    spec: Arc<dyn ToolSpec>,
    validator: jsonschema::Validator,
}

struct PendingApproval {
    tx: oneshot::Sender<bool>,
}

/// Registry of `ToolSpec`s plus the approval-gated invocation path.
pub struct ToolRuntime {
    tools: DashMap<String, ToolEntry>,
    pending: Mutex<std::collections::HashMap<String, PendingApproval>>,
    events: ToolEventBus,
}

impl Default for ToolRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRuntime {
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
            pending: Mutex::new(std::collections::HashMap::new()),
            events: ToolEventBus::new(),
        }
    }

    pub fn events(&self) -> &ToolEventBus {
        &self.events
    }

    pub fn register(&self, spec: Arc<dyn ToolSpec>) -> Result<(), ToolRegistrationError> {
        let schema = spec.schema();
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| ToolRegistrationError::InvalidSchema(e.to_string()))?;
        self.tools
            .insert(spec.id().to_string(), ToolEntry { spec, validator });
        Ok(())
    }

    pub fn unregister(&self, tool_id: &str) -> bool {
        self.tools.remove(tool_id).is_some()
    }

    pub fn has_tool(&self, tool_id: &str) -> bool {
        self.tools.contains_key(tool_id)
    }

    pub fn tool_ids(&self) -> Vec<String> {
        self.tools.iter().map(|e| e.key().clone()).collect()
    }

    /// Schema-validate and dispatch `tool_id`. Suspends at the approval
    /// wait point when the tool requires approval; resumes (or
    /// short-circuits with `APPROVAL_DENIED`) once `resolve_approval` or
    /// `cancel_approval` is called for the matching request id.
    pub async fn invoke(
        &self,
        tool_id: &str,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> ToolResult {
        let Some(entry) = self.tools.get(tool_id) else {
            return ToolResult::failure_code(
                error_codes::TOOL_NOT_FOUND,
                format!("no tool registered with id '{tool_id}'"),
            );
        };

        if !entry.validator.is_valid(&input) {
            return ToolResult::failure_code(
                error_codes::INVALID_INPUT,
                format!("input does not satisfy schema for tool '{tool_id}'"),
            );
        }

        if !ctx.policy.permits(tool_id) {
            return ToolResult::failure_code(
                error_codes::PERMISSION_DENIED,
                format!("tool '{tool_id}' is not permitted by the current policy"),
            );
        }

        let requires_approval = entry.spec.requires_approval();
        let spec = Arc::clone(&entry.spec);
        drop(entry);

        if requires_approval {
            let request_id = uuid::Uuid::new_v4().to_string();
            let (tx, rx) = oneshot::channel();
            self.pending
                .lock()
                .await
                .insert(request_id.clone(), PendingApproval { tx });

            self.events.emit(ToolEvent::ApprovalRequested {
                request_id: request_id.clone(),
                session_id: ctx.session_id.clone(),
                tool_id: tool_id.to_string(),
                input: input.clone(),
            });
            debug!(request_id = %request_id, tool_id, "tool invocation awaiting approval");

            let approved = match rx.await {
                Ok(decision) => decision,
                Err(_) => {
                    warn!(request_id = %request_id, "approval channel dropped, treating as denied");
                    false
                },
            };

            if !approved {
                return ToolResult::failure_code(
                    error_codes::APPROVAL_DENIED,
                    format!("approval denied for tool '{tool_id}'"),
                );
            }
        }

        let started = Instant::now();
        let outcome = spec.run(input, ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(data) => ToolResult::success(data, duration_ms),
            Err(err) => ToolResult::failure(err, duration_ms),
        }
    }

    /// Resolve a pending approval request. Returns `false` if no pending
    /// request matches `request_id` (already resolved, cancelled, or
    /// never existed) — a second `resolve` on the same id is a no-op.
    pub async fn resolve_approval(&self, request_id: &str, approved: bool) -> bool {
        let pending = self.pending.lock().await.remove(request_id);
        match pending {
            Some(p) => {
                let _ = p.tx.send(approved);
                self.events.emit(ToolEvent::ApprovalResolved {
                    request_id: request_id.to_string(),
                    approved,
                });
                true
            },
            None => {
                warn!(request_id, "resolve_approval: no pending request");
                false
            },
        }
    }

    /// Cancel a pending approval request (task abort, TTL expiry, shutdown).
    /// Unblocks the waiting `invoke` call with a denied result.
    pub async fn cancel_approval(&self, request_id: &str) -> bool {
        let pending = self.pending.lock().await.remove(request_id);
        match pending {
            Some(p) => {
                let _ = p.tx.send(false);
                self.events.emit(ToolEvent::ApprovalCancelled {
                    request_id: request_id.to_string(),
                });
                true
            },
            None => false,
        }
    }

    pub async fn pending_request_ids(&self) -> Vec<String> {
        self.pending.lock().await.keys().cloned().collect()
    }
}
