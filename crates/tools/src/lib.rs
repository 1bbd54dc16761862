//! ToolRuntime: schema validation of tool inputs, dispatch to `ToolSpec::run`,
//! and the out-of-band approval protocol. Spec §4.6.

mod events;
mod registry;

pub use events::{ToolEvent, ToolEventBus};
pub use registry::{ToolContext, ToolPolicy, ToolRegistrationError, ToolRuntime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Registered, schema-validated, side-effecting operation. Implementations
/// live outside this crate (filesystem, HTTP, browser, exec tools — spec §1
/// out-of-scope collaborators); this crate only specifies the contract.
#[async_trait]
pub trait ToolSpec: Send + Sync {
    fn id(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema describing the accepted `input` shape.
    fn schema(&self) -> serde_json::Value;
    /// Whether this tool must be gated behind the approval protocol.
    fn requires_approval(&self) -> bool {
        false
    }
    async fn run(&self, input: serde_json::Value, ctx: &ToolContext) -> ToolRunOutcome;
}

/// What `ToolSpec::run` returns: either a successful payload or a
/// structured failure the Replanner can classify.
pub type ToolRunOutcome = Result<serde_json::Value, ToolRunError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRunError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ToolRunError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMeta {
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
}

/// `ToolResult = {ok, data?, error?{code,message,details?}, meta{durationMs,
/// artifacts?, truncated?}}` (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolRunError>,
    pub meta: ToolMeta,
}

impl ToolResult {
    pub fn success(data: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            meta: ToolMeta {
                duration_ms,
                artifacts: None,
                truncated: None,
            },
        }
    }

    pub fn failure(error: ToolRunError, duration_ms: u64) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
            meta: ToolMeta {
                duration_ms,
                artifacts: None,
                truncated: None,
            },
        }
    }

    pub fn failure_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failure(ToolRunError::new(code, message), 0)
    }
}

/// The outcome of `ToolRuntime::invoke`'s immediate return, mirroring the
/// literal contract in spec §4.6 step 3 (callers that only care about the
/// eventual result can just `.await` `invoke` instead; this enum exists so
/// the gateway layer can surface the `awaitingApproval` shape as a
/// `chat.response{status:"pending"}` notification at the moment the
/// approval is requested, ahead of the final `ToolResult`).
#[derive(Debug, Clone)]
pub enum InvokeOutcome {
    Ran(ToolResult),
    AwaitingApproval { invocation_id: String },
}
