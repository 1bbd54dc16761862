//! Wire protocol for the agent task orchestration gateway.
//!
//! All communication uses JSON-RPC 2.0 frames over WebSocket, on a loopback
//! interface by default. Three frame shapes exist:
//!
//! - [`RpcRequest`]  — client → gateway RPC call (has `id`)
//! - [`RpcResponse`] — gateway → client RPC result (has `id`, `result` xor `error`)
//! - [`RpcNotification`] — gateway → client server-push (no `id`)

use serde::{Deserialize, Serialize};

pub mod defaults;
pub mod error_codes;

pub const JSONRPC_VERSION: &str = "2.0";

// ── Frames ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RpcRequest {
    pub fn new(id: serde_json::Value, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            method: method.into(),
            params: Some(params),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach a domain error code into `error.data.code`, per spec §6.
    pub fn with_domain_code(mut self, domain_code: impl Into<String>) -> Self {
        let code_value = serde_json::json!({ "code": domain_code.into() });
        match self.data.as_mut().and_then(serde_json::Value::as_object_mut) {
            Some(existing) => {
                existing.insert("code".into(), code_value["code"].clone());
            },
            None => self.data = Some(code_value),
        }
        self
    }

    pub fn domain_code(&self) -> Option<&str> {
        self.data.as_ref()?.get("code")?.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: serde_json::Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// Discriminates an incoming frame without committing to request vs.
/// notification shape up front (mirrors the `id` presence rule of JSON-RPC 2.0).
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

impl InboundFrame {
    pub fn is_well_formed_request(&self) -> bool {
        self.jsonrpc.as_deref() == Some(JSONRPC_VERSION) && self.method.is_some()
    }
}

// ── Task / channel domain types shared across crates ────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Pending,
    Running,
    Paused,
    Done,
    Failed,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Aborted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub code: String,
    pub user_message: String,
    pub internal_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl TaskError {
    pub fn new(code: impl Into<String>, user_message: impl Into<String>, internal_message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            user_message: user_message.into(),
            internal_message: internal_message.into(),
            stack: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Queued,
    Completed,
    Failed,
    Pending,
}

/// Pairing-code alphabet: digits + uppercase letters, minus `I` and `O`
/// (visually ambiguous with `1`/`0`). Spec §6.
pub const PAIRING_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKLMNPQRSTUVWXYZ";
pub const PAIRING_CODE_LEN: usize = 8;
