//! Standard JSON-RPC 2.0 error codes plus the domain error codes carried in
//! `error.data.code` (spec §6, §7).

// ── Standard JSON-RPC 2.0 codes ─────────────────────────────────────────────

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// ── Domain codes — admission ────────────────────────────────────────────────

pub const AUTH_MISSING_TOKEN: &str = "AUTH_MISSING_TOKEN";
pub const AUTH_INVALID_TOKEN: &str = "AUTH_INVALID_TOKEN";
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

// ── Domain codes — scheduling ────────────────────────────────────────────────

pub const QUEUE_FULL: &str = "QUEUE_FULL";
pub const TIMEOUT: &str = "TIMEOUT";
pub const ABORTED: &str = "ABORTED";
pub const APPROVAL_DENIED: &str = "APPROVAL_DENIED";
pub const TASK_NOT_FOUND: &str = "TASK_NOT_FOUND";

// ── Domain codes — execution ─────────────────────────────────────────────────

pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";
pub const INVALID_INPUT: &str = "INVALID_INPUT";
pub const TOOL_NOT_FOUND: &str = "TOOL_NOT_FOUND";
pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
pub const SIZE_LIMIT: &str = "SIZE_LIMIT";
pub const BLOCKED_URL: &str = "BLOCKED_URL";
pub const INVALID_PATH: &str = "INVALID_PATH";
pub const INVALID_HEADERS: &str = "INVALID_HEADERS";

// ── Domain codes — node ──────────────────────────────────────────────────────

pub const NODE_NOT_FOUND: &str = "NODE_NOT_FOUND";
pub const NODE_NOT_AVAILABLE: &str = "NODE_NOT_AVAILABLE";
pub const NODE_UNREACHABLE: &str = "NODE_UNREACHABLE";
pub const NODE_TIMEOUT: &str = "NODE_TIMEOUT";
pub const NODE_DISCONNECTED: &str = "NODE_DISCONNECTED";
pub const COMMUNICATOR_SHUTDOWN: &str = "COMMUNICATOR_SHUTDOWN";
pub const CONSENT_REQUIRED: &str = "CONSENT_REQUIRED";
pub const NODE_CAPABILITY_REQUIRED: &str = "NODE_CAPABILITY_REQUIRED";
