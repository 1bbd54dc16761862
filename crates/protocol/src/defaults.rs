//! Default configuration values from spec §5 and §6. Centralized here since
//! every component down the dependency chain (ratelimit → auth → … → gateway)
//! needs at least one of these, and nothing below `atc-protocol` can own them.

/// Loopback bind address.
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";
pub const DEFAULT_BIND_PORT: u16 = 18789;

/// Storage directory name under the user's home, e.g. `~/.moonbot/`.
pub const STORAGE_DIR_NAME: &str = ".moonbot";

/// Task execution timeout (10 minutes).
pub const TASK_TIMEOUT_MS: u64 = 600_000;
/// Remote node RPC timeout (30 seconds).
pub const NODE_RPC_TIMEOUT_MS: u64 = 30_000;
/// Pending approval TTL (1 hour).
pub const PENDING_APPROVAL_TTL_MS: u64 = 3_600_000;
/// Pending-node-request sweep TTL (10 minutes).
pub const PENDING_NODE_REQUEST_SWEEP_TTL_MS: u64 = 600_000;
/// Session-task mapping TTL (1 hour).
pub const SESSION_TASK_MAPPING_TTL_MS: u64 = 3_600_000;
/// Rate-limit sliding window (60 seconds).
pub const RATE_LIMIT_WINDOW_MS: u64 = 60_000;
/// Rate-limit max attempts per window.
pub const RATE_LIMIT_MAX_ATTEMPTS: usize = 10;
/// Pairing code TTL (5 minutes).
pub const PAIRING_CODE_TTL_MS: u64 = 300_000;
/// Maximum nodes paired per user.
pub const MAX_NODES_PER_USER: usize = 5;

/// Per-channel queue capacity.
pub const CHANNEL_QUEUE_CAPACITY: usize = 100;
/// Terminal-task registry retention horizon (1 hour).
pub const TASK_RETENTION_HORIZON_MS: u64 = 3_600_000;

/// Replanner bounds.
pub const MAX_RETRIES_PER_STEP: u32 = 3;
pub const MAX_ALTERNATIVES_PER_STEP: u32 = 2;

/// Default drain window on graceful shutdown.
pub const SHUTDOWN_DRAIN_MS: u64 = 2_000;

/// Command-validator argv length ceiling.
pub const MAX_ARGV_LENGTH: usize = 10_000;

/// Maximum JSON-RPC payload accepted per WebSocket frame (512 KB).
pub const MAX_PAYLOAD_BYTES: usize = 524_288;

/// Handshake timeout for the initial `connect` request.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
