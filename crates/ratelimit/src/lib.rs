//! Dual-axis (peer address + auth token) sliding-window connection rate
//! limiter. Spec §4.2.
//!
//! Two independent maps are kept — one keyed by peer IP, one keyed by the
//! SHA-256 hex digest of the auth token — so a single stolen token can't be
//! replayed from many peers to dodge the IP-keyed limit, and a single noisy
//! peer can't exhaust a token shared across legitimate callers.

use std::{
    net::IpAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use {
    dashmap::DashMap,
    sha2::{Digest, Sha256},
};

use atc_protocol::defaults::{RATE_LIMIT_MAX_ATTEMPTS, RATE_LIMIT_WINDOW_MS};

const CLEANUP_EVERY_CHECKS: u64 = 256;

#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub window: Duration,
    pub max_attempts: usize,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(RATE_LIMIT_WINDOW_MS),
            max_attempts: RATE_LIMIT_MAX_ATTEMPTS,
        }
    }
}

/// Hash a token for use as a rate-limiter key. Tokens are never stored in
/// plaintext (spec §4.2).
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct RateLimiter {
    limits: RateLimits,
    ip_attempts: DashMap<IpAddr, Vec<Instant>>,
    token_attempts: DashMap<String, Vec<Instant>>,
    checks_seen: AtomicU64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(RateLimits::default())
    }

    #[must_use]
    pub fn with_limits(limits: RateLimits) -> Self {
        Self {
            limits,
            ip_attempts: DashMap::new(),
            token_attempts: DashMap::new(),
            checks_seen: AtomicU64::new(0),
        }
    }

    /// Check and record an attempt keyed by peer IP. Returns `true` if the
    /// attempt is allowed.
    pub fn check_ip(&self, ip: IpAddr) -> bool {
        self.check_ip_at(ip, Instant::now())
    }

    pub fn check_ip_at(&self, ip: IpAddr, now: Instant) -> bool {
        let allowed = check_key(&self.ip_attempts, ip, self.limits, now);
        self.cleanup_if_needed(now);
        allowed
    }

    /// Check and record an attempt keyed by the given raw token. The token
    /// is hashed before use as a map key.
    pub fn check_token(&self, token: &str) -> bool {
        self.check_token_at(token, Instant::now())
    }

    pub fn check_token_at(&self, token: &str, now: Instant) -> bool {
        let key = hash_token(token);
        let allowed = check_key(&self.token_attempts, key, self.limits, now);
        self.cleanup_if_needed(now);
        allowed
    }

    fn cleanup_if_needed(&self, now: Instant) {
        let seen = self.checks_seen.fetch_add(1, Ordering::Relaxed) + 1;
        if !seen.is_multiple_of(CLEANUP_EVERY_CHECKS) {
            return;
        }
        self.sweep_at(now);
    }

    /// Drop every key whose attempt list is empty after pruning. Exposed
    /// separately so a caller can drive this on its own ticker instead of
    /// relying on the check-count heuristic.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        let window = self.limits.window;
        self.ip_attempts.retain(|_, v| {
            v.retain(|t| now.duration_since(*t) < window);
            !v.is_empty()
        });
        self.token_attempts.retain(|_, v| {
            v.retain(|t| now.duration_since(*t) < window);
            !v.is_empty()
        });
    }
}

fn check_key<K: std::hash::Hash + Eq + Clone>(
    map: &DashMap<K, Vec<Instant>>,
    key: K,
    limits: RateLimits,
    now: Instant,
) -> bool {
    let mut entry = map.entry(key).or_default();
    entry.retain(|t| now.duration_since(*t) < limits.window);
    if entry.len() >= limits.max_attempts {
        return false;
    }
    entry.push(now);
    true
}
