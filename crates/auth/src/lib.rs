//! Timing-safe token authenticator. Spec §4.3.
//!
//! Validates an incoming `connect` token against a configured set of
//! accepted token hex digests. When no tokens are configured, authentication
//! is disabled (loopback-by-default posture, spec §6).

use std::net::IpAddr;

use atc_protocol::error_codes;
use atc_ratelimit::RateLimiter;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("rate limit exceeded")]
    RateLimited,
}

impl AuthError {
    pub fn domain_code(&self) -> &'static str {
        match self {
            Self::MissingToken => error_codes::AUTH_MISSING_TOKEN,
            Self::InvalidToken => error_codes::AUTH_INVALID_TOKEN,
            Self::RateLimited => error_codes::RATE_LIMIT_EXCEEDED,
        }
    }
}

/// A set of accepted tokens, stored as hex-decoded byte buffers so validation
/// never touches the original string representation.
pub struct Authenticator {
    accepted: Vec<Vec<u8>>,
    rate_limiter: Option<std::sync::Arc<RateLimiter>>,
}

impl Authenticator {
    /// Build an authenticator from a set of hex-encoded accepted tokens.
    /// Tokens that fail to hex-decode are skipped (never silently accepted).
    pub fn new(accepted_hex_tokens: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let accepted = accepted_hex_tokens
            .into_iter()
            .filter_map(|t| decode_hex(t.as_ref()))
            .collect();
        Self {
            accepted,
            rate_limiter: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: std::sync::Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Whether any tokens are configured. If not, authentication is disabled.
    pub fn is_enabled(&self) -> bool {
        !self.accepted.is_empty()
    }

    /// Validate a raw (non-hex) token presented by a peer, optionally gated
    /// by the rate limiter on the token axis.
    pub fn validate_token(&self, token: &str) -> Result<(), AuthError> {
        if !self.is_enabled() {
            return Ok(());
        }
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        if let Some(limiter) = &self.rate_limiter
            && !limiter.check_token(token)
        {
            return Err(AuthError::RateLimited);
        }
        let Some(candidate) = decode_hex(token) else {
            return Err(AuthError::InvalidToken);
        };
        if self.timing_safe_contains(&candidate) {
            Ok(())
        } else {
            Err(AuthError::InvalidToken)
        }
    }

    /// Compare `candidate` against every configured token, never
    /// short-circuiting on the first match, and OR-ing the per-token
    /// equality results together. This keeps the total work (and thus the
    /// latency) independent of which configured token the caller is
    /// probing for, and independent of *where* in the string a mismatch
    /// occurs.
    fn timing_safe_contains(&self, candidate: &[u8]) -> bool {
        let mut any_match = 0u8;
        for expected in &self.accepted {
            any_match |= constant_time_eq(candidate, expected) as u8;
        }
        any_match == 1
    }
}

/// Constant-time comparison of two equal-or-unequal-length byte buffers.
///
/// Mismatched lengths are compared against themselves to keep the number of
/// byte-compare iterations from leaking the candidate's length relative to
/// the longest configured token.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        // Still perform a bounded amount of work so callers can't use gross
        // timing differences to learn expected token lengths.
        let _ = a.iter().fold(0u8, |acc, x| acc ^ x);
        return false;
    }
    let diff = a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Whether a peer IP is loopback (used by the gateway to grant implicit
/// trust to local connections, independent of token auth).
pub fn is_loopback(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}
