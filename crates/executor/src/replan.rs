use std::collections::HashMap;

use atc_protocol::error_codes;
use atc_tools::ToolRunError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Timeout,
    Network,
    PermissionDenied,
    InvalidInput,
    ToolNotFound,
    UnknownNonRecoverable,
}

impl FailureKind {
    pub fn recoverable(self) -> bool {
        !matches!(self, FailureKind::InvalidInput | FailureKind::UnknownNonRecoverable)
    }
}

/// Map a tool failure code onto the classification table.
pub fn classify(error: &ToolRunError) -> FailureKind {
    match error.code.as_str() {
        error_codes::TIMEOUT => FailureKind::Timeout,
        error_codes::NETWORK_ERROR => FailureKind::Network,
        error_codes::PERMISSION_DENIED => FailureKind::PermissionDenied,
        error_codes::INVALID_INPUT => FailureKind::InvalidInput,
        error_codes::TOOL_NOT_FOUND => FailureKind::ToolNotFound,
        _ => FailureKind::UnknownNonRecoverable,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionKind {
    Retry,
    Alternative,
    RequestApproval,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub step_id: String,
    pub action: RecoveryActionKind,
    pub tool_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternative_tool_id: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
    pub timestamp: u64,
}

pub struct Replanner {
    max_retries: u32,
    max_alternatives: u32,
    /// Priority-ordered unused-alternative table, highest priority first.
    alternatives: HashMap<String, Vec<String>>,
}

impl Replanner {
    pub fn new(max_retries: u32, max_alternatives: u32) -> Self {
        Self {
            max_retries,
            max_alternatives,
            alternatives: HashMap::new(),
        }
    }

    pub fn with_alternatives(mut self, tool_id: impl Into<String>, ranked: Vec<String>) -> Self {
        self.alternatives.insert(tool_id.into(), ranked);
        self
    }

    /// Decide the next action for `step_id`/`tool_id` given its failure kind
    /// and the attempts made on it so far, plus the remaining wall-clock
    /// budget for the whole task.
    pub fn decide(
        &self,
        step_id: &str,
        tool_id: &str,
        failure: FailureKind,
        attempts_so_far: &[RecoveryAttempt],
        budget_remaining_ms: u64,
    ) -> RecoveryActionKind {
        if budget_remaining_ms == 0 {
            return RecoveryActionKind::Abort;
        }

        let retries_used = attempts_so_far
            .iter()
            .filter(|a| a.step_id == step_id && a.action == RecoveryActionKind::Retry)
            .count() as u32;
        let alternatives_used: Vec<&str> = attempts_so_far
            .iter()
            .filter(|a| a.step_id == step_id && a.action == RecoveryActionKind::Alternative)
            .filter_map(|a| a.alternative_tool_id.as_deref())
            .collect();
        let approval_already_requested = attempts_so_far
            .iter()
            .any(|a| a.step_id == step_id && a.action == RecoveryActionKind::RequestApproval);

        match failure {
            FailureKind::Timeout | FailureKind::Network => {
                if retries_used < self.max_retries {
                    RecoveryActionKind::Retry
                } else {
                    self.alternative_or_abort(tool_id, &alternatives_used)
                }
            },
            FailureKind::PermissionDenied => {
                if approval_already_requested {
                    RecoveryActionKind::Abort
                } else {
                    RecoveryActionKind::RequestApproval
                }
            },
            FailureKind::ToolNotFound => self.alternative_or_abort(tool_id, &alternatives_used),
            FailureKind::InvalidInput | FailureKind::UnknownNonRecoverable => {
                RecoveryActionKind::Abort
            },
        }
    }

    fn alternative_or_abort(&self, tool_id: &str, already_used: &[&str]) -> RecoveryActionKind {
        if already_used.len() as u32 >= self.max_alternatives {
            return RecoveryActionKind::Abort;
        }
        match self.next_alternative(tool_id, already_used) {
            Some(_) => RecoveryActionKind::Alternative,
            None => RecoveryActionKind::Abort,
        }
    }

    /// Highest-priority alternative tool for `tool_id` not already tried.
    pub fn next_alternative(&self, tool_id: &str, already_used: &[&str]) -> Option<String> {
        self.alternatives
            .get(tool_id)?
            .iter()
            .find(|candidate| !already_used.contains(&candidate.as_str()))
            .cloned()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_alternatives(&self) -> u32 {
        self.max_alternatives
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(step_id: &str, action: RecoveryActionKind, alt: Option<&str>) -> RecoveryAttempt {
        RecoveryAttempt {
            step_id: step_id.to_string(),
            action,
            tool_id: "web_search".to_string(),
            alternative_tool_id: alt.map(|s| s.to_string()),
            success: false,
            duration_ms: 10,
            timestamp: 0,
        }
    }

    #[test]
    fn classify_maps_known_codes() {
        assert_eq!(
            classify(&ToolRunError::new(error_codes::TIMEOUT, "x")),
            FailureKind::Timeout
        );
        assert_eq!(
            classify(&ToolRunError::new(error_codes::INVALID_INPUT, "x")),
            FailureKind::InvalidInput
        );
        assert_eq!(
            classify(&ToolRunError::new("SOMETHING_ELSE", "x")),
            FailureKind::UnknownNonRecoverable
        );
    }

    #[test]
    fn retries_up_to_bound_then_falls_to_alternative() {
        let replanner = Replanner::new(2, 2)
            .with_alternatives("web_search", vec!["backup_search".to_string()]);
        let attempts = vec![
            attempt("s1", RecoveryActionKind::Retry, None),
            attempt("s1", RecoveryActionKind::Retry, None),
        ];
        let action = replanner.decide("s1", "web_search", FailureKind::Timeout, &attempts, 10_000);
        assert_eq!(action, RecoveryActionKind::Alternative);
    }

    #[test]
    fn aborts_when_no_alternative_available() {
        let replanner = Replanner::new(0, 2);
        let action = replanner.decide("s1", "web_search", FailureKind::Timeout, &[], 10_000);
        assert_eq!(action, RecoveryActionKind::Abort);
    }

    #[test]
    fn permission_denied_requests_approval_once_then_aborts() {
        let replanner = Replanner::new(3, 2);
        let first = replanner.decide("s1", "exec", FailureKind::PermissionDenied, &[], 10_000);
        assert_eq!(first, RecoveryActionKind::RequestApproval);

        let attempts = vec![attempt("s1", RecoveryActionKind::RequestApproval, None)];
        let second =
            replanner.decide("s1", "exec", FailureKind::PermissionDenied, &attempts, 10_000);
        assert_eq!(second, RecoveryActionKind::Abort);
    }

    #[test]
    fn invalid_input_never_retries() {
        let replanner = Replanner::new(5, 5);
        let action = replanner.decide("s1", "exec", FailureKind::InvalidInput, &[], 10_000);
        assert_eq!(action, RecoveryActionKind::Abort);
    }

    #[test]
    fn exhausted_wallclock_budget_forces_abort() {
        let replanner = Replanner::new(5, 5)
            .with_alternatives("web_search", vec!["backup_search".to_string()]);
        let action = replanner.decide("s1", "web_search", FailureKind::Timeout, &[], 0);
        assert_eq!(action, RecoveryActionKind::Abort);
    }

    #[test]
    fn tool_not_found_prefers_alternative() {
        let replanner = Replanner::new(3, 2)
            .with_alternatives("web_search", vec!["backup_search".to_string()]);
        let action =
            replanner.decide("s1", "web_search", FailureKind::ToolNotFound, &[], 10_000);
        assert_eq!(action, RecoveryActionKind::Alternative);
    }
}
