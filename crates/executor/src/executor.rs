use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use atc_protocol::{TaskError, error_codes};
use atc_tools::{ToolContext, ToolRuntime};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    plan::{Plan, Planner, PlanValidationError, topological_order, validate_plan},
    replan::{RecoveryActionKind, RecoveryAttempt, Replanner, classify},
};

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub messages: Vec<String>,
    pub outputs: HashMap<String, Value>,
    pub errors: Vec<TaskError>,
    pub recovery_stats: Vec<RecoveryAttempt>,
    /// Set when no real LLM composed the final message.
    pub fallback: bool,
}

pub struct Executor {
    planner: Arc<dyn Planner>,
    tool_runtime: Arc<ToolRuntime>,
    replanner: Replanner,
    task_budget_ms: u64,
}

impl Executor {
    pub fn new(
        planner: Arc<dyn Planner>,
        tool_runtime: Arc<ToolRuntime>,
        replanner: Replanner,
        task_budget_ms: u64,
    ) -> Self {
        Self {
            planner,
            tool_runtime,
            replanner,
            task_budget_ms,
        }
    }

    /// Drive a single task to completion: plan, validate, execute steps in
    /// dependency order, recover from failures via the Replanner.
    pub async fn execute(
        &self,
        message: &str,
        session_history: Option<&[Value]>,
        ctx: &ToolContext,
    ) -> ExecutionOutcome {
        let plan = self.planner.plan(message, session_history).await;

        if let Err(e) = validate_plan(&plan) {
            return ExecutionOutcome {
                success: false,
                messages: Vec::new(),
                outputs: HashMap::new(),
                errors: vec![validation_task_error(e)],
                recovery_stats: Vec::new(),
                fallback: true,
            };
        }

        let order: Vec<String> = topological_order(&plan).into_iter().map(|s| s.id.clone()).collect();
        let steps_by_id: HashMap<String, crate::plan::PlanStep> =
            plan.steps.into_iter().map(|s| (s.id.clone(), s)).collect();

        let start = Instant::now();
        let mut outputs = HashMap::new();
        let mut messages = Vec::new();
        let mut errors = Vec::new();
        let mut recovery_stats = Vec::new();
        let mut failed_steps: HashSet<String> = HashSet::new();

        for step_id in order {
            let Some(step) = steps_by_id.get(&step_id) else {
                continue;
            };

            if step.depends_on.iter().any(|dep| failed_steps.contains(dep)) {
                failed_steps.insert(step_id.clone());
                errors.push(TaskError::new(
                    error_codes::EXECUTION_ERROR,
                    "a prerequisite step failed",
                    format!("step '{step_id}' skipped: upstream dependency failed"),
                ));
                continue;
            }

            let Some(base_tool_id) = step.tool_id.clone() else {
                messages.push(step.description.clone());
                outputs.insert(step_id.clone(), Value::Null);
                continue;
            };

            let input = step.input.clone().unwrap_or_else(|| serde_json::json!({}));
            let outcome = self
                .run_step_with_recovery(
                    &step_id,
                    base_tool_id,
                    input,
                    ctx,
                    start,
                    &mut recovery_stats,
                )
                .await;

            match outcome {
                Ok(data) => {
                    outputs.insert(step_id.clone(), data);
                    messages.push(step.description.clone());
                },
                Err(task_error) => {
                    failed_steps.insert(step_id.clone());
                    errors.push(task_error);
                },
            }
        }

        let success = errors.is_empty();
        let final_message = if success {
            format!("completed {} step(s)", messages.len())
        } else {
            format!(
                "completed with {} error(s) across {} step(s)",
                errors.len(),
                messages.len()
            )
        };
        messages.push(final_message);

        ExecutionOutcome {
            success,
            messages,
            outputs,
            errors,
            recovery_stats,
            fallback: true,
        }
    }

    /// Run one step, consulting the Replanner on every tool failure until
    /// it succeeds, exhausts its bounds, or the Replanner says abort.
    async fn run_step_with_recovery(
        &self,
        step_id: &str,
        mut tool_id: String,
        input: Value,
        ctx: &ToolContext,
        start: Instant,
        recovery_stats: &mut Vec<RecoveryAttempt>,
    ) -> Result<Value, TaskError> {
        loop {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            let budget_remaining = self.task_budget_ms.saturating_sub(elapsed_ms);

            let result = self.tool_runtime.invoke(&tool_id, input.clone(), ctx).await;
            if result.ok {
                return Ok(result.data.unwrap_or(Value::Null));
            }

            let tool_error = result.error.unwrap_or_else(|| {
                atc_tools::ToolRunError::new(error_codes::EXECUTION_ERROR, "tool failed without an error payload")
            });
            let failure = classify(&tool_error);

            let step_attempts: Vec<RecoveryAttempt> = recovery_stats
                .iter()
                .filter(|a| a.step_id == step_id)
                .cloned()
                .collect();
            let action = self.replanner.decide(
                step_id,
                &tool_id,
                failure,
                &step_attempts,
                budget_remaining,
            );

            let alternative_used: Vec<&str> = step_attempts
                .iter()
                .filter_map(|a| a.alternative_tool_id.as_deref())
                .collect();

            match action {
                RecoveryActionKind::Retry => {
                    recovery_stats.push(RecoveryAttempt {
                        step_id: step_id.to_string(),
                        action,
                        tool_id: tool_id.clone(),
                        alternative_tool_id: None,
                        success: false,
                        duration_ms: tool_error_duration(&tool_id),
                        timestamp: elapsed_ms,
                    });
                    debug!(step_id, tool_id = %tool_id, "retrying step after failure");
                },
                RecoveryActionKind::Alternative => {
                    let Some(alternative) = self.replanner.next_alternative(&tool_id, &alternative_used)
                    else {
                        return Err(task_error_from_tool(step_id, &tool_error));
                    };
                    recovery_stats.push(RecoveryAttempt {
                        step_id: step_id.to_string(),
                        action,
                        tool_id: tool_id.clone(),
                        alternative_tool_id: Some(alternative.clone()),
                        success: false,
                        duration_ms: 0,
                        timestamp: elapsed_ms,
                    });
                    debug!(step_id, from = %tool_id, to = %alternative, "switching to alternative tool");
                    tool_id = alternative;
                },
                RecoveryActionKind::RequestApproval => {
                    // ToolRuntime.invoke already suspends internally on tools
                    // requiring approval; re-invoking drives that suspension.
                    recovery_stats.push(RecoveryAttempt {
                        step_id: step_id.to_string(),
                        action,
                        tool_id: tool_id.clone(),
                        alternative_tool_id: None,
                        success: false,
                        duration_ms: 0,
                        timestamp: elapsed_ms,
                    });
                    warn!(step_id, tool_id = %tool_id, "retrying step pending approval");
                },
                RecoveryActionKind::Abort => {
                    recovery_stats.push(RecoveryAttempt {
                        step_id: step_id.to_string(),
                        action,
                        tool_id: tool_id.clone(),
                        alternative_tool_id: None,
                        success: false,
                        duration_ms: 0,
                        timestamp: elapsed_ms,
                    });
                    return Err(task_error_from_tool(step_id, &tool_error));
                },
            }
        }
    }
}

fn tool_error_duration(_tool_id: &str) -> u64 {
    0
}

fn task_error_from_tool(step_id: &str, error: &atc_tools::ToolRunError) -> TaskError {
    TaskError::new(
        error.code.clone(),
        format!("step '{step_id}' could not complete"),
        error.message.clone(),
    )
}

fn validation_task_error(e: PlanValidationError) -> TaskError {
    TaskError::new(error_codes::EXECUTION_ERROR, "the plan could not be validated", e.to_string())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use atc_tools::{ToolContext, ToolPolicy, ToolRunOutcome, ToolSpec};

    use super::*;
    use crate::plan::{KeywordPlanner, PlanStep};

    struct AlwaysOk;

    #[async_trait]
    impl ToolSpec for AlwaysOk {
        fn id(&self) -> &str {
            "web_search"
        }
        fn description(&self) -> &str {
            "search"
        }
        fn schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn run(&self, _input: Value, _ctx: &ToolContext) -> ToolRunOutcome {
            Ok(serde_json::json!({"results": []}))
        }
    }

    struct AlwaysFails {
        code: String,
    }

    #[async_trait]
    impl ToolSpec for AlwaysFails {
        fn id(&self) -> &str {
            "web_search"
        }
        fn description(&self) -> &str {
            "search"
        }
        fn schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn run(&self, _input: Value, _ctx: &ToolContext) -> ToolRunOutcome {
            Err(atc_tools::ToolRunError::new(self.code.clone(), "boom"))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            agent_id: "a1".to_string(),
            workspace_root: "/tmp".into(),
            policy: ToolPolicy::default(),
        }
    }

    #[tokio::test]
    async fn successful_plan_completes() {
        let runtime = Arc::new(ToolRuntime::new());
        runtime.register(Arc::new(AlwaysOk)).unwrap();
        let executor = Executor::new(
            Arc::new(KeywordPlanner::new()),
            runtime,
            Replanner::new(3, 2),
            60_000,
        );
        let outcome = executor.execute("please search for rust", None, &ctx()).await;
        assert!(outcome.success);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn invalid_input_aborts_without_retry() {
        let runtime = Arc::new(ToolRuntime::new());
        runtime
            .register(Arc::new(AlwaysFails {
                code: error_codes::INVALID_INPUT.to_string(),
            }))
            .unwrap();
        let executor = Executor::new(
            Arc::new(KeywordPlanner::new()),
            runtime,
            Replanner::new(3, 2),
            60_000,
        );
        let outcome = executor.execute("please search for rust", None, &ctx()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.errors.len(), 1);
        assert!(
            outcome
                .recovery_stats
                .iter()
                .all(|a| a.action != RecoveryActionKind::Retry)
        );
    }

    #[tokio::test]
    async fn timeout_retries_then_falls_back_to_alternative() {
        let runtime = Arc::new(ToolRuntime::new());
        runtime
            .register(Arc::new(AlwaysFails {
                code: error_codes::TIMEOUT.to_string(),
            }))
            .unwrap();
        let replanner = Replanner::new(1, 1).with_alternatives(
            "web_search",
            vec!["backup_search".to_string()],
        );
        let executor = Executor::new(Arc::new(KeywordPlanner::new()), runtime, replanner, 60_000);
        let outcome = executor.execute("please search for rust", None, &ctx()).await;
        // backup_search isn't registered either, so the step ultimately
        // fails once the alternative also has nowhere to go -- but we
        // should see both a retry and an alternative attempt recorded.
        assert!(
            outcome
                .recovery_stats
                .iter()
                .any(|a| a.action == RecoveryActionKind::Retry)
        );
        assert!(
            outcome
                .recovery_stats
                .iter()
                .any(|a| a.action == RecoveryActionKind::Alternative)
        );
    }

    #[tokio::test]
    async fn dependent_step_skipped_after_upstream_failure() {
        struct OneStepPlanner;
        #[async_trait]
        impl Planner for OneStepPlanner {
            async fn plan(&self, _message: &str, _history: Option<&[Value]>) -> Plan {
                Plan {
                    steps: vec![
                        PlanStep {
                            id: "s1".to_string(),
                            description: "search".to_string(),
                            tool_id: Some("web_search".to_string()),
                            input: None,
                            depends_on: Vec::new(),
                        },
                        PlanStep {
                            id: "s2".to_string(),
                            description: "respond".to_string(),
                            tool_id: None,
                            input: None,
                            depends_on: vec!["s1".to_string()],
                        },
                    ],
                    estimated_duration_ms: 0,
                }
            }
        }

        let runtime = Arc::new(ToolRuntime::new());
        runtime
            .register(Arc::new(AlwaysFails {
                code: error_codes::INVALID_INPUT.to_string(),
            }))
            .unwrap();
        let executor = Executor::new(Arc::new(OneStepPlanner), runtime, Replanner::new(3, 2), 60_000);
        let outcome = executor.execute("anything", None, &ctx()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.errors.len(), 2);
        assert!(!outcome.outputs.contains_key("s2"));
    }
}
