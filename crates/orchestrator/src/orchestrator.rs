use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use atc_executor::Executor;
use atc_protocol::{ChatStatus, TaskError, TaskState, defaults, error_codes};
use atc_tools::{ToolContext, ToolEvent, ToolPolicy, ToolRuntime};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    approvals::{ApprovalTable, PendingApproval, SessionTaskMapping},
    events::{OrchestratorEvent, OrchestratorEventBus},
    queue::PerChannelQueue,
    task::{Task, TaskRegistry, TaskRegistryError, now_ms},
};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("task '{0}' not found")]
    TaskNotFound(String),
    #[error(transparent)]
    Registry(#[from] TaskRegistryError),
    #[error("task '{0}' has no pending approval")]
    NoPendingApproval(String),
}

#[derive(Debug, Clone)]
pub struct CreateTaskResult {
    pub task_id: String,
    pub state: TaskState,
}

/// In-process task counters for the `health` RPC (SPEC_FULL.md §2).
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskCounters {
    pub created: u64,
    pub completed: u64,
    pub failed: u64,
    pub aborted: u64,
}

#[derive(Default)]
struct TaskCounterCells {
    created: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    aborted: AtomicU64,
}

pub struct TaskOrchestrator {
    registry: TaskRegistry,
    queue: PerChannelQueue,
    approvals: ApprovalTable,
    session_map: SessionTaskMapping,
    events: OrchestratorEventBus,
    counters: TaskCounterCells,
    tool_runtime: Arc<ToolRuntime>,
    executor: Arc<Executor>,
    task_timeout_ms: u64,
    retention_horizon_ms: u64,
    workspace_root: PathBuf,
}

impl TaskOrchestrator {
    pub fn new(tool_runtime: Arc<ToolRuntime>, executor: Arc<Executor>, workspace_root: PathBuf) -> Arc<Self> {
        Self::with_task_timeout_ms(tool_runtime, executor, workspace_root, defaults::TASK_TIMEOUT_MS)
    }

    pub fn with_task_timeout_ms(
        tool_runtime: Arc<ToolRuntime>,
        executor: Arc<Executor>,
        workspace_root: PathBuf,
        task_timeout_ms: u64,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            registry: TaskRegistry::new(),
            queue: PerChannelQueue::new(defaults::CHANNEL_QUEUE_CAPACITY),
            approvals: ApprovalTable::new(Duration::from_millis(defaults::PENDING_APPROVAL_TTL_MS)),
            session_map: SessionTaskMapping::new(Duration::from_millis(defaults::SESSION_TASK_MAPPING_TTL_MS)),
            events: OrchestratorEventBus::new(),
            counters: TaskCounterCells::default(),
            tool_runtime,
            executor,
            task_timeout_ms,
            retention_horizon_ms: defaults::TASK_RETENTION_HORIZON_MS,
            workspace_root,
        });
        tokio::spawn(Arc::clone(&orchestrator).watch_tool_events());
        orchestrator
    }

    pub fn events(&self) -> &OrchestratorEventBus {
        &self.events
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.registry.get(task_id)
    }

    pub fn task_count(&self) -> usize {
        self.registry.len()
    }

    /// `approval.list`: every approval currently awaiting `grant`.
    pub async fn list_pending_approvals(&self) -> Vec<PendingApproval> {
        self.approvals.list().await
    }

    /// Total queued tasks across every channel, for `health`.
    pub async fn total_queued(&self) -> usize {
        self.queue.total_len().await
    }

    /// Snapshot of the in-process task counters, for `health`.
    pub fn counters(&self) -> TaskCounters {
        TaskCounters {
            created: self.counters.created.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
        }
    }

    /// `chat.send`: create a task and enqueue it on its channel. Queue-full
    /// is a terminal `ABORTED{error.code=QUEUE_FULL}` result, not an error
    /// raised to the RPC handler.
    pub async fn create_task(
        self: &Arc<Self>,
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
        text: impl Into<String>,
        metadata: Value,
    ) -> CreateTaskResult {
        let task_id = Uuid::new_v4().to_string();
        let channel_id = channel_id.into();
        let now = now_ms();
        let task = Task {
            id: task_id.clone(),
            channel_session_id: channel_id.clone(),
            channel_id: channel_id.clone(),
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            text: text.into(),
            metadata,
            state: TaskState::Pending,
            result: None,
            error: None,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.registry.insert(task);
        self.counters.created.fetch_add(1, Ordering::Relaxed);

        if !self.queue.enqueue(&channel_id, &task_id).await {
            let error = TaskError::new(
                error_codes::QUEUE_FULL,
                "the channel's task queue is full",
                format!("channel '{channel_id}' is at capacity"),
            );
            let _ = self.transition(&task_id, &channel_id, TaskState::Aborted, Some(error), None);
            self.counters.aborted.fetch_add(1, Ordering::Relaxed);
            return CreateTaskResult {
                task_id,
                state: TaskState::Aborted,
            };
        }

        Arc::clone(self).try_process_channel(channel_id).await;
        CreateTaskResult {
            task_id,
            state: TaskState::Pending,
        }
    }

    /// `approval.grant`: resolve the single pending approval for `task_id`.
    /// Effective exactly once -- a second call for the same task returns
    /// `false`.
    pub async fn grant(self: &Arc<Self>, task_id: &str, approved: bool) -> Result<bool, OrchestratorError> {
        let Some(task) = self.registry.get(task_id) else {
            return Err(OrchestratorError::TaskNotFound(task_id.to_string()));
        };
        if task.state != TaskState::Paused {
            return Ok(false);
        }
        let Some(pending) = self.approvals.remove_by_task(task_id).await else {
            return Ok(false);
        };

        if approved {
            self.transition(task_id, &task.channel_id, TaskState::Running, None, None)?;
            self.tool_runtime.resolve_approval(&pending.request_id, true).await;
        } else {
            let error = TaskError::new(
                error_codes::APPROVAL_DENIED,
                "the requested action was not approved",
                format!("approval '{}' denied for task '{task_id}'", pending.request_id),
            );
            self.transition(task_id, &task.channel_id, TaskState::Aborted, Some(error), None)?;
            self.counters.aborted.fetch_add(1, Ordering::Relaxed);
            self.tool_runtime.resolve_approval(&pending.request_id, false).await;
            self.events.emit(OrchestratorEvent::ChatResponse {
                task_id: task_id.to_string(),
                channel_id: task.channel_id.clone(),
                text: None,
                status: ChatStatus::Failed,
                metadata: Value::Null,
            });
            Arc::clone(self).finalize_task(task_id.to_string(), task.channel_id.clone()).await;
        }

        self.events.emit(OrchestratorEvent::ApprovalResolved {
            task_id: task_id.to_string(),
            channel_id: task.channel_id,
            approved,
            request_id: pending.request_id,
        });
        Ok(true)
    }

    /// `abort(taskId)`: legal from PENDING, RUNNING, or PAUSED.
    pub async fn abort(self: &Arc<Self>, task_id: &str) -> Result<bool, OrchestratorError> {
        let Some(task) = self.registry.get(task_id) else {
            return Err(OrchestratorError::TaskNotFound(task_id.to_string()));
        };
        if task.state.is_terminal() {
            return Ok(false);
        }

        let error = TaskError::new(
            error_codes::ABORTED,
            "the task was aborted",
            "abort requested",
        );
        self.transition(task_id, &task.channel_id, TaskState::Aborted, Some(error), None)?;
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);

        if task.state == TaskState::Paused
            && let Some(pending) = self.approvals.remove_by_task(task_id).await
        {
            self.tool_runtime.cancel_approval(&pending.request_id).await;
        }

        if task.state == TaskState::Pending {
            self.queue.remove_queued(&task.channel_id, task_id).await;
        } else {
            Arc::clone(self).finalize_task(task_id.to_string(), task.channel_id.clone()).await;
        }

        self.events.emit(OrchestratorEvent::ChatResponse {
            task_id: task_id.to_string(),
            channel_id: task.channel_id,
            text: None,
            status: ChatStatus::Failed,
            metadata: Value::Null,
        });
        Ok(true)
    }

    pub async fn sweep(&self) {
        self.registry.sweep_terminal(self.retention_horizon_ms);
        self.session_map.sweep().await;
        for expired in self.approvals.sweep().await {
            self.tool_runtime.cancel_approval(&expired.request_id).await;
            warn!(task_id = %expired.task_id, "pending approval expired");
        }
    }

    fn transition(
        &self,
        task_id: &str,
        channel_id: &str,
        to: TaskState,
        error: Option<TaskError>,
        result: Option<String>,
    ) -> Result<TaskState, OrchestratorError> {
        let previous = self.registry.transition(task_id, to, error, result)?;
        self.events.emit(OrchestratorEvent::TaskState {
            task_id: task_id.to_string(),
            channel_id: channel_id.to_string(),
            previous,
            current: to,
            timestamp_ms: now_ms(),
        });
        Ok(previous)
    }

    async fn try_process_channel(self: Arc<Self>, channel_id: String) {
        let Some(task_id) = self.queue.try_claim(&channel_id).await else {
            return;
        };
        tokio::spawn(self.run_task(channel_id, task_id));
    }

    /// Drive one task's execution to a terminal state. Stays alive across
    /// any approval pause inside the `Executor` call; this IS "the
    /// channel's processor" the pause/resume protocol refers to.
    async fn run_task(self: Arc<Self>, channel_id: String, task_id: String) {
        let Some(task) = self.registry.get(&task_id) else {
            self.finalize_task(task_id, channel_id).await;
            return;
        };

        if self
            .transition(&task_id, &channel_id, TaskState::Running, None, None)
            .is_err()
        {
            // Aborted before it got a chance to run.
            self.finalize_task(task_id, channel_id).await;
            return;
        }

        self.session_map.insert(&task_id, &task_id).await;
        let ctx = ToolContext {
            session_id: task_id.clone(),
            user_id: task.user_id.clone(),
            agent_id: task.agent_id.clone(),
            workspace_root: self.workspace_root.clone(),
            policy: ToolPolicy::default(),
        };

        let timeout = Duration::from_millis(self.task_timeout_ms);
        match tokio::time::timeout(timeout, self.executor.execute(&task.text, None, &ctx)).await {
            Ok(outcome) => {
                if outcome.success {
                    let text = outcome.messages.join("\n");
                    let _ = self.transition(&task_id, &channel_id, TaskState::Done, None, Some(text.clone()));
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    self.events.emit(OrchestratorEvent::ChatResponse {
                        task_id: task_id.clone(),
                        channel_id: channel_id.clone(),
                        text: Some(text),
                        status: ChatStatus::Completed,
                        metadata: serde_json::json!({ "fallback": outcome.fallback }),
                    });
                } else {
                    let first_error = outcome.errors.into_iter().next().unwrap_or_else(|| {
                        TaskError::new(error_codes::EXECUTION_ERROR, "execution failed", "no error detail")
                    });
                    let _ = self.transition(
                        &task_id,
                        &channel_id,
                        TaskState::Failed,
                        Some(first_error),
                        None,
                    );
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    self.events.emit(OrchestratorEvent::ChatResponse {
                        task_id: task_id.clone(),
                        channel_id: channel_id.clone(),
                        text: None,
                        status: ChatStatus::Failed,
                        metadata: Value::Null,
                    });
                }
            },
            Err(_elapsed) => {
                let current = self.registry.get(&task_id).map(|t| t.state);
                let target = if current == Some(TaskState::Paused) {
                    TaskState::Aborted
                } else {
                    TaskState::Failed
                };
                let error = TaskError::new(
                    error_codes::TIMEOUT,
                    "the task timed out",
                    format!("exceeded {}ms budget", self.task_timeout_ms),
                );
                let _ = self.transition(&task_id, &channel_id, target, Some(error), None);
                if target == TaskState::Aborted {
                    self.counters.aborted.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(pending) = self.approvals.remove_by_task(&task_id).await {
                    self.tool_runtime.cancel_approval(&pending.request_id).await;
                }
                self.events.emit(OrchestratorEvent::ChatResponse {
                    task_id: task_id.clone(),
                    channel_id: channel_id.clone(),
                    text: None,
                    status: ChatStatus::Failed,
                    metadata: Value::Null,
                });
            },
        }

        self.finalize_task(task_id, channel_id).await;
    }

    /// Idempotent cleanup run at task completion/abort/denial: clears the
    /// session mapping, removes the task from its queue if still at the
    /// front, unmarks processing, and advances the channel.
    async fn finalize_task(self: Arc<Self>, task_id: String, channel_id: String) {
        self.session_map.remove_by_task(&task_id).await;
        self.queue.dequeue_front_if_matches(&channel_id, &task_id).await;
        self.queue.unmark_processing(&channel_id).await;
        Arc::clone(&self).try_process_channel(channel_id).await;
    }

    /// Observe the ToolRuntime's approval events and reflect them as task
    /// PAUSED bookkeeping. Resolution itself is driven by `grant`, not
    /// reactively here.
    async fn watch_tool_events(self: Arc<Self>) {
        let mut rx = self.tool_runtime.events().subscribe();
        loop {
            match rx.recv().await {
                Ok(ToolEvent::ApprovalRequested {
                    request_id,
                    session_id,
                    tool_id,
                    input,
                }) => {
                    let Some(task_id) = self.session_map.get(&session_id).await else {
                        warn!(session_id, "approval requested for unknown session");
                        continue;
                    };
                    let Some(task) = self.registry.get(&task_id) else {
                        continue;
                    };
                    if self
                        .transition(&task_id, &task.channel_id, TaskState::Paused, None, None)
                        .is_err()
                    {
                        continue;
                    }
                    self.approvals
                        .insert(PendingApproval {
                            request_id: request_id.clone(),
                            task_id: task_id.clone(),
                            channel_id: task.channel_id.clone(),
                            tool_id: tool_id.clone(),
                            requested_at: std::time::Instant::now(),
                        })
                        .await;
                    self.events.emit(OrchestratorEvent::ApprovalRequested {
                        task_id: task_id.clone(),
                        channel_id: task.channel_id.clone(),
                        tool_id,
                        input,
                        request_id,
                    });
                    self.events.emit(OrchestratorEvent::ChatResponse {
                        task_id,
                        channel_id: task.channel_id,
                        text: None,
                        status: ChatStatus::Pending,
                        metadata: Value::Null,
                    });
                },
                Ok(ToolEvent::ApprovalResolved { .. } | ToolEvent::ApprovalCancelled { .. }) => {
                    // Resolution is driven by `grant`/`abort`; nothing to do.
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "orchestrator missed tool events, falling behind");
                },
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    debug!("tool event bus closed, stopping watcher");
                    break;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use atc_executor::{Executor, KeywordPlanner, Replanner};
    use atc_tools::{ToolContext, ToolRunOutcome, ToolRuntime, ToolSpec};
    use tokio::time::{Duration as TokioDuration, sleep};

    use super::*;

    struct EchoExec;
    #[async_trait]
    impl ToolSpec for EchoExec {
        fn id(&self) -> &str {
            "exec"
        }
        fn description(&self) -> &str {
            "echoes input"
        }
        fn schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn run(&self, input: Value, _ctx: &ToolContext) -> ToolRunOutcome {
            Ok(input)
        }
    }

    struct GatedExec;
    #[async_trait]
    impl ToolSpec for GatedExec {
        fn id(&self) -> &str {
            "exec"
        }
        fn description(&self) -> &str {
            "echoes input behind an approval gate"
        }
        fn schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        fn requires_approval(&self) -> bool {
            true
        }
        async fn run(&self, input: Value, _ctx: &ToolContext) -> ToolRunOutcome {
            Ok(input)
        }
    }

    struct SlowExec;
    #[async_trait]
    impl ToolSpec for SlowExec {
        fn id(&self) -> &str {
            "exec"
        }
        fn description(&self) -> &str {
            "never finishes in time"
        }
        fn schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn run(&self, _input: Value, _ctx: &ToolContext) -> ToolRunOutcome {
            sleep(TokioDuration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    fn orchestrator_with(spec: impl ToolSpec + 'static, task_timeout_ms: u64) -> Arc<TaskOrchestrator> {
        let runtime = Arc::new(ToolRuntime::new());
        runtime.register(Arc::new(spec)).unwrap();
        let executor = Arc::new(Executor::new(
            Arc::new(KeywordPlanner::new()),
            Arc::clone(&runtime),
            Replanner::new(1, 1),
            task_timeout_ms,
        ));
        TaskOrchestrator::with_task_timeout_ms(runtime, executor, "/tmp".into(), task_timeout_ms)
    }

    async fn wait_for_terminal(orchestrator: &Arc<TaskOrchestrator>, task_id: &str) -> Task {
        for _ in 0..200 {
            if let Some(task) = orchestrator.task(task_id)
                && task.state.is_terminal()
            {
                return task;
            }
            sleep(TokioDuration::from_millis(10)).await;
        }
        panic!("task '{task_id}' never reached a terminal state");
    }

    async fn wait_for_state(orchestrator: &Arc<TaskOrchestrator>, task_id: &str, state: TaskState) -> Task {
        for _ in 0..200 {
            if let Some(task) = orchestrator.task(task_id)
                && task.state == state
            {
                return task;
            }
            sleep(TokioDuration::from_millis(10)).await;
        }
        panic!("task '{task_id}' never reached {state:?}");
    }

    #[tokio::test]
    async fn task_runs_to_completion() {
        let orchestrator = orchestrator_with(EchoExec, 60_000);
        let created = orchestrator
            .create_task("agent", "user", "chan-1", "please run the thing", Value::Null)
            .await;
        let task = wait_for_terminal(&orchestrator, &created.task_id).await;
        assert_eq!(task.state, TaskState::Done);
    }

    #[tokio::test]
    async fn fifo_within_a_channel() {
        let orchestrator = orchestrator_with(EchoExec, 60_000);
        let first = orchestrator
            .create_task("agent", "user", "chan-1", "please run one", Value::Null)
            .await;
        let second = orchestrator
            .create_task("agent", "user", "chan-1", "please run two", Value::Null)
            .await;
        let t1 = wait_for_terminal(&orchestrator, &first.task_id).await;
        let t2 = wait_for_terminal(&orchestrator, &second.task_id).await;
        assert_eq!(t1.state, TaskState::Done);
        assert_eq!(t2.state, TaskState::Done);
        assert!(t1.updated_at_ms <= t2.updated_at_ms);
    }

    #[tokio::test]
    async fn distinct_channels_progress_independently() {
        let orchestrator = orchestrator_with(EchoExec, 60_000);
        let a = orchestrator
            .create_task("agent", "user", "chan-a", "please run a", Value::Null)
            .await;
        let b = orchestrator
            .create_task("agent", "user", "chan-b", "please run b", Value::Null)
            .await;
        let ta = wait_for_terminal(&orchestrator, &a.task_id).await;
        let tb = wait_for_terminal(&orchestrator, &b.task_id).await;
        assert_eq!(ta.state, TaskState::Done);
        assert_eq!(tb.state, TaskState::Done);
    }

    #[tokio::test]
    async fn approval_granted_completes_the_task() {
        let orchestrator = orchestrator_with(GatedExec, 60_000);
        let created = orchestrator
            .create_task("agent", "user", "chan-1", "please execute the script", Value::Null)
            .await;
        let paused = wait_for_state(&orchestrator, &created.task_id, TaskState::Paused).await;
        assert_eq!(paused.state, TaskState::Paused);

        let granted = orchestrator.grant(&created.task_id, true).await.unwrap();
        assert!(granted);
        let task = wait_for_terminal(&orchestrator, &created.task_id).await;
        assert_eq!(task.state, TaskState::Done);

        // Effective exactly once: a second grant call finds no pending approval.
        assert!(!orchestrator.grant(&created.task_id, true).await.unwrap());
    }

    #[tokio::test]
    async fn approval_denied_aborts_the_task() {
        let orchestrator = orchestrator_with(GatedExec, 60_000);
        let created = orchestrator
            .create_task("agent", "user", "chan-1", "please execute the script", Value::Null)
            .await;
        wait_for_state(&orchestrator, &created.task_id, TaskState::Paused).await;

        let granted = orchestrator.grant(&created.task_id, false).await.unwrap();
        assert!(granted);
        let task = wait_for_terminal(&orchestrator, &created.task_id).await;
        assert_eq!(task.state, TaskState::Aborted);
        assert_eq!(task.error.as_ref().map(|e| e.code.as_str()), Some(error_codes::APPROVAL_DENIED));
    }

    #[tokio::test]
    async fn timeout_fails_a_running_task() {
        let orchestrator = orchestrator_with(SlowExec, 50);
        let created = orchestrator
            .create_task("agent", "user", "chan-1", "please run forever", Value::Null)
            .await;
        let task = wait_for_terminal(&orchestrator, &created.task_id).await;
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error.as_ref().map(|e| e.code.as_str()), Some(error_codes::TIMEOUT));
    }

    #[tokio::test]
    async fn counters_track_created_and_completed() {
        let orchestrator = orchestrator_with(EchoExec, 60_000);
        let created = orchestrator
            .create_task("agent", "user", "chan-1", "please run the thing", Value::Null)
            .await;
        wait_for_terminal(&orchestrator, &created.task_id).await;
        let counters = orchestrator.counters();
        assert_eq!(counters.created, 1);
        assert_eq!(counters.completed, 1);
        assert_eq!(counters.failed, 0);
        assert_eq!(counters.aborted, 0);
    }

    #[tokio::test]
    async fn abort_pending_task_removes_it_from_the_queue() {
        let orchestrator = orchestrator_with(SlowExec, 60_000);
        // Occupy the channel with a long-running task first.
        let running = orchestrator
            .create_task("agent", "user", "chan-1", "please run forever", Value::Null)
            .await;
        wait_for_state(&orchestrator, &running.task_id, TaskState::Running).await;

        let queued = orchestrator
            .create_task("agent", "user", "chan-1", "please run later", Value::Null)
            .await;
        assert_eq!(queued.state, TaskState::Pending);
        assert!(orchestrator.abort(&queued.task_id).await.unwrap());
        let task = orchestrator.task(&queued.task_id).unwrap();
        assert_eq!(task.state, TaskState::Aborted);
    }
}
