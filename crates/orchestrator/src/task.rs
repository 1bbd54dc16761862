use std::time::{SystemTime, UNIX_EPOCH};

use atc_protocol::{TaskError, TaskState};
use dashmap::DashMap;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub channel_session_id: String,
    pub channel_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub text: String,
    pub metadata: Value,
    pub state: TaskState,
    pub result: Option<String>,
    pub error: Option<TaskError>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Legal edges of the state machine (spec §4.4). `RUNNING -> ABORTED` covers
/// a user abort while running, which the prose allows even though the
/// ASCII diagram only draws it from PENDING/PAUSED.
fn is_legal_transition(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Aborted)
            | (Running, Done)
            | (Running, Failed)
            | (Running, Paused)
            | (Running, Aborted)
            | (Paused, Running)
            | (Paused, Aborted)
    )
}

#[derive(Debug, thiserror::Error)]
pub enum TaskRegistryError {
    #[error("task '{0}' not found")]
    NotFound(String),
    #[error("illegal transition for task '{task_id}': {from:?} -> {to:?}")]
    IllegalTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },
}

/// All tasks the orchestrator currently knows about, keyed by task id.
/// Mutation is the only way state changes; nothing else holds a `Task`
/// long enough to race it.
pub struct TaskRegistry {
    tasks: DashMap<String, Task>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    pub fn insert(&self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    /// Validate and apply a state transition, returning the previous state.
    /// Never silently mutates an illegal transition.
    pub fn transition(
        &self,
        task_id: &str,
        to: TaskState,
        error: Option<TaskError>,
        result: Option<String>,
    ) -> Result<TaskState, TaskRegistryError> {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskRegistryError::NotFound(task_id.to_string()))?;
        let from = entry.state;
        if !is_legal_transition(from, to) {
            return Err(TaskRegistryError::IllegalTransition {
                task_id: task_id.to_string(),
                from,
                to,
            });
        }
        entry.state = to;
        entry.updated_at_ms = now_ms();
        if error.is_some() {
            entry.error = error;
        }
        if result.is_some() {
            entry.result = result;
        }
        Ok(from)
    }

    /// Remove terminal tasks last updated before `now_ms - horizon_ms`.
    pub fn sweep_terminal(&self, horizon_ms: u64) -> usize {
        let cutoff = now_ms().saturating_sub(horizon_ms);
        let before = self.tasks.len();
        self.tasks
            .retain(|_, t| !(t.state.is_terminal() && t.updated_at_ms < cutoff));
        before - self.tasks.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            channel_session_id: "chan-1".to_string(),
            channel_id: "chan-1".to_string(),
            agent_id: "agent".to_string(),
            user_id: "user".to_string(),
            text: "hi".to_string(),
            metadata: Value::Null,
            state: TaskState::Pending,
            result: None,
            error: None,
            created_at_ms: now_ms(),
            updated_at_ms: now_ms(),
        }
    }

    #[test]
    fn legal_transitions_succeed() {
        let reg = TaskRegistry::new();
        reg.insert(new_task("t1"));
        assert!(reg.transition("t1", TaskState::Running, None, None).is_ok());
        assert!(reg.transition("t1", TaskState::Paused, None, None).is_ok());
        assert!(reg.transition("t1", TaskState::Running, None, None).is_ok());
        assert!(reg.transition("t1", TaskState::Done, None, None).is_ok());
    }

    #[test]
    fn illegal_transition_rejected() {
        let reg = TaskRegistry::new();
        reg.insert(new_task("t1"));
        assert!(matches!(
            reg.transition("t1", TaskState::Done, None, None),
            Err(TaskRegistryError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn terminal_task_has_no_outgoing_transition() {
        let reg = TaskRegistry::new();
        reg.insert(new_task("t1"));
        reg.transition("t1", TaskState::Running, None, None).unwrap();
        reg.transition("t1", TaskState::Done, None, None).unwrap();
        assert!(reg.transition("t1", TaskState::Running, None, None).is_err());
    }

    #[test]
    fn sweep_removes_only_old_terminal_tasks() {
        let reg = TaskRegistry::new();
        reg.insert(new_task("t1"));
        reg.transition("t1", TaskState::Running, None, None).unwrap();
        reg.transition("t1", TaskState::Done, None, None).unwrap();
        assert_eq!(reg.sweep_terminal(3_600_000), 0);
        assert_eq!(reg.sweep_terminal(0), 1);
        assert!(reg.get("t1").is_none());
    }
}
