use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub request_id: String,
    pub task_id: String,
    pub channel_id: String,
    pub tool_id: String,
    pub requested_at: Instant,
}

/// At most one pending approval per task. Keyed by `requestId` with a
/// `taskId -> requestId` index for the common "resolve by task" lookup.
pub struct ApprovalTable {
    by_request: Mutex<HashMap<String, PendingApproval>>,
    by_task: Mutex<HashMap<String, String>>,
    ttl: Duration,
}

impl ApprovalTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            by_request: Mutex::new(HashMap::new()),
            by_task: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn insert(&self, approval: PendingApproval) {
        let task_id = approval.task_id.clone();
        let request_id = approval.request_id.clone();
        self.by_request.lock().await.insert(request_id.clone(), approval);
        self.by_task.lock().await.insert(task_id, request_id);
    }

    pub async fn request_id_for_task(&self, task_id: &str) -> Option<String> {
        self.by_task.lock().await.get(task_id).cloned()
    }

    /// Remove the pending approval for `task_id`, if any. The second call
    /// for the same task returns `None` -- this is what makes `grant`
    /// effective exactly once.
    pub async fn remove_by_task(&self, task_id: &str) -> Option<PendingApproval> {
        let request_id = self.by_task.lock().await.remove(task_id)?;
        self.by_request.lock().await.remove(&request_id)
    }

    pub async fn sweep(&self) -> Vec<PendingApproval> {
        let now = Instant::now();
        let mut by_request = self.by_request.lock().await;
        let expired_ids: Vec<String> = by_request
            .iter()
            .filter(|(_, a)| now.duration_since(a.requested_at) > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        let mut expired = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(a) = by_request.remove(&id) {
                expired.push(a);
            }
        }
        drop(by_request);
        if !expired.is_empty() {
            let mut by_task = self.by_task.lock().await;
            for a in &expired {
                by_task.remove(&a.task_id);
            }
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.by_request.lock().await.len()
    }

    /// Snapshot of every pending approval, for the `approval.list` RPC.
    pub async fn list(&self) -> Vec<PendingApproval> {
        self.by_request.lock().await.values().cloned().collect()
    }
}

/// `sessionId -> taskId`, so an approval event keyed by session can be
/// traced back to the task whose tool call triggered it.
pub struct SessionTaskMapping {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    ttl: Duration,
}

impl SessionTaskMapping {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn insert(&self, session_id: &str, task_id: &str) {
        self.entries
            .lock()
            .await
            .insert(session_id.to_string(), (task_id.to_string(), Instant::now()));
    }

    pub async fn get(&self, session_id: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        let (task_id, created_at) = entries.get(session_id)?;
        if created_at.elapsed() > self.ttl {
            return None;
        }
        Some(task_id.clone())
    }

    pub async fn remove_by_task(&self, task_id: &str) {
        self.entries.lock().await.retain(|_, (t, _)| t != task_id);
    }

    pub async fn sweep(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, (_, created_at)| created_at.elapsed() <= ttl);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approval(task_id: &str) -> PendingApproval {
        PendingApproval {
            request_id: format!("req-{task_id}"),
            task_id: task_id.to_string(),
            channel_id: "c1".to_string(),
            tool_id: "exec".to_string(),
            requested_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn remove_by_task_is_effective_once() {
        let table = ApprovalTable::new(Duration::from_secs(3600));
        table.insert(approval("t1")).await;
        assert!(table.remove_by_task("t1").await.is_some());
        assert!(table.remove_by_task("t1").await.is_none());
    }

    #[tokio::test]
    async fn sweep_expires_stale_approvals() {
        let table = ApprovalTable::new(Duration::from_millis(0));
        table.insert(approval("t1")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let expired = table.sweep().await;
        assert_eq!(expired.len(), 1);
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn session_task_mapping_round_trips() {
        let mapping = SessionTaskMapping::new(Duration::from_secs(3600));
        mapping.insert("sess-1", "task-1").await;
        assert_eq!(mapping.get("sess-1").await, Some("task-1".to_string()));
        mapping.remove_by_task("task-1").await;
        assert_eq!(mapping.get("sess-1").await, None);
    }

    #[tokio::test]
    async fn session_task_mapping_expires() {
        let mapping = SessionTaskMapping::new(Duration::from_millis(0));
        mapping.insert("sess-1", "task-1").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(mapping.get("sess-1").await, None);
    }
}
