use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;

use hive_core::message::now_ms;
use hive_core::{NodeId, TaskPayload, TaskPriority};

/// Completed-task latencies kept for the scaler's average.
const LATENCY_SAMPLES: usize = 10;
const DEFAULT_DEAD_LETTERS: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

/// Full state of a dispatched task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(rename = "type")]
    pub task_type: String,
    pub target_node_id: NodeId,
    /// Set when the phase named a worker type rather than a node; the target
    /// is then picked at dispatch and empty when no such node is online.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_kind: Option<String>,
    /// Worker type of the target node; what the scaler counts queues by.
    pub worker_type: String,
    pub params: serde_json::Value,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub retry_count: u32,
    /// Unix ms.
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Id of the retry task that replaced this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

impl Task {
    pub fn new(
        task_type: impl Into<String>,
        target_node_id: impl Into<NodeId>,
        worker_type: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: None,
            phase: None,
            task_type: task_type.into(),
            target_node_id: target_node_id.into(),
            target_kind: None,
            worker_type: worker_type.into(),
            params,
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            retry_count: 0,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            superseded_by: None,
        }
    }

    /// A fresh pending task that retries this one.
    pub fn retry(&self) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            retry_count: self.retry_count + 1,
            status: TaskStatus::Pending,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            superseded_by: None,
            ..self.clone()
        }
    }

    /// A task for whichever online node of `kind` is least loaded.
    pub fn for_kind(
        task_type: impl Into<String>,
        kind: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        let kind = kind.into();
        let mut task = Self::new(task_type, NodeId::new(), kind.clone(), params);
        task.target_kind = Some(kind);
        task
    }

    /// Wire payload sent to the worker.
    pub fn payload(&self) -> TaskPayload {
        TaskPayload {
            id: self.id.clone(),
            task_type: self.task_type.clone(),
            params: self.params.clone(),
            // Kind-targeted results are shared by every node of the kind.
            agent_id: Some(
                self.target_kind
                    .clone()
                    .unwrap_or_else(|| self.target_node_id.clone()),
            ),
            priority: self.priority,
            cacheable: true,
        }
    }

    pub fn latency_ms(&self) -> Option<u64> {
        Some(self.completed_at?.saturating_sub(self.started_at?))
    }
}

/// Queue snapshot used by the scaler and the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueView {
    /// Non-terminal tasks, summed across priority queues.
    pub depth: usize,
    pub by_priority: BTreeMap<TaskPriority, usize>,
    pub by_worker_type: BTreeMap<String, usize>,
    /// Mean latency of the most recent completed tasks. 0 when none.
    pub avg_latency_ms: f64,
}

impl QueueView {
    pub fn for_worker_type(&self, kind: &str) -> usize {
        self.by_worker_type.get(kind).copied().unwrap_or(0)
    }
}

/// In-memory task store.
///
/// Tasks stay until their workflow is removed; the dead-letter list keeps
/// only the most recent entries.
#[derive(Clone)]
pub struct TaskStore {
    /// task_id → Task
    tasks: Arc<DashMap<String, Task>>,
    /// workflow_id → task ids in creation order
    workflow_tasks: Arc<DashMap<String, Vec<String>>>,
    latencies: Arc<Mutex<VecDeque<u64>>>,
    dead_letters: Arc<Mutex<VecDeque<Task>>>,
    dead_letter_limit: Arc<AtomicUsize>,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self {
            tasks: Arc::default(),
            workflow_tasks: Arc::default(),
            latencies: Arc::default(),
            dead_letters: Arc::default(),
            dead_letter_limit: Arc::new(AtomicUsize::new(DEFAULT_DEAD_LETTERS)),
        }
    }
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the dead-letter list. Applies to every clone of this store.
    pub fn set_dead_letter_limit(&self, limit: usize) {
        self.dead_letter_limit.store(limit.max(1), Ordering::Relaxed);
        let mut letters = self.dead_letters.lock().unwrap_or_else(|p| p.into_inner());
        while letters.len() > limit.max(1) {
            letters.pop_front();
        }
    }

    /// Store a new task. Duplicate ids are silently ignored.
    pub fn insert(&self, task: Task) {
        let id = task.id.clone();
        let workflow_id = task.workflow_id.clone();
        let mut inserted = false;
        self.tasks.entry(id.clone()).or_insert_with(|| {
            inserted = true;
            task
        });
        if let (true, Some(wf)) = (inserted, workflow_id) {
            self.workflow_tasks.entry(wf).or_default().push(id);
        }
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    pub fn mark_running(&self, task_id: &str) -> bool {
        match self.tasks.get_mut(task_id) {
            Some(mut task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Running;
                task.started_at = Some(now_ms());
                true
            }
            _ => false,
        }
    }

    /// Store a result and mark the task completed. Terminal tasks are left
    /// untouched; returns whether the transition happened.
    pub fn complete(&self, task_id: &str, result: serde_json::Value) -> bool {
        let latency = {
            let Some(mut task) = self.tasks.get_mut(task_id) else {
                return false;
            };
            if task.status.is_terminal() {
                return false;
            }
            task.status = TaskStatus::Completed;
            task.completed_at = Some(now_ms());
            task.result = Some(result);
            task.latency_ms()
        };
        if let Some(ms) = latency {
            let mut lat = self.latencies.lock().unwrap_or_else(|p| p.into_inner());
            lat.push_back(ms);
            while lat.len() > LATENCY_SAMPLES {
                lat.pop_front();
            }
        }
        true
    }

    /// Mark a task failed or timed out.
    pub fn fail(&self, task_id: &str, status: TaskStatus, error: impl Into<String>) -> bool {
        debug_assert!(matches!(status, TaskStatus::Failed | TaskStatus::Timeout));
        match self.tasks.get_mut(task_id) {
            Some(mut task) if !task.status.is_terminal() => {
                task.status = status;
                task.completed_at = Some(now_ms());
                task.error = Some(error.into());
                true
            }
            _ => false,
        }
    }

    pub fn set_superseded_by(&self, task_id: &str, retry_id: &str) {
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            task.superseded_by = Some(retry_id.to_string());
        }
    }

    /// Copy a task that exhausted its retries to the dead-letter list.
    pub fn dead_letter(&self, task_id: &str) {
        if let Some(task) = self.get(task_id) {
            tracing::warn!(task_id, task_type = %task.task_type, retries = task.retry_count, "task dead-lettered");
            let limit = self.dead_letter_limit.load(Ordering::Relaxed);
            let mut letters = self.dead_letters.lock().unwrap_or_else(|p| p.into_inner());
            letters.push_back(task);
            while letters.len() > limit {
                letters.pop_front();
            }
        }
    }

    /// Oldest first.
    pub fn dead_letters(&self) -> Vec<Task> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Drop a workflow's tasks. Returns how many were removed.
    pub fn remove_workflow(&self, workflow_id: &str) -> usize {
        let Some((_, ids)) = self.workflow_tasks.remove(workflow_id) else {
            return 0;
        };
        ids.iter().filter(|id| self.tasks.remove(*id).is_some()).count()
    }

    /// Open tasks aimed at `node_id`.
    pub fn open_for_node(&self, node_id: &str) -> usize {
        self.tasks
            .iter()
            .filter(|t| !t.status.is_terminal() && t.target_node_id == node_id)
            .count()
    }

    pub fn tasks_for_workflow(&self, workflow_id: &str) -> Vec<Task> {
        self.workflow_tasks
            .get(workflow_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn running(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .map(|t| t.clone())
            .collect()
    }

    pub fn queue_view(&self) -> QueueView {
        let mut view = QueueView::default();
        for task in self.tasks.iter().filter(|t| !t.status.is_terminal()) {
            view.depth += 1;
            *view.by_priority.entry(task.priority).or_default() += 1;
            *view.by_worker_type.entry(task.worker_type.clone()).or_default() += 1;
        }
        let lat = self.latencies.lock().unwrap_or_else(|p| p.into_inner());
        if !lat.is_empty() {
            view.avg_latency_ms = lat.iter().sum::<u64>() as f64 / lat.len() as f64;
        }
        view
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
    use serde_json::json;

    fn task(kind: &str) -> Task {
        Task::new(kind, format!("{kind}-1"), kind, json!({}))
    }

    #[test]
    fn new_creates_empty_store() {
        let store = TaskStore::new();
        assert!(store.is_empty());
        assert!(store.get("nonexistent").is_none());
        assert_eq!(store.queue_view(), QueueView::default());
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let store = TaskStore::new();
        let mut t = task("research");
        t.workflow_id = Some("wf".into());
        store.insert(t.clone());
        store.insert(t);
        assert_eq!(store.len(), 1);
        assert_eq!(store.tasks_for_workflow("wf").len(), 1);
    }

    #[test]
    fn lifecycle_pending_running_completed() {
        let store = TaskStore::new();
        let t = task("code");
        let id = t.id.clone();
        store.insert(t);

        assert!(store.mark_running(&id));
        assert!(!store.mark_running(&id));
        assert_eq!(store.get(&id).unwrap().status, TaskStatus::Running);

        assert!(store.complete(&id, json!({ "ok": 1 })));
        let done = store.get(&id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.latency_ms().is_some());
    }

    #[test]
    fn terminal_tasks_are_immutable() {
        let store = TaskStore::new();
        let t = task("qa");
        let id = t.id.clone();
        store.insert(t);
        store.mark_running(&id);
        assert!(store.fail(&id, TaskStatus::Timeout, "no response"));
        assert!(!store.complete(&id, json!(1)));
        assert!(!store.fail(&id, TaskStatus::Failed, "late"));
        let t = store.get(&id).unwrap();
        assert_eq!(t.status, TaskStatus::Timeout);
        assert_eq!(t.error.as_deref(), Some("no response"));
    }

    #[test]
    fn queue_view_counts_open_tasks_by_type_and_priority() {
        let store = TaskStore::new();
        let mut high = task("code");
        high.priority = TaskPriority::High;
        store.insert(high);
        store.insert(task("code"));
        let done = task("data");
        let done_id = done.id.clone();
        store.insert(done);
        store.mark_running(&done_id);
        store.complete(&done_id, json!(null));

        let view = store.queue_view();
        assert_eq!(view.depth, 2);
        assert_eq!(view.for_worker_type("code"), 2);
        assert_eq!(view.for_worker_type("data"), 0);
        assert_eq!(view.by_priority.get(&TaskPriority::High), Some(&1));
    }

    #[test]
    fn retry_is_a_new_pending_task() {
        let mut t = task("research");
        t.status = TaskStatus::Failed;
        t.error = Some("boom".into());
        let r = t.retry();
        assert_ne!(r.id, t.id);
        assert_eq!(r.retry_count, 1);
        assert_eq!(r.status, TaskStatus::Pending);
        assert!(r.error.is_none());
        assert_eq!(r.target_node_id, t.target_node_id);
    }

    #[test]
    fn dead_letters_keep_a_copy() {
        let store = TaskStore::new();
        let t = task("qa");
        let id = t.id.clone();
        store.insert(t);
        store.fail(&id, TaskStatus::Failed, "x");
        store.dead_letter(&id);
        assert_eq!(store.dead_letters().len(), 1);
        assert!(store.get(&id).is_some());
    }

    #[test]
    fn dead_letters_keep_only_the_newest() {
        let store = TaskStore::new();
        store.clone().set_dead_letter_limit(2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let t = task("qa");
            ids.push(t.id.clone());
            store.insert(t);
            store.dead_letter(ids.last().unwrap());
        }
        let kept: Vec<String> = store.dead_letters().into_iter().map(|t| t.id).collect();
        assert_eq!(kept, ids[1..].to_vec());
    }

    #[test]
    fn removing_a_workflow_drops_its_tasks() {
        let store = TaskStore::new();
        for wf in ["a", "a", "b"] {
            let mut t = task("code");
            t.workflow_id = Some(wf.into());
            store.insert(t);
        }
        assert_eq!(store.remove_workflow("a"), 2);
        assert_eq!(store.remove_workflow("a"), 0);
        assert_eq!(store.len(), 1);
        assert!(store.tasks_for_workflow("a").is_empty());
        assert_eq!(store.tasks_for_workflow("b").len(), 1);
    }

    #[test]
    fn open_tasks_are_counted_per_node() {
        let store = TaskStore::new();
        let open = task("code");
        let done = task("code");
        let done_id = done.id.clone();
        store.insert(open);
        store.insert(done);
        store.fail(&done_id, TaskStatus::Failed, "x");
        assert_eq!(store.open_for_node("code-1"), 1);
        assert_eq!(store.open_for_node("research-1"), 0);
    }
}
