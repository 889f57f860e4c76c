//! Workflow coordinator: runs phase templates as tasks on worker nodes.
//!
//! State machines:
//!   workflow  running → completed | failed
//!   phase     pending → dispatched → completed | failed
//!   task      pending → running → completed | failed | timeout
//!
//! Phases run strictly in order. A phase fails when any of its tasks ends
//! failed or timed out; unless the phase allows `continue_on_failure` that
//! fails the workflow and the remaining phases are never dispatched.
//!
//! A phase targets named nodes, worker kinds, or both. A kind resolves when
//! the task is dispatched, to the online node of that kind with the fewest
//! open tasks, so scaled-out instances share the load.
//!
//! Finished workflows are kept for status queries up to
//! `max_finished_workflows`; beyond that the oldest go, with their tasks.
//!
//! The coordinator never retries a dispatch on its own. A phase that declares
//! `max_retries` gets a brand-new task (retry count + 1) per retry; tasks that
//! end without success are copied to the dead-letter list.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use hive_core::config::CoordinatorSettings;
use hive_core::message::now_ms;
use hive_core::{ExecuteTask, HiveError, NodeId, PhaseTemplate, Result, TaskOutcome, WorkflowTemplate};

use crate::bus::MessageBus;
use crate::events::{EventHub, HiveEvent};
use crate::registry::{Node, NodeRegistry};
use crate::resilience::RetryPolicy;
use crate::task_store::{QueueView, Task, TaskStatus, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Dispatched,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub name: String,
    pub parallel: bool,
    pub continue_on_failure: bool,
    pub status: PhaseStatus,
    /// Every task created for the phase, retries included.
    pub task_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    #[serde(rename = "type")]
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub phases: Vec<PhaseRecord>,
    pub created_at: u64,
    pub completed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Workflow plus its tasks, as served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowView {
    #[serde(flatten)]
    pub workflow: Workflow,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationReport {
    pub agents_online: usize,
    pub agents_expected: usize,
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowCounts {
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HiveStatus {
    pub active: bool,
    pub agents: Vec<Node>,
    pub queue: QueueView,
    pub workflows: WorkflowCounts,
    pub dead_letters: usize,
}

/// Task type → worker type, by keyword, for tasks aimed at nodes the
/// registry has not seen.
pub fn worker_type_for(task_type: &str) -> &'static str {
    const MAPPING: &[(&str, &str)] = &[
        ("research", "research"),
        ("code", "code"),
        ("data", "data"),
        ("testing", "qa"),
        ("quality", "qa"),
        ("qa", "qa"),
    ];
    let lower = task_type.to_ascii_lowercase();
    MAPPING
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, kind)| *kind)
        .unwrap_or("coordinator")
}

/// Shallow merge: keys of `override_params` replace those of `base`.
pub fn merge_params(base: &Value, override_params: &Value) -> Value {
    let mut merged = match base {
        Value::Object(m) => m.clone(),
        _ => Map::new(),
    };
    if let Value::Object(o) = override_params {
        for (k, v) in o {
            merged.insert(k.clone(), v.clone());
        }
    }
    Value::Object(merged)
}

struct CoordinatorInner {
    bus: MessageBus,
    registry: NodeRegistry,
    tasks: TaskStore,
    workflows: DashMap<String, Workflow>,
    templates: HashMap<String, WorkflowTemplate>,
    settings: CoordinatorSettings,
    retry: RetryPolicy,
    events: EventHub,
    active: AtomicBool,
    /// task_id → cancels the in-flight dispatch
    inflight: DashMap<String, CancellationToken>,
    /// Finished workflow ids, oldest first.
    finished: Mutex<VecDeque<String>>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    pub fn new(
        bus: MessageBus,
        registry: NodeRegistry,
        tasks: TaskStore,
        settings: CoordinatorSettings,
        retry: RetryPolicy,
        events: EventHub,
    ) -> Result<Self> {
        let mut templates = HashMap::new();
        for template in &settings.workflows {
            template.validate()?;
            templates.insert(template.name.clone(), template.clone());
        }
        tasks.set_dead_letter_limit(settings.max_dead_letters);
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                bus,
                registry,
                tasks,
                workflows: DashMap::new(),
                templates,
                settings,
                retry,
                events,
                active: AtomicBool::new(false),
                inflight: DashMap::new(),
                finished: Mutex::new(VecDeque::new()),
            }),
        })
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.inner.tasks
    }

    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    pub fn template_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.templates.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    // ── Activation ────────────────────────────────────────────────────────────

    /// Poll the registry once per second until every expected node is online
    /// or `timeout` elapses.
    pub async fn wait_for_agents(&self, timeout: Duration) -> bool {
        let expected = self.inner.settings.resolved_expected_agents();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let missing: Vec<&String> = expected
                .iter()
                .filter(|id| !self.inner.registry.is_online(id))
                .collect();
            if missing.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(?missing, "agents missing after wait");
                return false;
            }
            tracing::debug!(missing = missing.len(), "waiting for agents");
        }
    }

    /// Wait for the expected agents, then mark the hive active. Proceeds
    /// degraded when some never show up.
    pub async fn activate(&self) -> ActivationReport {
        let expected = self.inner.settings.resolved_expected_agents();
        let wait = Duration::from_secs(self.inner.settings.wait_for_agents_secs);
        let all_online = self.wait_for_agents(wait).await;
        let online = expected
            .iter()
            .filter(|id| self.inner.registry.is_online(id))
            .count();

        self.inner.active.store(true, Ordering::SeqCst);
        let report = ActivationReport {
            agents_online: online,
            agents_expected: expected.len(),
            degraded: !all_online,
        };
        tracing::info!(?report, "hive activated");
        self.inner.events.emit(HiveEvent::SpawnActivated {
            agents_online: report.agents_online,
            agents_expected: report.agents_expected,
            degraded: report.degraded,
        });
        self.inner.events.emit(HiveEvent::AgentStatusUpdate {
            agents: self.inner.registry.discover(),
        });
        report
    }

    /// Mark the hive inactive and cancel every in-flight dispatch.
    pub fn deactivate(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        for entry in self.inner.inflight.iter() {
            entry.value().cancel();
        }
        tracing::info!("hive deactivated");
        self.inner.events.emit(HiveEvent::SpawnDeactivated);
    }

    // ── Workflows ─────────────────────────────────────────────────────────────

    fn create_workflow(&self, workflow_type: &str, params_override: &Value) -> Result<(Workflow, WorkflowTemplate)> {
        let template = self
            .inner
            .templates
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| HiveError::NotFound(format!("workflow type {workflow_type:?}")))?;
        if !(params_override.is_null() || params_override.is_object()) {
            return Err(HiveError::Validation("paramsOverride must be an object".into()));
        }
        let workflow = Workflow {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_type: workflow_type.to_string(),
            status: WorkflowStatus::Running,
            phases: template
                .phases
                .iter()
                .map(|p| PhaseRecord {
                    name: p.name.clone(),
                    parallel: p.parallel,
                    continue_on_failure: p.continue_on_failure,
                    status: PhaseStatus::Pending,
                    task_ids: Vec::new(),
                })
                .collect(),
            created_at: now_ms(),
            completed_at: None,
            error: None,
        };
        self.inner.workflows.insert(workflow.id.clone(), workflow.clone());
        tracing::info!(workflow_id = %workflow.id, workflow_type, "workflow started");
        self.inner.events.emit(HiveEvent::WorkflowStarted {
            workflow_id: workflow.id.clone(),
            workflow_type: workflow_type.to_string(),
        });
        Ok((workflow, template))
    }

    /// Start a workflow in the background and return its id.
    pub fn start_workflow(&self, workflow_type: &str, params_override: Option<Value>) -> Result<String> {
        let params_override = params_override.unwrap_or(Value::Null);
        let (workflow, template) = self.create_workflow(workflow_type, &params_override)?;
        let id = workflow.id.clone();
        let this = self.clone();
        tokio::spawn(async move {
            this.execute(&workflow.id, &template, &params_override).await;
        });
        Ok(id)
    }

    /// Run a workflow to completion and return its final record.
    pub async fn run_workflow(&self, workflow_type: &str, params_override: Option<Value>) -> Result<Workflow> {
        let params_override = params_override.unwrap_or(Value::Null);
        let (workflow, template) = self.create_workflow(workflow_type, &params_override)?;
        self.execute(&workflow.id, &template, &params_override).await;
        self.workflow(&workflow.id)
            .ok_or_else(|| HiveError::NotFound(format!("workflow {}", workflow.id)))
    }

    pub fn workflow(&self, id: &str) -> Option<Workflow> {
        self.inner.workflows.get(id).map(|w| w.clone())
    }

    pub fn workflow_view(&self, id: &str) -> Result<WorkflowView> {
        let workflow = self
            .workflow(id)
            .ok_or_else(|| HiveError::NotFound(format!("workflow {id}")))?;
        Ok(WorkflowView {
            tasks: self.inner.tasks.tasks_for_workflow(id),
            workflow,
        })
    }

    pub fn status(&self) -> HiveStatus {
        let mut counts = WorkflowCounts::default();
        for w in self.inner.workflows.iter() {
            match w.status {
                WorkflowStatus::Running => counts.running += 1,
                WorkflowStatus::Completed => counts.completed += 1,
                WorkflowStatus::Failed => counts.failed += 1,
            }
        }
        HiveStatus {
            active: self.is_active(),
            agents: self.inner.registry.discover(),
            queue: self.inner.tasks.queue_view(),
            workflows: counts,
            dead_letters: self.inner.tasks.dead_letters().len(),
        }
    }

    fn set_phase_status(&self, workflow_id: &str, index: usize, status: PhaseStatus) {
        if let Some(mut w) = self.inner.workflows.get_mut(workflow_id) {
            if let Some(p) = w.phases.get_mut(index) {
                p.status = status;
            }
        }
    }

    fn record_task(&self, workflow_id: &str, index: usize, task_id: &str) {
        if let Some(mut w) = self.inner.workflows.get_mut(workflow_id) {
            if let Some(p) = w.phases.get_mut(index) {
                p.task_ids.push(task_id.to_string());
            }
        }
    }

    fn finish_workflow(&self, workflow_id: &str, status: WorkflowStatus, error: Option<String>) {
        if let Some(mut w) = self.inner.workflows.get_mut(workflow_id) {
            w.status = status;
            w.completed_at = Some(now_ms());
            w.error = error.clone();
        }
        tracing::info!(workflow_id, ?status, ?error, "workflow finished");
        self.inner.events.emit(HiveEvent::WorkflowFinished {
            workflow_id: workflow_id.to_string(),
            status: format!("{status:?}").to_lowercase(),
            error,
        });
        self.inner
            .finished
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(workflow_id.to_string());
        self.prune_finished_workflows();
    }

    /// Drop the oldest finished workflows, and their tasks, beyond
    /// `max_finished_workflows`. Returns how many were dropped.
    pub fn prune_finished_workflows(&self) -> usize {
        let limit = self.inner.settings.max_finished_workflows;
        let expired: Vec<String> = {
            let mut finished = self.inner.finished.lock().unwrap_or_else(|p| p.into_inner());
            let excess = finished.len().saturating_sub(limit);
            finished.drain(..excess).collect()
        };
        for id in &expired {
            self.inner.workflows.remove(id);
            let tasks = self.inner.tasks.remove_workflow(id);
            tracing::debug!(workflow_id = %id, tasks, "finished workflow dropped");
        }
        expired.len()
    }

    async fn execute(&self, workflow_id: &str, template: &WorkflowTemplate, params_override: &Value) {
        for (index, phase) in template.phases.iter().enumerate() {
            self.set_phase_status(workflow_id, index, PhaseStatus::Dispatched);
            let ok = self.run_phase(workflow_id, index, phase, params_override).await;
            let status = if ok { PhaseStatus::Completed } else { PhaseStatus::Failed };
            self.set_phase_status(workflow_id, index, status);
            tracing::info!(workflow_id, phase = %phase.name, ?status, "phase finished");

            if !ok && !phase.continue_on_failure {
                self.finish_workflow(
                    workflow_id,
                    WorkflowStatus::Failed,
                    Some(format!("phase {:?} failed", phase.name)),
                );
                return;
            }
        }
        self.finish_workflow(workflow_id, WorkflowStatus::Completed, None);
    }

    fn build_tasks(&self, workflow_id: &str, phase: &PhaseTemplate, params_override: &Value) -> Vec<Task> {
        let params = merge_params(&phase.params, params_override);
        let mut tasks = Vec::new();
        for node in &phase.target_nodes {
            let worker_type = self
                .inner
                .registry
                .get(node)
                .map(|n| n.kind)
                .filter(|k| !k.is_empty());
            for task_type in &phase.task_types {
                let kind = worker_type
                    .clone()
                    .unwrap_or_else(|| worker_type_for(task_type).to_string());
                tasks.push(Task::new(task_type.clone(), node.clone(), kind, params.clone()));
            }
        }
        for kind in &phase.target_kinds {
            for task_type in &phase.task_types {
                tasks.push(Task::for_kind(task_type.clone(), kind.clone(), params.clone()));
            }
        }
        for task in &mut tasks {
            task.workflow_id = Some(workflow_id.to_string());
            task.phase = Some(phase.name.clone());
            task.priority = phase.priority;
        }
        tasks
    }

    /// Online node of `kind` with the fewest open tasks, counting both what
    /// it reports and what this coordinator has sent it. Ties go to the
    /// lowest id.
    pub fn least_loaded(&self, kind: &str) -> Option<NodeId> {
        self.inner
            .registry
            .online_of_kind(kind)
            .into_iter()
            .map(|n| {
                let load = n.metrics.active_tasks as usize + self.inner.tasks.open_for_node(&n.id);
                (load, n.id)
            })
            .min()
            .map(|(_, id)| id)
    }

    fn resolve_target(&self, task: &mut Task) {
        if let Some(kind) = &task.target_kind {
            task.target_node_id = self.least_loaded(kind).unwrap_or_default();
        }
    }

    /// Returns whether the phase succeeded.
    async fn run_phase(&self, workflow_id: &str, index: usize, phase: &PhaseTemplate, params_override: &Value) -> bool {
        let tasks = self.build_tasks(workflow_id, phase, params_override);
        if phase.parallel {
            let runs = tasks
                .into_iter()
                .map(|task| self.run_task(workflow_id, index, task, phase.max_retries));
            let results = futures::future::join_all(runs).await;
            results.into_iter().all(|ok| ok)
        } else {
            let mut all_ok = true;
            for task in tasks {
                if !self.run_task(workflow_id, index, task, phase.max_retries).await {
                    all_ok = false;
                    if !phase.continue_on_failure {
                        break;
                    }
                }
            }
            all_ok
        }
    }

    /// Dispatch a task, creating retry tasks while the budget allows.
    async fn run_task(&self, workflow_id: &str, index: usize, task: Task, max_retries: u32) -> bool {
        let mut current = task;
        loop {
            self.resolve_target(&mut current);
            self.inner.tasks.insert(current.clone());
            self.record_task(workflow_id, index, &current.id);

            match self.dispatch(&current).await {
                Ok(()) => return true,
                Err(e) if current.retry_count < max_retries => {
                    let next = current.retry();
                    let delay = self.inner.retry.backoff_for(current.retry_count);
                    tracing::warn!(
                        task_id = %current.id,
                        retry_id = %next.id,
                        retry = next.retry_count,
                        ?delay,
                        error = %e,
                        "task failed, retrying as new task"
                    );
                    self.inner.tasks.set_superseded_by(&current.id, &next.id);
                    tokio::time::sleep(delay).await;
                    current = next;
                }
                Err(e) => {
                    tracing::error!(task_id = %current.id, task_type = %current.task_type, error = %e, "task failed");
                    self.inner.tasks.dead_letter(&current.id);
                    return false;
                }
            }
        }
    }

    /// Send one task to its target and record the outcome on the task.
    pub async fn dispatch(&self, task: &Task) -> Result<()> {
        if task.target_node_id.is_empty() {
            let kind = task.target_kind.as_deref().unwrap_or(&task.worker_type);
            let error = format!("no online {kind} node");
            self.inner.tasks.fail(&task.id, TaskStatus::Failed, error.clone());
            return Err(HiveError::NotFound(error));
        }
        let payload = serde_json::to_value(ExecuteTask::new(task.payload()))?;
        let token = CancellationToken::new();
        self.inner.inflight.insert(task.id.clone(), token.clone());
        self.inner.tasks.mark_running(&task.id);
        tracing::debug!(task_id = %task.id, target = %task.target_node_id, "dispatching");

        let window = self.inner.settings.dispatch_timeout();
        let response = tokio::select! {
            r = self.inner.bus.request_with_timeout(&task.target_node_id, payload, window) => r,
            _ = token.cancelled() => Err(HiveError::Transport(format!(
                "dispatch to {} cancelled",
                task.target_node_id
            ))),
        };
        self.inner.inflight.remove(&task.id);

        let store = &self.inner.tasks;
        match response {
            Ok(value) => match serde_json::from_value::<TaskOutcome>(value) {
                Ok(outcome) if outcome.success => {
                    store.complete(&task.id, outcome.result.unwrap_or(Value::Null));
                    tracing::info!(task_id = %task.id, task_type = %task.task_type, "task completed");
                    Ok(())
                }
                Ok(outcome) => {
                    let error = outcome.error.unwrap_or_else(|| "unspecified failure".into());
                    store.fail(&task.id, TaskStatus::Failed, error.clone());
                    Err(HiveError::TaskFailure(error))
                }
                Err(e) => {
                    let error = format!("malformed task result: {e}");
                    store.fail(&task.id, TaskStatus::Failed, error.clone());
                    Err(HiveError::Validation(error))
                }
            },
            Err(e) => {
                let status = if e.is_timeout() { TaskStatus::Timeout } else { TaskStatus::Failed };
                store.fail(&task.id, status, e.to_string());
                Err(e)
            }
        }
    }

    // ── Discovery ─────────────────────────────────────────────────────────────

    /// Fail running tasks whose target is gone or offline, cancelling their
    /// dispatch. Returns how many were reaped.
    pub fn reap_orphaned_tasks(&self) -> usize {
        let mut reaped = 0;
        for task in self.inner.tasks.running() {
            if self.inner.registry.is_online(&task.target_node_id) {
                continue;
            }
            let error = format!("target node {} offline", task.target_node_id);
            if self.inner.tasks.fail(&task.id, TaskStatus::Failed, error) {
                if let Some((_, token)) = self.inner.inflight.remove(&task.id) {
                    token.cancel();
                }
                tracing::warn!(task_id = %task.id, node = %task.target_node_id, "orphaned task failed");
                reaped += 1;
            }
        }
        reaped
    }

    /// Reap orphans and report agent status every discovery interval.
    pub async fn discovery_loop(self, mut shutdown: broadcast::Receiver<()>) {
        let period = Duration::from_millis(self.inner.settings.discovery_interval_ms.max(100));
        let mut ticker = tokio::time::interval(period);
        let mut last_online: Vec<String> = Vec::new();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("discovery loop shutting down");
                    return;
                }

                _ = ticker.tick() => {
                    self.reap_orphaned_tasks();
                    let agents = self.inner.registry.discover();
                    let online: Vec<String> = agents
                        .iter()
                        .filter(|n| n.is_online())
                        .map(|n| n.id.clone())
                        .collect();
                    if online != last_online {
                        tracing::info!(online = online.len(), total = agents.len(), "agent status changed");
                        self.inner.events.emit(HiveEvent::AgentStatusUpdate { agents });
                        last_online = online;
                    }
                }
            }
        }
    }
}
