//! Workflow templates: named, ordered phase lists loaded from configuration.

use serde::{Deserialize, Serialize};

use crate::error::{HiveError, Result};
use crate::message::NodeId;
use crate::task::TaskPriority;

/// One phase of a workflow template.
///
/// Tasks are the cross product `(target_nodes ++ target_kinds) × task_types`,
/// enumerated target first, then task type, in declaration order. A target
/// kind is resolved at dispatch time to the least-loaded online node of that
/// worker type, so instances added by the scaler receive work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTemplate {
    pub name: String,
    #[serde(default)]
    pub target_nodes: Vec<NodeId>,
    #[serde(default)]
    pub target_kinds: Vec<String>,
    pub task_types: Vec<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Replacement tasks created for a failed or timed-out task. 0 = none.
    #[serde(default)]
    pub max_retries: u32,
    /// Base params for every task in the phase; overrides are merged on top.
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    pub phases: Vec<PhaseTemplate>,
}

impl WorkflowTemplate {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(HiveError::Validation("workflow template without a name".into()));
        }
        if self.phases.is_empty() {
            return Err(HiveError::Validation(format!(
                "workflow {:?} has no phases",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for phase in &self.phases {
            if phase.name.trim().is_empty() {
                return Err(HiveError::Validation(format!(
                    "workflow {:?} has an unnamed phase",
                    self.name
                )));
            }
            if !seen.insert(phase.name.as_str()) {
                return Err(HiveError::Validation(format!(
                    "workflow {:?} repeats phase {:?}",
                    self.name, phase.name
                )));
            }
            let no_targets = phase.target_nodes.is_empty() && phase.target_kinds.is_empty();
            if no_targets || phase.task_types.is_empty() {
                return Err(HiveError::Validation(format!(
                    "phase {:?} of {:?} needs targets and task types",
                    phase.name, self.name
                )));
            }
            if !(phase.params.is_null() || phase.params.is_object()) {
                return Err(HiveError::Validation(format!(
                    "phase {:?} params must be an object",
                    phase.name
                )));
            }
        }
        Ok(())
    }

    /// Every node id any phase targets, deduplicated, in first-use order.
    pub fn target_nodes(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = Vec::new();
        for node in self.phases.iter().flat_map(|p| p.target_nodes.iter()) {
            if !out.contains(node) {
                out.push(node.clone());
            }
        }
        out
    }
}

fn phase(name: &str, nodes: &[&str], types: &[&str], parallel: bool) -> PhaseTemplate {
    PhaseTemplate {
        name: name.to_string(),
        target_nodes: nodes.iter().map(|s| s.to_string()).collect(),
        target_kinds: Vec::new(),
        task_types: types.iter().map(|s| s.to_string()).collect(),
        priority: TaskPriority::Normal,
        parallel,
        continue_on_failure: false,
        max_retries: 0,
        params: serde_json::Value::Null,
    }
}

/// Built-in templates, used when the config file declares none.
pub fn default_templates() -> Vec<WorkflowTemplate> {
    vec![
        WorkflowTemplate {
            name: "delivery".to_string(),
            phases: vec![
                phase("research", &["research-1"], &["research"], false),
                phase("build", &["code-1", "data-1"], &["code", "data"], true),
                phase("verify", &["qa-1"], &["testing"], false),
            ],
        },
        WorkflowTemplate {
            name: "research".to_string(),
            phases: vec![phase("gather", &["research-1"], &["research"], false)],
        },
    ]
}
