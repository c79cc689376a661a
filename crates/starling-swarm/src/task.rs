//! Task model for the swarm scheduler.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use starling_core::{AgentId, TaskId};

/// Default number of retries granted to a task that does not specify one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle status of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue for assignment.
    Pending,
    /// Dispatched to an agent and currently executing.
    Assigned {
        /// Agent the task was handed to.
        agent: AgentId,
    },
    /// Finished successfully.
    Completed,
    /// Exhausted its retry budget.
    Failed {
        /// Reason reported by the last execution attempt.
        reason: String,
    },
}

/// Description of a unit of work to submit to the scheduler.
///
/// The identifier is generated up front so callers can wire dependency
/// edges between specs before any of them are submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Identifier the task will carry once submitted.
    pub id: TaskId,
    /// Human-readable task name.
    pub name: String,
    /// Operation routed to a dispatch executor. Falls back to `name` when unset.
    #[serde(default)]
    pub kind: Option<String>,
    /// Scheduling priority. Lower values run sooner.
    #[serde(default = "default_priority")]
    pub priority: f64,
    /// Capabilities an agent must hold to receive this task.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Tasks that must complete before this one becomes ready.
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Opaque input handed to the executor.
    #[serde(default)]
    pub payload: Value,
    /// How many times a failed execution is retried before the task is
    /// marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_priority() -> f64 {
    1.0
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl TaskSpec {
    /// Creates a spec with a fresh identifier and default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            kind: None,
            priority: default_priority(),
            required_capabilities: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            payload: Value::Null,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Sets the scheduling priority.
    #[must_use]
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    /// Requires a capability from the executing agent.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    /// Adds a dependency on another task.
    #[must_use]
    pub fn with_dependency(mut self, task: TaskId) -> Self {
        self.dependencies.insert(task);
        self
    }

    /// Sets the executor payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the dispatch operation.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// A unit of work tracked by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,
    /// Human-readable task name.
    pub name: String,
    /// Operation routed to a dispatch executor.
    pub kind: Option<String>,
    /// Scheduling priority. Lower values run sooner.
    pub priority: f64,
    /// Capabilities an agent must hold to receive this task.
    pub required_capabilities: BTreeSet<String>,
    /// Tasks that must complete before this one becomes ready.
    pub dependencies: BTreeSet<TaskId>,
    /// Opaque input handed to the executor.
    pub payload: Value,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Retries consumed so far.
    pub retries: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Result reported by a successful execution.
    pub result: Option<Value>,
    /// Reason reported by the most recent failed execution.
    pub error: Option<String>,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
    /// When the current assignment was made, if any.
    pub assigned_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            kind: spec.kind,
            priority: spec.priority,
            required_capabilities: spec.required_capabilities,
            dependencies: spec.dependencies,
            payload: spec.payload,
            status: TaskStatus::Pending,
            retries: 0,
            max_retries: spec.max_retries,
            result: None,
            error: None,
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
        }
    }

    /// Scheduling weight. Priority discounted by 0.1 per dependency, and
    /// lower weights are scheduled first.
    pub fn weight(&self) -> f64 {
        self.priority - 0.1 * self.dependencies.len() as f64
    }

    /// Whether the task is pending and all of its dependencies are in the
    /// completed set.
    pub fn is_ready(&self, completed: &BTreeSet<TaskId>) -> bool {
        self.status == TaskStatus::Pending
            && self.dependencies.iter().all(|dep| completed.contains(dep))
    }

    /// Whether the task has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed { .. }
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder_defaults() {
        let spec = TaskSpec::new("crawl page");
        assert_eq!(spec.name, "crawl page");
        assert!((spec.priority - 1.0).abs() < f64::EPSILON);
        assert_eq!(spec.max_retries, DEFAULT_MAX_RETRIES);
        assert!(spec.required_capabilities.is_empty());
        assert!(spec.dependencies.is_empty());
        assert_eq!(spec.payload, Value::Null);
    }

    #[test]
    fn test_weight_discounts_dependencies() {
        let dep_a = TaskId::new();
        let dep_b = TaskId::new();
        let spec = TaskSpec::new("report")
            .with_priority(2.0)
            .with_dependency(dep_a)
            .with_dependency(dep_b);
        let task = Task::from_spec(spec);
        assert!((task.weight() - 1.8).abs() < 1e-9);
    }

    #[test]
    fn test_is_ready_requires_completed_dependencies() {
        let dep = TaskId::new();
        let task = Task::from_spec(TaskSpec::new("extract").with_dependency(dep));

        let mut completed = BTreeSet::new();
        assert!(!task.is_ready(&completed));

        completed.insert(dep);
        assert!(task.is_ready(&completed));
    }

    #[test]
    fn test_assigned_task_is_not_ready() {
        let mut task = Task::from_spec(TaskSpec::new("analyze"));
        task.status = TaskStatus::Assigned {
            agent: AgentId::new("worker-1"),
        };
        assert!(!task.is_ready(&BTreeSet::new()));
        assert!(!task.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let status = TaskStatus::Failed {
            reason: "timeout".into(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("failed"));
        assert!(json.contains("timeout"));

        let back: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
