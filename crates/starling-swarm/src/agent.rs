//! Agent model tracked by the swarm scheduler.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use starling_core::{AgentId, TaskId};

/// Lifecycle state of a registered agent.
///
/// `Working` is entered only through task assignment; the remaining states
/// are driven by the host through the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Registered and available for assignment.
    Idle,
    /// Executing an assigned task.
    Working,
    /// Temporarily unavailable, e.g. awaiting an external resource.
    Waiting,
    /// Finished its role in the current swarm run.
    Completed,
    /// Reported a fault by the host.
    Failed,
    /// Permanently removed from consideration.
    Terminated,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Registration profile for a new agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Identity the agent registers under.
    pub id: AgentId,
    /// Free-form role label, e.g. `"crawler"` or `"analyzer"`.
    pub role: String,
    /// Capabilities the agent offers for task matching.
    pub capabilities: BTreeSet<String>,
}

impl AgentProfile {
    /// Creates a profile with the given identity and role.
    pub fn new(id: impl Into<AgentId>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            capabilities: BTreeSet::new(),
        }
    }

    /// Adds a capability to the profile.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }
}

/// Cumulative execution metrics for one agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Tasks the agent finished successfully.
    pub tasks_completed: u32,
    /// Execution attempts that ended in failure.
    pub tasks_failed: u32,
    /// Wall-clock milliseconds spent across all attempts.
    pub total_duration_ms: u64,
}

impl AgentMetrics {
    /// Mean duration of a completed task, or zero before the first completion.
    pub fn average_duration_ms(&self) -> f64 {
        if self.tasks_completed == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / f64::from(self.tasks_completed)
    }
}

/// A registered agent and its runtime bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Identity of the agent.
    pub id: AgentId,
    /// Free-form role label.
    pub role: String,
    /// Capabilities offered for task matching.
    pub capabilities: BTreeSet<String>,
    /// Current lifecycle state.
    pub state: AgentState,
    /// The task currently assigned, if any.
    pub current_task: Option<TaskId>,
    /// Host-managed scratch memory.
    pub memory: HashMap<String, Value>,
    /// Declared topology links to other agents.
    pub connections: BTreeSet<AgentId>,
    /// Cumulative execution metrics.
    pub metrics: AgentMetrics,
    /// When the agent registered.
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    pub(crate) fn from_profile(profile: AgentProfile) -> Self {
        Self {
            id: profile.id,
            role: profile.role,
            capabilities: profile.capabilities,
            state: AgentState::Idle,
            current_task: None,
            memory: HashMap::new(),
            connections: BTreeSet::new(),
            metrics: AgentMetrics::default(),
            registered_at: Utc::now(),
        }
    }

    /// Whether the agent offers every required capability. An empty
    /// requirement set matches any agent.
    pub fn can_handle(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Whether the agent can accept an assignment right now.
    pub fn is_idle(&self) -> bool {
        self.state == AgentState::Idle && self.current_task.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, caps: &[&str]) -> AgentProfile {
        let mut p = AgentProfile::new(id, "worker");
        for cap in caps {
            p = p.with_capability(*cap);
        }
        p
    }

    #[test]
    fn test_capability_superset_matches() {
        let agent = Agent::from_profile(profile("a", &["dom", "screenshot", "network"]));

        let mut required = BTreeSet::new();
        required.insert("dom".to_owned());
        required.insert("network".to_owned());
        assert!(agent.can_handle(&required));

        required.insert("video".to_owned());
        assert!(!agent.can_handle(&required));
    }

    #[test]
    fn test_empty_requirements_match_any_agent() {
        let agent = Agent::from_profile(profile("a", &[]));
        assert!(agent.can_handle(&BTreeSet::new()));
    }

    #[test]
    fn test_new_agent_is_idle() {
        let agent = Agent::from_profile(profile("a", &["dom"]));
        assert_eq!(agent.state, AgentState::Idle);
        assert!(agent.is_idle());
        assert_eq!(agent.metrics.tasks_completed, 0);
    }

    #[test]
    fn test_average_duration() {
        let mut metrics = AgentMetrics::default();
        assert!((metrics.average_duration_ms() - 0.0).abs() < f64::EPSILON);

        metrics.tasks_completed = 4;
        metrics.total_duration_ms = 100;
        assert!((metrics.average_duration_ms() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_state_display_is_lowercase() {
        assert_eq!(AgentState::Working.to_string(), "working");
        assert_eq!(AgentState::Terminated.to_string(), "terminated");
    }
}
