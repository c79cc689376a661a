//! Execution seam between the scheduler and the host.
//!
//! The scheduler never runs work itself. Each assignment is handed to a
//! [`TaskExecutor`], and the outcome is reported back through
//! `Scheduler::complete_task` or `Scheduler::fail_task`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use starling_core::{AgentId, SwarmResult, TaskId};

/// Everything an executor needs to run one assignment.
#[derive(Debug, Clone)]
pub struct TaskAssignment {
    /// The assigned task.
    pub task: TaskId,
    /// The agent the task was assigned to.
    pub agent: AgentId,
    /// Human-readable task name.
    pub name: String,
    /// Dispatch operation, when the task declares one.
    pub kind: Option<String>,
    /// Opaque task input.
    pub payload: Value,
    /// 1-based attempt number, counting retries.
    pub attempt: u32,
}

/// Runs assigned tasks on behalf of the swarm.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Executes one assignment and returns its result value.
    async fn execute(&self, assignment: TaskAssignment) -> SwarmResult<Value>;
}

/// Executor that completes every task immediately with a null result.
///
/// Useful for tests and for hosts that drive completions themselves through
/// the scheduler's reporting methods.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExecutor;

#[async_trait]
impl TaskExecutor for NoopExecutor {
    async fn execute(&self, _assignment: TaskAssignment) -> SwarmResult<Value> {
        Ok(Value::Null)
    }
}

/// A host service that exposes named operations taking JSON arguments.
#[async_trait]
pub trait NativeDispatch: Send + Sync {
    /// Invokes a named operation with the given arguments.
    async fn invoke(&self, operation: &str, args: Value) -> SwarmResult<Value>;
}

/// Executor that routes each task to a [`NativeDispatch`] operation.
///
/// The task's `kind` selects the operation, falling back to the task name
/// when no kind is set.
pub struct DispatchExecutor {
    dispatch: Arc<dyn NativeDispatch>,
}

impl DispatchExecutor {
    /// Wraps a dispatch service as a task executor.
    pub fn new(dispatch: Arc<dyn NativeDispatch>) -> Self {
        Self { dispatch }
    }
}

#[async_trait]
impl TaskExecutor for DispatchExecutor {
    async fn execute(&self, assignment: TaskAssignment) -> SwarmResult<Value> {
        let operation = assignment.kind.as_deref().unwrap_or(&assignment.name);
        self.dispatch.invoke(operation, assignment.payload).await
    }
}
