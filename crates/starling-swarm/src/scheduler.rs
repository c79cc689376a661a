//! Priority scheduler with dependency gating and load balancing.
//!
//! Tasks queue until an assignment pass hands them to idle agents. A pass
//! runs whenever something relevant changes: the scheduler starts, a task is
//! submitted, an agent registers or returns to idle, or an execution
//! settles. Each pass orders ready tasks by weight, filters agents by
//! capability, and applies the configured load-balancing policy to pick
//! among the eligible ones.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use starling_core::{AgentId, SwarmError, SwarmResult, TaskId};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, AgentProfile, AgentState};
use crate::executor::{NoopExecutor, TaskAssignment, TaskExecutor};
use crate::task::{Task, TaskSpec, TaskStatus};

/// Policy for choosing among several eligible agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    /// Rotate through eligible agents in identifier order.
    #[default]
    RoundRobin,
    /// Prefer the agent with the fewest completed tasks.
    LeastBusy,
    /// Prefer the agent with the lowest average task duration.
    Fastest,
    /// Pick an eligible agent uniformly at random.
    Random,
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Policy for choosing among eligible agents.
    #[serde(default)]
    pub load_balancing: LoadBalancing,
    /// Capacity of the scheduler event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    64
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            load_balancing: LoadBalancing::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Events announced as tasks move through their lifecycle.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A task entered the queue.
    TaskSubmitted {
        /// The submitted task.
        task: TaskId,
    },
    /// A task was handed to an agent.
    TaskAssigned {
        /// The assigned task.
        task: TaskId,
        /// The receiving agent.
        agent: AgentId,
    },
    /// A task finished successfully.
    TaskCompleted {
        /// The completed task.
        task: TaskId,
        /// The agent that ran it.
        agent: AgentId,
    },
    /// A failed task was re-enqueued for another attempt.
    TaskRetried {
        /// The re-enqueued task.
        task: TaskId,
        /// The upcoming attempt number, counting the first run as 1.
        attempt: u32,
    },
    /// A task exhausted its retry budget.
    TaskFailed {
        /// The failed task.
        task: TaskId,
        /// Total attempts made.
        attempts: u32,
        /// Reason reported by the last attempt.
        reason: String,
    },
    /// The queue drained and every live agent is idle.
    SwarmIdle {
        /// Tasks completed so far.
        completed: usize,
        /// Tasks failed permanently so far.
        failed: usize,
    },
    /// Pending tasks remain but none of them can progress.
    Stalled {
        /// Number of tasks stuck in the queue.
        pending: usize,
    },
}

/// Point-in-time counters for the whole swarm.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SwarmStats {
    /// Tasks waiting in the queue.
    pub pending: usize,
    /// Tasks currently assigned to agents.
    pub assigned: usize,
    /// Tasks completed successfully.
    pub completed: usize,
    /// Tasks failed permanently.
    pub failed: usize,
    /// Registered agents, including terminated ones.
    pub agents: usize,
    /// Agents available for assignment.
    pub idle_agents: usize,
    /// Agents currently holding a task.
    pub working_agents: usize,
    /// Agents parked as temporarily unavailable.
    pub waiting_agents: usize,
    /// Agents that finished their role in the run.
    pub completed_agents: usize,
    /// Agents the host reported as faulted.
    pub failed_agents: usize,
    /// Agents removed from consideration.
    pub terminated_agents: usize,
}

#[derive(Default)]
struct SchedulerState {
    agents: HashMap<AgentId, Agent>,
    tasks: HashMap<TaskId, Task>,
    /// Pending task ids in submission order. Retried tasks rejoin at the back.
    queue: Vec<TaskId>,
    completed: BTreeSet<TaskId>,
    failed: BTreeSet<TaskId>,
    rr_cursor: usize,
    running: bool,
}

impl SchedulerState {
    fn choose(&mut self, eligible: &[AgentId], policy: LoadBalancing) -> AgentId {
        match policy {
            LoadBalancing::RoundRobin => {
                let idx = self.rr_cursor % eligible.len();
                self.rr_cursor = self.rr_cursor.wrapping_add(1);
                eligible[idx].clone()
            }
            LoadBalancing::LeastBusy => eligible
                .iter()
                .min_by_key(|id| {
                    self.agents
                        .get(*id)
                        .map_or(0, |agent| agent.metrics.tasks_completed)
                })
                .unwrap_or(&eligible[0])
                .clone(),
            LoadBalancing::Fastest => eligible
                .iter()
                .min_by(|a, b| {
                    let avg_a = self
                        .agents
                        .get(*a)
                        .map_or(0.0, |agent| agent.metrics.average_duration_ms());
                    let avg_b = self
                        .agents
                        .get(*b)
                        .map_or(0.0, |agent| agent.metrics.average_duration_ms());
                    avg_a
                        .partial_cmp(&avg_b)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(&eligible[0])
                .clone(),
            LoadBalancing::Random => {
                let idx = rand::rng().random_range(0..eligible.len());
                eligible[idx].clone()
            }
        }
    }

    /// Moves a pending task onto an agent and returns the dispatch order.
    fn assign(&mut self, task_id: TaskId, agent_id: &AgentId) -> Option<TaskAssignment> {
        let task = self.tasks.get_mut(&task_id)?;
        let agent = self.agents.get_mut(agent_id)?;
        self.queue.retain(|id| *id != task_id);
        task.status = TaskStatus::Assigned {
            agent: agent_id.clone(),
        };
        task.assigned_at = Some(Utc::now());
        agent.state = AgentState::Working;
        agent.current_task = Some(task_id);
        Some(TaskAssignment {
            task: task_id,
            agent: agent_id.clone(),
            name: task.name.clone(),
            kind: task.kind.clone(),
            payload: task.payload.clone(),
            attempt: task.retries + 1,
        })
    }

    /// Terminated agents do not count; any other non-idle state holds the
    /// swarm open.
    fn all_live_agents_idle(&self) -> bool {
        self.agents
            .values()
            .all(|agent| agent.state == AgentState::Terminated || agent.is_idle())
    }

    fn any_ready(&self) -> bool {
        self.queue.iter().any(|id| {
            self.tasks
                .get(id)
                .is_some_and(|task| task.is_ready(&self.completed))
        })
    }
}

/// Depth-first search for a dependency cycle reachable from `start`.
/// Dependencies on unknown tasks are treated as leaves.
fn creates_cycle(tasks: &HashMap<TaskId, Task>, start: TaskId) -> bool {
    fn visit(
        tasks: &HashMap<TaskId, Task>,
        id: TaskId,
        visiting: &mut BTreeSet<TaskId>,
        done: &mut BTreeSet<TaskId>,
    ) -> bool {
        if done.contains(&id) {
            return false;
        }
        if !visiting.insert(id) {
            return true;
        }
        if let Some(task) = tasks.get(&id) {
            for dep in &task.dependencies {
                if visit(tasks, *dep, visiting, done) {
                    return true;
                }
            }
        }
        visiting.remove(&id);
        done.insert(id);
        false
    }
    visit(tasks, start, &mut BTreeSet::new(), &mut BTreeSet::new())
}

struct SchedulerInner {
    state: RwLock<SchedulerState>,
    events: broadcast::Sender<SchedulerEvent>,
    executor: Arc<dyn TaskExecutor>,
    config: SchedulerConfig,
}

/// Assigns queued tasks to registered agents and tracks their outcomes.
///
/// Cloning the scheduler clones a handle to the same state. Execution is
/// delegated to the configured [`TaskExecutor`]; hosts that run work out of
/// band report through [`Scheduler::complete_task`] and
/// [`Scheduler::fail_task`] instead.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Creates a scheduler whose executor completes every task with null.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_executor(config, Arc::new(NoopExecutor))
    }

    /// Creates a scheduler that dispatches assignments to `executor`.
    pub fn with_executor(config: SchedulerConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(SchedulerInner {
                state: RwLock::new(SchedulerState::default()),
                events,
                executor,
                config,
            }),
        }
    }

    /// Registers an agent for assignment.
    ///
    /// An identifier can be reused only after its previous holder was
    /// terminated; the terminated record is then replaced.
    pub async fn register_agent(&self, profile: AgentProfile) -> SwarmResult<()> {
        let agent = Agent::from_profile(profile);
        let id = agent.id.clone();
        {
            let mut state = self.inner.state.write().await;
            if let Some(existing) = state.agents.get(&id) {
                if existing.state != AgentState::Terminated {
                    return Err(SwarmError::AgentAlreadyRegistered(id));
                }
            }
            state.agents.insert(id.clone(), agent);
        }
        info!(agent = %id, "Agent registered");
        self.run_assignment().await;
        Ok(())
    }

    /// Terminates an agent, removing it from assignment consideration.
    /// Refused while the agent holds a task.
    pub async fn deregister_agent(&self, agent_id: &AgentId) -> SwarmResult<()> {
        {
            let mut state = self.inner.state.write().await;
            let agent = state
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| SwarmError::AgentNotFound(agent_id.clone()))?;
            if agent.current_task.is_some() {
                return Err(SwarmError::AgentBusy(agent_id.clone()));
            }
            agent.state = AgentState::Terminated;
        }
        info!(agent = %agent_id, "Agent deregistered");
        self.check_quiescence().await;
        Ok(())
    }

    /// Moves an agent to a host-driven state.
    ///
    /// `Working` is refused (it is entered only through assignment), as is
    /// any transition out of `Terminated` or away from an agent that still
    /// holds a task. A parked agent holds the swarm open; returning it to
    /// `Idle` runs an assignment pass and re-evaluates quiescence.
    pub async fn set_agent_state(&self, agent_id: &AgentId, next: AgentState) -> SwarmResult<()> {
        {
            let mut state = self.inner.state.write().await;
            let agent = state
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| SwarmError::AgentNotFound(agent_id.clone()))?;
            let from = agent.state;
            let refused = from == AgentState::Terminated
                || next == AgentState::Working
                || agent.current_task.is_some();
            if refused {
                return Err(SwarmError::InvalidTransition {
                    worker: agent_id.clone(),
                    from: from.to_string(),
                    to: next.to_string(),
                });
            }
            agent.state = next;
            debug!(agent = %agent_id, from = %from, to = %next, "Agent state changed");
        }
        if next == AgentState::Idle {
            self.run_assignment().await;
        }
        self.check_quiescence().await;
        Ok(())
    }

    /// Stores a value in an agent's scratch memory.
    pub async fn update_agent_memory(
        &self,
        agent_id: &AgentId,
        key: impl Into<String>,
        value: Value,
    ) -> SwarmResult<()> {
        let mut state = self.inner.state.write().await;
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| SwarmError::AgentNotFound(agent_id.clone()))?;
        agent.memory.insert(key.into(), value);
        Ok(())
    }

    /// Records a mutual topology link between two agents.
    pub async fn connect_agents(&self, a: &AgentId, b: &AgentId) -> SwarmResult<()> {
        let mut state = self.inner.state.write().await;
        if !state.agents.contains_key(a) {
            return Err(SwarmError::AgentNotFound(a.clone()));
        }
        if !state.agents.contains_key(b) {
            return Err(SwarmError::AgentNotFound(b.clone()));
        }
        if let Some(agent) = state.agents.get_mut(a) {
            agent.connections.insert(b.clone());
        }
        if let Some(agent) = state.agents.get_mut(b) {
            agent.connections.insert(a.clone());
        }
        Ok(())
    }

    /// Queues a task. When the scheduler is running, an assignment pass
    /// follows immediately.
    ///
    /// The submission is rejected when its identifier is already known or
    /// when its dependency edges would close a cycle.
    pub async fn submit(&self, spec: TaskSpec) -> SwarmResult<TaskId> {
        let task = Task::from_spec(spec);
        let task_id = task.id;
        {
            let mut state = self.inner.state.write().await;
            if state.tasks.contains_key(&task_id) {
                return Err(SwarmError::Coordination(format!(
                    "task {task_id} already submitted"
                )));
            }
            state.tasks.insert(task_id, task);
            if creates_cycle(&state.tasks, task_id) {
                state.tasks.remove(&task_id);
                return Err(SwarmError::DependencyCycle(task_id));
            }
            state.queue.push(task_id);
        }
        info!(task = %task_id, "Task submitted");
        let _ = self
            .inner
            .events
            .send(SchedulerEvent::TaskSubmitted { task: task_id });
        self.run_assignment().await;
        Ok(task_id)
    }

    /// Starts assigning queued tasks.
    pub async fn start(&self) {
        {
            let mut state = self.inner.state.write().await;
            state.running = true;
        }
        info!("Scheduler started");
        self.run_assignment().await;
    }

    /// Stops making new assignments. In-flight executions still settle.
    pub async fn stop(&self) {
        let mut state = self.inner.state.write().await;
        state.running = false;
        info!("Scheduler stopped");
    }

    /// Whether the scheduler is currently assigning tasks.
    pub async fn is_running(&self) -> bool {
        self.inner.state.read().await.running
    }

    /// Re-runs the assignment pass. No-op while stopped.
    pub async fn rebalance(&self) {
        self.run_assignment().await;
    }

    /// Assigns a specific pending task to a specific idle agent, bypassing
    /// the load-balancing policy. Used by coordination layers that pick the
    /// agent themselves.
    pub async fn assign_to(&self, task_id: TaskId, agent_id: &AgentId) -> SwarmResult<()> {
        let assignment = {
            let mut state = self.inner.state.write().await;
            let task = state
                .tasks
                .get(&task_id)
                .ok_or(SwarmError::TaskNotFound(task_id))?;
            if task.status != TaskStatus::Pending {
                return Err(SwarmError::Coordination(format!(
                    "task {task_id} is not pending"
                )));
            }
            if !task.is_ready(&state.completed) {
                return Err(SwarmError::Coordination(format!(
                    "task {task_id} has unmet dependencies"
                )));
            }
            let required = task.required_capabilities.clone();
            let agent = state
                .agents
                .get(agent_id)
                .ok_or_else(|| SwarmError::AgentNotFound(agent_id.clone()))?;
            if !agent.is_idle() {
                return Err(SwarmError::AgentBusy(agent_id.clone()));
            }
            if !agent.can_handle(&required) {
                return Err(SwarmError::NoEligibleAgent { task: task_id });
            }
            state
                .assign(task_id, agent_id)
                .ok_or(SwarmError::TaskNotFound(task_id))?
        };
        self.announce_assignment(&assignment);
        self.dispatch(assignment);
        Ok(())
    }

    /// Picks the agent the load-balancing policy would assign `task_id` to,
    /// without assigning anything.
    pub async fn pick_candidate(&self, task_id: TaskId) -> SwarmResult<AgentId> {
        let mut state = self.inner.state.write().await;
        let required = state
            .tasks
            .get(&task_id)
            .ok_or(SwarmError::TaskNotFound(task_id))?
            .required_capabilities
            .clone();
        let mut eligible: Vec<AgentId> = state
            .agents
            .values()
            .filter(|agent| agent.is_idle() && agent.can_handle(&required))
            .map(|agent| agent.id.clone())
            .collect();
        if eligible.is_empty() {
            return Err(SwarmError::NoEligibleAgent { task: task_id });
        }
        eligible.sort();
        Ok(state.choose(&eligible, self.inner.config.load_balancing))
    }

    /// Records a successful execution: the task is completed, the agent
    /// returns to the idle pool, and another assignment pass runs.
    pub async fn complete_task(
        &self,
        task_id: TaskId,
        agent_id: &AgentId,
        result: Value,
    ) -> SwarmResult<()> {
        {
            let mut state = self.inner.state.write().await;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(SwarmError::TaskNotFound(task_id))?;
            check_reporter(task, &task_id, agent_id)?;
            let now = Utc::now();
            let duration_ms = elapsed_ms(task.assigned_at, now);
            task.status = TaskStatus::Completed;
            task.result = Some(result);
            task.completed_at = Some(now);
            state.completed.insert(task_id);
            if let Some(agent) = state.agents.get_mut(agent_id) {
                agent.state = AgentState::Idle;
                agent.current_task = None;
                agent.metrics.tasks_completed += 1;
                agent.metrics.total_duration_ms += duration_ms;
            }
            info!(task = %task_id, agent = %agent_id, duration_ms, "Task completed");
        }
        let _ = self.inner.events.send(SchedulerEvent::TaskCompleted {
            task: task_id,
            agent: agent_id.clone(),
        });
        self.run_assignment().await;
        self.check_quiescence().await;
        Ok(())
    }

    /// Records a failed execution. The task is re-enqueued while retries
    /// remain, otherwise it is marked failed and announced as such.
    pub async fn fail_task(
        &self,
        task_id: TaskId,
        agent_id: &AgentId,
        reason: impl Into<String>,
    ) -> SwarmResult<()> {
        let reason = reason.into();
        let retrying;
        let attempts;
        {
            let mut state = self.inner.state.write().await;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(SwarmError::TaskNotFound(task_id))?;
            check_reporter(task, &task_id, agent_id)?;
            let now = Utc::now();
            let duration_ms = elapsed_ms(task.assigned_at, now);
            task.error = Some(reason.clone());
            retrying = task.retries < task.max_retries;
            if retrying {
                task.retries += 1;
                attempts = task.retries + 1;
                task.status = TaskStatus::Pending;
                task.assigned_at = None;
                state.queue.push(task_id);
                warn!(task = %task_id, attempt = attempts, error = %reason, "Retrying task");
            } else {
                attempts = task.retries + 1;
                task.status = TaskStatus::Failed {
                    reason: reason.clone(),
                };
                task.completed_at = Some(now);
                state.failed.insert(task_id);
                let exhausted = SwarmError::MaxRetriesExceeded {
                    task: task_id,
                    attempts,
                };
                error!(agent = %agent_id, error = %exhausted, "Task failed permanently");
            }
            if let Some(agent) = state.agents.get_mut(agent_id) {
                agent.state = AgentState::Idle;
                agent.current_task = None;
                agent.metrics.tasks_failed += 1;
                agent.metrics.total_duration_ms += duration_ms;
            }
        }
        if retrying {
            let _ = self.inner.events.send(SchedulerEvent::TaskRetried {
                task: task_id,
                attempt: attempts,
            });
        } else {
            let _ = self.inner.events.send(SchedulerEvent::TaskFailed {
                task: task_id,
                attempts,
                reason,
            });
        }
        self.run_assignment().await;
        self.check_quiescence().await;
        Ok(())
    }

    /// Returns a snapshot of a task.
    pub async fn task(&self, task_id: TaskId) -> Option<Task> {
        self.inner.state.read().await.tasks.get(&task_id).cloned()
    }

    /// Whether a task is pending with every dependency completed.
    pub async fn is_ready(&self, task_id: TaskId) -> SwarmResult<bool> {
        let state = self.inner.state.read().await;
        let task = state
            .tasks
            .get(&task_id)
            .ok_or(SwarmError::TaskNotFound(task_id))?;
        Ok(task.is_ready(&state.completed))
    }

    /// Returns the result of a finished task.
    ///
    /// A permanently failed task comes back as
    /// [`SwarmError::MaxRetriesExceeded`]; an unfinished one as a
    /// coordination error.
    pub async fn task_result(&self, task_id: TaskId) -> SwarmResult<Value> {
        let state = self.inner.state.read().await;
        let task = state
            .tasks
            .get(&task_id)
            .ok_or(SwarmError::TaskNotFound(task_id))?;
        match &task.status {
            TaskStatus::Completed => Ok(task.result.clone().unwrap_or(Value::Null)),
            TaskStatus::Failed { .. } => Err(SwarmError::MaxRetriesExceeded {
                task: task_id,
                attempts: task.retries + 1,
            }),
            _ => Err(SwarmError::Coordination(format!(
                "task {task_id} has not finished"
            ))),
        }
    }

    /// Returns a snapshot of an agent.
    pub async fn agent(&self, agent_id: &AgentId) -> Option<Agent> {
        self.inner.state.read().await.agents.get(agent_id).cloned()
    }

    /// Returns all registered agents, sorted by identifier.
    pub async fn agents(&self) -> Vec<Agent> {
        let state = self.inner.state.read().await;
        let mut agents: Vec<Agent> = state.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Returns the tasks still waiting in the queue, in queue order.
    pub async fn pending_tasks(&self) -> Vec<Task> {
        let state = self.inner.state.read().await;
        state
            .queue
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    /// Returns every task that completed successfully.
    pub async fn completed_tasks(&self) -> Vec<Task> {
        let state = self.inner.state.read().await;
        state
            .completed
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    /// Returns every task that failed permanently.
    pub async fn failed_tasks(&self) -> Vec<Task> {
        let state = self.inner.state.read().await;
        state
            .failed
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    /// Returns point-in-time swarm counters.
    pub async fn stats(&self) -> SwarmStats {
        let state = self.inner.state.read().await;
        let by_state = |wanted: AgentState| {
            state
                .agents
                .values()
                .filter(|agent| agent.state == wanted)
                .count()
        };
        SwarmStats {
            pending: state.queue.len(),
            assigned: state
                .agents
                .values()
                .filter(|agent| agent.current_task.is_some())
                .count(),
            completed: state.completed.len(),
            failed: state.failed.len(),
            agents: state.agents.len(),
            idle_agents: by_state(AgentState::Idle),
            working_agents: by_state(AgentState::Working),
            waiting_agents: by_state(AgentState::Waiting),
            completed_agents: by_state(AgentState::Completed),
            failed_agents: by_state(AgentState::Failed),
            terminated_agents: by_state(AgentState::Terminated),
        }
    }

    /// Subscribes to scheduler lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    async fn run_assignment(&self) {
        let mut dispatches = Vec::new();
        {
            let mut state = self.inner.state.write().await;
            if !state.running {
                return;
            }
            let mut ready: Vec<(TaskId, f64)> = state
                .queue
                .iter()
                .filter_map(|id| {
                    state.tasks.get(id).and_then(|task| {
                        task.is_ready(&state.completed)
                            .then(|| (*id, task.weight()))
                    })
                })
                .collect();
            // Stable sort keeps submission order between equal weights.
            ready.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            for (task_id, _) in ready {
                let Some(required) = state
                    .tasks
                    .get(&task_id)
                    .map(|task| task.required_capabilities.clone())
                else {
                    continue;
                };
                let mut eligible: Vec<AgentId> = state
                    .agents
                    .values()
                    .filter(|agent| agent.is_idle() && agent.can_handle(&required))
                    .map(|agent| agent.id.clone())
                    .collect();
                if eligible.is_empty() {
                    debug!(task = %task_id, "No eligible idle agent");
                    continue;
                }
                eligible.sort();
                let agent_id = state.choose(&eligible, self.inner.config.load_balancing);
                if let Some(assignment) = state.assign(task_id, &agent_id) {
                    dispatches.push(assignment);
                }
            }
        }
        for assignment in dispatches {
            self.announce_assignment(&assignment);
            self.dispatch(assignment);
        }
    }

    fn announce_assignment(&self, assignment: &TaskAssignment) {
        info!(
            task = %assignment.task,
            agent = %assignment.agent,
            attempt = assignment.attempt,
            "Assigned task"
        );
        let _ = self.inner.events.send(SchedulerEvent::TaskAssigned {
            task: assignment.task,
            agent: assignment.agent.clone(),
        });
    }

    fn dispatch(&self, assignment: TaskAssignment) {
        let scheduler = self.clone();
        let executor = Arc::clone(&self.inner.executor);
        tokio::spawn(async move {
            let task = assignment.task;
            let agent = assignment.agent.clone();
            let report = match executor.execute(assignment).await {
                Ok(result) => scheduler.complete_task(task, &agent, result).await,
                Err(e) => scheduler.fail_task(task, &agent, e.to_string()).await,
            };
            if let Err(e) = report {
                error!(task = %task, error = %e, "Failed to record task outcome");
            }
        });
    }

    async fn check_quiescence(&self) {
        let event = {
            let state = self.inner.state.read().await;
            if !state.running || !state.all_live_agents_idle() {
                None
            } else if state.queue.is_empty() {
                Some(SchedulerEvent::SwarmIdle {
                    completed: state.completed.len(),
                    failed: state.failed.len(),
                })
            } else if state.any_ready() {
                None
            } else {
                Some(SchedulerEvent::Stalled {
                    pending: state.queue.len(),
                })
            }
        };
        match event {
            Some(SchedulerEvent::SwarmIdle { completed, failed }) => {
                info!(completed, failed, "Swarm idle: queue drained");
                let _ = self
                    .inner
                    .events
                    .send(SchedulerEvent::SwarmIdle { completed, failed });
            }
            Some(SchedulerEvent::Stalled { pending }) => {
                warn!(pending, "Swarm stalled: pending tasks cannot progress");
                let _ = self.inner.events.send(SchedulerEvent::Stalled { pending });
            }
            _ => {}
        }
    }
}

fn check_reporter(task: &Task, task_id: &TaskId, agent_id: &AgentId) -> SwarmResult<()> {
    match &task.status {
        TaskStatus::Assigned { agent } if agent == agent_id => Ok(()),
        _ => Err(SwarmError::Coordination(format!(
            "task {task_id} is not assigned to {agent_id}"
        ))),
    }
}

fn elapsed_ms(assigned_at: Option<chrono::DateTime<Utc>>, now: chrono::DateTime<Utc>) -> u64 {
    assigned_at.map_or(0, |at| (now - at).num_milliseconds().max(0) as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    struct RecordingExecutor {
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskExecutor for RecordingExecutor {
        async fn execute(&self, assignment: TaskAssignment) -> SwarmResult<Value> {
            self.order.lock().push(assignment.name);
            Ok(Value::Null)
        }
    }

    /// Fails the first `failures` attempts, then succeeds.
    struct FlakyExecutor {
        failures: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl TaskExecutor for FlakyExecutor {
        async fn execute(&self, _assignment: TaskAssignment) -> SwarmResult<Value> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                Err(SwarmError::Coordination(format!("attempt {attempt} broke")))
            } else {
                Ok(json!({ "attempt": attempt }))
            }
        }
    }

    /// Sleeps for the number of milliseconds named in the payload.
    struct SleepyExecutor;

    #[async_trait]
    impl TaskExecutor for SleepyExecutor {
        async fn execute(&self, assignment: TaskAssignment) -> SwarmResult<Value> {
            let ms = assignment.payload["sleep_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Value::Null)
        }
    }

    async fn wait_for<F>(
        events: &mut broadcast::Receiver<SchedulerEvent>,
        mut pred: F,
    ) -> SchedulerEvent
    where
        F: FnMut(&SchedulerEvent) -> bool,
    {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("timed out waiting for scheduler event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    fn profile(id: &str, caps: &[&str]) -> AgentProfile {
        let mut p = AgentProfile::new(id, "worker");
        for cap in caps {
            p = p.with_capability(*cap);
        }
        p
    }

    #[tokio::test]
    async fn test_submit_then_complete() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let mut events = scheduler.subscribe_events();
        scheduler
            .register_agent(profile("worker-1", &[]))
            .await
            .unwrap();
        scheduler.start().await;

        let task_id = scheduler.submit(TaskSpec::new("noop")).await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, SchedulerEvent::SwarmIdle { completed: 1, .. })
        })
        .await;

        let stats = scheduler.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(scheduler.task_result(task_id).await.unwrap(), Value::Null);

        let agent = scheduler.agent(&AgentId::new("worker-1")).await.unwrap();
        assert_eq!(agent.metrics.tasks_completed, 1);
        assert!(agent.is_idle());
    }

    #[tokio::test]
    async fn test_lower_weight_runs_first() {
        let executor = Arc::new(RecordingExecutor {
            order: Mutex::new(Vec::new()),
        });
        let scheduler = Scheduler::with_executor(
            SchedulerConfig::default(),
            Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        );
        let mut events = scheduler.subscribe_events();
        scheduler
            .register_agent(profile("worker-1", &[]))
            .await
            .unwrap();

        // Submitted while stopped so the pass sees all three at once.
        scheduler
            .submit(TaskSpec::new("third").with_priority(3.0))
            .await
            .unwrap();
        scheduler
            .submit(TaskSpec::new("first").with_priority(1.0))
            .await
            .unwrap();
        scheduler
            .submit(TaskSpec::new("second").with_priority(2.0))
            .await
            .unwrap();
        scheduler.start().await;

        wait_for(&mut events, |e| {
            matches!(e, SchedulerEvent::SwarmIdle { completed: 3, .. })
        })
        .await;
        assert_eq!(*executor.order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_dependency_discount_breaks_priority_tie() {
        let executor = Arc::new(RecordingExecutor {
            order: Mutex::new(Vec::new()),
        });
        let scheduler = Scheduler::with_executor(
            SchedulerConfig::default(),
            Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        );
        let mut events = scheduler.subscribe_events();
        scheduler
            .register_agent(profile("worker-1", &[]))
            .await
            .unwrap();

        let base = TaskSpec::new("base");
        let base_id = base.id;
        scheduler.submit(base).await.unwrap();
        // Same priority; the dependent one weighs 0.1 less once base is done.
        scheduler.submit(TaskSpec::new("plain")).await.unwrap();
        scheduler
            .submit(TaskSpec::new("dependent").with_dependency(base_id))
            .await
            .unwrap();
        scheduler.start().await;

        wait_for(&mut events, |e| {
            matches!(e, SchedulerEvent::SwarmIdle { completed: 3, .. })
        })
        .await;
        assert_eq!(*executor.order.lock(), vec!["base", "dependent", "plain"]);
    }

    #[tokio::test]
    async fn test_dependencies_gate_assignment() {
        let executor = Arc::new(RecordingExecutor {
            order: Mutex::new(Vec::new()),
        });
        let scheduler = Scheduler::with_executor(
            SchedulerConfig::default(),
            Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        );
        let mut events = scheduler.subscribe_events();
        scheduler
            .register_agent(profile("worker-1", &[]))
            .await
            .unwrap();

        let first = TaskSpec::new("first").with_priority(9.0);
        let first_id = first.id;
        let second = TaskSpec::new("second")
            .with_priority(1.0)
            .with_dependency(first_id);
        scheduler.submit(second).await.unwrap();
        scheduler.submit(first).await.unwrap();
        scheduler.start().await;

        wait_for(&mut events, |e| {
            matches!(e, SchedulerEvent::SwarmIdle { completed: 2, .. })
        })
        .await;
        assert_eq!(*executor.order.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_capability_filter_holds_task_until_match() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let mut events = scheduler.subscribe_events();
        scheduler
            .register_agent(profile("generalist", &[]))
            .await
            .unwrap();
        scheduler.start().await;

        scheduler
            .submit(TaskSpec::new("snapshot").with_capability("screenshot"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.stats().await.pending, 1);

        scheduler
            .register_agent(profile("specialist", &["screenshot", "dom"]))
            .await
            .unwrap();
        let event = wait_for(&mut events, |e| {
            matches!(e, SchedulerEvent::TaskCompleted { .. })
        })
        .await;
        if let SchedulerEvent::TaskCompleted { agent, .. } = event {
            assert_eq!(agent, AgentId::new("specialist"));
        }
    }

    #[tokio::test]
    async fn test_retry_budget_allows_exactly_max_retries_extra_attempts() {
        let executor = Arc::new(FlakyExecutor {
            failures: u32::MAX,
            attempts: AtomicU32::new(0),
        });
        let scheduler = Scheduler::with_executor(
            SchedulerConfig::default(),
            Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        );
        let mut events = scheduler.subscribe_events();
        scheduler
            .register_agent(profile("worker-1", &[]))
            .await
            .unwrap();
        scheduler.start().await;

        let task_id = scheduler
            .submit(TaskSpec::new("doomed").with_max_retries(3))
            .await
            .unwrap();
        let event = wait_for(&mut events, |e| {
            matches!(e, SchedulerEvent::TaskFailed { .. })
        })
        .await;

        if let SchedulerEvent::TaskFailed { task, attempts, .. } = event {
            assert_eq!(task, task_id);
            assert_eq!(attempts, 4);
        }
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.failed_tasks().await.len(), 1);
        assert!(matches!(
            scheduler.task_result(task_id).await,
            Err(SwarmError::MaxRetriesExceeded { attempts: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_flaky_task_recovers_within_budget() {
        let executor = Arc::new(FlakyExecutor {
            failures: 2,
            attempts: AtomicU32::new(0),
        });
        let scheduler = Scheduler::with_executor(
            SchedulerConfig::default(),
            Arc::clone(&executor) as Arc<dyn TaskExecutor>,
        );
        let mut events = scheduler.subscribe_events();
        scheduler
            .register_agent(profile("worker-1", &[]))
            .await
            .unwrap();
        scheduler.start().await;

        let task_id = scheduler
            .submit(TaskSpec::new("flaky").with_max_retries(3))
            .await
            .unwrap();
        wait_for(&mut events, |e| {
            matches!(e, SchedulerEvent::TaskCompleted { .. })
        })
        .await;

        let task = scheduler.task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retries, 2);
        assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_at_submission() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let spec_a = TaskSpec::new("a");
        let spec_b = TaskSpec::new("b").with_dependency(spec_a.id);
        let spec_a = spec_a.with_dependency(spec_b.id);

        scheduler.submit(spec_a).await.unwrap();
        let err = scheduler.submit(spec_b).await.unwrap_err();
        assert!(matches!(err, SwarmError::DependencyCycle(_)));
        assert_eq!(scheduler.pending_tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_assign_to_validations() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler
            .register_agent(profile("plain", &[]))
            .await
            .unwrap();
        let plain = AgentId::new("plain");

        let task_id = scheduler
            .submit(TaskSpec::new("needs dom").with_capability("dom"))
            .await
            .unwrap();
        assert!(matches!(
            scheduler.assign_to(task_id, &plain).await,
            Err(SwarmError::NoEligibleAgent { .. })
        ));

        let open = scheduler.submit(TaskSpec::new("open")).await.unwrap();
        scheduler.assign_to(open, &plain).await.unwrap();
        let second = scheduler.submit(TaskSpec::new("second")).await.unwrap();
        assert!(matches!(
            scheduler.assign_to(second, &plain).await,
            Err(SwarmError::AgentBusy(_))
        ));
    }

    #[tokio::test]
    async fn test_round_robin_rotates_in_id_order() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler.register_agent(profile("a", &[])).await.unwrap();
        scheduler.register_agent(profile("b", &[])).await.unwrap();

        let task = scheduler.submit(TaskSpec::new("probe")).await.unwrap();
        let picks = [
            scheduler.pick_candidate(task).await.unwrap(),
            scheduler.pick_candidate(task).await.unwrap(),
            scheduler.pick_candidate(task).await.unwrap(),
        ];
        assert_eq!(
            picks,
            [AgentId::new("a"), AgentId::new("b"), AgentId::new("a")]
        );
    }

    #[tokio::test]
    async fn test_least_busy_prefers_fewer_completions() {
        let config = SchedulerConfig {
            load_balancing: LoadBalancing::LeastBusy,
            ..SchedulerConfig::default()
        };
        // Never started, so the probe stays pending and the pick is observable.
        let scheduler = Scheduler::new(config);
        let mut events = scheduler.subscribe_events();
        scheduler.register_agent(profile("a", &[])).await.unwrap();
        scheduler.register_agent(profile("b", &[])).await.unwrap();

        let warmup = scheduler.submit(TaskSpec::new("warmup")).await.unwrap();
        scheduler
            .assign_to(warmup, &AgentId::new("a"))
            .await
            .unwrap();
        wait_for(&mut events, |e| {
            matches!(e, SchedulerEvent::TaskCompleted { .. })
        })
        .await;

        let probe = scheduler.submit(TaskSpec::new("probe")).await.unwrap();
        assert_eq!(
            scheduler.pick_candidate(probe).await.unwrap(),
            AgentId::new("b")
        );
    }

    #[tokio::test]
    async fn test_fastest_prefers_lower_average_duration() {
        let config = SchedulerConfig {
            load_balancing: LoadBalancing::Fastest,
            ..SchedulerConfig::default()
        };
        let scheduler =
            Scheduler::with_executor(config, Arc::new(SleepyExecutor) as Arc<dyn TaskExecutor>);
        let mut events = scheduler.subscribe_events();
        scheduler.register_agent(profile("slow", &[])).await.unwrap();
        scheduler.register_agent(profile("fast", &[])).await.unwrap();

        let crawl = scheduler
            .submit(TaskSpec::new("crawl").with_payload(json!({ "sleep_ms": 40 })))
            .await
            .unwrap();
        let probe = scheduler
            .submit(TaskSpec::new("probe").with_payload(json!({ "sleep_ms": 1 })))
            .await
            .unwrap();
        scheduler
            .assign_to(crawl, &AgentId::new("slow"))
            .await
            .unwrap();
        scheduler
            .assign_to(probe, &AgentId::new("fast"))
            .await
            .unwrap();
        for _ in 0..2 {
            wait_for(&mut events, |e| {
                matches!(e, SchedulerEvent::TaskCompleted { .. })
            })
            .await;
        }

        let next = scheduler.submit(TaskSpec::new("next")).await.unwrap();
        assert_eq!(
            scheduler.pick_candidate(next).await.unwrap(),
            AgentId::new("fast")
        );
    }

    #[tokio::test]
    async fn test_random_picks_an_eligible_agent() {
        let config = SchedulerConfig {
            load_balancing: LoadBalancing::Random,
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(config);
        scheduler.register_agent(profile("a", &[])).await.unwrap();
        scheduler.register_agent(profile("b", &[])).await.unwrap();

        let task = scheduler.submit(TaskSpec::new("probe")).await.unwrap();
        for _ in 0..8 {
            let pick = scheduler.pick_candidate(task).await.unwrap();
            assert!(pick == AgentId::new("a") || pick == AgentId::new("b"));
        }
    }

    #[tokio::test]
    async fn test_stall_announced_when_nothing_can_progress() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let mut events = scheduler.subscribe_events();
        scheduler
            .register_agent(profile("worker-1", &[]))
            .await
            .unwrap();
        scheduler.start().await;

        // Depends on a task that was never submitted.
        scheduler
            .submit(TaskSpec::new("stuck").with_dependency(TaskId::new()))
            .await
            .unwrap();
        scheduler.submit(TaskSpec::new("fine")).await.unwrap();

        let event = wait_for(&mut events, |e| matches!(e, SchedulerEvent::Stalled { .. })).await;
        if let SchedulerEvent::Stalled { pending } = event {
            assert_eq!(pending, 1);
        }
    }

    #[tokio::test]
    async fn test_parked_agent_holds_the_swarm_open() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let mut events = scheduler.subscribe_events();
        scheduler
            .register_agent(profile("worker-1", &[]))
            .await
            .unwrap();
        scheduler.register_agent(profile("parked", &[])).await.unwrap();
        scheduler
            .set_agent_state(&AgentId::new("parked"), AgentState::Waiting)
            .await
            .unwrap();
        scheduler.start().await;

        scheduler.submit(TaskSpec::new("noop")).await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, SchedulerEvent::TaskCompleted { .. })
        })
        .await;

        // The queue is drained, but the waiting agent is not idle.
        let premature = tokio::time::timeout(Duration::from_millis(100), async {
            loop {
                match events.recv().await {
                    Ok(SchedulerEvent::SwarmIdle { .. }) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(premature.is_err(), "swarm reported idle with a parked agent");

        scheduler
            .set_agent_state(&AgentId::new("parked"), AgentState::Idle)
            .await
            .unwrap();
        let event = wait_for(&mut events, |e| {
            matches!(e, SchedulerEvent::SwarmIdle { .. })
        })
        .await;
        assert!(matches!(
            event,
            SchedulerEvent::SwarmIdle {
                completed: 1,
                failed: 0
            }
        ));
    }

    #[tokio::test]
    async fn test_stats_count_agents_per_state() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        for name in ["free", "parked", "done", "broken", "gone"] {
            scheduler.register_agent(profile(name, &[])).await.unwrap();
        }
        scheduler
            .set_agent_state(&AgentId::new("parked"), AgentState::Waiting)
            .await
            .unwrap();
        scheduler
            .set_agent_state(&AgentId::new("done"), AgentState::Completed)
            .await
            .unwrap();
        scheduler
            .set_agent_state(&AgentId::new("broken"), AgentState::Failed)
            .await
            .unwrap();
        scheduler
            .deregister_agent(&AgentId::new("gone"))
            .await
            .unwrap();

        let stats = scheduler.stats().await;
        assert_eq!(stats.agents, 5);
        assert_eq!(stats.idle_agents, 1);
        assert_eq!(stats.working_agents, 0);
        assert_eq!(stats.waiting_agents, 1);
        assert_eq!(stats.completed_agents, 1);
        assert_eq!(stats.failed_agents, 1);
        assert_eq!(stats.terminated_agents, 1);
    }

    #[tokio::test]
    async fn test_agent_state_guards() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler
            .register_agent(profile("worker-1", &[]))
            .await
            .unwrap();
        let id = AgentId::new("worker-1");

        assert!(matches!(
            scheduler.set_agent_state(&id, AgentState::Working).await,
            Err(SwarmError::InvalidTransition { .. })
        ));

        scheduler
            .set_agent_state(&id, AgentState::Waiting)
            .await
            .unwrap();
        scheduler.deregister_agent(&id).await.unwrap();
        assert!(matches!(
            scheduler.set_agent_state(&id, AgentState::Idle).await,
            Err(SwarmError::InvalidTransition { .. })
        ));
        assert!(matches!(
            scheduler.register_agent(profile("worker-1", &[])).await,
            Ok(())
        ));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler.register_agent(profile("a", &[])).await.unwrap();
        assert!(matches!(
            scheduler.register_agent(profile("a", &[])).await,
            Err(SwarmError::AgentAlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_and_connections() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler.register_agent(profile("a", &[])).await.unwrap();
        scheduler.register_agent(profile("b", &[])).await.unwrap();
        let a = AgentId::new("a");
        let b = AgentId::new("b");

        scheduler
            .update_agent_memory(&a, "last_url", json!("https://example.test"))
            .await
            .unwrap();
        scheduler.connect_agents(&a, &b).await.unwrap();

        let agent_a = scheduler.agent(&a).await.unwrap();
        assert_eq!(agent_a.memory["last_url"], json!("https://example.test"));
        assert!(agent_a.connections.contains(&b));
        let agent_b = scheduler.agent(&b).await.unwrap();
        assert!(agent_b.connections.contains(&a));
    }
}
