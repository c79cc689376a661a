//! The swarm facade.
//!
//! [`Swarm`] wires the shared state store, the message bus, the scheduler,
//! both coordinators, and the failover manager into one handle, and routes
//! task submissions through the configured assignment strategy.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use starling_bus::{MessageBus, Payload, Subscription};
use starling_core::{AgentId, SwarmError, SwarmResult, TaskId};
use starling_state::SharedStateStore;
use tracing::{debug, warn};

use crate::agent::{AgentProfile, AgentState};
use crate::auction::AuctionCoordinator;
use crate::config::{AssignmentStrategy, SwarmConfig};
use crate::consensus::ConsensusCoordinator;
use crate::executor::{DispatchExecutor, NativeDispatch, NoopExecutor, TaskExecutor};
use crate::failover::{FailoverManager, WorkerRegistration};
use crate::scheduler::{Scheduler, SwarmStats};
use crate::task::{TaskSpec, TaskStatus};

/// Builds a [`Swarm`] from a configuration and an optional executor.
#[derive(Default)]
pub struct SwarmBuilder {
    config: SwarmConfig,
    executor: Option<Arc<dyn TaskExecutor>>,
}

impl SwarmBuilder {
    /// Uses the given configuration instead of the defaults.
    #[must_use]
    pub fn with_config(mut self, config: SwarmConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs assignments on the given executor.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Routes assignments to a [`NativeDispatch`] service by task kind.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: Arc<dyn NativeDispatch>) -> Self {
        self.executor = Some(Arc::new(DispatchExecutor::new(dispatch)));
        self
    }

    /// Builds the swarm and starts its background watchdogs, so it must be
    /// called inside a Tokio runtime unless those are disabled.
    pub fn build(self) -> Swarm {
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(NoopExecutor) as Arc<dyn TaskExecutor>);
        let store = SharedStateStore::new(self.config.state.clone());
        let bus = MessageBus::new(self.config.bus.clone());
        let scheduler = Scheduler::with_executor(self.config.scheduler.clone(), executor);
        let auctions = AuctionCoordinator::new(bus.clone(), self.config.coordination.clone());
        let consensus = ConsensusCoordinator::new(bus.clone(), self.config.coordination.clone());
        let failover = FailoverManager::new(self.config.failover.clone());
        Swarm {
            store,
            bus,
            scheduler,
            auctions,
            consensus,
            failover,
            strategy: self.config.strategy,
            coordinator: self.config.coordination.coordinator_id.clone(),
        }
    }
}

/// A registered agent's identity and its direct-message inbox.
pub struct AgentHandle {
    /// The identity the agent registered under.
    pub id: AgentId,
    /// Subscription to the agent's direct topic.
    pub inbox: Subscription,
}

/// One handle over the whole swarm runtime.
///
/// Cloning the swarm clones handles to the same components.
#[derive(Clone)]
pub struct Swarm {
    store: SharedStateStore,
    bus: MessageBus,
    scheduler: Scheduler,
    auctions: AuctionCoordinator,
    consensus: ConsensusCoordinator,
    failover: FailoverManager,
    strategy: AssignmentStrategy,
    coordinator: AgentId,
}

impl Swarm {
    /// Starts building a swarm.
    pub fn builder() -> SwarmBuilder {
        SwarmBuilder::default()
    }

    /// The shared state store.
    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    /// The message bus.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// The task scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The auction coordinator.
    pub fn auctions(&self) -> &AuctionCoordinator {
        &self.auctions
    }

    /// The consensus coordinator.
    pub fn consensus(&self) -> &ConsensusCoordinator {
        &self.consensus
    }

    /// The failover manager.
    pub fn failover(&self) -> &FailoverManager {
        &self.failover
    }

    /// The strategy submissions are matched under.
    pub fn strategy(&self) -> AssignmentStrategy {
        self.strategy
    }

    /// Registers an agent with the scheduler and opens its direct inbox.
    pub async fn register_agent(&self, profile: AgentProfile) -> SwarmResult<AgentHandle> {
        let id = profile.id.clone();
        self.scheduler.register_agent(profile).await?;
        let inbox = self.bus.subscribe(&id, &MessageBus::direct_topic(&id));
        Ok(AgentHandle { id, inbox })
    }

    /// Terminates an agent. Its inbox keeps receiving until dropped.
    pub async fn deregister_agent(&self, agent: &AgentId) -> SwarmResult<()> {
        self.scheduler.deregister_agent(agent).await
    }

    /// Registers a supervised worker with the failover manager.
    pub async fn register_worker(&self, registration: WorkerRegistration) -> SwarmResult<()> {
        self.failover.register_worker(registration).await
    }

    /// Starts the swarm.
    ///
    /// Under [`AssignmentStrategy::Central`] the scheduler begins assigning
    /// queued tasks on its own. Under the auction and consensus strategies
    /// the scheduler stays passive and each task is matched when submitted
    /// (or later through [`Swarm::coordinate`]).
    pub async fn start(&self) {
        if self.strategy == AssignmentStrategy::Central {
            self.scheduler.start().await;
        }
    }

    /// Stops central assignment. In-flight executions still settle.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    /// Submits a task and matches it according to the strategy.
    ///
    /// The task identifier is returned even when no match was found yet;
    /// an unmatched task stays queued and can be matched again with
    /// [`Swarm::coordinate`].
    pub async fn submit(&self, spec: TaskSpec) -> SwarmResult<TaskId> {
        let task_id = self.scheduler.submit(spec).await?;
        if self.strategy != AssignmentStrategy::Central {
            self.coordinate(task_id).await?;
        }
        Ok(task_id)
    }

    /// Runs one matching round for a pending task under the configured
    /// strategy. Returns whether the task progressed to an agent.
    ///
    /// A task whose dependencies are still unmet is left queued and
    /// reported as not progressed, as is an auction with no bids or a
    /// proposal that fell short of quorum.
    pub async fn coordinate(&self, task_id: TaskId) -> SwarmResult<bool> {
        let task = self
            .scheduler
            .task(task_id)
            .await
            .ok_or(SwarmError::TaskNotFound(task_id))?;
        if !self.scheduler.is_ready(task_id).await? {
            debug!(task = %task_id, "Not ready to match; task stays queued");
            return Ok(false);
        }
        match self.strategy {
            AssignmentStrategy::Central => {
                self.scheduler.rebalance().await;
                let status = self.scheduler.task(task_id).await.map(|t| t.status);
                Ok(matches!(
                    status,
                    Some(TaskStatus::Assigned { .. } | TaskStatus::Completed)
                ))
            }
            AssignmentStrategy::Auction => {
                let result = self
                    .auctions
                    .start_auction(task_id, &task.name, task.required_capabilities.clone())
                    .await?;
                match result.winner {
                    Some(winner) => {
                        self.grant(task_id, &task.name, &winner).await?;
                        Ok(true)
                    }
                    None => {
                        warn!(task = %task_id, "Auction drew no bids; task stays queued");
                        Ok(false)
                    }
                }
            }
            AssignmentStrategy::Consensus => {
                let candidate = match self.scheduler.pick_candidate(task_id).await {
                    Ok(candidate) => candidate,
                    Err(SwarmError::NoEligibleAgent { .. }) => {
                        debug!(task = %task_id, "No eligible agent to propose; task stays queued");
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                };
                let participants: BTreeSet<AgentId> = self
                    .scheduler
                    .agents()
                    .await
                    .into_iter()
                    .filter(|agent| agent.state != AgentState::Terminated)
                    .map(|agent| agent.id)
                    .collect();
                let detail = json!({
                    "task": task_id,
                    "name": task.name,
                    "agent": candidate,
                });
                let result = self
                    .consensus
                    .propose("assign-task", detail, participants)
                    .await?;
                if result.approved {
                    self.grant(task_id, &task.name, &candidate).await?;
                    Ok(true)
                } else {
                    warn!(
                        task = %task_id,
                        approvals = result.approvals,
                        quorum = result.quorum,
                        "Assignment proposal fell short; task stays queued"
                    );
                    Ok(false)
                }
            }
        }
    }

    /// Point-in-time swarm counters.
    pub async fn stats(&self) -> SwarmStats {
        self.scheduler.stats().await
    }

    async fn grant(&self, task_id: TaskId, name: &str, agent: &AgentId) -> SwarmResult<()> {
        self.scheduler.assign_to(task_id, agent).await?;
        self.bus.send_direct(
            &self.coordinator,
            agent,
            Payload::TaskAssigned {
                task: task_id,
                name: name.to_owned(),
            },
        );
        Ok(())
    }
}
