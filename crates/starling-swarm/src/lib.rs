//! Task orchestration for agent swarms.
//!
//! Agents register with capabilities, tasks are submitted with priorities
//! and dependency edges, and a scheduler assigns ready work under a
//! pluggable load-balancing policy. Assignment can also be delegated to
//! bidding (auctions) or voting (consensus), and long-lived workers get
//! heartbeat monitoring with automatic standby promotion.
//!
//! # Main types
//!
//! - [`Swarm`]: the facade that wires store, bus, scheduler, and
//!   coordinators together.
//! - [`Scheduler`]: dependency-aware priority scheduling and retries.
//! - [`TaskSpec`] / [`Task`]: what to run and its full lifecycle record.
//! - [`TaskExecutor`]: the trait assignments are executed on.
//! - [`AuctionCoordinator`]: lowest-bid task allocation.
//! - [`ConsensusCoordinator`]: quorum voting over proposals.
//! - [`FailoverManager`]: worker health and standby promotion.
//! - [`SwarmConfig`]: every tunable, loadable from TOML.

/// Agent records, capabilities, and lifecycle states.
pub mod agent;
/// Bid collection and winner selection.
pub mod auction;
/// Swarm-level configuration.
pub mod config;
/// Proposal rounds and quorum voting.
pub mod consensus;
/// Execution seams for assigned tasks.
pub mod executor;
/// Worker health monitoring and standby promotion.
pub mod failover;
/// Priority scheduling, dependency gating, and retries.
pub mod scheduler;
/// The facade tying the components together.
pub mod swarm;
/// Task specifications and lifecycle records.
pub mod task;

pub use agent::{Agent, AgentMetrics, AgentProfile, AgentState};
pub use auction::{AuctionCoordinator, AuctionResult, AuctionRound, AuctionStatus, Bid, PlacedBid};
pub use config::{AssignmentStrategy, CoordinationConfig, SwarmConfig};
pub use consensus::{ConsensusCoordinator, ConsensusResult, ConsensusRound, RoundStatus, Vote};
pub use executor::{DispatchExecutor, NativeDispatch, NoopExecutor, TaskAssignment, TaskExecutor};
pub use failover::{
    FailoverConfig, FailoverEvent, FailoverManager, FailoverMetrics, FailoverReport, WorkerRecord,
    WorkerRegistration, WorkerState,
};
pub use scheduler::{LoadBalancing, Scheduler, SchedulerConfig, SchedulerEvent, SwarmStats};
pub use swarm::{AgentHandle, Swarm, SwarmBuilder};
pub use task::{Task, TaskSpec, TaskStatus};
