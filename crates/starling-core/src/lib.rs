//! Core identifiers and error definitions for the Starling swarm runtime.
//!
//! This crate provides the foundational types shared across all Starling
//! crates: strongly typed identifiers for agents, tasks, and coordination
//! rounds, plus the unified error enum every subsystem reports through.
//!
//! # Main types
//!
//! - [`SwarmError`]: unified error enum for all Starling subsystems.
//! - [`SwarmResult`]: convenience alias for `Result<T, SwarmError>`.
//! - [`AgentId`]: host-assigned name of an agent, bus subscriber, or worker.
//! - [`TaskId`]: identifier of a unit of work.
//! - [`AuctionId`]: identifier of a bidding round.
//! - [`RoundId`]: identifier of a consensus round.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Identifiers ---

/// Host-assigned name of an agent.
///
/// The same identity is used wherever a caller must be named: scheduler
/// registration, bus subscriptions, segment lock ownership, auction bids,
/// consensus votes, and failover worker records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Creates an agent identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of a unit of work managed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of an auction round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuctionId(Uuid);

impl AuctionId {
    /// Generates a fresh auction identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AuctionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AuctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundId(Uuid);

impl RoundId {
    /// Generates a fresh round identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RoundId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// --- Error types ---

/// Top-level error type for the Starling swarm runtime.
///
/// Each variant corresponds to a failure a subsystem can report. Lock and
/// transaction failures come back as values of this type, never panics, so
/// callers always check success explicitly.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    /// The lock was not obtainable within the configured retry budget.
    #[error("Lock on segment '{segment}' denied: held by {holder}")]
    LockDenied {
        /// The contended segment.
        segment: String,
        /// The agent holding the lock when attempts ran out.
        holder: AgentId,
    },

    /// A write or release was attempted by an agent that does not hold the lock.
    #[error("Lock on segment '{segment}' is not held by the caller")]
    LockNotHeld {
        /// The segment in question.
        segment: String,
    },

    /// An optimistic write was rejected because the version moved underneath it.
    #[error("Version conflict on segment '{segment}': expected {expected}, found {actual}")]
    VersionConflict {
        /// The segment in question.
        segment: String,
        /// The version the writer expected.
        expected: u64,
        /// The version actually found.
        actual: u64,
    },

    /// No segment is registered under the given name.
    #[error("Segment not found: '{0}'")]
    SegmentNotFound(String),

    /// A segment with the given name already exists.
    #[error("Segment already exists: '{0}'")]
    SegmentExists(String),

    /// The user operation inside a transaction failed; the lock was released.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// No idle agent satisfies the task's capability requirements.
    #[error("No eligible agent for task {task}")]
    NoEligibleAgent {
        /// The task that could not be placed.
        task: TaskId,
    },

    /// No agent is registered under the given identifier.
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// No task is known under the given identifier.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// The agent already holds a task; agents hold at most one.
    #[error("Agent {0} already holds a task")]
    AgentBusy(AgentId),

    /// An agent with the given identifier is already registered.
    #[error("Agent already registered: {0}")]
    AgentAlreadyRegistered(AgentId),

    /// Accepting the submission would close a dependency cycle.
    #[error("Task {0} would close a dependency cycle")]
    DependencyCycle(TaskId),

    /// The auction closed with zero bids.
    #[error("Auction {0} received no bids")]
    NoBidsReceived(AuctionId),

    /// The auction is no longer accepting bids.
    #[error("Auction {0} is closed")]
    AuctionClosed(AuctionId),

    /// No auction is known under the given identifier.
    #[error("Auction not found: {0}")]
    AuctionNotFound(AuctionId),

    /// The consensus round resolved without reaching quorum.
    #[error("Round {round} fell short of quorum: {approvals} approvals of {quorum} required")]
    QuorumNotReached {
        /// The resolved round.
        round: RoundId,
        /// Approvals accumulated by resolution time.
        approvals: usize,
        /// The quorum that was required.
        quorum: usize,
    },

    /// No consensus round is known under the given identifier.
    #[error("Consensus round not found: {0}")]
    RoundNotFound(RoundId),

    /// The consensus round is no longer accepting votes.
    #[error("Consensus round {0} is closed")]
    RoundClosed(RoundId),

    /// The voter is not in the round's participant set.
    #[error("Agent {agent} is not a participant in round {round}")]
    NotAParticipant {
        /// The round voted on.
        round: RoundId,
        /// The rejected voter.
        agent: AgentId,
    },

    /// The voter already cast a vote in this round.
    #[error("Agent {agent} already voted in round {round}")]
    DuplicateVote {
        /// The round voted on.
        round: RoundId,
        /// The repeating voter.
        agent: AgentId,
    },

    /// The task exhausted its retry budget and is permanently failed.
    #[error("Task {task} failed permanently after {attempts} attempts")]
    MaxRetriesExceeded {
        /// The failed task.
        task: TaskId,
        /// Total attempts made, including the first.
        attempts: u32,
    },

    /// An active worker missed enough heartbeats to be presumed dead.
    #[error("Worker {agent} unresponsive: silent for {silent_for_ms} ms")]
    AgentUnresponsive {
        /// The silent worker.
        agent: AgentId,
        /// Milliseconds since its last heartbeat.
        silent_for_ms: u64,
    },

    /// Failover found no standby to promote; the worker remains failing.
    #[error("No standby available to replace worker {worker}")]
    NoStandbyAvailable {
        /// The worker that could not be replaced.
        worker: AgentId,
    },

    /// No worker record is known under the given identifier.
    #[error("Worker not found: {0}")]
    WorkerNotFound(AgentId),

    /// The requested worker state transition is not part of the lifecycle.
    #[error("Worker {worker} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The worker in question.
        worker: AgentId,
        /// Its current state.
        from: String,
        /// The rejected target state.
        to: String,
    },

    /// A coordination-layer misuse not covered by a more specific variant.
    #[error("Coordination error: {0}")]
    Coordination(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),
}

/// A convenience `Result` alias using [`SwarmError`].
pub type SwarmResult<T> = Result<T, SwarmError>;
