//! Swarm-level configuration.
//!
//! Every section has serde defaults, so a config file only needs to name
//! the values it changes. [`SwarmConfig::from_toml_str`] parses the whole
//! tree from TOML.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use starling_bus::BusConfig;
use starling_core::{AgentId, SwarmError, SwarmResult};
use starling_state::StateConfig;

use crate::failover::FailoverConfig;
use crate::scheduler::SchedulerConfig;

/// How submitted tasks are matched to agents by the [`crate::Swarm`] facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// The scheduler assigns directly using its load-balancing policy.
    #[default]
    Central,
    /// Each ready task is put up for bidding and the best bid wins.
    Auction,
    /// Each ready task is proposed and assigned only when approved.
    Consensus,
}

/// Settings shared by the auction and consensus coordinators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// How long an auction accepts bids before closing, in milliseconds.
    #[serde(default = "default_auction_timeout_ms")]
    pub auction_timeout_ms: u64,
    /// How long a consensus round accepts votes before a forced tally, in
    /// milliseconds.
    #[serde(default = "default_consensus_timeout_ms")]
    pub consensus_timeout_ms: u64,
    /// Fraction of participants whose approval carries a proposal. The
    /// quorum is the ceiling of `participants * quorum_ratio`.
    #[serde(default = "default_quorum_ratio")]
    pub quorum_ratio: f64,
    /// Identity coordination messages are sent under.
    #[serde(default = "default_coordinator_id")]
    pub coordinator_id: AgentId,
}

fn default_auction_timeout_ms() -> u64 {
    5_000
}

fn default_consensus_timeout_ms() -> u64 {
    10_000
}

fn default_quorum_ratio() -> f64 {
    0.5
}

fn default_coordinator_id() -> AgentId {
    AgentId::new("coordinator")
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            auction_timeout_ms: default_auction_timeout_ms(),
            consensus_timeout_ms: default_consensus_timeout_ms(),
            quorum_ratio: default_quorum_ratio(),
            coordinator_id: default_coordinator_id(),
        }
    }
}

impl CoordinationConfig {
    /// The bidding window as a [`Duration`].
    pub fn auction_window(&self) -> Duration {
        Duration::from_millis(self.auction_timeout_ms)
    }

    /// The voting window as a [`Duration`].
    pub fn consensus_window(&self) -> Duration {
        Duration::from_millis(self.consensus_timeout_ms)
    }

    /// Number of approvals required to carry a proposal among `participants`.
    pub fn quorum_for(&self, participants: usize) -> usize {
        (participants as f64 * self.quorum_ratio).ceil() as usize
    }
}

/// Top-level configuration for a [`crate::Swarm`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// How the facade matches submitted tasks to agents.
    #[serde(default)]
    pub strategy: AssignmentStrategy,
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Auction and consensus settings.
    #[serde(default)]
    pub coordination: CoordinationConfig,
    /// Worker failover settings.
    #[serde(default)]
    pub failover: FailoverConfig,
    /// Shared state store settings.
    #[serde(default)]
    pub state: StateConfig,
    /// Message bus settings.
    #[serde(default)]
    pub bus: BusConfig,
}

impl SwarmConfig {
    /// Parses a configuration from TOML text. Missing sections and fields
    /// fall back to their defaults.
    pub fn from_toml_str(text: &str) -> SwarmResult<Self> {
        toml::from_str(text).map_err(|e| SwarmError::Config(e.to_string()))
    }
}
