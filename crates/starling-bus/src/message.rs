use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use starling_core::{AgentId, AuctionId, RoundId, TaskId};
use uuid::Uuid;

/// A message carried by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// The topic the message was published on.
    pub topic: String,
    /// The agent that published it (excluded from its own delivery).
    pub sender: AgentId,
    /// The typed payload.
    pub payload: Payload,
    /// UTC timestamp of publication.
    pub sent_at: DateTime<Utc>,
}

impl BusMessage {
    pub(crate) fn new(topic: &str, sender: AgentId, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            sender,
            payload,
            sent_at: Utc::now(),
        }
    }
}

/// The closed set of payloads that travel over the bus.
///
/// Coordination traffic is fully typed; application traffic rides in
/// [`Payload::Data`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// A bidding round opened for a task; interested agents may bid.
    AuctionOpened {
        /// The auction accepting bids.
        auction: AuctionId,
        /// The task being auctioned.
        task: TaskId,
        /// Human-readable task name.
        name: String,
        /// Capabilities the task requires.
        required_capabilities: Vec<String>,
    },
    /// Direct notification to the winning bidder.
    AuctionWon {
        /// The resolved auction.
        auction: AuctionId,
        /// The task that was won.
        task: TaskId,
        /// The winning bid value.
        value: f64,
    },
    /// Direct notification to a losing bidder.
    AuctionLost {
        /// The resolved auction.
        auction: AuctionId,
        /// The task that was bid on.
        task: TaskId,
    },
    /// Broadcast resolution of a closed auction.
    AuctionClosed {
        /// The resolved auction.
        auction: AuctionId,
        /// The task that was auctioned.
        task: TaskId,
        /// The winner, or `None` when no bids arrived.
        winner: Option<AgentId>,
    },
    /// A proposal requiring the recipient's vote.
    ProposalIssued {
        /// The round collecting votes.
        round: RoundId,
        /// What is being decided.
        subject: String,
        /// Proposal details.
        detail: serde_json::Value,
    },
    /// Broadcast resolution of a consensus round.
    ConsensusReached {
        /// The resolved round.
        round: RoundId,
        /// The decision.
        approved: bool,
        /// Approvals accumulated at resolution.
        approvals: usize,
        /// The quorum that was required.
        quorum: usize,
    },
    /// Direct notification that a task was assigned to the recipient.
    TaskAssigned {
        /// The assigned task.
        task: TaskId,
        /// Human-readable task name.
        name: String,
    },
    /// Free-form application data.
    Data(serde_json::Value),
}
