//! Auction-based task assignment.
//!
//! A round is announced on the broadcast topic, accepts bids for a fixed
//! window, then closes. The lowest bid value wins; between equal values the
//! earlier bid wins, so replaying the same bids in the same arrival order
//! always selects the same winner. The winner and the losing bidders are
//! notified directly, and the outcome is broadcast.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use starling_bus::{MessageBus, Payload};
use starling_core::{AgentId, AuctionId, SwarmError, SwarmResult, TaskId};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::CoordinationConfig;

/// Status of a bidding round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuctionStatus {
    /// Accepting bids.
    Open,
    /// The window elapsed; bids are no longer accepted.
    Closed,
    /// A winner was selected and notified.
    Completed,
    /// The window elapsed with zero bids.
    NoBids,
}

/// An offer to take on a task. Lower values outbid higher ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    /// Cost claimed by the bidder.
    pub value: f64,
    /// Capabilities the bidder advertises for the task.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// The bidder's estimate of how long the task will take.
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
}

impl Bid {
    /// Creates a bid with the given value and nothing else attached.
    pub fn new(value: f64) -> Self {
        Self {
            value,
            capabilities: BTreeSet::new(),
            estimated_duration_ms: None,
        }
    }

    /// Advertises a capability with the bid.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Attaches an estimated completion time.
    #[must_use]
    pub fn with_estimated_duration_ms(mut self, ms: u64) -> Self {
        self.estimated_duration_ms = Some(ms);
        self
    }
}

/// A bid as recorded in a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedBid {
    /// The bidding agent.
    pub agent: AgentId,
    /// Cost claimed by the bidder.
    pub value: f64,
    /// Capabilities the bidder advertised.
    pub capabilities: BTreeSet<String>,
    /// The bidder's estimate of how long the task will take.
    pub estimated_duration_ms: Option<u64>,
    /// When the bid was recorded.
    pub placed_at: DateTime<Utc>,
}

/// State of one bidding round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionRound {
    /// Round identifier.
    pub id: AuctionId,
    /// The task being auctioned.
    pub task: TaskId,
    /// Human-readable task name, included in the announcement.
    pub name: String,
    /// Capabilities the task requires, included in the announcement.
    pub required_capabilities: BTreeSet<String>,
    /// Current round status.
    pub status: AuctionStatus,
    /// Bids in arrival order while open, in ranked order once closed.
    pub bids: Vec<PlacedBid>,
    /// The winning agent, once selected.
    pub winner: Option<AgentId>,
    /// When the round opened.
    pub opened_at: DateTime<Utc>,
}

/// Outcome of a closed round.
#[derive(Debug, Clone)]
pub struct AuctionResult {
    /// The round that produced this outcome.
    pub auction: AuctionId,
    /// The task that was auctioned.
    pub task: TaskId,
    /// Terminal status, either `Completed` or `NoBids`.
    pub status: AuctionStatus,
    /// The winning agent, if any bid was received.
    pub winner: Option<AgentId>,
    /// The winning bid, if any.
    pub winning_bid: Option<PlacedBid>,
    /// All bids, ranked best first.
    pub bids: Vec<PlacedBid>,
}

impl AuctionResult {
    /// Returns the winner, or [`SwarmError::NoBidsReceived`] for an empty
    /// round.
    pub fn require_winner(&self) -> SwarmResult<&AgentId> {
        self.winner
            .as_ref()
            .ok_or(SwarmError::NoBidsReceived(self.auction))
    }
}

struct AuctionInner {
    bus: MessageBus,
    config: CoordinationConfig,
    rounds: RwLock<HashMap<AuctionId, AuctionRound>>,
}

/// Runs bidding rounds over the message bus.
///
/// Cloning the coordinator clones a handle to the same rounds.
#[derive(Clone)]
pub struct AuctionCoordinator {
    inner: Arc<AuctionInner>,
}

impl AuctionCoordinator {
    /// Creates a coordinator announcing on the given bus.
    pub fn new(bus: MessageBus, config: CoordinationConfig) -> Self {
        Self {
            inner: Arc::new(AuctionInner {
                bus,
                config,
                rounds: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Announces a round, accepts bids for the configured window, then
    /// closes the round and notifies bidders of the outcome.
    pub async fn start_auction(
        &self,
        task: TaskId,
        name: &str,
        required_capabilities: BTreeSet<String>,
    ) -> SwarmResult<AuctionResult> {
        let auction = AuctionId::new();
        let round = AuctionRound {
            id: auction,
            task,
            name: name.to_owned(),
            required_capabilities: required_capabilities.clone(),
            status: AuctionStatus::Open,
            bids: Vec::new(),
            winner: None,
            opened_at: Utc::now(),
        };
        self.inner.rounds.write().await.insert(auction, round);
        info!(auction = %auction, task = %task, name, "Opened auction");
        self.inner.bus.broadcast(
            &self.inner.config.coordinator_id,
            Payload::AuctionOpened {
                auction,
                task,
                name: name.to_owned(),
                required_capabilities: required_capabilities.into_iter().collect(),
            },
        );

        tokio::time::sleep(self.inner.config.auction_window()).await;
        self.close_round(auction).await
    }

    /// Records a bid in an open round.
    pub async fn place_bid(
        &self,
        auction: AuctionId,
        agent: &AgentId,
        bid: Bid,
    ) -> SwarmResult<()> {
        let mut rounds = self.inner.rounds.write().await;
        let round = rounds
            .get_mut(&auction)
            .ok_or(SwarmError::AuctionNotFound(auction))?;
        if round.status != AuctionStatus::Open {
            return Err(SwarmError::AuctionClosed(auction));
        }
        debug!(auction = %auction, agent = %agent, value = bid.value, "Recorded bid");
        round.bids.push(PlacedBid {
            agent: agent.clone(),
            value: bid.value,
            capabilities: bid.capabilities,
            estimated_duration_ms: bid.estimated_duration_ms,
            placed_at: Utc::now(),
        });
        Ok(())
    }

    /// Returns a snapshot of a round.
    pub async fn round(&self, auction: AuctionId) -> Option<AuctionRound> {
        self.inner.rounds.read().await.get(&auction).cloned()
    }

    /// Snapshots of every retained round, oldest first.
    pub async fn rounds(&self) -> Vec<AuctionRound> {
        let rounds = self.inner.rounds.read().await;
        let mut all: Vec<AuctionRound> = rounds.values().cloned().collect();
        all.sort_by_key(|round| round.opened_at);
        all
    }

    async fn close_round(&self, auction: AuctionId) -> SwarmResult<AuctionResult> {
        let result = {
            let mut rounds = self.inner.rounds.write().await;
            let round = rounds
                .get_mut(&auction)
                .ok_or(SwarmError::AuctionNotFound(auction))?;
            round.status = AuctionStatus::Closed;
            // Ascending by value; the stable sort keeps arrival order
            // between equal values, so the earliest equal bid ranks first.
            round
                .bids
                .sort_by(|a, b| a.value.partial_cmp(&b.value).unwrap_or(std::cmp::Ordering::Equal));
            match round.bids.first() {
                Some(best) => {
                    round.status = AuctionStatus::Completed;
                    round.winner = Some(best.agent.clone());
                    info!(
                        auction = %auction,
                        task = %round.task,
                        winner = %best.agent,
                        value = best.value,
                        "Auction completed"
                    );
                }
                None => {
                    round.status = AuctionStatus::NoBids;
                    warn!(auction = %auction, task = %round.task, "Auction closed with no bids");
                }
            }
            AuctionResult {
                auction,
                task: round.task,
                status: round.status,
                winner: round.winner.clone(),
                winning_bid: round.bids.first().cloned(),
                bids: round.bids.clone(),
            }
        };

        let coordinator = &self.inner.config.coordinator_id;
        if let (Some(winner), Some(winning_bid)) = (&result.winner, &result.winning_bid) {
            self.inner.bus.send_direct(
                coordinator,
                winner,
                Payload::AuctionWon {
                    auction,
                    task: result.task,
                    value: winning_bid.value,
                },
            );
            let losers: BTreeSet<&AgentId> = result
                .bids
                .iter()
                .map(|bid| &bid.agent)
                .filter(|agent| *agent != winner)
                .collect();
            for loser in losers {
                self.inner.bus.send_direct(
                    coordinator,
                    loser,
                    Payload::AuctionLost {
                        auction,
                        task: result.task,
                    },
                );
            }
        }
        self.inner.bus.broadcast(
            coordinator,
            Payload::AuctionClosed {
                auction,
                task: result.task,
                winner: result.winner.clone(),
            },
        );
        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use starling_bus::BusConfig;

    fn coordinator_with_window(window_ms: u64) -> (MessageBus, AuctionCoordinator) {
        let bus = MessageBus::new(BusConfig::default());
        let config = CoordinationConfig {
            auction_timeout_ms: window_ms,
            ..CoordinationConfig::default()
        };
        (bus.clone(), AuctionCoordinator::new(bus, config))
    }

    async fn opened_auction(inbox: &mut starling_bus::Subscription) -> AuctionId {
        let message = inbox.recv().await.expect("bus closed");
        match message.payload {
            Payload::AuctionOpened { auction, .. } => auction,
            other => panic!("expected an opening announcement, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lowest_bid_wins_and_ties_go_to_the_earliest() {
        let (bus, coordinator) = coordinator_with_window(60);
        let observer = AgentId::new("observer");
        let mut inbox = bus.subscribe(&observer, MessageBus::BROADCAST);

        let task = TaskId::new();
        let runner = coordinator.clone();
        let handle =
            tokio::spawn(async move { runner.start_auction(task, "crawl", BTreeSet::new()).await });

        let auction = opened_auction(&mut inbox).await;
        coordinator
            .place_bid(auction, &AgentId::new("a"), Bid::new(5.0))
            .await
            .unwrap();
        coordinator
            .place_bid(auction, &AgentId::new("b"), Bid::new(3.0))
            .await
            .unwrap();
        coordinator
            .place_bid(auction, &AgentId::new("c"), Bid::new(3.0))
            .await
            .unwrap();

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, AuctionStatus::Completed);
        assert_eq!(result.winner, Some(AgentId::new("b")));
        assert_eq!(result.require_winner().unwrap(), &AgentId::new("b"));
        assert_eq!(result.bids.len(), 3);
        assert!((result.winning_bid.unwrap().value - 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_empty_round_ends_with_no_bids() {
        let (_bus, coordinator) = coordinator_with_window(20);
        let result = coordinator
            .start_auction(TaskId::new(), "lonely", BTreeSet::new())
            .await
            .unwrap();

        assert_eq!(result.status, AuctionStatus::NoBids);
        assert!(result.winner.is_none());
        assert!(matches!(
            result.require_winner(),
            Err(SwarmError::NoBidsReceived(_))
        ));
    }

    #[tokio::test]
    async fn test_bids_after_the_window_are_rejected() {
        let (bus, coordinator) = coordinator_with_window(20);
        let observer = AgentId::new("observer");
        let mut inbox = bus.subscribe(&observer, MessageBus::BROADCAST);

        let runner = coordinator.clone();
        let handle = tokio::spawn(async move {
            runner
                .start_auction(TaskId::new(), "late", BTreeSet::new())
                .await
        });
        let auction = opened_auction(&mut inbox).await;
        handle.await.unwrap().unwrap();

        let err = coordinator
            .place_bid(auction, &AgentId::new("tardy"), Bid::new(1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::AuctionClosed(_)));
    }

    #[tokio::test]
    async fn test_unknown_round_is_reported() {
        let (_bus, coordinator) = coordinator_with_window(20);
        let err = coordinator
            .place_bid(AuctionId::new(), &AgentId::new("a"), Bid::new(1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::AuctionNotFound(_)));
    }

    #[tokio::test]
    async fn test_winner_and_losers_are_notified() {
        let (bus, coordinator) = coordinator_with_window(60);
        let alpha = AgentId::new("alpha");
        let beta = AgentId::new("beta");
        let mut alpha_inbox = bus.subscribe(&alpha, &MessageBus::direct_topic(&alpha));
        let mut beta_inbox = bus.subscribe(&beta, &MessageBus::direct_topic(&beta));
        let observer = AgentId::new("observer");
        let mut broadcast_inbox = bus.subscribe(&observer, MessageBus::BROADCAST);

        let task = TaskId::new();
        let runner = coordinator.clone();
        let handle = tokio::spawn(async move {
            runner
                .start_auction(task, "extract", BTreeSet::new())
                .await
        });
        let auction = opened_auction(&mut broadcast_inbox).await;
        coordinator
            .place_bid(auction, &alpha, Bid::new(2.0).with_capability("dom"))
            .await
            .unwrap();
        coordinator
            .place_bid(auction, &beta, Bid::new(7.0))
            .await
            .unwrap();
        handle.await.unwrap().unwrap();

        let won = alpha_inbox.recv().await.unwrap();
        assert!(matches!(
            won.payload,
            Payload::AuctionWon { task: winner_task, .. } if winner_task == task
        ));
        let lost = beta_inbox.recv().await.unwrap();
        assert!(matches!(lost.payload, Payload::AuctionLost { .. }));

        let closed = broadcast_inbox.recv().await.unwrap();
        match closed.payload {
            Payload::AuctionClosed { winner, .. } => assert_eq!(winner, Some(alpha.clone())),
            other => panic!("expected a closing announcement, got {other:?}"),
        }
    }
}
