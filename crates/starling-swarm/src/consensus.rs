//! Quorum voting for swarm decisions.
//!
//! A proposal is sent to each participant, who may cast one approve or
//! reject vote while the round is open. The round resolves as soon as the
//! outcome can no longer change, or at the window deadline with a forced
//! tally over the votes actually received. Either way the proposer wakes
//! through a one-shot signal rather than polling.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use starling_bus::{MessageBus, Payload};
use starling_core::{AgentId, RoundId, SwarmError, SwarmResult};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};

use crate::config::CoordinationConfig;

/// Status of a consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    /// Accepting votes.
    Voting,
    /// Approvals reached quorum.
    Approved,
    /// Quorum became unreachable, or the window elapsed short of it.
    Rejected,
}

/// A recorded vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    /// Whether the participant approved the proposal.
    pub approve: bool,
    /// Optional justification supplied by the voter.
    pub reason: Option<String>,
    /// When the vote was recorded.
    pub cast_at: DateTime<Utc>,
}

/// State of one voting round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRound {
    /// Round identifier.
    pub id: RoundId,
    /// What is being decided.
    pub subject: String,
    /// Structured detail attached to the proposal.
    pub detail: Value,
    /// Agents allowed to vote.
    pub participants: BTreeSet<AgentId>,
    /// Votes received so far, at most one per participant.
    pub votes: HashMap<AgentId, Vote>,
    /// Approvals required to carry the proposal.
    pub quorum: usize,
    /// Current round status.
    pub status: RoundStatus,
    /// When the round opened.
    pub opened_at: DateTime<Utc>,
}

impl ConsensusRound {
    fn approvals(&self) -> usize {
        self.votes.values().filter(|vote| vote.approve).count()
    }

    fn uncast(&self) -> usize {
        self.participants.len() - self.votes.len()
    }

    /// The outcome, once no future vote can change it.
    fn foregone_outcome(&self) -> Option<bool> {
        let approvals = self.approvals();
        if approvals >= self.quorum {
            return Some(true);
        }
        if approvals + self.uncast() < self.quorum {
            return Some(false);
        }
        None
    }
}

/// Outcome of a resolved round.
#[derive(Debug, Clone)]
pub struct ConsensusResult {
    /// The round that produced this outcome.
    pub round: RoundId,
    /// Whether the proposal carried.
    pub approved: bool,
    /// Approve votes received.
    pub approvals: usize,
    /// Reject votes received.
    pub rejections: usize,
    /// Total votes received.
    pub votes_cast: usize,
    /// Approvals that were required.
    pub quorum: usize,
    /// Whether the round resolved before its window elapsed.
    pub resolved_early: bool,
}

impl ConsensusResult {
    /// Returns `Ok` for an approved round, and
    /// [`SwarmError::QuorumNotReached`] otherwise.
    pub fn require_approved(&self) -> SwarmResult<()> {
        if self.approved {
            Ok(())
        } else {
            Err(SwarmError::QuorumNotReached {
                round: self.round,
                approvals: self.approvals,
                quorum: self.quorum,
            })
        }
    }
}

struct OpenRound {
    round: ConsensusRound,
    decided: Option<oneshot::Sender<bool>>,
}

struct ConsensusInner {
    bus: MessageBus,
    config: CoordinationConfig,
    rounds: RwLock<HashMap<RoundId, OpenRound>>,
}

/// Runs voting rounds over the message bus.
///
/// Cloning the coordinator clones a handle to the same rounds.
#[derive(Clone)]
pub struct ConsensusCoordinator {
    inner: Arc<ConsensusInner>,
}

impl ConsensusCoordinator {
    /// Creates a coordinator announcing on the given bus.
    pub fn new(bus: MessageBus, config: CoordinationConfig) -> Self {
        Self {
            inner: Arc::new(ConsensusInner {
                bus,
                config,
                rounds: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Sends a proposal to every participant and waits for the round to
    /// resolve, then broadcasts the outcome.
    ///
    /// The quorum is the ceiling of the participant count times the
    /// configured ratio. The wait is bounded by the voting window.
    pub async fn propose(
        &self,
        subject: &str,
        detail: Value,
        participants: BTreeSet<AgentId>,
    ) -> SwarmResult<ConsensusResult> {
        if participants.is_empty() {
            return Err(SwarmError::Coordination(
                "a consensus round needs at least one participant".to_owned(),
            ));
        }
        let round_id = RoundId::new();
        let quorum = self.inner.config.quorum_for(participants.len());
        let (decided_tx, decided_rx) = oneshot::channel();
        let round = ConsensusRound {
            id: round_id,
            subject: subject.to_owned(),
            detail: detail.clone(),
            participants: participants.clone(),
            votes: HashMap::new(),
            quorum,
            status: RoundStatus::Voting,
            opened_at: Utc::now(),
        };
        self.inner.rounds.write().await.insert(
            round_id,
            OpenRound {
                round,
                decided: Some(decided_tx),
            },
        );
        info!(
            round = %round_id,
            subject,
            participants = participants.len(),
            quorum,
            "Opened consensus round"
        );
        for participant in &participants {
            self.inner.bus.send_direct(
                &self.inner.config.coordinator_id,
                participant,
                Payload::ProposalIssued {
                    round: round_id,
                    subject: subject.to_owned(),
                    detail: detail.clone(),
                },
            );
        }

        let resolved_early = matches!(
            tokio::time::timeout(self.inner.config.consensus_window(), decided_rx).await,
            Ok(Ok(_))
        );

        let result = {
            let mut rounds = self.inner.rounds.write().await;
            let open = rounds
                .get_mut(&round_id)
                .ok_or(SwarmError::RoundNotFound(round_id))?;
            if open.round.status == RoundStatus::Voting {
                // Window elapsed; tally only the votes actually received.
                let approved = open.round.approvals() >= open.round.quorum;
                open.round.status = if approved {
                    RoundStatus::Approved
                } else {
                    RoundStatus::Rejected
                };
                open.decided = None;
            }
            let round = &open.round;
            let approvals = round.approvals();
            ConsensusResult {
                round: round_id,
                approved: round.status == RoundStatus::Approved,
                approvals,
                rejections: round.votes.len() - approvals,
                votes_cast: round.votes.len(),
                quorum: round.quorum,
                resolved_early,
            }
        };
        info!(
            round = %round_id,
            approved = result.approved,
            approvals = result.approvals,
            quorum = result.quorum,
            early = result.resolved_early,
            "Consensus resolved"
        );
        self.inner.bus.broadcast(
            &self.inner.config.coordinator_id,
            Payload::ConsensusReached {
                round: round_id,
                approved: result.approved,
                approvals: result.approvals,
                quorum: result.quorum,
            },
        );
        Ok(result)
    }

    /// Records a vote from a participant in an open round.
    ///
    /// One vote per participant. The round resolves immediately once the
    /// outcome is beyond change: approvals reached quorum, or too few
    /// uncast votes remain to ever reach it.
    pub async fn vote(
        &self,
        round_id: RoundId,
        agent: &AgentId,
        approve: bool,
        reason: Option<String>,
    ) -> SwarmResult<()> {
        let mut rounds = self.inner.rounds.write().await;
        let open = rounds
            .get_mut(&round_id)
            .ok_or(SwarmError::RoundNotFound(round_id))?;
        if open.round.status != RoundStatus::Voting {
            return Err(SwarmError::RoundClosed(round_id));
        }
        if !open.round.participants.contains(agent) {
            return Err(SwarmError::NotAParticipant {
                round: round_id,
                agent: agent.clone(),
            });
        }
        if open.round.votes.contains_key(agent) {
            return Err(SwarmError::DuplicateVote {
                round: round_id,
                agent: agent.clone(),
            });
        }
        open.round.votes.insert(
            agent.clone(),
            Vote {
                approve,
                reason,
                cast_at: Utc::now(),
            },
        );
        debug!(round = %round_id, agent = %agent, approve, "Recorded vote");

        if let Some(approved) = open.round.foregone_outcome() {
            open.round.status = if approved {
                RoundStatus::Approved
            } else {
                RoundStatus::Rejected
            };
            if let Some(decided) = open.decided.take() {
                // The proposer may have timed out already; losing the
                // signal is fine, the forced tally reads the same votes.
                let _ = decided.send(approved);
            }
            info!(round = %round_id, approved, "Round resolved before its window elapsed");
        }
        Ok(())
    }

    /// Returns a snapshot of a round.
    pub async fn round(&self, round_id: RoundId) -> Option<ConsensusRound> {
        self.inner
            .rounds
            .read()
            .await
            .get(&round_id)
            .map(|open| open.round.clone())
    }

    /// Snapshots of every retained round, oldest first.
    pub async fn rounds(&self) -> Vec<ConsensusRound> {
        let rounds = self.inner.rounds.read().await;
        let mut all: Vec<ConsensusRound> = rounds.values().map(|open| open.round.clone()).collect();
        all.sort_by_key(|round| round.opened_at);
        all
    }
}
