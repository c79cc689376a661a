//! Worker supervision and failover.
//!
//! Workers register with a priority and a capability set, heartbeat while
//! healthy, and can be parked in a standby pool. When an active worker
//! fails, the best-scoring standby is promoted in its place under a single
//! registry lock, so no reader ever observes both workers active or
//! neither. A background monitor presumes active workers dead after a
//! configurable silence and fails them over automatically.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use starling_core::{AgentId, SwarmError, SwarmResult};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Capacity of the failover event channel.
const EVENT_CAPACITY: usize = 32;

/// Failover manager tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// How often active workers are checked for missed heartbeats, in
    /// milliseconds. Set to 0 to disable the monitor.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// An active worker silent for longer than this many check intervals
    /// is presumed dead and failed over automatically.
    #[serde(default = "default_silence_multiplier")]
    pub silence_multiplier: u32,
}

fn default_health_check_interval_ms() -> u64 {
    100
}

fn default_silence_multiplier() -> u32 {
    3
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval_ms(),
            silence_multiplier: default_silence_multiplier(),
        }
    }
}

impl FailoverConfig {
    /// The monitor tick interval as a [`Duration`].
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Silence beyond this duration marks an active worker unresponsive.
    pub fn silence_threshold(&self) -> Duration {
        self.check_interval() * self.silence_multiplier
    }
}

/// Lifecycle state of a supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Registered but not yet given a duty.
    Idle,
    /// Parked in the promotion pool, ready to take over.
    Standby,
    /// Serving.
    Active,
    /// Marked faulty. Kept in the registry until a failover replaces it.
    Failing,
    /// Reserved for supervised restarts; nothing transitions here yet.
    Recovering,
    /// Replaced and removed from the registry.
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Standby => "standby",
            Self::Active => "active",
            Self::Failing => "failing",
            Self::Recovering => "recovering",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Registration details for a supervised worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    /// Identity the worker registers under.
    pub id: AgentId,
    /// Capabilities used to score the worker as a replacement.
    pub capabilities: BTreeSet<String>,
    /// Base promotion priority.
    pub priority: f64,
    /// Whether the worker goes straight into the standby pool.
    pub standby: bool,
}

impl WorkerRegistration {
    /// Creates a registration with priority 0, no capabilities, outside the
    /// standby pool.
    pub fn new(id: impl Into<AgentId>) -> Self {
        Self {
            id: id.into(),
            capabilities: BTreeSet::new(),
            priority: 0.0,
            standby: false,
        }
    }

    /// Adds a capability.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Sets the base promotion priority.
    #[must_use]
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    /// Registers the worker directly into the standby pool.
    #[must_use]
    pub fn as_standby(mut self) -> Self {
        self.standby = true;
        self
    }
}

/// A supervised worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    /// Identity of the worker.
    pub id: AgentId,
    /// Current lifecycle state.
    pub state: WorkerState,
    /// Capabilities used for replacement scoring.
    pub capabilities: BTreeSet<String>,
    /// Base promotion priority.
    pub priority: f64,
    /// How many times this worker was promoted by a failover.
    pub failover_count: u32,
    /// When the worker registered.
    pub registered_at: DateTime<Utc>,
    /// When the worker last heartbeat.
    pub last_heartbeat: Instant,
}

impl WorkerRecord {
    /// Time since the worker's last heartbeat.
    pub fn silent_for(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }
}

/// Failover latency metrics, in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FailoverMetrics {
    /// Completed failovers.
    pub failovers: u64,
    /// Fastest observed failover.
    pub min_ms: f64,
    /// Slowest observed failover.
    pub max_ms: f64,
    /// Mean failover duration.
    pub avg_ms: f64,
    /// Most recent failover duration.
    pub last_ms: f64,
}

#[derive(Default)]
struct MetricsAccum {
    count: u64,
    total_ms: f64,
    min_ms: f64,
    max_ms: f64,
    last_ms: f64,
}

impl MetricsAccum {
    fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1_000.0;
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.count += 1;
        self.total_ms += ms;
        self.last_ms = ms;
    }

    fn snapshot(&self) -> FailoverMetrics {
        FailoverMetrics {
            failovers: self.count,
            min_ms: self.min_ms,
            max_ms: self.max_ms,
            avg_ms: if self.count == 0 {
                0.0
            } else {
                self.total_ms / self.count as f64
            },
            last_ms: self.last_ms,
        }
    }
}

/// Events announced by the failover manager.
#[derive(Debug, Clone)]
pub enum FailoverEvent {
    /// A worker joined the registry.
    WorkerRegistered {
        /// The new worker.
        worker: AgentId,
    },
    /// An active worker missed enough heartbeats to be presumed dead.
    WorkerUnhealthy {
        /// The silent worker.
        worker: AgentId,
        /// Milliseconds since its last heartbeat.
        silent_for_ms: u64,
    },
    /// A standby took over for a failed worker.
    FailoverCompleted {
        /// The replaced worker, now removed.
        failed: AgentId,
        /// The promoted standby.
        promoted: AgentId,
        /// How long the swap took.
        duration_ms: f64,
    },
    /// A failover found no standby; the worker stays failing.
    NoStandby {
        /// The worker that could not be replaced.
        worker: AgentId,
    },
}

/// Report for one completed failover.
#[derive(Debug, Clone)]
pub struct FailoverReport {
    /// The replaced worker, removed from the registry.
    pub failed: AgentId,
    /// The promoted standby.
    pub promoted: AgentId,
    /// The promotion score the standby won with.
    pub score: f64,
    /// How long the swap took.
    pub duration: Duration,
}

/// Promotion score of a standby against a failed worker's capability set.
///
/// Base priority, plus up to 100 points for capability coverage, minus an
/// age penalty of one point per minute of heartbeat silence capped at 10.
/// An empty requirement set counts as full coverage.
fn standby_score(candidate: &WorkerRecord, required: &BTreeSet<String>) -> f64 {
    let coverage = if required.is_empty() {
        1.0
    } else {
        candidate.capabilities.intersection(required).count() as f64 / required.len() as f64
    };
    let age_ms = candidate.silent_for().as_secs_f64() * 1_000.0;
    candidate.priority + 100.0 * coverage - (age_ms / 60_000.0).min(10.0)
}

struct FailoverInner {
    workers: RwLock<HashMap<AgentId, WorkerRecord>>,
    metrics: Mutex<MetricsAccum>,
    events: broadcast::Sender<FailoverEvent>,
    config: FailoverConfig,
}

/// Supervises workers and promotes standbys when they fail.
///
/// Cloning the manager clones a handle to the same registry. The health
/// monitor starts with the manager and stops on its own once the last
/// handle is dropped, so the manager must be created inside a Tokio
/// runtime unless the monitor is disabled.
#[derive(Clone)]
pub struct FailoverManager {
    inner: Arc<FailoverInner>,
}

impl FailoverManager {
    /// Creates a manager and starts its health monitor (unless disabled).
    pub fn new(config: FailoverConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let interval = config.check_interval();
        let inner = Arc::new(FailoverInner {
            workers: RwLock::new(HashMap::new()),
            metrics: Mutex::new(MetricsAccum::default()),
            events,
            config,
        });
        if !interval.is_zero() {
            spawn_health_monitor(Arc::downgrade(&inner), interval);
        }
        Self { inner }
    }

    /// Adds a worker to the registry, idle or directly in the standby pool.
    pub async fn register_worker(&self, registration: WorkerRegistration) -> SwarmResult<()> {
        let id = registration.id.clone();
        let record = WorkerRecord {
            id: id.clone(),
            state: if registration.standby {
                WorkerState::Standby
            } else {
                WorkerState::Idle
            },
            capabilities: registration.capabilities,
            priority: registration.priority,
            failover_count: 0,
            registered_at: Utc::now(),
            last_heartbeat: Instant::now(),
        };
        {
            let mut workers = self.inner.workers.write().await;
            if workers.contains_key(&id) {
                return Err(SwarmError::AgentAlreadyRegistered(id));
            }
            workers.insert(id.clone(), record);
        }
        info!(worker = %id, standby = registration.standby, "Worker registered");
        let _ = self
            .inner
            .events
            .send(FailoverEvent::WorkerRegistered { worker: id });
        Ok(())
    }

    /// Parks an idle worker in the standby pool.
    pub async fn make_standby(&self, worker: &AgentId) -> SwarmResult<()> {
        self.transition(worker, &[WorkerState::Idle], WorkerState::Standby)
            .await
    }

    /// Puts an idle or standby worker into service.
    pub async fn activate(&self, worker: &AgentId) -> SwarmResult<()> {
        self.transition(
            worker,
            &[WorkerState::Idle, WorkerState::Standby],
            WorkerState::Active,
        )
        .await
    }

    /// Records a heartbeat from a worker.
    pub async fn heartbeat(&self, worker: &AgentId) -> SwarmResult<()> {
        let mut workers = self.inner.workers.write().await;
        let record = workers
            .get_mut(worker)
            .ok_or_else(|| SwarmError::WorkerNotFound(worker.clone()))?;
        record.last_heartbeat = Instant::now();
        debug!(worker = %worker, "Heartbeat");
        Ok(())
    }

    /// Replaces a failed worker with the best-scoring standby.
    ///
    /// The worker is first marked failing. If a standby exists, the
    /// highest-scoring one becomes active and leaves the pool while the
    /// failed worker is terminated and removed, all under one registry
    /// lock. Without a standby the worker stays failing in the registry
    /// and [`SwarmError::NoStandbyAvailable`] is returned.
    pub async fn trigger_failover(&self, failing: &AgentId) -> SwarmResult<FailoverReport> {
        let started = Instant::now();
        let promotion = {
            let mut workers = self.inner.workers.write().await;
            let worker = workers
                .get_mut(failing)
                .ok_or_else(|| SwarmError::WorkerNotFound(failing.clone()))?;
            worker.state = WorkerState::Failing;
            let required = worker.capabilities.clone();
            warn!(worker = %failing, "Worker marked failing");

            let mut candidates: Vec<(AgentId, f64)> = workers
                .values()
                .filter(|candidate| candidate.state == WorkerState::Standby)
                .map(|candidate| (candidate.id.clone(), standby_score(candidate, &required)))
                .collect();
            // Highest score first; equal scores fall back to identifier order.
            candidates.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            });

            match candidates.first() {
                None => None,
                Some((standby_id, score)) => {
                    if let Some(standby) = workers.get_mut(standby_id) {
                        standby.state = WorkerState::Active;
                        standby.failover_count += 1;
                        standby.last_heartbeat = Instant::now();
                    }
                    workers.remove(failing);
                    Some((standby_id.clone(), *score))
                }
            }
        };

        match promotion {
            None => {
                warn!(worker = %failing, "No standby available; worker stays failing");
                let _ = self.inner.events.send(FailoverEvent::NoStandby {
                    worker: failing.clone(),
                });
                Err(SwarmError::NoStandbyAvailable {
                    worker: failing.clone(),
                })
            }
            Some((promoted, score)) => {
                let duration = started.elapsed();
                self.inner.metrics.lock().record(duration);
                let duration_ms = duration.as_secs_f64() * 1_000.0;
                info!(
                    failed = %failing,
                    promoted = %promoted,
                    score,
                    duration_ms,
                    "Failover completed"
                );
                let _ = self.inner.events.send(FailoverEvent::FailoverCompleted {
                    failed: failing.clone(),
                    promoted: promoted.clone(),
                    duration_ms,
                });
                Ok(FailoverReport {
                    failed: failing.clone(),
                    promoted,
                    score,
                    duration,
                })
            }
        }
    }

    /// Returns a snapshot of a worker.
    pub async fn worker(&self, worker: &AgentId) -> Option<WorkerRecord> {
        self.inner.workers.read().await.get(worker).cloned()
    }

    /// Returns all supervised workers, sorted by identifier.
    pub async fn workers(&self) -> Vec<WorkerRecord> {
        let workers = self.inner.workers.read().await;
        let mut records: Vec<WorkerRecord> = workers.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Returns the current standby pool, sorted by identifier.
    pub async fn standbys(&self) -> Vec<WorkerRecord> {
        let workers = self.inner.workers.read().await;
        let mut records: Vec<WorkerRecord> = workers
            .values()
            .filter(|worker| worker.state == WorkerState::Standby)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Returns failover latency metrics.
    pub fn metrics(&self) -> FailoverMetrics {
        self.inner.metrics.lock().snapshot()
    }

    /// Subscribes to failover events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<FailoverEvent> {
        self.inner.events.subscribe()
    }

    async fn transition(
        &self,
        worker: &AgentId,
        allowed_from: &[WorkerState],
        to: WorkerState,
    ) -> SwarmResult<()> {
        let mut workers = self.inner.workers.write().await;
        let record = workers
            .get_mut(worker)
            .ok_or_else(|| SwarmError::WorkerNotFound(worker.clone()))?;
        if !allowed_from.contains(&record.state) {
            return Err(SwarmError::InvalidTransition {
                worker: worker.clone(),
                from: record.state.to_string(),
                to: to.to_string(),
            });
        }
        let from = record.state;
        record.state = to;
        info!(worker = %worker, from = %from, to = %to, "Worker state changed");
        Ok(())
    }

    async fn check_active_workers(&self) {
        let threshold = self.inner.config.silence_threshold();
        let silent: Vec<(AgentId, Duration)> = {
            let workers = self.inner.workers.read().await;
            workers
                .values()
                .filter(|worker| {
                    worker.state == WorkerState::Active && worker.silent_for() > threshold
                })
                .map(|worker| (worker.id.clone(), worker.silent_for()))
                .collect()
        };
        for (worker, silent_for) in silent {
            let silent_for_ms = silent_for.as_millis() as u64;
            let unresponsive = SwarmError::AgentUnresponsive {
                agent: worker.clone(),
                silent_for_ms,
            };
            warn!(error = %unresponsive, "Active worker presumed dead");
            let _ = self.inner.events.send(FailoverEvent::WorkerUnhealthy {
                worker: worker.clone(),
                silent_for_ms,
            });
            if let Err(e) = self.trigger_failover(&worker).await {
                warn!(worker = %worker, error = %e, "Automatic failover did not promote a standby");
            }
        }
    }
}

fn spawn_health_monitor(inner: Weak<FailoverInner>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else { break };
            let manager = FailoverManager { inner };
            manager.check_active_workers().await;
        }
    });
}
