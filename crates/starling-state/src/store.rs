use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use starling_core::{AgentId, SwarmError, SwarmResult};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::StateConfig;
use crate::segment::{MemorySegment, SegmentView, TransactionOutcome};

/// Capacity of the store's event channel.
const EVENT_CAPACITY: usize = 32;

/// Notification published by the store when the watchdog intervenes.
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// A stale lock was force-cleared by the watchdog.
    LockReclaimed {
        /// The segment whose lock was reclaimed.
        segment: String,
        /// The agent that held the lock.
        holder: AgentId,
        /// How long the lock had been held, in milliseconds.
        held_ms: u64,
    },
}

struct StoreInner {
    segments: RwLock<HashMap<String, MemorySegment>>,
    config: StateConfig,
    events: broadcast::Sender<StateEvent>,
}

/// Versioned, lockable shared state with a stale-lock watchdog.
///
/// Segments are created explicitly and mutated only by their current lock
/// holder. Reads are lock-free and may observe any previously committed
/// version. Cloning the store clones a handle to the same segments.
///
/// The watchdog task starts with the store and stops on its own once the
/// last handle is dropped, so the store must be created inside a Tokio
/// runtime unless the watchdog is disabled.
#[derive(Clone)]
pub struct SharedStateStore {
    inner: Arc<StoreInner>,
}

impl SharedStateStore {
    /// Creates a store and starts its watchdog (unless disabled).
    pub fn new(config: StateConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let watchdog_interval = config.watchdog_interval();
        let inner = Arc::new(StoreInner {
            segments: RwLock::new(HashMap::new()),
            config,
            events,
        });
        if !watchdog_interval.is_zero() {
            spawn_watchdog(Arc::downgrade(&inner), watchdog_interval);
        }
        Self { inner }
    }

    /// Creates a segment holding `initial` at version 0.
    ///
    /// Returns false without touching the existing segment when the name is
    /// already taken.
    pub fn create_segment(&self, name: &str, initial: Value) -> bool {
        let mut segments = self.inner.segments.write();
        if segments.contains_key(name) {
            debug!(segment = %name, "Segment already exists");
            return false;
        }
        segments.insert(name.to_owned(), MemorySegment::new(name, initial));
        info!(segment = %name, "Created segment");
        true
    }

    /// Reads the committed data and version of a segment. Lock-free.
    pub fn read(&self, name: &str) -> SwarmResult<SegmentView> {
        let segments = self.inner.segments.read();
        let segment = segments
            .get(name)
            .ok_or_else(|| SwarmError::SegmentNotFound(name.to_owned()))?;
        Ok(SegmentView {
            data: segment.data.clone(),
            version: segment.version,
        })
    }

    /// Acquires the segment lock for `owner`.
    ///
    /// Succeeds immediately when the segment is unlocked or already held by
    /// `owner` (reentrant). Otherwise retries up to the configured attempt
    /// budget, sleeping the configured delay between attempts, and fails
    /// with [`SwarmError::LockDenied`] once the budget is exhausted.
    pub async fn acquire_lock(&self, name: &str, owner: &AgentId) -> SwarmResult<()> {
        let attempts = self.inner.config.lock_retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            {
                let mut segments = self.inner.segments.write();
                let segment = segments
                    .get_mut(name)
                    .ok_or_else(|| SwarmError::SegmentNotFound(name.to_owned()))?;
                match &segment.lock_holder {
                    None => {
                        segment.lock(owner);
                        debug!(segment = %name, owner = %owner, "Acquired lock");
                        return Ok(());
                    }
                    Some(holder) if holder == owner => return Ok(()),
                    Some(holder) if attempt >= attempts => {
                        warn!(
                            segment = %name,
                            owner = %owner,
                            holder = %holder,
                            attempts,
                            "Lock denied after exhausting attempts"
                        );
                        return Err(SwarmError::LockDenied {
                            segment: name.to_owned(),
                            holder: holder.clone(),
                        });
                    }
                    Some(_) => {}
                }
            }
            tokio::time::sleep(self.inner.config.retry_delay()).await;
        }
    }

    /// Releases the segment lock held by `owner`.
    ///
    /// Releasing an already-unlocked segment is an idempotent no-op; a
    /// release by an agent that does not hold the lock is rejected.
    pub fn release_lock(&self, name: &str, owner: &AgentId) -> SwarmResult<()> {
        let mut segments = self.inner.segments.write();
        let segment = segments
            .get_mut(name)
            .ok_or_else(|| SwarmError::SegmentNotFound(name.to_owned()))?;
        match &segment.lock_holder {
            None => Ok(()),
            Some(holder) if holder == owner => {
                segment.unlock();
                debug!(segment = %name, owner = %owner, "Released lock");
                Ok(())
            }
            Some(_) => Err(SwarmError::LockNotHeld {
                segment: name.to_owned(),
            }),
        }
    }

    /// Commits `data` to a segment held by `owner` and returns the new version.
    ///
    /// With `expected_version` set, the write is optimistic: a version that
    /// moved since the caller read it is rejected as a conflict, never merged.
    pub fn write(
        &self,
        name: &str,
        owner: &AgentId,
        data: Value,
        expected_version: Option<u64>,
    ) -> SwarmResult<u64> {
        let mut segments = self.inner.segments.write();
        let segment = segments
            .get_mut(name)
            .ok_or_else(|| SwarmError::SegmentNotFound(name.to_owned()))?;
        if !segment.is_held_by(owner) {
            return Err(SwarmError::LockNotHeld {
                segment: name.to_owned(),
            });
        }
        if let Some(expected) = expected_version {
            if expected != segment.version {
                return Err(SwarmError::VersionConflict {
                    segment: name.to_owned(),
                    expected,
                    actual: segment.version,
                });
            }
        }
        let version = segment.commit(data);
        debug!(segment = %name, owner = %owner, version, "Committed write");
        Ok(version)
    }

    /// Compare-and-swap with deep-equality comparison.
    ///
    /// See [`SharedStateStore::compare_and_swap_by`].
    pub async fn compare_and_swap(
        &self,
        name: &str,
        owner: &AgentId,
        expected: &Value,
        next: Value,
    ) -> SwarmResult<bool> {
        self.compare_and_swap_by(name, owner, expected, next, |a, b| a == b)
            .await
    }

    /// Compare-and-swap with a caller-supplied comparator.
    ///
    /// Acquires the lock, re-reads the current value, compares it with
    /// `expected`, writes `next` only on a match, and releases the lock on
    /// every path. Returns whether the swap happened.
    pub async fn compare_and_swap_by<F>(
        &self,
        name: &str,
        owner: &AgentId,
        expected: &Value,
        next: Value,
        compare: F,
    ) -> SwarmResult<bool>
    where
        F: Fn(&Value, &Value) -> bool,
    {
        self.acquire_lock(name, owner).await?;
        let result = self.swap_locked(name, owner, expected, next, compare);
        let release = self.release_lock(name, owner);
        let swapped = result?;
        release?;
        Ok(swapped)
    }

    fn swap_locked<F>(
        &self,
        name: &str,
        owner: &AgentId,
        expected: &Value,
        next: Value,
        compare: F,
    ) -> SwarmResult<bool>
    where
        F: Fn(&Value, &Value) -> bool,
    {
        let view = self.read(name)?;
        if !compare(&view.data, expected) {
            debug!(segment = %name, owner = %owner, "Compare-and-swap mismatch");
            return Ok(false);
        }
        self.write(name, owner, next, Some(view.version))?;
        Ok(true)
    }

    /// Runs `op` against the segment's current data while holding its lock.
    ///
    /// The value `op` resolves to is committed as the segment's next version.
    /// The lock is released on every path; an error from `op` comes back as
    /// [`SwarmError::TransactionFailed`] with nothing committed.
    pub async fn transaction<F, Fut>(
        &self,
        name: &str,
        owner: &AgentId,
        op: F,
    ) -> SwarmResult<TransactionOutcome>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = SwarmResult<Value>>,
    {
        self.acquire_lock(name, owner).await?;
        let view = match self.read(name) {
            Ok(view) => view,
            Err(e) => {
                let _ = self.release_lock(name, owner);
                return Err(e);
            }
        };
        let result = match op(view.data).await {
            Ok(next) => self
                .write(name, owner, next.clone(), None)
                .map(|version| TransactionOutcome {
                    value: next,
                    version,
                }),
            Err(e) => Err(SwarmError::TransactionFailed(e.to_string())),
        };
        let release = self.release_lock(name, owner);
        let outcome = result?;
        release?;
        Ok(outcome)
    }

    /// Removes a segment. Refused while any agent holds its lock.
    pub fn destroy_segment(&self, name: &str, owner: &AgentId) -> SwarmResult<()> {
        let mut segments = self.inner.segments.write();
        let segment = segments
            .get_mut(name)
            .ok_or_else(|| SwarmError::SegmentNotFound(name.to_owned()))?;
        if let Some(holder) = &segment.lock_holder {
            return Err(SwarmError::LockDenied {
                segment: name.to_owned(),
                holder: holder.clone(),
            });
        }
        segments.remove(name);
        info!(segment = %name, owner = %owner, "Destroyed segment");
        Ok(())
    }

    /// The agent currently holding a segment's lock, if any.
    pub fn lock_holder(&self, name: &str) -> SwarmResult<Option<AgentId>> {
        let segments = self.inner.segments.read();
        let segment = segments
            .get(name)
            .ok_or_else(|| SwarmError::SegmentNotFound(name.to_owned()))?;
        Ok(segment.lock_holder.clone())
    }

    /// Number of segments in the store.
    pub fn segment_count(&self) -> usize {
        self.inner.segments.read().len()
    }

    /// Names of all segments, sorted.
    pub fn list_segments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.segments.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Subscribes to store events (currently stale-lock reclamations).
    pub fn subscribe_events(&self) -> broadcast::Receiver<StateEvent> {
        self.inner.events.subscribe()
    }
}

impl Default for SharedStateStore {
    fn default() -> Self {
        Self::new(StateConfig::default())
    }
}

impl StoreInner {
    /// One watchdog sweep: force-clear every lock older than the threshold.
    fn reclaim_stale_locks(&self) {
        let timeout = self.config.stale_timeout();
        let mut segments = self.segments.write();
        for segment in segments.values_mut() {
            if let (Some(holder), Some(locked_at)) =
                (segment.lock_holder.clone(), segment.locked_at)
            {
                let held = locked_at.elapsed();
                if held > timeout {
                    segment.unlock();
                    let held_ms = held.as_millis() as u64;
                    warn!(
                        segment = %segment.name,
                        holder = %holder,
                        held_ms,
                        "Reclaimed stale lock"
                    );
                    let _ = self.events.send(StateEvent::LockReclaimed {
                        segment: segment.name.clone(),
                        holder,
                        held_ms,
                    });
                }
            }
        }
    }
}

/// Background reclamation loop. Holds only a weak handle so it winds down
/// once the store is dropped.
fn spawn_watchdog(inner: Weak<StoreInner>, interval: Duration) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        loop {
            timer.tick().await;
            match inner.upgrade() {
                Some(store) => store.reclaim_stale_locks(),
                None => break,
            }
        }
    });
}
