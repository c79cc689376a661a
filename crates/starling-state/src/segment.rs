use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use starling_core::AgentId;

/// A named, versioned unit of shared mutable state protected by a single lock.
///
/// `lock_holder` and `locked_at` are always both `None` or both `Some`; the
/// only mutators are [`MemorySegment::lock`] and [`MemorySegment::unlock`],
/// which maintain that pairing. The version increments exactly once per
/// committed write and only the current lock holder may advance it.
#[derive(Debug, Clone)]
pub struct MemorySegment {
    /// Segment name, unique within a store.
    pub name: String,
    /// The committed payload.
    pub data: serde_json::Value,
    /// Agent currently holding the lock, if any.
    pub lock_holder: Option<AgentId>,
    /// When the current lock was taken. Monotonic, used for staleness.
    pub locked_at: Option<Instant>,
    /// Monotonically increasing commit counter, 0 at creation.
    pub version: u64,
    /// When the segment was created.
    pub created_at: DateTime<Utc>,
    /// When the segment was last committed to.
    pub updated_at: DateTime<Utc>,
}

impl MemorySegment {
    pub(crate) fn new(name: impl Into<String>, initial: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            data: initial,
            lock_holder: None,
            locked_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether any agent currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.lock_holder.is_some()
    }

    /// Whether the given agent currently holds the lock.
    pub fn is_held_by(&self, agent: &AgentId) -> bool {
        self.lock_holder.as_ref() == Some(agent)
    }

    pub(crate) fn lock(&mut self, owner: &AgentId) {
        self.lock_holder = Some(owner.clone());
        self.locked_at = Some(Instant::now());
    }

    pub(crate) fn unlock(&mut self) {
        self.lock_holder = None;
        self.locked_at = None;
    }

    pub(crate) fn commit(&mut self, data: serde_json::Value) -> u64 {
        self.data = data;
        self.version += 1;
        self.updated_at = Utc::now();
        self.version
    }
}

/// A point-in-time view of a segment's committed data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentView {
    /// The committed payload at read time.
    pub data: serde_json::Value,
    /// The version the payload was committed at.
    pub version: u64,
}

/// The committed result of a successful [`transaction`] call.
///
/// [`transaction`]: crate::SharedStateStore::transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionOutcome {
    /// The value the operation produced and the store committed.
    pub value: serde_json::Value,
    /// The version the value was committed at.
    pub version: u64,
}
