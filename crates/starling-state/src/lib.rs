//! Versioned, lockable shared state for swarm agents.
//!
//! Provides named memory segments with single-holder locking, optimistic
//! version checks, compare-and-swap, lock-scoped transactions, and a
//! background watchdog that reclaims locks abandoned by crashed or hung
//! holders.
//!
//! # Main types
//!
//! - [`SharedStateStore`]: the segment registry and locking discipline.
//! - [`MemorySegment`]: a named, versioned unit of shared mutable state.
//! - [`SegmentView`]: a point-in-time read of a segment.
//! - [`TransactionOutcome`]: the committed result of a transaction.
//! - [`StateConfig`]: retry, staleness, and watchdog tuning.
//! - [`StateEvent`]: notifications emitted when the watchdog intervenes.

/// Store configuration with serde defaults.
pub mod config;
/// Segment data model.
pub mod segment;
/// The store, its locking operations, and the stale-lock watchdog.
pub mod store;

pub use config::StateConfig;
pub use segment::{MemorySegment, SegmentView, TransactionOutcome};
pub use store::{SharedStateStore, StateEvent};
