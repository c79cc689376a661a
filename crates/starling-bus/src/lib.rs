//! Topic-based publish/subscribe fabric for in-process swarm messaging.
//!
//! Carries typed coordination payloads and free-form application data
//! between agents: per-topic subscriptions with sender exclusion, per-agent
//! direct topics, a well-known broadcast topic, and a bounded message log
//! for observability. Delivery is best-effort and at-most-once per
//! subscriber.
//!
//! # Main types
//!
//! - [`MessageBus`]: the fabric; publish, subscribe, direct, broadcast.
//! - [`Subscription`]: a live subscription; dropping it unsubscribes.
//! - [`BusMessage`]: a delivered message with topic, sender, and payload.
//! - [`Payload`]: the closed set of payload kinds.
//! - [`BusConfig`]: log bound and error-channel capacity.
//! - [`BusError`]: delivery failures reported out-of-band.

/// The bus, subscriptions, and configuration.
pub mod bus;
/// Message envelope and typed payloads.
pub mod message;

pub use bus::{BusConfig, BusError, MessageBus, Subscription};
pub use message::{BusMessage, Payload};
