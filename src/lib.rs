//! Event-sourced persistence and change-notification relay.
//!
//! Aggregates record their state changes as versioned change events. This
//! crate appends those events to per-aggregate streams under optimistic
//! concurrency control, reads them back for rehydration (migrating renamed
//! event types along the way), and relays freshly persisted batches to
//! in-process consumers and to integration-event subscribers over a
//! topic/queue message bus.

pub mod broker;
pub mod config;
pub mod events;
pub mod notifier;
pub mod store;
