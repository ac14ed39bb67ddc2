//! Topic/queue message bus for integration events.
//!
//! This module contains:
//! - `MessageBusStore` trait: publish, durable subscription, at-least-once
//!   single-message receive
//! - `MessageHandler` trait: per-message processing on receive
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::info;

use crate::config::MessagingConfig;

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use memory::InMemoryMessageBusStore;

#[cfg(feature = "amqp")]
pub use amqp::AmqpMessageBusStore;

/// Boxed error returned by message handlers.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Longest accepted topic or subscription name.
pub const MAX_NAME_LENGTH: usize = 255;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Bad topic/queue name; raised before any I/O, never truncated away.
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("receive failed: {0}")]
    Receive(String),

    /// The supplied message handler rejected the message; the message was
    /// requeued for redelivery.
    #[error("handler failed for message on subscription '{subscription}': {message}")]
    Handler {
        subscription: String,
        message: String,
    },

    #[error("unexpected broker error: {0}")]
    Unexpected(String),
}

/// Handler invoked for a received message.
///
/// Returning `Ok` acknowledges (removes) the message; returning an error
/// negatively-acknowledges it with requeue, so it remains available for a
/// subsequent receive. Delivery is at-least-once: handlers must be
/// idempotent.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: String) -> BoxFuture<'static, std::result::Result<(), DynError>>;
}

/// Interface for topic/queue message transport.
///
/// Topics are durable fan-out points; subscriptions are durable queues
/// bound to a topic with a catch-all pattern. Payloads are arbitrary UTF-8
/// text; no schema is enforced by the transport.
///
/// Implementations:
/// - `AmqpMessageBusStore`: RabbitMQ
/// - `InMemoryMessageBusStore`: in-process, for tests and local development
#[async_trait]
pub trait MessageBusStore: Send + Sync {
    /// Publish a message to a topic, lazily declaring the topic on first
    /// use.
    async fn send(&self, topic: &str, message: &str) -> Result<()>;

    /// Declare a durable subscription bound to the topic. Idempotent.
    async fn subscribe(&self, topic: &str, subscription: &str) -> Result<()>;

    /// Receive at most one message from a subscription, polling up to a
    /// bounded timeout.
    ///
    /// With a handler: handler success acknowledges the message, handler
    /// failure requeues it and surfaces [`BrokerError::Handler`]. Without
    /// a handler the message is acknowledged and returned. An empty poll
    /// returns `Ok(None)`, not an error.
    async fn receive_single(
        &self,
        topic: &str,
        subscription: &str,
        handler: Option<&dyn MessageHandler>,
    ) -> Result<Option<String>>;

    /// Number of messages waiting on a subscription. Test/maintenance only.
    async fn count(&self, topic: &str, subscription: &str) -> Result<usize>;

    /// Remove every topic and subscription this store declared.
    /// Test/maintenance only.
    async fn destroy_all(&self) -> Result<()>;
}

/// Validate a topic or subscription name before any network call.
///
/// Names are rejected, never silently truncated or rewritten.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BrokerError::InvalidName {
            name: name.to_string(),
            reason: "name is empty".to_string(),
        });
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(BrokerError::InvalidName {
            name: name.to_string(),
            reason: format!("name exceeds {MAX_NAME_LENGTH} characters"),
        });
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(BrokerError::InvalidName {
            name: name.to_string(),
            reason: format!("character '{bad}' is not allowed"),
        });
    }
    Ok(())
}

/// Case-insensitive cache key for a validated name.
pub(crate) fn cache_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Initialize a message bus store from configuration.
pub async fn init_message_bus(
    config: &MessagingConfig,
) -> std::result::Result<Arc<dyn MessageBusStore>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        crate::config::MessagingType::Memory => {
            info!(messaging_type = "memory", "Message bus initialized");
            Ok(Arc::new(InMemoryMessageBusStore::new()))
        }
        crate::config::MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let bus = AmqpMessageBusStore::new(&config.amqp)?;
                info!(messaging_type = "amqp", "Message bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err("AMQP support requires the 'amqp' feature. Rebuild with --features amqp".into())
            }
        }
    }
}
