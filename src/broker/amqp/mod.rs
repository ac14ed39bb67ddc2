//! AMQP (RabbitMQ) MessageBusStore implementation.
//!
//! Topics map to durable, non-auto-deleted topic exchanges; subscriptions
//! map to durable, non-exclusive queues bound with the catch-all pattern.
//! One lazily established connection pool is shared process-wide; channels
//! are scoped per call and dropped after use.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{
    options::{
        BasicGetOptions, BasicNackOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::{
    cache_key, validate_name, BrokerError, MessageBusStore, MessageHandler, Result,
};
use crate::config::AmqpConfig;

/// Routing key pattern binding a subscription to everything on its topic.
const CATCH_ALL_BINDING: &str = "#";

/// AMQP message bus store backed by RabbitMQ.
pub struct AmqpMessageBusStore {
    pool: Pool,
    receive_timeout: Duration,
    poll_interval: Duration,
    /// Exchanges already declared by this process, case-insensitive key to
    /// as-declared name. Declare races are resolved by the broker itself;
    /// a duplicate declare is an idempotent no-op.
    declared_topics: RwLock<HashMap<String, String>>,
    /// Queues already declared by this process, same keying.
    declared_subscriptions: RwLock<HashMap<String, String>>,
}

impl AmqpMessageBusStore {
    /// Create a new AMQP message bus store.
    ///
    /// The connection is established lazily on first use and reused across
    /// calls; a closed connection is replaced on demand by the pool.
    pub fn new(config: &AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| BrokerError::Connection(format!("Failed to create pool: {e}")))?;

        Ok(Self {
            pool,
            receive_timeout: Duration::from_millis(config.receive_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            declared_topics: RwLock::new(HashMap::new()),
            declared_subscriptions: RwLock::new(HashMap::new()),
        })
    }

    /// Get a channel from the pool.
    async fn get_channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BrokerError::Connection(format!("Failed to get connection from pool: {e}"))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {e}")))
    }

    /// Declare the topic exchange unless this process already has.
    async fn ensure_topic(&self, channel: &Channel, topic: &str) -> Result<()> {
        let key = cache_key(topic);
        if self.declared_topics.read().await.contains_key(&key) {
            return Ok(());
        }

        channel
            .exchange_declare(
                topic,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BrokerError::Publish(format!("Failed to declare topic '{topic}': {e}"))
            })?;

        self.declared_topics
            .write()
            .await
            .insert(key, topic.to_string());
        Ok(())
    }

    /// One declare-then-publish attempt.
    async fn try_send(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let channel = self.get_channel().await?;

        // Publisher confirms, so a publish into a missing exchange fails
        // here instead of closing the channel silently.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to enable confirms: {e}")))?;

        self.ensure_topic(&channel, topic).await?;

        let properties = BasicProperties::default()
            .with_content_type("text/plain".into())
            .with_delivery_mode(2); // persistent

        let confirm = channel
            .basic_publish(
                topic,
                CATCH_ALL_BINDING,
                Default::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {e}")))?;

        confirm
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl MessageBusStore for AmqpMessageBusStore {
    async fn send(&self, topic: &str, message: &str) -> Result<()> {
        validate_name(topic)?;

        let payload = message.as_bytes();

        // The first failure may mean the topic was deleted out from under
        // the existence cache; re-declare and retry exactly once.
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_times(1)
            .with_jitter()
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                self.declared_topics.write().await.remove(&cache_key(topic));
            }

            match self.try_send(topic, payload).await {
                Ok(()) => {
                    debug!(topic = %topic, "Sent message");
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        topic = %topic,
                        attempt = attempt + 1,
                        error = %e,
                        "Send attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(BrokerError::Unexpected(format!(
            "sending to topic '{topic}' failed after re-declare and retry: {}",
            last_error.map_or_else(|| "unknown".to_string(), |e| e.to_string())
        )))
    }

    async fn subscribe(&self, topic: &str, subscription: &str) -> Result<()> {
        validate_name(topic)?;
        validate_name(subscription)?;

        if self
            .declared_subscriptions
            .read()
            .await
            .contains_key(&cache_key(subscription))
        {
            return Ok(());
        }

        let channel = self.get_channel().await?;
        self.ensure_topic(&channel, topic).await?;

        channel
            .queue_declare(
                subscription,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BrokerError::Subscribe(format!(
                    "Failed to declare subscription '{subscription}': {e}"
                ))
            })?;

        channel
            .queue_bind(
                subscription,
                topic,
                CATCH_ALL_BINDING,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BrokerError::Subscribe(format!(
                    "Failed to bind subscription '{subscription}' to topic '{topic}': {e}"
                ))
            })?;

        self.declared_subscriptions
            .write()
            .await
            .insert(cache_key(subscription), subscription.to_string());

        info!(
            topic = %topic,
            subscription = %subscription,
            "Bound subscription to topic"
        );
        Ok(())
    }

    async fn receive_single(
        &self,
        topic: &str,
        subscription: &str,
        handler: Option<&dyn MessageHandler>,
    ) -> Result<Option<String>> {
        validate_name(topic)?;
        validate_name(subscription)?;

        let channel = self.get_channel().await?;
        let deadline = Instant::now() + self.receive_timeout;

        loop {
            let fetched = channel
                .basic_get(subscription, BasicGetOptions::default())
                .await
                .map_err(|e| {
                    BrokerError::Receive(format!(
                        "Failed to get message from subscription '{subscription}': {e}"
                    ))
                })?;

            let Some(message) = fetched else {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(self.poll_interval).await;
                continue;
            };

            let delivery = message.delivery;
            let payload = String::from_utf8(delivery.data.clone()).map_err(|e| {
                BrokerError::Receive(format!(
                    "Message on subscription '{subscription}' is not UTF-8: {e}"
                ))
            })?;

            if let Some(handler) = handler {
                if let Err(handler_error) = handler.handle(payload.clone()).await {
                    // Leave the message available for a subsequent receive.
                    delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await
                        .map_err(|e| {
                            BrokerError::Receive(format!(
                                "Failed to requeue message on '{subscription}': {e}"
                            ))
                        })?;

                    error!(
                        topic = %topic,
                        subscription = %subscription,
                        error = %handler_error,
                        "Handler rejected message, requeued"
                    );
                    return Err(BrokerError::Handler {
                        subscription: subscription.to_string(),
                        message: handler_error.to_string(),
                    });
                }
            }

            delivery.ack(Default::default()).await.map_err(|e| {
                BrokerError::Receive(format!(
                    "Failed to ack message on '{subscription}': {e}"
                ))
            })?;

            debug!(
                topic = %topic,
                subscription = %subscription,
                "Received message"
            );
            return Ok(Some(payload));
        }
    }

    async fn count(&self, topic: &str, subscription: &str) -> Result<usize> {
        validate_name(topic)?;
        validate_name(subscription)?;

        let channel = self.get_channel().await?;

        // Passive declare reports the queue's depth without creating it.
        let queue = channel
            .queue_declare(
                subscription,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BrokerError::Unexpected(format!(
                    "Failed to inspect subscription '{subscription}': {e}"
                ))
            })?;

        Ok(queue.message_count() as usize)
    }

    async fn destroy_all(&self) -> Result<()> {
        let channel = self.get_channel().await?;

        let subscriptions: Vec<String> = self
            .declared_subscriptions
            .read()
            .await
            .values()
            .cloned()
            .collect();
        for subscription in &subscriptions {
            channel
                .queue_delete(subscription, QueueDeleteOptions::default())
                .await
                .map_err(|e| {
                    BrokerError::Unexpected(format!(
                        "Failed to delete subscription '{subscription}': {e}"
                    ))
                })?;
        }

        let topics: Vec<String> = self.declared_topics.read().await.values().cloned().collect();
        for topic in &topics {
            channel
                .exchange_delete(topic, ExchangeDeleteOptions::default())
                .await
                .map_err(|e| {
                    BrokerError::Unexpected(format!("Failed to delete topic '{topic}': {e}"))
                })?;
        }

        self.declared_subscriptions.write().await.clear();
        self.declared_topics.write().await.clear();

        info!(
            topics = topics.len(),
            subscriptions = subscriptions.len(),
            "Destroyed declared topics and subscriptions"
        );
        Ok(())
    }
}
