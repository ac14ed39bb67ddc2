//! In-memory MessageBusStore implementation.
//!
//! Mirrors the broker semantics — lazy topic declaration, durable
//! subscriptions with fan-out, requeue on handler failure — without a
//! network. Used by unit tests and local development.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{cache_key, validate_name, BrokerError, MessageBusStore, MessageHandler, Result};

#[derive(Default)]
struct Topic {
    /// Subscription queues keyed by case-insensitive name.
    subscriptions: HashMap<String, VecDeque<String>>,
}

/// Message bus keeping topics and subscription queues in process memory.
#[derive(Default)]
pub struct InMemoryMessageBusStore {
    topics: Mutex<HashMap<String, Topic>>,
}

impl InMemoryMessageBusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBusStore for InMemoryMessageBusStore {
    async fn send(&self, topic: &str, message: &str) -> Result<()> {
        validate_name(topic)?;

        let mut topics = self.topics.lock().await;
        let entry = topics.entry(cache_key(topic)).or_default();

        // Fan out to every bound subscription; with none bound yet, the
        // message is simply not retained (a topic is not a queue).
        for queue in entry.subscriptions.values_mut() {
            queue.push_back(message.to_string());
        }

        debug!(
            topic = %topic,
            subscriptions = entry.subscriptions.len(),
            "Sent message"
        );
        Ok(())
    }

    async fn subscribe(&self, topic: &str, subscription: &str) -> Result<()> {
        validate_name(topic)?;
        validate_name(subscription)?;

        let mut topics = self.topics.lock().await;
        let entry = topics.entry(cache_key(topic)).or_default();
        // Re-subscribing must not drop queued messages.
        entry
            .subscriptions
            .entry(cache_key(subscription))
            .or_default();
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

        // Pop outside the handler await so concurrent receives make
        // progress; a rejected message goes back to the front.
        let message = {
            let mut topics = self.topics.lock().await;
            topics
                .get_mut(&cache_key(topic))
                .and_then(|t| t.subscriptions.get_mut(&cache_key(subscription)))
                .and_then(VecDeque::pop_front)
        };

        let Some(message) = message else {
            return Ok(None);
        };

        if let Some(handler) = handler {
            if let Err(e) = handler.handle(message.clone()).await {
                let mut topics = self.topics.lock().await;
                if let Some(queue) = topics
                    .get_mut(&cache_key(topic))
                    .and_then(|t| t.subscriptions.get_mut(&cache_key(subscription)))
                {
                    queue.push_front(message);
                }
                return Err(BrokerError::Handler {
                    subscription: subscription.to_string(),
                    message: e.to_string(),
                });
            }
        }

        Ok(Some(message))
    }

    async fn count(&self, topic: &str, subscription: &str) -> Result<usize> {
        validate_name(topic)?;
        validate_name(subscription)?;

        let topics = self.topics.lock().await;
        Ok(topics
            .get(&cache_key(topic))
            .and_then(|t| t.subscriptions.get(&cache_key(subscription)))
            .map_or(0, VecDeque::len))
    }

    async fn destroy_all(&self) -> Result<()> {
        self.topics.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures::future::BoxFuture;

    use super::*;
    use crate::broker::DynError;

    /// Handler that fails the first `failures` invocations.
    struct FlakyHandler {
        calls: Arc<AtomicUsize>,
        failures: usize,
    }

    impl MessageHandler for FlakyHandler {
        fn handle(&self, _message: String) -> BoxFuture<'static, std::result::Result<(), DynError>> {
            let calls = self.calls.clone();
            let failures = self.failures;
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err("not yet".into())
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn test_send_without_subscription_is_not_retained() {
        let bus = InMemoryMessageBusStore::new();
        bus.send("orders", "m1").await.unwrap();
        bus.subscribe("orders", "orders-sub").await.unwrap();
        assert_eq!(bus.count("orders", "orders-sub").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_subscribe_receive_ack_scenario() {
        let bus = InMemoryMessageBusStore::new();

        bus.send("orders", "m1").await.unwrap();
        bus.subscribe("orders", "orders-sub").await.unwrap();

        // Nothing was queued before the subscription existed.
        assert_eq!(
            bus.receive_single("orders", "orders-sub", None)
                .await
                .unwrap(),
            None
        );

        bus.send("orders", "m2").await.unwrap();
        let received = bus
            .receive_single("orders", "orders-sub", None)
            .await
            .unwrap();
        assert_eq!(received.as_deref(), Some("m2"));
        assert_eq!(bus.count("orders", "orders-sub").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_handler_requeues_message_once() {
        let bus = InMemoryMessageBusStore::new();
        bus.subscribe("orders", "orders-sub").await.unwrap();
        bus.send("orders", "m1").await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let handler = FlakyHandler {
            calls: calls.clone(),
            failures: 1,
        };

        let err = bus
            .receive_single("orders", "orders-sub", Some(&handler))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Handler { .. }));

        // Still there: exactly one copy, available for redelivery.
        assert_eq!(bus.count("orders", "orders-sub").await.unwrap(), 1);

        let received = bus
            .receive_single("orders", "orders-sub", Some(&handler))
            .await
            .unwrap();
        assert_eq!(received.as_deref(), Some("m1"));
        assert_eq!(bus.count("orders", "orders-sub").await.unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscriptions() {
        let bus = InMemoryMessageBusStore::new();
        bus.subscribe("orders", "billing").await.unwrap();
        bus.subscribe("orders", "shipping").await.unwrap();

        bus.send("orders", "m1").await.unwrap();

        assert_eq!(bus.count("orders", "billing").await.unwrap(), 1);
        assert_eq!(bus.count("orders", "shipping").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_keeps_queued_messages() {
        let bus = InMemoryMessageBusStore::new();
        bus.subscribe("orders", "orders-sub").await.unwrap();
        bus.send("orders", "m1").await.unwrap();

        bus.subscribe("orders", "orders-sub").await.unwrap();
        assert_eq!(bus.count("orders", "orders-sub").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_names_are_case_insensitive() {
        let bus = InMemoryMessageBusStore::new();
        bus.subscribe("Orders", "Orders-Sub").await.unwrap();
        bus.send("orders", "m1").await.unwrap();
        assert_eq!(bus.count("ORDERS", "orders-sub").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_names_fail_fast() {
        let bus = InMemoryMessageBusStore::new();
        assert!(matches!(
            bus.send("bad topic", "m1").await.unwrap_err(),
            BrokerError::InvalidName { .. }
        ));
        assert!(matches!(
            bus.subscribe("orders", "").await.unwrap_err(),
            BrokerError::InvalidName { .. }
        ));
    }

    #[tokio::test]
    async fn test_destroy_all_clears_everything() {
        let bus = InMemoryMessageBusStore::new();
        bus.subscribe("orders", "orders-sub").await.unwrap();
        bus.send("orders", "m1").await.unwrap();

        bus.destroy_all().await.unwrap();
        assert_eq!(bus.count("orders", "orders-sub").await.unwrap(), 0);
    }
}
