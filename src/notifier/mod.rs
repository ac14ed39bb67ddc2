//! Relay of freshly persisted change events.
//!
//! After the event store commits a batch for one stream, the notifier
//! rehydrates each event in order, relays it to the in-process domain-event
//! consumers, then asks the registered translator for an optional
//! integration event and publishes it to the message broker. The notifier
//! never writes to the event store; by the time it runs, the append has
//! already committed.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::broker::MessageBusStore;
use crate::events::{ChangeEvent, DomainEvent, EventMigrator, IntegrationEvent, MigratorError};

/// Boxed error for the consumed collaborator contracts.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for notifier operations.
pub type Result<T> = std::result::Result<T, NotifyError>;

// ============================================================================
// Consumed contracts
// ============================================================================

/// In-process consumer of domain events, notified in stream order.
#[async_trait]
pub trait DomainEventConsumer: Send + Sync {
    /// Identity used in diagnostics when the consumer fails.
    fn name(&self) -> &str;

    /// Handle one domain event. Consumers may be invoked more than once
    /// for the same event and must be idempotent.
    async fn notify(&self, event: &dyn DomainEvent) -> std::result::Result<(), DynError>;
}

/// Translates domain events of one aggregate type into integration events.
pub trait IntegrationEventTranslator: Send + Sync {
    /// Identity used in diagnostics when translation fails.
    fn name(&self) -> &str;

    /// Aggregate type this translator targets.
    fn root_aggregate_type(&self) -> &str;

    /// Produce the integration event for a domain event, or `None` to
    /// decline publication (not an error).
    fn translate(
        &self,
        event: &dyn DomainEvent,
    ) -> std::result::Result<Option<Box<dyn IntegrationEvent>>, DynError>;
}

/// Publishes integration events across the bounded-context boundary.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, event: &dyn IntegrationEvent) -> std::result::Result<(), DynError>;
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur while relaying a stream batch.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("stream name is empty")]
    EmptyStreamName,

    #[error("event '{event_id}' has unreadable metadata: {source}")]
    Metadata {
        event_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Rehydrate(#[from] MigratorError),

    #[error("consumer '{consumer}' failed for event '{event_type}' of root '{root_id}': {message}")]
    Consumer {
        consumer: String,
        root_id: String,
        event_type: String,
        message: String,
    },

    #[error(
        "translator '{translator}' failed for event '{event_type}' of root '{root_id}': {message}"
    )]
    Translator {
        translator: String,
        root_id: String,
        event_type: String,
        message: String,
    },

    #[error("publishing integration event '{event_type}' for root '{root_id}' failed: {message}")]
    Publish {
        event_type: String,
        root_id: String,
        message: String,
    },
}

// ============================================================================
// Notifier
// ============================================================================

/// One registered relay target: a translator for an aggregate type plus the
/// domain-event consumers notified before translation. Built once at
/// startup; immutable at runtime.
pub struct NotifierRegistration {
    pub translator: Arc<dyn IntegrationEventTranslator>,
    pub consumers: Vec<Arc<dyn DomainEventConsumer>>,
}

impl NotifierRegistration {
    pub fn new(
        translator: Arc<dyn IntegrationEventTranslator>,
        consumers: Vec<Arc<dyn DomainEventConsumer>>,
    ) -> Self {
        Self {
            translator,
            consumers,
        }
    }
}

/// Relays persisted stream batches to consumers and the message broker.
pub struct EventStreamNotifier {
    migrator: Arc<EventMigrator>,
    broker: Arc<dyn MessageBroker>,
    registrations: Vec<NotifierRegistration>,
}

impl EventStreamNotifier {
    pub fn new(
        migrator: Arc<EventMigrator>,
        broker: Arc<dyn MessageBroker>,
        registrations: Vec<NotifierRegistration>,
    ) -> Self {
        Self {
            migrator,
            broker,
            registrations,
        }
    }

    /// Relay one freshly persisted batch for one stream.
    ///
    /// Registrations are matched on the batch's aggregate type and
    /// processed independently: each one relays the batch atomically in
    /// stream order (all-or-nothing on first failure), a failure in one
    /// does not roll back another's already-relayed events, and the call
    /// reports the first failure encountered.
    pub async fn notify(&self, stream_name: &str, event_stream: &[ChangeEvent]) -> Result<()> {
        if stream_name.is_empty() {
            return Err(NotifyError::EmptyStreamName);
        }
        let Some(first) = event_stream.first() else {
            return Ok(());
        };
        if self.registrations.is_empty() {
            return Ok(());
        }

        let aggregate_type = first.entity_type.as_str();
        let selected: Vec<&NotifierRegistration> = self
            .registrations
            .iter()
            .filter(|r| r.translator.root_aggregate_type() == aggregate_type)
            .collect();

        if selected.is_empty() {
            debug!(
                stream = %stream_name,
                aggregate_type = %aggregate_type,
                "No registration targets this aggregate type"
            );
            return Ok(());
        }

        let mut first_failure: Option<NotifyError> = None;
        for registration in selected {
            if let Err(e) = self
                .relay_registration(stream_name, registration, event_stream)
                .await
            {
                error!(
                    stream = %stream_name,
                    translator = %registration.translator.name(),
                    error = %e,
                    "Relay failed for registration"
                );
                first_failure.get_or_insert(e);
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn relay_registration(
        &self,
        stream_name: &str,
        registration: &NotifierRegistration,
        event_stream: &[ChangeEvent],
    ) -> Result<()> {
        for change in event_stream {
            let metadata = change
                .parsed_metadata()
                .map_err(|source| NotifyError::Metadata {
                    event_id: change.id.clone(),
                    source,
                })?;

            let event = self
                .migrator
                .rehydrate(&change.id, &change.data, &metadata.fqn)?;

            for consumer in &registration.consumers {
                consumer
                    .notify(event.as_ref())
                    .await
                    .map_err(|e| NotifyError::Consumer {
                        consumer: consumer.name().to_string(),
                        root_id: event.root_id().to_string(),
                        event_type: event.type_name().to_string(),
                        message: e.to_string(),
                    })?;
            }

            match registration.translator.translate(event.as_ref()) {
                Ok(Some(integration)) => {
                    self.broker
                        .publish(integration.as_ref())
                        .await
                        .map_err(|e| NotifyError::Publish {
                            event_type: integration.type_name().to_string(),
                            root_id: integration.root_id().to_string(),
                            message: e.to_string(),
                        })?;
                    debug!(
                        stream = %stream_name,
                        event_type = %integration.type_name(),
                        "Published integration event"
                    );
                }
                Ok(None) => {
                    debug!(
                        stream = %stream_name,
                        event_type = %event.type_name(),
                        translator = %registration.translator.name(),
                        "Translator declined to publish"
                    );
                }
                Err(e) => {
                    return Err(NotifyError::Translator {
                        translator: registration.translator.name().to_string(),
                        root_id: event.root_id().to_string(),
                        event_type: event.type_name().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// Broker bridge
// ============================================================================

/// [`MessageBroker`] that publishes integration events as JSON onto one
/// topic of a [`MessageBusStore`].
pub struct BusMessageBroker {
    bus: Arc<dyn MessageBusStore>,
    topic: String,
}

impl BusMessageBroker {
    pub fn new(bus: Arc<dyn MessageBusStore>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl MessageBroker for BusMessageBroker {
    async fn publish(&self, event: &dyn IntegrationEvent) -> std::result::Result<(), DynError> {
        let payload = event.to_json()?;
        self.bus.send(&self.topic, &payload).await?;
        Ok(())
    }
}
