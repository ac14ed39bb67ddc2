//! Change events and the contracts they flow through.
//!
//! This module contains:
//! - `ChangeEvent`: the persisted, versioned unit of aggregate state change
//! - `StreamName`: the `{entity}_{id}` address of one aggregate's stream
//! - `DomainEvent` / `IntegrationEvent`: the event contracts consumed and
//!   produced by the relay pipeline

use std::any::Any;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod migrator;

pub use migrator::{EventMigrator, EventTypeRegistry, MigratorError};

/// The version assigned to the first event of a stream.
pub const FIRST_VERSION: u32 = 1;

/// Separator between entity name and entity id in a stream name.
const STREAM_NAME_SEPARATOR: char = '_';

// ============================================================================
// Event contracts
// ============================================================================

/// A domain event raised by an aggregate root.
///
/// Implementations are plain serde structs; rehydration goes through the
/// factory registered in [`EventTypeRegistry`], so the trait only exposes
/// what the relay pipeline needs.
pub trait DomainEvent: fmt::Debug + Send + Sync {
    /// Identity of the aggregate root that raised the event.
    fn root_id(&self) -> &str;

    /// When the change occurred.
    fn occurred_utc(&self) -> DateTime<Utc>;

    /// Logical type name the event is serialized under.
    fn type_name(&self) -> &'static str;

    /// Serialize the event payload to JSON.
    fn to_json(&self) -> serde_json::Result<String>;

    /// Downcast support for consumers that need the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// An externally publishable representation of a domain event, crossing a
/// bounded-context boundary.
pub trait IntegrationEvent: fmt::Debug + Send + Sync {
    /// Identity of the aggregate root the event originated from.
    fn root_id(&self) -> &str;

    /// When the originating change occurred.
    fn occurred_utc(&self) -> DateTime<Utc>;

    /// Logical type name the event is published under.
    fn type_name(&self) -> &'static str;

    /// Serialize the event payload to JSON.
    fn to_json(&self) -> serde_json::Result<String>;
}

// ============================================================================
// Stream names
// ============================================================================

/// Address of one aggregate's event stream: `{entity_name}_{entity_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamName(String);

impl StreamName {
    /// Build a stream name from an entity name and id.
    ///
    /// Both parts must be non-empty; the entity name must not contain the
    /// separator, or prefix-based operations would match the wrong streams.
    pub fn new(entity_name: &str, entity_id: &str) -> Result<Self, InvalidStreamName> {
        if entity_name.is_empty() {
            return Err(InvalidStreamName::EmptyEntityName);
        }
        if entity_id.is_empty() {
            return Err(InvalidStreamName::EmptyEntityId);
        }
        if entity_name.contains(STREAM_NAME_SEPARATOR) {
            return Err(InvalidStreamName::SeparatorInEntityName {
                entity_name: entity_name.to_string(),
            });
        }
        Ok(Self(format!(
            "{}{}{}",
            entity_name, STREAM_NAME_SEPARATOR, entity_id
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this stream belongs to the given entity.
    pub fn has_entity(&self, entity_name: &str) -> bool {
        Self::prefix_matches(&self.0, entity_name)
    }

    /// Whether a raw stream name belongs to the given entity.
    pub fn prefix_matches(stream_name: &str, entity_name: &str) -> bool {
        stream_name
            .strip_prefix(entity_name)
            .is_some_and(|rest| rest.starts_with(STREAM_NAME_SEPARATOR))
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors constructing a [`StreamName`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidStreamName {
    #[error("entity name is empty")]
    EmptyEntityName,

    #[error("entity id is empty")]
    EmptyEntityId,

    #[error("entity name '{entity_name}' contains the stream separator '_'")]
    SeparatorInEntityName { entity_name: String },
}

// ============================================================================
// Change events
// ============================================================================

/// Envelope metadata persisted alongside an event payload.
///
/// Carries the fully-qualified type name the payload was originally
/// serialized under, which the migrator maps to a current type on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Original fully-qualified event type name.
    pub fqn: String,
}

impl EventMetadata {
    pub fn new(fqn: impl Into<String>) -> Self {
        Self { fqn: fqn.into() }
    }
}

/// One persisted, versioned state transition of an aggregate.
///
/// Versions are unique and contiguous within a stream, starting at
/// [`FIRST_VERSION`]. Change events are appended once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Unique event id.
    pub id: String,
    /// Name of the aggregate (entity) type that produced the event.
    pub entity_type: String,
    /// Logical event type name.
    pub event_type: String,
    /// Serialized event payload (JSON).
    pub data: String,
    /// Serialized [`EventMetadata`] envelope (JSON).
    pub metadata: String,
    /// 1-based, contiguous position within the stream.
    pub version: u32,
    /// Whether the event tombstones the aggregate.
    pub is_tombstone: bool,
    /// When the backend persisted the event; `None` until stored.
    pub last_persisted_at_utc: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    /// Wrap a domain event for persistence at the given stream version.
    pub fn from_domain_event(
        entity_type: &str,
        event: &dyn DomainEvent,
        version: u32,
        is_tombstone: bool,
    ) -> serde_json::Result<Self> {
        let metadata = serde_json::to_string(&EventMetadata::new(event.type_name()))?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            entity_type: entity_type.to_string(),
            event_type: event.type_name().to_string(),
            data: event.to_json()?,
            metadata,
            version,
            is_tombstone,
            last_persisted_at_utc: None,
        })
    }

    /// Parse the metadata envelope back out of its serialized form.
    pub fn parsed_metadata(&self) -> serde_json::Result<EventMetadata> {
        serde_json::from_str(&self.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct WidgetPainted {
        root_id: String,
        color: String,
        at: DateTime<Utc>,
    }

    impl DomainEvent for WidgetPainted {
        fn root_id(&self) -> &str {
            &self.root_id
        }
        fn occurred_utc(&self) -> DateTime<Utc> {
            self.at
        }
        fn type_name(&self) -> &'static str {
            "widget.WidgetPainted"
        }
        fn to_json(&self) -> serde_json::Result<String> {
            serde_json::to_string(self)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_stream_name_format() {
        let name = StreamName::new("widget", "abc123").unwrap();
        assert_eq!(name.as_str(), "widget_abc123");
        assert_eq!(name.to_string(), "widget_abc123");
    }

    #[test]
    fn test_stream_name_rejects_empty_parts() {
        assert_eq!(
            StreamName::new("", "abc123"),
            Err(InvalidStreamName::EmptyEntityName)
        );
        assert_eq!(
            StreamName::new("widget", ""),
            Err(InvalidStreamName::EmptyEntityId)
        );
    }

    #[test]
    fn test_stream_name_rejects_separator_in_entity() {
        let err = StreamName::new("widget_v2", "abc").unwrap_err();
        assert!(matches!(
            err,
            InvalidStreamName::SeparatorInEntityName { .. }
        ));
    }

    #[test]
    fn test_prefix_matches_full_segment_only() {
        assert!(StreamName::prefix_matches("widget_abc123", "widget"));
        assert!(!StreamName::prefix_matches("widgetron_abc123", "widget"));
        assert!(!StreamName::prefix_matches("widget", "widget"));
    }

    #[test]
    fn test_change_event_from_domain_event() {
        let event = WidgetPainted {
            root_id: "abc123".to_string(),
            color: "teal".to_string(),
            at: Utc::now(),
        };

        let change = ChangeEvent::from_domain_event("widget", &event, 3, false).unwrap();
        assert_eq!(change.entity_type, "widget");
        assert_eq!(change.event_type, "widget.WidgetPainted");
        assert_eq!(change.version, 3);
        assert!(!change.is_tombstone);
        assert!(change.last_persisted_at_utc.is_none());

        let metadata = change.parsed_metadata().unwrap();
        assert_eq!(metadata.fqn, "widget.WidgetPainted");

        let payload: WidgetPainted = serde_json::from_str(&change.data).unwrap();
        assert_eq!(payload.color, "teal");
    }

    #[test]
    fn test_change_event_serde_uses_camel_case() {
        let event = WidgetPainted {
            root_id: "abc123".to_string(),
            color: "red".to_string(),
            at: Utc::now(),
        };
        let change = ChangeEvent::from_domain_event("widget", &event, 1, false).unwrap();

        let json = serde_json::to_string(&change).unwrap();
        assert!(json.contains("\"entityType\""));
        assert!(json.contains("\"eventType\""));
        assert!(json.contains("\"isTombstone\""));
        assert!(json.contains("\"lastPersistedAtUtc\""));

        let back: ChangeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, change);
    }
}
