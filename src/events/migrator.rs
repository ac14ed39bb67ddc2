//! Rehydration of persisted events, tolerating type renames.
//!
//! Historical events carry the type name they were serialized under. When a
//! type is renamed across releases, the registry maps the original name to
//! the current one at read time. Types are resolved through an explicit
//! registration table built at process start; there is no runtime scanning.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::debug;

use super::DomainEvent;

/// Factory producing a domain event from its JSON payload.
///
/// Monomorphized from [`EventTypeRegistry::register`]; a plain fn pointer so
/// the registry stays `Send + Sync` without boxing.
pub type EventFactory = fn(&str) -> serde_json::Result<Arc<dyn DomainEvent>>;

fn deserialize_event<T>(json: &str) -> serde_json::Result<Arc<dyn DomainEvent>>
where
    T: DomainEvent + DeserializeOwned + 'static,
{
    Ok(Arc::new(serde_json::from_str::<T>(json)?))
}

/// Registration table mapping logical event type names to constructors,
/// plus the rename mapping for types that moved across releases.
///
/// Built once at startup and injected wherever rehydration happens; tests
/// construct fresh instances rather than sharing process globals.
#[derive(Default)]
pub struct EventTypeRegistry {
    factories: HashMap<String, EventFactory>,
    renames: HashMap<String, String>,
}

impl EventTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructible event type under its logical name.
    pub fn register<T>(&mut self, type_name: impl Into<String>)
    where
        T: DomainEvent + DeserializeOwned + 'static,
    {
        self.factories
            .insert(type_name.into(), deserialize_event::<T>);
    }

    /// Record that events persisted under `original` are now `current`.
    pub fn map_renamed(&mut self, original: impl Into<String>, current: impl Into<String>) {
        self.renames.insert(original.into(), current.into());
    }

    /// Resolve a persisted type name to its current name.
    ///
    /// Names absent from the rename mapping resolve to themselves, so an
    /// explicit identity mapping and no mapping behave identically.
    pub fn resolve<'a>(&'a self, original: &'a str) -> &'a str {
        self.renames.get(original).map_or(original, String::as_str)
    }

    fn factory(&self, type_name: &str) -> Option<EventFactory> {
        self.factories.get(type_name).copied()
    }
}

/// Errors raised while rehydrating a persisted event.
#[derive(Debug, thiserror::Error)]
pub enum MigratorError {
    /// The (possibly rename-substituted) type has no registered factory.
    /// The event cannot be skipped: an unresolvable type aborts the read
    /// so history is never silently lost.
    #[error("event '{event_id}' has unknown type '{type_name}' and cannot be rehydrated")]
    UnknownEventType { event_id: String, type_name: String },

    #[error("event '{event_id}' of type '{type_name}' failed to deserialize: {source}")]
    Deserialize {
        event_id: String,
        type_name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("event '{event_id}' of type '{type_name}' failed to serialize: {source}")]
    Serialize {
        event_id: String,
        type_name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Rehydrates persisted events into current domain event types.
pub struct EventMigrator {
    registry: Arc<EventTypeRegistry>,
}

impl EventMigrator {
    pub fn new(registry: Arc<EventTypeRegistry>) -> Self {
        Self { registry }
    }

    /// Rehydrate an event from its JSON payload and original type name.
    pub fn rehydrate(
        &self,
        event_id: &str,
        event_json: &str,
        original_type_name: &str,
    ) -> Result<Arc<dyn DomainEvent>, MigratorError> {
        let type_name = self.registry.resolve(original_type_name);
        if type_name != original_type_name {
            debug!(
                event_id = %event_id,
                original = %original_type_name,
                current = %type_name,
                "Migrating renamed event type"
            );
        }

        let factory =
            self.registry
                .factory(type_name)
                .ok_or_else(|| MigratorError::UnknownEventType {
                    event_id: event_id.to_string(),
                    type_name: original_type_name.to_string(),
                })?;

        factory(event_json).map_err(|source| MigratorError::Deserialize {
            event_id: event_id.to_string(),
            type_name: type_name.to_string(),
            source,
        })
    }

    /// Round-trip a live event through its serialized form.
    ///
    /// Serializes under the event's current type name and delegates to
    /// [`rehydrate`](Self::rehydrate).
    pub fn rehydrate_event(
        &self,
        event_id: &str,
        event: &dyn DomainEvent,
    ) -> Result<Arc<dyn DomainEvent>, MigratorError> {
        let json = event.to_json().map_err(|source| MigratorError::Serialize {
            event_id: event_id.to_string(),
            type_name: event.type_name().to_string(),
            source,
        })?;
        self.rehydrate(event_id, &json, event.type_name())
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct GadgetRenamed {
        root_id: String,
        name: String,
        at: DateTime<Utc>,
    }

    impl DomainEvent for GadgetRenamed {
        fn root_id(&self) -> &str {
            &self.root_id
        }
        fn occurred_utc(&self) -> DateTime<Utc> {
            self.at
        }
        fn type_name(&self) -> &'static str {
            "gadget.GadgetRenamed"
        }
        fn to_json(&self) -> serde_json::Result<String> {
            serde_json::to_string(self)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn sample_event() -> GadgetRenamed {
        GadgetRenamed {
            root_id: "g1".to_string(),
            name: "flux".to_string(),
            at: Utc::now(),
        }
    }

    fn registry() -> EventTypeRegistry {
        let mut registry = EventTypeRegistry::new();
        registry.register::<GadgetRenamed>("gadget.GadgetRenamed");
        registry
    }

    #[test]
    fn test_rehydrate_known_type() {
        let migrator = EventMigrator::new(Arc::new(registry()));
        let event = sample_event();
        let json = event.to_json().unwrap();

        let rehydrated = migrator
            .rehydrate("ev1", &json, "gadget.GadgetRenamed")
            .unwrap();
        let concrete = rehydrated
            .as_any()
            .downcast_ref::<GadgetRenamed>()
            .unwrap();
        assert_eq!(*concrete, event);
    }

    #[test]
    fn test_rehydrate_follows_rename_mapping() {
        let mut registry = registry();
        registry.map_renamed("gadget.GadgetNameChanged", "gadget.GadgetRenamed");
        let migrator = EventMigrator::new(Arc::new(registry));

        let json = sample_event().to_json().unwrap();
        let rehydrated = migrator
            .rehydrate("ev1", &json, "gadget.GadgetNameChanged")
            .unwrap();
        assert_eq!(rehydrated.type_name(), "gadget.GadgetRenamed");
    }

    #[test]
    fn test_rehydrate_unknown_type_names_event_and_type() {
        let migrator = EventMigrator::new(Arc::new(registry()));

        let err = migrator
            .rehydrate("ev42", "{}", "gadget.Vanished")
            .unwrap_err();
        match err {
            MigratorError::UnknownEventType {
                event_id,
                type_name,
            } => {
                assert_eq!(event_id, "ev42");
                assert_eq!(type_name, "gadget.Vanished");
            }
            other => panic!("expected UnknownEventType, got {other:?}"),
        }
    }

    #[test]
    fn test_rehydrate_unknown_after_mapping_reports_original_name() {
        let mut registry = EventTypeRegistry::new();
        registry.map_renamed("old.Name", "new.Name");
        let migrator = EventMigrator::new(Arc::new(registry));

        // Mapping resolves old.Name -> new.Name, but new.Name is unregistered.
        let err = migrator.rehydrate("ev7", "{}", "old.Name").unwrap_err();
        match err {
            MigratorError::UnknownEventType { type_name, .. } => {
                assert_eq!(type_name, "old.Name");
            }
            other => panic!("expected UnknownEventType, got {other:?}"),
        }
    }

    #[test]
    fn test_rehydrate_malformed_payload() {
        let migrator = EventMigrator::new(Arc::new(registry()));

        let err = migrator
            .rehydrate("ev1", "not json", "gadget.GadgetRenamed")
            .unwrap_err();
        assert!(matches!(err, MigratorError::Deserialize { .. }));
    }

    #[test]
    fn test_identity_mapping_matches_absent_mapping() {
        let plain = EventMigrator::new(Arc::new(registry()));

        let mut with_identity = registry();
        with_identity.map_renamed("gadget.GadgetRenamed", "gadget.GadgetRenamed");
        let identity = EventMigrator::new(Arc::new(with_identity));

        let json = sample_event().to_json().unwrap();
        let a = plain
            .rehydrate("ev1", &json, "gadget.GadgetRenamed")
            .unwrap();
        let b = identity
            .rehydrate("ev1", &json, "gadget.GadgetRenamed")
            .unwrap();

        assert_eq!(
            a.as_any().downcast_ref::<GadgetRenamed>(),
            b.as_any().downcast_ref::<GadgetRenamed>()
        );
    }

    #[test]
    fn test_rehydrate_event_round_trip() {
        let migrator = EventMigrator::new(Arc::new(registry()));
        let event = sample_event();

        let rehydrated = migrator.rehydrate_event("ev1", &event).unwrap();
        let concrete = rehydrated
            .as_any()
            .downcast_ref::<GadgetRenamed>()
            .unwrap();
        assert_eq!(*concrete, event);
    }
}
