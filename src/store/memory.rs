//! In-memory EventStore implementation.
//!
//! Enforces the same optimistic-concurrency protocol as the networked
//! backends. Used by unit tests and local development.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::events::{ChangeEvent, StreamName};
use crate::store::{validate_batch, verify_next_version, EventStore, Result};

/// Event store keeping streams in process memory.
#[derive(Default)]
pub struct InMemoryEventStore {
    streams: RwLock<BTreeMap<String, Vec<ChangeEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn add_events(
        &self,
        entity_name: &str,
        entity_id: &str,
        mut events: Vec<ChangeEvent>,
    ) -> Result<StreamName> {
        let stream = StreamName::new(entity_name, entity_id)?;
        let next = validate_batch(&stream, &events)?;

        let mut streams = self.streams.write().await;
        let stored = streams.entry(stream.as_str().to_string()).or_default();

        let latest = stored.last().map(|e| e.version);
        verify_next_version(latest, next)?;

        let persisted_at = Utc::now();
        for event in &mut events {
            event.last_persisted_at_utc = Some(persisted_at);
        }

        debug!(
            stream = %stream,
            from_version = next,
            to_version = next + events.len() as u32 - 1,
            "Appended events"
        );

        stored.extend(events);
        Ok(stream)
    }

    async fn event_stream(&self, entity_name: &str, entity_id: &str) -> Result<Vec<ChangeEvent>> {
        let stream = StreamName::new(entity_name, entity_id)?;
        let streams = self.streams.read().await;
        Ok(streams.get(stream.as_str()).cloned().unwrap_or_default())
    }

    async fn last_version(&self, entity_name: &str, entity_id: &str) -> Result<Option<u32>> {
        let stream = StreamName::new(entity_name, entity_id)?;
        let streams = self.streams.read().await;
        Ok(streams
            .get(stream.as_str())
            .and_then(|events| events.last())
            .map(|e| e.version))
    }

    async fn destroy_all(&self, entity_name: &str) -> Result<()> {
        let mut streams = self.streams.write().await;
        streams.retain(|name, _| !StreamName::prefix_matches(name, entity_name));
        Ok(())
    }
}
