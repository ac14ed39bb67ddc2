//! Event stream persistence.
//!
//! This module contains:
//! - `EventStore` trait: append/read operations per aggregate stream
//! - `StoreError` / `ConcurrencyConflict`: classified failure surface
//! - Implementations: EventStoreDB, in-memory

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{StoreConfig, StoreType};
use crate::events::{ChangeEvent, StreamName};

pub mod concurrency;
pub mod memory;

#[cfg(feature = "eventstoredb")]
pub mod esdb;

pub use concurrency::{verify_next_version, ConcurrencyConflict};
pub use memory::InMemoryEventStore;

#[cfg(feature = "eventstoredb")]
pub use esdb::EsdbEventStore;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency conflict; safe to retry with fresh state.
    #[error("concurrency conflict: {0}")]
    Concurrency(#[from] ConcurrencyConflict),

    /// Caller-side programming error, raised before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other backend failure.
    #[error("event store error: {0}")]
    Backend(String),
}

impl From<crate::events::InvalidStreamName> for StoreError {
    fn from(err: crate::events::InvalidStreamName) -> Self {
        StoreError::InvalidArgument(err.to_string())
    }
}

/// Interface for per-aggregate event stream persistence.
///
/// Implementations:
/// - `EsdbEventStore`: EventStoreDB
/// - `InMemoryEventStore`: in-process, for tests and local development
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a batch of change events to an aggregate's stream.
    ///
    /// The batch must be non-empty and contiguous in version, and its
    /// first version must be the successor of the stream's actual last
    /// version (or [`crate::events::FIRST_VERSION`] on a new stream);
    /// anything else is a [`ConcurrencyConflict`]. The append is atomic:
    /// a rejected batch writes nothing.
    async fn add_events(
        &self,
        entity_name: &str,
        entity_id: &str,
        events: Vec<ChangeEvent>,
    ) -> Result<StreamName>;

    /// Read an aggregate's full stream in version order.
    ///
    /// A stream that has never been written returns an empty list, not an
    /// error.
    async fn event_stream(&self, entity_name: &str, entity_id: &str) -> Result<Vec<ChangeEvent>>;

    /// Version of the last stored event, `None` for an unwritten stream.
    async fn last_version(&self, entity_name: &str, entity_id: &str) -> Result<Option<u32>>;

    /// Remove every stream belonging to the entity. Test/maintenance only.
    async fn destroy_all(&self, entity_name: &str) -> Result<()>;
}

/// Validate an append batch before touching the backend.
///
/// Checks the batch is non-empty and contiguous in version; returns the
/// first version of the batch.
pub(crate) fn validate_batch(stream: &StreamName, events: &[ChangeEvent]) -> Result<u32> {
    let first = events.first().ok_or_else(|| {
        StoreError::InvalidArgument(format!("empty event batch for stream '{stream}'"))
    })?;

    for (offset, event) in events.iter().enumerate() {
        let expected = first.version + offset as u32;
        if event.version != expected {
            return Err(StoreError::InvalidArgument(format!(
                "event batch for stream '{stream}' is not contiguous: \
                 position {offset} has version {actual}, expected {expected}",
                actual = event.version,
            )));
        }
    }

    Ok(first.version)
}

/// Initialize an event store from configuration.
pub async fn init_store(
    config: &StoreConfig,
) -> std::result::Result<Arc<dyn EventStore>, Box<dyn std::error::Error + Send + Sync>> {
    match config.store_type {
        StoreType::Memory => {
            info!(store_type = "memory", "Event store initialized");
            Ok(Arc::new(InMemoryEventStore::new()))
        }
        StoreType::Eventstoredb => {
            #[cfg(feature = "eventstoredb")]
            {
                let store = EsdbEventStore::new(&config.eventstoredb.connection_string)?;
                info!(
                    store_type = "eventstoredb",
                    "Event store initialized"
                );
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "eventstoredb"))]
            {
                Err("EventStoreDB support requires the 'eventstoredb' feature. \
                     Rebuild with --features eventstoredb"
                    .into())
            }
        }
    }
}
