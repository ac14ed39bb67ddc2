//! EventStoreDB integration tests.
//!
//! Run with: EVENT_RELAY_ESDB_URL=esdb://localhost:2113?tls=false \
//!   cargo test --test store_eventstoredb -- --ignored

#![cfg(feature = "eventstoredb")]

use event_relay::events::{ChangeEvent, EventMetadata};
use event_relay::store::{ConcurrencyConflict, EsdbEventStore, EventStore, StoreError};

fn esdb_url() -> String {
    std::env::var("EVENT_RELAY_ESDB_URL")
        .unwrap_or_else(|_| "esdb://localhost:2113?tls=false".to_string())
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

fn change_event(version: u32) -> ChangeEvent {
    ChangeEvent {
        id: uuid::Uuid::new_v4().to_string(),
        entity_type: "widget".to_string(),
        event_type: "widget.Tested".to_string(),
        data: format!("{{\"version\":{version}}}"),
        metadata: serde_json::to_string(&EventMetadata::new("widget.Tested")).unwrap(),
        version,
        is_tombstone: false,
        last_persisted_at_utc: None,
    }
}

fn batch(versions: std::ops::RangeInclusive<u32>) -> Vec<ChangeEvent> {
    versions.map(change_event).collect()
}

fn conflict_of(err: StoreError) -> ConcurrencyConflict {
    match err {
        StoreError::Concurrency(conflict) => conflict,
        other => panic!("expected concurrency conflict, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "Requires EventStoreDB"]
async fn append_read_conflict_scenario() {
    init_logging();
    let store = EsdbEventStore::new(&esdb_url()).expect("connection string parses");

    // Fresh id per run so reruns do not collide with old streams.
    let entity_id = uuid::Uuid::new_v4().simple().to_string();

    let stream = store
        .add_events("widget", &entity_id, batch(1..=3))
        .await
        .unwrap();
    assert_eq!(stream.as_str(), format!("widget_{entity_id}"));

    let events = store.event_stream("widget", &entity_id).await.unwrap();
    assert_eq!(
        events.iter().map(|e| e.version).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(events.iter().all(|e| e.last_persisted_at_utc.is_some()));
    assert_eq!(store.last_version("widget", &entity_id).await.unwrap(), Some(3));

    // Stale append.
    let stale = conflict_of(
        store
            .add_events("widget", &entity_id, batch(2..=2))
            .await
            .unwrap_err(),
    );
    assert!(matches!(stale, ConcurrencyConflict::AlreadyUpdated { latest: 3, next: 2 }));

    // Skipped-ahead append.
    let gap = conflict_of(
        store
            .add_events("widget", &entity_id, batch(5..=5))
            .await
            .unwrap_err(),
    );
    assert!(matches!(gap, ConcurrencyConflict::MissingUpdates { latest: 3, next: 5 }));

    // Contiguous append still succeeds after the rejections.
    store
        .add_events("widget", &entity_id, batch(4..=4))
        .await
        .unwrap();
    let events = store.event_stream("widget", &entity_id).await.unwrap();
    assert_eq!(events.len(), 4);
}

#[tokio::test]
#[ignore = "Requires EventStoreDB"]
async fn unwritten_stream_reads_empty() {
    init_logging();
    let store = EsdbEventStore::new(&esdb_url()).unwrap();

    let entity_id = uuid::Uuid::new_v4().simple().to_string();
    let events = store.event_stream("widget", &entity_id).await.unwrap();
    assert!(events.is_empty());
    assert_eq!(store.last_version("widget", &entity_id).await.unwrap(), None);
}

#[tokio::test]
#[ignore = "Requires EventStoreDB"]
async fn first_append_must_start_at_version_one() {
    init_logging();
    let store = EsdbEventStore::new(&esdb_url()).unwrap();

    let entity_id = uuid::Uuid::new_v4().simple().to_string();
    let reset = conflict_of(
        store
            .add_events("widget", &entity_id, batch(5..=5))
            .await
            .unwrap_err(),
    );
    assert!(matches!(reset, ConcurrencyConflict::StreamReset { next: 5 }));
}

#[tokio::test]
#[ignore = "Requires EventStoreDB ($streams projection enabled)"]
async fn destroy_all_removes_entity_streams() {
    init_logging();
    let store = EsdbEventStore::new(&esdb_url()).unwrap();

    // Entity name unique per run: destroy-all walks every stream under it.
    let entity = format!("scrap{}", uuid::Uuid::new_v4().simple());
    store.add_events(&entity, "a", batch(1..=2)).await.unwrap();
    store.add_events(&entity, "b", batch(1..=1)).await.unwrap();

    store.destroy_all(&entity).await.unwrap();

    assert!(store.event_stream(&entity, "a").await.unwrap().is_empty());
    assert!(store.event_stream(&entity, "b").await.unwrap().is_empty());
}
