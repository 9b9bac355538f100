//! End-to-end marker sync between clients sharing an in-memory broker.

use roadwatch::codec;
use roadwatch::config::{SyncConfig, TopicConfig};
use roadwatch::marker::{Marker, MarkerType};
use roadwatch::presentation;
use roadwatch::store::{MarkerStore, ReconcilePolicy, StoreEvent};
use roadwatch::sync::{ApprovalOutcome, ConnectionState, SyncEngine};
use roadwatch::transport::{MemoryBroker, MemoryTransport};
use std::sync::Arc;
use std::time::Duration;

struct Client {
    engine: Arc<SyncEngine>,
    transport: Arc<MemoryTransport>,
}

impl Client {
    async fn connect(broker: &MemoryBroker, policy: ReconcilePolicy) -> Self {
        let transport = Arc::new(broker.transport());
        let config = SyncConfig {
            policy,
            publish_retry_delay_ms: 0,
            ..SyncConfig::default()
        };
        let engine = SyncEngine::new(
            transport.clone(),
            Arc::new(MarkerStore::new()),
            TopicConfig::default(),
            config,
        )
        .unwrap();
        engine.start().await.unwrap();
        Self { engine, transport }
    }

    fn store(&self) -> &MarkerStore {
        self.engine.store()
    }

    fn count_of(&self, marker: &Marker) -> Option<u64> {
        self.store().get(&marker.key()).map(|m| m.approve_count)
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn main_st() -> Marker {
    Marker::new("Main St", 37.5665, 126.978, MarkerType::Hazard)
}

#[tokio::test]
async fn announced_marker_is_approved_once_everywhere() {
    let broker = MemoryBroker::new();
    let alice = Client::connect(&broker, ReconcilePolicy::LastWriteWins).await;
    let bob = Client::connect(&broker, ReconcilePolicy::LastWriteWins).await;

    alice.engine.announce(&main_st()).await.unwrap();
    eventually(|| alice.count_of(&main_st()) == Some(0) && bob.count_of(&main_st()) == Some(0)).await;

    let outcome = bob.engine.approve(&main_st()).await;
    assert_eq!(outcome, ApprovalOutcome::Published(main_st().with_approve_count(1)));

    let published = broker.published_on("ApproveWORLD");
    assert_eq!(published.len(), 1);
    assert_eq!(codec::decode(&published[0]).unwrap().approve_count, 1);

    eventually(|| alice.count_of(&main_st()) == Some(1) && bob.count_of(&main_st()) == Some(1)).await;
    assert_eq!(alice.store().len(), 1);
    assert!(bob.engine.pending_approvals().is_empty());

    let items = presentation::list_items(bob.store());
    assert_eq!(items[0].description, "Approved by 1 people");
    assert_eq!(items[0].icon.name(), "alert");
}

#[tokio::test]
async fn concurrent_approvals_converge_on_single_increment() {
    let broker = MemoryBroker::new();
    let alice = Client::connect(&broker, ReconcilePolicy::LastWriteWins).await;
    let bob = Client::connect(&broker, ReconcilePolicy::LastWriteWins).await;

    alice.engine.announce(&main_st()).await.unwrap();
    eventually(|| alice.count_of(&main_st()) == Some(0) && bob.count_of(&main_st()) == Some(0)).await;

    // Both approve from count 0 before seeing each other's event.
    alice.engine.approve(&main_st()).await;
    bob.engine.approve(&main_st()).await;

    assert_eq!(broker.published_on("ApproveWORLD").len(), 2);
    eventually(|| alice.count_of(&main_st()) == Some(1) && bob.count_of(&main_st()) == Some(1)).await;
}

#[tokio::test]
async fn reordered_approvals_depend_on_policy() {
    let broker = MemoryBroker::new();
    let lww = Client::connect(&broker, ReconcilePolicy::LastWriteWins).await;
    let max = Client::connect(&broker, ReconcilePolicy::MaxApprovals).await;

    for count in [4, 3] {
        broker.inject("ApproveWORLD", &codec::encode(&main_st().with_approve_count(count)));
    }

    eventually(|| lww.count_of(&main_st()) == Some(3)).await;
    eventually(|| max.count_of(&main_st()) == Some(4)).await;
}

#[tokio::test]
async fn duplicate_delivery_leaves_one_entry() {
    let broker = MemoryBroker::new();
    let client = Client::connect(&broker, ReconcilePolicy::LastWriteWins).await;
    let payload = codec::encode(&main_st().with_approve_count(2));

    broker.inject("WORLD", &payload);
    broker.inject("WORLD", &payload);
    broker.inject("WORLD", b"not json");

    let metrics = client.engine.metrics();
    eventually(|| metrics.decode_failures.get() == 1).await;
    assert_eq!(client.store().len(), 1);
    assert_eq!(client.count_of(&main_st()), Some(2));
}

#[tokio::test]
async fn rolled_back_approval_keeps_marker_visible() {
    let broker = MemoryBroker::new();
    let client = Client::connect(&broker, ReconcilePolicy::LastWriteWins).await;
    broker.inject("WORLD", &codec::encode(&main_st()));
    eventually(|| client.count_of(&main_st()) == Some(0)).await;

    client.transport.fail_next_publishes(10);
    let outcome = client.engine.approve(&main_st()).await;

    assert_eq!(outcome, ApprovalOutcome::RolledBack(main_st()));
    assert_eq!(client.count_of(&main_st()), Some(0));
    assert!(broker.published_on("ApproveWORLD").is_empty());
}

#[tokio::test]
async fn reconnect_resumes_without_losing_markers() {
    let broker = MemoryBroker::new();
    let client = Client::connect(&broker, ReconcilePolicy::LastWriteWins).await;
    let mut state = client.engine.watch_state();
    broker.inject("WORLD", &codec::encode(&main_st()));
    eventually(|| client.store().len() == 1).await;

    client.transport.sever();
    state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert_eq!(client.store().len(), 1);

    // Nothing reaches a disconnected client.
    assert_eq!(broker.inject("WORLD", &codec::encode(&Marker::new("Elm St", 1.0, 2.0, MarkerType::Safe))), 0);

    client.transport.refuse_next_connects(1);
    client.engine.start_with_backoff().await.unwrap();
    assert!(client.engine.is_connected());

    broker.inject("WORLD", &codec::encode(&Marker::new("Oak Ave", 3.0, 4.0, MarkerType::Construction)));
    eventually(|| client.store().len() == 2).await;
}

#[tokio::test]
async fn store_observers_see_sync_changes() {
    let broker = MemoryBroker::new();
    let client = Client::connect(&broker, ReconcilePolicy::LastWriteWins).await;
    let mut events = client.store().subscribe();

    broker.inject("WORLD", &codec::encode(&main_st()));
    match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Ok(StoreEvent::Upserted(marker))) => assert_eq!(marker, main_st()),
        other => panic!("expected upsert, got {other:?}"),
    }

    client.engine.approve(&main_st()).await;
    match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Ok(StoreEvent::Removed(marker))) => assert_eq!(marker, main_st()),
        other => panic!("expected removal, got {other:?}"),
    }
}
