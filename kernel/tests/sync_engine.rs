use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use schemasync_kernel::adapters::memory::{ClusterFixture, InMemoryCluster};
use schemasync_kernel::adapters::SchemaTransport;
use schemasync_kernel::config::{AgreementTimeoutPolicy, SyncConfig};
use schemasync_kernel::events::{ChangeKind, SchemaChangeEvent};
use schemasync_kernel::schema::{NodeId, SchemaVersion};
use schemasync_kernel::session::{MetadataSession, SessionError};
use schemasync_kernel::statement::SchemaStatement;
use schemasync_kernel::sync::{RefreshError, SyncState};

fn config() -> SyncConfig {
    let mut config = SyncConfig::default_config();
    config.agreement.interval_ms = 5;
    config.agreement.max_interval_ms = 20;
    config.agreement.timeout_ms = 300;
    config.agreement.per_node_timeout_ms = 50;
    config.debounce.window_ms = 30;
    config.retry.initial_delay_ms = 5;
    config.retry.max_delay_ms = 20;
    config.fetch.request_timeout_ms = 100;
    config
}

fn create_keyspace(name: &str) -> SchemaStatement {
    SchemaStatement::CreateKeyspace {
        name: name.into(),
        replication: BTreeMap::from([("class".to_string(), "SimpleStrategy".to_string())]),
        durable_writes: true,
        graph_engine: None,
        if_not_exists: false,
    }
}

fn node(n: u8) -> NodeId {
    NodeId(format!("10.0.0.{n}"))
}

fn stale_version() -> SchemaVersion {
    SchemaVersion::from("stale")
}

async fn connect(cluster: &Arc<InMemoryCluster>, config: SyncConfig) -> MetadataSession {
    MetadataSession::connect(cluster.clone(), config).await.unwrap()
}

/// Poll `condition` until it holds or two seconds pass.
async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn concurrent_refreshes_share_one_cycle() {
    let cluster = Arc::new(InMemoryCluster::new(3));
    let session = connect(&cluster, config()).await;
    let cycles = session.refresh_cycles();
    let fetches = cluster.full_fetches();

    let results = join_all((0..8).map(|_| session.refresh_schema(false, None))).await;

    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
    }
    assert_eq!(session.refresh_cycles(), cycles + 1);
    assert_eq!(cluster.full_fetches(), fetches + 1);
}

#[tokio::test]
async fn refresh_without_changes_is_idempotent() {
    let cluster = Arc::new(InMemoryCluster::new(2));
    cluster.execute(&create_keyspace("ks")).await.unwrap();
    let session = connect(&cluster, config()).await;

    let a = session.refresh_schema(true, None).await.unwrap();
    let b = session.refresh_schema(true, None).await.unwrap();

    assert!(a.same_content(&b));
    assert!(b.sequence() > a.sequence());
    assert_eq!(a.version(), b.version());
}

#[tokio::test]
async fn caller_deadline_only_ends_that_callers_wait() {
    let cluster = Arc::new(InMemoryCluster::new(3));
    let session = connect(&cluster, config()).await;
    cluster.pin_version(&node(3), Some(stale_version()));

    let started = Instant::now();
    let err = session
        .refresh_schema(true, Some(Duration::from_millis(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, RefreshError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_millis(250));

    // The cycle carried on and degrades once the agreement timeout passes.
    let snapshot = timeout(Duration::from_secs(2), session.refresh_schema(true, None))
        .await
        .unwrap()
        .unwrap();
    assert!(snapshot.sequence() > 1);
}

#[tokio::test]
async fn agreement_timeout_fails_when_configured() {
    let cluster = Arc::new(InMemoryCluster::new(3));
    let mut config = config();
    config.agreement.timeout_ms = 50;
    config.agreement.on_timeout = AgreementTimeoutPolicy::Fail;
    let session = connect(&cluster, config).await;
    cluster.pin_version(&node(3), Some(stale_version()));

    let err = session.refresh_schema(true, None).await.unwrap_err();

    match err {
        RefreshError::AgreementTimeout(nodes) => assert_eq!(nodes, vec![node(3)]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(session.sync_state(), SyncState::Idle);
    assert_eq!(session.metadata().sequence(), 1);
}

#[tokio::test]
async fn unreachable_and_hung_nodes_are_excluded_from_agreement() {
    let cluster = Arc::new(InMemoryCluster::new(3));
    let session = connect(&cluster, config()).await;
    cluster.set_reachable(&node(2), false);
    cluster.set_response_delay(&node(3), Duration::from_secs(10));

    let snapshot = timeout(Duration::from_secs(1), session.refresh_schema(true, None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.version(), Some(cluster.schema_version()));
}

#[tokio::test]
async fn fetch_falls_back_when_control_node_hangs() {
    let cluster = Arc::new(InMemoryCluster::new(2));
    cluster.execute(&create_keyspace("ks")).await.unwrap();
    let session = connect(&cluster, config()).await;
    cluster.set_response_delay(&node(1), Duration::from_secs(10));

    let snapshot = timeout(Duration::from_secs(1), session.refresh_schema(false, None))
        .await
        .unwrap()
        .unwrap();
    assert!(snapshot.keyspace("ks").is_some());
}

#[tokio::test]
async fn malformed_rows_keep_previous_snapshot() {
    let cluster = Arc::new(InMemoryCluster::new(1));
    cluster.execute(&create_keyspace("ks")).await.unwrap();
    let session = connect(&cluster, config()).await;
    let fetches = cluster.full_fetches();

    let broken = serde_json::from_value(json!({ "keyspace_name": "broken" })).unwrap();
    cluster.put_keyspace_row("broken", broken);
    let err = session.refresh_schema(false, None).await.unwrap_err();

    assert!(matches!(err, RefreshError::Parse { attempts: 3, .. }));
    assert_eq!(cluster.full_fetches(), fetches + 3);
    assert_eq!(session.metadata().sequence(), 1);
    assert!(session.get_keyspace("ks").is_some());
    assert_eq!(session.sync_state(), SyncState::Idle);
}

#[tokio::test]
async fn connect_fails_when_no_node_answers() {
    let cluster = Arc::new(InMemoryCluster::new(2));
    cluster.set_reachable(&node(1), false);
    cluster.set_reachable(&node(2), false);

    let err = MetadataSession::connect(cluster, config()).await.err().unwrap();

    assert!(matches!(
        err,
        SessionError::Refresh(RefreshError::Unavailable { attempts: 3 })
    ));
}

#[tokio::test]
async fn pushed_events_refresh_only_the_changed_keyspace() {
    let cluster = Arc::new(InMemoryCluster::new(1));
    cluster.execute(&create_keyspace("existing")).await.unwrap();
    let session = connect(&cluster, config()).await;
    let full = cluster.full_fetches();

    cluster.execute(&create_keyspace("added")).await.unwrap();
    eventually(|| session.get_keyspace("added").is_some()).await;

    assert!(session.get_keyspace("existing").is_some());
    assert_eq!(cluster.full_fetches(), full);
    assert_eq!(cluster.targeted_fetches(), 1);
}

#[tokio::test]
async fn idle_pushed_event_is_not_held_for_the_window() {
    let cluster = Arc::new(InMemoryCluster::new(1));
    let config = SyncConfig::default_config();
    assert!(config.debounce.window() >= Duration::from_millis(1_000));
    let session = connect(&cluster, config).await;

    let started = Instant::now();
    cluster.execute(&create_keyspace("ks")).await.unwrap();
    eventually(|| session.get_keyspace("ks").is_some()).await;

    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn duplicate_events_are_coalesced() {
    let cluster = Arc::new(InMemoryCluster::new(3));
    cluster.set_propagation_delay(Duration::from_millis(30));
    cluster.set_duplicate_events(true);
    let session = connect(&cluster, config()).await;

    cluster.execute(&create_keyspace("ks")).await.unwrap();
    eventually(|| session.get_keyspace("ks").is_some()).await;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(session.refresh_cycles(), 2);
}

#[tokio::test]
async fn statement_and_its_pushed_event_share_one_cycle() {
    let cluster = Arc::new(InMemoryCluster::new(3));
    cluster.set_propagation_delay(Duration::from_millis(30));
    let session = connect(&cluster, config()).await;
    let cycles = session.refresh_cycles();

    let outcome = session.execute(&create_keyspace("ks")).await.unwrap();
    assert!(outcome.snapshot.keyspace("ks").is_some());
    sleep(Duration::from_millis(150)).await;

    assert_eq!(session.refresh_cycles(), cycles + 1);
}

#[tokio::test]
async fn event_bursts_widen_to_a_full_refresh() {
    let cluster = Arc::new(InMemoryCluster::new(3));
    let mut config = config();
    config.debounce.window_ms = 10_000;
    config.debounce.max_events = 3;
    let session = connect(&cluster, config).await;
    let full = cluster.full_fetches();
    // Keeps the first cycle waiting for agreement so later events join it.
    cluster.pin_version(&node(3), Some(stale_version()));

    cluster.push_event(SchemaChangeEvent::keyspace(ChangeKind::Updated, "a"));
    sleep(Duration::from_millis(20)).await;
    for name in ["b", "c"] {
        cluster.push_event(SchemaChangeEvent::keyspace(ChangeKind::Updated, name));
    }

    eventually(|| session.refresh_cycles() == 2 && session.sync_state() == SyncState::Idle).await;
    eventually(|| session.metadata().sequence() == 2).await;
    assert_eq!(cluster.full_fetches(), full + 1);
    assert_eq!(cluster.targeted_fetches(), 0);
}

#[tokio::test]
async fn dropped_keyspace_disappears() {
    let cluster = Arc::new(InMemoryCluster::new(1));
    cluster.execute(&create_keyspace("gone")).await.unwrap();
    let session = connect(&cluster, config()).await;
    assert!(session.get_keyspace("gone").is_some());

    cluster
        .execute(&SchemaStatement::DropKeyspace {
            name: "gone".into(),
            if_exists: false,
        })
        .await
        .unwrap();

    eventually(|| session.get_keyspace("gone").is_none()).await;
}

#[tokio::test]
async fn listeners_see_every_publish_in_order() {
    let cluster = Arc::new(InMemoryCluster::new(1));
    let session = connect(&cluster, config()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = session.on_metadata_changed(move |previous, next| {
        let _ = tx.send((previous.sequence(), next.sequence()));
    });

    for _ in 0..3 {
        session.refresh_schema(false, None).await.unwrap();
    }

    let mut last = 1;
    for _ in 0..3 {
        let (previous, next) = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(previous, last);
        assert!(next > previous);
        last = next;
    }
    assert_eq!(last, session.metadata().sequence());
}

#[tokio::test]
async fn refreshed_keyspaces_limit_the_snapshot() {
    let fixture: ClusterFixture = serde_json::from_value(json!({
        "nodes": ["10.0.0.1"],
        "keyspaces": [
            {"keyspace_name": "kept", "durable_writes": true, "replication": {}},
            {"keyspace_name": "skipped", "durable_writes": true, "replication": {}}
        ]
    }))
    .unwrap();
    let cluster = Arc::new(InMemoryCluster::from_fixture(fixture));
    let mut config = config();
    config.schema.refreshed_keyspaces = Some(BTreeSet::from(["kept".to_string()]));
    let session = connect(&cluster, config).await;

    assert!(session.get_keyspace("kept").is_some());
    assert!(session.get_keyspace("skipped").is_none());

    cluster.push_event(SchemaChangeEvent::keyspace(ChangeKind::Updated, "skipped"));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(session.refresh_cycles(), 1);
}

#[tokio::test]
async fn disabled_schema_metadata_ignores_pushed_events() {
    let cluster = Arc::new(InMemoryCluster::new(1));
    let mut config = config();
    config.schema.enabled = false;
    let session = connect(&cluster, config).await;

    cluster.execute(&create_keyspace("ks")).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(session.get_keyspace("ks").is_none());
    assert_eq!(session.refresh_cycles(), 1);

    session.refresh_schema(false, None).await.unwrap();
    assert!(session.get_keyspace("ks").is_some());
}

#[tokio::test]
async fn readers_keep_their_snapshot_across_refreshes() {
    let cluster = Arc::new(InMemoryCluster::new(1));
    let session = connect(&cluster, config()).await;
    let held = session.metadata();

    session.execute(&create_keyspace("ks")).await.unwrap();

    assert!(held.keyspace("ks").is_none());
    assert!(session.metadata().keyspace("ks").is_some());
}
