use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use schemasync_kernel::adapters::memory::InMemoryCluster;
use schemasync_kernel::config::SyncConfig;
use schemasync_kernel::session::{MetadataSession, SessionError};
use schemasync_kernel::statement::SchemaStatement;

fn config() -> SyncConfig {
    let mut config = SyncConfig::default_config();
    config.agreement.interval_ms = 10;
    config.agreement.max_interval_ms = 20;
    config.agreement.timeout_ms = 2_000;
    config.debounce.window_ms = 20;
    config
}

fn replication() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("class".to_string(), "SimpleStrategy".to_string()),
        ("replication_factor".to_string(), "1".to_string()),
    ])
}

fn create_keyspace(name: &str, graph_engine: Option<&str>) -> SchemaStatement {
    SchemaStatement::CreateKeyspace {
        name: name.into(),
        replication: replication(),
        durable_writes: true,
        graph_engine: graph_engine.map(String::from),
        if_not_exists: false,
    }
}

fn set_graph_engine(name: &str, engine: &str) -> SchemaStatement {
    SchemaStatement::AlterKeyspace {
        name: name.into(),
        replication: None,
        durable_writes: None,
        graph_engine: Some(engine.into()),
    }
}

/// Three nodes where followers see schema changes 30ms after the coordinator.
async fn lagging_session() -> MetadataSession {
    let cluster = Arc::new(InMemoryCluster::new(3));
    cluster.set_propagation_delay(Duration::from_millis(30));
    MetadataSession::connect(cluster, config()).await.unwrap()
}

#[tokio::test]
async fn should_not_expose_graph_engine_if_not_set() {
    let session = lagging_session().await;

    session.execute(&create_keyspace("ks_plain", None)).await.unwrap();

    let keyspace = session.get_keyspace("ks_plain").unwrap();
    assert_eq!(keyspace.graph_engine(), None);
}

#[tokio::test]
async fn should_expose_graph_engine_if_set() {
    let session = lagging_session().await;

    let outcome = session.execute(&create_keyspace("ks_core", Some("Core"))).await.unwrap();

    assert_eq!(
        outcome.snapshot.keyspace("ks_core").and_then(|k| k.graph_engine()),
        Some("Core")
    );
    let keyspace = session.get_keyspace("ks_core").unwrap();
    assert_eq!(keyspace.graph_engine(), Some("Core"));
}

#[tokio::test]
async fn should_expose_graph_engine_if_keyspace_altered() {
    let session = lagging_session().await;
    session.execute(&create_keyspace("ks_altered", None)).await.unwrap();
    assert_eq!(session.get_keyspace("ks_altered").unwrap().graph_engine(), None);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = session.on_metadata_changed(move |_, next| {
        let engine = next
            .keyspace("ks_altered")
            .and_then(|k| k.graph_engine())
            .map(String::from);
        let _ = tx.send(engine);
    });

    session.execute(&set_graph_engine("ks_altered", "Core")).await.unwrap();
    assert_eq!(
        session.get_keyspace("ks_altered").unwrap().graph_engine(),
        Some("Core")
    );

    // Every published value is either the old one or "Core", and once
    // "Core" shows up it stays.
    let mut seen_core = false;
    while let Ok(Some(engine)) = timeout(Duration::from_millis(200), rx.recv()).await {
        match engine.as_deref() {
            None => assert!(!seen_core, "graph engine went back to unset"),
            Some("Core") => seen_core = true,
            Some(other) => panic!("unexpected graph engine {other}"),
        }
    }
    assert!(seen_core);
}

#[tokio::test]
async fn should_fail_if_graph_engine_not_supported() {
    let session = lagging_session().await;
    let before = session.metadata();

    let err = session
        .execute(&create_keyspace("ks_classic", Some("Classic")))
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::ServerRejected(_)));
    assert!(err
        .to_string()
        .contains("Invalid/unknown graph engine name 'Classic'"));
    assert!(session.get_keyspace("ks_classic").is_none());
    assert_eq!(session.metadata().sequence(), before.sequence());
}

#[tokio::test]
async fn should_keep_graph_engine_when_alter_is_rejected() {
    let session = lagging_session().await;
    session.execute(&create_keyspace("ks_kept", None)).await.unwrap();

    let err = session
        .execute(&set_graph_engine("ks_kept", "Classic"))
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "Invalid/unknown graph engine name 'Classic'"
    );
    assert_eq!(session.get_keyspace("ks_kept").unwrap().graph_engine(), None);
}
