// Synchronization Engine
//
// Runs one refresh cycle at a time: optionally wait for schema agreement,
// fetch and parse rows, publish the new snapshot. Parse and fetch failures
// are retried inside the cycle with backoff before being surfaced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use super::debounce::{RefreshRequest, RefreshScope};
use super::state::{StateError, SyncEvent, SyncState, SyncStateMachine};
use crate::adapters::SchemaTransport;
use crate::agreement::{AgreementChecker, AgreementOutcome};
use crate::backoff::Backoff;
use crate::config::{AgreementTimeoutPolicy, SyncConfig};
use crate::fetch::{FetchError, SchemaFetcher};
use crate::invariants::InvariantViolation;
use crate::publish::MetadataPublisher;
use crate::schema::parse::SchemaParseError;
use crate::schema::{MetadataSnapshot, NodeId};

/// Outcome delivered to every caller attached to a cycle.
pub type RefreshResult = Result<Arc<MetadataSnapshot>, RefreshError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    /// The caller's own deadline passed. The cycle itself keeps running.
    #[error("schema refresh did not complete within {0:?}")]
    Timeout(Duration),

    #[error("schema rows could not be parsed after {attempts} attempt(s): {source}")]
    Parse {
        attempts: u32,
        #[source]
        source: SchemaParseError,
    },

    #[error("no node could serve schema rows after {attempts} attempt(s)")]
    Unavailable { attempts: u32 },

    /// Only raised when the agreement policy is `fail`.
    #[error("schema agreement not reached, disagreeing nodes: {0:?}")]
    AgreementTimeout(Vec<NodeId>),

    #[error("snapshot rejected: {0}")]
    Rejected(#[from] InvariantViolation),

    #[error("state machine error: {0}")]
    State(#[from] StateError),

    #[error("metadata session shut down before the refresh completed")]
    Shutdown,
}

pub struct SyncEngine {
    transport: Arc<dyn SchemaTransport>,
    checker: AgreementChecker,
    fetcher: SchemaFetcher,
    publisher: Arc<MetadataPublisher>,
    machine: Mutex<SyncStateMachine>,
    config: SyncConfig,
    cycles: AtomicU64,
}

impl SyncEngine {
    pub fn new(
        transport: Arc<dyn SchemaTransport>,
        publisher: Arc<MetadataPublisher>,
        config: SyncConfig,
    ) -> Self {
        Self {
            checker: AgreementChecker::new(Arc::clone(&transport), config.agreement.clone()),
            fetcher: SchemaFetcher::new(Arc::clone(&transport), config.fetch.request_timeout()),
            transport,
            publisher,
            machine: Mutex::new(SyncStateMachine::new()),
            config,
            cycles: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SyncState {
        self.machine.lock().current_state().clone()
    }

    /// Refresh cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Run one cycle for `initial`.
    ///
    /// `begin_fetch` is called once agreement is settled and returns the
    /// request to fetch with; triggers may have widened it meanwhile.
    pub async fn run_cycle<F>(&self, initial: &RefreshRequest, begin_fetch: F) -> RefreshResult
    where
        F: Fn() -> RefreshRequest,
    {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        self.ensure_idle();

        let mut nodes = self.transport.nodes();
        self.transition(SyncEvent::Triggered {
            wait_for_agreement: initial.wait_for_agreement,
        })?;

        if initial.wait_for_agreement {
            match self.checker.wait_for_agreement(self.config.agreement.timeout()).await {
                AgreementOutcome::Agreed(version) => {
                    debug!(cycle, version = %version, "schema agreed");
                    self.transition(SyncEvent::AgreementReached)?;
                }
                AgreementOutcome::TimedOut(report) => {
                    nodes = report.preferred_order(&nodes);
                    if self.config.agreement.on_timeout == AgreementTimeoutPolicy::Fail {
                        return self.fail(RefreshError::AgreementTimeout(report.disagreeing()));
                    }
                    info!(cycle, "fetching schema without agreement");
                    self.transition(SyncEvent::AgreementTimedOut)?;
                }
            }
        }

        let request = begin_fetch();
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut retry = Backoff::for_retry(&self.config.retry);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.build_snapshot(&request, &nodes).await {
                Ok(snapshot) => {
                    self.transition(SyncEvent::RowsReady)?;
                    return match self.publisher.publish(snapshot) {
                        Ok(published) => {
                            self.transition(SyncEvent::Published)?;
                            info!(
                                cycle,
                                sequence = published.sequence(),
                                keyspaces = published.len(),
                                "schema metadata refreshed"
                            );
                            Ok(published)
                        }
                        Err(violation) => self.fail(violation.into()),
                    };
                }
                Err(FetchError::Parse(source)) => RefreshError::Parse {
                    attempts: attempt,
                    source,
                },
                Err(FetchError::NoReachableNode { .. }) => RefreshError::Unavailable { attempts: attempt },
            };

            if attempt >= max_attempts {
                warn!(cycle, error = %error, "schema refresh failed");
                return self.fail(error);
            }

            self.transition(SyncEvent::Failed(error.to_string()))?;
            self.transition(SyncEvent::Recovered)?;

            let delay = retry.next_delay();
            warn!(
                cycle,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "schema refresh attempt failed, retrying"
            );
            sleep(delay).await;
            self.transition(SyncEvent::Triggered {
                wait_for_agreement: false,
            })?;
        }
    }

    async fn build_snapshot(
        &self,
        request: &RefreshRequest,
        nodes: &[NodeId],
    ) -> Result<MetadataSnapshot, FetchError> {
        let previous = self.publisher.current();
        let filter = &self.config.schema;

        let (version, keyspaces) = match &request.scope {
            RefreshScope::Full => {
                let fetched = self.fetcher.fetch_all(nodes).await?;
                let keyspaces = fetched
                    .keyspaces
                    .into_iter()
                    .filter(|(name, _)| filter.includes(name))
                    .collect();
                (fetched.version, keyspaces)
            }
            RefreshScope::Keyspaces(names) => {
                let names: Vec<&String> = names.iter().filter(|name| filter.includes(name)).collect();
                let fetches = names
                    .iter()
                    .map(|name| self.fetcher.fetch_keyspace(name.as_str(), nodes));
                let results = join_all(fetches).await;

                let mut keyspaces = previous.keyspaces().clone();
                let mut version = previous.version();
                for (name, result) in names.into_iter().zip(results) {
                    let mut fetched = result?;
                    version = fetched.version.or(version);
                    match fetched.keyspaces.remove(name) {
                        Some(keyspace) => {
                            keyspaces.insert(name.clone(), keyspace);
                        }
                        None => {
                            trace!(keyspace = %name, "keyspace no longer exists");
                            keyspaces.remove(name);
                        }
                    }
                }
                (version, keyspaces)
            }
        };

        Ok(MetadataSnapshot::new(previous.sequence() + 1, version, keyspaces))
    }

    fn fail(&self, error: RefreshError) -> RefreshResult {
        self.transition(SyncEvent::Failed(error.to_string()))?;
        self.transition(SyncEvent::Recovered)?;
        Err(error)
    }

    fn transition(&self, event: SyncEvent) -> Result<(), StateError> {
        let mut machine = self.machine.lock();
        machine.apply(&event)?;
        trace!(state = ?machine.current_state(), "sync state changed");
        Ok(())
    }

    /// A cycle abandoned mid-way (its task was cancelled) leaves the
    /// machine outside `Idle`; start the next one from scratch.
    fn ensure_idle(&self) {
        let mut machine = self.machine.lock();
        if machine.current_state() != &SyncState::Idle {
            warn!(state = ?machine.current_state(), "resetting abandoned refresh cycle");
            *machine = SyncStateMachine::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryCluster;
    use crate::config::RetryConfig;
    use crate::schema::SchemaVersion;
    use crate::statement::SchemaStatement;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn fast_config() -> SyncConfig {
        let mut config = SyncConfig::default_config();
        config.agreement.interval_ms = 5;
        config.agreement.max_interval_ms = 10;
        config.agreement.timeout_ms = 100;
        config.agreement.per_node_timeout_ms = 50;
        config.retry = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 5,
            max_delay_ms: 10,
            multiplier: 2.0,
            jitter: false,
        };
        config
    }

    fn engine(cluster: &Arc<InMemoryCluster>, config: SyncConfig) -> SyncEngine {
        SyncEngine::new(cluster.clone(), Arc::new(MetadataPublisher::default()), config)
    }

    async fn create(cluster: &InMemoryCluster, name: &str) {
        cluster
            .execute(&SchemaStatement::CreateKeyspace {
                name: name.into(),
                replication: BTreeMap::new(),
                durable_writes: true,
                graph_engine: None,
                if_not_exists: false,
            })
            .await
            .unwrap();
    }

    fn stale_version() -> SchemaVersion {
        SchemaVersion::from("stale")
    }

    async fn run(engine: &SyncEngine, request: RefreshRequest) -> RefreshResult {
        engine.run_cycle(&request, || request.clone()).await
    }

    #[tokio::test]
    async fn full_cycle_publishes_and_returns_to_idle() {
        let cluster = Arc::new(InMemoryCluster::new(2));
        create(&cluster, "ks").await;
        let engine = engine(&cluster, fast_config());

        let snapshot = run(&engine, RefreshRequest::full(true)).await.unwrap();

        assert_eq!(snapshot.sequence(), 1);
        assert_eq!(snapshot.version(), Some(cluster.schema_version()));
        assert!(snapshot.keyspace("ks").is_some());
        assert_eq!(engine.state(), SyncState::Idle);
        assert_eq!(engine.cycles(), 1);
    }

    #[tokio::test]
    async fn targeted_cycle_merges_into_previous_snapshot() {
        let cluster = Arc::new(InMemoryCluster::new(1));
        create(&cluster, "a").await;
        create(&cluster, "b").await;
        let engine = engine(&cluster, fast_config());
        run(&engine, RefreshRequest::full(false)).await.unwrap();

        cluster
            .execute(&SchemaStatement::DropKeyspace {
                name: "a".into(),
                if_exists: false,
            })
            .await
            .unwrap();
        let snapshot = run(&engine, RefreshRequest::keyspace("a")).await.unwrap();

        assert_eq!(snapshot.keyspace_names().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(cluster.full_fetches(), 1);
        assert_eq!(cluster.targeted_fetches(), 1);
    }

    #[tokio::test]
    async fn agreement_timeout_degrades_by_default() {
        let cluster = Arc::new(InMemoryCluster::new(3));
        create(&cluster, "ks").await;
        cluster.pin_version(&NodeId::from("10.0.0.3"), Some(stale_version()));
        let engine = engine(&cluster, fast_config());

        let snapshot = run(&engine, RefreshRequest::full(true)).await.unwrap();
        assert!(snapshot.keyspace("ks").is_some());
    }

    #[tokio::test]
    async fn agreement_timeout_can_fail() {
        let cluster = Arc::new(InMemoryCluster::new(3));
        cluster.pin_version(&NodeId::from("10.0.0.3"), Some(stale_version()));
        let mut config = fast_config();
        config.agreement.on_timeout = AgreementTimeoutPolicy::Fail;
        let engine = engine(&cluster, config);

        let err = run(&engine, RefreshRequest::full(true)).await.unwrap_err();
        match err {
            RefreshError::AgreementTimeout(nodes) => assert_eq!(nodes, vec![NodeId::from("10.0.0.3")]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn parse_errors_are_retried_then_surfaced() {
        let cluster = Arc::new(InMemoryCluster::new(1));
        let broken = serde_json::from_value(json!({"keyspace_name": "broken"})).unwrap();
        cluster.put_keyspace_row("broken", broken);
        let engine = engine(&cluster, fast_config());

        let err = run(&engine, RefreshRequest::full(false)).await.unwrap_err();

        assert!(matches!(err, RefreshError::Parse { attempts: 3, .. }));
        assert_eq!(cluster.full_fetches(), 3);
        assert_eq!(engine.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn keyspace_filter_limits_snapshot() {
        let cluster = Arc::new(InMemoryCluster::new(1));
        create(&cluster, "kept").await;
        create(&cluster, "ignored").await;
        let mut config = fast_config();
        config.schema.refreshed_keyspaces = Some(BTreeSet::from(["kept".to_string()]));
        let engine = engine(&cluster, config);

        let snapshot = run(&engine, RefreshRequest::full(false)).await.unwrap();
        assert_eq!(snapshot.keyspace_names().collect::<Vec<_>>(), vec!["kept"]);
    }
}
