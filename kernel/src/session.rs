// Metadata Session
//
// Owns one synchronization pipeline for one cluster connection: the
// publisher, the engine, the debouncer task and the task forwarding pushed
// change events. Nothing here is global; every session is built explicitly
// and torn down with `shutdown` or on drop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::adapters::{SchemaTransport, TransportError};
use crate::config::{SchemaConfig, SyncConfig};
use crate::events::SchemaChangeEvent;
use crate::publish::{MetadataPublisher, Subscription};
use crate::schema::{KeyspaceDescriptor, MetadataSnapshot};
use crate::statement::SchemaStatement;
use crate::sync::{RefreshDebouncer, RefreshError, RefreshResult, SyncEngine, SyncState, Trigger};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The server refused the statement. Carries the server's message as is.
    #[error("{0}")]
    ServerRejected(String),

    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Rejected(message) => SessionError::ServerRejected(message),
            other => SessionError::Transport(other),
        }
    }
}

/// Result of a schema statement.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Change reported by the server, `None` for a no-op.
    pub change: Option<SchemaChangeEvent>,
    /// Snapshot that reflects the statement.
    pub snapshot: Arc<MetadataSnapshot>,
}

pub struct MetadataSession {
    transport: Arc<dyn SchemaTransport>,
    engine: Arc<SyncEngine>,
    debouncer: Arc<RefreshDebouncer>,
    publisher: Arc<MetadataPublisher>,
    schema: SchemaConfig,
    tasks: Vec<JoinHandle<()>>,
}

impl MetadataSession {
    /// Start the pipeline and load the initial schema.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn connect(
        transport: Arc<dyn SchemaTransport>,
        config: SyncConfig,
    ) -> Result<Self, SessionError> {
        let publisher = Arc::new(MetadataPublisher::default());
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&transport),
            Arc::clone(&publisher),
            config.clone(),
        ));
        let debouncer = Arc::new(RefreshDebouncer::new(config.debounce.clone()));

        // Subscribe before the first fetch so no change slips between them.
        let events = transport.subscribe();
        let tasks = vec![
            tokio::spawn(Arc::clone(&debouncer).run(Arc::clone(&engine))),
            tokio::spawn(forward_events(
                events,
                Arc::clone(&debouncer),
                config.schema.clone(),
            )),
        ];

        let session = Self {
            transport,
            engine,
            debouncer,
            publisher,
            schema: config.schema,
            tasks,
        };

        let snapshot = session.refresh_schema(false, None).await?;
        info!(
            sequence = snapshot.sequence(),
            keyspaces = snapshot.len(),
            "metadata session connected"
        );
        Ok(session)
    }

    /// Current snapshot. Never waits on a refresh.
    pub fn metadata(&self) -> Arc<MetadataSnapshot> {
        self.publisher.current()
    }

    pub fn get_keyspace(&self, name: &str) -> Option<KeyspaceDescriptor> {
        self.publisher.current().keyspace(name).cloned()
    }

    /// Re-read the whole schema.
    ///
    /// Joins a cycle already in progress when it can. `deadline` bounds
    /// only this caller's wait; the cycle keeps running for anyone else
    /// attached to it.
    pub async fn refresh_schema(
        &self,
        wait_for_agreement: bool,
        deadline: Option<Duration>,
    ) -> RefreshResult {
        let pending = self.debouncer.submit(Trigger::Explicit { wait_for_agreement });
        match deadline {
            Some(limit) => match timeout(limit, pending).await {
                Ok(result) => resolved(result),
                Err(_) => {
                    debug!(deadline = ?limit, "refresh wait abandoned");
                    Err(RefreshError::Timeout(limit))
                }
            },
            None => resolved(pending.await),
        }
    }

    /// Register `listener`, called with (previous, new) after every publish.
    pub fn on_metadata_changed<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<MetadataSnapshot>, &Arc<MetadataSnapshot>) + Send + Sync + 'static,
    {
        self.publisher.subscribe(listener)
    }

    /// Feed a change notification from a source other than the transport.
    pub fn notify(&self, event: SchemaChangeEvent) {
        submit_pushed(&self.debouncer, &self.schema, event);
    }

    /// Run `statement` and wait until the published metadata reflects it.
    ///
    /// A server rejection is returned unchanged and triggers no refresh.
    pub async fn execute(&self, statement: &SchemaStatement) -> Result<ExecutionOutcome, SessionError> {
        debug!(cql = %statement.to_cql(), "executing schema statement");
        let change = self.transport.execute(statement).await?;

        let snapshot = match &change {
            Some(event) => resolved(self.debouncer.submit(Trigger::Statement(event.clone())).await)?,
            None => self.metadata(),
        };
        Ok(ExecutionOutcome { change, snapshot })
    }

    pub fn sync_state(&self) -> SyncState {
        self.engine.state()
    }

    /// Refresh cycles run since the session started.
    pub fn refresh_cycles(&self) -> u64 {
        self.engine.cycles()
    }

    /// Stop the pipeline. Pending refreshes resolve with `Shutdown`.
    pub async fn shutdown(mut self) {
        self.debouncer.close();
        for task in std::mem::take(&mut self.tasks) {
            task.abort();
            let _ = task.await;
        }
        debug!("metadata session shut down");
    }
}

impl Drop for MetadataSession {
    fn drop(&mut self) {
        self.debouncer.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn resolved(result: Result<RefreshResult, oneshot::error::RecvError>) -> RefreshResult {
    result.unwrap_or(Err(RefreshError::Shutdown))
}

fn submit_pushed(debouncer: &RefreshDebouncer, schema: &SchemaConfig, event: SchemaChangeEvent) {
    if !schema.enabled {
        debug!(keyspace = %event.keyspace, "schema metadata disabled, ignoring change event");
        return;
    }
    if !schema.includes(&event.keyspace) {
        debug!(keyspace = %event.keyspace, "keyspace not refreshed, ignoring change event");
        return;
    }
    drop(debouncer.submit(Trigger::Pushed(event)));
}

async fn forward_events(
    mut events: broadcast::Receiver<SchemaChangeEvent>,
    debouncer: Arc<RefreshDebouncer>,
    schema: SchemaConfig,
) {
    loop {
        match events.recv().await {
            Ok(event) => submit_pushed(&debouncer, &schema, event),
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "schema change events dropped, scheduling full refresh");
                if schema.enabled {
                    drop(debouncer.submit(Trigger::Explicit {
                        wait_for_agreement: true,
                    }));
                }
            }
            Err(RecvError::Closed) => {
                debug!("schema change event source closed");
                break;
            }
        }
    }
}
