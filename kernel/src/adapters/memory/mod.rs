// In-Memory Cluster Adapter
//
// A transport backed by per-node copies of the schema tables. Statements
// are applied to the coordinator first and gossiped to the other nodes,
// optionally with a delay. Nodes can be partitioned (stop receiving
// schema), made unreachable, slowed down, or pinned to a version so they
// never agree.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{SchemaQuery, SchemaTransport, TransportError};
use crate::events::{ChangeKind, ChangeTarget, SchemaChangeEvent};
use crate::schema::parse::Row;
use crate::schema::{NodeId, ObjectKind, SchemaVersion};
use crate::statement::SchemaStatement;

/// Graph engines the simulated server accepts.
pub const RECOGNIZED_GRAPH_ENGINES: &[&str] = &["Core"];

/// Serialized starting state of a cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterFixture {
    pub nodes: Vec<NodeId>,
    #[serde(default)]
    pub keyspaces: Vec<Row>,
    #[serde(default)]
    pub objects: BTreeMap<ObjectKind, Vec<Row>>,
    #[serde(default)]
    pub unreachable: Vec<NodeId>,
}

#[derive(Debug, Clone)]
struct SchemaTables {
    version: SchemaVersion,
    keyspaces: BTreeMap<String, Row>,
    objects: BTreeMap<ObjectKind, Vec<Row>>,
}

impl SchemaTables {
    fn empty() -> Self {
        Self {
            version: fresh_version(),
            keyspaces: BTreeMap::new(),
            objects: BTreeMap::new(),
        }
    }

    fn has_object(&self, kind: ObjectKind, keyspace: &str, name: &str) -> bool {
        self.objects.get(&kind).map_or(false, |rows| {
            rows.iter().any(|row| {
                text(row, "keyspace_name") == Some(keyspace) && text(row, kind.name_column()) == Some(name)
            })
        })
    }
}

#[derive(Debug)]
struct NodeState {
    tables: SchemaTables,
    reachable: bool,
    partitioned: bool,
    pinned_version: Option<SchemaVersion>,
    response_delay: Duration,
}

#[derive(Debug)]
struct Inner {
    order: Vec<NodeId>,
    nodes: BTreeMap<NodeId, NodeState>,
    authoritative: SchemaTables,
    propagation_delay: Duration,
    duplicate_events: bool,
}

impl Inner {
    fn coordinator(&self) -> Option<NodeId> {
        self.order
            .iter()
            .find(|id| self.nodes.get(*id).map_or(false, |n| n.reachable))
            .cloned()
    }
}

#[derive(Debug, Default)]
struct QueryCounters {
    version: AtomicU64,
    full_keyspaces: AtomicU64,
    targeted_keyspaces: AtomicU64,
}

pub struct InMemoryCluster {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<SchemaChangeEvent>,
    counters: QueryCounters,
}

impl InMemoryCluster {
    /// Cluster of `size` nodes with an empty schema.
    pub fn new(size: usize) -> Self {
        let nodes = (1..=size.max(1))
            .map(|i| NodeId(format!("10.0.0.{i}")))
            .collect();
        Self::with_nodes(nodes)
    }

    pub fn with_nodes(nodes: Vec<NodeId>) -> Self {
        Self::build(nodes, SchemaTables::empty())
    }

    pub fn from_fixture(fixture: ClusterFixture) -> Self {
        let mut tables = SchemaTables::empty();
        for row in fixture.keyspaces {
            let name = text(&row, "keyspace_name").unwrap_or_default().to_string();
            tables.keyspaces.insert(name, row);
        }
        tables.objects = fixture.objects;

        let cluster = Self::build(fixture.nodes, tables);
        for node in &fixture.unreachable {
            cluster.set_reachable(node, false);
        }
        cluster
    }

    fn build(order: Vec<NodeId>, tables: SchemaTables) -> Self {
        let nodes = order
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    NodeState {
                        tables: tables.clone(),
                        reachable: true,
                        partitioned: false,
                        pinned_version: None,
                        response_delay: Duration::ZERO,
                    },
                )
            })
            .collect();
        let (events, _) = broadcast::channel(256);

        Self {
            inner: Arc::new(Mutex::new(Inner {
                order,
                nodes,
                authoritative: tables,
                propagation_delay: Duration::ZERO,
                duplicate_events: false,
            })),
            events,
            counters: QueryCounters::default(),
        }
    }

    /// Delay before non-coordinator nodes see a schema change.
    pub fn set_propagation_delay(&self, delay: Duration) {
        self.inner.lock().propagation_delay = delay;
    }

    /// Deliver every pushed event twice.
    pub fn set_duplicate_events(&self, duplicate: bool) {
        self.inner.lock().duplicate_events = duplicate;
    }

    pub fn set_reachable(&self, node: &NodeId, reachable: bool) {
        if let Some(state) = self.inner.lock().nodes.get_mut(node) {
            state.reachable = reachable;
        }
    }

    /// Stop gossiping schema changes to `node`.
    pub fn partition(&self, node: &NodeId) {
        if let Some(state) = self.inner.lock().nodes.get_mut(node) {
            state.partitioned = true;
        }
    }

    /// Reconnect `node` and bring its schema up to date.
    pub fn heal(&self, node: &NodeId) {
        let mut inner = self.inner.lock();
        let tables = inner.authoritative.clone();
        if let Some(state) = inner.nodes.get_mut(node) {
            state.partitioned = false;
            state.tables = tables;
        }
    }

    /// Make `node` report a fixed version regardless of its tables.
    pub fn pin_version(&self, node: &NodeId, version: Option<SchemaVersion>) {
        if let Some(state) = self.inner.lock().nodes.get_mut(node) {
            state.pinned_version = version;
        }
    }

    /// Delay every answer from `node`.
    pub fn set_response_delay(&self, node: &NodeId, delay: Duration) {
        if let Some(state) = self.inner.lock().nodes.get_mut(node) {
            state.response_delay = delay;
        }
    }

    /// Replace a raw keyspace row on every node, bypassing validation.
    pub fn put_keyspace_row(&self, name: &str, row: Row) {
        let mut inner = self.inner.lock();
        inner.authoritative.keyspaces.insert(name.to_string(), row);
        inner.authoritative.version = fresh_version();
        let tables = inner.authoritative.clone();
        for state in inner.nodes.values_mut() {
            state.tables = tables.clone();
        }
    }

    /// Push a change notification without changing any schema.
    pub fn push_event(&self, event: SchemaChangeEvent) {
        let _ = self.events.send(event);
    }

    pub fn schema_version(&self) -> SchemaVersion {
        self.inner.lock().authoritative.version.clone()
    }

    pub fn node_version(&self, node: &NodeId) -> Option<SchemaVersion> {
        self.inner
            .lock()
            .nodes
            .get(node)
            .map(|n| n.pinned_version.clone().unwrap_or_else(|| n.tables.version.clone()))
    }

    pub fn version_queries(&self) -> u64 {
        self.counters.version.load(Ordering::SeqCst)
    }

    /// Reads of the whole keyspaces table.
    pub fn full_fetches(&self) -> u64 {
        self.counters.full_keyspaces.load(Ordering::SeqCst)
    }

    /// Reads of a single keyspace row.
    pub fn targeted_fetches(&self) -> u64 {
        self.counters.targeted_keyspaces.load(Ordering::SeqCst)
    }

    fn count(&self, query: &SchemaQuery) {
        let counter = match query {
            SchemaQuery::LocalVersion => &self.counters.version,
            SchemaQuery::Keyspaces { keyspace: None } => &self.counters.full_keyspaces,
            SchemaQuery::Keyspaces { keyspace: Some(_) } => &self.counters.targeted_keyspaces,
            SchemaQuery::Objects { .. } => return,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn gossip(&self, inner: &mut Inner, coordinator: &NodeId) {
        let tables = inner.authoritative.clone();
        let delay = inner.propagation_delay;

        for (id, state) in inner.nodes.iter_mut() {
            if id == coordinator || (delay.is_zero() && !state.partitioned) {
                state.tables = tables.clone();
            }
        }

        if delay.is_zero() {
            return;
        }

        let shared = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = shared.lock();
            let tables = inner.authoritative.clone();
            for state in inner.nodes.values_mut() {
                if !state.partitioned {
                    state.tables = tables.clone();
                }
            }
        });
    }
}

#[async_trait]
impl SchemaTransport for InMemoryCluster {
    fn nodes(&self) -> Vec<NodeId> {
        self.inner.lock().order.clone()
    }

    async fn query(&self, node: &NodeId, query: &SchemaQuery) -> Result<Vec<Row>, TransportError> {
        let delay = {
            let inner = self.inner.lock();
            let state = inner.nodes.get(node).ok_or_else(|| unreachable(node, "unknown node"))?;
            if !state.reachable {
                return Err(unreachable(node, "connection refused"));
            }
            state.response_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.count(query);

        let inner = self.inner.lock();
        let state = inner.nodes.get(node).ok_or_else(|| unreachable(node, "unknown node"))?;
        if !state.reachable {
            return Err(unreachable(node, "connection reset"));
        }
        let tables = &state.tables;

        let rows = match query {
            SchemaQuery::LocalVersion => {
                let version = state.pinned_version.as_ref().unwrap_or(&tables.version);
                vec![row(json!({ "schema_version": version.0 }))]
            }
            SchemaQuery::Keyspaces { keyspace } => tables
                .keyspaces
                .iter()
                .filter(|(name, _)| keyspace.as_deref().map_or(true, |k| k == name.as_str()))
                .map(|(_, row)| row.clone())
                .collect(),
            SchemaQuery::Objects { kind, keyspace } => tables
                .objects
                .get(kind)
                .map(|rows| {
                    rows.iter()
                        .filter(|row| {
                            keyspace
                                .as_deref()
                                .map_or(true, |k| text(row, "keyspace_name") == Some(k))
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
        };

        Ok(rows)
    }

    async fn execute(
        &self,
        statement: &SchemaStatement,
    ) -> Result<Option<SchemaChangeEvent>, TransportError> {
        let (event, duplicate) = {
            let mut inner = self.inner.lock();
            let coordinator = inner.coordinator().ok_or(TransportError::NoNodes)?;

            let event = apply(&mut inner.authoritative, statement).map_err(TransportError::Rejected)?;
            if event.is_some() {
                inner.authoritative.version = fresh_version();
                self.gossip(&mut inner, &coordinator);
            }
            (event, inner.duplicate_events)
        };

        if let Some(event) = &event {
            let _ = self.events.send(event.clone());
            if duplicate {
                let _ = self.events.send(event.clone());
            }
        }
        Ok(event)
    }

    fn subscribe(&self) -> broadcast::Receiver<SchemaChangeEvent> {
        self.events.subscribe()
    }
}

fn apply(tables: &mut SchemaTables, statement: &SchemaStatement) -> Result<Option<SchemaChangeEvent>, String> {
    match statement {
        SchemaStatement::CreateKeyspace {
            name,
            replication,
            durable_writes,
            graph_engine,
            if_not_exists,
        } => {
            if tables.keyspaces.contains_key(name) {
                if *if_not_exists {
                    return Ok(None);
                }
                return Err(format!("Cannot add existing keyspace \"{name}\""));
            }
            if let Some(engine) = graph_engine {
                check_engine(engine)?;
            }
            tables.keyspaces.insert(
                name.clone(),
                row(json!({
                    "keyspace_name": name,
                    "durable_writes": durable_writes,
                    "replication": replication,
                    "graph_engine": graph_engine,
                })),
            );
            Ok(Some(SchemaChangeEvent::keyspace(ChangeKind::Created, name.clone())))
        }
        SchemaStatement::AlterKeyspace {
            name,
            replication,
            durable_writes,
            graph_engine,
        } => {
            if let Some(engine) = graph_engine {
                check_engine(engine)?;
            }
            let row = tables
                .keyspaces
                .get_mut(name)
                .ok_or_else(|| format!("Cannot alter non existing keyspace '{name}'"))?;
            if let Some(replication) = replication {
                row.insert("replication".into(), json!(replication));
            }
            if let Some(durable_writes) = durable_writes {
                row.insert("durable_writes".into(), json!(durable_writes));
            }
            if let Some(engine) = graph_engine {
                row.insert("graph_engine".into(), json!(engine));
            }
            Ok(Some(SchemaChangeEvent::keyspace(ChangeKind::Updated, name.clone())))
        }
        SchemaStatement::DropKeyspace { name, if_exists } => {
            if tables.keyspaces.remove(name).is_none() {
                if *if_exists {
                    return Ok(None);
                }
                return Err(format!("Cannot drop non existing keyspace '{name}'"));
            }
            for rows in tables.objects.values_mut() {
                rows.retain(|row| text(row, "keyspace_name") != Some(name.as_str()));
            }
            Ok(Some(SchemaChangeEvent::keyspace(ChangeKind::Dropped, name.clone())))
        }
        SchemaStatement::CreateTable {
            keyspace,
            name,
            columns,
            primary_key,
            if_not_exists,
        } => {
            if !tables.keyspaces.contains_key(keyspace) {
                return Err(format!("Keyspace '{keyspace}' does not exist"));
            }
            if tables.has_object(ObjectKind::Table, keyspace, name) {
                if *if_not_exists {
                    return Ok(None);
                }
                return Err(format!(
                    "Cannot add already existing table \"{name}\" to keyspace \"{keyspace}\""
                ));
            }
            let columns: BTreeMap<&str, &str> = columns
                .iter()
                .map(|c| (c.name.as_str(), c.cql_type.as_str()))
                .collect();
            tables.objects.entry(ObjectKind::Table).or_default().push(row(json!({
                "keyspace_name": keyspace,
                "table_name": name,
                "columns": columns,
                "primary_key": primary_key,
            })));
            Ok(Some(SchemaChangeEvent::object(
                ChangeKind::Created,
                ChangeTarget::Table,
                keyspace.clone(),
                name.clone(),
            )))
        }
        SchemaStatement::DropTable {
            keyspace,
            name,
            if_exists,
        } => {
            if !tables.has_object(ObjectKind::Table, keyspace, name) {
                if *if_exists {
                    return Ok(None);
                }
                return Err(format!("Table '{keyspace}.{name}' doesn't exist"));
            }
            if let Some(rows) = tables.objects.get_mut(&ObjectKind::Table) {
                rows.retain(|row| {
                    !(text(row, "keyspace_name") == Some(keyspace.as_str())
                        && text(row, "table_name") == Some(name.as_str()))
                });
            }
            Ok(Some(SchemaChangeEvent::object(
                ChangeKind::Dropped,
                ChangeTarget::Table,
                keyspace.clone(),
                name.clone(),
            )))
        }
    }
}

/// Markers are random UUIDs, as real nodes report them.
fn fresh_version() -> SchemaVersion {
    SchemaVersion(Uuid::new_v4().to_string())
}

fn check_engine(engine: &str) -> Result<(), String> {
    if RECOGNIZED_GRAPH_ENGINES.contains(&engine) {
        Ok(())
    } else {
        Err(format!("Invalid/unknown graph engine name '{engine}'"))
    }
}

fn unreachable(node: &NodeId, reason: &str) -> TransportError {
    TransportError::Unreachable {
        node: node.clone(),
        reason: reason.to_string(),
    }
}

fn text<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column).and_then(Value::as_str)
}

fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => Row::new(),
    }
}
