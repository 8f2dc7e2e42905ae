// Transport Adapters
//
// The query layer this subsystem consumes. Framing, pooling and
// connection-level retries belong to the implementation; a returned
// failure only means "this node did not answer this time".

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::events::SchemaChangeEvent;
use crate::schema::parse::Row;
use crate::schema::{NodeId, ObjectKind};
use crate::statement::SchemaStatement;

pub mod memory;

/// Reads issued against the system tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaQuery {
    /// The node's own schema version marker.
    LocalVersion,
    Keyspaces { keyspace: Option<String> },
    Objects {
        kind: ObjectKind,
        keyspace: Option<String>,
    },
}

impl SchemaQuery {
    pub fn to_cql(&self) -> String {
        match self {
            SchemaQuery::LocalVersion => {
                "SELECT schema_version FROM system.local WHERE key = 'local'".to_string()
            }
            SchemaQuery::Keyspaces { keyspace } => {
                with_keyspace_filter("SELECT * FROM system_schema.keyspaces", keyspace)
            }
            SchemaQuery::Objects { kind, keyspace } => {
                with_keyspace_filter(&format!("SELECT * FROM {}", kind.schema_table()), keyspace)
            }
        }
    }
}

fn with_keyspace_filter(select: &str, keyspace: &Option<String>) -> String {
    match keyspace {
        Some(name) => format!("{select} WHERE keyspace_name = '{}'", name.replace('\'', "''")),
        None => select.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("node {node} unreachable: {reason}")]
    Unreachable { node: NodeId, reason: String },

    /// The server refused the statement; the message is the server's own.
    #[error("{0}")]
    Rejected(String),

    #[error("no node available to coordinate the request")]
    NoNodes,
}

#[async_trait]
pub trait SchemaTransport: Send + Sync + 'static {
    /// Nodes currently known, control node first.
    fn nodes(&self) -> Vec<NodeId>;

    /// Read system rows from one specific node.
    async fn query(&self, node: &NodeId, query: &SchemaQuery) -> Result<Vec<Row>, TransportError>;

    /// Run a schema statement on any coordinator.
    ///
    /// Returns the change the server reports, or `None` when the statement
    /// was a no-op (`IF NOT EXISTS` on an existing keyspace, for example).
    async fn execute(
        &self,
        statement: &SchemaStatement,
    ) -> Result<Option<SchemaChangeEvent>, TransportError>;

    /// Pushed schema change notifications.
    fn subscribe(&self) -> broadcast::Receiver<SchemaChangeEvent>;
}
