// Schema Row Fetcher
//
// Reads the system schema tables from one node, falling back to the next
// node when a read fails or times out, and parses the rows.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::adapters::{SchemaQuery, SchemaTransport, TransportError};
use crate::schema::parse::{build_keyspaces, Row, SchemaParseError, SchemaRows};
use crate::schema::{KeyspaceDescriptor, NodeId, ObjectKind, SchemaVersion};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("no reachable node could serve schema rows ({tried} tried)")]
    NoReachableNode { tried: usize },

    #[error(transparent)]
    Parse(#[from] SchemaParseError),
}

/// Parsed result of one fetch.
#[derive(Debug, Clone)]
pub struct FetchedSchema {
    pub source: NodeId,
    pub version: Option<SchemaVersion>,
    pub keyspaces: BTreeMap<String, KeyspaceDescriptor>,
}

pub struct SchemaFetcher {
    transport: Arc<dyn SchemaTransport>,
    request_timeout: Duration,
}

impl SchemaFetcher {
    pub fn new(transport: Arc<dyn SchemaTransport>, request_timeout: Duration) -> Self {
        Self {
            transport,
            request_timeout,
        }
    }

    /// Fetch and parse every keyspace.
    pub async fn fetch_all(&self, nodes: &[NodeId]) -> Result<FetchedSchema, FetchError> {
        let rows = self.fetch_rows(nodes, None).await?;
        parsed(rows)
    }

    /// Fetch and parse a single keyspace. The result map is empty when the
    /// keyspace no longer exists.
    pub async fn fetch_keyspace(&self, name: &str, nodes: &[NodeId]) -> Result<FetchedSchema, FetchError> {
        let rows = self.fetch_rows(nodes, Some(name)).await?;
        parsed(rows)
    }

    /// Raw rows from the first node in `nodes` that answers every read.
    pub async fn fetch_rows(
        &self,
        nodes: &[NodeId],
        keyspace: Option<&str>,
    ) -> Result<SchemaRows, FetchError> {
        for node in nodes {
            match self.fetch_from(node, keyspace).await {
                Ok(rows) => return Ok(rows),
                Err(e) => warn!(node = %node, error = %e, "schema fetch failed, trying next node"),
            }
        }
        Err(FetchError::NoReachableNode { tried: nodes.len() })
    }

    async fn fetch_from(&self, node: &NodeId, keyspace: Option<&str>) -> Result<SchemaRows, TransportError> {
        let keyspace = keyspace.map(str::to_string);

        let mut queries = vec![
            SchemaQuery::LocalVersion,
            SchemaQuery::Keyspaces {
                keyspace: keyspace.clone(),
            },
        ];
        queries.extend(ObjectKind::ALL.iter().map(|kind| SchemaQuery::Objects {
            kind: *kind,
            keyspace: keyspace.clone(),
        }));

        let reads = queries.iter().map(|query| self.read(node, query));
        let mut results = join_all(reads).await.into_iter();

        let mut rows = SchemaRows {
            source: Some(node.clone()),
            ..SchemaRows::default()
        };
        for query in &queries {
            let result = results.next().unwrap_or(Err(TransportError::NoNodes))?;
            match query {
                SchemaQuery::LocalVersion => rows.version = version_of(&result),
                SchemaQuery::Keyspaces { .. } => rows.keyspaces = result,
                SchemaQuery::Objects { kind, .. } => {
                    rows.objects.insert(*kind, result);
                }
            }
        }

        debug!(
            node = %node,
            keyspace = ?keyspace,
            keyspaces = rows.keyspaces.len(),
            "fetched schema rows"
        );
        Ok(rows)
    }

    async fn read(&self, node: &NodeId, query: &SchemaQuery) -> Result<Vec<Row>, TransportError> {
        match timeout(self.request_timeout, self.transport.query(node, query)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Unreachable {
                node: node.clone(),
                reason: format!("no response within {:?}", self.request_timeout),
            }),
        }
    }
}

/// Extract the `schema_version` column of a `system.local` read.
pub(crate) fn version_of(rows: &[Row]) -> Option<SchemaVersion> {
    rows.first()
        .and_then(|row| row.get("schema_version"))
        .and_then(|value| match value {
            Value::Null => None,
            Value::String(marker) => Some(SchemaVersion(marker.clone())),
            other => Some(SchemaVersion(other.to_string())),
        })
}

fn parsed(rows: SchemaRows) -> Result<FetchedSchema, FetchError> {
    let keyspaces = build_keyspaces(&rows)?;
    Ok(FetchedSchema {
        source: rows.source.unwrap_or_else(|| NodeId(String::new())),
        version: rows.version,
        keyspaces,
    })
}
