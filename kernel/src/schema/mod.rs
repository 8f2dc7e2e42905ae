// Schema Metadata Model
//
// Immutable descriptors for keyspaces and the objects they own, and the
// snapshot that groups them at one synchronization point.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod parse;

/// Identifier of a cluster node (its broadcast address in practice).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId(value.to_string())
    }
}

/// Schema version reported by a node.
///
/// Opaque: kept exactly as the node reported it and only ever compared
/// for equality across nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaVersion(pub String);

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SchemaVersion {
    fn from(value: &str) -> Self {
        SchemaVersion(value.to_string())
    }
}

/// Kind of schema object owned by a keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Table,
    View,
    Type,
    Function,
    Aggregate,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 5] = [
        ObjectKind::Table,
        ObjectKind::View,
        ObjectKind::Type,
        ObjectKind::Function,
        ObjectKind::Aggregate,
    ];

    /// System table holding rows of this kind.
    pub fn schema_table(&self) -> &'static str {
        match self {
            ObjectKind::Table => "system_schema.tables",
            ObjectKind::View => "system_schema.views",
            ObjectKind::Type => "system_schema.types",
            ObjectKind::Function => "system_schema.functions",
            ObjectKind::Aggregate => "system_schema.aggregates",
        }
    }

    /// Column carrying the object name in its system table.
    pub fn name_column(&self) -> &'static str {
        match self {
            ObjectKind::Table => "table_name",
            ObjectKind::View => "view_name",
            ObjectKind::Type => "type_name",
            ObjectKind::Function => "function_name",
            ObjectKind::Aggregate => "aggregate_name",
        }
    }
}

/// Graph-processing attributes of a keyspace.
///
/// Only present on clusters that support graph keyspaces, and only when the
/// keyspace was created or altered with an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphExtension {
    pub engine: String,
}

/// A table, view, type, function or aggregate.
///
/// Attributes are carried exactly as the system tables report them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaObject {
    pub kind: ObjectKind,
    pub name: String,
    pub attributes: BTreeMap<String, Value>,
}

/// Parsed keyspace metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyspaceDescriptor {
    pub name: String,
    pub replication: BTreeMap<String, String>,
    pub durable_writes: bool,
    /// Graph extension, `None` when no engine is configured.
    pub graph: Option<GraphExtension>,
    /// Owned objects, keyed by kind then name.
    #[serde(default)]
    pub objects: BTreeMap<ObjectKind, BTreeMap<String, SchemaObject>>,
    /// Keyspace columns this client does not interpret.
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl KeyspaceDescriptor {
    pub fn new(name: impl Into<String>, replication: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            replication,
            durable_writes: true,
            graph: None,
            objects: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Graph engine name, if one is configured.
    pub fn graph_engine(&self) -> Option<&str> {
        self.graph.as_ref().map(|g| g.engine.as_str())
    }

    pub fn object(&self, kind: ObjectKind, name: &str) -> Option<&SchemaObject> {
        self.objects.get(&kind).and_then(|objects| objects.get(name))
    }

    pub fn table(&self, name: &str) -> Option<&SchemaObject> {
        self.object(ObjectKind::Table, name)
    }

    pub fn objects_of(&self, kind: ObjectKind) -> impl Iterator<Item = &SchemaObject> {
        self.objects.get(&kind).into_iter().flat_map(|m| m.values())
    }

    pub(crate) fn insert_object(&mut self, object: SchemaObject) {
        self.objects
            .entry(object.kind)
            .or_default()
            .insert(object.name.clone(), object);
    }
}

/// Immutable view of the whole schema at one synchronization point.
///
/// Never mutated once built. A newer snapshot supersedes it; readers that
/// captured this one keep a complete, valid view.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataSnapshot {
    sequence: u64,
    version: Option<SchemaVersion>,
    keyspaces: BTreeMap<String, KeyspaceDescriptor>,
}

impl MetadataSnapshot {
    /// Snapshot visible before the first refresh completes.
    pub fn empty() -> Self {
        Self {
            sequence: 0,
            version: None,
            keyspaces: BTreeMap::new(),
        }
    }

    pub fn new(
        sequence: u64,
        version: Option<SchemaVersion>,
        keyspaces: BTreeMap<String, KeyspaceDescriptor>,
    ) -> Self {
        Self {
            sequence,
            version,
            keyspaces,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Schema version the snapshot was built from, when known.
    pub fn version(&self) -> Option<SchemaVersion> {
        self.version.clone()
    }

    pub fn keyspace(&self, name: &str) -> Option<&KeyspaceDescriptor> {
        self.keyspaces.get(name)
    }

    pub fn keyspaces(&self) -> &BTreeMap<String, KeyspaceDescriptor> {
        &self.keyspaces
    }

    pub fn keyspace_names(&self) -> impl Iterator<Item = &str> {
        self.keyspaces.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keyspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyspaces.is_empty()
    }

    /// Value equality of the schema content, ignoring sequence and version.
    pub fn same_content(&self, other: &MetadataSnapshot) -> bool {
        self.keyspaces == other.keyspaces
    }
}
