// Schema Row Parsing
//
// Turns raw system-table rows into keyspace descriptors. This is the only
// place descriptors are derived from rows.

use std::collections::BTreeMap;

use serde_json::Value;

use super::{GraphExtension, KeyspaceDescriptor, NodeId, ObjectKind, SchemaObject, SchemaVersion};

/// One row of a system table, column name to cell value.
pub type Row = BTreeMap<String, Value>;

const KEYSPACES_TABLE: &str = "system_schema.keyspaces";

const KEYSPACE_NAME: &str = "keyspace_name";
const DURABLE_WRITES: &str = "durable_writes";
const REPLICATION: &str = "replication";
const GRAPH_ENGINE: &str = "graph_engine";

/// Raw rows read from a single node.
#[derive(Debug, Clone, Default)]
pub struct SchemaRows {
    pub source: Option<NodeId>,
    pub version: Option<SchemaVersion>,
    pub keyspaces: Vec<Row>,
    pub objects: BTreeMap<ObjectKind, Vec<Row>>,
}

/// A row violated the structure the parser relies on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaParseError {
    #[error("{table} row is missing required column `{column}`")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },

    #[error("{table}.{column} has unexpected type, expected {expected}")]
    UnexpectedType {
        table: &'static str,
        column: &'static str,
        expected: &'static str,
    },
}

/// Parse one `system_schema.keyspaces` row.
///
/// Columns other than the four interpreted ones are kept in `extra`.
pub fn parse_keyspace(row: &Row) -> Result<KeyspaceDescriptor, SchemaParseError> {
    let name = required_text(row, KEYSPACES_TABLE, KEYSPACE_NAME)?.to_string();

    let durable_writes = match required(row, KEYSPACES_TABLE, DURABLE_WRITES)? {
        Value::Bool(b) => *b,
        _ => {
            return Err(SchemaParseError::UnexpectedType {
                table: KEYSPACES_TABLE,
                column: DURABLE_WRITES,
                expected: "boolean",
            })
        }
    };

    let replication = match required(row, KEYSPACES_TABLE, REPLICATION)? {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), text_of(v)))
            .collect(),
        _ => {
            return Err(SchemaParseError::UnexpectedType {
                table: KEYSPACES_TABLE,
                column: REPLICATION,
                expected: "map<text, text>",
            })
        }
    };

    let graph = match row.get(GRAPH_ENGINE) {
        None | Some(Value::Null) => None,
        Some(Value::String(engine)) => Some(GraphExtension {
            engine: engine.clone(),
        }),
        Some(_) => {
            return Err(SchemaParseError::UnexpectedType {
                table: KEYSPACES_TABLE,
                column: GRAPH_ENGINE,
                expected: "text",
            })
        }
    };

    let extra = row
        .iter()
        .filter(|(column, _)| {
            !matches!(
                column.as_str(),
                KEYSPACE_NAME | DURABLE_WRITES | REPLICATION | GRAPH_ENGINE
            )
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(KeyspaceDescriptor {
        name,
        replication,
        durable_writes,
        graph,
        objects: BTreeMap::new(),
        extra,
    })
}

/// Parse a row of one of the derivative-object tables.
///
/// Returns the owning keyspace name with the object. Functions and
/// aggregates are keyed by their signature since names may be overloaded.
pub fn parse_object(kind: ObjectKind, row: &Row) -> Result<(String, SchemaObject), SchemaParseError> {
    let table = kind.schema_table();
    let keyspace = required_text(row, table, KEYSPACE_NAME)?.to_string();
    let mut name = required_text(row, table, kind.name_column())?.to_string();

    if matches!(kind, ObjectKind::Function | ObjectKind::Aggregate) {
        if let Some(Value::Array(args)) = row.get("argument_types") {
            let args: Vec<String> = args.iter().map(text_of).collect();
            name = format!("{name}({})", args.join(","));
        }
    }

    let attributes = row
        .iter()
        .filter(|(column, _)| column.as_str() != KEYSPACE_NAME)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok((
        keyspace,
        SchemaObject {
            kind,
            name,
            attributes,
        },
    ))
}

/// Build keyspace descriptors from a full set of rows.
///
/// Objects whose keyspace row is absent (a keyspace dropped between the
/// individual table reads) are skipped.
pub fn build_keyspaces(
    rows: &SchemaRows,
) -> Result<BTreeMap<String, KeyspaceDescriptor>, SchemaParseError> {
    let mut keyspaces = BTreeMap::new();
    for row in &rows.keyspaces {
        let keyspace = parse_keyspace(row)?;
        keyspaces.insert(keyspace.name.clone(), keyspace);
    }

    for (kind, objects) in &rows.objects {
        for row in objects {
            let (keyspace, object) = parse_object(*kind, row)?;
            match keyspaces.get_mut(&keyspace) {
                Some(descriptor) => descriptor.insert_object(object),
                None => tracing::debug!(
                    keyspace = %keyspace,
                    object = %object.name,
                    "skipping schema object without keyspace row"
                ),
            }
        }
    }

    Ok(keyspaces)
}

fn required<'a>(
    row: &'a Row,
    table: &'static str,
    column: &'static str,
) -> Result<&'a Value, SchemaParseError> {
    match row.get(column) {
        None | Some(Value::Null) => Err(SchemaParseError::MissingColumn { table, column }),
        Some(value) => Ok(value),
    }
}

fn required_text<'a>(
    row: &'a Row,
    table: &'static str,
    column: &'static str,
) -> Result<&'a str, SchemaParseError> {
    match required(row, table, column)? {
        Value::String(s) => Ok(s),
        _ => Err(SchemaParseError::UnexpectedType {
            table,
            column,
            expected: "text",
        }),
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
