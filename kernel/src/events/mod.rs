// Schema Change Events
//
// Notifications pushed by the cluster when a DDL statement is applied.
// Delivery is at-least-once and unordered; every event only means that
// some part of the schema needs to be read again.

use serde::{Deserialize, Serialize};

/// What happened to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Dropped,
}

/// Which kind of schema element changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTarget {
    Keyspace,
    Table,
    Type,
    Function,
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaChangeEvent {
    pub kind: ChangeKind,
    pub target: ChangeTarget,
    /// Keyspace owning the changed element (the element itself for keyspaces).
    pub keyspace: String,
    /// Element name, absent for keyspace-level changes.
    pub name: Option<String>,
}

impl SchemaChangeEvent {
    pub fn keyspace(kind: ChangeKind, keyspace: impl Into<String>) -> Self {
        Self {
            kind,
            target: ChangeTarget::Keyspace,
            keyspace: keyspace.into(),
            name: None,
        }
    }

    pub fn object(
        kind: ChangeKind,
        target: ChangeTarget,
        keyspace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            target,
            keyspace: keyspace.into(),
            name: Some(name.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_snake_case_tags() {
        let event = SchemaChangeEvent::object(ChangeKind::Created, ChangeTarget::Table, "ks", "users");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["kind"], "created");
        assert_eq!(json["target"], "table");
        assert_eq!(json["name"], "users");
    }
}
