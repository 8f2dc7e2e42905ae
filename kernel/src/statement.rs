// Schema Statements
//
// Typed DDL statements a session can send through its transport. Only
// rendering to CQL text lives here; validation belongs to the server.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub cql_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaStatement {
    CreateKeyspace {
        name: String,
        replication: BTreeMap<String, String>,
        #[serde(default = "default_durable_writes")]
        durable_writes: bool,
        #[serde(default)]
        graph_engine: Option<String>,
        #[serde(default)]
        if_not_exists: bool,
    },
    AlterKeyspace {
        name: String,
        #[serde(default)]
        replication: Option<BTreeMap<String, String>>,
        #[serde(default)]
        durable_writes: Option<bool>,
        #[serde(default)]
        graph_engine: Option<String>,
    },
    DropKeyspace {
        name: String,
        #[serde(default)]
        if_exists: bool,
    },
    CreateTable {
        keyspace: String,
        name: String,
        columns: Vec<ColumnSpec>,
        primary_key: Vec<String>,
        #[serde(default)]
        if_not_exists: bool,
    },
    DropTable {
        keyspace: String,
        name: String,
        #[serde(default)]
        if_exists: bool,
    },
}

fn default_durable_writes() -> bool {
    true
}

impl SchemaStatement {
    /// CQL text for transports that speak the native protocol.
    pub fn to_cql(&self) -> String {
        match self {
            SchemaStatement::CreateKeyspace {
                name,
                replication,
                durable_writes,
                graph_engine,
                if_not_exists,
            } => {
                let mut cql = String::from("CREATE KEYSPACE ");
                if *if_not_exists {
                    cql.push_str("IF NOT EXISTS ");
                }
                cql.push_str(name);
                cql.push_str(" WITH replication = ");
                cql.push_str(&map_literal(replication));
                if !durable_writes {
                    cql.push_str(" AND durable_writes = false");
                }
                if let Some(engine) = graph_engine {
                    cql.push_str(" AND graph_engine = ");
                    cql.push_str(&quote(engine));
                }
                cql
            }
            SchemaStatement::AlterKeyspace {
                name,
                replication,
                durable_writes,
                graph_engine,
            } => {
                let mut options = Vec::new();
                if let Some(replication) = replication {
                    options.push(format!("replication = {}", map_literal(replication)));
                }
                if let Some(durable_writes) = durable_writes {
                    options.push(format!("durable_writes = {durable_writes}"));
                }
                if let Some(engine) = graph_engine {
                    options.push(format!("graph_engine = {}", quote(engine)));
                }
                format!("ALTER KEYSPACE {name} WITH {}", options.join(" AND "))
            }
            SchemaStatement::DropKeyspace { name, if_exists } => {
                if *if_exists {
                    format!("DROP KEYSPACE IF EXISTS {name}")
                } else {
                    format!("DROP KEYSPACE {name}")
                }
            }
            SchemaStatement::CreateTable {
                keyspace,
                name,
                columns,
                primary_key,
                if_not_exists,
            } => {
                let columns: Vec<String> = columns
                    .iter()
                    .map(|c| format!("{} {}", c.name, c.cql_type))
                    .collect();
                format!(
                    "CREATE TABLE {}{keyspace}.{name} ({}, PRIMARY KEY ({}))",
                    if *if_not_exists { "IF NOT EXISTS " } else { "" },
                    columns.join(", "),
                    primary_key.join(", ")
                )
            }
            SchemaStatement::DropTable {
                keyspace,
                name,
                if_exists,
            } => format!(
                "DROP TABLE {}{keyspace}.{name}",
                if *if_exists { "IF EXISTS " } else { "" }
            ),
        }
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn map_literal(map: &BTreeMap<String, String>) -> String {
    let entries: Vec<String> = map
        .iter()
        .map(|(k, v)| format!("{}: {}", quote(k), quote(v)))
        .collect();
    format!("{{{}}}", entries.join(", "))
}
