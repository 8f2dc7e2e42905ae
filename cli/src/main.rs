use std::fs;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use schemasync_kernel::adapters::memory::{ClusterFixture, InMemoryCluster};
use schemasync_kernel::config::SyncConfig;
use schemasync_kernel::schema::MetadataSnapshot;
use schemasync_kernel::session::{MetadataSession, SessionError};
use schemasync_kernel::statement::SchemaStatement;

/// SchemaSync CLI
#[derive(Parser, Debug)]
#[command(name = "schemasync")]
#[command(about = "Schema metadata synchronization against an in-memory cluster", long_about = None)]
struct Cli {
    /// Path to cluster fixture JSON
    #[arg(long)]
    cluster: String,

    /// Path to sync config JSON
    #[arg(long)]
    config: Option<String>,

    /// Path to a JSON list of schema statements to apply
    #[arg(long)]
    statements: Option<String>,

    /// Only print this keyspace
    #[arg(long)]
    keyspace: Option<String>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "warn")]
    log_level: String,
}

/// Statement the server refused
#[derive(Debug, Serialize)]
struct Rejection {
    cql: String,
    error: String,
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct CliOutput {
    snapshot: serde_json::Value,
    rejected: Vec<Rejection>,
    refresh_cycles: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // ----------------------------
    // Load cluster fixture
    // ----------------------------
    let fixture_data = fs::read_to_string(&cli.cluster)?;
    let fixture: ClusterFixture = serde_json::from_str(&fixture_data)?;
    let cluster = Arc::new(InMemoryCluster::from_fixture(fixture));

    // ----------------------------
    // Load config
    // ----------------------------
    let config = if let Some(path) = &cli.config {
        SyncConfig::from_json(&fs::read_to_string(path)?)?
    } else {
        SyncConfig::default_config()
    };

    // ----------------------------
    // Load statements
    // ----------------------------
    let statements: Vec<SchemaStatement> = match &cli.statements {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
        None => Vec::new(),
    };

    // ----------------------------
    // Connect and apply
    // ----------------------------
    let session = MetadataSession::connect(cluster, config).await?;

    let mut rejected = Vec::new();
    for statement in &statements {
        match session.execute(statement).await {
            Ok(outcome) => info!(change = ?outcome.change, "statement applied"),
            Err(SessionError::ServerRejected(error)) => rejected.push(Rejection {
                cql: statement.to_cql(),
                error,
            }),
            Err(other) => return Err(other.into()),
        }
    }

    let snapshot = session.refresh_schema(true, None).await?;

    // ----------------------------
    // Output
    // ----------------------------
    let output = CliOutput {
        snapshot: render(&snapshot, cli.keyspace.as_deref())?,
        rejected,
        refresh_cycles: session.refresh_cycles(),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    session.shutdown().await;
    Ok(())
}

fn render(snapshot: &MetadataSnapshot, keyspace: Option<&str>) -> Result<serde_json::Value> {
    let value = match keyspace {
        Some(name) => serde_json::to_value(snapshot.keyspace(name))?,
        None => serde_json::to_value(snapshot)?,
    };
    Ok(value)
}
