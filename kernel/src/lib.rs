// SchemaSync Kernel
//
// Keeps a client-side model of a cluster's schema in step with the nodes
// and publishes it as immutable snapshots.

pub mod adapters;
pub mod agreement;
pub mod backoff;
pub mod config;
pub mod events;
pub mod fetch;
pub mod invariants;
pub mod publish;
pub mod schema;
pub mod session;
pub mod statement;
pub mod sync;
