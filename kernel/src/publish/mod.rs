// Metadata Publisher
//
// Holds the current snapshot in an `ArcSwap`. Readers load the pointer
// without taking a lock and never wait on a refresh. Publication is
// serialized through a single writer gate.
//
// Listener policy: each listener gets its own unbounded queue drained by a
// dedicated task, so every listener sees every publish exactly once and in
// order, and a slow listener only delays itself.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::invariants::{InvariantEngine, InvariantViolation};
use crate::schema::MetadataSnapshot;

type Change = (Arc<MetadataSnapshot>, Arc<MetadataSnapshot>);

/// Handle to a registered listener.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop delivering notifications to the listener.
    pub fn cancel(self) {
        self.task.abort();
    }
}

pub struct MetadataPublisher {
    current: ArcSwap<MetadataSnapshot>,
    writer: Mutex<()>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<Change>>>,
    invariants: InvariantEngine,
}

impl MetadataPublisher {
    pub fn new(invariants: InvariantEngine) -> Self {
        Self {
            current: ArcSwap::from_pointee(MetadataSnapshot::empty()),
            writer: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            invariants,
        }
    }

    /// Latest published snapshot.
    pub fn current(&self) -> Arc<MetadataSnapshot> {
        self.current.load_full()
    }

    /// Make `next` the visible snapshot, then queue listener notifications.
    ///
    /// On an invariant violation nothing changes and the previous snapshot
    /// stays visible.
    pub fn publish(&self, next: MetadataSnapshot) -> Result<Arc<MetadataSnapshot>, InvariantViolation> {
        let _writer = self.writer.lock();
        let previous = self.current();

        if let Err(violation) = self.invariants.evaluate(&previous, &next) {
            warn!(
                sequence = next.sequence(),
                error = %violation,
                "discarding schema snapshot"
            );
            return Err(violation);
        }

        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        debug!(
            sequence = next.sequence(),
            keyspaces = next.len(),
            "published schema snapshot"
        );

        self.listeners
            .lock()
            .retain(|tx| tx.send((Arc::clone(&previous), Arc::clone(&next))).is_ok());

        Ok(next)
    }

    /// Register `listener`, invoked with (previous, new) after each publish.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<MetadataSnapshot>, &Arc<MetadataSnapshot>) + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Change>();
        self.listeners.lock().push(tx);

        let task = tokio::spawn(async move {
            while let Some((previous, next)) = rx.recv().await {
                listener(&previous, &next);
            }
        });
        Subscription { task }
    }
}

impl Default for MetadataPublisher {
    fn default() -> Self {
        Self::new(InvariantEngine::with_defaults())
    }
}
