// Refresh Debouncer
//
// Funnels every refresh trigger into a single pipeline with at most one
// cycle in flight. Triggers are merged into a batch; each caller holds a
// oneshot that resolves with the result of the cycle its batch ran in.
//
// Attach rules:
// - While the in-flight cycle has not started fetching, any trigger whose
//   agreement requirement it satisfies joins it and may widen its scope.
// - Once fetching has started, only explicit refreshes join a full-scope
//   cycle; everything else waits for the next cycle, since the rows being
//   read may predate the change that caused the trigger. An explicit
//   refresh that waits for agreement never joins a fetching cycle started
//   without it; it runs in the next cycle.
// - An idle pipeline starts a batch at once. A batch opened while a cycle
//   runs is held for the debounce window after it opened, so notifications
//   arriving together share one cycle. An immediate trigger or reaching
//   `max_events` releases it early.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use super::engine::{RefreshError, RefreshResult, SyncEngine};
use crate::backoff::deadline_after;
use crate::config::DebounceConfig;
use crate::events::SchemaChangeEvent;

/// Something that asks for the schema to be read again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// A caller asked for a refresh.
    Explicit { wait_for_agreement: bool },
    /// The change reported in a statement's own response.
    Statement(SchemaChangeEvent),
    /// A change notification pushed by the cluster.
    Pushed(SchemaChangeEvent),
}

impl Trigger {
    fn request(&self) -> RefreshRequest {
        match self {
            Trigger::Explicit { wait_for_agreement } => RefreshRequest::full(*wait_for_agreement),
            Trigger::Statement(event) | Trigger::Pushed(event) => RefreshRequest::keyspace(&event.keyspace),
        }
    }

    fn is_immediate(&self) -> bool {
        !matches!(self, Trigger::Pushed(_))
    }

    fn is_explicit(&self) -> bool {
        matches!(self, Trigger::Explicit { .. })
    }
}

/// Which part of the schema a cycle reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshScope {
    Full,
    Keyspaces(BTreeSet<String>),
}

/// Merged requirements of every trigger in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    pub wait_for_agreement: bool,
    pub scope: RefreshScope,
}

impl RefreshRequest {
    pub fn full(wait_for_agreement: bool) -> Self {
        Self {
            wait_for_agreement,
            scope: RefreshScope::Full,
        }
    }

    /// Targeted refresh after a change inside `keyspace`. Always waits for
    /// agreement so the change is visible on the node that gets read.
    pub fn keyspace(keyspace: &str) -> Self {
        Self {
            wait_for_agreement: true,
            scope: RefreshScope::Keyspaces(BTreeSet::from([keyspace.to_string()])),
        }
    }

    /// Widen `self` to also satisfy `other`. A targeted scope naming more
    /// than `max_keyspaces` keyspaces collapses into a full refresh.
    pub fn merge(&mut self, other: RefreshRequest, max_keyspaces: usize) {
        self.wait_for_agreement |= other.wait_for_agreement;
        self.scope = match (std::mem::replace(&mut self.scope, RefreshScope::Full), other.scope) {
            (RefreshScope::Keyspaces(mut mine), RefreshScope::Keyspaces(theirs)) => {
                mine.extend(theirs);
                if mine.len() > max_keyspaces {
                    RefreshScope::Full
                } else {
                    RefreshScope::Keyspaces(mine)
                }
            }
            _ => RefreshScope::Full,
        };
    }
}

struct Batch {
    request: RefreshRequest,
    waiters: Vec<oneshot::Sender<RefreshResult>>,
    events: usize,
    immediate: bool,
    opened: Instant,
    /// Opened while another cycle was running.
    deferred: bool,
    fetching: bool,
}

impl Batch {
    fn open(trigger: &Trigger, waiter: oneshot::Sender<RefreshResult>, deferred: bool) -> Self {
        Self {
            request: trigger.request(),
            waiters: vec![waiter],
            events: usize::from(!trigger.is_explicit()),
            immediate: trigger.is_immediate(),
            opened: Instant::now(),
            deferred,
            fetching: false,
        }
    }

    fn absorb(&mut self, trigger: &Trigger, waiter: oneshot::Sender<RefreshResult>, config: &DebounceConfig) {
        self.request.merge(trigger.request(), config.max_events);
        self.waiters.push(waiter);
        if !trigger.is_explicit() {
            self.events += 1;
        }
        self.immediate |= trigger.is_immediate();
        if self.events >= config.max_events {
            self.request.scope = RefreshScope::Full;
            self.immediate = true;
        }
    }

    /// Whether an in-flight batch can still serve `trigger`.
    fn accepts(&self, trigger: &Trigger) -> bool {
        let incoming = trigger.request();
        let agreement_ok = !incoming.wait_for_agreement || self.request.wait_for_agreement;
        if !self.fetching {
            agreement_ok
        } else {
            trigger.is_explicit() && agreement_ok && self.request.scope == RefreshScope::Full
        }
    }
}

#[derive(Default)]
struct Queue {
    in_flight: Option<Batch>,
    queued: Option<Batch>,
    closed: bool,
}

enum Readiness {
    Empty,
    Wait(Instant),
    Ready,
}

pub struct RefreshDebouncer {
    config: DebounceConfig,
    queue: Mutex<Queue>,
    notify: Notify,
}

impl RefreshDebouncer {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
        }
    }

    /// Register `trigger` and return the receiver its cycle will resolve.
    ///
    /// Dropping the receiver only abandons this caller's wait.
    pub fn submit(&self, trigger: Trigger) -> oneshot::Receiver<RefreshResult> {
        let (tx, rx) = oneshot::channel();
        let mut queue = self.queue.lock();

        if queue.closed {
            let _ = tx.send(Err(RefreshError::Shutdown));
            return rx;
        }

        if let Some(batch) = queue.in_flight.as_mut() {
            if batch.accepts(&trigger) {
                trace!(?trigger, "attaching to in-flight refresh");
                batch.absorb(&trigger, tx, &self.config);
                return rx;
            }
        }

        let busy = queue.in_flight.is_some();
        match queue.queued.as_mut() {
            Some(batch) => batch.absorb(&trigger, tx, &self.config),
            None => queue.queued = Some(Batch::open(&trigger, tx, busy)),
        }
        drop(queue);

        self.notify.notify_one();
        rx
    }

    /// Resolve every pending caller with `Shutdown` and refuse new ones.
    pub fn close(&self) {
        let mut queue = self.queue.lock();
        queue.closed = true;
        let batches = [queue.in_flight.take(), queue.queued.take()];
        drop(queue);

        for batch in batches.into_iter().flatten() {
            for waiter in batch.waiters {
                let _ = waiter.send(Err(RefreshError::Shutdown));
            }
        }
    }

    fn readiness(&self) -> Readiness {
        let queue = self.queue.lock();
        let window = self.config.window();
        match &queue.queued {
            None => Readiness::Empty,
            Some(batch) if batch.immediate || !batch.deferred || window.is_zero() => Readiness::Ready,
            Some(batch) => Readiness::Wait(deadline_after(batch.opened, window)),
        }
    }

    fn start_cycle(&self) -> Option<RefreshRequest> {
        let mut queue = self.queue.lock();
        if queue.in_flight.is_some() {
            return None;
        }
        let batch = queue.queued.take()?;
        debug!(
            request = ?batch.request,
            callers = batch.waiters.len(),
            events = batch.events,
            "starting schema refresh cycle"
        );
        let request = batch.request.clone();
        queue.in_flight = Some(batch);
        Some(request)
    }

    /// Freeze the in-flight request as fetching starts.
    fn begin_fetch(&self, fallback: &RefreshRequest) -> RefreshRequest {
        let mut queue = self.queue.lock();
        match queue.in_flight.as_mut() {
            Some(batch) => {
                batch.fetching = true;
                batch.request.clone()
            }
            None => fallback.clone(),
        }
    }

    fn finish_cycle(&self, result: RefreshResult) {
        let batch = self.queue.lock().in_flight.take();
        if let Some(batch) = batch {
            for waiter in batch.waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    /// Drive cycles until the task is aborted.
    pub(crate) async fn run(self: Arc<Self>, engine: Arc<SyncEngine>) {
        loop {
            let notified = self.notify.notified();
            match self.readiness() {
                Readiness::Empty => {
                    notified.await;
                    continue;
                }
                Readiness::Wait(until) => {
                    tokio::select! {
                        _ = sleep_until(until) => {}
                        _ = notified => continue,
                    }
                }
                Readiness::Ready => {}
            }

            let Some(request) = self.start_cycle() else {
                continue;
            };
            let result = engine.run_cycle(&request, || self.begin_fetch(&request)).await;
            self.finish_cycle(result);
        }
    }
}
