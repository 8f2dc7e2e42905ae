// Schema Agreement
//
// Polls every known node for its schema version and decides whether the
// cluster has converged. Nodes that do not answer are excluded from the
// decision rather than counted as disagreeing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, warn};

use crate::adapters::{SchemaQuery, SchemaTransport};
use crate::backoff::{deadline_after, Backoff};
use crate::config::AgreementConfig;
use crate::fetch::version_of;
use crate::schema::{NodeId, SchemaVersion};

/// Versions reported by one polling round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgreementReport {
    /// Version every node is compared against.
    pub reference: Option<SchemaVersion>,
    pub versions: BTreeMap<NodeId, SchemaVersion>,
    /// Nodes excluded from this round, with the reason.
    pub unreachable: BTreeMap<NodeId, String>,
}

impl AgreementReport {
    /// Classify one round of responses.
    ///
    /// The reference is the control node's version when it answered,
    /// otherwise the most common version (ties go to the smallest).
    pub fn from_responses(
        control: Option<&NodeId>,
        versions: BTreeMap<NodeId, SchemaVersion>,
        unreachable: BTreeMap<NodeId, String>,
    ) -> Self {
        let reference = control
            .and_then(|node| versions.get(node).cloned())
            .or_else(|| most_common(&versions));

        Self {
            reference,
            versions,
            unreachable,
        }
    }

    /// The agreed version, when at least one node answered and every
    /// responder reports the reference.
    pub fn agreed_version(&self) -> Option<SchemaVersion> {
        let reference = self.reference.as_ref()?;
        self.versions
            .values()
            .all(|v| v == reference)
            .then(|| reference.clone())
    }

    pub fn is_agreed(&self) -> bool {
        self.agreed_version().is_some()
    }

    /// Responders whose version differs from the reference.
    pub fn disagreeing(&self) -> Vec<NodeId> {
        self.versions
            .iter()
            .filter(|(_, v)| Some(*v) != self.reference.as_ref())
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// `nodes` reordered so responders on the reference version come
    /// first, keeping the original order otherwise.
    pub fn preferred_order(&self, nodes: &[NodeId]) -> Vec<NodeId> {
        let (mut preferred, rest): (Vec<NodeId>, Vec<NodeId>) = nodes
            .iter()
            .cloned()
            .partition(|node| {
                self.reference.is_some() && self.versions.get(node) == self.reference.as_ref()
            });
        preferred.extend(rest);
        preferred
    }
}

fn most_common(versions: &BTreeMap<NodeId, SchemaVersion>) -> Option<SchemaVersion> {
    let mut counts: BTreeMap<&SchemaVersion, usize> = BTreeMap::new();
    for version in versions.values() {
        *counts.entry(version).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(va, ca), (vb, cb)| ca.cmp(cb).then_with(|| vb.cmp(va)))
        .map(|(version, _)| version.clone())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgreementOutcome {
    Agreed(SchemaVersion),
    /// The deadline passed; carries the last round observed.
    TimedOut(AgreementReport),
}

pub struct AgreementChecker {
    transport: Arc<dyn SchemaTransport>,
    config: AgreementConfig,
}

impl AgreementChecker {
    pub fn new(transport: Arc<dyn SchemaTransport>, config: AgreementConfig) -> Self {
        Self { transport, config }
    }

    /// Run one polling round across all known nodes.
    pub async fn check_once(&self) -> AgreementReport {
        let nodes = self.transport.nodes();
        let per_node = self.config.per_node_timeout();

        let polls = nodes.iter().map(|node| async move {
            let result = match timeout(per_node, self.transport.query(node, &SchemaQuery::LocalVersion)).await {
                Ok(Ok(rows)) => version_of(&rows).ok_or_else(|| "missing or malformed schema_version".to_string()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("no response within {per_node:?}")),
            };
            (node.clone(), result)
        });

        let mut versions = BTreeMap::new();
        let mut unreachable = BTreeMap::new();
        for (node, result) in join_all(polls).await {
            match result {
                Ok(version) => {
                    versions.insert(node, version);
                }
                Err(reason) => {
                    warn!(node = %node, reason = %reason, "excluding node from schema agreement");
                    unreachable.insert(node, reason);
                }
            }
        }

        AgreementReport::from_responses(nodes.first(), versions, unreachable)
    }

    /// Poll until every responding node agrees or `within` elapses.
    pub async fn wait_for_agreement(&self, within: Duration) -> AgreementOutcome {
        let deadline = deadline_after(Instant::now(), within);
        let mut backoff = Backoff::for_agreement(&self.config);
        let mut last = AgreementReport::default();

        loop {
            match timeout_at(deadline, self.check_once()).await {
                Ok(report) => {
                    if let Some(version) = report.agreed_version() {
                        debug!(version = %version, rounds = backoff.attempts() + 1, "schema agreement reached");
                        return AgreementOutcome::Agreed(version);
                    }
                    last = report;
                }
                Err(_) => break,
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let delay = backoff.next_delay().min(deadline - now);
            sleep(delay).await;
        }

        if self.config.warn_on_failure {
            warn!(
                disagreeing = ?last.disagreeing(),
                unreachable = last.unreachable.len(),
                "schema agreement not reached within {within:?}"
            );
        }
        AgreementOutcome::TimedOut(last)
    }
}
