// Snapshot Invariants
//
// Pure rules checked on every candidate snapshot before it is published.
// A violation discards the candidate; the previous snapshot stays visible.

use crate::schema::MetadataSnapshot;

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// Trait implemented by all snapshot invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait SnapshotInvariant: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, previous: &MetadataSnapshot, next: &MetadataSnapshot) -> InvariantResult;
}

/// Sequence numbers strictly increase from one snapshot to the next.
pub struct MonotonicSequence;

impl SnapshotInvariant for MonotonicSequence {
    fn name(&self) -> &'static str {
        "monotonic-sequence"
    }

    fn validate(&self, previous: &MetadataSnapshot, next: &MetadataSnapshot) -> InvariantResult {
        if next.sequence() > previous.sequence() {
            InvariantResult::Pass
        } else {
            InvariantResult::Fail(format!(
                "sequence {} does not follow {}",
                next.sequence(),
                previous.sequence()
            ))
        }
    }
}

/// Every keyspace is stored under its own name.
pub struct KeyspaceKeysMatchNames;

impl SnapshotInvariant for KeyspaceKeysMatchNames {
    fn name(&self) -> &'static str {
        "keyspace-keys-match-names"
    }

    fn validate(&self, _previous: &MetadataSnapshot, next: &MetadataSnapshot) -> InvariantResult {
        match next.keyspaces().iter().find(|(key, ks)| key.as_str() != ks.name) {
            Some((key, ks)) => InvariantResult::Fail(format!(
                "keyspace `{}` stored under `{key}`",
                ks.name
            )),
            None => InvariantResult::Pass,
        }
    }
}

/// Evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn SnapshotInvariant>>,
}

impl InvariantEngine {
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Engine with the built-in invariants registered.
    pub fn with_defaults() -> Self {
        let mut engine = Self::new();
        engine.register(MonotonicSequence);
        engine.register(KeyspaceKeysMatchNames);
        engine
    }

    /// Add `invariant` after those already registered; `evaluate` runs
    /// them in that order.
    pub fn register<I: SnapshotInvariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(
        &self,
        previous: &MetadataSnapshot,
        next: &MetadataSnapshot,
    ) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(previous, next) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invariant `{invariant}` violated: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub reason: String,
}
