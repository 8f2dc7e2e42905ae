// Refresh State Machine
//
// Tracks where the synchronization pipeline is inside one refresh cycle.
// Pure and deterministic: the engine feeds it events and it rejects any
// transition the pipeline should never make.

/// Pipeline state.
///
/// There is no terminal state; `Failed` always recovers to `Idle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    AwaitingAgreement,
    Fetching,
    Publishing,
    Failed(String),
}

/// Inputs driving the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Triggered { wait_for_agreement: bool },
    AgreementReached,
    /// Agreement deadline passed and the cycle degrades to a best-effort fetch.
    AgreementTimedOut,
    RowsReady,
    Published,
    Failed(String),
    Recovered,
}

/// Errors produced during state transitions.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal state transition: {0}")]
    IllegalTransition(String),
}

#[derive(Debug)]
pub struct SyncStateMachine {
    state: SyncState,
}

impl Default for SyncStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStateMachine {
    pub fn new() -> Self {
        Self {
            state: SyncState::Idle,
        }
    }

    pub fn apply(&mut self, event: &SyncEvent) -> Result<(), StateError> {
        use SyncEvent as E;
        use SyncState::*;

        self.state = match (&self.state, event) {
            (Idle, E::Triggered { wait_for_agreement: true }) => AwaitingAgreement,
            (Idle, E::Triggered { wait_for_agreement: false }) => Fetching,

            (AwaitingAgreement, E::AgreementReached | E::AgreementTimedOut) => Fetching,

            (Fetching, E::RowsReady) => Publishing,
            (Publishing, E::Published) => Idle,

            (AwaitingAgreement | Fetching | Publishing, E::Failed(reason)) => Failed(reason.clone()),
            (Failed(_), E::Recovered) => Idle,

            (state, evt) => {
                return Err(StateError::IllegalTransition(format!(
                    "cannot apply {:?} while in {:?}",
                    evt, state
                )))
            }
        };

        Ok(())
    }

    pub fn current_state(&self) -> &SyncState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle_with_agreement() {
        let mut sm = SyncStateMachine::new();

        sm.apply(&SyncEvent::Triggered { wait_for_agreement: true }).unwrap();
        assert_eq!(sm.current_state(), &SyncState::AwaitingAgreement);

        sm.apply(&SyncEvent::AgreementTimedOut).unwrap();
        assert_eq!(sm.current_state(), &SyncState::Fetching);

        sm.apply(&SyncEvent::RowsReady).unwrap();
        sm.apply(&SyncEvent::Published).unwrap();
        assert_eq!(sm.current_state(), &SyncState::Idle);
    }

    #[test]
    fn skipping_agreement_goes_straight_to_fetching() {
        let mut sm = SyncStateMachine::new();
        sm.apply(&SyncEvent::Triggered { wait_for_agreement: false }).unwrap();
        assert_eq!(sm.current_state(), &SyncState::Fetching);
    }

    #[test]
    fn failure_recovers_to_idle() {
        let mut sm = SyncStateMachine::new();
        sm.apply(&SyncEvent::Triggered { wait_for_agreement: false }).unwrap();
        sm.apply(&SyncEvent::Failed("bad row".into())).unwrap();
        assert_eq!(sm.current_state(), &SyncState::Failed("bad row".into()));

        sm.apply(&SyncEvent::Recovered).unwrap();
        assert_eq!(sm.current_state(), &SyncState::Idle);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut sm = SyncStateMachine::new();

        let err = sm.apply(&SyncEvent::RowsReady).unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition(_)));

        sm.apply(&SyncEvent::Triggered { wait_for_agreement: true }).unwrap();
        assert!(sm
            .apply(&SyncEvent::Triggered { wait_for_agreement: true })
            .is_err());
    }
}
