// Schema Synchronization
//
// The refresh pipeline: triggers are coalesced by the debouncer, and the
// engine drives each cycle through the state machine.

pub mod debounce;
pub mod engine;
pub mod state;

pub use debounce::{RefreshDebouncer, RefreshRequest, RefreshScope, Trigger};
pub use engine::{RefreshError, RefreshResult, SyncEngine};
pub use state::{StateError, SyncEvent, SyncState, SyncStateMachine};
