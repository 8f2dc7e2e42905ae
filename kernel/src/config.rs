// Synchronization Configuration
//
// Tunables for agreement polling, debouncing, retries and fetching.
// Loaded from JSON, or built in via `SyncConfig::default_config()`.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a refresh does when the cluster has not agreed before the
/// agreement timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementTimeoutPolicy {
    /// Fetch from the best available node anyway.
    Degrade,
    /// Fail the refresh with `RefreshError::AgreementTimeout`.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgreementConfig {
    /// First poll interval; later intervals back off up to `max_interval_ms`.
    pub interval_ms: u64,
    pub max_interval_ms: u64,
    /// Overall time spent waiting for agreement in one refresh cycle.
    pub timeout_ms: u64,
    /// Time a single node gets to report its version on each poll.
    pub per_node_timeout_ms: u64,
    pub on_timeout: AgreementTimeoutPolicy,
    /// Log a warning when agreement is not reached.
    pub warn_on_failure: bool,
}

impl Default for AgreementConfig {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            max_interval_ms: 1_000,
            timeout_ms: 10_000,
            per_node_timeout_ms: 2_000,
            on_timeout: AgreementTimeoutPolicy::Degrade,
            warn_on_failure: true,
        }
    }
}

impl AgreementConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn per_node_timeout(&self) -> Duration {
        Duration::from_millis(self.per_node_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    /// How long change events arriving during a running refresh are
    /// collected before the next one starts. An idle pipeline never waits.
    pub window_ms: u64,
    /// Collected events that force the refresh to start, and widen it to a
    /// full refresh, before the window ends.
    pub max_events: usize,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window_ms: 1_000,
            max_events: 20,
        }
    }
}

impl DebounceConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Fetch attempts per refresh cycle, including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-node timeout for the schema table reads.
    pub request_timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 2_000,
        }
    }
}

impl FetchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// When false, pushed change events are ignored. Explicit refreshes
    /// still run.
    pub enabled: bool,
    /// Restrict the snapshot to these keyspaces.
    pub refreshed_keyspaces: Option<BTreeSet<String>>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refreshed_keyspaces: None,
        }
    }
}

impl SchemaConfig {
    pub fn includes(&self, keyspace: &str) -> bool {
        self.refreshed_keyspaces
            .as_ref()
            .map_or(true, |allowed| allowed.contains(keyspace))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub agreement: AgreementConfig,
    pub debounce: DebounceConfig,
    pub retry: RetryConfig,
    pub fetch: FetchConfig,
    pub schema: SchemaConfig,
}

impl SyncConfig {
    /// Built-in configuration (used if no config is provided).
    pub fn default_config() -> Self {
        Self::default()
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}
