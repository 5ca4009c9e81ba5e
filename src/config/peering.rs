//! Peer stream settings.

use std::time::Duration;

use serde::Deserialize;

/// Default interval between heartbeats sent to the peer (15s).
pub const DEFAULT_OUTGOING_HEARTBEAT_INTERVAL_MS: u64 = 15_000;

/// Default time without a heartbeat from the peer before the stream is
/// torn down (2m).
pub const DEFAULT_INCOMING_HEARTBEAT_TIMEOUT_MS: u64 = 120_000;

/// Shortest outgoing heartbeat interval; smaller settings are raised to it.
pub const MIN_OUTGOING_HEARTBEAT_INTERVAL_MS: u64 = 1;

/// Default datacenter name used in SPIFFE IDs.
pub const DEFAULT_DATACENTER: &str = "dc1";

/// Settings fixed for the lifetime of a peer stream server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerStreamConfig {
    /// Local datacenter name.
    pub datacenter: String,

    /// Replicate discovery chains, mesh gateways and CA roots.
    pub connect_enabled: bool,

    /// Interval between heartbeats sent to the peer.
    ///
    /// Default: 15,000ms.
    pub outgoing_heartbeat_interval_ms: u64,

    /// Maximum silence from the peer before the stream fails with
    /// `heartbeat timeout`.
    ///
    /// Default: 120,000ms.
    pub incoming_heartbeat_timeout_ms: u64,

    pub watch_backoff: WatchBackoffConfig,
}

impl Default for PeerStreamConfig {
    fn default() -> Self {
        Self {
            datacenter: DEFAULT_DATACENTER.to_string(),
            connect_enabled: false,
            outgoing_heartbeat_interval_ms: DEFAULT_OUTGOING_HEARTBEAT_INTERVAL_MS,
            incoming_heartbeat_timeout_ms: DEFAULT_INCOMING_HEARTBEAT_TIMEOUT_MS,
            watch_backoff: WatchBackoffConfig::default(),
        }
    }
}

impl PeerStreamConfig {
    /// Never zero, even when configured as 0.
    pub fn outgoing_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(
            self.outgoing_heartbeat_interval_ms
                .max(MIN_OUTGOING_HEARTBEAT_INTERVAL_MS),
        )
    }

    pub fn incoming_heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.incoming_heartbeat_timeout_ms)
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = datacenter.into();
        self
    }

    pub fn with_connect_enabled(mut self, enabled: bool) -> Self {
        self.connect_enabled = enabled;
        self
    }

    pub fn with_outgoing_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.outgoing_heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_incoming_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.incoming_heartbeat_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_watch_backoff(mut self, backoff: WatchBackoffConfig) -> Self {
        self.watch_backoff = backoff;
        self
    }
}

/// Retry policy for catalog watches.
///
/// After `max_attempts` consecutive failures the stream is failed so the
/// dialer reconnects.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchBackoffConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: usize,
}

impl Default for WatchBackoffConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 500,
            max_delay_ms: 60_000,
            max_attempts: 30,
        }
    }
}
