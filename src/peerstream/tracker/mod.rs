//! Registry of peer stream statuses.
//!
//! One [`MutableStatus`] exists per peer ID from its first connection until
//! [`Tracker::delete_status`]. Every status guards its fields with its own
//! lock, so the stream loop and operator reads never contend on the
//! registry for more than a lookup.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::structs::ServiceName;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("there is an active stream for the given PeerID {0:?}")]
    DuplicateActiveStream(String),
}

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Status
// ============================================================================

/// Point-in-time copy of a stream's status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub connected: bool,

    /// Set when the stream disconnected; cleared on reconnect.
    pub disconnect_time: Option<DateTime<Utc>>,
    /// Empty for graceful disconnects.
    pub disconnect_error_message: String,

    /// Last time the peer ACKed a resource we sent.
    pub last_ack: Option<DateTime<Utc>>,
    pub last_nack: Option<DateTime<Utc>>,
    pub last_nack_message: String,

    pub last_send_success: Option<DateTime<Utc>>,
    pub last_send_error: Option<DateTime<Utc>>,
    pub last_send_error_message: String,

    pub last_recv_heartbeat: Option<DateTime<Utc>>,
    pub last_recv_resource_success: Option<DateTime<Utc>>,
    pub last_recv_error: Option<DateTime<Utc>>,
    pub last_recv_error_message: String,

    /// Services imported from the peer, in display form.
    pub imported_services: BTreeSet<String>,
    /// Services exported to the peer, in display form.
    pub exported_services: BTreeSet<String>,
}

fn newer(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a > b,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn older_than(t: Option<DateTime<Utc>>, now: DateTime<Utc>, timeout: Duration) -> bool {
    let Some(t) = t else {
        return true;
    };
    match chrono::Duration::from_std(timeout) {
        Ok(timeout) => now.signed_duration_since(t) > timeout,
        Err(_) => false,
    }
}

impl Status {
    pub fn imported_services_count(&self) -> usize {
        self.imported_services.len()
    }

    pub fn exported_services_count(&self) -> usize {
        self.exported_services.len()
    }

    /// A stream is unhealthy when it has been disconnected for longer than
    /// `timeout`, or when the latest NACK or receive error outranks the
    /// latest success and has been doing so for longer than `timeout`.
    pub fn is_healthy(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.disconnect_time.is_some() && older_than(self.disconnect_time, now, timeout) {
            return false;
        }

        if newer(self.last_nack, self.last_ack) && older_than(self.last_ack, now, timeout) {
            return false;
        }

        if newer(self.last_recv_error, self.last_recv_resource_success)
            && older_than(self.last_recv_error, now, timeout)
        {
            return false;
        }

        true
    }
}

/// Live status of one peer stream.
pub struct MutableStatus {
    clock: Clock,
    done: Mutex<CancellationToken>,
    status: Mutex<Status>,
}

impl MutableStatus {
    fn new(clock: Clock) -> Self {
        Self {
            clock,
            done: Mutex::new(CancellationToken::new()),
            status: Mutex::new(Status {
                connected: true,
                ..Default::default()
            }),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn update(&self, f: impl FnOnce(&mut Status, DateTime<Utc>)) {
        let now = self.now();
        f(&mut lock(&self.status), now);
    }

    /// Fires when the stream was asked to shut down gracefully.
    pub fn done(&self) -> CancellationToken {
        lock(&self.done).clone()
    }

    pub fn track_ack(&self) {
        self.update(|s, now| s.last_ack = Some(now));
    }

    pub fn track_nack(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|s, now| {
            s.last_nack = Some(now);
            s.last_nack_message = message;
        });
    }

    pub fn track_send_success(&self) {
        self.update(|s, now| s.last_send_success = Some(now));
    }

    pub fn track_send_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|s, now| {
            s.last_send_error = Some(now);
            s.last_send_error_message = message;
        });
    }

    pub fn track_recv_resource_success(&self) {
        self.update(|s, now| s.last_recv_resource_success = Some(now));
    }

    pub fn track_recv_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|s, now| {
            s.last_recv_error = Some(now);
            s.last_recv_error_message = message;
        });
    }

    pub fn track_recv_heartbeat(&self) {
        self.update(|s, now| s.last_recv_heartbeat = Some(now));
    }

    fn track_connected(&self) {
        {
            let mut done = lock(&self.done);
            if done.is_cancelled() {
                *done = CancellationToken::new();
            }
        }
        self.update(|s, _| {
            s.connected = true;
            s.disconnect_time = None;
            s.disconnect_error_message.clear();
        });
    }

    fn track_disconnected_gracefully(&self) {
        self.update(|s, now| {
            s.connected = false;
            s.disconnect_time = Some(now);
            s.disconnect_error_message.clear();
        });
    }

    fn track_disconnected_due_to_error(&self, message: String) {
        self.update(|s, now| {
            s.connected = false;
            s.disconnect_time = Some(now);
            s.disconnect_error_message = message;
        });
    }

    pub fn set_exported_services(&self, services: &[ServiceName]) {
        let names = services.iter().map(ToString::to_string).collect();
        self.update(|s, _| s.exported_services = names);
    }

    pub fn set_imported_services(&self, services: &[ServiceName]) {
        let names = services.iter().map(ToString::to_string).collect();
        self.update(|s, _| s.imported_services = names);
    }

    pub fn track_imported_service(&self, service: &ServiceName) {
        let name = service.to_string();
        self.update(|s, _| {
            s.imported_services.insert(name);
        });
    }

    pub fn remove_imported_service(&self, service: &ServiceName) {
        let name = service.to_string();
        self.update(|s, _| {
            s.imported_services.remove(&name);
        });
    }

    pub fn imported_services_count(&self) -> usize {
        lock(&self.status).imported_services.len()
    }

    pub fn exported_services_count(&self) -> usize {
        lock(&self.status).exported_services.len()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.status).connected
    }

    pub fn get(&self) -> Status {
        lock(&self.status).clone()
    }
}

// ============================================================================
// Tracker
// ============================================================================

pub struct Tracker {
    streams: Mutex<HashMap<String, Arc<MutableStatus>>>,
    clock: Clock,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn clock(&self) -> Clock {
        self.clock.clone()
    }

    /// Registers a new stream for `id`.
    ///
    /// Fails when a stream for the same peer is still connected. A
    /// previously disconnected status is reused and marked connected again.
    pub fn connected(&self, id: &str) -> Result<Arc<MutableStatus>, TrackerError> {
        let mut streams = lock(&self.streams);
        match streams.get(id) {
            Some(status) if status.is_connected() => {
                Err(TrackerError::DuplicateActiveStream(id.to_string()))
            }
            Some(status) => {
                status.track_connected();
                Ok(status.clone())
            }
            None => {
                let status = Arc::new(MutableStatus::new(self.clock()));
                streams.insert(id.to_string(), status.clone());
                debug!(peer_id = %id, "tracking new stream");
                Ok(status)
            }
        }
    }

    pub fn disconnected_gracefully(&self, id: &str) {
        if let Some(status) = lock(&self.streams).get(id) {
            status.track_disconnected_gracefully();
        }
    }

    pub fn disconnected_due_to_error(&self, id: &str, message: impl Into<String>) {
        if let Some(status) = lock(&self.streams).get(id) {
            status.track_disconnected_due_to_error(message.into());
        }
    }

    pub fn stream_status(&self, id: &str) -> Option<Status> {
        lock(&self.streams).get(id).map(|status| status.get())
    }

    /// Done signals of every connected stream, keyed by peer ID. Cancelling
    /// one asks that stream to send `Terminated` and close.
    pub fn connected_streams(&self) -> HashMap<String, CancellationToken> {
        lock(&self.streams)
            .iter()
            .filter(|(_, status)| status.is_connected())
            .map(|(id, status)| (id.clone(), status.done()))
            .collect()
    }

    pub fn delete_status(&self, id: &str) {
        lock(&self.streams).remove(id);
    }

    /// Whether the stream for `id` is healthy at the tracker clock's now.
    pub fn is_healthy(&self, id: &str, timeout: Duration) -> bool {
        let now = (self.clock())();
        self.stream_status(id)
            .is_some_and(|status| status.is_healthy(now, timeout))
    }
}
