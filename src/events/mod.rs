//! Event publishing interface.
//!
//! Subscribers receive a snapshot of the current state for their topic
//! followed by incremental events. Every event carries the store index at
//! which it was produced.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::proto::CheckServiceNode;
use crate::structs::{CaRoot, ReadyServerInfo, ServiceName};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The publisher closed the subscription, typically after the store was
    /// replaced. Resubscribe, from index 0 if the store was abandoned.
    #[error("subscription closed by server, client must reset state and resubscribe")]
    ForceClosed,

    #[error("subscription cancelled")]
    Cancelled,

    #[error("subscribe failed: {0}")]
    Other(String),
}

// ============================================================================
// Requests and events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ServiceHealth,
    CaRoots,
    ReadyServers,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    None,
    Service {
        service: ServiceName,
        peer_name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub topic: Topic,
    pub subject: Subject,
    pub token: String,
    /// Last index the subscriber has seen, or 0 for a fresh snapshot.
    pub index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOp {
    Register,
    Deregister,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Marks the end of the initial snapshot.
    EndOfSnapshot,
    /// The publisher cannot resume from the requested index; a new snapshot
    /// follows and previously received state must be discarded.
    NewSnapshotToFollow,
    ServiceHealth {
        op: HealthOp,
        instance: CheckServiceNode,
    },
    CaRoots(Vec<CaRoot>),
    ReadyServers(Vec<ReadyServerInfo>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub index: u64,
    pub payload: Payload,
}

impl Event {
    pub fn is_framing_event(&self) -> bool {
        matches!(
            self.payload,
            Payload::EndOfSnapshot | Payload::NewSnapshotToFollow
        )
    }
}

// ============================================================================
// Traits
// ============================================================================

/// A live subscription. Dropping it unsubscribes.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next event or for `cancel` to fire.
    async fn next(&mut self, cancel: &CancellationToken) -> Result<Event, SubscribeError>;
}

pub trait EventPublisher: Send + Sync {
    fn subscribe(&self, req: SubscribeRequest) -> Result<Box<dyn Subscription>, SubscribeError>;
}
