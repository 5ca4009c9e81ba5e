//! Peering replication streams.
//!
//! A [`PeerStreamServer`] owns the stream tracker and the catalog handles
//! every stream shares. Each accepted or dialed stream runs its own
//! subscription manager and importer.

pub mod health_snapshot;
pub mod replication;
pub mod stream_resources;
pub mod subscription_manager;
pub mod subscription_state;
pub mod subscription_tracker;
pub mod subscription_view;
pub mod tracker;

use std::collections::HashMap;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::catalog::Backends;
use crate::config::PeerStreamConfig;
use crate::proto::ReplicationMessage;

pub use stream_resources::{HandleStreamRequest, InboundStream, Outbound, StreamError};
pub use tracker::Tracker;

/// Outbound buffer of a served stream.
const OUTBOUND_BUFFER: usize = 32;

#[derive(Clone)]
pub struct PeerStreamServer {
    backends: Backends,
    config: PeerStreamConfig,
    tracker: Arc<Tracker>,
}

impl PeerStreamServer {
    pub fn new(backends: Backends, config: PeerStreamConfig) -> Self {
        Self::with_tracker(backends, config, Arc::new(Tracker::new()))
    }

    /// Uses a tracker owned by the caller, e.g. one with a test clock.
    pub fn with_tracker(backends: Backends, config: PeerStreamConfig, tracker: Arc<Tracker>) -> Self {
        Self {
            backends,
            config,
            tracker,
        }
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn stream_status(&self, peer_id: &str) -> Option<tracker::Status> {
        self.tracker.stream_status(peer_id)
    }

    /// Done signals of every connected stream. Cancelling one terminates
    /// that stream.
    pub fn connected_streams(&self) -> HashMap<String, CancellationToken> {
        self.tracker.connected_streams()
    }

    /// Runs an accepted stream in the background and returns its outbound
    /// side. A stream-fatal error is delivered as the final item.
    pub fn serve_stream<S>(&self, inbound: S) -> ReceiverStream<Result<ReplicationMessage, Status>>
    where
        S: Stream<Item = Result<ReplicationMessage, Status>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let server = self.clone();
        let inbound: InboundStream = Box::pin(inbound);
        tokio::spawn(async move {
            if let Err(err) = server.stream_resources(inbound, tx.clone()).await {
                let _ = tx.send(Err(err.into())).await;
            }
        });
        ReceiverStream::new(rx)
    }
}
