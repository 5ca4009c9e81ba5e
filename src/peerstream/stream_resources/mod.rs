//! Peer stream protocol: the Open handshake, secret exchange and the
//! per-stream loop that multiplexes inbound messages, local updates and
//! heartbeats.

use std::sync::Arc;

use futures::stream::BoxStream;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{debug, error, info, trace, warn};

use super::replication::{make_response, Importer};
use super::subscription_manager::{ManagerError, SubscriptionManager};
use super::subscription_tracker::ResourceSubscriptionTracker;
use super::tracker::{MutableStatus, TrackerError};
use super::PeerStreamServer;
use crate::connect::trust_domain_for_cluster;
use crate::proto::replication_message::{Open, Payload, Request};
use crate::proto::{ExchangeSecretRequest, ExchangeSecretResponse, ReplicationMessage};
use crate::proto_ext::not_leader_status;
use crate::resource::ResourceKind;
use crate::structs::{
    Peering, PeeringState, PeeringWriteRequest, SecretsRequest, SecretsWriteRequest,
};

/// Inbound half of a peer stream.
pub type InboundStream = BoxStream<'static, Result<ReplicationMessage, Status>>;

/// Outbound half of a peer stream. Sending an `Err` ends the stream with
/// that status.
pub type Outbound = mpsc::Sender<Result<ReplicationMessage, Status>>;

/// Stream-fatal failure. Converts into the status the peer sees.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("{message}")]
    NotLeader {
        message: String,
        leader_address: String,
    },

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Aborted(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),

    #[error("failed to register stream: {0}")]
    Register(#[from] TrackerError),

    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    #[error("stream ended unexpectedly")]
    UnexpectedEof,

    #[error("unexpected error receiving from the stream: {}", .0.message())]
    Recv(Status),

    #[error("{context}: outbound stream closed")]
    SendClosed { context: String },

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

impl StreamError {
    pub fn code(&self) -> Code {
        match self {
            StreamError::NotLeader { .. } => Code::FailedPrecondition,
            StreamError::InvalidArgument(_) => Code::InvalidArgument,
            StreamError::PermissionDenied(_) => Code::PermissionDenied,
            StreamError::Aborted(_) => Code::Aborted,
            StreamError::Unavailable(_) | StreamError::Manager(_) => Code::Unavailable,
            StreamError::Internal(_) => Code::Internal,
            StreamError::Recv(status) => status.code(),
            StreamError::Register(_)
            | StreamError::HeartbeatTimeout
            | StreamError::UnexpectedEof
            | StreamError::SendClosed { .. } => Code::Unknown,
        }
    }
}

impl From<StreamError> for Status {
    fn from(err: StreamError) -> Self {
        match &err {
            StreamError::NotLeader {
                message,
                leader_address,
            } => not_leader_status(message, leader_address),
            _ => Status::new(err.code(), err.to_string()),
        }
    }
}

/// Identity of one peer stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandleStreamRequest {
    /// Peering ID in the local cluster.
    pub local_id: String,
    /// Peering ID as known by the peer. Empty on the accepting side.
    pub remote_id: String,
    pub peer_name: String,
    /// Local partition the peering belongs to.
    pub partition: String,
}

impl HandleStreamRequest {
    pub fn is_dialer(&self) -> bool {
        !self.remote_id.is_empty()
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn trace_message(direction: &'static str, msg: &ReplicationMessage) {
    trace!(direction, payload = msg.payload_name(), message = ?msg.redacted(), "replication message");
}

/// Outbound side of a running stream with send bookkeeping.
struct StreamSender<'a> {
    outbound: &'a Outbound,
    status: &'a MutableStatus,
}

impl StreamSender<'_> {
    /// Only Responses count towards send success and failure; requests and
    /// heartbeats are protocol chatter.
    async fn send(&self, msg: ReplicationMessage, context: impl FnOnce() -> String) -> Result<(), StreamError> {
        trace_message("sent", &msg);
        let resource_id = match &msg.payload {
            Some(Payload::Response(resp)) => Some(resp.resource_id.clone()),
            _ => None,
        };

        match self.outbound.send(Ok(msg)).await {
            Ok(()) => {
                if resource_id.is_some() {
                    self.status.track_send_success();
                }
                Ok(())
            }
            Err(_) => {
                let context = context();
                if let Some(resource_id) = resource_id {
                    error!(%resource_id, "failed to send resource");
                    self.status.track_send_error(format!("{context}: outbound stream closed"));
                }
                Err(StreamError::SendClosed { context })
            }
        }
    }
}

/// Forwards inbound messages into a channel so the stream loop can select
/// on them. Stops at the first error, at end of stream or on `cancel`.
fn spawn_read_pump(
    mut inbound: InboundStream,
    cancel: CancellationToken,
) -> mpsc::Receiver<Result<ReplicationMessage, Status>> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return,
                item = inbound.next() => item,
            };
            let Some(item) = item else {
                return;
            };
            let last = item.is_err();
            if let Ok(msg) = &item {
                trace_message("received", msg);
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = tx.send(item) => {
                    if sent.is_err() || last {
                        return;
                    }
                }
            }
        }
    });
    rx
}

impl PeerStreamServer {
    fn check_leader(&self, message: &str) -> Result<(), StreamError> {
        if self.backends.leadership.is_leader() {
            return Ok(());
        }
        info!("{message}");
        Err(StreamError::NotLeader {
            message: message.to_string(),
            leader_address: self.backends.leadership.leader_address(),
        })
    }

    /// Swaps a one-time establishment secret for a new pending stream
    /// secret.
    pub async fn exchange_secret(
        &self,
        req: ExchangeSecretRequest,
    ) -> Result<ExchangeSecretResponse, Status> {
        self.check_leader("cannot exchange peering secrets on a follower node")?;

        let existing = self
            .backends
            .store
            .peering_secrets_read(None, &req.peer_id)
            .map_err(|err| Status::internal(format!("failed to read peering secret: {err}")))?;
        let valid = existing
            .and_then(|secrets| secrets.establishment_secret)
            .is_some_and(|secret| constant_time_eq(&secret, &req.establishment_secret));
        if !valid {
            return Err(Status::permission_denied(
                "invalid peering establishment secret",
            ));
        }

        let stream_secret = uuid::Uuid::new_v4().to_string();
        self.backends
            .backend
            .peering_secrets_write(SecretsWriteRequest {
                peer_id: req.peer_id.clone(),
                request: SecretsRequest::ExchangeSecret {
                    // Checked again by the store against concurrent exchanges.
                    establishment_secret: req.establishment_secret,
                    pending_stream_secret: stream_secret.clone(),
                },
            })
            .await
            .map_err(|err| Status::internal(format!("failed to persist peering secret: {err}")))?;

        info!(peer_id = %req.peer_id, "exchanged establishment secret for a stream secret");
        Ok(ExchangeSecretResponse { stream_secret })
    }

    /// Accepts a stream dialed by a peer. The first message must be Open.
    #[tracing::instrument(skip_all)]
    pub async fn stream_resources(
        &self,
        mut inbound: InboundStream,
        outbound: Outbound,
    ) -> Result<(), StreamError> {
        self.check_leader("cannot establish a peering stream on a follower node")?;

        let first = match inbound.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(status)) => {
                error!(error = %status, "failed to establish stream");
                return Err(StreamError::Recv(status));
            }
            None => return Err(StreamError::UnexpectedEof),
        };
        trace_message("received", &first);
        let Some(Payload::Open(open)) = first.payload else {
            return Err(StreamError::InvalidArgument(
                "first message when initiating a peering must be: Open".to_string(),
            ));
        };
        if open.peer_id.is_empty() {
            return Err(StreamError::InvalidArgument(
                "initial subscription request must specify a PeerID".to_string(),
            ));
        }

        let (_, peering) = self
            .backends
            .store
            .peering_read_by_id(None, &open.peer_id)
            .map_err(|err| {
                error!(peer_id = %open.peer_id, error = %err, "failed to look up peer");
                StreamError::Internal(format!("failed to find PeerID: {}", open.peer_id))
            })?;
        let Some(peering) = peering else {
            return Err(StreamError::InvalidArgument(format!(
                "initial subscription for unknown PeerID: {}",
                open.peer_id
            )));
        };

        if !peering.is_active() {
            // A terminated peering was ended by the peer itself.
            if peering.state != PeeringState::Terminated {
                let term = ReplicationMessage::terminated();
                trace_message("sent", &term);
                let _ = outbound.send(Ok(term)).await;
            }
            return Err(StreamError::Aborted(format!(
                "peering is marked as deleted: {}",
                open.peer_id
            )));
        }

        self.authorize_stream(&peering, open).await?;
        info!(peer_id = %peering.id, "accepted initial replication request from peer");

        if !peering.peer_id.is_empty() {
            return Err(StreamError::InvalidArgument(
                "expected PeerID to be empty; the wrong end of peering is being dialed".to_string(),
            ));
        }

        let req = HandleStreamRequest {
            local_id: peering.id,
            remote_id: String::new(),
            peer_name: peering.name,
            partition: peering.partition,
        };
        let result = self.handle_stream(req.clone(), inbound, outbound).await;
        if let Err(err) = &result {
            error!(peer_name = %req.peer_name, peer_id = %req.local_id, error = %err, "error handling stream");
        }
        result
    }

    /// Checks the stream secret of an Open message. A match on the pending
    /// secret promotes it to active and records the peer's locality.
    async fn authorize_stream(&self, peering: &Peering, open: Open) -> Result<(), StreamError> {
        let secrets = self
            .backends
            .store
            .peering_secrets_read(None, &open.peer_id)
            .map_err(|err| {
                error!(peer_id = %open.peer_id, error = %err, "failed to look up secrets for peering");
                StreamError::Internal(format!(
                    "failed to find peering secrets for PeerID: {}",
                    open.peer_id
                ))
            })?
            .ok_or_else(|| {
                error!(peer_id = %open.peer_id, "no known secrets for peering");
                StreamError::Internal(
                    "unable to authorize connection, peering must be re-established".to_string(),
                )
            })?;

        let active = &secrets.stream.active_secret_id;
        if !active.is_empty() && constant_time_eq(active, &open.stream_secret_id) {
            return Ok(());
        }

        let pending = &secrets.stream.pending_secret_id;
        if pending.is_empty() || !constant_time_eq(pending, &open.stream_secret_id) {
            return Err(StreamError::PermissionDenied(
                "invalid peering stream secret".to_string(),
            ));
        }

        let mut promoted = peering.clone();
        promoted.remote = open.remote;
        self.backends
            .backend
            .peering_write(PeeringWriteRequest {
                peering: promoted,
                secrets_request: Some(SecretsWriteRequest {
                    peer_id: peering.id.clone(),
                    request: SecretsRequest::PromotePending {
                        active_stream_secret: pending.clone(),
                    },
                }),
            })
            .await
            .map_err(|err| StreamError::Internal(format!("failed to persist peering: {err}")))?;
        debug!(peer_id = %peering.id, "promoted pending stream secret");
        Ok(())
    }

    /// Runs an established stream until it ends, recording the outcome on
    /// the stream's status. After a clean end the inbound side is drained
    /// until the peer hangs up.
    #[tracing::instrument(skip_all, fields(peer_name = %req.peer_name, peer_id = %req.local_id, dialer = req.is_dialer()))]
    pub async fn handle_stream(
        &self,
        req: HandleStreamRequest,
        inbound: InboundStream,
        outbound: Outbound,
    ) -> Result<(), StreamError> {
        let pump_cancel = CancellationToken::new();
        let mut recv = spawn_read_pump(inbound, pump_cancel.clone());

        let result = self.run_stream(&req, &mut recv, &outbound).await;
        match &result {
            Ok(()) => {
                self.tracker.disconnected_gracefully(&req.local_id);
                while let Some(item) = recv.recv().await {
                    if let Err(status) = item {
                        warn!(error = %status, "failed to tear down stream gracefully: peer may not have received termination message");
                        break;
                    }
                }
            }
            // The stream never owned the status.
            Err(StreamError::Register(_)) => {}
            Err(err) => self
                .tracker
                .disconnected_due_to_error(&req.local_id, err.to_string()),
        }
        pump_cancel.cancel();
        result
    }

    fn trust_domain(&self) -> Result<String, StreamError> {
        let (_, config) = self.backends.store.ca_config(None).map_err(|err| {
            error!(error = %err, "failed to read Connect CA Config");
            StreamError::Internal("failed to read Connect CA Config".to_string())
        })?;
        match config {
            Some(config) => Ok(trust_domain_for_cluster(&config.cluster_id)),
            None => {
                warn!("cannot begin stream because Connect CA is not yet initialized");
                Err(StreamError::Unavailable(
                    "Connect CA is not yet initialized".to_string(),
                ))
            }
        }
    }

    async fn run_stream(
        &self,
        req: &HandleStreamRequest,
        recv: &mut mpsc::Receiver<Result<ReplicationMessage, Status>>,
        outbound: &Outbound,
    ) -> Result<(), StreamError> {
        debug!("handling stream for peer");
        let status = self.tracker.connected(&req.local_id)?;

        // The cluster ID cannot change, so one read per stream is enough.
        let trust_domain = if self.config.connect_enabled {
            self.trust_domain()?
        } else {
            String::new()
        };

        let stream_cancel = CancellationToken::new();
        let _stop_watchers = stream_cancel.clone().drop_guard();

        let remote_subs = Arc::new(ResourceSubscriptionTracker::new());
        let manager = SubscriptionManager::new(
            self.config.clone(),
            trust_domain,
            self.backends.store.clone(),
            self.backends.publisher.clone(),
            remote_subs.clone(),
        );
        let mut updates =
            manager.subscribe(&stream_cancel, &req.local_id, &req.peer_name, &req.partition);
        let importer = Importer::new(
            self.backends.store.clone(),
            self.backends.backend.clone(),
            req.peer_name.as_str(),
            req.partition.as_str(),
        );

        let sender = StreamSender {
            outbound,
            status: &status,
        };

        for kind in ResourceKind::initial_subscriptions(req.is_dialer()) {
            sender
                .send(ReplicationMessage::subscribe(kind, &req.remote_id), || {
                    format!("failed to send subscription for {:?} to stream", kind.type_url())
                })
                .await?;
        }

        let interval = self.config.outgoing_heartbeat_interval();
        let mut outgoing_heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        outgoing_heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let incoming_timeout = self.config.incoming_heartbeat_timeout();
        let incoming_deadline = tokio::time::sleep(incoming_timeout);
        tokio::pin!(incoming_deadline);

        let done = status.done();
        let mut nonce: u64 = 0;

        loop {
            tokio::select! {
                // The peering was deleted locally.
                _ = done.cancelled() => {
                    info!("ending stream");
                    sender
                        .send(ReplicationMessage::terminated(), || "failed to send to stream".to_string())
                        .await?;
                    debug!("deleting stream status");
                    self.tracker.delete_status(&req.local_id);
                    return Ok(());
                }

                _ = &mut incoming_deadline => return Err(StreamError::HeartbeatTimeout),

                _ = outgoing_heartbeat.tick() => {
                    if let Err(err) = sender
                        .send(ReplicationMessage::heartbeat(), || "failed to send heartbeat".to_string())
                        .await
                    {
                        warn!(error = %err, "error sending heartbeat");
                    }
                }

                received = recv.recv() => {
                    let msg = match received {
                        Some(Ok(msg)) => msg,
                        Some(Err(err)) => {
                            let err = StreamError::Recv(err);
                            status.track_recv_error(err.to_string());
                            return Err(err);
                        }
                        None => {
                            let err = StreamError::UnexpectedEof;
                            status.track_recv_error(err.to_string());
                            return Err(err);
                        }
                    };

                    self.check_leader("node is not a leader anymore; cannot continue streaming")?;

                    match msg.payload {
                        Some(Payload::Request(request)) => {
                            handle_request(req, &status, &remote_subs, request)?;
                        }
                        Some(Payload::Response(resp)) => {
                            let (reply, result) = importer.process_response(&status, &resp).await;
                            match result {
                                Ok(()) => status.track_recv_resource_success(),
                                Err(err) => {
                                    error!(
                                        resource_url = %resp.resource_url,
                                        resource_id = %resp.resource_id,
                                        error = %err,
                                        "failed to persist resource"
                                    );
                                    status.track_recv_error(err.message);
                                }
                            }
                            sender.send(reply, || "failed to send to stream".to_string()).await?;
                        }
                        Some(Payload::Terminated(_)) => {
                            info!("peering was deleted by our peer: marking peering as terminated and cleaning up imported resources");
                            if let Err(err) = self.backends.backend.peering_terminate_by_id(&req.local_id).await {
                                error!(error = %err, "failed to mark peering as terminated");
                            }
                            return Ok(());
                        }
                        Some(Payload::Heartbeat(_)) => {
                            status.track_recv_heartbeat();
                            incoming_deadline.as_mut().reset(Instant::now() + incoming_timeout);
                        }
                        Some(Payload::Open(_)) | None => {
                            debug!("ignoring unexpected message on established stream");
                        }
                    }
                }

                update = updates.recv() => {
                    let update = match update {
                        Some(Ok(update)) => update,
                        Some(Err(err)) => return Err(err.into()),
                        None => {
                            return Err(StreamError::Internal(
                                "subscription manager stopped unexpectedly".to_string(),
                            ))
                        }
                    };
                    let Some(mut resp) = make_response(&status, &update) else {
                        continue;
                    };

                    nonce += 1;
                    resp.nonce = format!("{nonce:08x}");

                    sender
                        .send(ReplicationMessage::response(resp), || {
                            format!("failed to push data for {:?}", update.id.resource_id())
                        })
                        .await?;
                }
            }
        }
    }
}

/// Subscription, ACK and NACK handling for an inbound Request.
fn handle_request(
    req: &HandleStreamRequest,
    status: &MutableStatus,
    remote_subs: &ResourceSubscriptionTracker,
    request: Request,
) -> Result<(), StreamError> {
    let Ok(kind) = ResourceKind::from_type_url(&request.resource_url) else {
        return Err(StreamError::InvalidArgument(format!(
            "subscription request to unknown resource URL: {}",
            request.resource_url
        )));
    };

    if !remote_subs.is_subscribed(kind) {
        if req.is_dialer() && !request.peer_id.is_empty() && request.peer_id != req.remote_id {
            return Err(StreamError::InvalidArgument(format!(
                "initial subscription requests for a resource type must have consistent PeerID values: got={:?} expected={:?}",
                request.peer_id, req.remote_id
            )));
        }
        if !request.response_nonce.is_empty() {
            return Err(StreamError::InvalidArgument(
                "initial subscription requests for a resource type must not contain a nonce"
                    .to_string(),
            ));
        }
        if request.error.is_some() {
            return Err(StreamError::InvalidArgument(
                "initial subscription request for a resource type must not contain an error"
                    .to_string(),
            ));
        }

        if remote_subs.subscribe(kind) {
            info!(resource_url = %request.resource_url, "subscribing to resource type");
        }
        status.track_ack();
        return Ok(());
    }

    match request.error {
        None => status.track_ack(),
        Some(error) => {
            warn!(code = error.code, error = %error.message, "client peer was unable to apply resource");
            status.track_nack(format!(
                "client peer was unable to apply resource: {}",
                error.message
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
