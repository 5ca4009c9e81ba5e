use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use super::*;
use crate::catalog::memory::InMemoryCatalog;
use crate::catalog::{Backends, CatalogBackend, StateStore};
use crate::config::PeerStreamConfig;
use crate::proto::replication_message::Response;
use crate::proto::{Operation, RemoteInfo};
use crate::proto_ext::leader_address;

const PEERING_ID: &str = "peering-id";
const PEER_NAME: &str = "my-peer";
const SECRET: &str = "stream-secret";

async fn write_peering(catalog: &InMemoryCatalog, peering: Peering, secrets: Option<SecretsRequest>) {
    let peer_id = peering.id.clone();
    catalog
        .peering_write(PeeringWriteRequest {
            peering,
            secrets_request: secrets.map(|request| SecretsWriteRequest { peer_id, request }),
        })
        .await
        .unwrap();
}

fn active_peering() -> Peering {
    Peering {
        id: PEERING_ID.to_string(),
        name: PEER_NAME.to_string(),
        state: PeeringState::Active,
        ..Default::default()
    }
}

async fn setup(config: PeerStreamConfig) -> (Arc<InMemoryCatalog>, PeerStreamServer) {
    let catalog = Arc::new(InMemoryCatalog::new());
    write_peering(
        &catalog,
        active_peering(),
        Some(SecretsRequest::PromotePending {
            active_stream_secret: SECRET.to_string(),
        }),
    )
    .await;
    let server = PeerStreamServer::new(Backends::from_single(catalog.clone()), config);
    (catalog, server)
}

fn open(peer_id: &str, secret: &str) -> ReplicationMessage {
    ReplicationMessage {
        payload: Some(Payload::Open(Open {
            peer_id: peer_id.to_string(),
            stream_secret_id: secret.to_string(),
            remote: None,
        })),
    }
}

/// The peer's end of a stream under test.
struct Peer {
    tx: Option<mpsc::Sender<Result<ReplicationMessage, Status>>>,
    rx: mpsc::Receiver<Result<ReplicationMessage, Status>>,
    handle: JoinHandle<Result<(), StreamError>>,
}

fn channels() -> (
    mpsc::Sender<Result<ReplicationMessage, Status>>,
    InboundStream,
    Outbound,
    mpsc::Receiver<Result<ReplicationMessage, Status>>,
) {
    let (tx, in_rx) = mpsc::channel(8);
    let (out_tx, rx) = mpsc::channel(32);
    (tx, Box::pin(ReceiverStream::new(in_rx)), out_tx, rx)
}

impl Peer {
    fn accept(server: &PeerStreamServer) -> Self {
        let (tx, inbound, outbound, rx) = channels();
        let server = server.clone();
        let handle = tokio::spawn(async move { server.stream_resources(inbound, outbound).await });
        Self {
            tx: Some(tx),
            rx,
            handle,
        }
    }

    fn dial(server: &PeerStreamServer, req: HandleStreamRequest) -> Self {
        let (tx, inbound, outbound, rx) = channels();
        let server = server.clone();
        let handle = tokio::spawn(async move { server.handle_stream(req, inbound, outbound).await });
        Self {
            tx: Some(tx),
            rx,
            handle,
        }
    }

    async fn send(&self, msg: ReplicationMessage) {
        self.tx
            .as_ref()
            .expect("peer already hung up")
            .send(Ok(msg))
            .await
            .expect("stream handler stopped reading");
    }

    async fn recv_any(&mut self) -> Option<ReplicationMessage> {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for a message")
            .map(|item| item.expect("unexpected error item"))
    }

    /// Next message that is not a heartbeat.
    async fn recv(&mut self) -> ReplicationMessage {
        loop {
            let msg = self.recv_any().await.expect("stream closed");
            if !matches!(msg.payload, Some(Payload::Heartbeat(_))) {
                return msg;
            }
        }
    }

    async fn recv_initial_subscriptions(&mut self) {
        for kind in ResourceKind::initial_subscriptions(false) {
            assert_eq!(self.recv().await, ReplicationMessage::subscribe(kind, ""));
        }
    }

    fn hang_up(&mut self) {
        self.tx = None;
    }

    async fn result(self) -> Result<(), StreamError> {
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("stream did not end")
            .expect("stream task panicked")
    }

    async fn finish(mut self) -> Result<(), StreamError> {
        self.hang_up();
        self.result().await
    }
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

async fn established(config: PeerStreamConfig) -> (Arc<InMemoryCatalog>, PeerStreamServer, Peer) {
    let (catalog, server) = setup(config).await;
    let mut peer = Peer::accept(&server);
    peer.send(open(PEERING_ID, SECRET)).await;
    peer.recv_initial_subscriptions().await;
    (catalog, server, peer)
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_follower_rejects_stream_with_leader_address() {
    let (catalog, server) = setup(PeerStreamConfig::default()).await;
    catalog.set_leader(false, "10.0.0.1:8300");

    let peer = Peer::accept(&server);
    let err = peer.result().await.unwrap_err();
    let status: Status = err.into();

    assert_eq!(status.code(), Code::FailedPrecondition);
    assert_eq!(
        status.message(),
        "cannot establish a peering stream on a follower node"
    );
    assert_eq!(leader_address(&status).as_deref(), Some("10.0.0.1:8300"));
}

#[tokio::test]
async fn test_first_message_must_be_open() {
    let (_, server) = setup(PeerStreamConfig::default()).await;
    let peer = Peer::accept(&server);
    peer.send(ReplicationMessage::subscribe(ResourceKind::ExportedService, PEERING_ID))
        .await;

    let err = peer.finish().await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(
        err.to_string(),
        "first message when initiating a peering must be: Open"
    );
}

#[tokio::test]
async fn test_open_requires_peer_id() {
    let (_, server) = setup(PeerStreamConfig::default()).await;
    let peer = Peer::accept(&server);
    peer.send(open("", SECRET)).await;

    let err = peer.finish().await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(
        err.to_string(),
        "initial subscription request must specify a PeerID"
    );
}

#[tokio::test]
async fn test_unknown_peer_is_rejected() {
    let (_, server) = setup(PeerStreamConfig::default()).await;
    let peer = Peer::accept(&server);
    peer.send(open("nope", SECRET)).await;

    let err = peer.finish().await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(err.to_string(), "initial subscription for unknown PeerID: nope");
}

#[tokio::test]
async fn test_deleted_peering_is_sent_terminated() {
    let (catalog, server) = setup(PeerStreamConfig::default()).await;
    write_peering(
        &catalog,
        Peering {
            state: PeeringState::Deleting,
            ..active_peering()
        },
        None,
    )
    .await;

    let mut peer = Peer::accept(&server);
    peer.send(open(PEERING_ID, SECRET)).await;

    assert_eq!(peer.recv().await, ReplicationMessage::terminated());
    let err = peer.finish().await.unwrap_err();
    assert_eq!(err.code(), Code::Aborted);
    assert_eq!(err.to_string(), "peering is marked as deleted: peering-id");
}

#[tokio::test]
async fn test_terminated_peering_is_not_sent_terminated_again() {
    let (catalog, server) = setup(PeerStreamConfig::default()).await;
    catalog.peering_terminate_by_id(PEERING_ID).await.unwrap();

    let mut peer = Peer::accept(&server);
    peer.send(open(PEERING_ID, SECRET)).await;
    tokio::time::timeout(Duration::from_secs(5), &mut peer.handle)
        .await
        .expect("stream did not end")
        .expect("stream task panicked")
        .unwrap_err();

    assert!(peer.recv_any().await.is_none());
}

#[tokio::test]
async fn test_wrong_stream_secret_is_rejected() {
    let (_, server) = setup(PeerStreamConfig::default()).await;
    let peer = Peer::accept(&server);
    peer.send(open(PEERING_ID, "guess")).await;

    let err = peer.finish().await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    assert_eq!(err.to_string(), "invalid peering stream secret");
}

#[tokio::test]
async fn test_peering_without_secrets_cannot_connect() {
    let (catalog, server) = setup(PeerStreamConfig::default()).await;
    write_peering(
        &catalog,
        Peering {
            id: "other-id".to_string(),
            name: "other".to_string(),
            state: PeeringState::Active,
            ..Default::default()
        },
        None,
    )
    .await;

    let peer = Peer::accept(&server);
    peer.send(open("other-id", SECRET)).await;

    let err = peer.finish().await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(
        err.to_string(),
        "unable to authorize connection, peering must be re-established"
    );
}

#[tokio::test]
async fn test_pending_secret_is_promoted() {
    let catalog = Arc::new(InMemoryCatalog::new());
    write_peering(
        &catalog,
        active_peering(),
        Some(SecretsRequest::GenerateToken {
            establishment_secret: "est".to_string(),
        }),
    )
    .await;
    catalog
        .peering_secrets_write(SecretsWriteRequest {
            peer_id: PEERING_ID.to_string(),
            request: SecretsRequest::ExchangeSecret {
                establishment_secret: "est".to_string(),
                pending_stream_secret: "pending".to_string(),
            },
        })
        .await
        .unwrap();
    let server = PeerStreamServer::new(
        Backends::from_single(catalog.clone()),
        PeerStreamConfig::default(),
    );

    let remote = RemoteInfo {
        partition: "part".to_string(),
        datacenter: "dc2".to_string(),
    };
    let mut peer = Peer::accept(&server);
    peer.send(ReplicationMessage {
        payload: Some(Payload::Open(Open {
            peer_id: PEERING_ID.to_string(),
            stream_secret_id: "pending".to_string(),
            remote: Some(remote.clone()),
        })),
    })
    .await;
    peer.recv_initial_subscriptions().await;

    let secrets = catalog.peering_secrets_read(None, PEERING_ID).unwrap().unwrap();
    assert_eq!(secrets.stream.active_secret_id, "pending");
    assert!(secrets.stream.pending_secret_id.is_empty());

    let (_, peering) = catalog.peering_read_by_id(None, PEERING_ID).unwrap();
    assert_eq!(peering.unwrap().remote, Some(remote));
}

#[tokio::test]
async fn test_dialing_the_wrong_end_is_rejected() {
    let (catalog, server) = setup(PeerStreamConfig::default()).await;
    write_peering(
        &catalog,
        Peering {
            peer_id: "their-id".to_string(),
            ..active_peering()
        },
        None,
    )
    .await;

    let peer = Peer::accept(&server);
    peer.send(open(PEERING_ID, SECRET)).await;

    let err = peer.finish().await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(
        err.to_string(),
        "expected PeerID to be empty; the wrong end of peering is being dialed"
    );
}

#[tokio::test]
async fn test_second_stream_for_a_peer_is_rejected() {
    let (_, server, _first) = established(PeerStreamConfig::default()).await;

    let second = Peer::accept(&server);
    second.send(open(PEERING_ID, SECRET)).await;
    let err = second.finish().await.unwrap_err();

    assert!(matches!(err, StreamError::Register(_)));
    assert!(err.to_string().starts_with("failed to register stream"));
    assert!(server.stream_status(PEERING_ID).unwrap().connected);
}

#[tokio::test]
async fn test_connect_requires_initialized_ca() {
    let (_, server) = setup(PeerStreamConfig::default().with_connect_enabled(true)).await;
    let peer = Peer::accept(&server);
    peer.send(open(PEERING_ID, SECRET)).await;

    let err = peer.finish().await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(err.to_string(), "Connect CA is not yet initialized");
    let status = server.stream_status(PEERING_ID).unwrap();
    assert!(!status.connected);
    assert_eq!(status.disconnect_error_message, "Connect CA is not yet initialized");
}

// ============================================================================
// Established streams
// ============================================================================

#[tokio::test]
async fn test_established_stream_is_tracked() {
    let (_, server, _peer) = established(PeerStreamConfig::default()).await;

    let status = server.stream_status(PEERING_ID).unwrap();
    assert!(status.connected);
    assert!(server.connected_streams().contains_key(PEERING_ID));
}

#[tokio::test]
async fn test_exported_list_is_sent_after_subscription() {
    let (_, server, mut peer) = established(PeerStreamConfig::default()).await;
    peer.send(ReplicationMessage::subscribe(ResourceKind::ExportedServiceList, ""))
        .await;
    peer.send(ReplicationMessage::subscribe(ResourceKind::ExportedService, ""))
        .await;

    let Some(Payload::Response(resp)) = peer.recv().await.payload else {
        panic!("expected a response");
    };
    assert_eq!(resp.nonce, "00000001");
    assert_eq!(resp.resource_url, ResourceKind::ExportedServiceList.type_url());
    assert_eq!(resp.resource_id, "exported-service-list");
    assert_eq!(resp.operation, Operation::Upsert as i32);

    peer.send(ReplicationMessage::ack(&resp.resource_url, &resp.nonce))
        .await;
    eventually(|| {
        server
            .stream_status(PEERING_ID)
            .is_some_and(|s| s.last_send_success.is_some() && s.last_ack.is_some())
    })
    .await;
}

#[tokio::test]
async fn test_unspecified_operation_is_nacked_with_the_same_nonce() {
    let (_, server, mut peer) = established(PeerStreamConfig::default()).await;
    peer.send(ReplicationMessage::response(Response {
        nonce: "0000000a".to_string(),
        resource_url: ResourceKind::ExportedService.type_url().to_string(),
        resource_id: "api".to_string(),
        resource: None,
        operation: Operation::Unspecified as i32,
    }))
    .await;

    let Some(Payload::Request(reply)) = peer.recv().await.payload else {
        panic!("expected a request");
    };
    assert_eq!(reply.response_nonce, "0000000a");
    let error = reply.error.unwrap();
    assert_eq!(error.code, Code::InvalidArgument as i32);
    assert_eq!(error.message, "unsupported operation: \"OPERATION_UNSPECIFIED\"");

    let status = server.stream_status(PEERING_ID).unwrap();
    assert_eq!(
        status.last_recv_error_message,
        "unsupported operation: \"OPERATION_UNSPECIFIED\""
    );
    assert!(status.connected);
}

#[tokio::test]
async fn test_nack_is_recorded() {
    let (_, server, peer) = established(PeerStreamConfig::default()).await;
    let url = ResourceKind::ExportedServiceList.type_url();
    peer.send(ReplicationMessage::subscribe(ResourceKind::ExportedServiceList, ""))
        .await;
    peer.send(ReplicationMessage::nack(url, "00000001", Code::Internal, "boom"))
        .await;

    eventually(|| {
        server.stream_status(PEERING_ID).is_some_and(|s| {
            s.last_nack_message == "client peer was unable to apply resource: boom"
        })
    })
    .await;
}

#[tokio::test]
async fn test_unknown_subscription_url_ends_stream() {
    let (_, server, peer) = established(PeerStreamConfig::default()).await;
    peer.send(ReplicationMessage::ack("type.googleapis.com/bogus", ""))
        .await;

    let err = peer.result().await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(
        err.to_string(),
        "subscription request to unknown resource URL: type.googleapis.com/bogus"
    );
    let status = server.stream_status(PEERING_ID).unwrap();
    assert!(!status.connected);
}

#[tokio::test]
async fn test_initial_subscription_must_not_carry_a_nonce() {
    let (_, _, peer) = established(PeerStreamConfig::default()).await;
    peer.send(ReplicationMessage::ack(
        ResourceKind::TrustBundle.type_url(),
        "00000001",
    ))
    .await;

    let err = peer.result().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "initial subscription requests for a resource type must not contain a nonce"
    );
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let config = PeerStreamConfig::default()
        .with_incoming_heartbeat_timeout(Duration::from_millis(50));
    let started = Instant::now();
    let (_, server, peer) = established(config).await;

    let err = peer.result().await.unwrap_err();
    assert!(matches!(err, StreamError::HeartbeatTimeout));
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "timed out after {:?}",
        started.elapsed()
    );

    let status = server.stream_status(PEERING_ID).unwrap();
    assert!(!status.connected);
    assert_eq!(status.disconnect_error_message, "heartbeat timeout");
    assert!(status.disconnect_time.is_some());
}

#[tokio::test]
async fn test_heartbeats_keep_stream_alive() {
    let config = PeerStreamConfig::default()
        .with_incoming_heartbeat_timeout(Duration::from_millis(200));
    let (_, server, peer) = established(config).await;

    for _ in 0..8 {
        peer.send(ReplicationMessage::heartbeat()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(!peer.handle.is_finished());
    let status = server.stream_status(PEERING_ID).unwrap();
    assert!(status.connected);
    assert!(status.last_recv_heartbeat.is_some());
}

#[tokio::test]
async fn test_outgoing_heartbeats_are_sent() {
    let config = PeerStreamConfig::default()
        .with_outgoing_heartbeat_interval(Duration::from_millis(20));
    let (_, _, mut peer) = established(config).await;

    let msg = peer.recv_any().await.unwrap();
    assert_eq!(msg, ReplicationMessage::heartbeat());
}

#[tokio::test]
async fn test_zero_heartbeat_interval_still_sends_heartbeats() {
    let config = PeerStreamConfig::default().with_outgoing_heartbeat_interval(Duration::ZERO);
    let (_, server, mut peer) = established(config).await;

    let msg = peer.recv_any().await.unwrap();
    assert_eq!(msg, ReplicationMessage::heartbeat());
    assert!(!peer.handle.is_finished());
    assert!(server.stream_status(PEERING_ID).unwrap().connected);
}

#[tokio::test]
async fn test_peer_termination_marks_peering_terminated() {
    let (catalog, server, peer) = established(PeerStreamConfig::default()).await;
    peer.send(ReplicationMessage::terminated()).await;

    peer.finish().await.unwrap();

    let (_, peering) = catalog.peering_read_by_id(None, PEERING_ID).unwrap();
    assert_eq!(peering.unwrap().state, PeeringState::Terminated);
    let status = server.stream_status(PEERING_ID).unwrap();
    assert!(!status.connected);
    assert!(status.disconnect_error_message.is_empty());
}

#[tokio::test]
async fn test_local_deletion_sends_terminated() {
    let (_, server, mut peer) = established(PeerStreamConfig::default()).await;

    server.connected_streams()[PEERING_ID].cancel();

    assert_eq!(peer.recv().await, ReplicationMessage::terminated());
    peer.finish().await.unwrap();
    assert!(server.stream_status(PEERING_ID).is_none());
}

#[tokio::test]
async fn test_leadership_loss_ends_stream() {
    let (catalog, _, peer) = established(PeerStreamConfig::default()).await;
    catalog.set_leader(false, "10.0.0.1:8300");
    peer.send(ReplicationMessage::heartbeat()).await;

    let status: Status = peer.result().await.unwrap_err().into();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert_eq!(
        status.message(),
        "node is not a leader anymore; cannot continue streaming"
    );
    assert_eq!(leader_address(&status).as_deref(), Some("10.0.0.1:8300"));
}

#[tokio::test]
async fn test_peer_hanging_up_is_an_error() {
    let (_, server, peer) = established(PeerStreamConfig::default()).await;

    let err = peer.finish().await.unwrap_err();
    assert!(matches!(err, StreamError::UnexpectedEof));
    let status = server.stream_status(PEERING_ID).unwrap();
    assert_eq!(status.last_recv_error_message, "stream ended unexpectedly");
    assert_eq!(status.disconnect_error_message, "stream ended unexpectedly");
}

// ============================================================================
// Dialer side
// ============================================================================

fn dialer_request() -> HandleStreamRequest {
    HandleStreamRequest {
        local_id: PEERING_ID.to_string(),
        remote_id: "remote-id".to_string(),
        peer_name: PEER_NAME.to_string(),
        partition: "default".to_string(),
    }
}

#[tokio::test]
async fn test_dialer_subscribes_to_server_addresses() {
    let (_, server) = setup(PeerStreamConfig::default()).await;
    let mut peer = Peer::dial(&server, dialer_request());

    for kind in ResourceKind::initial_subscriptions(true) {
        assert_eq!(
            peer.recv().await,
            ReplicationMessage::subscribe(kind, "remote-id")
        );
    }
}

#[tokio::test]
async fn test_dialer_rejects_inconsistent_peer_id() {
    let (_, server) = setup(PeerStreamConfig::default()).await;
    let mut peer = Peer::dial(&server, dialer_request());
    for _ in ResourceKind::initial_subscriptions(true) {
        peer.recv().await;
    }

    peer.send(ReplicationMessage::subscribe(ResourceKind::TrustBundle, "someone-else"))
        .await;
    let err = peer.result().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "initial subscription requests for a resource type must have consistent PeerID values: got=\"someone-else\" expected=\"remote-id\""
    );
}

// ============================================================================
// Secret exchange
// ============================================================================

async fn with_establishment_secret() -> (Arc<InMemoryCatalog>, PeerStreamServer) {
    let (catalog, server) = setup(PeerStreamConfig::default()).await;
    catalog
        .peering_secrets_write(SecretsWriteRequest {
            peer_id: PEERING_ID.to_string(),
            request: SecretsRequest::GenerateToken {
                establishment_secret: "est".to_string(),
            },
        })
        .await
        .unwrap();
    (catalog, server)
}

#[tokio::test]
async fn test_exchange_secret_issues_pending_stream_secret() {
    let (catalog, server) = with_establishment_secret().await;

    let resp = server
        .exchange_secret(ExchangeSecretRequest {
            peer_id: PEERING_ID.to_string(),
            establishment_secret: "est".to_string(),
        })
        .await
        .unwrap();

    assert!(uuid::Uuid::parse_str(&resp.stream_secret).is_ok());
    let secrets = catalog.peering_secrets_read(None, PEERING_ID).unwrap().unwrap();
    assert_eq!(secrets.stream.pending_secret_id, resp.stream_secret);
    assert_eq!(secrets.stream.active_secret_id, SECRET);
    assert!(secrets.establishment_secret.is_none());
}

#[tokio::test]
async fn test_exchange_secret_rejects_wrong_secret() {
    let (_, server) = with_establishment_secret().await;

    let err = server
        .exchange_secret(ExchangeSecretRequest {
            peer_id: PEERING_ID.to_string(),
            establishment_secret: "nope".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    assert_eq!(err.message(), "invalid peering establishment secret");
}

#[tokio::test]
async fn test_exchange_secret_is_single_use() {
    let (_, server) = with_establishment_secret().await;
    let req = ExchangeSecretRequest {
        peer_id: PEERING_ID.to_string(),
        establishment_secret: "est".to_string(),
    };

    server.exchange_secret(req.clone()).await.unwrap();
    let err = server.exchange_secret(req).await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
}

#[test]
fn test_stream_error_codes() {
    let status: Status = StreamError::HeartbeatTimeout.into();
    assert_eq!(status.code(), Code::Unknown);
    assert_eq!(status.message(), "heartbeat timeout");

    let status: Status = StreamError::Internal("boom".to_string()).into();
    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "boom");
}
