//! Shared utilities for integration tests.
//!
//! Runs an accepting cluster on an in-memory catalog and drives its peer
//! stream from the dialing side through channels.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::Status;

use meshpeer::catalog::memory::InMemoryCatalog;
use meshpeer::catalog::{Backends, CatalogBackend};
use meshpeer::config::PeerStreamConfig;
use meshpeer::proto::replication_message::{Open, Payload, Response};
use meshpeer::proto::{CheckServiceNode, HealthCheck, Node, NodeService, ReplicationMessage};
use meshpeer::resource::ResourceKind;
use meshpeer::structs::{
    health, ExportedServiceList, Peering, PeeringState, PeeringWriteRequest, SecretsRequest,
    SecretsWriteRequest, ServiceName,
};
use meshpeer::PeerStreamServer;

pub const PEERING_ID: &str = "peering-id";
pub const PEER_NAME: &str = "my-peer";
pub const STREAM_SECRET: &str = "stream-secret";

/// How long a test waits for any single message.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Cluster {
    pub catalog: Arc<InMemoryCatalog>,
    pub server: PeerStreamServer,
}

/// Accepting cluster with one active peering named `my-peer`.
pub async fn accepting_cluster(config: PeerStreamConfig) -> Cluster {
    let _ = meshpeer::utils::bootstrap::try_init_tracing();

    let catalog = Arc::new(InMemoryCatalog::new());
    catalog
        .peering_write(PeeringWriteRequest {
            peering: Peering {
                id: PEERING_ID.to_string(),
                name: PEER_NAME.to_string(),
                state: PeeringState::Active,
                ..Default::default()
            },
            secrets_request: Some(SecretsWriteRequest {
                peer_id: PEERING_ID.to_string(),
                request: SecretsRequest::PromotePending {
                    active_stream_secret: STREAM_SECRET.to_string(),
                },
            }),
        })
        .await
        .expect("write peering");

    let server = PeerStreamServer::new(Backends::from_single(catalog.clone()), config);
    Cluster { catalog, server }
}

impl Cluster {
    pub fn export(&self, services: &[&str]) {
        self.catalog
            .set_exported_services(
                PEER_NAME,
                ExportedServiceList {
                    services: services.iter().map(|s| ServiceName::new(*s)).collect(),
                    disco_chains: BTreeMap::new(),
                },
            )
            .expect("set exports");
    }
}

/// The dialing side of one stream.
pub struct Dialer {
    tx: Option<mpsc::Sender<Result<ReplicationMessage, Status>>>,
    rx: ReceiverStream<Result<ReplicationMessage, Status>>,
}

impl Dialer {
    pub fn connect(server: &PeerStreamServer) -> Self {
        let (tx, inbound) = mpsc::channel(8);
        let rx = server.serve_stream(ReceiverStream::new(inbound));
        Self { tx: Some(tx), rx }
    }

    pub async fn send(&self, msg: ReplicationMessage) {
        self.tx
            .as_ref()
            .expect("dialer already hung up")
            .send(Ok(msg))
            .await
            .expect("server stopped reading");
    }

    pub async fn open(&self) {
        self.send(open_message(PEERING_ID, STREAM_SECRET)).await;
    }

    /// Next item from the server, heartbeats included. `None` once the
    /// server closed the stream.
    pub async fn next_item(&mut self) -> Option<Result<ReplicationMessage, Status>> {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.next())
            .await
            .expect("timed out waiting for the server")
    }

    /// Next non-heartbeat message.
    pub async fn recv(&mut self) -> ReplicationMessage {
        loop {
            let msg = self
                .next_item()
                .await
                .expect("stream closed")
                .expect("stream failed");
            if !matches!(msg.payload, Some(Payload::Heartbeat(_))) {
                return msg;
            }
        }
    }

    pub async fn recv_response(&mut self) -> Response {
        match self.recv().await.payload {
            Some(Payload::Response(resp)) => resp,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    /// Final status the server ended the stream with.
    pub async fn recv_error(&mut self) -> Status {
        loop {
            match self.next_item().await {
                Some(Ok(_)) => continue,
                Some(Err(status)) => return status,
                None => panic!("stream closed without an error"),
            }
        }
    }

    /// Reads the initial subscriptions and subscribes back to every
    /// resource type the accepting side exports.
    pub async fn handshake(&mut self) {
        self.open().await;
        for kind in ResourceKind::initial_subscriptions(false) {
            assert_eq!(self.recv().await, ReplicationMessage::subscribe(kind, ""));
        }
        for kind in ResourceKind::initial_subscriptions(true) {
            self.send(ReplicationMessage::subscribe(kind, "")).await;
        }
    }

    pub fn hang_up(&mut self) {
        self.tx = None;
    }
}

pub fn open_message(peer_id: &str, secret: &str) -> ReplicationMessage {
    ReplicationMessage {
        payload: Some(Payload::Open(Open {
            peer_id: peer_id.to_string(),
            stream_secret_id: secret.to_string(),
            remote: None,
        })),
    }
}

/// One passing instance of `service` on `node`.
pub fn instance(node: &str, service: &str, id: &str) -> CheckServiceNode {
    CheckServiceNode {
        node: Some(Node {
            node: node.to_string(),
            address: "10.0.0.1".to_string(),
            ..Default::default()
        }),
        service: Some(NodeService {
            id: id.to_string(),
            service: service.to_string(),
            port: 3306,
            ..Default::default()
        }),
        checks: vec![HealthCheck {
            node: node.to_string(),
            check_id: format!("{id}-check"),
            status: health::PASSING.to_string(),
            service_id: id.to_string(),
            service_name: service.to_string(),
            ..Default::default()
        }],
    }
}

/// Polls `cond` until it holds or a couple of seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
