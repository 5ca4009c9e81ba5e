//! Catalog interfaces consumed by the peer stream.
//!
//! Reads go through [`StateStore`] and may register interest in the data
//! they touched via a [`WatchSet`], which is how blocking queries are built.
//! Writes go through [`CatalogBackend`], which in a clustered deployment is
//! replicated log application.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::select_all;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::events::EventPublisher;
use crate::proto::{CheckServiceNode, NodeService, PeeringTrustBundle};
use crate::structs::{
    CaConfig, DeregisterRequest, ExportedServiceList, MeshConfig, Peering, PeeringSecrets,
    PeeringWriteRequest, RegisterRequest, SecretsWriteRequest, ServiceName,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("catalog error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

// ============================================================================
// Watch sets
// ============================================================================

/// Channels a blocking query waits on.
#[derive(Default)]
pub struct WatchSet {
    receivers: Vec<watch::Receiver<u64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Changed,
    Cancelled,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rx: watch::Receiver<u64>) {
        self.receivers.push(rx);
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    /// Block until any watched channel fires or `cancel` is triggered.
    ///
    /// A closed channel counts as a change so the caller re-runs its query
    /// and observes the underlying error.
    pub async fn wait(mut self, cancel: &CancellationToken) -> WatchOutcome {
        if self.receivers.is_empty() {
            cancel.cancelled().await;
            return WatchOutcome::Cancelled;
        }

        let changes = select_all(
            self.receivers
                .iter_mut()
                .map(|rx| Box::pin(rx.changed())),
        );

        tokio::select! {
            _ = cancel.cancelled() => WatchOutcome::Cancelled,
            _ = changes => WatchOutcome::Changed,
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Read access to the local catalog.
///
/// Every read returns the store index it observed. Passing a watch set
/// registers the read for change notification.
pub trait StateStore: Send + Sync {
    /// Instances of one service, with node and service-scoped checks.
    fn check_service_nodes(
        &self,
        ws: Option<&mut WatchSet>,
        service: &ServiceName,
        peer_name: &str,
    ) -> Result<(u64, Vec<CheckServiceNode>)>;

    /// Services registered on a node, across all namespaces of a partition.
    fn node_service_list(
        &self,
        ws: Option<&mut WatchSet>,
        node: &str,
        partition: &str,
        peer_name: &str,
    ) -> Result<(u64, Vec<NodeService>)>;

    /// Distinct service names across all namespaces of a partition.
    fn service_list(
        &self,
        ws: Option<&mut WatchSet>,
        partition: &str,
        peer_name: &str,
    ) -> Result<(u64, Vec<ServiceName>)>;

    fn exported_services_for_peer(
        &self,
        ws: Option<&mut WatchSet>,
        peer_id: &str,
        datacenter: &str,
    ) -> Result<(u64, ExportedServiceList)>;

    /// All instances of a service kind.
    fn service_dump(
        &self,
        ws: Option<&mut WatchSet>,
        kind: &str,
        partition: &str,
        peer_name: &str,
    ) -> Result<(u64, Vec<CheckServiceNode>)>;

    fn ca_config(&self, ws: Option<&mut WatchSet>) -> Result<(u64, Option<CaConfig>)>;

    fn mesh_config(&self, ws: Option<&mut WatchSet>) -> Result<(u64, Option<MeshConfig>)>;

    fn peering_read(
        &self,
        ws: Option<&mut WatchSet>,
        name: &str,
        partition: &str,
    ) -> Result<(u64, Option<Peering>)>;

    fn peering_read_by_id(
        &self,
        ws: Option<&mut WatchSet>,
        id: &str,
    ) -> Result<(u64, Option<Peering>)>;

    fn peering_trust_bundle_read(
        &self,
        ws: Option<&mut WatchSet>,
        peer_name: &str,
        partition: &str,
    ) -> Result<(u64, Option<PeeringTrustBundle>)>;

    fn peering_trust_bundle_list(
        &self,
        ws: Option<&mut WatchSet>,
        partition: &str,
    ) -> Result<(u64, Vec<PeeringTrustBundle>)>;

    fn peering_secrets_read(
        &self,
        ws: Option<&mut WatchSet>,
        peer_id: &str,
    ) -> Result<Option<PeeringSecrets>>;

    /// Cancelled when this store generation is replaced, e.g. by a snapshot
    /// restore.
    fn abandon_signal(&self) -> CancellationToken;
}

/// Writes to the local catalog.
#[async_trait]
pub trait CatalogBackend: Send + Sync {
    async fn catalog_register(&self, req: RegisterRequest) -> Result<()>;

    async fn catalog_deregister(&self, req: DeregisterRequest) -> Result<()>;

    async fn peering_write(&self, req: PeeringWriteRequest) -> Result<()>;

    /// Marks a peering as terminated by its peer.
    async fn peering_terminate_by_id(&self, id: &str) -> Result<()>;

    async fn peering_trust_bundle_write(&self, bundle: PeeringTrustBundle) -> Result<()>;

    async fn peering_trust_bundle_delete(&self, peer_name: &str, partition: &str) -> Result<()>;

    async fn peering_secrets_write(&self, req: SecretsWriteRequest) -> Result<()>;
}

pub trait Leadership: Send + Sync {
    fn is_leader(&self) -> bool;

    /// External gRPC address of the current leader, empty when unknown.
    fn leader_address(&self) -> String;
}

/// Every collaborator the peer stream server talks to.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn StateStore>,
    pub backend: Arc<dyn CatalogBackend>,
    pub publisher: Arc<dyn EventPublisher>,
    pub leadership: Arc<dyn Leadership>,
}

impl Backends {
    /// Use one object for every role.
    pub fn from_single<T>(catalog: Arc<T>) -> Self
    where
        T: StateStore + CatalogBackend + EventPublisher + Leadership + 'static,
    {
        Self {
            store: catalog.clone(),
            backend: catalog.clone(),
            publisher: catalog.clone(),
            leadership: catalog,
        }
    }
}
