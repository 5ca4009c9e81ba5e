//! Applying resources received from a peer, and building the responses we
//! send for local updates.
//!
//! Every inbound Response gets exactly one reply: an ACK when it was applied
//! or a NACK carrying the failure. Catalog failures never end the stream.

use std::collections::BTreeSet;
use std::sync::Arc;

use prost_types::Any;
use thiserror::Error;
use tonic::Code;
use tracing::{debug, warn};

use crate::catalog::{CatalogBackend, CatalogError, StateStore};
use crate::peerstream::health_snapshot::{
    reconcile, CatalogMutation, HealthSnapshot, SnapshotError,
};
use crate::peerstream::subscription_state::{PayloadId, Update, UpdatePayload};
use crate::peerstream::tracker::MutableStatus;
use crate::proto::replication_message::Response;
use crate::proto::{
    CheckServiceNode, ExportedService, ExportedServiceList, Operation, PeeringServerAddresses,
    PeeringTrustBundle, ReplicationMessage,
};
use crate::proto_ext::{pack_any, unpack_any};
use crate::resource::ResourceKind;
use crate::structs::{DeregisterRequest, PeeringWriteRequest, ServiceName};

/// Why a Response was not applied. The code is sent back in the NACK.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ReplicationError {
    pub code: Code,
    pub message: String,
}

impl ReplicationError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: Code::InvalidArgument,
            message: message.into(),
        }
    }
}

/// Failure while writing a received resource into the local catalog.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("mismatched resourceURL {url:?} and Any typeUrl {any_url:?}")]
    MismatchedTypeUrl { url: String, any_url: String },

    #[error("failed to unmarshal resource: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("peering does not exist or has been marked for deletion")]
    PeeringNotActive,
}

fn unsupported_operation(op: i32) -> String {
    match Operation::try_from(op) {
        Ok(op) => format!("unsupported operation: {:?}", op.as_str_name()),
        Err(_) => format!("unsupported operation: {op}"),
    }
}

/// Writes resources received from one peer into the local catalog.
pub struct Importer {
    store: Arc<dyn StateStore>,
    backend: Arc<dyn CatalogBackend>,
    peer_name: String,
    partition: String,
}

impl Importer {
    pub fn new(
        store: Arc<dyn StateStore>,
        backend: Arc<dyn CatalogBackend>,
        peer_name: impl Into<String>,
        partition: impl Into<String>,
    ) -> Self {
        Self {
            store,
            backend,
            peer_name: peer_name.into(),
            partition: partition.into(),
        }
    }

    /// Applies one Response and returns the ACK or NACK to send back,
    /// alongside the outcome.
    pub async fn process_response(
        &self,
        status: &MutableStatus,
        resp: &Response,
    ) -> (ReplicationMessage, Result<(), ReplicationError>) {
        let result = self.apply_response(status, resp).await;
        let reply = match &result {
            Ok(()) => ReplicationMessage::ack(&resp.resource_url, &resp.nonce),
            Err(err) => {
                ReplicationMessage::nack(&resp.resource_url, &resp.nonce, err.code, &err.message)
            }
        };
        (reply, result)
    }

    async fn apply_response(
        &self,
        status: &MutableStatus,
        resp: &Response,
    ) -> Result<(), ReplicationError> {
        let Ok(kind) = ResourceKind::from_type_url(&resp.resource_url) else {
            return Err(ReplicationError::invalid(format!(
                "received response for unknown resource type {:?}",
                resp.resource_url
            )));
        };
        if resp.nonce.is_empty() {
            return Err(ReplicationError::invalid(format!(
                "received response without a nonce for: {}:{}",
                resp.resource_url, resp.resource_id
            )));
        }

        match Operation::try_from(resp.operation) {
            Ok(Operation::Upsert) => {
                let Some(resource) = resp.resource.as_ref() else {
                    return Err(ReplicationError::invalid(
                        "received upsert response with no content",
                    ));
                };
                self.handle_upsert(status, kind, &resp.resource_id, resource)
                    .await
                    .map_err(|err| ReplicationError {
                        code: Code::Internal,
                        message: format!(
                            "upsert error, ResourceURL: {:?}, ResourceID: {:?}: {err}",
                            resp.resource_url, resp.resource_id
                        ),
                    })
            }
            Ok(Operation::Delete) if kind != ResourceKind::ServerAddresses => {
                if resp.resource.is_some() {
                    return Err(ReplicationError::invalid(
                        "received delete response with content",
                    ));
                }
                self.handle_delete(status, kind, &resp.resource_id)
                    .await
                    .map_err(|err| ReplicationError {
                        code: Code::Internal,
                        message: format!(
                            "delete error, ResourceURL: {:?}, ResourceID: {:?}: {err}",
                            resp.resource_url, resp.resource_id
                        ),
                    })
            }
            _ => Err(ReplicationError::invalid(unsupported_operation(resp.operation))),
        }
    }

    fn imported_name(&self, resource_id: &str) -> ServiceName {
        let mut sn = ServiceName::parse(resource_id);
        sn.override_partition(&self.partition);
        sn
    }

    async fn handle_upsert(
        &self,
        status: &MutableStatus,
        kind: ResourceKind,
        resource_id: &str,
        resource: &Any,
    ) -> Result<(), ApplyError> {
        if resource.type_url != kind.type_url() {
            return Err(ApplyError::MismatchedTypeUrl {
                url: kind.type_url().to_string(),
                any_url: resource.type_url.clone(),
            });
        }

        match kind {
            ResourceKind::ExportedServiceList => {
                let list: ExportedServiceList = unpack_any(resource)?;
                self.handle_exported_service_list(status, &list.services).await
            }
            ResourceKind::ExportedService => {
                let sn = self.imported_name(resource_id);
                let export: ExportedService = unpack_any(resource)?;
                self.handle_update_service(&sn, export.nodes).await?;
                status.track_imported_service(&sn);
                Ok(())
            }
            ResourceKind::TrustBundle => {
                let mut bundle: PeeringTrustBundle = unpack_any(resource)?;
                // Stored in the importing partition, under the peer it came from.
                bundle.partition = self.partition.clone();
                bundle.peer_name = self.peer_name.clone();
                self.backend.peering_trust_bundle_write(bundle).await?;
                Ok(())
            }
            ResourceKind::ServerAddresses => {
                let addrs: PeeringServerAddresses = unpack_any(resource)?;
                self.handle_server_addresses(addrs.addresses).await
            }
        }
    }

    async fn handle_delete(
        &self,
        status: &MutableStatus,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<(), ApplyError> {
        match kind {
            ResourceKind::ExportedServiceList => self.handle_exported_service_list(status, &[]).await,
            ResourceKind::ExportedService => {
                let sn = self.imported_name(resource_id);
                self.handle_update_service(&sn, Vec::new()).await?;
                status.remove_imported_service(&sn);
                Ok(())
            }
            ResourceKind::TrustBundle => {
                self.backend
                    .peering_trust_bundle_delete(&self.peer_name, &self.partition)
                    .await?;
                Ok(())
            }
            // Rejected before dispatch.
            ResourceKind::ServerAddresses => Ok(()),
        }
    }

    /// Removes every imported service the peer no longer exports, keeping
    /// the synthetic sidecars of exported ones, and records the imported set.
    async fn handle_exported_service_list(
        &self,
        status: &MutableStatus,
        services: &[String],
    ) -> Result<(), ApplyError> {
        let mut exported = BTreeSet::new();
        let mut names = Vec::with_capacity(services.len());
        for service in services {
            let sn = self.imported_name(service);
            exported.insert(sn.sidecar_proxy());
            exported.insert(sn.clone());
            names.push(sn);
        }

        let (_, stored) = self
            .store
            .service_list(None, &self.partition, &self.peer_name)?;
        for sn in stored {
            if !exported.contains(&sn) {
                debug!(service = %sn, "deleting service no longer exported by peer");
                self.handle_update_service(&sn, Vec::new()).await?;
            }
        }

        status.set_imported_services(&names);
        Ok(())
    }

    /// Makes the stored instances of `sn` match `instances`. An empty list
    /// removes the service.
    pub async fn handle_update_service(
        &self,
        sn: &ServiceName,
        instances: Vec<CheckServiceNode>,
    ) -> Result<(), ApplyError> {
        let (_, stored) = self.store.check_service_nodes(None, sn, &self.peer_name)?;
        let snapshot = HealthSnapshot::build(instances, &self.partition, &self.peer_name)?;
        let mutations = reconcile(&snapshot, &stored, &self.partition, &self.peer_name);
        self.apply_mutations(mutations).await
    }

    async fn apply_mutations(&self, mutations: Vec<CatalogMutation>) -> Result<(), ApplyError> {
        for mutation in mutations {
            match mutation {
                CatalogMutation::Register(req) => self.backend.catalog_register(req).await?,
                CatalogMutation::Deregister(req) => self.backend.catalog_deregister(req).await?,
                CatalogMutation::DeregisterNodeIfUnused { node, partition } => {
                    let (_, services) =
                        self.store
                            .node_service_list(None, &node, &partition, &self.peer_name)?;
                    if !services.is_empty() {
                        continue;
                    }
                    self.backend
                        .catalog_deregister(DeregisterRequest {
                            node,
                            partition,
                            peer_name: self.peer_name.clone(),
                            ..Default::default()
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_server_addresses(&self, addresses: Vec<String>) -> Result<(), ApplyError> {
        let (_, existing) = self
            .store
            .peering_read(None, &self.peer_name, &self.partition)?;
        let Some(mut peering) = existing.filter(|p| p.is_active()) else {
            return Err(ApplyError::PeeringNotActive);
        };
        peering.peer_server_addresses = addresses;
        self.backend
            .peering_write(PeeringWriteRequest {
                peering,
                secrets_request: None,
            })
            .await?;
        Ok(())
    }
}

// ============================================================================
// Outbound responses
// ============================================================================

/// Response carrying a local update, without its nonce.
///
/// Returns `None` for an update whose payload does not fit its ID.
pub fn make_response(status: &MutableStatus, update: &Update) -> Option<Response> {
    let resource_id = update.id.resource_id();
    let upsert = |kind: ResourceKind, resource: Any| Response {
        resource_url: kind.type_url().to_string(),
        resource_id: resource_id.clone(),
        resource: Some(resource),
        operation: Operation::Upsert as i32,
        ..Default::default()
    };

    match (&update.id, &update.payload) {
        (PayloadId::ExportedServiceList, UpdatePayload::ExportedServiceList(list)) => {
            let names: Vec<ServiceName> = list.services.iter().map(|s| ServiceName::parse(s)).collect();
            status.set_exported_services(&names);
            let kind = ResourceKind::ExportedServiceList;
            Some(upsert(kind, pack_any(kind.type_url(), list)))
        }
        (
            PayloadId::Service(_) | PayloadId::DiscoveryChain(_),
            UpdatePayload::ExportedService(svc),
        ) => {
            let kind = ResourceKind::ExportedService;
            Some(upsert(kind, pack_any(kind.type_url(), svc)))
        }
        (PayloadId::Service(_), UpdatePayload::ServiceRemoved) => Some(Response {
            resource_url: ResourceKind::ExportedService.type_url().to_string(),
            resource_id: resource_id.clone(),
            resource: None,
            operation: Operation::Delete as i32,
            ..Default::default()
        }),
        (PayloadId::TrustBundle, UpdatePayload::TrustBundle(bundle)) => {
            let kind = ResourceKind::TrustBundle;
            Some(upsert(kind, pack_any(kind.type_url(), bundle)))
        }
        (PayloadId::ServerAddresses, UpdatePayload::ServerAddresses(addrs)) => {
            let kind = ResourceKind::ServerAddresses;
            Some(upsert(kind, pack_any(kind.type_url(), addrs)))
        }
        (id, _) => {
            warn!(?id, "skipping update with a payload that does not match its ID");
            None
        }
    }
}
