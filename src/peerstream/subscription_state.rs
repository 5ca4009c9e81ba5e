//! State owned by a subscription manager's event loop.
//!
//! Only the loop task touches a [`SubscriptionState`], so nothing in here
//! is locked. Outbound payloads are content-addressed: a payload whose hash
//! matches the last one sent under the same [`PayloadId`] is dropped.

use std::collections::{BTreeMap, HashMap};

use prost::Message;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::proto::{
    CheckServiceNode, ExportedService, ExportedServiceList as ExportedServiceListProto,
    PeeringServerAddresses, PeeringTrustBundle,
};
use crate::structs::{ExportedDiscoveryChainInfo, ExportedServiceList, ServiceName};

/// Logical identity of an outbound payload. Deduplication and eviction are
/// keyed on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PayloadId {
    ExportedServiceList,
    /// Instances of a directly exported service.
    Service(ServiceName),
    /// Synthetic sidecar proxies for an exported discovery chain.
    DiscoveryChain(ServiceName),
    TrustBundle,
    ServerAddresses,
}

impl PayloadId {
    /// Resource ID the payload is replicated under.
    pub fn resource_id(&self) -> String {
        match self {
            PayloadId::ExportedServiceList => crate::resource::EXPORTED_SERVICE_LIST_ID.to_string(),
            PayloadId::Service(sn) => sn.to_string(),
            PayloadId::DiscoveryChain(sn) => sn.sidecar_proxy().to_string(),
            PayloadId::TrustBundle => crate::resource::TRUST_BUNDLE_ID.to_string(),
            PayloadId::ServerAddresses => crate::resource::SERVER_ADDRS_ID.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePayload {
    ExportedServiceList(ExportedServiceListProto),
    ExportedService(ExportedService),
    /// The service is no longer exported to the peer.
    ServiceRemoved,
    TrustBundle(PeeringTrustBundle),
    ServerAddresses(PeeringServerAddresses),
}

impl UpdatePayload {
    fn tag(&self) -> &'static str {
        match self {
            UpdatePayload::ExportedServiceList(_) => "exported-service-list",
            UpdatePayload::ExportedService(_) => "exported-service",
            UpdatePayload::ServiceRemoved => "service-removed",
            UpdatePayload::TrustBundle(_) => "trust-bundle",
            UpdatePayload::ServerAddresses(_) => "server-addresses",
        }
    }

    fn encoded(&self) -> Vec<u8> {
        match self {
            UpdatePayload::ExportedServiceList(m) => m.encode_to_vec(),
            UpdatePayload::ExportedService(m) => m.encode_to_vec(),
            UpdatePayload::ServiceRemoved => Vec::new(),
            UpdatePayload::TrustBundle(m) => m.encode_to_vec(),
            UpdatePayload::ServerAddresses(m) => m.encode_to_vec(),
        }
    }

    /// Hex SHA-256 over the variant tag and the protobuf encoding.
    ///
    /// Every map in the replicated messages is a `BTreeMap`, so the encoding
    /// is deterministic.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.tag().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.encoded());
        hex::encode(hasher.finalize())
    }
}

/// One outbound change, handed from the manager to the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub id: PayloadId,
    pub payload: UpdatePayload,
}

/// Updates collected while handling one event, sent together.
#[derive(Debug, Default)]
pub struct PendingPayloads {
    items: Vec<(Update, String)>,
}

impl PendingPayloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: PayloadId, payload: UpdatePayload) {
        let hash = payload.content_hash();
        self.items.push((Update { id, payload }, hash));
    }
}

/// Last content hash sent per payload.
#[derive(Debug, Default)]
pub struct EventVersions {
    versions: HashMap<PayloadId, String>,
}

impl EventVersions {
    /// Records `hash` for `id`. Returns false if it was already the latest.
    pub fn observe(&mut self, id: &PayloadId, hash: &str) -> bool {
        if self.versions.get(id).is_some_and(|prev| prev == hash) {
            return false;
        }
        self.versions.insert(id.clone(), hash.to_string());
        true
    }

    pub fn contains(&self, id: &PayloadId) -> bool {
        self.versions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    fn retain(&mut self, mut keep: impl FnMut(&PayloadId) -> bool) {
        self.versions.retain(|id, _| {
            let keep = keep(id);
            if !keep {
                trace!(?id, "evicting payload version");
            }
            keep
        });
    }
}

pub struct SubscriptionState {
    pub peer_name: String,
    pub partition: String,

    /// Latest export list, `None` until the first one is read.
    pub export_list: Option<ExportedServiceList>,
    /// Services with a running health watch, each with its own cancel token.
    pub watched_services: BTreeMap<ServiceName, CancellationToken>,
    /// Exported discovery chains by service name.
    pub connect_services: BTreeMap<ServiceName, ExportedDiscoveryChainInfo>,
    /// Scrubbed local mesh gateway instances, `None` until first read.
    pub mesh_gateway: Option<Vec<CheckServiceNode>>,

    pub event_versions: EventVersions,
}

impl SubscriptionState {
    pub fn new(peer_name: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            peer_name: peer_name.into(),
            partition: partition.into(),
            export_list: None,
            watched_services: BTreeMap::new(),
            connect_services: BTreeMap::new(),
            mesh_gateway: None,
            event_versions: EventVersions::default(),
        }
    }

    /// Updates from `pending` whose content changed since last sent, in
    /// insertion order. Their versions are recorded.
    pub fn take_changed(&mut self, pending: PendingPayloads) -> Vec<Update> {
        pending
            .items
            .into_iter()
            .filter(|(update, hash)| {
                let changed = self.event_versions.observe(&update.id, hash);
                if !changed {
                    trace!(id = ?update.id, "skipping send of duplicate payload");
                }
                changed
            })
            .map(|(update, _)| update)
            .collect()
    }

    /// Forgets versions of services that are no longer watched and of
    /// discovery chains that are no longer exported.
    pub fn cleanup_event_versions(&mut self) {
        let watched = &self.watched_services;
        let chains = &self.connect_services;
        self.event_versions.retain(|id| match id {
            PayloadId::Service(sn) => watched.contains_key(sn),
            PayloadId::DiscoveryChain(sn) => chains.contains_key(sn),
            PayloadId::ExportedServiceList | PayloadId::TrustBundle | PayloadId::ServerAddresses => {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Node, NodeService};

    fn service_payload(port: i32) -> UpdatePayload {
        let mut node = Node {
            node: "node-1".to_string(),
            ..Default::default()
        };
        node.meta.insert("zone".to_string(), "a".to_string());
        node.meta.insert("rack".to_string(), "7".to_string());
        node.tagged_addresses
            .insert("wan".to_string(), "203.0.113.1".to_string());
        node.tagged_addresses
            .insert("lan".to_string(), "10.0.0.1".to_string());

        UpdatePayload::ExportedService(ExportedService {
            nodes: vec![CheckServiceNode {
                node: Some(node),
                service: Some(NodeService {
                    id: "web-1".to_string(),
                    service: "web".to_string(),
                    port,
                    ..Default::default()
                }),
                checks: vec![],
            }],
        })
    }

    #[test]
    fn test_content_hash_is_stable_across_map_insertion_order() {
        let a = service_payload(8080);

        let mut node = Node {
            node: "node-1".to_string(),
            ..Default::default()
        };
        node.tagged_addresses
            .insert("lan".to_string(), "10.0.0.1".to_string());
        node.tagged_addresses
            .insert("wan".to_string(), "203.0.113.1".to_string());
        node.meta.insert("rack".to_string(), "7".to_string());
        node.meta.insert("zone".to_string(), "a".to_string());
        let UpdatePayload::ExportedService(mut svc) = a.clone() else {
            unreachable!()
        };
        svc.nodes[0].node = Some(node);
        let b = UpdatePayload::ExportedService(svc);

        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash(), a.clone().content_hash());
        assert_ne!(a.content_hash(), service_payload(9090).content_hash());
    }

    #[test]
    fn test_removed_and_empty_service_hash_differently() {
        let empty = UpdatePayload::ExportedService(ExportedService::default());
        assert_ne!(
            empty.content_hash(),
            UpdatePayload::ServiceRemoved.content_hash()
        );
    }

    #[test]
    fn test_identical_payload_is_sent_once() {
        let mut state = SubscriptionState::new("peer-a", "default");
        let id = PayloadId::Service(ServiceName::new("web"));

        let mut pending = PendingPayloads::new();
        pending.add(id.clone(), service_payload(8080));
        assert_eq!(state.take_changed(pending).len(), 1);

        let mut pending = PendingPayloads::new();
        pending.add(id.clone(), service_payload(8080));
        assert!(state.take_changed(pending).is_empty());

        let mut pending = PendingPayloads::new();
        pending.add(id, service_payload(9090));
        assert_eq!(state.take_changed(pending).len(), 1);
    }

    #[test]
    fn test_same_content_under_different_ids_is_not_deduplicated() {
        let mut state = SubscriptionState::new("peer-a", "default");
        let mut pending = PendingPayloads::new();
        pending.add(PayloadId::Service(ServiceName::new("web")), service_payload(1));
        pending.add(PayloadId::Service(ServiceName::new("api")), service_payload(1));
        assert_eq!(state.take_changed(pending).len(), 2);
    }

    #[test]
    fn test_cleanup_evicts_unwatched_services_and_dropped_chains() {
        let mut state = SubscriptionState::new("peer-a", "default");
        let web = ServiceName::new("web");
        let gone = ServiceName::new("gone");
        let chain = ServiceName::new("api");

        state
            .watched_services
            .insert(web.clone(), CancellationToken::new());
        state
            .connect_services
            .insert(chain.clone(), ExportedDiscoveryChainInfo::default());

        let mut pending = PendingPayloads::new();
        pending.add(PayloadId::Service(web.clone()), service_payload(1));
        pending.add(PayloadId::Service(gone.clone()), service_payload(1));
        pending.add(PayloadId::DiscoveryChain(chain.clone()), service_payload(1));
        pending.add(
            PayloadId::DiscoveryChain(ServiceName::new("old-chain")),
            service_payload(1),
        );
        pending.add(
            PayloadId::TrustBundle,
            UpdatePayload::TrustBundle(PeeringTrustBundle::default()),
        );
        assert!(state.event_versions.is_empty());
        state.take_changed(pending);
        assert_eq!(state.event_versions.len(), 5);

        state.cleanup_event_versions();

        assert_eq!(state.event_versions.len(), 3);
        assert!(state.event_versions.contains(&PayloadId::Service(web)));
        assert!(!state.event_versions.contains(&PayloadId::Service(gone)));
        assert!(state
            .event_versions
            .contains(&PayloadId::DiscoveryChain(chain)));
        assert!(state.event_versions.contains(&PayloadId::TrustBundle));
    }

    #[test]
    fn test_resource_ids() {
        assert_eq!(
            PayloadId::ExportedServiceList.resource_id(),
            "exported-service-list"
        );
        assert_eq!(
            PayloadId::Service(ServiceName::new("web")).resource_id(),
            "web"
        );
        assert_eq!(
            PayloadId::DiscoveryChain(ServiceName::in_scope("api", "team", "prod")).resource_id(),
            "team/prod/api-sidecar-proxy"
        );
        assert_eq!(PayloadId::TrustBundle.resource_id(), "roots");
        assert_eq!(PayloadId::ServerAddresses.resource_id(), "server-addrs");
    }
}
