//! Catalog domain types shared by the store interfaces and the stream.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::proto::{CheckServiceNode, HealthCheck, Node, NodeService, RemoteInfo};

pub const DEFAULT_PARTITION: &str = "default";
pub const DEFAULT_NAMESPACE: &str = "default";

/// Peer name of locally registered data.
pub const LOCAL_PEER: &str = "";

/// Suffix of sidecar proxy service names.
pub const SIDECAR_PROXY_SUFFIX: &str = "-sidecar-proxy";

pub const TAGGED_ADDRESS_WAN: &str = "wan";
pub const TAGGED_ADDRESS_VIRTUAL_IP: &str = "consul-virtual";

pub mod service_kind {
    pub const TYPICAL: &str = "";
    pub const CONNECT_PROXY: &str = "connect-proxy";
    pub const MESH_GATEWAY: &str = "mesh-gateway";
}

pub mod health {
    pub const PASSING: &str = "passing";
    pub const WARNING: &str = "warning";
    pub const CRITICAL: &str = "critical";
    pub const MAINTENANCE: &str = "maintenance";

    pub const NODE_MAINT_CHECK_ID: &str = "_node_maintenance";
    pub const SERVICE_MAINT_PREFIX: &str = "_service_maintenance:";
}

pub fn partition_or_default(partition: &str) -> &str {
    if partition.is_empty() {
        DEFAULT_PARTITION
    } else {
        partition
    }
}

pub fn namespace_or_default(namespace: &str) -> &str {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    }
}

// ============================================================================
// Service names
// ============================================================================

/// A service name qualified by partition and namespace.
///
/// Empty partition and namespace values are normalized to the defaults so
/// equality and hashing do not depend on how the name was written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName {
    pub name: String,
    pub partition: String,
    pub namespace: String,
}

impl ServiceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self::in_scope(name, DEFAULT_PARTITION, DEFAULT_NAMESPACE)
    }

    pub fn in_scope(name: impl Into<String>, partition: &str, namespace: &str) -> Self {
        Self {
            name: name.into(),
            partition: partition_or_default(partition).to_string(),
            namespace: namespace_or_default(namespace).to_string(),
        }
    }

    /// Parses the [`Display`](fmt::Display) form: `name` or
    /// `partition/namespace/name`.
    pub fn parse(s: &str) -> Self {
        let parts: Vec<&str> = s.splitn(3, '/').collect();
        match parts.as_slice() {
            [partition, namespace, name] => Self::in_scope(*name, partition, namespace),
            _ => Self::new(s),
        }
    }

    pub fn override_partition(&mut self, partition: &str) {
        self.partition = partition_or_default(partition).to_string();
    }

    pub fn sidecar_proxy(&self) -> ServiceName {
        Self {
            name: format!("{}{}", self.name, SIDECAR_PROXY_SUFFIX),
            partition: self.partition.clone(),
            namespace: self.namespace.clone(),
        }
    }

    fn is_default_scope(&self) -> bool {
        self.partition == DEFAULT_PARTITION && self.namespace == DEFAULT_NAMESPACE
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default_scope() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}/{}", self.partition, self.namespace, self.name)
        }
    }
}

// ============================================================================
// Peerings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeeringState {
    #[default]
    Undefined,
    Pending,
    Establishing,
    Active,
    Failing,
    Deleting,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Peering {
    /// Locally generated ID.
    pub id: String,
    pub name: String,
    pub partition: String,
    /// ID assigned by the remote cluster. Only set on the dialing side.
    pub peer_id: String,
    pub state: PeeringState,
    pub remote: Option<RemoteInfo>,
    pub peer_server_addresses: Vec<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub create_index: u64,
    pub modify_index: u64,
}

impl Peering {
    /// Whether the peering is neither terminated nor marked for deletion.
    pub fn is_active(&self) -> bool {
        !matches!(self.state, PeeringState::Terminated | PeeringState::Deleting)
            && self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamSecrets {
    pub active_secret_id: String,
    pub pending_secret_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeeringSecrets {
    pub peer_id: String,
    /// One-time secret embedded in a peering token.
    pub establishment_secret: Option<String>,
    pub stream: StreamSecrets,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretsRequest {
    /// Stores a new establishment secret when a token is generated.
    GenerateToken { establishment_secret: String },
    /// Consumes the establishment secret and stores a pending stream secret.
    ExchangeSecret {
        establishment_secret: String,
        pending_stream_secret: String,
    },
    /// Makes the pending stream secret the active one.
    PromotePending { active_stream_secret: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretsWriteRequest {
    pub peer_id: String,
    pub request: SecretsRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeeringWriteRequest {
    pub peering: Peering,
    pub secrets_request: Option<SecretsWriteRequest>,
}

// ============================================================================
// Exports and discovery chains
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiscoveryTarget {
    pub service: String,
    pub namespace: String,
    pub partition: String,
    pub datacenter: String,
}

/// Routing summary of a discovery chain exported to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExportedDiscoveryChainInfo {
    pub protocol: String,
    pub tcp_targets: Vec<DiscoveryTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExportedServiceList {
    /// Services exported directly, replicated as instances.
    pub services: Vec<ServiceName>,
    /// Connect-enabled services, replicated as synthetic proxies pointing at
    /// the mesh gateways.
    pub disco_chains: BTreeMap<ServiceName, ExportedDiscoveryChainInfo>,
}

impl ExportedServiceList {
    /// Every exported name, sorted, in wire form.
    pub fn list_all_service_names(&self) -> Vec<String> {
        let mut names: Vec<&ServiceName> = self
            .services
            .iter()
            .chain(self.disco_chains.keys())
            .collect();
        names.sort();
        names.dedup();
        names.into_iter().map(ToString::to_string).collect()
    }
}

// ============================================================================
// Catalog writes
// ============================================================================

/// Registers a node and optionally one service and a set of checks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegisterRequest {
    pub node: Node,
    pub service: Option<NodeService>,
    pub checks: Vec<HealthCheck>,
}

impl RegisterRequest {
    /// Registers the node, service and checks of one instance together.
    pub fn from_instance(instance: &CheckServiceNode) -> Self {
        Self {
            node: instance.node.clone().unwrap_or_default(),
            service: instance.service.clone(),
            checks: instance.checks.clone(),
        }
    }
}

/// Removes a node, a service instance or a single check.
///
/// With neither `service_id` nor `check_id` set the whole node is removed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeregisterRequest {
    pub node: String,
    pub service_id: Option<String>,
    pub check_id: Option<String>,
    pub partition: String,
    pub namespace: String,
    pub peer_name: String,
}

// ============================================================================
// Configuration and server metadata
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaConfig {
    pub cluster_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaRoot {
    pub id: String,
    pub root_cert: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadyServerInfo {
    pub id: String,
    pub address: String,
    pub tagged_addresses: BTreeMap<String, String>,
    /// Zero when the external gRPC port is disabled.
    pub ext_grpc_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MeshConfig {
    pub peer_through_mesh_gateways: bool,
}

/// Address to dial for a service instance, preferring the service address
/// and the WAN tagged address when `wan` is set.
pub fn best_address(csn: &CheckServiceNode, wan: bool) -> (String, i32) {
    let node = csn.node.as_ref();
    let service = csn.service.as_ref();
    let port = service.map(|s| s.port).unwrap_or_default();

    if wan {
        if let Some(tagged) = service.and_then(|s| s.tagged_addresses.get(TAGGED_ADDRESS_WAN)) {
            if !tagged.address.is_empty() {
                return (tagged.address.clone(), tagged.port);
            }
        }
        if let Some(addr) = node.and_then(|n| n.tagged_addresses.get(TAGGED_ADDRESS_WAN)) {
            if !addr.is_empty() {
                return (addr.clone(), port);
            }
        }
    }

    match service {
        Some(s) if !s.address.is_empty() => (s.address.clone(), port),
        _ => (node.map(|n| n.address.clone()).unwrap_or_default(), port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ServiceAddress;

    #[test]
    fn test_service_name_round_trips_through_display() {
        let plain = ServiceName::new("web");
        assert_eq!(plain.to_string(), "web");
        assert_eq!(ServiceName::parse("web"), plain);

        let scoped = ServiceName::in_scope("api", "team", "prod");
        assert_eq!(scoped.to_string(), "team/prod/api");
        assert_eq!(ServiceName::parse("team/prod/api"), scoped);
    }

    #[test]
    fn test_service_name_normalizes_empty_scope() {
        assert_eq!(ServiceName::in_scope("web", "", ""), ServiceName::new("web"));
    }

    #[test]
    fn test_peering_is_active() {
        let mut p = Peering {
            state: PeeringState::Active,
            ..Default::default()
        };
        assert!(p.is_active());

        p.deleted_at = Some(Utc::now());
        assert!(!p.is_active());

        p.deleted_at = None;
        p.state = PeeringState::Terminated;
        assert!(!p.is_active());
    }

    #[test]
    fn test_list_all_service_names_merges_chains() {
        let mut list = ExportedServiceList {
            services: vec![ServiceName::new("mysql"), ServiceName::new("api")],
            ..Default::default()
        };
        list.disco_chains
            .insert(ServiceName::new("api"), ExportedDiscoveryChainInfo::default());
        list.disco_chains
            .insert(ServiceName::new("web"), ExportedDiscoveryChainInfo::default());

        assert_eq!(list.list_all_service_names(), vec!["api", "mysql", "web"]);
    }

    #[test]
    fn test_best_address_prefers_wan_when_asked() {
        let mut service = NodeService {
            address: "10.0.0.5".to_string(),
            port: 8443,
            ..Default::default()
        };
        service.tagged_addresses.insert(
            TAGGED_ADDRESS_WAN.to_string(),
            ServiceAddress {
                address: "203.0.113.9".to_string(),
                port: 443,
            },
        );
        let csn = CheckServiceNode {
            node: Some(Node {
                address: "10.0.0.1".to_string(),
                ..Default::default()
            }),
            service: Some(service),
            checks: vec![],
        };

        assert_eq!(best_address(&csn, true), ("203.0.113.9".to_string(), 443));
        assert_eq!(best_address(&csn, false), ("10.0.0.5".to_string(), 8443));
    }
}
