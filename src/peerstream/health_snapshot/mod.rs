//! Normalized view of imported service instances and the catalog changes
//! needed to converge on it.
//!
//! A peer replicates every instance of a service at once. The snapshot
//! groups those instances by node, service and check so the importer can
//! diff them against what it stored from the previous update.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::proto::{CheckServiceNode, HealthCheck, Node, NodeService};
use crate::structs::{namespace_or_default, DeregisterRequest, RegisterRequest};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("instance is missing its node")]
    MissingNode,

    #[error("instance on node {node:?} is missing its service")]
    MissingService { node: String },

    #[error("encountered node with empty name")]
    EmptyNodeName,

    #[error("encountered service with empty ID on node {node:?}")]
    EmptyServiceId { node: String },

    #[error("encountered check with empty ID for service {service_id:?} on node {node:?}")]
    EmptyCheckId { node: String, service_id: String },
}

/// Service instance key within a node: namespace and service ID.
pub type ServiceKey = (String, String);

fn service_key(service: &NodeService) -> ServiceKey {
    (
        namespace_or_default(&service.namespace).to_string(),
        service.id.clone(),
    )
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HealthSnapshot {
    pub nodes: BTreeMap<String, NodeSnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub node: Node,
    pub services: BTreeMap<ServiceKey, ServiceSnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSnapshot {
    pub service: NodeService,
    pub checks: BTreeMap<String, HealthCheck>,
}

impl HealthSnapshot {
    /// Groups instances by node, rewriting partition and peer name fields so
    /// the data is stored as imported from `peer_name` into `partition`.
    pub fn build(
        instances: Vec<CheckServiceNode>,
        partition: &str,
        peer_name: &str,
    ) -> Result<Self, SnapshotError> {
        let mut snap = HealthSnapshot::default();

        for instance in instances {
            let mut node = instance.node.ok_or(SnapshotError::MissingNode)?;
            if node.node.is_empty() {
                return Err(SnapshotError::EmptyNodeName);
            }
            let mut service = instance.service.ok_or_else(|| SnapshotError::MissingService {
                node: node.node.clone(),
            })?;
            if service.id.is_empty() {
                return Err(SnapshotError::EmptyServiceId {
                    node: node.node.clone(),
                });
            }

            node.partition = partition.to_string();
            node.peer_name = peer_name.to_string();
            service.partition = partition.to_string();
            service.peer_name = peer_name.to_string();

            let node_name = node.node.clone();
            let node_snap = snap
                .nodes
                .entry(node_name.clone())
                .or_insert_with(|| NodeSnapshot {
                    node: node.clone(),
                    services: BTreeMap::new(),
                });

            let mut checks = BTreeMap::new();
            for mut check in instance.checks {
                if check.check_id.is_empty() {
                    return Err(SnapshotError::EmptyCheckId {
                        node: node_name,
                        service_id: service.id,
                    });
                }
                check.partition = partition.to_string();
                check.peer_name = peer_name.to_string();
                checks.insert(check.check_id.clone(), check);
            }

            node_snap
                .services
                .insert(service_key(&service), ServiceSnapshot { service, checks });
        }

        Ok(snap)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// One catalog write produced by [`reconcile`], in application order.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogMutation {
    Register(RegisterRequest),
    Deregister(DeregisterRequest),
    /// Remove the node if nothing else is registered on it. Other services
    /// may share the node, so this needs a fresh read when applied.
    DeregisterNodeIfUnused { node: String, partition: String },
}

fn same_node(a: &Node, b: &Node) -> bool {
    Node {
        raft_index: None,
        ..a.clone()
    } == Node {
        raft_index: None,
        ..b.clone()
    }
}

fn same_service(a: &NodeService, b: &NodeService) -> bool {
    NodeService {
        raft_index: None,
        ..a.clone()
    } == NodeService {
        raft_index: None,
        ..b.clone()
    }
}

fn same_check(a: &HealthCheck, b: &HealthCheck) -> bool {
    HealthCheck {
        raft_index: None,
        ..a.clone()
    } == HealthCheck {
        raft_index: None,
        ..b.clone()
    }
}

/// Catalog writes that make the stored instances of one imported service
/// match `snapshot`.
///
/// Registrations come first and skip unchanged items. Removals follow:
/// instances whose node is gone, instances missing from their node, missing
/// service checks, missing node checks (once per node and check), and
/// finally nodes left without any service.
pub fn reconcile(
    snapshot: &HealthSnapshot,
    stored: &[CheckServiceNode],
    partition: &str,
    peer_name: &str,
) -> Vec<CatalogMutation> {
    let mut mutations = Vec::new();

    let mut stored_nodes: BTreeMap<&str, &Node> = BTreeMap::new();
    let mut stored_services: BTreeMap<(&str, &str), &NodeService> = BTreeMap::new();
    let mut stored_checks: BTreeMap<(&str, &str, &str), &HealthCheck> = BTreeMap::new();
    for csn in stored {
        let (Some(node), Some(service)) = (csn.node.as_ref(), csn.service.as_ref()) else {
            continue;
        };
        stored_nodes.insert(node.node.as_str(), node);
        stored_services.insert((node.node.as_str(), service.id.as_str()), service);
        for chk in &csn.checks {
            stored_checks.insert(
                (node.node.as_str(), service.id.as_str(), chk.check_id.as_str()),
                chk,
            );
        }
    }

    for (node_name, node_snap) in &snapshot.nodes {
        let node_changed = stored_nodes
            .get(node_name.as_str())
            .map_or(true, |stored| !same_node(stored, &node_snap.node));
        if node_changed {
            mutations.push(CatalogMutation::Register(RegisterRequest {
                node: node_snap.node.clone(),
                ..Default::default()
            }));
        }

        for svc_snap in node_snap.services.values() {
            let changed = stored_services
                .get(&(node_name.as_str(), svc_snap.service.id.as_str()))
                .map_or(true, |stored| !same_service(stored, &svc_snap.service));
            if changed {
                mutations.push(CatalogMutation::Register(RegisterRequest {
                    node: node_snap.node.clone(),
                    service: Some(svc_snap.service.clone()),
                    checks: vec![],
                }));
            }
        }

        let mut changed_checks: BTreeMap<&str, &HealthCheck> = BTreeMap::new();
        for svc_snap in node_snap.services.values() {
            for (check_id, chk) in &svc_snap.checks {
                let key = (
                    node_name.as_str(),
                    svc_snap.service.id.as_str(),
                    check_id.as_str(),
                );
                let changed = stored_checks
                    .get(&key)
                    .map_or(true, |stored| !same_check(stored, chk));
                if changed {
                    changed_checks.insert(check_id.as_str(), chk);
                }
            }
        }
        if !changed_checks.is_empty() {
            mutations.push(CatalogMutation::Register(RegisterRequest {
                node: node_snap.node.clone(),
                service: None,
                checks: changed_checks.into_values().cloned().collect(),
            }));
        }
    }

    let mut unused_nodes: BTreeSet<&str> = BTreeSet::new();
    let mut deleted_node_checks: BTreeSet<(&str, &str)> = BTreeSet::new();

    for csn in stored {
        let (Some(node), Some(service)) = (csn.node.as_ref(), csn.service.as_ref()) else {
            continue;
        };

        let Some(node_snap) = snapshot.nodes.get(&node.node) else {
            // Service checks go with the service. Node checks go with the
            // node if it ends up unused.
            unused_nodes.insert(node.node.as_str());
            mutations.push(CatalogMutation::Deregister(DeregisterRequest {
                node: node.node.clone(),
                service_id: Some(service.id.clone()),
                check_id: None,
                partition: partition.to_string(),
                namespace: namespace_or_default(&service.namespace).to_string(),
                peer_name: peer_name.to_string(),
            }));
            continue;
        };

        let Some(svc_snap) = node_snap.services.get(&service_key(service)) else {
            mutations.push(CatalogMutation::Deregister(DeregisterRequest {
                node: node.node.clone(),
                service_id: Some(service.id.clone()),
                check_id: None,
                partition: partition.to_string(),
                namespace: namespace_or_default(&service.namespace).to_string(),
                peer_name: peer_name.to_string(),
            }));
            continue;
        };

        for chk in &csn.checks {
            if svc_snap.checks.contains_key(&chk.check_id) {
                continue;
            }
            if chk.service_id.is_empty() {
                deleted_node_checks.insert((chk.node.as_str(), chk.check_id.as_str()));
                continue;
            }
            mutations.push(CatalogMutation::Deregister(DeregisterRequest {
                node: chk.node.clone(),
                service_id: None,
                check_id: Some(chk.check_id.clone()),
                partition: partition.to_string(),
                namespace: namespace_or_default(&chk.namespace).to_string(),
                peer_name: peer_name.to_string(),
            }));
        }
    }

    for (node, check_id) in deleted_node_checks {
        mutations.push(CatalogMutation::Deregister(DeregisterRequest {
            node: node.to_string(),
            service_id: None,
            check_id: Some(check_id.to_string()),
            partition: partition.to_string(),
            namespace: String::new(),
            peer_name: peer_name.to_string(),
        }));
    }

    for node in unused_nodes {
        mutations.push(CatalogMutation::DeregisterNodeIfUnused {
            node: node.to_string(),
            partition: partition.to_string(),
        });
    }

    mutations
}
