//! Shaping local health data for export: connect scrubbing, check
//! flattening and synthetic sidecar proxies for discovery chains.

use crate::connect::{
    is_protocol_http_like, peered_service_sni, spiffe_id_mesh_gateway, spiffe_id_service,
};
use crate::proto::{
    CheckServiceNode, ConnectProxyConfig, ExportedService, HealthCheck, NodeService,
    PeeringServiceMeta, ServiceConnect,
};
use crate::structs::{
    health, namespace_or_default, partition_or_default, service_kind, ExportedDiscoveryChainInfo,
    ServiceName, LOCAL_PEER, SIDECAR_PROXY_SUFFIX, TAGGED_ADDRESS_VIRTUAL_IP,
};

const OVERALL_CHECK_NAME: &str = "overall-check";

fn status_score(status: &str) -> u8 {
    match status {
        health::MAINTENANCE => 1,
        health::CRITICAL => 2,
        health::WARNING => 3,
        health::PASSING => 4,
        _ => 0,
    }
}

fn most_important<'a>(a: &'a str, b: &'a str) -> &'a str {
    if status_score(a) < status_score(b) {
        a
    } else {
        b
    }
}

/// Collapses `checks` into one synthetic check carrying the worst status.
///
/// Maintenance checks always win. No checks in, no checks out.
pub fn flatten_checks(
    node_name: &str,
    service_id: &str,
    service_name: &str,
    partition: &str,
    namespace: &str,
    checks: &[HealthCheck],
) -> Vec<HealthCheck> {
    if checks.is_empty() {
        return Vec::new();
    }

    let mut status = health::PASSING;
    for chk in checks {
        if chk.check_id == health::NODE_MAINT_CHECK_ID
            || chk.check_id.starts_with(health::SERVICE_MAINT_PREFIX)
        {
            status = health::MAINTENANCE;
            break;
        }
        status = most_important(status, &chk.status);
    }

    let service_id = if service_id.is_empty() {
        service_name
    } else {
        service_id
    };

    vec![HealthCheck {
        check_id: format!("{service_id}:{OVERALL_CHECK_NAME}"),
        name: OVERALL_CHECK_NAME.to_string(),
        status: status.to_string(),
        node: node_name.to_string(),
        service_id: service_id.to_string(),
        service_name: service_name.to_string(),
        partition: partition.to_string(),
        namespace: namespace.to_string(),
        peer_name: LOCAL_PEER.to_string(),
        ..Default::default()
    }]
}

fn strip_connect(service: &mut NodeService) {
    if service.connect.is_some() || service.proxy.is_some() {
        service.connect = None;
        service.proxy = None;
        service.tagged_addresses.remove(TAGGED_ADDRESS_VIRTUAL_IP);
    }
}

/// Drops proxies and anything named like a synthetic sidecar, and strips
/// connect settings from what is left.
pub fn filter_connect_references(nodes: Vec<CheckServiceNode>) -> Vec<CheckServiceNode> {
    nodes
        .into_iter()
        .filter_map(|mut csn| {
            let service = csn.service.as_mut()?;
            if service.kind != service_kind::TYPICAL {
                return None;
            }
            if service.service.ends_with(SIDECAR_PROXY_SUFFIX) {
                return None;
            }
            strip_connect(service);
            Some(csn)
        })
        .collect()
}

/// Flattens checks and clears raft indexes on every instance.
pub fn prepare_for_export(nodes: &mut [CheckServiceNode]) {
    for csn in nodes.iter_mut() {
        let node_name = csn.node.as_ref().map(|n| n.node.as_str()).unwrap_or_default();
        if let Some(service) = csn.service.as_ref() {
            csn.checks = flatten_checks(
                node_name,
                &service.id,
                &service.service,
                &service.partition,
                &service.namespace,
                &csn.checks,
            );
        }
        if let Some(node) = csn.node.as_mut() {
            node.raft_index = None;
        }
        if let Some(service) = csn.service.as_mut() {
            service.raft_index = None;
        }
    }
}

/// Local mesh gateway instances in exported form.
pub fn prepare_mesh_gateways(mut nodes: Vec<CheckServiceNode>) -> Vec<CheckServiceNode> {
    prepare_for_export(&mut nodes);
    for csn in nodes.iter_mut() {
        if let Some(service) = csn.service.as_mut() {
            strip_connect(service);
        }
    }
    nodes
}

/// Synthetic sidecar proxy instances for an exported discovery chain, one
/// per local mesh gateway, so the importer routes through the gateways.
pub fn create_disco_chain_health(
    peer_name: &str,
    datacenter: &str,
    trust_domain: &str,
    sn: &ServiceName,
    info: &ExportedDiscoveryChainInfo,
    gateways: &[CheckServiceNode],
) -> ExportedService {
    let proxy_name = format!("{}{}", sn.name, SIDECAR_PROXY_SUFFIX);
    let partition = partition_or_default(&sn.partition);
    let namespace = namespace_or_default(&sn.namespace);

    let main_spiffe_id = spiffe_id_service(trust_domain, partition, namespace, datacenter, &sn.name);
    let mut spiffe_ids = vec![
        main_spiffe_id.clone(),
        // Listed even for L4 so switching protocols never breaks the peer.
        spiffe_id_mesh_gateway(trust_domain, partition, datacenter),
    ];
    if !is_protocol_http_like(&info.protocol) {
        for target in &info.tcp_targets {
            let id = spiffe_id_service(
                trust_domain,
                &target.partition,
                &target.namespace,
                &target.datacenter,
                &target.service,
            );
            if id != main_spiffe_id {
                spiffe_ids.push(id);
            }
        }
    }
    let peer_meta = PeeringServiceMeta {
        sni: vec![peered_service_sni(
            &sn.name,
            namespace,
            partition,
            peer_name,
            trust_domain,
        )],
        spiffe_id: spiffe_ids,
        protocol: info.protocol.clone(),
    };

    let nodes = gateways
        .iter()
        .enumerate()
        .filter_map(|(i, gw)| {
            let gw_node = gw.node.clone()?;
            let gw_service = gw.service.as_ref()?;

            let (proxy_id, dest_id) = if gw_service.id.is_empty() {
                (proxy_name.clone(), sn.name.clone())
            } else {
                // Distinguishes several gateways on one node.
                (
                    format!("{proxy_name}-instance-{i}"),
                    format!("{}-instance-{i}", sn.name),
                )
            };

            let checks = flatten_checks(
                &gw_node.node,
                &proxy_id,
                &proxy_name,
                partition,
                namespace,
                &gw.checks,
            );

            Some(CheckServiceNode {
                node: Some(gw_node),
                service: Some(NodeService {
                    kind: service_kind::CONNECT_PROXY.to_string(),
                    id: proxy_id,
                    service: proxy_name.clone(),
                    partition: partition.to_string(),
                    namespace: namespace.to_string(),
                    peer_name: LOCAL_PEER.to_string(),
                    proxy: Some(ConnectProxyConfig {
                        destination_service_name: sn.name.clone(),
                        destination_service_id: dest_id,
                        ..Default::default()
                    }),
                    address: gw_service.address.clone(),
                    tagged_addresses: gw_service.tagged_addresses.clone(),
                    port: gw_service.port,
                    socket_path: gw_service.socket_path.clone(),
                    weights: gw_service.weights.clone(),
                    connect: Some(ServiceConnect {
                        native: false,
                        peer_meta: Some(peer_meta.clone()),
                    }),
                    ..Default::default()
                }),
                checks,
            })
        })
        .collect();

    ExportedService { nodes }
}
