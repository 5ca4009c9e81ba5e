//! Mesh identity helpers: SPIFFE IDs, peered SNI names and trust domains.

use crate::structs::{namespace_or_default, partition_or_default, DEFAULT_PARTITION};

/// Trust domain of the cluster with the given CA cluster ID.
pub fn trust_domain_for_cluster(cluster_id: &str) -> String {
    format!("{cluster_id}.consul")
}

/// SPIFFE ID of a service workload.
pub fn spiffe_id_service(
    trust_domain: &str,
    partition: &str,
    namespace: &str,
    datacenter: &str,
    service: &str,
) -> String {
    format!(
        "spiffe://{}{}/ns/{}/dc/{}/svc/{}",
        trust_domain,
        partition_segment(partition),
        namespace_or_default(namespace),
        datacenter,
        service
    )
}

/// SPIFFE ID shared by every mesh gateway in a partition.
pub fn spiffe_id_mesh_gateway(trust_domain: &str, partition: &str, datacenter: &str) -> String {
    format!(
        "spiffe://{}{}/gateway/mesh/dc/{}",
        trust_domain,
        partition_segment(partition),
        datacenter
    )
}

/// SNI a peer uses to reach a service imported from `peer_name`.
pub fn peered_service_sni(
    service: &str,
    namespace: &str,
    partition: &str,
    peer_name: &str,
    trust_domain: &str,
) -> String {
    [
        service,
        namespace_or_default(namespace),
        partition_or_default(partition),
        peer_name,
        "external",
        trust_domain,
    ]
    .join(".")
}

pub fn is_protocol_http_like(protocol: &str) -> bool {
    matches!(protocol, "http" | "http2" | "grpc")
}

fn partition_segment(partition: &str) -> String {
    let partition = partition_or_default(partition);
    if partition == DEFAULT_PARTITION {
        String::new()
    } else {
        format!("/ap/{partition}")
    }
}
