//! Catalog messages carried inside exported service payloads.
//!
//! Map fields use `BTreeMap` so encoded bytes are stable across runs, which
//! the subscription manager relies on for content hashing.

use std::collections::BTreeMap;

/// One service instance with its node and health checks.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckServiceNode {
    #[prost(message, optional, tag = "1")]
    pub node: Option<Node>,
    #[prost(message, optional, tag = "2")]
    pub service: Option<NodeService>,
    #[prost(message, repeated, tag = "3")]
    pub checks: Vec<HealthCheck>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexedCheckServiceNodes {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(message, repeated, tag = "2")]
    pub nodes: Vec<CheckServiceNode>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RaftIndex {
    #[prost(uint64, tag = "1")]
    pub create_index: u64,
    #[prost(uint64, tag = "2")]
    pub modify_index: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Node {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub node: String,
    #[prost(string, tag = "3")]
    pub partition: String,
    #[prost(string, tag = "4")]
    pub peer_name: String,
    #[prost(string, tag = "5")]
    pub address: String,
    #[prost(string, tag = "6")]
    pub datacenter: String,
    #[prost(btree_map = "string, string", tag = "7")]
    pub tagged_addresses: BTreeMap<String, String>,
    #[prost(btree_map = "string, string", tag = "8")]
    pub meta: BTreeMap<String, String>,
    #[prost(message, optional, tag = "9")]
    pub raft_index: Option<RaftIndex>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceAddress {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(int32, tag = "2")]
    pub port: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Weights {
    #[prost(int32, tag = "1")]
    pub passing: i32,
    #[prost(int32, tag = "2")]
    pub warning: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectProxyConfig {
    #[prost(string, tag = "1")]
    pub destination_service_name: String,
    #[prost(string, tag = "2")]
    pub destination_service_id: String,
    #[prost(string, tag = "3")]
    pub local_service_address: String,
    #[prost(int32, tag = "4")]
    pub local_service_port: i32,
}

/// Addressing metadata attached to services imported through a peering.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeeringServiceMeta {
    #[prost(string, repeated, tag = "1")]
    pub sni: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub spiffe_id: Vec<String>,
    #[prost(string, tag = "3")]
    pub protocol: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServiceConnect {
    #[prost(bool, tag = "1")]
    pub native: bool,
    #[prost(message, optional, tag = "2")]
    pub peer_meta: Option<PeeringServiceMeta>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeService {
    #[prost(string, tag = "1")]
    pub kind: String,
    #[prost(string, tag = "2")]
    pub id: String,
    #[prost(string, tag = "3")]
    pub service: String,
    #[prost(string, repeated, tag = "4")]
    pub tags: Vec<String>,
    #[prost(string, tag = "5")]
    pub address: String,
    #[prost(btree_map = "string, message", tag = "6")]
    pub tagged_addresses: BTreeMap<String, ServiceAddress>,
    #[prost(btree_map = "string, string", tag = "7")]
    pub meta: BTreeMap<String, String>,
    #[prost(int32, tag = "8")]
    pub port: i32,
    #[prost(string, tag = "9")]
    pub socket_path: String,
    #[prost(message, optional, tag = "10")]
    pub weights: Option<Weights>,
    #[prost(bool, tag = "11")]
    pub enable_tag_override: bool,
    #[prost(message, optional, tag = "12")]
    pub proxy: Option<ConnectProxyConfig>,
    #[prost(message, optional, tag = "13")]
    pub connect: Option<ServiceConnect>,
    #[prost(string, tag = "14")]
    pub partition: String,
    #[prost(string, tag = "15")]
    pub namespace: String,
    #[prost(string, tag = "16")]
    pub peer_name: String,
    #[prost(message, optional, tag = "17")]
    pub raft_index: Option<RaftIndex>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheck {
    #[prost(string, tag = "1")]
    pub node: String,
    #[prost(string, tag = "2")]
    pub check_id: String,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub status: String,
    #[prost(string, tag = "5")]
    pub notes: String,
    #[prost(string, tag = "6")]
    pub output: String,
    #[prost(string, tag = "7")]
    pub service_id: String,
    #[prost(string, tag = "8")]
    pub service_name: String,
    #[prost(string, repeated, tag = "9")]
    pub service_tags: Vec<String>,
    #[prost(string, tag = "10")]
    pub r#type: String,
    #[prost(string, tag = "11")]
    pub partition: String,
    #[prost(string, tag = "12")]
    pub namespace: String,
    #[prost(string, tag = "13")]
    pub peer_name: String,
    #[prost(int32, tag = "14")]
    pub exposed_port: i32,
    #[prost(message, optional, tag = "15")]
    pub raft_index: Option<RaftIndex>,
}
