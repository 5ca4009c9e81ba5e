//! Peering resources replicated between clusters.

/// CA roots one cluster exports so its peers can verify mesh traffic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeeringTrustBundle {
    #[prost(string, tag = "1")]
    pub trust_domain: String,
    #[prost(string, tag = "2")]
    pub peer_name: String,
    #[prost(string, tag = "3")]
    pub partition: String,
    #[prost(string, repeated, tag = "4")]
    pub root_pems: Vec<String>,
    #[prost(string, tag = "5")]
    pub exported_partition: String,
    #[prost(uint64, tag = "6")]
    pub create_index: u64,
    #[prost(uint64, tag = "7")]
    pub modify_index: u64,
}

/// Addresses a dialing cluster can use to reach the exporting servers.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeeringServerAddresses {
    #[prost(string, repeated, tag = "1")]
    pub addresses: Vec<String>,
}
