//! Peer stream wire protocol.

/// Envelope for every message exchanged on a peering stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicationMessage {
    #[prost(oneof = "replication_message::Payload", tags = "1, 2, 3, 4, 5")]
    pub payload: Option<replication_message::Payload>,
}

pub mod replication_message {
    /// Opening handshake sent by the dialer.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Open {
        /// ID of the peering as known by the accepting cluster.
        #[prost(string, tag = "1")]
        pub peer_id: String,
        #[prost(string, tag = "2")]
        pub stream_secret_id: String,
        #[prost(message, optional, tag = "3")]
        pub remote: Option<super::RemoteInfo>,
    }

    /// Subscription, ACK or NACK.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Request {
        #[prost(string, tag = "1")]
        pub peer_id: String,
        #[prost(string, tag = "2")]
        pub response_nonce: String,
        #[prost(string, tag = "3")]
        pub resource_url: String,
        #[prost(message, optional, tag = "4")]
        pub error: Option<super::RpcStatus>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Response {
        #[prost(string, tag = "1")]
        pub nonce: String,
        #[prost(string, tag = "2")]
        pub resource_url: String,
        #[prost(string, tag = "3")]
        pub resource_id: String,
        #[prost(message, optional, tag = "4")]
        pub resource: Option<::prost_types::Any>,
        #[prost(enumeration = "super::Operation", tag = "5")]
        pub operation: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Terminated {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Heartbeat {}

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Open(Open),
        #[prost(message, tag = "2")]
        Request(Request),
        #[prost(message, tag = "3")]
        Response(Response),
        #[prost(message, tag = "4")]
        Terminated(Terminated),
        #[prost(message, tag = "5")]
        Heartbeat(Heartbeat),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Operation {
    Unspecified = 0,
    Upsert = 1,
    Delete = 2,
}

impl Operation {
    /// Wire name of the enum value.
    pub fn as_str_name(&self) -> &'static str {
        match self {
            Operation::Unspecified => "OPERATION_UNSPECIFIED",
            Operation::Upsert => "OPERATION_UPSERT",
            Operation::Delete => "OPERATION_DELETE",
        }
    }
}

/// Locality of the dialing cluster.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoteInfo {
    #[prost(string, tag = "1")]
    pub partition: String,
    #[prost(string, tag = "2")]
    pub datacenter: String,
}

/// Same shape as `google.rpc.Status`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<::prost_types::Any>,
}

/// Attached to FailedPrecondition errors raised on follower nodes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LeaderAddress {
    /// `host:port` of the current leader's external gRPC endpoint.
    #[prost(string, tag = "1")]
    pub address: String,
}

/// All healthy and unhealthy instances of one exported service.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExportedService {
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<super::catalog::CheckServiceNode>,
}

/// Every service name currently exported to a peer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExportedServiceList {
    #[prost(string, repeated, tag = "1")]
    pub services: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExchangeSecretRequest {
    #[prost(string, tag = "1")]
    pub peer_id: String,
    #[prost(string, tag = "2")]
    pub establishment_secret: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExchangeSecretResponse {
    #[prost(string, tag = "1")]
    pub stream_secret: String,
}
