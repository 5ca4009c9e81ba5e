//! Constructors and helpers for peer stream proto types.

use bytes::Bytes;
use prost::Message;
use prost_types::Any;
use tonic::{Code, Status};

use crate::proto::replication_message::{Heartbeat, Payload, Request, Response, Terminated};
use crate::proto::{LeaderAddress, ReplicationMessage, RpcStatus};
use crate::resource::ResourceKind;

/// Type URL of [`LeaderAddress`] status details.
pub const TYPE_URL_LEADER_ADDRESS: &str = "type.googleapis.com/meshpeer.peerstream.LeaderAddress";

/// Placeholder written over stream secrets in trace output.
pub const REDACTED: &str = "hidden";

impl ReplicationMessage {
    pub fn request(req: Request) -> Self {
        Self {
            payload: Some(Payload::Request(req)),
        }
    }

    pub fn response(resp: Response) -> Self {
        Self {
            payload: Some(Payload::Response(resp)),
        }
    }

    /// Initial subscription for a resource type.
    pub fn subscribe(kind: ResourceKind, peer_id: &str) -> Self {
        Self::request(Request {
            resource_url: kind.type_url().to_string(),
            peer_id: peer_id.to_string(),
            ..Default::default()
        })
    }

    pub fn ack(resource_url: &str, nonce: &str) -> Self {
        Self::request(Request {
            resource_url: resource_url.to_string(),
            response_nonce: nonce.to_string(),
            ..Default::default()
        })
    }

    pub fn nack(resource_url: &str, nonce: &str, code: Code, message: impl Into<String>) -> Self {
        let message = message.into();
        let error = (code != Code::Ok || !message.is_empty()).then(|| RpcStatus {
            code: code as i32,
            message,
            details: vec![],
        });
        Self::request(Request {
            resource_url: resource_url.to_string(),
            response_nonce: nonce.to_string(),
            error,
            ..Default::default()
        })
    }

    pub fn terminated() -> Self {
        Self {
            payload: Some(Payload::Terminated(Terminated {})),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            payload: Some(Payload::Heartbeat(Heartbeat {})),
        }
    }

    /// Copy safe to log: the stream secret of an Open message is masked.
    pub fn redacted(&self) -> Self {
        let mut clone = self.clone();
        if let Some(Payload::Open(open)) = clone.payload.as_mut() {
            open.stream_secret_id = REDACTED.to_string();
        }
        clone
    }

    /// Short payload name for log fields.
    pub fn payload_name(&self) -> &'static str {
        match self.payload {
            Some(Payload::Open(_)) => "open",
            Some(Payload::Request(_)) => "request",
            Some(Payload::Response(_)) => "response",
            Some(Payload::Terminated(_)) => "terminated",
            Some(Payload::Heartbeat(_)) => "heartbeat",
            None => "empty",
        }
    }
}

pub fn pack_any<M: Message>(type_url: &str, msg: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}

pub fn unpack_any<M: Message + Default>(any: &Any) -> Result<M, prost::DecodeError> {
    M::decode(any.value.as_slice())
}

/// FailedPrecondition status telling the caller where the leader is.
pub fn not_leader_status(message: &str, leader_address: &str) -> Status {
    let details = RpcStatus {
        code: Code::FailedPrecondition as i32,
        message: message.to_string(),
        details: vec![pack_any(
            TYPE_URL_LEADER_ADDRESS,
            &LeaderAddress {
                address: leader_address.to_string(),
            },
        )],
    };
    Status::with_details(
        Code::FailedPrecondition,
        message,
        Bytes::from(details.encode_to_vec()),
    )
}

/// Leader address attached by [`not_leader_status`], if any.
pub fn leader_address(status: &Status) -> Option<String> {
    let details = RpcStatus::decode(status.details()).ok()?;
    details
        .details
        .iter()
        .find(|any| any.type_url == TYPE_URL_LEADER_ADDRESS)
        .and_then(|any| unpack_any::<LeaderAddress>(any).ok())
        .map(|leader| leader.address)
}
