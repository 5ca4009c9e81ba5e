//! Meshpeer - cluster peering replication
//!
//! Replicates exported service health, trust bundles and server addresses
//! between two service-mesh clusters over one bidirectional gRPC stream
//! per peering.

pub mod catalog;
pub mod config;
pub mod connect;
pub mod events;
pub mod peerstream;
pub mod proto;
pub mod proto_ext;
pub mod resource;
pub mod structs;
pub mod utils;

pub use peerstream::{HandleStreamRequest, PeerStreamServer, StreamError};
