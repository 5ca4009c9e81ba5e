//! Protobuf messages for the peering stream.
//!
//! Messages are declared with prost derives and checked in, so the crate
//! builds without protoc.

mod catalog;
mod peering;
mod peerstream;

pub use catalog::*;
pub use peering::*;
pub use peerstream::*;
