//! Resource types replicated over a peering stream.
//!
//! The set is closed: any type URL outside it is rejected where messages
//! are decoded.

use std::fmt;

use thiserror::Error;

pub const TYPE_URL_EXPORTED_SERVICE: &str = "type.googleapis.com/meshpeer.peerstream.ExportedService";
pub const TYPE_URL_EXPORTED_SERVICE_LIST: &str =
    "type.googleapis.com/meshpeer.peerstream.ExportedServiceList";
pub const TYPE_URL_PEERING_TRUST_BUNDLE: &str =
    "type.googleapis.com/meshpeer.peering.PeeringTrustBundle";
pub const TYPE_URL_PEERING_SERVER_ADDRESSES: &str =
    "type.googleapis.com/meshpeer.peering.PeeringServerAddresses";

/// Resource ID used for the exported service list.
pub const EXPORTED_SERVICE_LIST_ID: &str = "exported-service-list";
/// Resource ID used for the trust bundle.
pub const TRUST_BUNDLE_ID: &str = "roots";
/// Resource ID used for the server address list.
pub const SERVER_ADDRS_ID: &str = "server-addrs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    ExportedService,
    ExportedServiceList,
    TrustBundle,
    ServerAddresses,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown resource type {0:?}")]
pub struct UnknownResourceUrl(pub String);

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::ExportedService,
        ResourceKind::ExportedServiceList,
        ResourceKind::TrustBundle,
        ResourceKind::ServerAddresses,
    ];

    pub fn type_url(self) -> &'static str {
        match self {
            ResourceKind::ExportedService => TYPE_URL_EXPORTED_SERVICE,
            ResourceKind::ExportedServiceList => TYPE_URL_EXPORTED_SERVICE_LIST,
            ResourceKind::TrustBundle => TYPE_URL_PEERING_TRUST_BUNDLE,
            ResourceKind::ServerAddresses => TYPE_URL_PEERING_SERVER_ADDRESSES,
        }
    }

    pub fn from_type_url(url: &str) -> Result<Self, UnknownResourceUrl> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.type_url() == url)
            .ok_or_else(|| UnknownResourceUrl(url.to_string()))
    }

    /// Resources a stream subscribes to on entry. Only dialers ask for
    /// server addresses; an acceptor's list would always be empty.
    pub fn initial_subscriptions(is_dialer: bool) -> Vec<ResourceKind> {
        let mut kinds = vec![
            ResourceKind::ExportedService,
            ResourceKind::ExportedServiceList,
            ResourceKind::TrustBundle,
        ];
        if is_dialer {
            kinds.push(ResourceKind::ServerAddresses);
        }
        kinds
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_url())
    }
}
