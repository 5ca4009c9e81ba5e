//! Turns local catalog changes into a deduplicated feed of outbound
//! updates for one peer.
//!
//! Each category of watched state runs in its own task and reports into a
//! typed inbox. A single event loop owns the [`SubscriptionState`], shapes
//! the data for export and forwards changed payloads to the stream.

pub mod health;

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::catalog::{CatalogError, StateStore, WatchOutcome, WatchSet};
use crate::config::PeerStreamConfig;
use crate::events::{Event, EventPublisher, Payload, SubscribeError, SubscribeRequest, Subject, Topic};
use crate::peerstream::subscription_state::{
    PayloadId, PendingPayloads, SubscriptionState, Update, UpdatePayload,
};
use crate::peerstream::subscription_tracker::ResourceSubscriptionTracker;
use crate::peerstream::subscription_view::ServiceHealthView;
use crate::proto::{
    CheckServiceNode, ExportedService, ExportedServiceList as ExportedServiceListProto,
    PeeringServerAddresses, PeeringTrustBundle,
};
use crate::resource::ResourceKind;
use crate::structs::{
    best_address, partition_or_default, service_kind, ExportedDiscoveryChainInfo,
    ExportedServiceList, MeshConfig, ServiceName, DEFAULT_PARTITION, LOCAL_PEER,
    TAGGED_ADDRESS_WAN,
};
use crate::utils::retry::{watch_backoff, WatchRetry};

use self::health::{
    create_disco_chain_health, filter_connect_references, prepare_for_export,
    prepare_mesh_gateways,
};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    #[error("configured to peer through mesh gateways but no mesh gateways are registered")]
    NoMeshGateways,

    #[error("gave up on {watch} watch after repeated failures: {last_error}")]
    RetriesExhausted {
        watch: &'static str,
        last_error: String,
    },
}

/// What the stream receives from the manager. An error is final: the
/// manager has stopped.
pub type ManagerEvent = Result<Update, ManagerError>;

/// Inbox of the event loop.
#[derive(Debug)]
enum WatchEvent {
    ExportedServices(ExportedServiceList),
    ServiceHealth {
        service: ServiceName,
        nodes: Vec<CheckServiceNode>,
    },
    MeshGateways {
        partition: String,
        nodes: Vec<CheckServiceNode>,
    },
    CaRoots(PeeringTrustBundle),
    ServerAddresses(Vec<String>),
    Failed(ManagerError),
}

async fn send<T>(tx: &mpsc::Sender<T>, cancel: &CancellationToken, item: T) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        res = tx.send(item) => res.is_ok(),
    }
}

async fn sleep_or_cancel(delay: std::time::Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

struct Shared {
    config: PeerStreamConfig,
    trust_domain: String,
    store: Arc<dyn StateStore>,
    publisher: Arc<dyn EventPublisher>,
    remote_subs: Arc<ResourceSubscriptionTracker>,
}

/// Manager for one stream. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionManager {
    shared: Arc<Shared>,
}

impl SubscriptionManager {
    pub fn new(
        config: PeerStreamConfig,
        trust_domain: impl Into<String>,
        store: Arc<dyn StateStore>,
        publisher: Arc<dyn EventPublisher>,
        remote_subs: Arc<ResourceSubscriptionTracker>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                trust_domain: trust_domain.into(),
                store,
                publisher,
                remote_subs,
            }),
        }
    }

    /// Starts every watcher for the peer and returns the update feed.
    ///
    /// Watchers only start producing once the peer subscribes to the
    /// matching resource. Everything stops when `cancel` fires.
    pub fn subscribe(
        &self,
        cancel: &CancellationToken,
        peer_id: &str,
        peer_name: &str,
        partition: &str,
    ) -> mpsc::Receiver<ManagerEvent> {
        let cancel = cancel.child_token();
        let (inbox_tx, inbox_rx) = mpsc::channel(1);
        let (public_tx, public_rx) = mpsc::channel(1);

        let shared = &self.shared;
        spawn_watch(
            inbox_tx.clone(),
            cancel.clone(),
            watch_exported_services(shared.clone(), peer_id.to_string(), inbox_tx.clone(), cancel.clone()),
        );
        spawn_watch(
            inbox_tx.clone(),
            cancel.clone(),
            watch_server_addrs(shared.clone(), inbox_tx.clone(), cancel.clone()),
        );
        if shared.config.connect_enabled {
            spawn_watch(
                inbox_tx.clone(),
                cancel.clone(),
                watch_mesh_gateways(
                    shared.clone(),
                    partition.to_string(),
                    inbox_tx.clone(),
                    cancel.clone(),
                ),
            );
            let ca = CaRootsWatch {
                trust_domain: shared.trust_domain.clone(),
                partition: partition.to_string(),
            };
            spawn_watch(
                inbox_tx.clone(),
                cancel.clone(),
                watch_ca_roots(shared.clone(), ca, inbox_tx.clone(), cancel.clone()),
            );
        }

        let event_loop = EventLoop {
            shared: shared.clone(),
            state: SubscriptionState::new(peer_name, partition),
            inbox_tx,
            public_tx,
            cancel,
        };
        tokio::spawn(event_loop.run(inbox_rx));

        public_rx
    }
}

/// Runs a watcher and reports a terminal failure to the event loop.
fn spawn_watch<F>(inbox: mpsc::Sender<WatchEvent>, cancel: CancellationToken, watch: F)
where
    F: Future<Output = Result<(), ManagerError>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = watch.await {
            error!(error = %err, "catalog watch failed");
            send(&inbox, &cancel, WatchEvent::Failed(err)).await;
        }
    });
}

// ============================================================================
// Event loop
// ============================================================================

struct EventLoop {
    shared: Arc<Shared>,
    state: SubscriptionState,
    inbox_tx: mpsc::Sender<WatchEvent>,
    public_tx: mpsc::Sender<ManagerEvent>,
    cancel: CancellationToken,
}

impl EventLoop {
    async fn run(mut self, mut inbox: mpsc::Receiver<WatchEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = inbox.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            let (pending, cleanup) = match event {
                WatchEvent::Failed(err) => {
                    send(&self.public_tx, &self.cancel, Err(err)).await;
                    self.cancel.cancel();
                    return;
                }
                WatchEvent::ExportedServices(list) => (self.handle_exported_services(list), true),
                WatchEvent::ServiceHealth { service, nodes } => {
                    (self.handle_service_health(service, nodes), false)
                }
                WatchEvent::MeshGateways { partition, nodes } => {
                    (self.handle_mesh_gateways(&partition, nodes), false)
                }
                WatchEvent::CaRoots(bundle) => {
                    let mut pending = PendingPayloads::new();
                    pending.add(PayloadId::TrustBundle, UpdatePayload::TrustBundle(bundle));
                    (pending, false)
                }
                WatchEvent::ServerAddresses(addresses) => {
                    let mut pending = PendingPayloads::new();
                    pending.add(
                        PayloadId::ServerAddresses,
                        UpdatePayload::ServerAddresses(PeeringServerAddresses { addresses }),
                    );
                    (pending, false)
                }
            };

            for update in self.state.take_changed(pending) {
                trace!(id = ?update.id, "sending update");
                if !send(&self.public_tx, &self.cancel, Ok(update)).await {
                    return;
                }
            }
            if cleanup {
                self.state.cleanup_event_versions();
            }
        }
    }

    fn handle_exported_services(&mut self, list: ExportedServiceList) -> PendingPayloads {
        let mut pending = PendingPayloads::new();
        self.state.export_list = Some(list.clone());

        self.sync_normal_services(&list.services, &mut pending);
        if self.shared.config.connect_enabled {
            self.sync_discovery_chains(&list, &mut pending);
        }

        pending.add(
            PayloadId::ExportedServiceList,
            UpdatePayload::ExportedServiceList(ExportedServiceListProto {
                services: list.list_all_service_names(),
            }),
        );
        pending
    }

    /// Starts a health watch per newly exported service and stops the
    /// watches of services no longer exported.
    fn sync_normal_services(&mut self, services: &[ServiceName], pending: &mut PendingPayloads) {
        for svc in services {
            if self.state.watched_services.contains_key(svc) {
                continue;
            }
            let token = self.cancel.child_token();
            debug!(service = %svc, "watching exported service");
            spawn_watch(
                self.inbox_tx.clone(),
                token.clone(),
                watch_service_health(
                    self.shared.clone(),
                    svc.clone(),
                    self.inbox_tx.clone(),
                    token.clone(),
                ),
            );
            self.state.watched_services.insert(svc.clone(), token);
        }

        let removed: Vec<ServiceName> = self
            .state
            .watched_services
            .keys()
            .filter(|svc| !services.contains(svc))
            .cloned()
            .collect();
        for svc in removed {
            if let Some(token) = self.state.watched_services.remove(&svc) {
                token.cancel();
            }
            debug!(service = %svc, "service no longer exported");
            pending.add(PayloadId::Service(svc), UpdatePayload::ServiceRemoved);
        }
    }

    fn sync_discovery_chains(&mut self, list: &ExportedServiceList, pending: &mut PendingPayloads) {
        for (name, info) in &list.disco_chains {
            if self.state.connect_services.get(name) == Some(info) {
                continue;
            }
            self.state.connect_services.insert(name.clone(), info.clone());
            self.collect_discovery_chain(name, info, pending);
        }

        let dropped: Vec<ServiceName> = self
            .state
            .connect_services
            .keys()
            .filter(|name| !list.disco_chains.contains_key(name))
            .cloned()
            .collect();
        for name in dropped {
            self.state.connect_services.remove(&name);
            // Nothing could have been sent before the gateways were known.
            if self.state.mesh_gateway.is_some() {
                pending.add(
                    PayloadId::DiscoveryChain(name),
                    UpdatePayload::ExportedService(ExportedService::default()),
                );
            }
        }
    }

    fn collect_discovery_chain(
        &self,
        name: &ServiceName,
        info: &ExportedDiscoveryChainInfo,
        pending: &mut PendingPayloads,
    ) {
        if !self.state.connect_services.contains_key(name) || self.state.export_list.is_none() {
            return;
        }
        let Some(gateways) = self.state.mesh_gateway.as_ref() else {
            return;
        };
        pending.add(
            PayloadId::DiscoveryChain(name.clone()),
            UpdatePayload::ExportedService(create_disco_chain_health(
                &self.state.peer_name,
                &self.shared.config.datacenter,
                &self.shared.trust_domain,
                name,
                info,
                gateways,
            )),
        );
    }

    fn handle_service_health(
        &mut self,
        service: ServiceName,
        nodes: Vec<CheckServiceNode>,
    ) -> PendingPayloads {
        let mut pending = PendingPayloads::new();
        // A cancelled watch may still have had an update in flight.
        if !self.state.watched_services.contains_key(&service) {
            trace!(service = %service, "dropping update for unwatched service");
            return pending;
        }

        let mut nodes = filter_connect_references(nodes);
        prepare_for_export(&mut nodes);
        pending.add(
            PayloadId::Service(service),
            UpdatePayload::ExportedService(ExportedService { nodes }),
        );
        pending
    }

    fn handle_mesh_gateways(&mut self, partition: &str, nodes: Vec<CheckServiceNode>) -> PendingPayloads {
        let mut pending = PendingPayloads::new();
        if !self.shared.config.connect_enabled
            || partition_or_default(partition) != partition_or_default(&self.state.partition)
        {
            return pending;
        }

        self.state.mesh_gateway = Some(prepare_mesh_gateways(nodes));

        if self.state.export_list.is_some() {
            for (name, info) in &self.state.connect_services {
                self.collect_discovery_chain(name, info, &mut pending);
            }
        }
        pending
    }
}

// ============================================================================
// Blocking query watches
// ============================================================================

/// Re-runs `query` whenever the data it read changes, sending each result.
///
/// Failures back off and retry; exhausting the retry budget is an error.
async fn run_blocking_query<T, Q>(
    shared: &Shared,
    watch: &'static str,
    mut query: Q,
    tx: &mpsc::Sender<T>,
    cancel: &CancellationToken,
) -> Result<(), ManagerError>
where
    Q: FnMut(&dyn StateStore, &mut WatchSet) -> Result<T, ManagerError>,
{
    let mut retry = WatchRetry::new(watch_backoff(&shared.config.watch_backoff));
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let mut ws = WatchSet::new();
        match query(shared.store.as_ref(), &mut ws) {
            Ok(result) => {
                if !send(tx, cancel, result).await {
                    return Ok(());
                }
                retry.reset();
                if ws.wait(cancel).await == WatchOutcome::Cancelled {
                    return Ok(());
                }
            }
            Err(err) => {
                warn!(watch, error = %err, "failed to sync from query");
                let Some(delay) = retry.next_delay() else {
                    return Err(ManagerError::RetriesExhausted {
                        watch,
                        last_error: err.to_string(),
                    });
                };
                if !sleep_or_cancel(delay, cancel).await {
                    return Ok(());
                }
            }
        }
    }
}

async fn watch_exported_services(
    shared: Arc<Shared>,
    peer_id: String,
    inbox: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) -> Result<(), ManagerError> {
    if !shared
        .remote_subs
        .wait_subscribed(ResourceKind::ExportedService, &cancel)
        .await
    {
        return Ok(());
    }
    let datacenter = shared.config.datacenter.clone();
    run_blocking_query(
        &shared,
        "exported-services",
        |store, ws| {
            let (_, list) = store.exported_services_for_peer(Some(ws), &peer_id, &datacenter)?;
            Ok(WatchEvent::ExportedServices(list))
        },
        &inbox,
        &cancel,
    )
    .await
}

async fn watch_mesh_gateways(
    shared: Arc<Shared>,
    partition: String,
    inbox: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) -> Result<(), ManagerError> {
    if !shared
        .remote_subs
        .wait_subscribed(ResourceKind::ExportedService, &cancel)
        .await
    {
        return Ok(());
    }
    run_blocking_query(
        &shared,
        "mesh-gateways",
        |store, ws| {
            let (_, nodes) =
                store.service_dump(Some(ws), service_kind::MESH_GATEWAY, &partition, LOCAL_PEER)?;
            Ok(WatchEvent::MeshGateways {
                partition: partition.clone(),
                nodes,
            })
        },
        &inbox,
        &cancel,
    )
    .await
}

/// Switches the server address source whenever the mesh config changes.
async fn watch_server_addrs(
    shared: Arc<Shared>,
    inbox: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) -> Result<(), ManagerError> {
    if !shared
        .remote_subs
        .wait_subscribed(ResourceKind::ServerAddresses, &cancel)
        .await
    {
        return Ok(());
    }

    let (config_tx, mut config_rx) = mpsc::channel::<Option<MeshConfig>>(1);
    {
        let shared = shared.clone();
        let cancel = cancel.clone();
        spawn_watch(inbox.clone(), cancel.clone(), async move {
            run_blocking_query(
                &shared,
                "mesh-config",
                |store, ws| Ok(store.mesh_config(Some(ws))?.1),
                &config_tx,
                &cancel,
            )
            .await
        });
    }

    let mut source: Option<CancellationToken> = None;
    let mut current: Option<bool> = None;
    loop {
        let config = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            config = config_rx.recv() => match config {
                Some(config) => config,
                None => return Ok(()),
            },
        };

        let use_gateways = config.is_some_and(|c| c.peer_through_mesh_gateways);
        if source.is_some() && current == Some(use_gateways) {
            continue;
        }
        current = Some(use_gateways);
        if let Some(previous) = source.take() {
            previous.cancel();
        }
        let token = cancel.child_token();
        debug!(use_gateways, "server address source changed");

        if use_gateways {
            let shared = shared.clone();
            let inbox_tx = inbox.clone();
            let token_inner = token.clone();
            spawn_watch(inbox.clone(), token.clone(), async move {
                run_blocking_query(
                    &shared,
                    "mesh-gateway-server-addrs",
                    |store, ws| {
                        let (_, nodes) = store.service_dump(
                            Some(ws),
                            service_kind::MESH_GATEWAY,
                            DEFAULT_PARTITION,
                            LOCAL_PEER,
                        )?;
                        let addresses: Vec<String> = nodes
                            .iter()
                            .map(|csn| {
                                let (addr, port) = best_address(csn, true);
                                format_address_port(&addr, port)
                            })
                            .collect();
                        if addresses.is_empty() {
                            return Err(ManagerError::NoMeshGateways);
                        }
                        Ok(WatchEvent::ServerAddresses(addresses))
                    },
                    &inbox_tx,
                    &token_inner,
                )
                .await
            });
        } else {
            spawn_watch(
                inbox.clone(),
                token.clone(),
                run_event_watch(shared.clone(), ReadyServersWatch, inbox.clone(), token.clone()),
            );
        }
        source = Some(token);
    }
}

fn format_address_port(addr: &str, port: i32) -> String {
    if addr.contains(':') {
        format!("[{addr}]:{port}")
    } else {
        format!("{addr}:{port}")
    }
}

// ============================================================================
// Event subscription watches
// ============================================================================

/// One kind of event subscription driven by [`run_event_watch`].
trait EventWatch: Send + 'static {
    const NAME: &'static str;

    fn request(&self, index: u64) -> SubscribeRequest;

    /// Called after each successful (re)subscription.
    fn on_subscribe(&mut self, _index: u64) {}

    /// Handles one event. `last_index` is the highest index seen so far.
    fn handle(&mut self, event: &Event, last_index: u64) -> Option<WatchEvent>;
}

/// Subscribes and forwards events until cancelled, resubscribing after a
/// forced close (from index 0 if the store was abandoned) and backing off
/// after other failures.
async fn run_event_watch<W: EventWatch>(
    shared: Arc<Shared>,
    mut watch: W,
    inbox: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) -> Result<(), ManagerError> {
    let mut retry = WatchRetry::new(watch_backoff(&shared.config.watch_backoff));
    let mut index = 0u64;

    loop {
        let abandon = shared.store.abandon_signal();
        let err = match shared.publisher.subscribe(watch.request(index)) {
            Ok(mut sub) => {
                watch.on_subscribe(index);
                loop {
                    match sub.next(&cancel).await {
                        Ok(event) => {
                            retry.reset();
                            let out = watch.handle(&event, index);
                            index = index.max(event.index);
                            if let Some(out) = out {
                                if !send(&inbox, &cancel, out).await {
                                    return Ok(());
                                }
                            }
                        }
                        Err(err) => break err,
                    }
                }
            }
            Err(err) => err,
        };

        match err {
            SubscribeError::Cancelled => return Ok(()),
            SubscribeError::ForceClosed => {
                if abandon.is_cancelled() {
                    index = 0;
                }
                trace!(
                    watch = W::NAME,
                    "subscription force-closed due to snapshot restore, will attempt resume"
                );
            }
            SubscribeError::Other(msg) => {
                warn!(watch = W::NAME, error = %msg, "subscription failed, will attempt resume");
                let Some(delay) = retry.next_delay() else {
                    return Err(ManagerError::RetriesExhausted {
                        watch: W::NAME,
                        last_error: msg,
                    });
                };
                if !sleep_or_cancel(delay, &cancel).await {
                    return Ok(());
                }
            }
        }
        if cancel.is_cancelled() {
            return Ok(());
        }
    }
}

async fn watch_service_health(
    shared: Arc<Shared>,
    service: ServiceName,
    inbox: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) -> Result<(), ManagerError> {
    let watch = ServiceHealthWatch {
        service,
        view: ServiceHealthView::new(),
    };
    run_event_watch(shared, watch, inbox, cancel).await
}

async fn watch_ca_roots(
    shared: Arc<Shared>,
    watch: CaRootsWatch,
    inbox: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) -> Result<(), ManagerError> {
    if !shared
        .remote_subs
        .wait_subscribed(ResourceKind::TrustBundle, &cancel)
        .await
    {
        return Ok(());
    }
    run_event_watch(shared, watch, inbox, cancel).await
}

struct ServiceHealthWatch {
    service: ServiceName,
    view: ServiceHealthView,
}

impl EventWatch for ServiceHealthWatch {
    const NAME: &'static str = "service-health";

    fn request(&self, index: u64) -> SubscribeRequest {
        SubscribeRequest {
            topic: Topic::ServiceHealth,
            subject: Subject::Service {
                service: self.service.clone(),
                peer_name: LOCAL_PEER.to_string(),
            },
            token: String::new(),
            index,
        }
    }

    fn on_subscribe(&mut self, index: u64) {
        if index == 0 {
            self.view.reset();
        } else {
            self.view.resume();
        }
    }

    fn handle(&mut self, event: &Event, _last_index: u64) -> Option<WatchEvent> {
        self.view
            .apply(&event.payload)
            .then(|| WatchEvent::ServiceHealth {
                service: self.service.clone(),
                nodes: self.view.result(),
            })
    }
}

struct CaRootsWatch {
    trust_domain: String,
    partition: String,
}

impl EventWatch for CaRootsWatch {
    const NAME: &'static str = "ca-roots";

    fn request(&self, index: u64) -> SubscribeRequest {
        SubscribeRequest {
            topic: Topic::CaRoots,
            subject: Subject::None,
            token: String::new(),
            index,
        }
    }

    fn handle(&mut self, event: &Event, last_index: u64) -> Option<WatchEvent> {
        if event.index <= last_index || event.is_framing_event() {
            return None;
        }
        let Payload::CaRoots(roots) = &event.payload else {
            return None;
        };
        Some(WatchEvent::CaRoots(PeeringTrustBundle {
            trust_domain: self.trust_domain.clone(),
            root_pems: roots.iter().map(|r| r.root_cert.clone()).collect(),
            exported_partition: self.partition.clone(),
            ..Default::default()
        }))
    }
}

struct ReadyServersWatch;

impl EventWatch for ReadyServersWatch {
    const NAME: &'static str = "server-addresses";

    fn request(&self, index: u64) -> SubscribeRequest {
        SubscribeRequest {
            topic: Topic::ReadyServers,
            subject: Subject::None,
            token: String::new(),
            index,
        }
    }

    fn handle(&mut self, event: &Event, last_index: u64) -> Option<WatchEvent> {
        if event.is_framing_event() || event.index <= last_index {
            return None;
        }
        let Payload::ReadyServers(servers) = &event.payload else {
            return None;
        };

        let addresses: Vec<String> = servers
            .iter()
            .filter(|srv| srv.ext_grpc_port != 0)
            .map(|srv| {
                let addr = srv
                    .tagged_addresses
                    .get(TAGGED_ADDRESS_WAN)
                    .filter(|wan| !wan.is_empty())
                    .unwrap_or(&srv.address);
                format!("{}:{}", addr, srv.ext_grpc_port)
            })
            .collect();
        if addresses.is_empty() {
            warn!("did not find any server addresses with external gRPC ports to publish");
            return None;
        }
        Some(WatchEvent::ServerAddresses(addresses))
    }
}
