//! In-process catalog.
//!
//! Implements every catalog-facing trait on one object: reads with blocking
//! query support, writes, service health and CA root and ready server events,
//! and leadership. Suitable for tests and for embedding a single-node
//! control plane. Every write bumps a single store index, so any watch set
//! fires on any write.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{CatalogBackend, CatalogError, Leadership, Result, StateStore, WatchSet};
use crate::events::{
    Event, EventPublisher, HealthOp, Payload, SubscribeError, SubscribeRequest, Subject,
    Subscription, Topic,
};
use crate::proto::{
    CheckServiceNode, HealthCheck, Node, NodeService, PeeringTrustBundle, RaftIndex,
};
use crate::structs::{
    namespace_or_default, partition_or_default, CaConfig, CaRoot, DeregisterRequest,
    ExportedServiceList, MeshConfig, Peering, PeeringSecrets, PeeringState, PeeringWriteRequest,
    ReadyServerInfo, RegisterRequest, SecretsRequest, SecretsWriteRequest, ServiceName,
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct NodeKey {
    partition: String,
    peer_name: String,
    node: String,
}

impl NodeKey {
    fn new(partition: &str, peer_name: &str, node: &str) -> Self {
        Self {
            partition: partition_or_default(partition).to_string(),
            peer_name: peer_name.to_string(),
            node: node.to_string(),
        }
    }
}

#[derive(Default)]
struct CatalogState {
    index: u64,
    nodes: BTreeMap<NodeKey, Node>,
    services: BTreeMap<(NodeKey, String), NodeService>,
    checks: BTreeMap<(NodeKey, String), HealthCheck>,
    peerings: BTreeMap<String, Peering>,
    secrets: BTreeMap<String, PeeringSecrets>,
    trust_bundles: BTreeMap<(String, String), PeeringTrustBundle>,
    exports: BTreeMap<String, ExportedServiceList>,
    ca_config: Option<CaConfig>,
    ca_roots: Vec<CaRoot>,
    ready_servers: Vec<ReadyServerInfo>,
    mesh_config: Option<MeshConfig>,
}

impl CatalogState {
    fn instance(&self, key: &NodeKey, service_id: &str) -> Option<CheckServiceNode> {
        let node = self.nodes.get(key)?;
        let service = self.services.get(&(key.clone(), service_id.to_string()))?;
        let checks = self
            .checks
            .iter()
            .filter(|((k, _), chk)| {
                k == key && (chk.service_id.is_empty() || chk.service_id == service_id)
            })
            .map(|(_, chk)| chk.clone())
            .collect();
        Some(CheckServiceNode {
            node: Some(node.clone()),
            service: Some(service.clone()),
            checks,
        })
    }

    fn service_ids_on_node(&self, key: &NodeKey) -> Vec<String> {
        self.services
            .keys()
            .filter(|(k, _)| k == key)
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn instances_matching<F>(&self, mut pred: F) -> Vec<CheckServiceNode>
    where
        F: FnMut(&NodeKey, &NodeService) -> bool,
    {
        self.services
            .iter()
            .filter(|((key, _), svc)| pred(key, svc))
            .filter_map(|((key, id), _)| self.instance(key, id))
            .collect()
    }
}

struct Subscriber {
    topic: Topic,
    subject: Subject,
    tx: mpsc::UnboundedSender<Event>,
}

struct LeaderInfo {
    is_leader: bool,
    address: String,
}

type PendingEvent = (Topic, Subject, Payload);

/// In-memory catalog, event publisher and leadership state.
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
    index_tx: watch::Sender<u64>,
    subscribers: Mutex<Vec<Subscriber>>,
    abandon: Mutex<CancellationToken>,
    leader: RwLock<LeaderInfo>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> CatalogError {
    CatalogError::Backend("catalog lock poisoned".to_string())
}

fn service_subject(svc: &NodeService, peer_name: &str) -> Subject {
    Subject::Service {
        service: ServiceName::in_scope(svc.service.clone(), &svc.partition, &svc.namespace),
        peer_name: peer_name.to_string(),
    }
}

fn health_event(op: HealthOp, key: &NodeKey, instance: CheckServiceNode) -> Option<PendingEvent> {
    let subject = service_subject(instance.service.as_ref()?, &key.peer_name);
    Some((Topic::ServiceHealth, subject, Payload::ServiceHealth { op, instance }))
}

fn raft_index(existing: Option<&RaftIndex>, index: u64) -> Option<RaftIndex> {
    Some(RaftIndex {
        create_index: existing.map(|r| r.create_index).unwrap_or(index),
        modify_index: index,
    })
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            state: RwLock::new(CatalogState::default()),
            index_tx,
            subscribers: Mutex::new(Vec::new()),
            abandon: Mutex::new(CancellationToken::new()),
            leader: RwLock::new(LeaderInfo {
                is_leader: true,
                address: String::new(),
            }),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------------
    // Test and operator controls
    // ------------------------------------------------------------------------

    pub fn set_leader(&self, is_leader: bool, address: impl Into<String>) {
        if let Ok(mut leader) = self.leader.write() {
            leader.is_leader = is_leader;
            leader.address = address.into();
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_exported_services(&self, peer_name: &str, exports: ExportedServiceList) -> Result<()> {
        self.mutate(|state, _| {
            state.exports.insert(peer_name.to_string(), exports);
            Ok(((), vec![]))
        })
    }

    pub fn set_ca_config(&self, config: CaConfig) -> Result<()> {
        self.mutate(|state, _| {
            state.ca_config = Some(config);
            Ok(((), vec![]))
        })
    }

    pub fn set_mesh_config(&self, config: Option<MeshConfig>) -> Result<()> {
        self.mutate(|state, _| {
            state.mesh_config = config;
            Ok(((), vec![]))
        })
    }

    pub fn set_ca_roots(&self, roots: Vec<CaRoot>) -> Result<()> {
        self.mutate(|state, _| {
            state.ca_roots = roots.clone();
            Ok(((), vec![(Topic::CaRoots, Subject::None, Payload::CaRoots(roots))]))
        })
    }

    pub fn set_ready_servers(&self, servers: Vec<ReadyServerInfo>) -> Result<()> {
        self.mutate(|state, _| {
            state.ready_servers = servers.clone();
            Ok((
                (),
                vec![(Topic::ReadyServers, Subject::None, Payload::ReadyServers(servers))],
            ))
        })
    }

    /// Closes every open event subscription.
    pub fn force_close_subscriptions(&self) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
    }

    /// Behaves like a snapshot restore: the current store generation is
    /// abandoned and every subscription is force-closed.
    pub fn restore(&self) {
        if let Ok(mut abandon) = self.abandon.lock() {
            abandon.cancel();
            *abandon = CancellationToken::new();
        }
        self.force_close_subscriptions();
    }

    pub fn current_index(&self) -> u64 {
        *self.index_tx.borrow()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn read_state(&self, ws: Option<&mut WatchSet>) -> Result<RwLockReadGuard<'_, CatalogState>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CatalogError::Backend("injected read failure".to_string()));
        }
        if let Some(ws) = ws {
            ws.add(self.index_tx.subscribe());
        }
        self.state.read().map_err(poisoned)
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, CatalogState>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CatalogError::Backend("injected write failure".to_string()));
        }
        self.state.write().map_err(poisoned)
    }

    fn lock_subscribers(&self) -> Result<MutexGuard<'_, Vec<Subscriber>>> {
        self.subscribers.lock().map_err(poisoned)
    }

    /// Apply a write at the next index and publish the events it produced.
    fn mutate<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut CatalogState, u64) -> Result<(R, Vec<PendingEvent>)>,
    {
        let (result, index, events) = {
            let mut state = self.write_state()?;
            let index = state.index + 1;
            let (result, events) = f(&mut state, index)?;
            state.index = index;
            (result, index, events)
        };
        self.index_tx.send_replace(index);
        self.publish(index, events);
        Ok(result)
    }

    fn publish(&self, index: u64, events: Vec<PendingEvent>) {
        if events.is_empty() {
            return;
        }
        let Ok(mut subscribers) = self.lock_subscribers() else {
            return;
        };
        for (topic, subject, payload) in events {
            let event = Event { index, payload };
            subscribers.retain(|sub| {
                if sub.topic != topic || sub.subject != subject {
                    return true;
                }
                sub.tx.send(event.clone()).is_ok()
            });
        }
    }

    fn snapshot(&self, state: &CatalogState, req: &SubscribeRequest) -> Vec<Payload> {
        let mut payloads = Vec::new();
        if req.index != 0 {
            payloads.push(Payload::NewSnapshotToFollow);
        }
        match (&req.topic, &req.subject) {
            (Topic::ServiceHealth, Subject::Service { service, peer_name }) => {
                let instances = state.instances_matching(|key, svc| {
                    key.peer_name == *peer_name && matches_service(key, svc, service)
                });
                payloads.extend(instances.into_iter().map(|instance| Payload::ServiceHealth {
                    op: HealthOp::Register,
                    instance,
                }));
            }
            (Topic::ServiceHealth, Subject::None) => {}
            (Topic::CaRoots, _) => payloads.push(Payload::CaRoots(state.ca_roots.clone())),
            (Topic::ReadyServers, _) => {
                payloads.push(Payload::ReadyServers(state.ready_servers.clone()))
            }
        }
        payloads.push(Payload::EndOfSnapshot);
        payloads
    }
}

fn matches_service(key: &NodeKey, svc: &NodeService, name: &ServiceName) -> bool {
    svc.service == name.name
        && key.partition == name.partition
        && namespace_or_default(&svc.namespace) == name.namespace
}

// ============================================================================
// StateStore
// ============================================================================

impl StateStore for InMemoryCatalog {
    fn check_service_nodes(
        &self,
        ws: Option<&mut WatchSet>,
        service: &ServiceName,
        peer_name: &str,
    ) -> Result<(u64, Vec<CheckServiceNode>)> {
        let state = self.read_state(ws)?;
        let instances = state.instances_matching(|key, svc| {
            key.peer_name == peer_name && matches_service(key, svc, service)
        });
        Ok((state.index, instances))
    }

    fn node_service_list(
        &self,
        ws: Option<&mut WatchSet>,
        node: &str,
        partition: &str,
        peer_name: &str,
    ) -> Result<(u64, Vec<NodeService>)> {
        let state = self.read_state(ws)?;
        let key = NodeKey::new(partition, peer_name, node);
        let services = state
            .services
            .iter()
            .filter(|((k, _), _)| *k == key)
            .map(|(_, svc)| svc.clone())
            .collect();
        Ok((state.index, services))
    }

    fn service_list(
        &self,
        ws: Option<&mut WatchSet>,
        partition: &str,
        peer_name: &str,
    ) -> Result<(u64, Vec<ServiceName>)> {
        let state = self.read_state(ws)?;
        let partition = partition_or_default(partition);
        let names: BTreeSet<ServiceName> = state
            .services
            .iter()
            .filter(|((k, _), _)| k.partition == partition && k.peer_name == peer_name)
            .map(|((k, _), svc)| ServiceName::in_scope(svc.service.clone(), &k.partition, &svc.namespace))
            .collect();
        Ok((state.index, names.into_iter().collect()))
    }

    fn exported_services_for_peer(
        &self,
        ws: Option<&mut WatchSet>,
        peer_id: &str,
        _datacenter: &str,
    ) -> Result<(u64, ExportedServiceList)> {
        let state = self.read_state(ws)?;
        let exports = state
            .peerings
            .get(peer_id)
            .and_then(|p| state.exports.get(&p.name))
            .cloned()
            .unwrap_or_default();
        Ok((state.index, exports))
    }

    fn service_dump(
        &self,
        ws: Option<&mut WatchSet>,
        kind: &str,
        partition: &str,
        peer_name: &str,
    ) -> Result<(u64, Vec<CheckServiceNode>)> {
        let state = self.read_state(ws)?;
        let partition = partition_or_default(partition);
        let instances = state.instances_matching(|key, svc| {
            svc.kind == kind && key.partition == partition && key.peer_name == peer_name
        });
        Ok((state.index, instances))
    }

    fn ca_config(&self, ws: Option<&mut WatchSet>) -> Result<(u64, Option<CaConfig>)> {
        let state = self.read_state(ws)?;
        Ok((state.index, state.ca_config.clone()))
    }

    fn mesh_config(&self, ws: Option<&mut WatchSet>) -> Result<(u64, Option<MeshConfig>)> {
        let state = self.read_state(ws)?;
        Ok((state.index, state.mesh_config.clone()))
    }

    fn peering_read(
        &self,
        ws: Option<&mut WatchSet>,
        name: &str,
        partition: &str,
    ) -> Result<(u64, Option<Peering>)> {
        let state = self.read_state(ws)?;
        let partition = partition_or_default(partition);
        let peering = state
            .peerings
            .values()
            .find(|p| p.name == name && partition_or_default(&p.partition) == partition)
            .cloned();
        Ok((state.index, peering))
    }

    fn peering_read_by_id(
        &self,
        ws: Option<&mut WatchSet>,
        id: &str,
    ) -> Result<(u64, Option<Peering>)> {
        let state = self.read_state(ws)?;
        Ok((state.index, state.peerings.get(id).cloned()))
    }

    fn peering_trust_bundle_read(
        &self,
        ws: Option<&mut WatchSet>,
        peer_name: &str,
        partition: &str,
    ) -> Result<(u64, Option<PeeringTrustBundle>)> {
        let state = self.read_state(ws)?;
        let key = (partition_or_default(partition).to_string(), peer_name.to_string());
        Ok((state.index, state.trust_bundles.get(&key).cloned()))
    }

    fn peering_trust_bundle_list(
        &self,
        ws: Option<&mut WatchSet>,
        partition: &str,
    ) -> Result<(u64, Vec<PeeringTrustBundle>)> {
        let state = self.read_state(ws)?;
        let partition = partition_or_default(partition);
        let bundles = state
            .trust_bundles
            .iter()
            .filter(|((p, _), _)| p == partition)
            .map(|(_, b)| b.clone())
            .collect();
        Ok((state.index, bundles))
    }

    fn peering_secrets_read(
        &self,
        ws: Option<&mut WatchSet>,
        peer_id: &str,
    ) -> Result<Option<PeeringSecrets>> {
        let state = self.read_state(ws)?;
        Ok(state.secrets.get(peer_id).cloned())
    }

    fn abandon_signal(&self) -> CancellationToken {
        self.abandon
            .lock()
            .map(|token| token.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

// ============================================================================
// CatalogBackend
// ============================================================================

fn apply_secrets(state: &mut CatalogState, req: &SecretsWriteRequest) -> Result<()> {
    let secrets = state
        .secrets
        .entry(req.peer_id.clone())
        .or_insert_with(|| PeeringSecrets {
            peer_id: req.peer_id.clone(),
            ..Default::default()
        });
    match &req.request {
        SecretsRequest::GenerateToken {
            establishment_secret,
        } => {
            secrets.establishment_secret = Some(establishment_secret.clone());
        }
        SecretsRequest::ExchangeSecret {
            establishment_secret,
            pending_stream_secret,
        } => {
            if secrets.establishment_secret.as_deref() != Some(establishment_secret.as_str()) {
                return Err(CatalogError::InvalidRequest(
                    "invalid establishment secret".to_string(),
                ));
            }
            secrets.establishment_secret = None;
            secrets.stream.pending_secret_id = pending_stream_secret.clone();
        }
        SecretsRequest::PromotePending {
            active_stream_secret,
        } => {
            secrets.stream.active_secret_id = active_stream_secret.clone();
            secrets.stream.pending_secret_id.clear();
        }
    }
    Ok(())
}

#[async_trait]
impl CatalogBackend for InMemoryCatalog {
    async fn catalog_register(&self, req: RegisterRequest) -> Result<()> {
        if req.node.node.is_empty() {
            return Err(CatalogError::InvalidRequest("missing node name".to_string()));
        }
        self.mutate(|state, index| {
            let key = NodeKey::new(&req.node.partition, &req.node.peer_name, &req.node.node);
            let mut affected: BTreeSet<String> = BTreeSet::new();

            let mut node = req.node.clone();
            let existing = state.nodes.get(&key);
            let node_changed = existing.map_or(true, |n| {
                Node { raft_index: None, ..n.clone() } != Node { raft_index: None, ..node.clone() }
            });
            node.raft_index = raft_index(existing.and_then(|n| n.raft_index.as_ref()), index);
            state.nodes.insert(key.clone(), node);
            if node_changed {
                affected.extend(state.service_ids_on_node(&key));
            }

            if let Some(mut service) = req.service.clone() {
                if service.id.is_empty() {
                    service.id = service.service.clone();
                }
                let svc_key = (key.clone(), service.id.clone());
                let existing = state.services.get(&svc_key).and_then(|s| s.raft_index.as_ref());
                service.raft_index = raft_index(existing, index);
                affected.insert(service.id.clone());
                state.services.insert(svc_key, service);
            }

            for mut check in req.checks.iter().cloned() {
                if check.check_id.is_empty() {
                    return Err(CatalogError::InvalidRequest("missing check ID".to_string()));
                }
                if check.node.is_empty() {
                    check.node = key.node.clone();
                }
                if check.service_id.is_empty() {
                    affected.extend(state.service_ids_on_node(&key));
                } else {
                    affected.insert(check.service_id.clone());
                }
                let chk_key = (key.clone(), check.check_id.clone());
                let existing = state.checks.get(&chk_key).and_then(|c| c.raft_index.as_ref());
                check.raft_index = raft_index(existing, index);
                state.checks.insert(chk_key, check);
            }

            let events = affected
                .iter()
                .filter_map(|id| state.instance(&key, id))
                .filter_map(|instance| health_event(HealthOp::Register, &key, instance))
                .collect();
            Ok(((), events))
        })
    }

    async fn catalog_deregister(&self, req: DeregisterRequest) -> Result<()> {
        self.mutate(|state, _| {
            let key = NodeKey::new(&req.partition, &req.peer_name, &req.node);
            let mut events = Vec::new();

            match (&req.service_id, &req.check_id) {
                (Some(service_id), _) => {
                    if let Some(instance) = state.instance(&key, service_id) {
                        events.extend(health_event(HealthOp::Deregister, &key, instance));
                    }
                    state.services.remove(&(key.clone(), service_id.clone()));
                    state
                        .checks
                        .retain(|(k, _), chk| !(*k == key && chk.service_id == *service_id));
                }
                (None, Some(check_id)) => {
                    let removed = state.checks.remove(&(key.clone(), check_id.clone()));
                    let affected = match removed {
                        Some(chk) if !chk.service_id.is_empty() => vec![chk.service_id],
                        Some(_) => state.service_ids_on_node(&key),
                        None => vec![],
                    };
                    events.extend(
                        affected
                            .iter()
                            .filter_map(|id| state.instance(&key, id))
                            .filter_map(|instance| health_event(HealthOp::Register, &key, instance)),
                    );
                }
                (None, None) => {
                    for id in state.service_ids_on_node(&key) {
                        if let Some(instance) = state.instance(&key, &id) {
                            events.extend(health_event(HealthOp::Deregister, &key, instance));
                        }
                    }
                    state.services.retain(|(k, _), _| *k != key);
                    state.checks.retain(|(k, _), _| *k != key);
                    state.nodes.remove(&key);
                }
            }
            Ok(((), events))
        })
    }

    async fn peering_write(&self, req: PeeringWriteRequest) -> Result<()> {
        if req.peering.id.is_empty() {
            return Err(CatalogError::InvalidRequest("missing peering ID".to_string()));
        }
        self.mutate(|state, index| {
            if let Some(secrets) = &req.secrets_request {
                apply_secrets(state, secrets)?;
            }
            let mut peering = req.peering.clone();
            peering.create_index = state
                .peerings
                .get(&peering.id)
                .map(|p| p.create_index)
                .unwrap_or(index);
            peering.modify_index = index;
            debug!(peer_id = %peering.id, peer_name = %peering.name, "peering written");
            state.peerings.insert(peering.id.clone(), peering);
            Ok(((), vec![]))
        })
    }

    async fn peering_terminate_by_id(&self, id: &str) -> Result<()> {
        self.mutate(|state, index| {
            let peering = state
                .peerings
                .get_mut(id)
                .ok_or_else(|| CatalogError::NotFound(format!("peering {id}")))?;
            peering.state = PeeringState::Terminated;
            peering.modify_index = index;
            Ok(((), vec![]))
        })
    }

    async fn peering_trust_bundle_write(&self, mut bundle: PeeringTrustBundle) -> Result<()> {
        if bundle.peer_name.is_empty() {
            return Err(CatalogError::InvalidRequest("missing peer name".to_string()));
        }
        self.mutate(|state, index| {
            let key = (
                partition_or_default(&bundle.partition).to_string(),
                bundle.peer_name.clone(),
            );
            bundle.create_index = state
                .trust_bundles
                .get(&key)
                .map(|b| b.create_index)
                .unwrap_or(index);
            bundle.modify_index = index;
            state.trust_bundles.insert(key, bundle);
            Ok(((), vec![]))
        })
    }

    async fn peering_trust_bundle_delete(&self, peer_name: &str, partition: &str) -> Result<()> {
        self.mutate(|state, _| {
            let key = (partition_or_default(partition).to_string(), peer_name.to_string());
            state.trust_bundles.remove(&key);
            Ok(((), vec![]))
        })
    }

    async fn peering_secrets_write(&self, req: SecretsWriteRequest) -> Result<()> {
        self.mutate(|state, _| {
            apply_secrets(state, &req)?;
            Ok(((), vec![]))
        })
    }
}

// ============================================================================
// EventPublisher
// ============================================================================

struct MemorySubscription {
    rx: mpsc::UnboundedReceiver<Event>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self, cancel: &CancellationToken) -> std::result::Result<Event, SubscribeError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SubscribeError::Cancelled),
            event = self.rx.recv() => event.ok_or(SubscribeError::ForceClosed),
        }
    }
}

impl EventPublisher for InMemoryCatalog {
    fn subscribe(
        &self,
        req: SubscribeRequest,
    ) -> std::result::Result<Box<dyn Subscription>, SubscribeError> {
        let state = self
            .state
            .read()
            .map_err(|_| SubscribeError::Other("catalog lock poisoned".to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        for payload in self.snapshot(&state, &req) {
            let _ = tx.send(Event {
                index: state.index,
                payload,
            });
        }

        // Registered while the state lock is held so no write can slip
        // between the snapshot and the live feed.
        self.subscribers
            .lock()
            .map_err(|_| SubscribeError::Other("subscriber lock poisoned".to_string()))?
            .push(Subscriber {
                topic: req.topic,
                subject: req.subject,
                tx,
            });
        drop(state);

        Ok(Box::new(MemorySubscription { rx }))
    }
}

// ============================================================================
// Leadership
// ============================================================================

impl Leadership for InMemoryCatalog {
    fn is_leader(&self) -> bool {
        self.leader.read().map(|l| l.is_leader).unwrap_or(false)
    }

    fn leader_address(&self) -> String {
        self.leader
            .read()
            .map(|l| l.address.clone())
            .unwrap_or_default()
    }
}
