//! Materialized view of one service's health, fed by service health events.

use std::collections::BTreeMap;

use crate::events::{HealthOp, Payload};
use crate::proto::CheckServiceNode;
use crate::structs::namespace_or_default;

/// Key of an instance: node, namespace and service ID.
type InstanceKey = (String, String, String);

fn instance_key(csn: &CheckServiceNode) -> Option<InstanceKey> {
    let node = csn.node.as_ref()?;
    let service = csn.service.as_ref()?;
    Some((
        node.node.clone(),
        namespace_or_default(&service.namespace).to_string(),
        service.id.clone(),
    ))
}

/// Current instances of a service.
///
/// Snapshot events are buffered until the snapshot completes, so the view
/// never reports a partially loaded service.
#[derive(Debug, Default)]
pub struct ServiceHealthView {
    instances: BTreeMap<InstanceKey, CheckServiceNode>,
    ready: bool,
}

impl ServiceHealthView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discards every instance and waits for a new snapshot.
    pub fn reset(&mut self) {
        self.instances.clear();
        self.ready = false;
    }

    /// Marks the view as live without waiting for a snapshot. Used when a
    /// subscription resumes from a known index.
    pub fn resume(&mut self) {
        self.ready = true;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Applies one event. Returns true when the view is ready and the
    /// caller should publish a new result.
    pub fn apply(&mut self, payload: &Payload) -> bool {
        match payload {
            Payload::NewSnapshotToFollow => {
                self.reset();
                false
            }
            Payload::EndOfSnapshot => {
                self.ready = true;
                true
            }
            Payload::ServiceHealth { op, instance } => {
                let Some(key) = instance_key(instance) else {
                    return false;
                };
                match op {
                    HealthOp::Register => {
                        self.instances.insert(key, instance.clone());
                    }
                    HealthOp::Deregister => {
                        self.instances.remove(&key);
                    }
                }
                self.ready
            }
            Payload::CaRoots(_) | Payload::ReadyServers(_) => false,
        }
    }

    /// Instances sorted by node, namespace and service ID.
    pub fn result(&self) -> Vec<CheckServiceNode> {
        self.instances.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Node, NodeService};

    fn instance(node: &str, id: &str) -> CheckServiceNode {
        CheckServiceNode {
            node: Some(Node {
                node: node.to_string(),
                ..Default::default()
            }),
            service: Some(NodeService {
                id: id.to_string(),
                service: "web".to_string(),
                ..Default::default()
            }),
            checks: vec![],
        }
    }

    fn register(node: &str, id: &str) -> Payload {
        Payload::ServiceHealth {
            op: HealthOp::Register,
            instance: instance(node, id),
        }
    }

    #[test]
    fn test_snapshot_is_published_only_when_complete() {
        let mut view = ServiceHealthView::new();
        assert!(!view.apply(&register("node-2", "web-2")));
        assert!(!view.apply(&register("node-1", "web-1")));
        assert!(view.apply(&Payload::EndOfSnapshot));

        let result = view.result();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].node.as_ref().unwrap().node, "node-1");
    }

    #[test]
    fn test_live_updates_register_and_deregister() {
        let mut view = ServiceHealthView::new();
        view.apply(&Payload::EndOfSnapshot);

        assert!(view.apply(&register("node-1", "web-1")));
        assert_eq!(view.result().len(), 1);

        assert!(view.apply(&Payload::ServiceHealth {
            op: HealthOp::Deregister,
            instance: instance("node-1", "web-1"),
        }));
        assert!(view.result().is_empty());
    }

    #[test]
    fn test_register_replaces_existing_instance() {
        let mut view = ServiceHealthView::new();
        view.apply(&Payload::EndOfSnapshot);
        view.apply(&register("node-1", "web-1"));

        let mut updated = instance("node-1", "web-1");
        updated.service.as_mut().unwrap().port = 9090;
        view.apply(&Payload::ServiceHealth {
            op: HealthOp::Register,
            instance: updated,
        });

        let result = view.result();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].service.as_ref().unwrap().port, 9090);
    }

    #[test]
    fn test_new_snapshot_discards_state() {
        let mut view = ServiceHealthView::new();
        view.apply(&register("node-1", "web-1"));
        view.apply(&Payload::EndOfSnapshot);

        assert!(!view.apply(&Payload::NewSnapshotToFollow));
        assert!(!view.is_ready());
        assert!(view.result().is_empty());
    }
}
