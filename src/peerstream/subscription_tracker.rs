//! Per-stream record of which resource types the peer subscribed to.
//!
//! Watchers that only make sense once a resource type is subscribed block
//! on [`ResourceSubscriptionTracker::wait_subscribed`] instead of polling.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::resource::ResourceKind;

#[derive(Default)]
pub struct ResourceSubscriptionTracker {
    inner: Mutex<HashMap<ResourceKind, watch::Sender<bool>>>,
}

impl ResourceSubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceKind, watch::Sender<bool>>> {
        // The map holds no invariant a panicking holder could break.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Marks `kind` subscribed and wakes its waiters. Returns true only the
    /// first time.
    pub fn subscribe(&self, kind: ResourceKind) -> bool {
        let mut subs = self.lock();
        let tx = subs.entry(kind).or_insert_with(|| watch::channel(false).0);
        let first = !*tx.borrow();
        tx.send_replace(true);
        first
    }

    pub fn is_subscribed(&self, kind: ResourceKind) -> bool {
        self.lock().get(&kind).is_some_and(|tx| *tx.borrow())
    }

    /// Receiver that observes `true` once `kind` is subscribed. May be taken
    /// before or after the subscription happens.
    pub fn subscribed_chan(&self, kind: ResourceKind) -> watch::Receiver<bool> {
        self.lock()
            .entry(kind)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Resolves once `kind` is subscribed. Returns false if `cancel` fired
    /// first.
    pub async fn wait_subscribed(&self, kind: ResourceKind, cancel: &CancellationToken) -> bool {
        let mut rx = self.subscribed_chan(kind);
        tokio::select! {
            _ = cancel.cancelled() => false,
            res = rx.wait_for(|subscribed| *subscribed) => res.is_ok(),
        }
    }
}
