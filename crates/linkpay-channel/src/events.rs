//! Engine events and the multiplexed hub that delivers them.
//!
//! Many protocol runs share one hub, so every handler must filter on the
//! correlation id carried by the event (`app_instance_id`, `multisig`).
//! Subscriptions are handles: dropping one deregisters its listener.

use dashmap::DashMap;
use linkpay_core::{AppInstanceId, AssetId, MultisigAddress, PublicIdentifier};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Events emitted by a channel engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The counterparty installed a proposed app.
    Install { app_instance_id: AppInstanceId },

    /// The counterparty rejected a proposed app.
    RejectInstall {
        app_instance_id: AppInstanceId,
        reason: String,
    },

    /// A deposit into `multisig` by `from` was confirmed.
    DepositConfirmed {
        multisig: MultisigAddress,
        from: PublicIdentifier,
        asset_id: AssetId,
    },
}

/// Discriminant used to register interest in one kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Install,
    RejectInstall,
    DepositConfirmed,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Install { .. } => EventKind::Install,
            Self::RejectInstall { .. } => EventKind::RejectInstall,
            Self::DepositConfirmed { .. } => EventKind::DepositConfirmed,
        }
    }
}

struct Listener {
    kind: EventKind,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

#[derive(Default)]
struct HubInner {
    listeners: DashMap<u64, Listener>,
    next_id: AtomicU64,
}

/// Fan-out of engine events to registered listeners.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one kind of event.
    pub fn subscribe(&self, kind: EventKind) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.insert(id, Listener { kind, tx });
        tracing::trace!(listener_id = id, ?kind, "listener registered");
        Subscription {
            id,
            kind,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every listener of its kind. Returns the number of
    /// listeners it reached.
    pub fn emit(&self, event: EngineEvent) -> usize {
        let kind = event.kind();
        let targets: Vec<(u64, mpsc::UnboundedSender<EngineEvent>)> = self
            .inner
            .listeners
            .iter()
            .filter(|entry| entry.value().kind == kind)
            .map(|entry| (*entry.key(), entry.value().tx.clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in targets {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                self.inner.listeners.remove(&id);
            }
        }
        tracing::trace!(?kind, delivered, "engine event emitted");
        delivered
    }

    /// Number of currently registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Number of registered listeners for one kind.
    pub fn listener_count_for(&self, kind: EventKind) -> usize {
        self.inner
            .listeners
            .iter()
            .filter(|entry| entry.value().kind == kind)
            .count()
    }
}

/// A registered listener. Deregistered when dropped.
pub struct Subscription {
    id: u64,
    kind: EventKind,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Wait for the next event of this subscription's kind.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    /// Deregister explicitly. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.listeners.remove(&self.id);
            tracing::trace!(listener_id = self.id, kind = ?self.kind, "listener removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install(byte: u8) -> EngineEvent {
        EngineEvent::Install {
            app_instance_id: AppInstanceId([byte; 32]),
        }
    }

    #[tokio::test]
    async fn test_emit_reaches_matching_kind_only() {
        let hub = EventHub::new();
        let mut installs = hub.subscribe(EventKind::Install);
        let _rejects = hub.subscribe(EventKind::RejectInstall);

        assert_eq!(hub.emit(install(1)), 1);
        assert_eq!(installs.recv().await, Some(install(1)));
    }

    #[tokio::test]
    async fn test_multiple_listeners_all_receive() {
        let hub = EventHub::new();
        let mut a = hub.subscribe(EventKind::Install);
        let mut b = hub.subscribe(EventKind::Install);

        assert_eq!(hub.emit(install(2)), 2);
        assert_eq!(a.recv().await, Some(install(2)));
        assert_eq!(b.recv().await, Some(install(2)));
    }

    #[test]
    fn test_drop_deregisters() {
        let hub = EventHub::new();
        let sub = hub.subscribe(EventKind::DepositConfirmed);
        assert_eq!(hub.listener_count(), 1);
        drop(sub);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let hub = EventHub::new();
        let sub = hub.subscribe(EventKind::Install);
        let _other = hub.subscribe(EventKind::RejectInstall);
        sub.unsubscribe();
        assert_eq!(hub.listener_count_for(EventKind::Install), 0);
        assert_eq!(hub.listener_count_for(EventKind::RejectInstall), 1);
    }

    #[test]
    fn test_emit_without_listeners() {
        let hub = EventHub::new();
        assert_eq!(hub.emit(install(3)), 0);
    }

    #[test]
    fn test_subscription_outliving_hub() {
        let hub = EventHub::new();
        let sub = hub.subscribe(EventKind::Install);
        drop(hub);
        drop(sub);
    }
}
