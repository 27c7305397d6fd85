//! In-process message bus with dotted subjects.
//!
//! Subjects are dot-separated tokens. In patterns `*` matches exactly one
//! token and `>` matches one or more trailing tokens.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::traits::{MessageBus, RequestHandler};

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub subject: String,
    pub payload: serde_json::Value,
}

/// Receiving side of a bus subscription. Dropping it unsubscribes.
pub struct BusSubscription {
    rx: mpsc::UnboundedReceiver<BusMessage>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl BusSubscription {
    pub fn new(
        rx: mpsc::UnboundedReceiver<BusMessage>,
        on_drop: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

/// Whether `subject` matches `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct BusInner {
    subscribers: DashMap<u64, Subscriber>,
    handlers: DashMap<u64, (String, RequestHandler)>,
    next_id: AtomicU64,
}

/// Message bus shared by all nodes in one process.
#[derive(Clone, Default)]
pub struct InMemoryMessageBus {
    inner: Arc<BusInner>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    fn handler_for(&self, subject: &str) -> Option<RequestHandler> {
        let mut matching: Vec<(u64, RequestHandler)> = self
            .inner
            .handlers
            .iter()
            .filter(|entry| subject_matches(&entry.value().0, subject))
            .map(|entry| (*entry.key(), entry.value().1.clone()))
            .collect();
        matching.sort_by_key(|(id, _)| *id);
        matching.into_iter().next().map(|(_, handler)| handler)
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(
        &self,
        subject: &str,
        payload: serde_json::Value,
    ) -> Result<(), ChannelError> {
        let mut delivered = 0usize;
        let mut closed = Vec::new();
        for entry in self.inner.subscribers.iter() {
            if !subject_matches(&entry.value().pattern, subject) {
                continue;
            }
            let message = BusMessage {
                subject: subject.to_string(),
                payload: payload.clone(),
            };
            if entry.value().tx.send(message).is_ok() {
                delivered += 1;
            } else {
                closed.push(*entry.key());
            }
        }
        for id in closed {
            self.inner.subscribers.remove(&id);
        }
        tracing::debug!(subject, delivered, "bus publish");
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription, ChannelError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.insert(
            id,
            Subscriber {
                pattern: subject.to_string(),
                tx,
            },
        );
        let weak = Arc::downgrade(&self.inner);
        Ok(BusSubscription::new(rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner.subscribers.remove(&id);
            }
        }))
    }

    async fn request(
        &self,
        subject: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ChannelError> {
        let handler = self
            .handler_for(subject)
            .ok_or_else(|| ChannelError::NoResponders(subject.to_string()))?;

        tracing::debug!(subject, "bus request");
        match tokio::time::timeout(timeout, handler(subject.to_string(), payload)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(message)) => Err(ChannelError::Remote(message)),
            Err(_) => Err(ChannelError::Timeout(format!(
                "{} after {}ms",
                subject,
                timeout.as_millis()
            ))),
        }
    }

    async fn serve(&self, pattern: &str, handler: RequestHandler) -> Result<(), ChannelError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .insert(id, (pattern.to_string(), handler));
        tracing::info!(pattern, "serving bus subject");
        Ok(())
    }
}
