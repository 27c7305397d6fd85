use dashmap::DashMap;
use linkpay_core::{Channel, MultisigAddress};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::PaymentProtocolEngine;

/// Outcome of one sweep over the watched channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub reclaimed: usize,
    pub failed: usize,
}

/// Periodically reclaims redeemed transfers on a set of sender channels.
///
/// Failures are logged and picked up again on the next tick.
pub struct ReclaimWorker {
    protocol: Arc<PaymentProtocolEngine>,
    channels: DashMap<MultisigAddress, Channel>,
    interval: Duration,
}

impl ReclaimWorker {
    pub fn new(protocol: Arc<PaymentProtocolEngine>, interval: Duration) -> Self {
        Self {
            protocol,
            channels: DashMap::new(),
            interval,
        }
    }

    pub fn watch_channel(&self, channel: Channel) {
        self.channels.insert(channel.multisig_address, channel);
    }

    pub fn unwatch_channel(&self, multisig: &MultisigAddress) {
        self.channels.remove(multisig);
    }

    pub async fn sweep(&self) -> ReclaimReport {
        let channels: Vec<Channel> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut report = ReclaimReport::default();
        for channel in channels {
            let reclaimable = match self.protocol.find_reclaimable(&channel).await {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(multisig = %channel.multisig_address, error = %e, "reclaimable lookup failed");
                    continue;
                }
            };
            for transfer in reclaimable {
                match self.protocol.reclaim(&transfer.payment_id).await {
                    Ok(_) => report.reclaimed += 1,
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(payment_id = %transfer.payment_id, error = %e, "reclaim failed, will retry");
                    }
                }
            }
        }
        if report.reclaimed > 0 || report.failed > 0 {
            tracing::info!(reclaimed = report.reclaimed, failed = report.failed, "reclaim sweep finished");
        }
        report
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "reclaim worker started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("reclaim worker stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
