//! Test harness wiring a router with in-memory channel engine, ledger, lock
//! and message bus.

use linkpay_channel::{ChannelLock, InMemoryChannelEngine, InMemoryChannelLock, InMemoryMessageBus};
use linkpay_core::{AssetId, Channel, MultisigAddress, ProtocolConfig, PublicIdentifier};
use linkpay_transfer::{InMemoryTransferLedger, PaymentProtocolEngine, TransferMessaging};
use std::sync::Arc;

pub const ROUTER: &str = "xpubRouter";

pub fn id(s: &str) -> PublicIdentifier {
    PublicIdentifier::parse(s).expect("valid identifier")
}

pub struct Router {
    pub engine: InMemoryChannelEngine,
    pub bus: InMemoryMessageBus,
    pub lock: Arc<dyn ChannelLock>,
    pub protocol: Arc<PaymentProtocolEngine>,
}

impl Router {
    pub fn new(config: ProtocolConfig) -> Self {
        let engine = InMemoryChannelEngine::new(id(ROUTER));
        let bus = InMemoryMessageBus::new();
        let lock: Arc<dyn ChannelLock> =
            Arc::new(InMemoryChannelLock::new(config.lock_acquire_timeout()));
        let protocol = Arc::new(PaymentProtocolEngine::new(
            Arc::new(engine.clone()),
            Arc::new(InMemoryTransferLedger::new()),
            lock.clone(),
            Arc::new(bus.clone()),
            config,
        ));
        Self {
            engine,
            bus,
            lock,
            protocol,
        }
    }

    /// Open a channel for `user` and fund the user's side with `balance`.
    pub fn open_funded(&self, tag: u8, user: &str, balance: u128) -> Channel {
        let channel = self.engine.open_channel(MultisigAddress([tag; 20]), id(user));
        if balance > 0 {
            self.engine
                .deposit(&channel.multisig_address, &id(user), &AssetId::NATIVE, balance)
                .expect("deposit into open channel");
        }
        channel
    }

    pub async fn serve(&self) -> anyhow::Result<()> {
        TransferMessaging::new(
            self.protocol.clone(),
            self.lock.clone(),
            Arc::new(self.bus.clone()),
        )
        .register()
        .await?;
        Ok(())
    }
}
