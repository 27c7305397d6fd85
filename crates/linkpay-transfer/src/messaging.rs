//! Request/response handlers exposing the protocol engine and channel locks
//! to clients over the message bus.
//!
//! | Subject | Payload | Reply |
//! |---|---|---|
//! | `transfer.resolve-linked.{publicIdentifier}` | `{ paymentId, preImage, amount, assetId }` | `{ appInstanceId, freeBalance }` |
//! | `transfer.get-pending.{publicIdentifier}` | none | pending transfers designated to the caller |
//! | `lock.acquire.{multisig}` | `{ lockTTL }` | lock token |
//! | `lock.release.{multisig}` | `{ lockValue }` | `true` |

use futures::FutureExt;
use linkpay_channel::{ChannelError, ChannelLock, LockToken, MessageBus, RequestHandler};
use linkpay_core::{AssetId, MultisigAddress, PaymentId, PreImage, PublicIdentifier};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::PaymentProtocolEngine;

pub const RESOLVE_LINKED_PREFIX: &str = "transfer.resolve-linked";
pub const GET_PENDING_PREFIX: &str = "transfer.get-pending";
pub const LOCK_ACQUIRE_PREFIX: &str = "lock.acquire";
pub const LOCK_RELEASE_PREFIX: &str = "lock.release";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveLinkedRequest {
    pub payment_id: PaymentId,
    pub pre_image: PreImage,
    /// Decimal string.
    pub amount: String,
    pub asset_id: AssetId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockAcquireRequest {
    #[serde(rename = "lockTTL")]
    pub lock_ttl: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockReleaseRequest {
    #[serde(rename = "lockValue")]
    pub lock_value: String,
}

/// Concrete subject for a request addressed to `scope`.
pub fn subject(prefix: &str, scope: &str) -> String {
    format!("{}.{}", prefix, scope)
}

/// The token after `prefix.` in `subject`.
fn scope_of<'a>(prefix: &str, subject: &'a str) -> Result<&'a str, String> {
    subject
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|scope| !scope.is_empty())
        .ok_or_else(|| format!("subject {} has no scope", subject))
}

fn decode<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, String> {
    serde_json::from_value(payload).map_err(|e| format!("invalid payload: {}", e))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("failed to encode reply: {}", e))
}

/// Registers the transfer and lock handlers on a bus.
pub struct TransferMessaging {
    protocol: Arc<PaymentProtocolEngine>,
    lock: Arc<dyn ChannelLock>,
    bus: Arc<dyn MessageBus>,
}

impl TransferMessaging {
    pub fn new(
        protocol: Arc<PaymentProtocolEngine>,
        lock: Arc<dyn ChannelLock>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            protocol,
            lock,
            bus,
        }
    }

    pub async fn register(&self) -> Result<(), ChannelError> {
        self.bus
            .serve(&subject(RESOLVE_LINKED_PREFIX, ">"), self.resolve_linked_handler())
            .await?;
        self.bus
            .serve(&subject(GET_PENDING_PREFIX, ">"), self.get_pending_handler())
            .await?;
        self.bus
            .serve(&subject(LOCK_ACQUIRE_PREFIX, ">"), self.lock_acquire_handler())
            .await?;
        self.bus
            .serve(&subject(LOCK_RELEASE_PREFIX, ">"), self.lock_release_handler())
            .await?;
        tracing::info!("transfer messaging registered");
        Ok(())
    }

    fn resolve_linked_handler(&self) -> RequestHandler {
        let protocol = self.protocol.clone();
        Arc::new(move |subject: String, payload: Value| {
            let protocol = protocol.clone();
            async move {
                let recipient = PublicIdentifier::parse(scope_of(RESOLVE_LINKED_PREFIX, &subject)?)
                    .map_err(|e| e.to_string())?;
                let request: ResolveLinkedRequest = decode(payload)?;
                let amount: u128 = request
                    .amount
                    .parse()
                    .map_err(|e| format!("invalid amount {}: {}", request.amount, e))?;

                tracing::debug!(%recipient, payment_id = %request.payment_id, "resolve-linked request");
                let resolved = protocol
                    .resolve_linked_transfer(
                        &recipient,
                        &request.payment_id,
                        &request.pre_image,
                        amount,
                        &request.asset_id,
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                encode(&resolved)
            }
            .boxed()
        })
    }

    fn get_pending_handler(&self) -> RequestHandler {
        let protocol = self.protocol.clone();
        Arc::new(move |subject: String, _payload: Value| {
            let protocol = protocol.clone();
            async move {
                let recipient = PublicIdentifier::parse(scope_of(GET_PENDING_PREFIX, &subject)?)
                    .map_err(|e| e.to_string())?;
                let pending = protocol
                    .find_pending_for_recipient(&recipient)
                    .await
                    .map_err(|e| e.to_string())?;
                encode(&pending)
            }
            .boxed()
        })
    }

    fn lock_acquire_handler(&self) -> RequestHandler {
        let lock = self.lock.clone();
        Arc::new(move |subject: String, payload: Value| {
            let lock = lock.clone();
            async move {
                let multisig = MultisigAddress::parse(scope_of(LOCK_ACQUIRE_PREFIX, &subject)?)
                    .map_err(|e| e.to_string())?;
                let request: LockAcquireRequest = decode(payload)?;
                let token = lock
                    .acquire(&multisig.to_hex(), Duration::from_millis(request.lock_ttl))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Value::String(token.to_string()))
            }
            .boxed()
        })
    }

    fn lock_release_handler(&self) -> RequestHandler {
        let lock = self.lock.clone();
        Arc::new(move |subject: String, payload: Value| {
            let lock = lock.clone();
            async move {
                let multisig = MultisigAddress::parse(scope_of(LOCK_RELEASE_PREFIX, &subject)?)
                    .map_err(|e| e.to_string())?;
                let request: LockReleaseRequest = decode(payload)?;
                lock.release(&multisig.to_hex(), &LockToken::from_value(request.lock_value))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Value::Bool(true))
            }
            .boxed()
        })
    }
}
