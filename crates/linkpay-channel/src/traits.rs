use async_trait::async_trait;
use futures::future::BoxFuture;
use linkpay_core::{AppInstanceId, AssetId, Channel, FreeBalance, MultisigAddress, PublicIdentifier};
use std::sync::Arc;
use std::time::Duration;

use crate::bus::BusSubscription;
use crate::error::ChannelError;
use crate::events::EventHub;
use crate::types::{AppAction, AppInstance, LinkedTransferAppState, ProposeInstallParams};

/// Channel engine interface.
///
/// Bridges the transfer protocol to a state-channel implementation that
/// proposes, installs and drives app instances inside multisig channels.
/// Completion of proposals and deposits is reported through [`EventHub`].
#[async_trait]
pub trait ChannelEngine: Send + Sync {
    /// Identifier of the node this engine acts for.
    fn public_identifier(&self) -> &PublicIdentifier;

    /// Hub on which install, reject and deposit events are emitted.
    fn events(&self) -> &EventHub;

    /// The channel between this node and `user`.
    async fn channel_for_user(&self, user: &PublicIdentifier) -> Result<Channel, ChannelError>;

    /// Propose installing an app. Returns the id the app will carry; the
    /// outcome arrives later as an `Install` or `RejectInstall` event.
    async fn propose_install(
        &self,
        params: ProposeInstallParams,
    ) -> Result<AppInstanceId, ChannelError>;

    /// Install an app proposed to this node.
    async fn install(&self, app_instance_id: &AppInstanceId) -> Result<(), ChannelError>;

    /// Uninstall an app, paying out its latest coin transfers.
    async fn uninstall(&self, app_instance_id: &AppInstanceId) -> Result<(), ChannelError>;

    /// Apply an action to an installed app and return the new state.
    async fn take_action(
        &self,
        app_instance_id: &AppInstanceId,
        action: AppAction,
    ) -> Result<LinkedTransferAppState, ChannelError>;

    /// All app instances currently installed on channels of this node.
    async fn get_app_instances(&self) -> Result<Vec<AppInstance>, ChannelError>;

    /// Free balance of `asset_id` in the channel at `multisig`.
    async fn get_free_balance(
        &self,
        multisig: &MultisigAddress,
        asset_id: &AssetId,
    ) -> Result<FreeBalance, ChannelError>;

    /// Request an on-chain deposit of `amount` into `channel`. Returns once
    /// the request is accepted; confirmation is a `DepositConfirmed` event.
    async fn request_collateral(
        &self,
        channel: &Channel,
        asset_id: &AssetId,
        amount: u128,
    ) -> Result<(), ChannelError>;
}

/// Handler invoked for requests on a served subject pattern. Receives the
/// concrete subject and the payload; an `Err` is returned to the requester.
pub type RequestHandler = Arc<
    dyn Fn(String, serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, String>>
        + Send
        + Sync,
>;

/// Subject-addressed messaging between nodes.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: serde_json::Value)
        -> Result<(), ChannelError>;

    /// Receive every publish matching `subject` until the handle is dropped.
    async fn subscribe(&self, subject: &str) -> Result<BusSubscription, ChannelError>;

    /// Request/reply with a deadline.
    async fn request(
        &self,
        subject: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ChannelError>;

    /// Answer requests whose subject matches `pattern`.
    async fn serve(&self, pattern: &str, handler: RequestHandler) -> Result<(), ChannelError>;
}
