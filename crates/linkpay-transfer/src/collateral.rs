use linkpay_channel::{ChannelEngine, EngineEvent, EventKind};
use linkpay_core::{AssetId, Channel, CollateralProfile};
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransferError;

/// Keeps enough router liquidity in users' channels.
///
/// Balances are always read through from the engine, never cached across an
/// await.
pub struct CollateralManager {
    engine: Arc<dyn ChannelEngine>,
    timeout: Duration,
    profiles: Vec<CollateralProfile>,
}

impl CollateralManager {
    pub fn new(
        engine: Arc<dyn ChannelEngine>,
        timeout: Duration,
        profiles: Vec<CollateralProfile>,
    ) -> Self {
        Self {
            engine,
            timeout,
            profiles,
        }
    }

    fn profile(&self, asset_id: &AssetId) -> Option<&CollateralProfile> {
        self.profiles.iter().find(|p| p.asset_id == *asset_id)
    }

    /// Router share of the free balance of `asset_id` in `channel`.
    pub async fn router_balance(
        &self,
        channel: &Channel,
        asset_id: &AssetId,
    ) -> Result<u128, TransferError> {
        let free_balance = self
            .engine
            .get_free_balance(&channel.multisig_address, asset_id)
            .await?;
        Ok(free_balance.balance_of(self.engine.public_identifier()))
    }

    /// Make sure the router can pay `required` out of `channel`.
    ///
    /// Returns at once without side effects when the balance already covers
    /// it. Otherwise requests a top-up and waits for a deposit confirmation
    /// from the router on this channel's multisig, failing with
    /// [`TransferError::InsufficientCollateral`] when the wait runs out.
    pub async fn ensure(
        &self,
        channel: &Channel,
        asset_id: &AssetId,
        required: u128,
    ) -> Result<(), TransferError> {
        let multisig = channel.multisig_address;
        let mut available = self.router_balance(channel, asset_id).await?;
        if available >= required {
            tracing::debug!(%multisig, available, required, "collateral sufficient");
            return Ok(());
        }

        let router = self.engine.public_identifier().clone();
        let mut deposits = self.engine.events().subscribe(EventKind::DepositConfirmed);

        let target = match self.profile(asset_id) {
            Some(profile) => required.max(u128::from(profile.amount_to_collateralize)),
            None => required,
        };
        let top_up = target - available;
        tracing::info!(%multisig, available, required, top_up, "requesting collateral");
        self.engine
            .request_collateral(channel, asset_id, top_up)
            .await?;

        let wait = async {
            while let Some(event) = deposits.recv().await {
                match event {
                    EngineEvent::DepositConfirmed {
                        multisig: confirmed,
                        from,
                        ..
                    } if confirmed == multisig && from == router => {
                        available = self.router_balance(channel, asset_id).await?;
                        if available >= required {
                            return Ok(true);
                        }
                        tracing::debug!(%multisig, available, required, "deposit landed, still short");
                    }
                    other => tracing::debug!(?other, "ignoring unrelated deposit"),
                }
            }
            Ok::<bool, TransferError>(false)
        };
        let outcome = tokio::time::timeout(self.timeout, wait).await;
        drop(deposits);

        match outcome {
            Ok(Ok(true)) => {
                tracing::info!(%multisig, available, "channel collateralized");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(false)) | Err(_) => {
                tracing::warn!(%multisig, available, required, "collateral wait expired");
                Err(TransferError::InsufficientCollateral {
                    multisig,
                    available,
                    required,
                })
            }
        }
    }

    /// Whether the router share of `asset_id` in `channel` is below the
    /// profile's maintained minimum. Always false without a profile.
    pub async fn needs_top_up(
        &self,
        channel: &Channel,
        asset_id: &AssetId,
    ) -> Result<bool, TransferError> {
        let Some(profile) = self.profile(asset_id) else {
            return Ok(false);
        };
        let balance = self.router_balance(channel, asset_id).await?;
        Ok(balance < u128::from(profile.minimum_maintained_collateral))
    }
}
