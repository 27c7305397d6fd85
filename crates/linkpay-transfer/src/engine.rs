//! The linked-transfer protocol engine.
//!
//! Composes the ledger, the install coordinator, the collateral manager and
//! the per-channel lock into the three lifecycle operations: create on the
//! sender side, resolve on the receiver side and reclaim back from the
//! sender side. Every channel mutation runs under the lock of the mutated
//! channel's multisig.

use linkpay_channel::{
    with_channel_lock, AppAction, AppDefinition, AppInstance, ChannelEngine, ChannelLock,
    InstallRoute, LinkedTransferAppState, MessageBus, ProposeInstallParams,
};
use linkpay_core::{
    AppInstanceId, AssetId, Channel, FreeBalance, LinkedTransfer, PaymentId, PreImage,
    ProtocolConfig, PublicIdentifier, Redemption, TransferStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::collateral::CollateralManager;
use crate::error::TransferError;
use crate::install::InstallCoordinator;
use crate::ledger::TransferLedger;

/// A sender's request to lock funds behind a hash.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLinkedTransfer {
    pub sender_channel: Channel,
    pub amount: u128,
    pub asset_id: AssetId,
    pub payment_id: PaymentId,
    pub pre_image: PreImage,
    pub meta: Option<serde_json::Value>,
}

/// Result of a successful redemption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTransfer {
    pub app_instance_id: AppInstanceId,
    /// The recipient channel's free balance after the install.
    pub free_balance: FreeBalance,
}

/// Payload published to a designated recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAsyncNotice {
    pub payment_id: PaymentId,
    /// Decimal string; amounts may exceed JSON's safe integer range.
    pub amount: String,
    pub asset_id: AssetId,
    pub encrypted_pre_image: String,
}

pub fn send_async_subject(recipient: &PublicIdentifier) -> String {
    format!("transfer.send-async.{}", recipient)
}

fn lock_key(channel: &Channel) -> String {
    channel.multisig_address.to_hex()
}

fn claim_key(payment_id: &PaymentId) -> String {
    format!("payment.{}", payment_id.to_hex())
}

fn designate(
    mut record: LinkedTransfer,
    designation: Option<(PublicIdentifier, String)>,
) -> Result<LinkedTransfer, TransferError> {
    if let Some((recipient, encrypted_pre_image)) = designation {
        let payment_id = record.payment_id;
        record
            .designate_recipient(recipient, encrypted_pre_image)
            .map_err(|e| TransferError::from_core(payment_id, e))?;
    }
    Ok(record)
}

pub struct PaymentProtocolEngine {
    engine: Arc<dyn ChannelEngine>,
    ledger: Arc<dyn TransferLedger>,
    lock: Arc<dyn ChannelLock>,
    bus: Arc<dyn MessageBus>,
    installer: InstallCoordinator,
    collateral: CollateralManager,
    config: ProtocolConfig,
}

impl PaymentProtocolEngine {
    pub fn new(
        engine: Arc<dyn ChannelEngine>,
        ledger: Arc<dyn TransferLedger>,
        lock: Arc<dyn ChannelLock>,
        bus: Arc<dyn MessageBus>,
        config: ProtocolConfig,
    ) -> Self {
        let installer = InstallCoordinator::new(engine.clone(), config.install_timeout());
        let collateral = CollateralManager::new(
            engine.clone(),
            config.collateral_timeout(),
            config.collateral_profiles.clone(),
        );
        Self {
            engine,
            ledger,
            lock,
            bus,
            installer,
            collateral,
            config,
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn collateral(&self) -> &CollateralManager {
        &self.collateral
    }

    pub fn lock(&self) -> &Arc<dyn ChannelLock> {
        &self.lock
    }

    /// Lock the sender's funds behind `Hash(amount, assetId, paymentId,
    /// preImage)` and record the transfer as `PENDING`.
    ///
    /// No ledger row is written unless the sender-side app installed.
    pub async fn create_linked_transfer(
        &self,
        request: NewLinkedTransfer,
    ) -> Result<LinkedTransfer, TransferError> {
        self.create(request, None).await
    }

    /// Shared create path. A designation is written with the row itself, so
    /// a designated transfer is never visible without its recipient.
    async fn create(
        &self,
        request: NewLinkedTransfer,
        designation: Option<(PublicIdentifier, String)>,
    ) -> Result<LinkedTransfer, TransferError> {
        if request.amount == 0 {
            return Err(TransferError::Validation("amount must be positive".into()));
        }
        if request.pre_image.is_zero() {
            return Err(TransferError::Validation("preimage must be non-zero".into()));
        }
        if self
            .ledger
            .find_by_payment_id(&request.payment_id)
            .await?
            .is_some()
        {
            return Err(TransferError::DuplicatePaymentId(request.payment_id));
        }

        let linked_hash = linkpay_crypto::linked_hash(
            request.amount,
            &request.asset_id,
            &request.payment_id,
            &request.pre_image,
        );
        let channel = request.sender_channel.clone();
        let sender = channel.user_public_identifier.clone();

        let key = lock_key(&channel);
        with_channel_lock(&self.lock, &key, self.config.operation_lease(), move || async move {
            if self
                .ledger
                .find_by_payment_id(&request.payment_id)
                .await?
                .is_some()
            {
                return Err(TransferError::DuplicatePaymentId(request.payment_id));
            }
            let free_balance = self
                .engine
                .get_free_balance(&channel.multisig_address, &request.asset_id)
                .await?;
            let available = free_balance.balance_of(&sender);
            if request.amount > available {
                return Err(TransferError::Validation(format!(
                    "amount {} exceeds sender free balance {}",
                    request.amount, available
                )));
            }

            let router = self.engine.public_identifier().clone();
            let params = ProposeInstallParams {
                app: AppDefinition::SimpleLinkedTransfer,
                route: InstallRoute::Direct {
                    multisig: channel.multisig_address,
                },
                initiator: sender.clone(),
                responder: router.clone(),
                initial_state: LinkedTransferAppState::locked(
                    request.amount,
                    request.asset_id,
                    sender.clone(),
                    router,
                    linked_hash,
                    request.payment_id,
                ),
                initiator_deposit: request.amount,
                responder_deposit: 0,
                asset_id: request.asset_id,
                meta: request.meta.clone(),
            };
            let app_instance_id = self.installer.propose_and_install(params).await?;

            let mut record = LinkedTransfer::pending(
                request.payment_id,
                linked_hash,
                request.amount,
                request.asset_id,
                channel.clone(),
                app_instance_id,
            );
            if let Some(meta) = request.meta.clone() {
                record = record.with_meta(meta);
            }
            let stored = match designate(record, designation) {
                Ok(record) => self.ledger.create(record).await,
                Err(e) => Err(e),
            };
            match stored {
                Ok(created) => {
                    tracing::info!(
                        payment_id = %created.payment_id,
                        %app_instance_id,
                        amount = %created.amount,
                        "linked transfer created"
                    );
                    Ok(created)
                }
                Err(e) => {
                    // The app holds the sender's funds; give them back.
                    tracing::warn!(%app_instance_id, error = %e, "ledger rejected transfer, uninstalling sender app");
                    if let Err(undo) = self.engine.uninstall(&app_instance_id).await {
                        tracing::error!(%app_instance_id, error = %undo, "failed to uninstall orphaned sender app");
                    }
                    Err(e)
                }
            }
        })
        .await
    }

    /// Create a transfer only `recipient` may redeem, and send them the
    /// preimage encrypted to `recipient_key`.
    ///
    /// The recipient is recorded in the same locked section that creates the
    /// row. Only the notification is best effort.
    pub async fn create_linked_transfer_to_recipient(
        &self,
        request: NewLinkedTransfer,
        recipient: PublicIdentifier,
        recipient_key: &[u8; 32],
    ) -> Result<LinkedTransfer, TransferError> {
        let encrypted =
            linkpay_crypto::encrypt_preimage(&request.pre_image, recipient_key)?.to_hex();
        let designated = self
            .create(request, Some((recipient.clone(), encrypted.clone())))
            .await?;

        let notice = SendAsyncNotice {
            payment_id: designated.payment_id,
            amount: designated.amount.to_string(),
            asset_id: designated.asset_id,
            encrypted_pre_image: encrypted,
        };
        let published = match serde_json::to_value(&notice) {
            Ok(payload) => self
                .bus
                .publish(&send_async_subject(&recipient), payload)
                .await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = published {
            tracing::warn!(
                payment_id = %designated.payment_id,
                %recipient,
                error = %e,
                "failed to notify recipient"
            );
        }
        tracing::info!(payment_id = %designated.payment_id, %recipient, "linked transfer designated");
        Ok(designated)
    }

    /// Redeem a pending transfer for `recipient` by proving knowledge of the
    /// preimage, installing a mirrored app in the recipient's channel.
    pub async fn resolve_linked_transfer(
        &self,
        recipient: &PublicIdentifier,
        payment_id: &PaymentId,
        pre_image: &PreImage,
        amount: u128,
        asset_id: &AssetId,
    ) -> Result<ResolvedTransfer, TransferError> {
        let transfer = self
            .ledger
            .find_by_payment_id(payment_id)
            .await?
            .ok_or(TransferError::NotFound(*payment_id))?;
        if transfer.status != TransferStatus::Pending {
            return Err(TransferError::InvalidStateTransition {
                payment_id: *payment_id,
                from: transfer.status,
                to: TransferStatus::Redeemed,
            });
        }
        if !linkpay_crypto::verify_linked_hash(
            &transfer.linked_hash,
            amount,
            asset_id,
            payment_id,
            pre_image,
        ) {
            tracing::warn!(payment_id = %payment_id, "preimage verification failed");
            return Err(TransferError::InvalidPreimage);
        }
        if let Some(designated) = &transfer.recipient_public_identifier {
            if designated != recipient {
                return Err(TransferError::RecipientMismatch {
                    payment_id: *payment_id,
                    recipient: recipient.clone(),
                });
            }
        }
        if self.installed_sender_app(&transfer).await?.is_none() {
            return Err(TransferError::SenderAppNotInstalled(
                transfer.sender_app_instance_id,
            ));
        }

        let channel = self.engine.channel_for_user(recipient).await?;
        let router = self.engine.public_identifier().clone();
        let lease = self.config.operation_lease();

        // Recipients lock different channels, so the payment itself is
        // claimed first: at most one receiver app is ever funded per transfer.
        let claim = claim_key(payment_id);
        with_channel_lock(&self.lock, &claim, lease, move || async move {
            let key = lock_key(&channel);
            with_channel_lock(&self.lock, &key, lease, move || async move {
                let current = self
                    .ledger
                    .find_by_payment_id(payment_id)
                    .await?
                    .ok_or(TransferError::NotFound(*payment_id))?;
                if current.status != TransferStatus::Pending {
                    return Err(TransferError::InvalidStateTransition {
                        payment_id: *payment_id,
                        from: current.status,
                        to: TransferStatus::Redeemed,
                    });
                }

                self.collateral.ensure(&channel, asset_id, amount).await?;

                let initial_state = LinkedTransferAppState::locked(
                    amount,
                    *asset_id,
                    router.clone(),
                    recipient.clone(),
                    transfer.linked_hash,
                    *payment_id,
                )
                .unlocked(*pre_image);
                let params = ProposeInstallParams {
                    app: AppDefinition::SimpleLinkedTransfer,
                    route: InstallRoute::Direct {
                        multisig: channel.multisig_address,
                    },
                    initiator: router.clone(),
                    responder: recipient.clone(),
                    initial_state,
                    initiator_deposit: amount,
                    responder_deposit: 0,
                    asset_id: *asset_id,
                    meta: transfer.meta.clone(),
                };
                let app_instance_id = self.installer.propose_and_install(params).await?;

                let redemption = Redemption {
                    receiver_channel: channel.clone(),
                    receiver_app_instance_id: app_instance_id,
                    pre_image: *pre_image,
                };
                if let Err(e) = self.ledger.mark_redeemed(payment_id, redemption).await {
                    tracing::error!(
                        payment_id = %payment_id,
                        %app_instance_id,
                        error = %e,
                        "receiver app installed but redemption was not recorded"
                    );
                    return Err(e);
                }

                let free_balance = self
                    .engine
                    .get_free_balance(&channel.multisig_address, asset_id)
                    .await?;
                tracing::info!(payment_id = %payment_id, %app_instance_id, %recipient, "linked transfer resolved");
                Ok(ResolvedTransfer {
                    app_instance_id,
                    free_balance,
                })
            })
            .await
        })
        .await
    }

    /// Unlock the router's outlay from the sender-side app of a redeemed
    /// transfer and uninstall it.
    pub async fn reclaim(&self, payment_id: &PaymentId) -> Result<LinkedTransfer, TransferError> {
        let transfer = self
            .ledger
            .find_by_payment_id(payment_id)
            .await?
            .ok_or(TransferError::NotFound(*payment_id))?;
        if transfer.status != TransferStatus::Redeemed {
            return Err(TransferError::InvalidStateTransition {
                payment_id: *payment_id,
                from: transfer.status,
                to: TransferStatus::Reclaimed,
            });
        }
        let key = lock_key(&transfer.sender_channel);
        with_channel_lock(&self.lock, &key, self.config.operation_lease(), move || async move {
            let current = self
                .ledger
                .find_by_payment_id(payment_id)
                .await?
                .ok_or(TransferError::NotFound(*payment_id))?;
            if current.status != TransferStatus::Redeemed {
                return Err(TransferError::InvalidStateTransition {
                    payment_id: *payment_id,
                    from: current.status,
                    to: TransferStatus::Reclaimed,
                });
            }
            let pre_image = current.pre_image.ok_or_else(|| {
                TransferError::Validation(format!("no preimage recorded for {}", payment_id))
            })?;
            let app_instance_id = current.sender_app_instance_id;

            // A previous attempt may have stopped between steps.
            match self.installed_sender_app(&current).await? {
                Some(app) => {
                    if !app.latest_state.is_unlocked() {
                        self.engine
                            .take_action(&app_instance_id, AppAction { pre_image })
                            .await?;
                    }
                    self.engine.uninstall(&app_instance_id).await?;
                }
                None => {
                    tracing::warn!(%app_instance_id, "sender app already uninstalled");
                }
            }

            let reclaimed = self.ledger.mark_reclaimed(payment_id).await?;
            tracing::info!(payment_id = %payment_id, %app_instance_id, "linked transfer reclaimed");
            Ok(reclaimed)
        })
        .await
    }

    /// Mark a pending transfer `FAILED` once its sender-side app is gone.
    pub async fn fail_orphaned_transfer(
        &self,
        payment_id: &PaymentId,
    ) -> Result<LinkedTransfer, TransferError> {
        let transfer = self
            .ledger
            .find_by_payment_id(payment_id)
            .await?
            .ok_or(TransferError::NotFound(*payment_id))?;
        let key = lock_key(&transfer.sender_channel);
        with_channel_lock(&self.lock, &key, self.config.operation_lease(), move || async move {
            let current = self
                .ledger
                .find_by_payment_id(payment_id)
                .await?
                .ok_or(TransferError::NotFound(*payment_id))?;
            if current.status != TransferStatus::Pending
                || self.installed_sender_app(&current).await?.is_some()
            {
                return Err(TransferError::InvalidStateTransition {
                    payment_id: *payment_id,
                    from: current.status,
                    to: TransferStatus::Failed,
                });
            }
            self.ledger.mark_failed(payment_id).await
        })
        .await
    }

    pub async fn find_by_payment_id(
        &self,
        payment_id: &PaymentId,
    ) -> Result<Option<LinkedTransfer>, TransferError> {
        self.ledger.find_by_payment_id(payment_id).await
    }

    pub async fn find_pending_for_recipient(
        &self,
        recipient: &PublicIdentifier,
    ) -> Result<Vec<LinkedTransfer>, TransferError> {
        self.ledger.find_pending_for_recipient(recipient).await
    }

    pub async fn find_reclaimable(
        &self,
        channel: &Channel,
    ) -> Result<Vec<LinkedTransfer>, TransferError> {
        self.ledger.find_reclaimable(channel).await
    }

    /// Transfer history of a user with a channel: everything they sent or
    /// received.
    pub async fn find_by_public_identifier(
        &self,
        public_identifier: &PublicIdentifier,
    ) -> Result<Vec<LinkedTransfer>, TransferError> {
        self.engine.channel_for_user(public_identifier).await?;
        self.ledger.find_by_public_identifier(public_identifier).await
    }

    /// The installed sender-side app carrying this transfer's hash lock.
    async fn installed_sender_app(
        &self,
        transfer: &LinkedTransfer,
    ) -> Result<Option<AppInstance>, TransferError> {
        Ok(self
            .engine
            .get_app_instances()
            .await?
            .into_iter()
            .find(|app| {
                app.identity_hash == transfer.sender_app_instance_id
                    && app.latest_state.linked_hash == transfer.linked_hash
            }))
    }
}
