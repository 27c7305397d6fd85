use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::state_machine::{TransferEvent, TransferStateMachine, TransferStatus};
use crate::types::{AppInstanceId, AssetId, Channel, LinkedHash, PaymentId, PreImage, PublicIdentifier};

/// A hash-locked conditional payment routed through the router.
///
/// Rows are never deleted; the status only moves forward through
/// [`TransferStateMachine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedTransfer {
    pub payment_id: PaymentId,
    pub linked_hash: LinkedHash,
    pub amount: u128,
    pub asset_id: AssetId,
    pub sender_channel: Channel,
    pub sender_app_instance_id: AppInstanceId,
    pub receiver_channel: Option<Channel>,
    pub receiver_app_instance_id: Option<AppInstanceId>,
    pub recipient_public_identifier: Option<PublicIdentifier>,
    /// Stored only once the recipient has revealed it.
    pub pre_image: Option<PreImage>,
    /// Preimage encrypted to a designated recipient, hex encoded.
    pub encrypted_pre_image: Option<String>,
    pub status: TransferStatus,
    pub meta: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything recorded when a transfer moves to `REDEEMED`.
#[derive(Debug, Clone, PartialEq)]
pub struct Redemption {
    pub receiver_channel: Channel,
    pub receiver_app_instance_id: AppInstanceId,
    pub pre_image: PreImage,
}

impl LinkedTransfer {
    /// Build a fresh `PENDING` record for an installed sender-side app.
    pub fn pending(
        payment_id: PaymentId,
        linked_hash: LinkedHash,
        amount: u128,
        asset_id: AssetId,
        sender_channel: Channel,
        sender_app_instance_id: AppInstanceId,
    ) -> Self {
        let now = Utc::now();
        Self {
            payment_id,
            linked_hash,
            amount,
            asset_id,
            sender_channel,
            sender_app_instance_id,
            receiver_channel: None,
            receiver_app_instance_id: None,
            recipient_public_identifier: None,
            pre_image: None,
            encrypted_pre_image: None,
            status: TransferStatus::Pending,
            meta: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Apply `PENDING → REDEEMED`, recording the receiver side exactly once.
    pub fn redeem(&mut self, redemption: Redemption) -> Result<(), CoreError> {
        let next = TransferStateMachine::transition(self.status, TransferEvent::Redeem)?;
        let recipient = redemption.receiver_channel.user_public_identifier.clone();
        match &self.recipient_public_identifier {
            Some(existing) if *existing != recipient => {
                return Err(CoreError::ValidationError(format!(
                    "transfer {} is designated to {}, not {}",
                    self.payment_id, existing, recipient
                )));
            }
            Some(_) => {}
            None => self.recipient_public_identifier = Some(recipient),
        }
        self.receiver_channel = Some(redemption.receiver_channel);
        self.receiver_app_instance_id = Some(redemption.receiver_app_instance_id);
        self.pre_image = Some(redemption.pre_image);
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Apply `REDEEMED → RECLAIMED`.
    pub fn reclaim(&mut self) -> Result<(), CoreError> {
        self.status = TransferStateMachine::transition(self.status, TransferEvent::Reclaim)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Apply `PENDING → FAILED`.
    pub fn fail(&mut self) -> Result<(), CoreError> {
        self.status = TransferStateMachine::transition(self.status, TransferEvent::Fail)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Designate the recipient while the transfer is still pending.
    pub fn designate_recipient(
        &mut self,
        recipient: PublicIdentifier,
        encrypted_pre_image: String,
    ) -> Result<(), CoreError> {
        if self.status != TransferStatus::Pending {
            return Err(CoreError::InvalidStateTransition {
                from: self.status,
                to: TransferStatus::Pending,
            });
        }
        if self.recipient_public_identifier.is_some() {
            return Err(CoreError::ValidationError(format!(
                "recipient already set for {}",
                self.payment_id
            )));
        }
        self.recipient_public_identifier = Some(recipient);
        self.encrypted_pre_image = Some(encrypted_pre_image);
        self.updated_at = Utc::now();
        Ok(())
    }
}
