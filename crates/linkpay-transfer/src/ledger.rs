//! Linked-transfer persistence.
//!
//! Every mutation is a compare-and-set on one row's status: the transition
//! is checked and applied while the row is exclusively held, so concurrent
//! callers racing on the same payment id see exactly one winner.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use linkpay_core::{
    AppInstanceId, Channel, LinkedHash, LinkedTransfer, PaymentId, PublicIdentifier, Redemption,
    TransferStatus,
};

use crate::error::TransferError;

/// Store of linked-transfer records. Rows are never deleted.
#[async_trait]
pub trait TransferLedger: Send + Sync {
    /// Insert a new record. Payment ids and linked hashes are unique.
    async fn create(&self, transfer: LinkedTransfer) -> Result<LinkedTransfer, TransferError>;

    async fn find_by_payment_id(
        &self,
        payment_id: &PaymentId,
    ) -> Result<Option<LinkedTransfer>, TransferError>;

    async fn find_by_linked_hash(
        &self,
        linked_hash: &LinkedHash,
    ) -> Result<Option<LinkedTransfer>, TransferError>;

    async fn find_by_receiver_app_instance_id(
        &self,
        app_instance_id: &AppInstanceId,
    ) -> Result<Option<LinkedTransfer>, TransferError>;

    async fn find_all(&self) -> Result<Vec<LinkedTransfer>, TransferError>;

    /// `PENDING → REDEEMED`, recording the receiver side and the preimage.
    async fn mark_redeemed(
        &self,
        payment_id: &PaymentId,
        redemption: Redemption,
    ) -> Result<LinkedTransfer, TransferError>;

    /// `REDEEMED → RECLAIMED`.
    async fn mark_reclaimed(&self, payment_id: &PaymentId)
        -> Result<LinkedTransfer, TransferError>;

    /// `PENDING → FAILED`.
    async fn mark_failed(&self, payment_id: &PaymentId) -> Result<LinkedTransfer, TransferError>;

    /// Designate the recipient of a pending transfer, once.
    async fn set_recipient(
        &self,
        payment_id: &PaymentId,
        recipient: PublicIdentifier,
        encrypted_pre_image: String,
    ) -> Result<LinkedTransfer, TransferError>;

    /// Redeemed transfers whose sender side is `channel`.
    async fn find_reclaimable(&self, channel: &Channel)
        -> Result<Vec<LinkedTransfer>, TransferError>;

    /// Pending transfers designated to `recipient`.
    async fn find_pending_for_recipient(
        &self,
        recipient: &PublicIdentifier,
    ) -> Result<Vec<LinkedTransfer>, TransferError>;

    /// Every transfer `public_identifier` sent or received, in any status.
    async fn find_by_public_identifier(
        &self,
        public_identifier: &PublicIdentifier,
    ) -> Result<Vec<LinkedTransfer>, TransferError>;
}

/// In-memory [`TransferLedger`].
///
/// Thread-safe: uses `DashMap` for concurrent access. `by_payment_id` is
/// always locked before `by_linked_hash` when both are needed.
#[derive(Default)]
pub struct InMemoryTransferLedger {
    by_payment_id: DashMap<PaymentId, LinkedTransfer>,
    by_linked_hash: DashMap<LinkedHash, PaymentId>,
}

impl InMemoryTransferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_payment_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_payment_id.is_empty()
    }

    /// Apply `apply` to the row under its exclusive guard.
    fn update<F>(&self, payment_id: &PaymentId, apply: F) -> Result<LinkedTransfer, TransferError>
    where
        F: FnOnce(&mut LinkedTransfer) -> Result<(), TransferError>,
    {
        let mut row = self
            .by_payment_id
            .get_mut(payment_id)
            .ok_or(TransferError::NotFound(*payment_id))?;
        let mut next = row.value().clone();
        apply(&mut next)?;
        *row = next.clone();
        Ok(next)
    }

    fn collect<P>(&self, predicate: P) -> Vec<LinkedTransfer>
    where
        P: Fn(&LinkedTransfer) -> bool,
    {
        let mut rows: Vec<LinkedTransfer> = self
            .by_payment_id
            .iter()
            .filter(|row| predicate(row.value()))
            .map(|row| row.value().clone())
            .collect();
        rows.sort_by_key(|row| row.created_at);
        rows
    }
}

#[async_trait]
impl TransferLedger for InMemoryTransferLedger {
    async fn create(&self, transfer: LinkedTransfer) -> Result<LinkedTransfer, TransferError> {
        let payment_id = transfer.payment_id;
        let Entry::Vacant(row) = self.by_payment_id.entry(payment_id) else {
            return Err(TransferError::DuplicatePaymentId(payment_id));
        };
        let Entry::Vacant(hash) = self.by_linked_hash.entry(transfer.linked_hash) else {
            return Err(TransferError::DuplicateLinkedHash(transfer.linked_hash));
        };
        hash.insert(payment_id);
        row.insert(transfer.clone());

        tracing::info!(
            payment_id = %payment_id,
            linked_hash = %transfer.linked_hash,
            amount = %transfer.amount,
            status = %transfer.status,
            "linked transfer recorded"
        );
        Ok(transfer)
    }

    async fn find_by_payment_id(
        &self,
        payment_id: &PaymentId,
    ) -> Result<Option<LinkedTransfer>, TransferError> {
        Ok(self
            .by_payment_id
            .get(payment_id)
            .map(|row| row.value().clone()))
    }

    async fn find_by_linked_hash(
        &self,
        linked_hash: &LinkedHash,
    ) -> Result<Option<LinkedTransfer>, TransferError> {
        let payment_id = match self.by_linked_hash.get(linked_hash) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.find_by_payment_id(&payment_id).await
    }

    async fn find_by_receiver_app_instance_id(
        &self,
        app_instance_id: &AppInstanceId,
    ) -> Result<Option<LinkedTransfer>, TransferError> {
        Ok(self
            .collect(|row| row.receiver_app_instance_id.as_ref() == Some(app_instance_id))
            .into_iter()
            .next())
    }

    async fn find_all(&self) -> Result<Vec<LinkedTransfer>, TransferError> {
        Ok(self.collect(|_| true))
    }

    async fn mark_redeemed(
        &self,
        payment_id: &PaymentId,
        redemption: Redemption,
    ) -> Result<LinkedTransfer, TransferError> {
        let updated = self.update(payment_id, |row| {
            if row.status != TransferStatus::Pending {
                return Err(TransferError::InvalidStateTransition {
                    payment_id: *payment_id,
                    from: row.status,
                    to: TransferStatus::Redeemed,
                });
            }
            let recipient = &redemption.receiver_channel.user_public_identifier;
            if let Some(designated) = &row.recipient_public_identifier {
                if designated != recipient {
                    return Err(TransferError::RecipientMismatch {
                        payment_id: *payment_id,
                        recipient: recipient.clone(),
                    });
                }
            }
            row.redeem(redemption)
                .map_err(|e| TransferError::from_core(*payment_id, e))
        })?;
        tracing::info!(payment_id = %payment_id, status = %updated.status, "linked transfer redeemed");
        Ok(updated)
    }

    async fn mark_reclaimed(
        &self,
        payment_id: &PaymentId,
    ) -> Result<LinkedTransfer, TransferError> {
        let updated = self.update(payment_id, |row| {
            row.reclaim()
                .map_err(|e| TransferError::from_core(*payment_id, e))
        })?;
        tracing::info!(payment_id = %payment_id, status = %updated.status, "linked transfer reclaimed");
        Ok(updated)
    }

    async fn mark_failed(&self, payment_id: &PaymentId) -> Result<LinkedTransfer, TransferError> {
        let updated = self.update(payment_id, |row| {
            row.fail().map_err(|e| TransferError::from_core(*payment_id, e))
        })?;
        tracing::warn!(payment_id = %payment_id, "linked transfer failed");
        Ok(updated)
    }

    async fn set_recipient(
        &self,
        payment_id: &PaymentId,
        recipient: PublicIdentifier,
        encrypted_pre_image: String,
    ) -> Result<LinkedTransfer, TransferError> {
        self.update(payment_id, |row| {
            row.designate_recipient(recipient, encrypted_pre_image)
                .map_err(|e| TransferError::from_core(*payment_id, e))
        })
    }

    async fn find_reclaimable(
        &self,
        channel: &Channel,
    ) -> Result<Vec<LinkedTransfer>, TransferError> {
        Ok(self.collect(|row| {
            row.status == TransferStatus::Redeemed
                && row.sender_channel.multisig_address == channel.multisig_address
        }))
    }

    async fn find_pending_for_recipient(
        &self,
        recipient: &PublicIdentifier,
    ) -> Result<Vec<LinkedTransfer>, TransferError> {
        Ok(self.collect(|row| {
            row.status == TransferStatus::Pending
                && row.recipient_public_identifier.as_ref() == Some(recipient)
        }))
    }

    async fn find_by_public_identifier(
        &self,
        public_identifier: &PublicIdentifier,
    ) -> Result<Vec<LinkedTransfer>, TransferError> {
        Ok(self.collect(|row| {
            row.sender_channel.user_public_identifier == *public_identifier
                || row.recipient_public_identifier.as_ref() == Some(public_identifier)
        }))
    }
}
