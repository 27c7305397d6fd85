use linkpay_channel::{ChannelError, LockError};
use linkpay_core::{
    AppInstanceId, CoreError, LinkedHash, MultisigAddress, PaymentId, PublicIdentifier,
    TransferStatus,
};
use linkpay_crypto::CryptoError;

/// Errors surfaced by the transfer protocol.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("payment id already used: {0}")]
    DuplicatePaymentId(PaymentId),

    #[error("linked hash already recorded: {0}")]
    DuplicateLinkedHash(LinkedHash),

    #[error("invalid state transition for {payment_id}: {from} to {to}")]
    InvalidStateTransition {
        payment_id: PaymentId,
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("transfer not found: {0}")]
    NotFound(PaymentId),

    /// Carries nothing that distinguishes a wrong secret from a wrong
    /// amount, asset or payment id.
    #[error("invalid preimage")]
    InvalidPreimage,

    #[error("proposal failed: {0}")]
    Proposal(ChannelError),

    #[error("install of {app_instance_id} timed out after {timeout_ms}ms")]
    InstallTimeout {
        app_instance_id: AppInstanceId,
        timeout_ms: u64,
    },

    #[error("install of {app_instance_id} rejected: {reason}")]
    InstallRejected {
        app_instance_id: AppInstanceId,
        reason: String,
    },

    #[error("insufficient collateral in {multisig}: available {available}, required {required}")]
    InsufficientCollateral {
        multisig: MultisigAddress,
        available: u128,
        required: u128,
    },

    #[error("sender app {0} is not installed")]
    SenderAppNotInstalled(AppInstanceId),

    #[error("transfer {payment_id} is not designated to {recipient}")]
    RecipientMismatch {
        payment_id: PaymentId,
        recipient: PublicIdentifier,
    },

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl TransferError {
    /// Whether the caller may retry the whole operation after a pause.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Proposal(_)
                | Self::InstallTimeout { .. }
                | Self::InstallRejected { .. }
                | Self::InsufficientCollateral { .. }
                | Self::Lock(LockError::Timeout { .. })
        )
    }

    /// Attach `payment_id` to a record-level error.
    pub fn from_core(payment_id: PaymentId, err: CoreError) -> Self {
        match err {
            CoreError::InvalidStateTransition { from, to } => Self::InvalidStateTransition {
                payment_id,
                from,
                to,
            },
            CoreError::ValidationError(msg) => Self::Validation(msg),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<CoreError> for TransferError {
    fn from(err: CoreError) -> Self {
        Self::Validation(err.to_string())
    }
}
