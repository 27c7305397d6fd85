use crate::state_machine::TransferStatus;

/// Core protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("validation failed: {0}")]
    ValidationError(String),

    #[error("invalid hex for {field}: {reason}")]
    InvalidHex { field: &'static str, reason: String },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid public identifier: {0}")]
    InvalidIdentifier(String),

    #[error("config error: {0}")]
    Config(String),
}
