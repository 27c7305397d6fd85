use linkpay_core::{AppInstanceId, MultisigAddress, PublicIdentifier};

/// Errors surfaced by a channel engine or the message bus.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel not found: {0}")]
    ChannelNotFound(MultisigAddress),

    #[error("no channel with user {0}")]
    NoChannelForUser(PublicIdentifier),

    #[error("app instance not found: {0}")]
    AppNotFound(AppInstanceId),

    #[error("proposal rejected: {0}")]
    ProposalRejected(String),

    #[error("counterparty unreachable: {0}")]
    Unreachable(String),

    #[error("insufficient free balance: available {available}, required {required}")]
    InsufficientFreeBalance { available: u128, required: u128 },

    #[error("invalid app state: {0}")]
    InvalidAppState(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("no responders for subject {0}")]
    NoResponders(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors from acquiring or releasing a channel lock.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("timed out acquiring lock on {key} after {waited_ms}ms")]
    Timeout { key: String, waited_ms: u64 },

    #[error("lock on {key} is not held by this token")]
    NotHeld { key: String },

    #[error("invalid lease: {0}")]
    InvalidLease(String),
}
