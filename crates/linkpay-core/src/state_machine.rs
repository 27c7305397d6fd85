use std::fmt;

use crate::error::CoreError;

/// Lifecycle status of a linked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    /// Sender-side app installed, awaiting redemption by the recipient.
    Pending,
    /// Recipient-side app installed and the preimage is known to the router.
    Redeemed,
    /// Router unlocked and uninstalled the sender-side app. Final state.
    Reclaimed,
    /// Transfer can never complete. Final state.
    Failed,
}

impl TransferStatus {
    /// Whether this is a final (terminal) state.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Reclaimed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Redeemed => "REDEEMED",
            Self::Reclaimed => "RECLAIMED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive a transfer between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// The recipient-side app was installed with a valid preimage.
    Redeem,
    /// The router reclaimed its outlay from the sender-side app.
    Reclaim,
    /// The transfer was abandoned before redemption.
    Fail,
}

impl TransferEvent {
    fn target(&self) -> TransferStatus {
        match self {
            Self::Redeem => TransferStatus::Redeemed,
            Self::Reclaim => TransferStatus::Reclaimed,
            Self::Fail => TransferStatus::Failed,
        }
    }
}

/// Forward-only linked-transfer state machine.
///
/// Valid transitions:
/// - Pending → Redeemed (Redeem)
/// - Redeemed → Reclaimed (Reclaim)
/// - Pending → Failed (Fail)
pub struct TransferStateMachine;

impl TransferStateMachine {
    /// Attempt a state transition based on an event.
    pub fn transition(
        current: TransferStatus,
        event: TransferEvent,
    ) -> Result<TransferStatus, CoreError> {
        let next = match (current, event) {
            (TransferStatus::Pending, TransferEvent::Redeem) => TransferStatus::Redeemed,
            (TransferStatus::Redeemed, TransferEvent::Reclaim) => TransferStatus::Reclaimed,
            (TransferStatus::Pending, TransferEvent::Fail) => TransferStatus::Failed,
            _ => {
                return Err(CoreError::InvalidStateTransition {
                    from: current,
                    to: event.target(),
                })
            }
        };

        tracing::debug!(from = %current, to = %next, event = ?event, "transfer status transition");
        Ok(next)
    }

    pub fn can_transition(current: TransferStatus, event: TransferEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}
