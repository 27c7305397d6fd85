//! Linked-transfer protocol: a sender locks funds behind
//! `Hash(amount, assetId, paymentId, preImage)`, the router pays the
//! recipient once the preimage is revealed, and later reclaims the sender's
//! locked funds.

pub mod collateral;
pub mod engine;
pub mod error;
pub mod install;
pub mod ledger;
pub mod messaging;
pub mod reclaim;
pub mod retry;

pub use collateral::CollateralManager;
pub use engine::{
    send_async_subject, NewLinkedTransfer, PaymentProtocolEngine, ResolvedTransfer,
    SendAsyncNotice,
};
pub use error::TransferError;
pub use install::InstallCoordinator;
pub use ledger::{InMemoryTransferLedger, TransferLedger};
pub use messaging::{
    subject, LockAcquireRequest, LockReleaseRequest, ResolveLinkedRequest, TransferMessaging,
    GET_PENDING_PREFIX, LOCK_ACQUIRE_PREFIX, LOCK_RELEASE_PREFIX, RESOLVE_LINKED_PREFIX,
};
pub use reclaim::{ReclaimReport, ReclaimWorker};
pub use retry::retry_with_budget;
