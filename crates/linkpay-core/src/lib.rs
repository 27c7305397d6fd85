//! Linkpay core: identifiers, the linked-transfer record and its status
//! state machine, protocol configuration and logging setup.

pub mod config;
pub mod error;
pub mod linked_transfer;
pub mod logging;
pub mod state_machine;
pub mod types;

pub use config::{CollateralProfile, LoggingConfig, ProtocolConfig};
pub use error::CoreError;
pub use linked_transfer::{LinkedTransfer, Redemption};
pub use state_machine::{TransferEvent, TransferStateMachine, TransferStatus};
pub use types::{
    AppInstanceId, AssetId, Channel, CoinTransfer, FreeBalance, LinkedHash, MultisigAddress,
    PaymentId, PreImage, PublicIdentifier,
};
