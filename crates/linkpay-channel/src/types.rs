use linkpay_core::{
    AppInstanceId, AssetId, CoinTransfer, LinkedHash, MultisigAddress, PaymentId, PreImage,
    PublicIdentifier,
};
use serde::{Deserialize, Serialize};

/// Registered application definitions the router installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppDefinition {
    /// Hash-locked transfer unlocked by revealing the preimage.
    SimpleLinkedTransfer,
}

/// Where a proposal is installed. Always supplied by the caller; engines
/// never infer the multisig from the counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallRoute {
    /// Installed in the two-party channel identified by `multisig`.
    Direct { multisig: MultisigAddress },
    /// Installed as a virtual app routed through `intermediary`.
    Virtual { intermediary: PublicIdentifier },
}

/// State of a linked-transfer app.
///
/// `coin_transfers[0]` is the payer, `coin_transfers[1]` the payee. The
/// amount moves to the payee once the matching preimage is revealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedTransferAppState {
    pub amount: u128,
    pub asset_id: AssetId,
    pub coin_transfers: [CoinTransfer; 2],
    pub linked_hash: LinkedHash,
    pub payment_id: PaymentId,
    pub pre_image: PreImage,
}

impl LinkedTransferAppState {
    /// Initial locked state: everything still owed to the payer.
    pub fn locked(
        amount: u128,
        asset_id: AssetId,
        payer: PublicIdentifier,
        payee: PublicIdentifier,
        linked_hash: LinkedHash,
        payment_id: PaymentId,
    ) -> Self {
        Self {
            amount,
            asset_id,
            coin_transfers: [
                CoinTransfer { to: payer, amount },
                CoinTransfer {
                    to: payee,
                    amount: 0,
                },
            ],
            linked_hash,
            payment_id,
            pre_image: PreImage::ZERO,
        }
    }

    pub fn payer(&self) -> &PublicIdentifier {
        &self.coin_transfers[0].to
    }

    pub fn payee(&self) -> &PublicIdentifier {
        &self.coin_transfers[1].to
    }

    pub fn is_unlocked(&self) -> bool {
        !self.pre_image.is_zero()
    }

    /// State after `pre_image` is revealed: the full amount paid to the payee.
    pub fn unlocked(&self, pre_image: PreImage) -> Self {
        let mut next = self.clone();
        next.coin_transfers[0].amount = 0;
        next.coin_transfers[1].amount = self.amount;
        next.pre_image = pre_image;
        next
    }
}

/// Action applied to a linked-transfer app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppAction {
    pub pre_image: PreImage,
}

/// Parameters of a propose-install request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeInstallParams {
    pub app: AppDefinition,
    pub route: InstallRoute,
    pub initiator: PublicIdentifier,
    pub responder: PublicIdentifier,
    pub initial_state: LinkedTransferAppState,
    pub initiator_deposit: u128,
    pub responder_deposit: u128,
    pub asset_id: AssetId,
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppStatus {
    Proposed,
    Installed,
    Rejected,
    Uninstalled,
}

/// An application instance as reported by a channel engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInstance {
    pub identity_hash: AppInstanceId,
    pub multisig_address: MultisigAddress,
    pub app: AppDefinition,
    pub initiator: PublicIdentifier,
    pub responder: PublicIdentifier,
    pub initiator_deposit: u128,
    pub responder_deposit: u128,
    pub asset_id: AssetId,
    pub latest_state: LinkedTransferAppState,
    pub status: AppStatus,
}
