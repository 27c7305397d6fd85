use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Decode a `0x`-prefixed (or bare) hex string into exactly `N` bytes.
pub fn decode_fixed_hex<const N: usize>(
    input: &str,
    field: &'static str,
) -> Result<[u8; N], CoreError> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    let bytes = hex::decode(stripped).map_err(|e| CoreError::InvalidHex {
        field,
        reason: e.to_string(),
    })?;
    if bytes.len() != N {
        return Err(CoreError::InvalidHex {
            field,
            reason: format!("expected {} bytes, got {}", N, bytes.len()),
        });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Fixed-width byte identifiers rendered as `0x`-prefixed lowercase hex.
macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident, $len:expr, $field:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Byte length of this identifier.
            pub const LEN: usize = $len;

            /// Construct from raw bytes.
            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Borrow the raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Parse a hex string, with or without `0x` prefix.
            pub fn parse(input: &str) -> Result<Self, CoreError> {
                decode_fixed_hex::<$len>(input, $field).map(Self)
            }

            /// Render as `0x`-prefixed hex.
            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(
    /// Sender-chosen identifier of a linked transfer, stable for its lifetime.
    PaymentId,
    32,
    "payment id"
);

hex_id!(
    /// The 32-byte secret that unlocks a linked transfer.
    PreImage,
    32,
    "preimage"
);

hex_id!(
    /// Commitment `Hash(amount, assetId, paymentId, preImage)`.
    LinkedHash,
    32,
    "linked hash"
);

hex_id!(
    /// Identity hash of an application instance inside a channel.
    AppInstanceId,
    32,
    "app instance id"
);

hex_id!(
    /// Token contract address; the zero address denotes the native asset.
    AssetId,
    20,
    "asset id"
);

hex_id!(
    /// Settlement address of a two-party channel.
    MultisigAddress,
    20,
    "multisig address"
);

impl PreImage {
    /// The all-zero preimage placeholder used in unresolved app state.
    pub const ZERO: PreImage = PreImage([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl AssetId {
    /// The native chain asset.
    pub const NATIVE: AssetId = AssetId([0u8; 20]);
}

/// Public identifier of a channel participant (user or router).
///
/// Identifiers are embedded into message-bus subjects, so they must be
/// non-empty and free of whitespace and subject separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicIdentifier(String);

impl PublicIdentifier {
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        if input.is_empty() {
            return Err(CoreError::InvalidIdentifier("empty identifier".into()));
        }
        if input
            .chars()
            .any(|c| c.is_whitespace() || c == '.' || c == '*' || c == '>')
        {
            return Err(CoreError::InvalidIdentifier(format!(
                "identifier contains reserved characters: {}",
                input
            )));
        }
        Ok(Self(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublicIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PublicIdentifier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PublicIdentifier {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PublicIdentifier> for String {
    fn from(value: PublicIdentifier) -> Self {
        value.0
    }
}

/// A payment channel between one user and the router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    /// Unique key of the channel.
    pub multisig_address: MultisigAddress,
    /// The non-router participant.
    pub user_public_identifier: PublicIdentifier,
}

impl Channel {
    pub fn new(multisig_address: MultisigAddress, user_public_identifier: PublicIdentifier) -> Self {
        Self {
            multisig_address,
            user_public_identifier,
        }
    }
}

/// One leg of an app outcome: `amount` of the app's asset paid to `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinTransfer {
    pub to: PublicIdentifier,
    pub amount: u128,
}

/// Free-balance snapshot of one asset in one channel, keyed by participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeBalance {
    pub asset_id: Option<AssetId>,
    pub balances: BTreeMap<PublicIdentifier, u128>,
}

impl FreeBalance {
    pub fn new(asset_id: AssetId) -> Self {
        Self {
            asset_id: Some(asset_id),
            balances: BTreeMap::new(),
        }
    }

    /// Balance held by `party`, zero if absent.
    pub fn balance_of(&self, party: &PublicIdentifier) -> u128 {
        self.balances.get(party).copied().unwrap_or(0)
    }

    pub fn with_balance(mut self, party: PublicIdentifier, amount: u128) -> Self {
        self.balances.insert(party, amount);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_id_parse_with_prefix() {
        let hex = format!("0x{}", "ab".repeat(32));
        let id = PaymentId::parse(&hex).unwrap();
        assert_eq!(id.as_bytes(), &[0xab; 32]);
        assert_eq!(id.to_string(), hex);
    }

    #[test]
    fn test_payment_id_parse_without_prefix() {
        let id = PaymentId::parse(&"01".repeat(32)).unwrap();
        assert_eq!(id.as_bytes(), &[0x01; 32]);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let result = PreImage::parse("0xdeadbeef");
        assert!(matches!(result, Err(CoreError::InvalidHex { .. })));
    }

    #[test]
    fn test_non_hex_rejected() {
        let result = AssetId::parse(&format!("0x{}", "zz".repeat(20)));
        assert!(matches!(result, Err(CoreError::InvalidHex { .. })));
    }

    #[test]
    fn test_asset_id_is_twenty_bytes() {
        assert!(AssetId::parse(&"00".repeat(20)).is_ok());
        assert!(AssetId::parse(&"00".repeat(32)).is_err());
        assert_eq!(AssetId::parse(&"00".repeat(20)).unwrap(), AssetId::NATIVE);
    }

    #[test]
    fn test_zero_preimage() {
        assert!(PreImage::ZERO.is_zero());
        assert!(!PreImage([1u8; 32]).is_zero());
    }

    #[test]
    fn test_hex_id_serde_as_string() {
        let id = AppInstanceId([7u8; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"0x{}\"", "07".repeat(32)));
        let back: AppInstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_public_identifier_validation() {
        assert!(PublicIdentifier::parse("xpubAlice").is_ok());
        assert!(PublicIdentifier::parse("").is_err());
        assert!(PublicIdentifier::parse("has space").is_err());
        assert!(PublicIdentifier::parse("a.b").is_err());
        assert!(PublicIdentifier::parse("wild>").is_err());
    }

    #[test]
    fn test_public_identifier_deserialize_validates() {
        let ok: Result<PublicIdentifier, _> = serde_json::from_str("\"xpubBob\"");
        assert!(ok.is_ok());
        let bad: Result<PublicIdentifier, _> = serde_json::from_str("\"x.y\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_free_balance_lookup() {
        let alice = PublicIdentifier::parse("xpubAlice").unwrap();
        let bob = PublicIdentifier::parse("xpubBob").unwrap();
        let fb = FreeBalance::new(AssetId::NATIVE).with_balance(alice.clone(), 10);
        assert_eq!(fb.balance_of(&alice), 10);
        assert_eq!(fb.balance_of(&bob), 0);
    }
}
