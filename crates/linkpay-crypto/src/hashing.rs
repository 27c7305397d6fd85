use linkpay_core::{AssetId, LinkedHash, PaymentId, PreImage};
use rand::RngCore;

/// BLAKE3 hash (32 bytes).
pub type Hash = [u8; 32];

/// Hash arbitrary data using BLAKE3.
pub fn hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Compute the linked-transfer commitment `Hash(amount, assetId, paymentId, preImage)`.
///
/// Fields are packed tightly: amount as a 32-byte big-endian word, the
/// 20-byte asset address, then the 32-byte payment id and preimage.
pub fn linked_hash(
    amount: u128,
    asset_id: &AssetId,
    payment_id: &PaymentId,
    pre_image: &PreImage,
) -> LinkedHash {
    let mut packed = Vec::with_capacity(32 + 20 + 32 + 32);
    packed.extend_from_slice(&[0u8; 16]);
    packed.extend_from_slice(&amount.to_be_bytes());
    packed.extend_from_slice(asset_id.as_bytes());
    packed.extend_from_slice(payment_id.as_bytes());
    packed.extend_from_slice(pre_image.as_bytes());
    LinkedHash(hash(&packed))
}

/// Check a claimed preimage against a stored commitment.
pub fn verify_linked_hash(
    expected: &LinkedHash,
    amount: u128,
    asset_id: &AssetId,
    payment_id: &PaymentId,
    pre_image: &PreImage,
) -> bool {
    linked_hash(amount, asset_id, payment_id, pre_image) == *expected
}

/// Fresh random payment id from OS entropy.
pub fn random_payment_id() -> PaymentId {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    PaymentId(bytes)
}

/// Fresh random preimage from OS entropy.
pub fn random_preimage() -> PreImage {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    PreImage(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (AssetId, PaymentId, PreImage) {
        (AssetId::NATIVE, PaymentId([1u8; 32]), PreImage([2u8; 32]))
    }

    #[test]
    fn test_linked_hash_deterministic() {
        let (asset, pid, pre) = fixture();
        assert_eq!(
            linked_hash(3, &asset, &pid, &pre),
            linked_hash(3, &asset, &pid, &pre)
        );
    }

    #[test]
    fn test_linked_hash_binds_every_field() {
        let (asset, pid, pre) = fixture();
        let base = linked_hash(3, &asset, &pid, &pre);
        assert_ne!(base, linked_hash(4, &asset, &pid, &pre));
        assert_ne!(base, linked_hash(3, &AssetId([9u8; 20]), &pid, &pre));
        assert_ne!(base, linked_hash(3, &asset, &PaymentId([7u8; 32]), &pre));
        assert_ne!(base, linked_hash(3, &asset, &pid, &PreImage([8u8; 32])));
    }

    #[test]
    fn test_linked_hash_matches_packed_layout() {
        let (asset, pid, pre) = fixture();
        let mut packed = vec![0u8; 31];
        packed.push(3);
        packed.extend_from_slice(&[0u8; 20]);
        packed.extend_from_slice(&[1u8; 32]);
        packed.extend_from_slice(&[2u8; 32]);
        assert_eq!(linked_hash(3, &asset, &pid, &pre).0, hash(&packed));
    }

    #[test]
    fn test_verify_linked_hash() {
        let (asset, pid, pre) = fixture();
        let commitment = linked_hash(10, &asset, &pid, &pre);
        assert!(verify_linked_hash(&commitment, 10, &asset, &pid, &pre));
        assert!(!verify_linked_hash(&commitment, 10, &asset, &pid, &PreImage([0u8; 32])));
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(random_payment_id(), random_payment_id());
        assert_ne!(random_preimage(), random_preimage());
    }
}
