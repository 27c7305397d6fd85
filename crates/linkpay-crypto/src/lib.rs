pub mod encryption;
pub mod error;
pub mod hashing;
pub mod keys;

pub use encryption::{decrypt_preimage, encrypt_preimage, EncryptedPayload};
pub use error::CryptoError;
pub use hashing::{hash, linked_hash, random_payment_id, random_preimage, verify_linked_hash};
pub use keys::RecipientKeyPair;
