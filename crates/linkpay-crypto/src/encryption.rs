use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use linkpay_core::PreImage;
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::CryptoError;
use crate::keys::RecipientKeyPair;

const KDF_CONTEXT: &str = "linkpay preimage encryption v1";

/// Encrypted payload containing ciphertext, nonce, and ephemeral public key.
#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    /// Ephemeral X25519 public key used for key exchange.
    pub ephemeral_pubkey: [u8; 32],
    /// 12-byte nonce for ChaCha20-Poly1305.
    pub nonce: [u8; 12],
    /// Encrypted data (ciphertext + 16-byte Poly1305 tag).
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// Serialize to bytes: ephemeral_pubkey (32) + nonce (12) + ciphertext (variable).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 12 + self.ciphertext.len());
        out.extend_from_slice(&self.ephemeral_pubkey);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < 44 {
            return Err(CryptoError::DecryptionError("payload too short".into()));
        }
        let mut ephemeral_pubkey = [0u8; 32];
        ephemeral_pubkey.copy_from_slice(&bytes[..32]);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&bytes[32..44]);
        Ok(Self {
            ephemeral_pubkey,
            nonce,
            ciphertext: bytes[44..].to_vec(),
        })
    }

    /// Hex form stored on the ledger row and sent over the bus.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(input: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(input).map_err(|e| CryptoError::Encoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

/// Encrypt a preimage for a recipient using X25519 key exchange + ChaCha20-Poly1305.
pub fn encrypt_preimage(
    pre_image: &PreImage,
    recipient_pubkey: &[u8; 32],
) -> Result<EncryptedPayload, CryptoError> {
    let ephemeral_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_pubkey = X25519PublicKey::from(&ephemeral_secret);

    let shared_secret = ephemeral_secret.diffie_hellman(&X25519PublicKey::from(*recipient_pubkey));
    let symmetric_key = blake3::derive_key(KDF_CONTEXT, shared_secret.as_bytes());

    let mut nonce_bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(&symmetric_key)
        .map_err(|e| CryptoError::EncryptionError(format!("cipher init failed: {}", e)))?;
    let ciphertext = cipher
        .encrypt(nonce, pre_image.as_bytes().as_slice())
        .map_err(|e| CryptoError::EncryptionError(format!("encryption failed: {}", e)))?;

    Ok(EncryptedPayload {
        ephemeral_pubkey: ephemeral_pubkey.to_bytes(),
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Decrypt a preimage with the recipient's key pair.
pub fn decrypt_preimage(
    payload: &EncryptedPayload,
    recipient: &RecipientKeyPair,
) -> Result<PreImage, CryptoError> {
    let ephemeral_pubkey = X25519PublicKey::from(payload.ephemeral_pubkey);
    let shared_secret = recipient.secret().diffie_hellman(&ephemeral_pubkey);
    let symmetric_key = blake3::derive_key(KDF_CONTEXT, shared_secret.as_bytes());

    let nonce = Nonce::from_slice(&payload.nonce);
    let cipher = ChaCha20Poly1305::new_from_slice(&symmetric_key)
        .map_err(|e| CryptoError::DecryptionError(format!("cipher init failed: {}", e)))?;
    let plaintext = cipher
        .decrypt(nonce, payload.ciphertext.as_slice())
        .map_err(|e| CryptoError::DecryptionError(format!("decryption failed: {}", e)))?;

    let bytes: [u8; 32] = plaintext.as_slice().try_into().map_err(|_| {
        CryptoError::DecryptionError(format!("expected 32-byte preimage, got {}", plaintext.len()))
    })?;
    Ok(PreImage(bytes))
}
