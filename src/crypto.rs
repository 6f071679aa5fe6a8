//! Cryptographic primitives
//!
//! Thin wrappers over the ecosystem crates: Ed25519 signing via
//! `ed25519-dalek`, hashing via `blake3`, authenticated encryption via
//! `chacha20poly1305`, randomness via the OS CSPRNG. All key material
//! lives in these types; the rest of the crate works with byte arrays.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::common::{constants, Hash256, NodeId};
use crate::error::{Error, Result};

/// Ed25519 signature bytes
pub type SignatureBytes = [u8; 64];

/// Ed25519 public key bytes
pub type PublicKeyBytes = [u8; 32];

/// Compute the BLAKE3 digest of a byte slice
pub fn blake3_hash(data: &[u8]) -> Hash256 {
    *blake3::hash(data).as_bytes()
}

/// Compute the BLAKE3 digest over several concatenated slices
pub fn blake3_hash_parts(parts: &[&[u8]]) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Fill a buffer of N bytes from the OS CSPRNG
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Ed25519 signing keypair
///
/// Wraps the dalek signing key and caches the derived [`NodeId`]. The
/// secret key never leaves this struct except through [`to_secret_bytes`]
/// for encrypted persistence.
///
/// [`to_secret_bytes`]: SigningKeypair::to_secret_bytes
pub struct SigningKeypair {
    signing_key: ed25519_dalek::SigningKey,
    node_id: NodeId,
}

impl SigningKeypair {
    /// Generate a fresh keypair from the OS CSPRNG
    pub fn generate() -> Self {
        let signing_key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let node_id = NodeId::from_public_key(signing_key.verifying_key().as_bytes());
        log::debug!("generated ed25519 keypair for node {node_id:?}");
        Self { signing_key, node_id }
    }

    /// Rebuild a keypair from its 32-byte secret seed
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(secret);
        let node_id = NodeId::from_public_key(signing_key.verifying_key().as_bytes());
        Self { signing_key, node_id }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key_bytes(&self) -> PublicKeyBytes {
        *self.signing_key.verifying_key().as_bytes()
    }

    pub fn to_secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        self.signing_key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secret key deliberately excluded
        f.debug_struct("SigningKeypair")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature against a public key
pub fn verify_signature(
    public_key: &PublicKeyBytes,
    message: &[u8],
    signature: &SignatureBytes,
) -> Result<()> {
    let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(public_key)
        .map_err(|_| Error::InvalidPublicKey)?;
    let sig = ed25519_dalek::Signature::from_bytes(signature);
    verifying_key
        .verify(message, &sig)
        .map_err(|_| Error::VerificationFailed)
}

/// Derive a 32-byte symmetric key from a password via BLAKE3
pub fn derive_key_from_password(password: &str) -> [u8; 32] {
    blake3_hash(password.as_bytes())
}

/// Encrypt with ChaCha20-Poly1305; a random 12-byte nonce is prepended to
/// the ciphertext
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce_bytes = random_bytes::<{ constants::CHACHA20_NONCE_SIZE }>();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::EncryptionFailed)?;
    let mut out = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a nonce-prefixed ChaCha20-Poly1305 ciphertext
pub fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < constants::CHACHA20_NONCE_SIZE {
        return Err(Error::DecryptionFailed);
    }
    let (nonce_bytes, ciphertext) = data.split_at(constants::CHACHA20_NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| Error::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = SigningKeypair::generate();
        let message = b"cashew event bytes";
        let sig = keypair.sign(message);

        assert!(verify_signature(&keypair.public_key_bytes(), message, &sig).is_ok());
    }

    #[test]
    fn test_tampered_message_fails() {
        let keypair = SigningKeypair::generate();
        let sig = keypair.sign(b"original");

        assert!(verify_signature(&keypair.public_key_bytes(), b"tampered", &sig).is_err());
    }

    #[test]
    fn test_tampered_signature_fails() {
        let keypair = SigningKeypair::generate();
        let message = b"message";
        let mut sig = keypair.sign(message);
        sig[0] ^= 0x01;

        assert!(verify_signature(&keypair.public_key_bytes(), message, &sig).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let alice = SigningKeypair::generate();
        let bob = SigningKeypair::generate();
        let sig = alice.sign(b"message");

        assert!(verify_signature(&bob.public_key_bytes(), b"message", &sig).is_err());
    }

    #[test]
    fn test_keypair_round_trip_through_secret() {
        let keypair = SigningKeypair::generate();
        let restored = SigningKeypair::from_secret_bytes(&keypair.to_secret_bytes());

        assert_eq!(keypair.node_id(), restored.node_id());
        assert_eq!(keypair.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let key = derive_key_from_password("hunter2");
        let plaintext = b"secret identity file";

        let ciphertext = encrypt(&key, plaintext).unwrap();
        assert_ne!(&ciphertext[12..], plaintext.as_slice());

        let decrypted = decrypt(&key, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_decrypt_wrong_password_fails() {
        let ciphertext = encrypt(&derive_key_from_password("right"), b"data").unwrap();
        assert!(decrypt(&derive_key_from_password("wrong"), &ciphertext).is_err());
    }

    #[test]
    fn test_decrypt_truncated_fails() {
        assert!(decrypt(&[0u8; 32], &[1, 2, 3]).is_err());
    }
}
