//! Node identity
//!
//! A node's identity is its Ed25519 keypair; the NodeID is the BLAKE3
//! digest of the public key. Identities persist to a JSON file, optionally
//! encrypted at rest with ChaCha20-Poly1305 under a password-derived key
//! (12-byte random nonce prepended to the ciphertext).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::common::{now_seconds, NodeId};
use crate::crypto::{self, PublicKeyBytes, SignatureBytes, SigningKeypair};
use crate::error::{Error, Result};

/// On-disk identity file layout
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    public_key: String,
    secret_key: String,
    created_timestamp: u64,
    node_id: String,
}

/// A node's cryptographic identity
pub struct NodeIdentity {
    keypair: SigningKeypair,
    created_timestamp: u64,
}

impl NodeIdentity {
    /// Generate a fresh identity
    pub fn generate() -> Self {
        let keypair = SigningKeypair::generate();
        log::info!("generated node identity {}", keypair.node_id());
        Self {
            keypair,
            created_timestamp: now_seconds(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    pub fn public_key(&self) -> PublicKeyBytes {
        self.keypair.public_key_bytes()
    }

    pub fn created_at(&self) -> u64 {
        self.created_timestamp
    }

    pub fn keypair(&self) -> &SigningKeypair {
        &self.keypair
    }

    /// Sign a message with this identity's key
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        self.keypair.sign(message)
    }

    /// Save to a JSON file, encrypted if a password is supplied
    pub fn save(&self, path: &Path, password: Option<&str>) -> Result<()> {
        let file = IdentityFile {
            public_key: hex::encode(self.keypair.public_key_bytes()),
            secret_key: hex::encode(self.keypair.to_secret_bytes()),
            created_timestamp: self.created_timestamp,
            node_id: self.node_id().to_hex(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| Error::SerializationFailed(e.to_string()))?;

        let data = match password {
            Some(pw) if !pw.is_empty() => {
                let key = crypto::derive_key_from_password(pw);
                crypto::encrypt(&key, &json)?
            }
            _ => json,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        log::debug!("saved identity to {}", path.display());
        Ok(())
    }

    /// Load from a JSON file, decrypting if a password is supplied
    pub fn load(path: &Path, password: Option<&str>) -> Result<Self> {
        let raw = std::fs::read(path)?;

        let json = match password {
            Some(pw) if !pw.is_empty() => {
                let key = crypto::derive_key_from_password(pw);
                crypto::decrypt(&key, &raw)?
            }
            _ => raw,
        };

        let file: IdentityFile = serde_json::from_slice(&json)
            .map_err(|e| Error::InvalidFormat(format!("identity file: {e}")))?;

        let secret_bytes = hex::decode(&file.secret_key)
            .map_err(|_| Error::InvalidSecretKey)?;
        let secret: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| Error::InvalidSecretKey)?;

        let keypair = SigningKeypair::from_secret_bytes(&secret);

        // The stored node id must match the one derived from the key
        let claimed = NodeId::from_hex(&file.node_id)?;
        if claimed != keypair.node_id() {
            return Err(Error::StorageCorrupted(
                "identity file node_id does not match secret key".into(),
            ));
        }

        log::info!("loaded node identity {}", keypair.node_id());
        Ok(Self {
            keypair,
            created_timestamp: file.created_timestamp,
        })
    }

    /// Load an identity if the file exists, otherwise generate and save one
    pub fn load_or_generate(path: &Path, password: Option<&str>) -> Result<Self> {
        if path.exists() {
            Self::load(path, password)
        } else {
            let identity = Self::generate();
            identity.save(path, password)?;
            Ok(identity)
        }
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id())
            .field("created_timestamp", &self.created_timestamp)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_derivation() {
        let identity = NodeIdentity::generate();
        assert_eq!(
            identity.node_id(),
            NodeId::from_public_key(&identity.public_key())
        );
    }

    #[test]
    fn test_save_load_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let identity = NodeIdentity::generate();
        identity.save(&path, None).unwrap();

        let loaded = NodeIdentity::load(&path, None).unwrap();
        assert_eq!(loaded.node_id(), identity.node_id());
        assert_eq!(loaded.created_at(), identity.created_at());
    }

    #[test]
    fn test_save_load_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.enc");

        let identity = NodeIdentity::generate();
        identity.save(&path, Some("passphrase")).unwrap();

        // Encrypted file is not valid JSON
        assert!(NodeIdentity::load(&path, None).is_err());
        // Wrong password fails to decrypt
        assert!(NodeIdentity::load(&path, Some("wrong")).is_err());

        let loaded = NodeIdentity::load(&path, Some("passphrase")).unwrap();
        assert_eq!(loaded.node_id(), identity.node_id());
    }

    #[test]
    fn test_load_or_generate_creates_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let first = NodeIdentity::load_or_generate(&path, None).unwrap();
        let second = NodeIdentity::load_or_generate(&path, None).unwrap();
        assert_eq!(first.node_id(), second.node_id());
    }

    #[test]
    fn test_signatures_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let identity = NodeIdentity::generate();
        identity.save(&path, None).unwrap();
        let sig = identity.sign(b"message");

        let loaded = NodeIdentity::load(&path, None).unwrap();
        assert!(crypto::verify_signature(&loaded.public_key(), b"message", &sig).is_ok());
    }
}
