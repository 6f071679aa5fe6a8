//! Core identifiers, constants, and epoch time helpers
//!
//! Every entity in the system is addressed by a 32-byte BLAKE3 digest:
//! nodes by the hash of their Ed25519 public key, Things by the hash of
//! their content, networks by the hash of the Thing they host plus a
//! creation counter. Identifiers serialize as lowercase hex.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Raw 32-byte BLAKE3 digest
pub type Hash256 = [u8; 32];

/// The all-zero hash, used as the previous-hash of the first event in a chain
pub const ZERO_HASH: Hash256 = [0u8; 32];

/// System-wide constants
pub mod constants {
    /// Maximum size of a single Thing (500 MiB)
    pub const MAX_THING_SIZE: usize = 500 * 1024 * 1024;
    /// Maximum size of a single gossip message (10 MiB)
    pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
    /// Push-gossip fanout
    pub const GOSSIP_FANOUT: usize = 3;
    /// Epoch length in seconds (10 minutes)
    pub const EPOCH_DURATION_SECONDS: u64 = 600;
    /// Gateway session timeout
    pub const SESSION_TIMEOUT_SECONDS: u64 = 1800;
    /// Keys decay after this long without use (30 days)
    pub const KEY_DECAY_PERIOD_SECONDS: u64 = 86400 * 30;
    /// Maximum onion-routing hops
    pub const MAX_ROUTING_HOPS: u8 = 8;
    /// Minimum network quorum
    pub const MIN_NETWORK_QUORUM: usize = 3;
    /// Maximum network quorum
    pub const MAX_NETWORK_QUORUM: usize = 20;
    /// Tolerated clock skew for external events and revocations
    pub const MAX_CLOCK_SKEW_SECONDS: u64 = 300;
    /// Maximum events in a single sync response
    pub const MAX_SYNC_EVENTS: usize = 1000;

    pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;
    pub const ED25519_SIGNATURE_SIZE: usize = 64;
    pub const CHACHA20_KEY_SIZE: usize = 32;
    pub const CHACHA20_NONCE_SIZE: usize = 12;
    pub const BLAKE3_HASH_SIZE: usize = 32;
}

/// Current wall-clock time as unix seconds
pub fn now_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Epoch number for a given unix timestamp
pub fn epoch_for(timestamp: u64) -> u64 {
    timestamp / constants::EPOCH_DURATION_SECONDS
}

/// Current epoch number
pub fn current_epoch() -> u64 {
    epoch_for(now_seconds())
}

fn parse_hash(hex_str: &str) -> Result<Hash256> {
    let bytes = hex::decode(hex_str)
        .map_err(|_| Error::InvalidFormat(format!("bad hex identifier: {hex_str}")))?;
    let arr: Hash256 = bytes
        .try_into()
        .map_err(|_| Error::InvalidFormat("identifier must be 32 bytes".into()))?;
    Ok(arr)
}

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident, $field:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        pub struct $name(pub Hash256);

        impl $name {
            pub fn as_bytes(&self) -> &Hash256 {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self> {
                Ok(Self(parse_hash(s)?))
            }

            pub fn is_zero(&self) -> bool {
                self.0 == ZERO_HASH
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Short form: first 8 hex chars, enough to tell nodes apart in logs
                write!(f, concat!(stringify!($name), "({}..)"), &self.to_hex()[..8])
            }
        }

        impl From<Hash256> for $name {
            fn from($field: Hash256) -> Self {
                Self($field)
            }
        }
    };
}

define_id!(
    /// Node identifier: `BLAKE3(ed25519_public_key)`
    NodeId,
    hash
);
define_id!(
    /// Human (pseudonymous) identity identifier
    HumanId,
    hash
);
define_id!(
    /// Network (replica cluster) identifier
    NetworkId,
    hash
);
define_id!(
    /// Content identifier: `BLAKE3(blob_bytes)`
    ContentHash,
    hash
);

impl NodeId {
    /// Derive a node id from an Ed25519 public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }
}

impl ContentHash {
    /// Hash a blob into its content address
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }
}

impl NetworkId {
    /// Derive a network id from the hosted Thing and a per-node creation counter
    pub fn derive(thing_hash: &ContentHash, counter: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(thing_hash.as_bytes());
        hasher.update(&counter.to_le_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let id = NodeId([7u8; 32]);
        let hex_str = id.to_hex();
        assert_eq!(hex_str.len(), 64);
        assert_eq!(NodeId::from_hex(&hex_str).unwrap(), id);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(NodeId::from_hex("zzzz").is_err());
        assert!(NodeId::from_hex("abcd").is_err()); // too short
    }

    #[test]
    fn test_node_id_from_public_key() {
        let pk = [42u8; 32];
        let id = NodeId::from_public_key(&pk);
        assert_eq!(id.0, *blake3::hash(&pk).as_bytes());
    }

    #[test]
    fn test_content_hash_matches_blake3() {
        let hash = ContentHash::of(b"hello");
        assert_eq!(hash.0, *blake3::hash(b"hello").as_bytes());
    }

    #[test]
    fn test_network_id_depends_on_counter() {
        let thing = ContentHash::of(b"thing");
        assert_ne!(NetworkId::derive(&thing, 0), NetworkId::derive(&thing, 1));
    }

    #[test]
    fn test_epoch_math() {
        assert_eq!(epoch_for(0), 0);
        assert_eq!(epoch_for(599), 0);
        assert_eq!(epoch_for(600), 1);
        assert_eq!(epoch_for(6000), 10);
    }
}
