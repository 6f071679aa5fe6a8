//! Participation keys
//!
//! Keys are capability counters, not currency: a node holds a non-negative
//! count per key type, earned through proof-of-work, proof-of-contribution,
//! or vouching. The registry tracks counts plus per-grant metadata (when
//! issued, when last used, how earned) so the decay scheduler can expire
//! unused grants.

use hashbrown::HashMap;

use crate::common::NodeId;
use crate::crypto::{self, PublicKeyBytes, SignatureBytes, SigningKeypair};
use crate::error::{Error, Result};
use crate::event::{write_string, ByteReader, IssuanceMethod};

/// The five participation key types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum KeyType {
    /// Create and manage identities; never decays
    Identity = 1,
    /// Run a node
    Node = 2,
    /// Form and join networks
    Network = 3,
    /// Host Things
    Service = 4,
    /// Route traffic
    Routing = 5,
}

impl KeyType {
    pub const ALL: [KeyType; 5] = [
        KeyType::Identity,
        KeyType::Node,
        KeyType::Network,
        KeyType::Service,
        KeyType::Routing,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Identity),
            2 => Some(Self::Node),
            3 => Some(Self::Network),
            4 => Some(Self::Service),
            5 => Some(Self::Routing),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "IDENTITY",
            Self::Node => "NODE",
            Self::Network => "NETWORK",
            Self::Service => "SERVICE",
            Self::Routing => "ROUTING",
        }
    }
}

/// Metadata for one issued key grant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyGrant {
    pub issued_at: u64,
    pub last_used_at: u64,
    pub source: IssuanceMethod,
}

/// A signed transfer of one key between nodes
#[derive(Debug, Clone, PartialEq)]
pub struct KeyTransfer {
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub key_type: KeyType,
    pub transfer_timestamp: u64,
    pub reason: String,
    pub from_signature: SignatureBytes,
}

impl KeyTransfer {
    fn signable_bytes(
        from: &NodeId,
        to: &NodeId,
        key_type: KeyType,
        timestamp: u64,
        reason: &str,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(from.as_bytes());
        out.extend_from_slice(to.as_bytes());
        out.push(key_type as u8);
        out.extend_from_slice(&timestamp.to_le_bytes());
        write_string(&mut out, reason);
        out
    }

    pub fn verify(&self, from_public_key: &PublicKeyBytes) -> bool {
        let bytes = Self::signable_bytes(
            &self.from_node,
            &self.to_node,
            self.key_type,
            self.transfer_timestamp,
            &self.reason,
        );
        crypto::verify_signature(from_public_key, &bytes, &self.from_signature).is_ok()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Self::signable_bytes(
            &self.from_node,
            &self.to_node,
            self.key_type,
            self.transfer_timestamp,
            &self.reason,
        );
        out.extend_from_slice(&self.from_signature);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let from_node = NodeId(reader.read_hash()?);
        let to_node = NodeId(reader.read_hash()?);
        let type_byte = reader.read_u8()?;
        let key_type = KeyType::from_u8(type_byte)
            .ok_or_else(|| Error::InvalidFormat(format!("unknown key type {type_byte}")))?;
        let transfer_timestamp = reader.read_u64()?;
        let reason = reader.read_string()?;
        let from_signature: SignatureBytes = reader
            .read_bytes(64)?
            .try_into()
            .map_err(|_| Error::InvalidFormat("bad signature".into()))?;
        Ok(Self {
            from_node,
            to_node,
            key_type,
            transfer_timestamp,
            reason,
            from_signature,
        })
    }
}

/// A signed vouch emitting one or more keys to a vouchee
#[derive(Debug, Clone, PartialEq)]
pub struct KeyVouch {
    pub voucher: NodeId,
    pub vouchee: NodeId,
    pub key_type: KeyType,
    pub key_count: u32,
    pub vouch_timestamp: u64,
    pub statement: String,
    pub voucher_signature: SignatureBytes,
}

impl KeyVouch {
    fn signable_bytes(
        voucher: &NodeId,
        vouchee: &NodeId,
        key_type: KeyType,
        key_count: u32,
        timestamp: u64,
        statement: &str,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(voucher.as_bytes());
        out.extend_from_slice(vouchee.as_bytes());
        out.push(key_type as u8);
        out.extend_from_slice(&key_count.to_le_bytes());
        out.extend_from_slice(&timestamp.to_le_bytes());
        write_string(&mut out, statement);
        out
    }

    pub fn verify(&self, voucher_public_key: &PublicKeyBytes) -> bool {
        let bytes = Self::signable_bytes(
            &self.voucher,
            &self.vouchee,
            self.key_type,
            self.key_count,
            self.vouch_timestamp,
            &self.statement,
        );
        crypto::verify_signature(voucher_public_key, &bytes, &self.voucher_signature).is_ok()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Self::signable_bytes(
            &self.voucher,
            &self.vouchee,
            self.key_type,
            self.key_count,
            self.vouch_timestamp,
            &self.statement,
        );
        out.extend_from_slice(&self.voucher_signature);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let voucher = NodeId(reader.read_hash()?);
        let vouchee = NodeId(reader.read_hash()?);
        let type_byte = reader.read_u8()?;
        let key_type = KeyType::from_u8(type_byte)
            .ok_or_else(|| Error::InvalidFormat(format!("unknown key type {type_byte}")))?;
        let key_count = reader.read_u32()?;
        let vouch_timestamp = reader.read_u64()?;
        let statement = reader.read_string()?;
        let voucher_signature: SignatureBytes = reader
            .read_bytes(64)?
            .try_into()
            .map_err(|_| Error::InvalidFormat("bad signature".into()))?;
        Ok(Self {
            voucher,
            vouchee,
            key_type,
            key_count,
            vouch_timestamp,
            statement,
            voucher_signature,
        })
    }
}

/// Record of an executed vouch, kept for accountability
#[derive(Debug, Clone)]
pub struct VouchRecord {
    pub voucher: NodeId,
    pub vouchee: NodeId,
    pub key_type: KeyType,
    pub vouched_at: u64,
    pub still_active: bool,
}

/// Minimum reputation to vouch for another node
pub const MIN_REPUTATION_TO_VOUCH: i32 = 100;
/// A node must hold at least this many keys of a type to transfer one
pub const MIN_KEYS_TO_TRANSFER: u32 = 2;
/// Maximum simultaneously active vouches per voucher
pub const MAX_ACTIVE_VOUCHES: usize = 5;
/// Maximum vouches a node may create per epoch
pub const MAX_VOUCHES_PER_EPOCH: u32 = 3;

/// Key inventory: counts and grant metadata per `(owner, key type)`
#[derive(Default)]
pub struct KeyRegistry {
    grants: HashMap<(NodeId, KeyType), Vec<KeyGrant>>,
    vouch_records: Vec<VouchRecord>,
    vouches_this_epoch: HashMap<(NodeId, u64), u32>,
    transfer_history: Vec<KeyTransfer>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit `count` keys to an owner
    pub fn add_keys(
        &mut self,
        owner: NodeId,
        key_type: KeyType,
        count: u32,
        source: IssuanceMethod,
        now: u64,
    ) {
        let grants = self.grants.entry((owner, key_type)).or_default();
        for _ in 0..count {
            grants.push(KeyGrant {
                issued_at: now,
                last_used_at: now,
                source,
            });
        }
        log::debug!("credited {count} {} key(s) to {owner:?}", key_type.as_str());
    }

    /// Debit up to `count` keys, oldest grants first. Returns how many were
    /// actually removed.
    pub fn remove_keys(&mut self, owner: &NodeId, key_type: KeyType, count: u32) -> u32 {
        let Some(grants) = self.grants.get_mut(&(*owner, key_type)) else {
            return 0;
        };
        grants.sort_by_key(|g| g.issued_at);
        let removed = (count as usize).min(grants.len());
        grants.drain(..removed);
        removed as u32
    }

    pub fn count(&self, owner: &NodeId, key_type: KeyType) -> u32 {
        self.grants
            .get(&(*owner, key_type))
            .map(|g| g.len() as u32)
            .unwrap_or(0)
    }

    pub fn total_keys(&self, owner: &NodeId) -> u32 {
        KeyType::ALL
            .iter()
            .map(|&t| self.count(owner, t))
            .sum()
    }

    pub fn grants(&self, owner: &NodeId, key_type: KeyType) -> &[KeyGrant] {
        self.grants
            .get(&(*owner, key_type))
            .map(|g| g.as_slice())
            .unwrap_or(&[])
    }

    /// Refresh the last-used timestamp on every grant of a type
    pub fn mark_used(&mut self, owner: &NodeId, key_type: KeyType, now: u64) {
        if let Some(grants) = self.grants.get_mut(&(*owner, key_type)) {
            for grant in grants.iter_mut() {
                grant.last_used_at = now;
            }
        }
    }

    // --- transfers ---

    pub fn can_transfer(&self, from: &NodeId, key_type: KeyType) -> bool {
        self.count(from, key_type) >= MIN_KEYS_TO_TRANSFER
    }

    /// Create a signed transfer; the caller still has to `execute_transfer`
    /// and emit the KEY_TRANSFERRED event
    pub fn create_transfer(
        &self,
        from_keypair: &SigningKeypair,
        to_node: NodeId,
        key_type: KeyType,
        reason: &str,
        now: u64,
    ) -> Result<KeyTransfer> {
        let from_node = from_keypair.node_id();
        if !self.can_transfer(&from_node, key_type) {
            return Err(Error::KeyQuotaExceeded(format!(
                "need at least {MIN_KEYS_TO_TRANSFER} {} keys to transfer",
                key_type.as_str()
            )));
        }
        let bytes = KeyTransfer::signable_bytes(&from_node, &to_node, key_type, now, reason);
        Ok(KeyTransfer {
            from_node,
            to_node,
            key_type,
            transfer_timestamp: now,
            reason: reason.to_string(),
            from_signature: from_keypair.sign(&bytes),
        })
    }

    /// Apply a verified transfer: debit sender, credit recipient
    pub fn execute_transfer(
        &mut self,
        transfer: &KeyTransfer,
        from_public_key: &PublicKeyBytes,
    ) -> Result<()> {
        if !transfer.verify(from_public_key) {
            return Err(Error::VerificationFailed);
        }
        if !self.can_transfer(&transfer.from_node, transfer.key_type) {
            return Err(Error::KeyQuotaExceeded("sender below transfer minimum".into()));
        }
        self.remove_keys(&transfer.from_node, transfer.key_type, 1);
        self.add_keys(
            transfer.to_node,
            transfer.key_type,
            1,
            IssuanceMethod::Transferred,
            transfer.transfer_timestamp,
        );
        self.transfer_history.push(transfer.clone());
        log::info!(
            "transferred 1 {} key {:?} -> {:?}",
            transfer.key_type.as_str(),
            transfer.from_node,
            transfer.to_node
        );
        Ok(())
    }

    pub fn transfer_history(&self, node: &NodeId) -> Vec<&KeyTransfer> {
        self.transfer_history
            .iter()
            .filter(|t| t.from_node == *node || t.to_node == *node)
            .collect()
    }

    // --- vouching ---

    pub fn active_vouch_count(&self, voucher: &NodeId) -> usize {
        self.vouch_records
            .iter()
            .filter(|v| v.voucher == *voucher && v.still_active)
            .count()
    }

    /// A voucher needs reputation >= 100, fewer than 5 active vouches, and
    /// fewer than 3 vouches this epoch
    pub fn can_vouch(&self, voucher: &NodeId, voucher_reputation: i32, epoch: u64) -> bool {
        if voucher_reputation < MIN_REPUTATION_TO_VOUCH {
            return false;
        }
        if self.active_vouch_count(voucher) >= MAX_ACTIVE_VOUCHES {
            return false;
        }
        let this_epoch = self
            .vouches_this_epoch
            .get(&(*voucher, epoch))
            .copied()
            .unwrap_or(0);
        this_epoch < MAX_VOUCHES_PER_EPOCH
    }

    pub fn create_vouch(
        &self,
        voucher_keypair: &SigningKeypair,
        vouchee: NodeId,
        key_type: KeyType,
        key_count: u32,
        statement: &str,
        voucher_reputation: i32,
        now: u64,
        epoch: u64,
    ) -> Result<KeyVouch> {
        let voucher = voucher_keypair.node_id();
        if !self.can_vouch(&voucher, voucher_reputation, epoch) {
            return Err(Error::ReputationTooLow {
                score: voucher_reputation,
                required: MIN_REPUTATION_TO_VOUCH,
            });
        }
        let bytes =
            KeyVouch::signable_bytes(&voucher, &vouchee, key_type, key_count, now, statement);
        Ok(KeyVouch {
            voucher,
            vouchee,
            key_type,
            key_count,
            vouch_timestamp: now,
            statement: statement.to_string(),
            voucher_signature: voucher_keypair.sign(&bytes),
        })
    }

    /// Apply a verified vouch: credit the vouchee and record the vouch
    pub fn execute_vouch(
        &mut self,
        vouch: &KeyVouch,
        voucher_public_key: &PublicKeyBytes,
        epoch: u64,
    ) -> Result<()> {
        if !vouch.verify(voucher_public_key) {
            return Err(Error::VerificationFailed);
        }
        self.add_keys(
            vouch.vouchee,
            vouch.key_type,
            vouch.key_count,
            IssuanceMethod::Vouched,
            vouch.vouch_timestamp,
        );
        self.vouch_records.push(VouchRecord {
            voucher: vouch.voucher,
            vouchee: vouch.vouchee,
            key_type: vouch.key_type,
            vouched_at: vouch.vouch_timestamp,
            still_active: true,
        });
        *self
            .vouches_this_epoch
            .entry((vouch.voucher, epoch))
            .or_insert(0) += 1;
        Ok(())
    }

    pub fn vouches_by(&self, voucher: &NodeId) -> Vec<&VouchRecord> {
        self.vouch_records
            .iter()
            .filter(|v| v.voucher == *voucher)
            .collect()
    }

    pub fn vouches_for(&self, vouchee: &NodeId) -> Vec<&VouchRecord> {
        self.vouch_records
            .iter()
            .filter(|v| v.vouchee == *vouchee)
            .collect()
    }

    /// Mark a vouch inactive (vouchee left or vouch expired)
    pub fn deactivate_vouch(&mut self, voucher: &NodeId, vouchee: &NodeId) {
        for record in &mut self.vouch_records {
            if record.voucher == *voucher && record.vouchee == *vouchee {
                record.still_active = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId([byte; 32])
    }

    #[test]
    fn test_add_and_count() {
        let mut registry = KeyRegistry::new();
        registry.add_keys(node(1), KeyType::Service, 3, IssuanceMethod::Pow, 100);

        assert_eq!(registry.count(&node(1), KeyType::Service), 3);
        assert_eq!(registry.count(&node(1), KeyType::Network), 0);
        assert_eq!(registry.total_keys(&node(1)), 3);
    }

    #[test]
    fn test_remove_oldest_first() {
        let mut registry = KeyRegistry::new();
        registry.add_keys(node(1), KeyType::Service, 1, IssuanceMethod::Pow, 100);
        registry.add_keys(node(1), KeyType::Service, 1, IssuanceMethod::Pow, 200);

        assert_eq!(registry.remove_keys(&node(1), KeyType::Service, 1), 1);
        let remaining = registry.grants(&node(1), KeyType::Service);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].issued_at, 200);
    }

    #[test]
    fn test_remove_more_than_held() {
        let mut registry = KeyRegistry::new();
        registry.add_keys(node(1), KeyType::Routing, 2, IssuanceMethod::Postake, 100);
        assert_eq!(registry.remove_keys(&node(1), KeyType::Routing, 5), 2);
        assert_eq!(registry.count(&node(1), KeyType::Routing), 0);
    }

    #[test]
    fn test_transfer_requires_two_keys() {
        let keypair = SigningKeypair::generate();
        let mut registry = KeyRegistry::new();
        registry.add_keys(keypair.node_id(), KeyType::Network, 1, IssuanceMethod::Pow, 100);

        assert!(registry
            .create_transfer(&keypair, node(9), KeyType::Network, "gift", 200)
            .is_err());

        registry.add_keys(keypair.node_id(), KeyType::Network, 1, IssuanceMethod::Pow, 150);
        assert!(registry
            .create_transfer(&keypair, node(9), KeyType::Network, "gift", 200)
            .is_ok());
    }

    #[test]
    fn test_transfer_round_trip() {
        let from = SigningKeypair::generate();
        let mut registry = KeyRegistry::new();
        registry.add_keys(from.node_id(), KeyType::Network, 2, IssuanceMethod::Pow, 100);

        let transfer = registry
            .create_transfer(&from, node(9), KeyType::Network, "gift", 200)
            .unwrap();
        registry
            .execute_transfer(&transfer, &from.public_key_bytes())
            .unwrap();

        assert_eq!(registry.count(&from.node_id(), KeyType::Network), 1);
        assert_eq!(registry.count(&node(9), KeyType::Network), 1);
        assert_eq!(
            registry.grants(&node(9), KeyType::Network)[0].source,
            IssuanceMethod::Transferred
        );

        // Serialized transfer survives the wire
        let decoded = KeyTransfer::from_bytes(&transfer.to_bytes()).unwrap();
        assert_eq!(decoded, transfer);
    }

    #[test]
    fn test_transfer_forged_signature_rejected() {
        let from = SigningKeypair::generate();
        let other = SigningKeypair::generate();
        let mut registry = KeyRegistry::new();
        registry.add_keys(from.node_id(), KeyType::Network, 2, IssuanceMethod::Pow, 100);

        let transfer = registry
            .create_transfer(&from, node(9), KeyType::Network, "gift", 200)
            .unwrap();
        assert!(registry
            .execute_transfer(&transfer, &other.public_key_bytes())
            .is_err());
    }

    #[test]
    fn test_vouch_requires_reputation() {
        let voucher = SigningKeypair::generate();
        let registry = KeyRegistry::new();

        assert!(registry
            .create_vouch(&voucher, node(9), KeyType::Node, 1, "known good", 99, 100, 1)
            .is_err());
        assert!(registry
            .create_vouch(&voucher, node(9), KeyType::Node, 1, "known good", 100, 100, 1)
            .is_ok());
    }

    #[test]
    fn test_vouch_active_limit() {
        let voucher = SigningKeypair::generate();
        let mut registry = KeyRegistry::new();

        for i in 0..MAX_ACTIVE_VOUCHES {
            // Spread over epochs to stay under the per-epoch cap
            let epoch = i as u64;
            let vouch = registry
                .create_vouch(&voucher, node(i as u8), KeyType::Node, 1, "", 200, 100, epoch)
                .unwrap();
            registry
                .execute_vouch(&vouch, &voucher.public_key_bytes(), epoch)
                .unwrap();
        }

        assert!(!registry.can_vouch(&voucher.node_id(), 200, 99));

        // Deactivating frees a slot
        registry.deactivate_vouch(&voucher.node_id(), &node(0));
        assert!(registry.can_vouch(&voucher.node_id(), 200, 99));
    }

    #[test]
    fn test_vouch_per_epoch_cap() {
        let voucher = SigningKeypair::generate();
        let mut registry = KeyRegistry::new();

        for i in 0..MAX_VOUCHES_PER_EPOCH {
            let vouch = registry
                .create_vouch(&voucher, node(i as u8), KeyType::Node, 1, "", 200, 100, 7)
                .unwrap();
            registry
                .execute_vouch(&vouch, &voucher.public_key_bytes(), 7)
                .unwrap();
        }

        assert!(!registry.can_vouch(&voucher.node_id(), 200, 7));
        // A different epoch resets the cap
        assert!(registry.can_vouch(&voucher.node_id(), 200, 8));
    }

    #[test]
    fn test_vouch_wire_round_trip() {
        let voucher = SigningKeypair::generate();
        let registry = KeyRegistry::new();
        let vouch = registry
            .create_vouch(&voucher, node(9), KeyType::Node, 1, "solid", 150, 100, 1)
            .unwrap();

        let decoded = KeyVouch::from_bytes(&vouch.to_bytes()).unwrap();
        assert_eq!(decoded, vouch);
        assert!(decoded.verify(&voucher.public_key_bytes()));
    }

    #[test]
    fn test_vouch_credits_vouchee() {
        let voucher = SigningKeypair::generate();
        let mut registry = KeyRegistry::new();

        let vouch = registry
            .create_vouch(&voucher, node(9), KeyType::Service, 1, "hosts well", 150, 100, 1)
            .unwrap();
        registry
            .execute_vouch(&vouch, &voucher.public_key_bytes(), 1)
            .unwrap();

        assert_eq!(registry.count(&node(9), KeyType::Service), 1);
        assert_eq!(registry.vouches_for(&node(9)).len(), 1);
        assert_eq!(registry.vouches_by(&voucher.node_id()).len(), 1);
    }
}
