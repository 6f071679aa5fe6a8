//! Human identities
//!
//! A pseudonymous identity above node level: its id is the BLAKE3 digest
//! of its own Ed25519 public key, it can be associated with several
//! nodes, and it survives node churn. Creation, rotation, and revocation
//! are ledger facts (IDENTITY_CREATED / ROTATED / REVOKED).

use hashbrown::{HashMap, HashSet};

use crate::common::{HumanId, NodeId};
use crate::crypto::{self, PublicKeyBytes, SignatureBytes, SigningKeypair};
use crate::error::{Error, Result};

/// A pseudonymous human identity record
#[derive(Debug, Clone)]
pub struct HumanIdentity {
    pub human_id: HumanId,
    pub public_key: PublicKeyBytes,
    pub created_at: u64,
    pub display_name: Option<String>,
    pub associated_nodes: HashSet<NodeId>,
    pub is_active: bool,
}

impl HumanIdentity {
    pub fn new(public_key: PublicKeyBytes, created_at: u64) -> Self {
        Self {
            human_id: HumanId(*blake3::hash(&public_key).as_bytes()),
            public_key,
            created_at,
            display_name: None,
            associated_nodes: HashSet::new(),
            is_active: true,
        }
    }

    pub fn verify_signature(&self, message: &[u8], signature: &SignatureBytes) -> bool {
        crypto::verify_signature(&self.public_key, message, signature).is_ok()
    }
}

/// Proof that the holder still controls an identity's key
#[derive(Debug, Clone)]
pub struct ContinuityProof {
    pub human_id: HumanId,
    pub challenge: [u8; 32],
    pub node_id: NodeId,
    pub timestamp: u64,
    pub signature: SignatureBytes,
}

impl ContinuityProof {
    fn signable_bytes(
        human_id: &HumanId,
        challenge: &[u8; 32],
        node_id: &NodeId,
        timestamp: u64,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(human_id.as_bytes());
        out.extend_from_slice(challenge);
        out.extend_from_slice(node_id.as_bytes());
        out.extend_from_slice(&timestamp.to_le_bytes());
        out
    }

    pub fn create(
        identity_keypair: &SigningKeypair,
        human_id: HumanId,
        challenge: [u8; 32],
        node_id: NodeId,
        now: u64,
    ) -> Self {
        let bytes = Self::signable_bytes(&human_id, &challenge, &node_id, now);
        Self {
            human_id,
            challenge,
            node_id,
            timestamp: now,
            signature: identity_keypair.sign(&bytes),
        }
    }

    pub fn verify(&self, expected_key: &PublicKeyBytes) -> bool {
        let bytes =
            Self::signable_bytes(&self.human_id, &self.challenge, &self.node_id, self.timestamp);
        crypto::verify_signature(expected_key, &bytes, &self.signature).is_ok()
    }
}

/// Registry of known human identities
#[derive(Default)]
pub struct HumanIdentityRegistry {
    identities: HashMap<HumanId, HumanIdentity>,
    by_node: HashMap<NodeId, HumanId>,
}

impl HumanIdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new identity from its public key (IDENTITY_CREATED)
    pub fn create(&mut self, public_key: PublicKeyBytes, now: u64) -> HumanId {
        let identity = HumanIdentity::new(public_key, now);
        let id = identity.human_id;
        self.identities.insert(id, identity);
        log::info!("registered human identity {id:?}");
        id
    }

    /// Rotate an identity to a new key (IDENTITY_ROTATED). Associated
    /// nodes carry over; the id changes with the key.
    pub fn rotate(
        &mut self,
        old_id: &HumanId,
        new_public_key: PublicKeyBytes,
        now: u64,
    ) -> Result<HumanId> {
        let old = self
            .identities
            .get_mut(old_id)
            .ok_or_else(|| Error::KeyNotFound(old_id.to_hex()))?;
        old.is_active = false;
        let nodes = old.associated_nodes.clone();
        let display_name = old.display_name.clone();

        let mut rotated = HumanIdentity::new(new_public_key, now);
        rotated.associated_nodes = nodes.clone();
        rotated.display_name = display_name;
        let new_id = rotated.human_id;
        for node in &nodes {
            self.by_node.insert(*node, new_id);
        }
        self.identities.insert(new_id, rotated);
        log::info!("rotated human identity {old_id:?} -> {new_id:?}");
        Ok(new_id)
    }

    /// Deactivate an identity (IDENTITY_REVOKED)
    pub fn revoke(&mut self, id: &HumanId) -> Result<()> {
        let identity = self
            .identities
            .get_mut(id)
            .ok_or_else(|| Error::KeyNotFound(id.to_hex()))?;
        identity.is_active = false;
        for node in identity.associated_nodes.clone() {
            self.by_node.remove(&node);
        }
        Ok(())
    }

    pub fn associate_node(&mut self, id: &HumanId, node: NodeId) -> Result<()> {
        let identity = self
            .identities
            .get_mut(id)
            .ok_or_else(|| Error::KeyNotFound(id.to_hex()))?;
        if !identity.is_active {
            return Err(Error::KeyExpired);
        }
        identity.associated_nodes.insert(node);
        self.by_node.insert(node, *id);
        Ok(())
    }

    pub fn set_display_name(&mut self, id: &HumanId, name: &str) -> Result<()> {
        let identity = self
            .identities
            .get_mut(id)
            .ok_or_else(|| Error::KeyNotFound(id.to_hex()))?;
        identity.display_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, id: &HumanId) -> Option<&HumanIdentity> {
        self.identities.get(id)
    }

    pub fn by_node(&self, node: &NodeId) -> Option<&HumanIdentity> {
        self.by_node.get(node).and_then(|id| self.identities.get(id))
    }

    pub fn count(&self) -> usize {
        self.identities.len()
    }
}
