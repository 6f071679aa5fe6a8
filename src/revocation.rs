//! Token revocation
//!
//! Revocations are signed facts propagated over their own gossip family.
//! A token is revoked iff a matching entry exists for its
//! `(node, capability, context)` and the token was issued before the
//! revocation. Entries expire after 30 days; a node may carry at most 100
//! active revocations, which keeps per-request checks cheap.

use hashbrown::{HashMap, HashSet};

use crate::access::{Capability, CapabilityToken};
use crate::common::{constants, Hash256, NodeId};
use crate::crypto::{self, blake3_hash_parts, PublicKeyBytes, SignatureBytes, SigningKeypair};
use crate::error::{Error, Result};

/// Default revocation lifetime
pub const REVOCATION_EXPIRY_SECONDS: u64 = 30 * 24 * 3600;
/// Active revocations allowed per node
pub const MAX_REVOCATIONS_PER_NODE: usize = 100;

/// Why a token was revoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RevocationReason {
    ManualRevocation = 0,
    CompromisedKey = 1,
    PolicyViolation = 2,
    AbuseDetected = 3,
    ExpiredCredentials = 4,
    NetworkRemoval = 5,
    ReputationLoss = 6,
}

impl RevocationReason {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ManualRevocation),
            1 => Some(Self::CompromisedKey),
            2 => Some(Self::PolicyViolation),
            3 => Some(Self::AbuseDetected),
            4 => Some(Self::ExpiredCredentials),
            5 => Some(Self::NetworkRemoval),
            6 => Some(Self::ReputationLoss),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualRevocation => "manual revocation",
            Self::CompromisedKey => "compromised key",
            Self::PolicyViolation => "policy violation",
            Self::AbuseDetected => "abuse detected",
            Self::ExpiredCredentials => "expired credentials",
            Self::NetworkRemoval => "network removal",
            Self::ReputationLoss => "reputation loss",
        }
    }
}

/// One signed revocation fact
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRevocation {
    pub node_id: NodeId,
    pub capability: Capability,
    pub reason: RevocationReason,
    pub revoked_at: u64,
    pub revoker: NodeId,
    pub context: Vec<u8>,
    pub signature: SignatureBytes,
}

impl TokenRevocation {
    fn signable_bytes(
        node_id: &NodeId,
        capability: Capability,
        reason: RevocationReason,
        revoked_at: u64,
        revoker: &NodeId,
        context: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(node_id.as_bytes());
        out.push(capability as u8);
        out.push(reason as u8);
        out.extend_from_slice(&revoked_at.to_le_bytes());
        out.extend_from_slice(revoker.as_bytes());
        out.extend_from_slice(&(context.len() as u32).to_le_bytes());
        out.extend_from_slice(context);
        out
    }

    /// Create and sign a revocation
    pub fn create(
        revoker_keypair: &SigningKeypair,
        node_id: NodeId,
        capability: Capability,
        reason: RevocationReason,
        context: Vec<u8>,
        now: u64,
    ) -> Self {
        let revoker = revoker_keypair.node_id();
        let bytes =
            Self::signable_bytes(&node_id, capability, reason, now, &revoker, &context);
        Self {
            node_id,
            capability,
            reason,
            revoked_at: now,
            revoker,
            context,
            signature: revoker_keypair.sign(&bytes),
        }
    }

    pub fn verify(&self, revoker_public_key: &PublicKeyBytes) -> bool {
        let bytes = Self::signable_bytes(
            &self.node_id,
            self.capability,
            self.reason,
            self.revoked_at,
            &self.revoker,
            &self.context,
        );
        crypto::verify_signature(revoker_public_key, &bytes, &self.signature).is_ok()
    }

    /// Deduplication id over the revocation's identifying fields
    pub fn id(&self) -> Hash256 {
        blake3_hash_parts(&[
            self.node_id.as_bytes(),
            &[self.capability as u8],
            &[self.reason as u8],
            &self.revoked_at.to_le_bytes(),
            self.revoker.as_bytes(),
            &self.context,
        ])
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.revoked_at) >= REVOCATION_EXPIRY_SECONDS
    }

    /// Does this revocation hit the given token?
    pub fn matches_token(&self, token: &CapabilityToken) -> bool {
        self.node_id == token.node_id
            && self.capability == token.capability
            && self.context == token.context
            && token.issued_at < self.revoked_at
    }
}

/// Batch of revocations for gossip, signed by the sender
#[derive(Debug, Clone)]
pub struct RevocationListUpdate {
    pub timestamp: u64,
    pub source_node: NodeId,
    pub revocations: Vec<TokenRevocation>,
}

/// The revocation list with its indices
#[derive(Default)]
pub struct RevocationManager {
    revocations: HashMap<Hash256, TokenRevocation>,
    by_node: HashMap<NodeId, HashSet<Hash256>>,
    by_capability: HashMap<Capability, HashSet<Hash256>>,
}

impl RevocationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a locally-created revocation; returns it for gossip
    pub fn revoke_token(
        &mut self,
        revoker_keypair: &SigningKeypair,
        node_id: NodeId,
        capability: Capability,
        reason: RevocationReason,
        context: Vec<u8>,
        now: u64,
    ) -> TokenRevocation {
        let revocation =
            TokenRevocation::create(revoker_keypair, node_id, capability, reason, context, now);
        self.insert(revocation.clone());
        log::info!(
            "revoked {capability:?} for {node_id:?} ({})",
            reason.as_str()
        );
        revocation
    }

    fn insert(&mut self, revocation: TokenRevocation) -> bool {
        let id = revocation.id();
        if self.revocations.contains_key(&id) {
            return false;
        }
        self.by_node.entry(revocation.node_id).or_default().insert(id);
        self.by_capability
            .entry(revocation.capability)
            .or_default()
            .insert(id);
        self.revocations.insert(id, revocation);
        true
    }

    /// Accept a gossiped revocation: the signature must verify, the
    /// timestamp must be within clock tolerance, and the target node must
    /// not already carry its quota of active revocations
    pub fn process_revocation(
        &mut self,
        revocation: TokenRevocation,
        revoker_public_key: &PublicKeyBytes,
        now: u64,
    ) -> Result<bool> {
        if !revocation.verify(revoker_public_key) {
            return Err(Error::VerificationFailed);
        }
        if now.abs_diff(revocation.revoked_at) > constants::MAX_CLOCK_SKEW_SECONDS {
            return Err(Error::InvalidArgument(
                "revocation timestamp outside clock tolerance".into(),
            ));
        }
        if self.active_revocation_count(&revocation.node_id, now) >= MAX_REVOCATIONS_PER_NODE {
            return Err(Error::QuotaExceeded);
        }
        Ok(self.insert(revocation))
    }

    /// Apply a batch update; returns how many entries were new.
    /// Per-entry failures are logged and skipped.
    pub fn process_revocation_list(
        &mut self,
        update: &RevocationListUpdate,
        revoker_keys: &dyn Fn(&NodeId) -> Option<PublicKeyBytes>,
        now: u64,
    ) -> usize {
        let mut accepted = 0;
        for revocation in &update.revocations {
            let Some(key) = revoker_keys(&revocation.revoker) else {
                log::warn!("revocation from unknown revoker {:?}", revocation.revoker);
                continue;
            };
            match self.process_revocation(revocation.clone(), &key, now) {
                Ok(true) => accepted += 1,
                Ok(false) => {}
                Err(e) => log::warn!("rejected revocation: {e}"),
            }
        }
        accepted
    }

    /// Build an update carrying recent revocations for gossip
    pub fn create_update(
        &self,
        source_node: NodeId,
        since: u64,
        max_count: usize,
        now: u64,
    ) -> RevocationListUpdate {
        let mut revocations: Vec<TokenRevocation> = self
            .revocations
            .values()
            .filter(|r| r.revoked_at >= since && !r.is_expired(now))
            .cloned()
            .collect();
        revocations.sort_by_key(|r| r.revoked_at);
        revocations.truncate(max_count);
        RevocationListUpdate {
            timestamp: now,
            source_node,
            revocations,
        }
    }

    /// Is this token dead?
    pub fn is_token_revoked(&self, token: &CapabilityToken, now: u64) -> bool {
        let Some(ids) = self.by_node.get(&token.node_id) else {
            return false;
        };
        ids.iter()
            .filter_map(|id| self.revocations.get(id))
            .any(|r| !r.is_expired(now) && r.matches_token(token))
    }

    pub fn revocations_for(&self, node: &NodeId) -> Vec<&TokenRevocation> {
        self.by_node
            .get(node)
            .map(|ids| ids.iter().filter_map(|id| self.revocations.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn active_revocation_count(&self, node: &NodeId, now: u64) -> usize {
        self.by_node
            .get(node)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.revocations.get(id))
                    .filter(|r| !r.is_expired(now))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn revocation_count(&self) -> usize {
        self.revocations.len()
    }

    /// Drop expired entries from storage and indices
    pub fn cleanup_expired(&mut self, now: u64) {
        let expired: Vec<Hash256> = self
            .revocations
            .iter()
            .filter(|(_, r)| r.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(revocation) = self.revocations.remove(&id) {
                if let Some(ids) = self.by_node.get_mut(&revocation.node_id) {
                    ids.remove(&id);
                }
                if let Some(ids) = self.by_capability.get_mut(&revocation.capability) {
                    ids.remove(&id);
                }
            }
        }
    }
}
