//! Networks: invitation-only replica clusters
//!
//! A Network binds exactly one Thing to a member set with roles. Members
//! join by invitation (signed, 24-hour TTL), hold a reliability score, and
//! count toward quorum only while active with a complete replica. Health
//! is classified against the `(min, target, max)` quorum policy.

use hashbrown::HashMap;
use std::path::Path;

use crate::common::{constants, ContentHash, NetworkId, NodeId};
use crate::crypto::{self, PublicKeyBytes, SignatureBytes, SigningKeypair};
use crate::error::{Error, Result};
use crate::event::ByteReader;
use crate::state::MemberRole;

/// Members silent for this long are inactive
pub const MEMBER_TIMEOUT_SECONDS: u64 = 3600;
/// Below this reliability a member is not a replication candidate
pub const MIN_RELIABILITY_SCORE: f32 = 0.5;
/// Default invitation lifetime
pub const INVITATION_TTL_SECONDS: u64 = 24 * 3600;

/// Stable wire byte for a member role
fn role_code(role: MemberRole) -> u8 {
    match role {
        MemberRole::Founder => 0,
        MemberRole::Full => 1,
        MemberRole::Pending => 2,
        MemberRole::Observer => 3,
    }
}

fn role_from_code(code: u8) -> Option<MemberRole> {
    match code {
        0 => Some(MemberRole::Founder),
        1 => Some(MemberRole::Full),
        2 => Some(MemberRole::Pending),
        3 => Some(MemberRole::Observer),
        _ => None,
    }
}

/// One participant in a network
#[derive(Debug, Clone)]
pub struct NetworkMember {
    pub node_id: NodeId,
    pub public_key: PublicKeyBytes,
    pub role: MemberRole,
    pub joined_timestamp: u64,
    pub last_seen_timestamp: u64,
    pub has_complete_replica: bool,
    pub reliability_score: f32,
}

impl NetworkMember {
    pub fn new(node_id: NodeId, public_key: PublicKeyBytes, role: MemberRole, now: u64) -> Self {
        Self {
            node_id,
            public_key,
            role,
            joined_timestamp: now,
            last_seen_timestamp: now,
            has_complete_replica: false,
            reliability_score: 1.0,
        }
    }

    pub fn is_active(&self, now: u64) -> bool {
        now.saturating_sub(self.last_seen_timestamp) < MEMBER_TIMEOUT_SECONDS
    }

    /// A hosting member: counts toward replica quorum
    pub fn is_replica(&self) -> bool {
        matches!(self.role, MemberRole::Founder | MemberRole::Full)
    }
}

/// Signed invitation to join a network
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInvitation {
    pub network_id: NetworkId,
    pub inviter_id: NodeId,
    pub invitee_id: NodeId,
    pub proposed_role: MemberRole,
    pub expires_timestamp: u64,
    pub signature: SignatureBytes,
}

impl NetworkInvitation {
    fn signable_bytes(
        network_id: &NetworkId,
        inviter: &NodeId,
        invitee: &NodeId,
        role: MemberRole,
        expires: u64,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(network_id.as_bytes());
        out.extend_from_slice(inviter.as_bytes());
        out.extend_from_slice(invitee.as_bytes());
        out.push(role_code(role));
        out.extend_from_slice(&expires.to_le_bytes());
        out
    }

    pub fn verify(&self, inviter_public_key: &PublicKeyBytes, now: u64) -> bool {
        if now >= self.expires_timestamp {
            return false;
        }
        let bytes = Self::signable_bytes(
            &self.network_id,
            &self.inviter_id,
            &self.invitee_id,
            self.proposed_role,
            self.expires_timestamp,
        );
        crypto::verify_signature(inviter_public_key, &bytes, &self.signature).is_ok()
    }
}

/// Replica-count policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkQuorum {
    pub min_replicas: usize,
    pub target_replicas: usize,
    pub max_replicas: usize,
}

impl Default for NetworkQuorum {
    fn default() -> Self {
        Self {
            min_replicas: 3,
            target_replicas: 5,
            max_replicas: 10,
        }
    }
}

impl NetworkQuorum {
    /// Clamp to the protocol bounds
    pub fn clamped(mut self) -> Self {
        self.min_replicas = self.min_replicas.max(constants::MIN_NETWORK_QUORUM);
        self.max_replicas = self.max_replicas.min(constants::MAX_NETWORK_QUORUM);
        self.target_replicas = self
            .target_replicas
            .clamp(self.min_replicas, self.max_replicas);
        self
    }
}

/// Health of a network relative to its quorum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NetworkHealth {
    Critical = 0,
    Degraded = 1,
    Healthy = 2,
    Optimal = 3,
}

impl NetworkHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::Degraded => "DEGRADED",
            Self::Healthy => "HEALTHY",
            Self::Optimal => "OPTIMAL",
        }
    }
}

/// A replica cluster hosting exactly one Thing
#[derive(Debug, Clone)]
pub struct Network {
    network_id: NetworkId,
    thing_hash: ContentHash,
    members: Vec<NetworkMember>,
    quorum: NetworkQuorum,
    created_timestamp: u64,
    pending_invitations: Vec<NetworkInvitation>,
    /// When the healthy count first dropped below quorum minimum
    below_min_since: Option<u64>,
}

impl Network {
    pub fn new(network_id: NetworkId, thing_hash: ContentHash, now: u64) -> Self {
        Self {
            network_id,
            thing_hash,
            members: Vec::new(),
            quorum: NetworkQuorum::default(),
            created_timestamp: now,
            pending_invitations: Vec::new(),
            below_min_since: None,
        }
    }

    pub fn id(&self) -> NetworkId {
        self.network_id
    }

    pub fn thing_hash(&self) -> ContentHash {
        self.thing_hash
    }

    pub fn created_at(&self) -> u64 {
        self.created_timestamp
    }

    pub fn set_quorum(&mut self, quorum: NetworkQuorum) {
        self.quorum = quorum.clamped();
    }

    pub fn quorum(&self) -> NetworkQuorum {
        self.quorum
    }

    // --- membership ---

    pub fn add_member(&mut self, member: NetworkMember) -> bool {
        if self.members.iter().any(|m| m.node_id == member.node_id) {
            return false;
        }
        log::debug!(
            "network {:?}: +member {:?} ({})",
            self.network_id,
            member.node_id,
            member.role.as_str()
        );
        self.members.push(member);
        true
    }

    pub fn remove_member(&mut self, node_id: &NodeId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.node_id != *node_id);
        before != self.members.len()
    }

    pub fn member(&self, node_id: &NodeId) -> Option<&NetworkMember> {
        self.members.iter().find(|m| m.node_id == *node_id)
    }

    pub fn members(&self) -> &[NetworkMember] {
        &self.members
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn founder(&self) -> Option<&NetworkMember> {
        self.members.iter().find(|m| m.role == MemberRole::Founder)
    }

    /// Members that currently count toward the replica quorum: active
    /// hosting roles with a complete replica
    pub fn healthy_replica_count(&self, now: u64) -> usize {
        self.members
            .iter()
            .filter(|m| m.is_replica() && m.is_active(now) && m.has_complete_replica)
            .count()
    }

    // --- invitations ---

    /// A founder or FULL member signs an invitation
    pub fn create_invitation(
        &mut self,
        inviter_keypair: &SigningKeypair,
        invitee_id: NodeId,
        role: MemberRole,
        now: u64,
    ) -> Result<NetworkInvitation> {
        let inviter_id = inviter_keypair.node_id();
        let inviter = self
            .member(&inviter_id)
            .ok_or_else(|| Error::PermissionDenied("inviter is not a member".into()))?;
        if !matches!(inviter.role, MemberRole::Founder | MemberRole::Full) {
            return Err(Error::PermissionDenied(
                "only founder or full members may invite".into(),
            ));
        }

        let expires = now + INVITATION_TTL_SECONDS;
        let bytes = NetworkInvitation::signable_bytes(
            &self.network_id,
            &inviter_id,
            &invitee_id,
            role,
            expires,
        );
        let invitation = NetworkInvitation {
            network_id: self.network_id,
            inviter_id,
            invitee_id,
            proposed_role: role,
            expires_timestamp: expires,
            signature: inviter_keypair.sign(&bytes),
        };
        self.pending_invitations.push(invitation.clone());
        Ok(invitation)
    }

    /// Accept an invitation: verified against the inviter's key and TTL,
    /// then the invitee joins under the proposed role
    pub fn accept_invitation(
        &mut self,
        invitation: &NetworkInvitation,
        invitee_public_key: PublicKeyBytes,
        now: u64,
    ) -> Result<()> {
        if invitation.network_id != self.network_id {
            return Err(Error::InvalidArgument("invitation for another network".into()));
        }
        let inviter = self
            .member(&invitation.inviter_id)
            .ok_or_else(|| Error::PermissionDenied("inviter no longer a member".into()))?;
        if !invitation.verify(&inviter.public_key, now) {
            return Err(Error::VerificationFailed);
        }
        if self.member_count() >= self.quorum.max_replicas {
            return Err(Error::QuotaExceeded);
        }

        let member = NetworkMember::new(
            invitation.invitee_id,
            invitee_public_key,
            invitation.proposed_role,
            now,
        );
        if !self.add_member(member) {
            return Err(Error::InvalidArgument("already a member".into()));
        }
        self.pending_invitations
            .retain(|i| i.invitee_id != invitation.invitee_id);
        Ok(())
    }

    pub fn cleanup_expired_invitations(&mut self, now: u64) {
        self.pending_invitations
            .retain(|i| now < i.expires_timestamp);
    }

    pub fn pending_invitation_count(&self) -> usize {
        self.pending_invitations.len()
    }

    // --- member liveness & reliability ---

    pub fn mark_member_active(&mut self, node_id: &NodeId, now: u64) {
        if let Some(member) = self.members.iter_mut().find(|m| m.node_id == *node_id) {
            member.last_seen_timestamp = now;
        }
    }

    pub fn mark_replica_complete(&mut self, node_id: &NodeId, complete: bool) {
        if let Some(member) = self.members.iter_mut().find(|m| m.node_id == *node_id) {
            member.has_complete_replica = complete;
        }
    }

    pub fn update_member_reliability(&mut self, node_id: &NodeId, score: f32) {
        if let Some(member) = self.members.iter_mut().find(|m| m.node_id == *node_id) {
            member.reliability_score = score.clamp(0.0, 1.0);
        }
    }

    // --- health ---

    /// Classify health from the healthy replica count
    pub fn health(&self, now: u64) -> NetworkHealth {
        let healthy = self.healthy_replica_count(now);
        if healthy < self.quorum.min_replicas {
            NetworkHealth::Critical
        } else if healthy < self.quorum.target_replicas {
            NetworkHealth::Degraded
        } else if healthy == self.quorum.target_replicas {
            if self.members.iter().all(|m| m.is_active(now)) {
                NetworkHealth::Optimal
            } else {
                NetworkHealth::Healthy
            }
        } else {
            NetworkHealth::Healthy
        }
    }

    /// Health check that also updates the below-minimum clock. Call from
    /// the periodic tick.
    pub fn observe_health(&mut self, now: u64) -> NetworkHealth {
        let health = self.health(now);
        if health == NetworkHealth::Critical {
            self.below_min_since.get_or_insert(now);
        } else {
            self.below_min_since = None;
        }
        health
    }

    pub fn is_healthy(&self, now: u64) -> bool {
        self.health(now) >= NetworkHealth::Healthy
    }

    // --- replication coordination ---

    /// Active, reliable members holding a complete replica
    pub fn replication_candidates(&self, now: u64) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|m| {
                m.is_replica()
                    && m.is_active(now)
                    && m.has_complete_replica
                    && m.reliability_score >= MIN_RELIABILITY_SCORE
            })
            .map(|m| m.node_id)
            .collect()
    }

    /// Best source: highest reliability, ties broken by node id so every
    /// node picks the same source
    pub fn select_best_source(&self, now: u64) -> Option<NodeId> {
        self.members
            .iter()
            .filter(|m| {
                m.is_replica()
                    && m.is_active(now)
                    && m.has_complete_replica
                    && m.reliability_score >= MIN_RELIABILITY_SCORE
            })
            .max_by(|a, b| {
                a.reliability_score
                    .partial_cmp(&b.reliability_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Reverse id order so max_by prefers the lexicographically
                    // smaller id on reliability ties
                    .then_with(|| b.node_id.cmp(&a.node_id))
            })
            .map(|m| m.node_id)
    }

    pub fn should_add_replicas(&self, now: u64) -> bool {
        self.health(now) < NetworkHealth::Healthy
            && self.member_count() < self.quorum.max_replicas
    }

    pub fn should_remove_replicas(&self) -> bool {
        self.member_count() > self.quorum.max_replicas
    }

    /// Lowest-reliability members beyond the cap, founder excluded
    pub fn select_nodes_for_removal(&self) -> Vec<NodeId> {
        if !self.should_remove_replicas() {
            return Vec::new();
        }
        let excess = self.member_count() - self.quorum.max_replicas;
        let mut candidates: Vec<&NetworkMember> = self
            .members
            .iter()
            .filter(|m| m.role != MemberRole::Founder)
            .collect();
        candidates.sort_by(|a, b| {
            a.reliability_score
                .partial_cmp(&b.reliability_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        candidates
            .into_iter()
            .take(excess)
            .map(|m| m.node_id)
            .collect()
    }

    /// The founder may disband once the network has sat below minimum
    /// quorum for a full epoch
    pub fn should_dissolve(&self, now: u64) -> bool {
        match self.below_min_since {
            Some(since) => now.saturating_sub(since) >= constants::EPOCH_DURATION_SECONDS,
            None => false,
        }
    }

    // --- persistence ---

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.network_id.as_bytes());
        out.extend_from_slice(self.thing_hash.as_bytes());
        out.extend_from_slice(&self.created_timestamp.to_le_bytes());
        out.extend_from_slice(&(self.quorum.min_replicas as u32).to_le_bytes());
        out.extend_from_slice(&(self.quorum.target_replicas as u32).to_le_bytes());
        out.extend_from_slice(&(self.quorum.max_replicas as u32).to_le_bytes());
        out.extend_from_slice(&(self.members.len() as u32).to_le_bytes());
        for member in &self.members {
            out.extend_from_slice(member.node_id.as_bytes());
            out.extend_from_slice(&member.public_key);
            out.push(role_code(member.role));
            out.extend_from_slice(&member.joined_timestamp.to_le_bytes());
            out.extend_from_slice(&member.last_seen_timestamp.to_le_bytes());
            out.push(member.has_complete_replica as u8);
            out.extend_from_slice(&member.reliability_score.to_le_bytes());
        }
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let network_id = NetworkId(reader.read_hash()?);
        let thing_hash = ContentHash(reader.read_hash()?);
        let created_timestamp = reader.read_u64()?;
        let quorum = NetworkQuorum {
            min_replicas: reader.read_u32()? as usize,
            target_replicas: reader.read_u32()? as usize,
            max_replicas: reader.read_u32()? as usize,
        };
        let member_count = reader.read_u32()? as usize;
        let mut members = Vec::with_capacity(member_count);
        for _ in 0..member_count {
            let node_id = NodeId(reader.read_hash()?);
            let public_key: PublicKeyBytes = reader.read_hash()?;
            let role_byte = reader.read_u8()?;
            let role = role_from_code(role_byte)
                .ok_or_else(|| Error::InvalidFormat(format!("unknown role byte {role_byte}")))?;
            let joined_timestamp = reader.read_u64()?;
            let last_seen_timestamp = reader.read_u64()?;
            let has_complete_replica = reader.read_u8()? != 0;
            let reliability_bytes: [u8; 4] = reader.read_bytes(4)?.try_into().unwrap();
            members.push(NetworkMember {
                node_id,
                public_key,
                role,
                joined_timestamp,
                last_seen_timestamp,
                has_complete_replica,
                reliability_score: f32::from_le_bytes(reliability_bytes),
            });
        }
        Ok(Self {
            network_id,
            thing_hash,
            members,
            quorum,
            created_timestamp,
            pending_invitations: Vec::new(),
            below_min_since: None,
        })
    }
}

/// All networks this node participates in
#[derive(Default)]
pub struct NetworkRegistry {
    networks: HashMap<NetworkId, Network>,
    next_network_counter: u64,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a network for a Thing; the id is derived from the Thing hash
    /// and a local creation counter
    pub fn create_network(&mut self, thing_hash: ContentHash, now: u64) -> NetworkId {
        let network_id = NetworkId::derive(&thing_hash, self.next_network_counter);
        self.next_network_counter += 1;
        self.networks
            .insert(network_id, Network::new(network_id, thing_hash, now));
        log::info!("created network {network_id:?} for thing {thing_hash:?}");
        network_id
    }

    pub fn add_network(&mut self, network: Network) -> bool {
        let id = network.id();
        self.networks.insert(id, network).is_none()
    }

    pub fn remove_network(&mut self, network_id: &NetworkId) -> bool {
        self.networks.remove(network_id).is_some()
    }

    pub fn network(&self, network_id: &NetworkId) -> Option<&Network> {
        self.networks.get(network_id)
    }

    pub fn network_mut(&mut self, network_id: &NetworkId) -> Option<&mut Network> {
        self.networks.get_mut(network_id)
    }

    pub fn all_networks(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    pub fn all_networks_mut(&mut self) -> impl Iterator<Item = &mut Network> {
        self.networks.values_mut()
    }

    pub fn networks_for_thing(&self, thing_hash: &ContentHash) -> Vec<&Network> {
        self.networks
            .values()
            .filter(|n| n.thing_hash() == *thing_hash)
            .collect()
    }

    pub fn network_count(&self) -> usize {
        self.networks.len()
    }

    pub fn healthy_network_count(&self, now: u64) -> usize {
        self.networks.values().filter(|n| n.is_healthy(now)).count()
    }

    /// Write each network to `<dir>/<network_hex>`
    pub fn save_to_disk(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for (id, network) in &self.networks {
            let path = dir.join(id.to_hex());
            std::fs::write(&path, network.serialize())
                .map_err(|e| Error::StorageWrite(format!("{}: {e}", path.display())))?;
        }
        Ok(())
    }

    pub fn load_from_disk(&mut self, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            return Ok(0);
        }
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let data = std::fs::read(entry.path())?;
            match Network::deserialize(&data) {
                Ok(network) => {
                    self.networks.insert(network.id(), network);
                    loaded += 1;
                }
                Err(e) => {
                    log::warn!("skipping corrupt network file {:?}: {e}", entry.path());
                }
            }
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId([byte; 32])
    }

    fn complete_member(byte: u8, role: MemberRole, now: u64) -> NetworkMember {
        let mut member = NetworkMember::new(node(byte), [byte; 32], role, now);
        member.has_complete_replica = true;
        member
    }

    fn network_with_replicas(count: u8, now: u64) -> Network {
        let mut network = Network::new(NetworkId([0xAA; 32]), ContentHash([0xBB; 32]), now);
        network.add_member(complete_member(1, MemberRole::Founder, now));
        for i in 2..=count {
            network.add_member(complete_member(i, MemberRole::Full, now));
        }
        network
    }

    #[test]
    fn test_health_ladder() {
        let now = 10_000;
        // Quorum (3, 5, 10)
        assert_eq!(network_with_replicas(2, now).health(now), NetworkHealth::Critical);
        assert_eq!(network_with_replicas(3, now).health(now), NetworkHealth::Degraded);
        assert_eq!(network_with_replicas(4, now).health(now), NetworkHealth::Degraded);
        assert_eq!(network_with_replicas(5, now).health(now), NetworkHealth::Optimal);
        assert_eq!(network_with_replicas(6, now).health(now), NetworkHealth::Healthy);
    }

    #[test]
    fn test_health_at_target_with_inactive_member_is_healthy() {
        let now = 10_000;
        let mut network = network_with_replicas(6, now);
        // Make one replica inactive: 5 healthy of 6 members, not all active
        network.member_mut_for_test(node(6)).last_seen_timestamp = now - 7200;
        assert_eq!(network.healthy_replica_count(now), 5);
        assert_eq!(network.health(now), NetworkHealth::Healthy);
    }

    #[test]
    fn test_quorum_ramp_scenario() {
        // Founder + invited members ramp to optimal, then decay to critical
        let now = 10_000;
        let mut network = network_with_replicas(5, now);
        assert_eq!(network.health(now), NetworkHealth::Optimal);

        network.remove_member(&node(5));
        assert_eq!(network.health(now), NetworkHealth::Degraded);
        network.remove_member(&node(4));
        assert_eq!(network.health(now), NetworkHealth::Degraded);
        network.remove_member(&node(3));
        assert_eq!(network.health(now), NetworkHealth::Critical);
    }

    #[test]
    fn test_invitation_flow() {
        let now = 10_000;
        let founder = SigningKeypair::generate();
        let mut network = Network::new(NetworkId([1; 32]), ContentHash([2; 32]), now);
        let mut founder_member = NetworkMember::new(
            founder.node_id(),
            founder.public_key_bytes(),
            MemberRole::Founder,
            now,
        );
        founder_member.has_complete_replica = true;
        network.add_member(founder_member);

        let invitee = SigningKeypair::generate();
        let invitation = network
            .create_invitation(&founder, invitee.node_id(), MemberRole::Full, now)
            .unwrap();
        assert_eq!(network.pending_invitation_count(), 1);

        network
            .accept_invitation(&invitation, invitee.public_key_bytes(), now + 60)
            .unwrap();
        assert_eq!(network.member_count(), 2);
        assert_eq!(
            network.member(&invitee.node_id()).unwrap().role,
            MemberRole::Full
        );
        assert_eq!(network.pending_invitation_count(), 0);
    }

    #[test]
    fn test_expired_invitation_rejected() {
        let now = 10_000;
        let founder = SigningKeypair::generate();
        let mut network = Network::new(NetworkId([1; 32]), ContentHash([2; 32]), now);
        network.add_member(NetworkMember::new(
            founder.node_id(),
            founder.public_key_bytes(),
            MemberRole::Founder,
            now,
        ));

        let invitee = SigningKeypair::generate();
        let invitation = network
            .create_invitation(&founder, invitee.node_id(), MemberRole::Full, now)
            .unwrap();

        let after_expiry = now + INVITATION_TTL_SECONDS + 1;
        assert!(network
            .accept_invitation(&invitation, invitee.public_key_bytes(), after_expiry)
            .is_err());
    }

    #[test]
    fn test_observer_cannot_invite() {
        let now = 10_000;
        let observer = SigningKeypair::generate();
        let mut network = Network::new(NetworkId([1; 32]), ContentHash([2; 32]), now);
        network.add_member(NetworkMember::new(
            observer.node_id(),
            observer.public_key_bytes(),
            MemberRole::Observer,
            now,
        ));

        assert!(network
            .create_invitation(&observer, node(9), MemberRole::Full, now)
            .is_err());
    }

    #[test]
    fn test_tampered_invitation_rejected() {
        let now = 10_000;
        let founder = SigningKeypair::generate();
        let mut network = Network::new(NetworkId([1; 32]), ContentHash([2; 32]), now);
        network.add_member(NetworkMember::new(
            founder.node_id(),
            founder.public_key_bytes(),
            MemberRole::Founder,
            now,
        ));

        let invitee = SigningKeypair::generate();
        let mut invitation = network
            .create_invitation(&founder, invitee.node_id(), MemberRole::Observer, now)
            .unwrap();
        // Upgrade own role in transit
        invitation.proposed_role = MemberRole::Full;

        assert!(network
            .accept_invitation(&invitation, invitee.public_key_bytes(), now + 1)
            .is_err());
    }

    #[test]
    fn test_source_selection_deterministic_tiebreak() {
        let now = 10_000;
        let mut network = network_with_replicas(4, now);
        // All at reliability 1.0: lexicographically smallest id wins
        assert_eq!(network.select_best_source(now), Some(node(1)));

        // Highest reliability wins when scores differ
        network.update_member_reliability(&node(3), 0.9);
        network.update_member_reliability(&node(1), 0.8);
        network.update_member_reliability(&node(2), 0.8);
        network.update_member_reliability(&node(4), 0.7);
        assert_eq!(network.select_best_source(now), Some(node(3)));
    }

    #[test]
    fn test_unreliable_members_not_candidates() {
        let now = 10_000;
        let mut network = network_with_replicas(3, now);
        network.update_member_reliability(&node(2), 0.4);

        let candidates = network.replication_candidates(now);
        assert_eq!(candidates.len(), 2);
        assert!(!candidates.contains(&node(2)));
    }

    #[test]
    fn test_should_add_and_remove_replicas() {
        let now = 10_000;
        let degraded = network_with_replicas(3, now);
        assert!(degraded.should_add_replicas(now));

        let optimal = network_with_replicas(5, now);
        assert!(!optimal.should_add_replicas(now));

        let mut bloated = network_with_replicas(11, now);
        assert!(bloated.should_remove_replicas());
        bloated.update_member_reliability(&node(7), 0.1);
        let removals = bloated.select_nodes_for_removal();
        assert_eq!(removals, vec![node(7)]);
    }

    #[test]
    fn test_dissolution_after_one_epoch_below_min() {
        let now = 10_000;
        let mut network = network_with_replicas(2, now);

        network.observe_health(now);
        assert!(!network.should_dissolve(now));
        assert!(!network.should_dissolve(now + 599));
        assert!(network.should_dissolve(now + 600));

        // Recovery resets the clock
        network.add_member(complete_member(8, MemberRole::Full, now + 300));
        network.observe_health(now + 300);
        assert!(!network.should_dissolve(now + 10_000));
    }

    #[test]
    fn test_serialize_round_trip() {
        let now = 10_000;
        let mut network = network_with_replicas(3, now);
        network.update_member_reliability(&node(2), 0.75);

        let restored = Network::deserialize(&network.serialize()).unwrap();
        assert_eq!(restored.id(), network.id());
        assert_eq!(restored.thing_hash(), network.thing_hash());
        assert_eq!(restored.member_count(), 3);
        assert_eq!(
            restored.member(&node(2)).unwrap().reliability_score,
            0.75
        );
        assert_eq!(restored.quorum(), network.quorum());
    }

    #[test]
    fn test_registry_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = NetworkRegistry::new();
        let thing = ContentHash([5; 32]);
        let id_a = registry.create_network(thing, 100);
        let id_b = registry.create_network(thing, 200);
        assert_ne!(id_a, id_b);

        registry.save_to_disk(dir.path()).unwrap();

        let mut restored = NetworkRegistry::new();
        assert_eq!(restored.load_from_disk(dir.path()).unwrap(), 2);
        assert!(restored.network(&id_a).is_some());
        assert_eq!(restored.networks_for_thing(&thing).len(), 2);
    }

    impl Network {
        fn member_mut_for_test(&mut self, id: NodeId) -> &mut NetworkMember {
            self.members.iter_mut().find(|m| m.node_id == id).unwrap()
        }
    }
}
