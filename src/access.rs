//! Capability-based access control
//!
//! Viewing is free; doing things needs keys. Each capability maps to a
//! policy over key holdings, reputation, network role, and (for anonymous
//! posting) proof-of-work. `check_access` evaluates in a fixed order:
//! node active, then keys, then reputation, then network requirements,
//! then PoW. Granted capabilities can be minted into short-lived signed
//! tokens checked against the revocation list on every use.

use hashbrown::HashMap;

use crate::common::{NetworkId, NodeId};
use crate::crypto::{self, PublicKeyBytes, SignatureBytes, SigningKeypair};
use crate::error::{Error, Result};
use crate::keys::KeyType;
use crate::pow::{self, PowConfig, PowSolution};
use crate::revocation::RevocationManager;
use crate::state::{MemberRole, StateProjector};

/// Token lifetime
pub const TOKEN_TTL_SECONDS: u64 = 3600;

/// Everything a node can be allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Capability {
    // Free
    ViewContent = 0,
    DiscoverNetworks = 1,
    RelayTraffic = 2,
    // Any key (anti-bot), or PoW
    PostContent = 10,
    VoteOnContent = 11,
    CreateIdentity = 12,
    // Specific keys
    HostThings = 20,
    JoinNetworks = 21,
    RouteTraffic = 22,
    IssueInvitations = 23,
    // Reputation-gated
    VouchForNodes = 30,
    CreateNetwork = 31,
    ModerateContent = 32,
    // Founder only
    RevokeKeys = 40,
    DisbandNetwork = 41,
}

impl Capability {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ViewContent),
            1 => Some(Self::DiscoverNetworks),
            2 => Some(Self::RelayTraffic),
            10 => Some(Self::PostContent),
            11 => Some(Self::VoteOnContent),
            12 => Some(Self::CreateIdentity),
            20 => Some(Self::HostThings),
            21 => Some(Self::JoinNetworks),
            22 => Some(Self::RouteTraffic),
            23 => Some(Self::IssueInvitations),
            30 => Some(Self::VouchForNodes),
            31 => Some(Self::CreateNetwork),
            32 => Some(Self::ModerateContent),
            40 => Some(Self::RevokeKeys),
            41 => Some(Self::DisbandNetwork),
            _ => None,
        }
    }
}

/// Coarse standing derived from keys, reputation, and role
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    Anonymous,
    Identified,
    Keyed,
    Trusted,
    Founder,
}

/// Requirements for one capability
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    /// A specific key type (and count) the requester must hold
    pub required_key_type: Option<KeyType>,
    pub required_key_count: u32,
    /// At least one key of any type
    pub requires_any_key: bool,
    pub min_reputation: i32,
    /// Must be a member of the request's network
    pub requires_network_membership: bool,
    /// Must NOT already be a member (joining)
    pub requires_non_membership: bool,
    /// Role required within the network
    pub required_role: Option<MemberRole>,
    /// A valid PoW solution satisfies the key requirement instead
    pub allows_pow_fallback: bool,
}

/// A request to do something
#[derive(Debug, Clone)]
pub struct AccessRequest {
    pub requester: NodeId,
    pub capability: Capability,
    pub network_id: Option<NetworkId>,
    pub pow_solution: Option<PowSolution>,
}

impl AccessRequest {
    pub fn new(requester: NodeId, capability: Capability) -> Self {
        Self {
            requester,
            capability,
            network_id: None,
            pow_solution: None,
        }
    }

    pub fn in_network(mut self, network_id: NetworkId) -> Self {
        self.network_id = Some(network_id);
        self
    }

    pub fn with_pow(mut self, solution: PowSolution) -> Self {
        self.pow_solution = Some(solution);
        self
    }
}

/// Result of an access check
#[derive(Debug, Clone)]
pub struct AccessDecision {
    pub granted: bool,
    pub reason: String,
}

impl AccessDecision {
    pub fn allow(reason: &str) -> Self {
        Self {
            granted: true,
            reason: reason.to_string(),
        }
    }

    pub fn deny(reason: &str) -> Self {
        Self {
            granted: false,
            reason: reason.to_string(),
        }
    }
}

/// A signed, time-bounded grant of one capability
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityToken {
    pub node_id: NodeId,
    pub capability: Capability,
    pub issued_at: u64,
    pub expires_at: u64,
    pub context: Vec<u8>,
    pub signature: SignatureBytes,
}

impl CapabilityToken {
    fn signable_bytes(
        node_id: &NodeId,
        capability: Capability,
        issued_at: u64,
        expires_at: u64,
        context: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(node_id.as_bytes());
        out.push(capability as u8);
        out.extend_from_slice(&issued_at.to_le_bytes());
        out.extend_from_slice(&expires_at.to_le_bytes());
        out.extend_from_slice(&(context.len() as u32).to_le_bytes());
        out.extend_from_slice(context);
        out
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn verify_signature(&self, public_key: &PublicKeyBytes) -> bool {
        let bytes = Self::signable_bytes(
            &self.node_id,
            self.capability,
            self.issued_at,
            self.expires_at,
            &self.context,
        );
        crypto::verify_signature(public_key, &bytes, &self.signature).is_ok()
    }
}

/// The capability gate
pub struct AccessControl {
    policies: HashMap<Capability, AccessPolicy>,
    pow_config: PowConfig,
}

impl AccessControl {
    pub fn new(pow_config: PowConfig) -> Self {
        let mut control = Self {
            policies: HashMap::new(),
            pow_config,
        };
        control.install_default_policies();
        control
    }

    fn install_default_policies(&mut self) {
        use Capability::*;

        // Free capabilities
        for capability in [ViewContent, DiscoverNetworks, RelayTraffic] {
            self.policies.insert(capability, AccessPolicy::default());
        }

        // Any key, or a PoW solution (anti-bot)
        for capability in [PostContent, VoteOnContent, CreateIdentity] {
            self.policies.insert(
                capability,
                AccessPolicy {
                    requires_any_key: true,
                    allows_pow_fallback: true,
                    ..AccessPolicy::default()
                },
            );
        }

        self.policies.insert(
            HostThings,
            AccessPolicy {
                required_key_type: Some(KeyType::Service),
                required_key_count: 1,
                ..AccessPolicy::default()
            },
        );
        self.policies.insert(
            JoinNetworks,
            AccessPolicy {
                required_key_type: Some(KeyType::Network),
                required_key_count: 1,
                requires_non_membership: true,
                ..AccessPolicy::default()
            },
        );
        self.policies.insert(
            RouteTraffic,
            AccessPolicy {
                required_key_type: Some(KeyType::Routing),
                required_key_count: 1,
                ..AccessPolicy::default()
            },
        );
        self.policies.insert(
            IssueInvitations,
            AccessPolicy {
                required_key_type: Some(KeyType::Network),
                required_key_count: 1,
                requires_network_membership: true,
                ..AccessPolicy::default()
            },
        );
        self.policies.insert(
            VouchForNodes,
            AccessPolicy {
                requires_any_key: true,
                min_reputation: 100,
                ..AccessPolicy::default()
            },
        );
        self.policies.insert(
            CreateNetwork,
            AccessPolicy {
                required_key_type: Some(KeyType::Network),
                required_key_count: 3,
                min_reputation: 50,
                ..AccessPolicy::default()
            },
        );
        self.policies.insert(
            ModerateContent,
            AccessPolicy {
                min_reputation: 75,
                requires_network_membership: true,
                required_role: Some(MemberRole::Full),
                ..AccessPolicy::default()
            },
        );
        for capability in [RevokeKeys, DisbandNetwork] {
            self.policies.insert(
                capability,
                AccessPolicy {
                    requires_network_membership: true,
                    required_role: Some(MemberRole::Founder),
                    ..AccessPolicy::default()
                },
            );
        }
    }

    pub fn set_policy(&mut self, capability: Capability, policy: AccessPolicy) {
        self.policies.insert(capability, policy);
    }

    pub fn policy(&self, capability: Capability) -> Option<&AccessPolicy> {
        self.policies.get(&capability)
    }

    /// Evaluate a request against the projected state
    pub fn check_access(&self, request: &AccessRequest, state: &StateProjector) -> AccessDecision {
        let Some(policy) = self.policies.get(&request.capability) else {
            return AccessDecision::deny("no policy for capability");
        };

        // Free capabilities short-circuit: no identity needed to view
        let is_free = !policy.requires_any_key
            && policy.required_key_type.is_none()
            && policy.min_reputation == 0
            && policy.required_role.is_none()
            && !policy.requires_network_membership;
        if is_free {
            return AccessDecision::allow("free capability");
        }

        // 1. Requester must be an active node
        let Some(node) = state.node_state(&request.requester) else {
            return AccessDecision::deny("unknown node");
        };
        if !node.is_active {
            return AccessDecision::deny("node is not active");
        }

        // 2. Key requirements (PoW can substitute where the policy says so)
        let mut keys_ok = true;
        if let Some(key_type) = policy.required_key_type {
            if !node.has_key_type(key_type, policy.required_key_count.max(1)) {
                keys_ok = false;
            }
        } else if policy.requires_any_key && !node.has_any_keys() {
            keys_ok = false;
        }
        if !keys_ok {
            if policy.allows_pow_fallback {
                match &request.pow_solution {
                    Some(solution)
                        if solution.node_id == request.requester
                            && pow::verify(solution, &self.pow_config).is_ok() =>
                    {
                        keys_ok = true;
                    }
                    _ => {}
                }
            }
            if !keys_ok {
                return AccessDecision::deny("insufficient keys");
            }
        }

        // 3. Reputation
        if node.reputation_score < policy.min_reputation {
            return AccessDecision::deny("reputation too low");
        }

        // 4. Network requirements
        if policy.requires_network_membership || policy.requires_non_membership {
            let Some(network_id) = request.network_id else {
                return AccessDecision::deny("request missing network context");
            };
            let is_member = state.is_node_in_network(&request.requester, &network_id);
            if policy.requires_network_membership && !is_member {
                return AccessDecision::deny("not a member of the network");
            }
            if policy.requires_non_membership && is_member {
                return AccessDecision::deny("already a member of the network");
            }
            if let Some(required_role) = policy.required_role {
                let role = state
                    .network_state(&network_id)
                    .and_then(|n| n.role_of(&request.requester));
                if role != Some(required_role) {
                    return AccessDecision::deny("insufficient network role");
                }
            }
        }

        AccessDecision::allow("all requirements met")
    }

    /// Mint a signed token for a capability the caller was granted
    pub fn issue_token(
        &self,
        keypair: &SigningKeypair,
        capability: Capability,
        context: Vec<u8>,
        now: u64,
    ) -> CapabilityToken {
        let node_id = keypair.node_id();
        let expires_at = now + TOKEN_TTL_SECONDS;
        let bytes =
            CapabilityToken::signable_bytes(&node_id, capability, now, expires_at, &context);
        CapabilityToken {
            node_id,
            capability,
            issued_at: now,
            expires_at,
            context,
            signature: keypair.sign(&bytes),
        }
    }

    /// Verify a presented token: expiry, signature, and revocation list
    pub fn verify_token(
        &self,
        token: &CapabilityToken,
        holder_public_key: &PublicKeyBytes,
        revocations: &RevocationManager,
        now: u64,
    ) -> Result<()> {
        if token.is_expired(now) {
            return Err(Error::KeyExpired);
        }
        if !token.verify_signature(holder_public_key) {
            return Err(Error::VerificationFailed);
        }
        if revocations.is_token_revoked(token, now) {
            return Err(Error::PermissionDenied("token revoked".into()));
        }
        Ok(())
    }

    /// Derive the coarse access ladder position for a node
    pub fn access_level(
        &self,
        node: &NodeId,
        network: Option<&NetworkId>,
        state: &StateProjector,
    ) -> AccessLevel {
        let Some(node_state) = state.node_state(node) else {
            return AccessLevel::Anonymous;
        };
        if let Some(network_id) = network {
            if state
                .network_state(network_id)
                .and_then(|n| n.role_of(node))
                == Some(MemberRole::Founder)
            {
                return AccessLevel::Founder;
            }
        }
        if node_state.reputation_score >= 100 {
            return AccessLevel::Trusted;
        }
        if node_state
            .key_balances
            .iter()
            .any(|(t, &c)| *t != KeyType::Identity && c > 0)
        {
            return AccessLevel::Keyed;
        }
        if node_state.has_key_type(KeyType::Identity, 1) {
            return AccessLevel::Identified;
        }
        AccessLevel::Anonymous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{now_seconds, ContentHash, ZERO_HASH};
    use crate::event::{
        EventType, IssuanceMethod, KeyIssuanceData, LedgerEvent, NetworkMembershipData,
        ReputationUpdateData, ThingReplicationData,
    };
    use crate::revocation::RevocationManager;

    /// Small world: one projector fed by hand-built chains
    struct World {
        projector: StateProjector,
        control: AccessControl,
    }

    struct Actor {
        keypair: SigningKeypair,
        tip: crate::common::Hash256,
    }

    impl Actor {
        fn new() -> Self {
            Self {
                keypair: SigningKeypair::generate(),
                tip: ZERO_HASH,
            }
        }

        fn id(&self) -> NodeId {
            self.keypair.node_id()
        }

        fn emit(&mut self, world: &mut World, event_type: EventType, payload: Vec<u8>) {
            let event = LedgerEvent::create(
                event_type,
                payload,
                self.tip,
                now_seconds(),
                &self.keypair,
            );
            self.tip = event.event_id;
            world.projector.apply(&event);
        }

        fn join(&mut self, world: &mut World) {
            let pk = self.keypair.public_key_bytes().to_vec();
            self.emit(world, EventType::NodeJoined, pk);
        }

        fn grant_keys(&mut self, world: &mut World, key_type: KeyType, count: u32) {
            let data = KeyIssuanceData {
                key_type: key_type as u8,
                count,
                method: IssuanceMethod::Pow,
                proof: [0; 32],
            };
            self.emit(world, EventType::KeyIssued, data.to_bytes());
        }

        fn grant_reputation(&mut self, world: &mut World, delta: i32) {
            let data = ReputationUpdateData {
                subject: self.id(),
                score_delta: delta,
                reason: "test grant".into(),
                evidence: [0; 32],
            };
            self.emit(world, EventType::ReputationUpdated, data.to_bytes());
        }
    }

    fn world() -> World {
        World {
            projector: StateProjector::new(),
            control: AccessControl::new(PowConfig::TEST),
        }
    }

    #[test]
    fn test_free_capabilities_need_nothing() {
        let world = world();
        let stranger = NodeId([9; 32]);
        for capability in [
            Capability::ViewContent,
            Capability::DiscoverNetworks,
            Capability::RelayTraffic,
        ] {
            let decision = world
                .control
                .check_access(&AccessRequest::new(stranger, capability), &world.projector);
            assert!(decision.granted, "{capability:?} should be free");
        }
    }

    #[test]
    fn test_host_things_needs_service_key() {
        let mut world = world();
        let mut actor = Actor::new();
        actor.join(&mut world);
        actor.grant_keys(&mut world, KeyType::Identity, 1);

        // Identity key alone is not enough
        let decision = world.control.check_access(
            &AccessRequest::new(actor.id(), Capability::HostThings),
            &world.projector,
        );
        assert!(!decision.granted);
        assert_eq!(decision.reason, "insufficient keys");

        // One SERVICE key flips the decision
        actor.grant_keys(&mut world, KeyType::Service, 1);
        let decision = world.control.check_access(
            &AccessRequest::new(actor.id(), Capability::HostThings),
            &world.projector,
        );
        assert!(decision.granted);
    }

    #[test]
    fn test_inactive_node_denied() {
        let mut world = world();
        let mut actor = Actor::new();
        actor.join(&mut world);
        actor.grant_keys(&mut world, KeyType::Service, 1);
        actor.emit(&mut world, EventType::NodeLeft, vec![]);

        let decision = world.control.check_access(
            &AccessRequest::new(actor.id(), Capability::HostThings),
            &world.projector,
        );
        assert!(!decision.granted);
        assert_eq!(decision.reason, "node is not active");
    }

    #[test]
    fn test_post_content_pow_fallback() {
        let mut world = world();
        let mut actor = Actor::new();
        actor.join(&mut world);

        // No keys, no pow: denied
        let decision = world.control.check_access(
            &AccessRequest::new(actor.id(), Capability::PostContent),
            &world.projector,
        );
        assert!(!decision.granted);

        // A valid PoW solution substitutes for keys
        let solution = pow::mine(actor.id(), &PowConfig::TEST, 1_000_000).unwrap();
        let decision = world.control.check_access(
            &AccessRequest::new(actor.id(), Capability::PostContent).with_pow(solution),
            &world.projector,
        );
        assert!(decision.granted);
    }

    #[test]
    fn test_vouch_needs_reputation() {
        let mut world = world();
        let mut actor = Actor::new();
        actor.join(&mut world);
        actor.grant_keys(&mut world, KeyType::Node, 1);

        let decision = world.control.check_access(
            &AccessRequest::new(actor.id(), Capability::VouchForNodes),
            &world.projector,
        );
        assert!(!decision.granted);
        assert_eq!(decision.reason, "reputation too low");

        actor.grant_reputation(&mut world, 100);
        let decision = world.control.check_access(
            &AccessRequest::new(actor.id(), Capability::VouchForNodes),
            &world.projector,
        );
        assert!(decision.granted);
    }

    #[test]
    fn test_create_network_needs_keys_and_reputation() {
        let mut world = world();
        let mut actor = Actor::new();
        actor.join(&mut world);
        actor.grant_keys(&mut world, KeyType::Network, 3);

        let decision = world.control.check_access(
            &AccessRequest::new(actor.id(), Capability::CreateNetwork),
            &world.projector,
        );
        assert!(!decision.granted, "needs reputation 50 too");

        actor.grant_reputation(&mut world, 50);
        let decision = world.control.check_access(
            &AccessRequest::new(actor.id(), Capability::CreateNetwork),
            &world.projector,
        );
        assert!(decision.granted);
    }

    #[test]
    fn test_founder_capabilities() {
        let mut world = world();
        let mut founder = Actor::new();
        let mut member = Actor::new();
        founder.join(&mut world);
        member.join(&mut world);

        let thing = ContentHash([1; 32]);
        let network = NetworkId::derive(&thing, 0);
        let created = ThingReplicationData {
            content_hash: thing,
            network_id: network,
            host: founder.id(),
            size_bytes: 0,
        };
        founder.emit(&mut world, EventType::NetworkCreated, created.to_bytes());
        let founder_added = NetworkMembershipData {
            network_id: network,
            member: founder.id(),
            role: "FOUNDER".into(),
        };
        founder.emit(&mut world, EventType::NetworkMemberAdded, founder_added.to_bytes());
        let member_added = NetworkMembershipData {
            network_id: network,
            member: member.id(),
            role: "FULL".into(),
        };
        founder.emit(&mut world, EventType::NetworkMemberAdded, member_added.to_bytes());

        let request =
            AccessRequest::new(founder.id(), Capability::DisbandNetwork).in_network(network);
        assert!(world.control.check_access(&request, &world.projector).granted);

        let request =
            AccessRequest::new(member.id(), Capability::DisbandNetwork).in_network(network);
        let decision = world.control.check_access(&request, &world.projector);
        assert!(!decision.granted);
        assert_eq!(decision.reason, "insufficient network role");
    }

    #[test]
    fn test_join_networks_rejects_existing_member() {
        let mut world = world();
        let mut actor = Actor::new();
        actor.join(&mut world);
        actor.grant_keys(&mut world, KeyType::Network, 1);

        let thing = ContentHash([1; 32]);
        let network = NetworkId::derive(&thing, 0);
        let created = ThingReplicationData {
            content_hash: thing,
            network_id: network,
            host: actor.id(),
            size_bytes: 0,
        };
        actor.emit(&mut world, EventType::NetworkCreated, created.to_bytes());

        // Not yet a member: may join
        let request =
            AccessRequest::new(actor.id(), Capability::JoinNetworks).in_network(network);
        assert!(world.control.check_access(&request, &world.projector).granted);

        let added = NetworkMembershipData {
            network_id: network,
            member: actor.id(),
            role: "FULL".into(),
        };
        actor.emit(&mut world, EventType::NetworkMemberAdded, added.to_bytes());

        let request =
            AccessRequest::new(actor.id(), Capability::JoinNetworks).in_network(network);
        let decision = world.control.check_access(&request, &world.projector);
        assert!(!decision.granted);
        assert_eq!(decision.reason, "already a member of the network");
    }

    #[test]
    fn test_token_issue_and_verify() {
        let world = world();
        let keypair = SigningKeypair::generate();
        let revocations = RevocationManager::new();
        let now = now_seconds();

        let token =
            world
                .control
                .issue_token(&keypair, Capability::HostThings, vec![1, 2, 3], now);
        assert_eq!(token.expires_at, now + TOKEN_TTL_SECONDS);

        assert!(world
            .control
            .verify_token(&token, &keypair.public_key_bytes(), &revocations, now)
            .is_ok());

        // Expired
        assert!(world
            .control
            .verify_token(
                &token,
                &keypair.public_key_bytes(),
                &revocations,
                now + TOKEN_TTL_SECONDS + 1
            )
            .is_err());

        // Tampered
        let mut forged = token.clone();
        forged.capability = Capability::RevokeKeys;
        assert!(world
            .control
            .verify_token(&forged, &keypair.public_key_bytes(), &revocations, now)
            .is_err());
    }

    #[test]
    fn test_access_levels() {
        let mut world = world();
        let stranger = NodeId([9; 32]);
        assert_eq!(
            world.control.access_level(&stranger, None, &world.projector),
            AccessLevel::Anonymous
        );

        let mut actor = Actor::new();
        actor.join(&mut world);
        actor.grant_keys(&mut world, KeyType::Identity, 1);
        assert_eq!(
            world.control.access_level(&actor.id(), None, &world.projector),
            AccessLevel::Identified
        );

        actor.grant_keys(&mut world, KeyType::Service, 1);
        assert_eq!(
            world.control.access_level(&actor.id(), None, &world.projector),
            AccessLevel::Keyed
        );

        actor.grant_reputation(&mut world, 150);
        assert_eq!(
            world.control.access_level(&actor.id(), None, &world.projector),
            AccessLevel::Trusted
        );
    }
}
