//! Derived state projector
//!
//! Folds the event ledger into the materialized views: nodes, networks,
//! Things. The projector never invents facts — every field is a pure
//! function of the event sequence, so replaying the same events always
//! yields the same state. Events from different sources commute; events
//! from one source must be applied in chain order. Re-applying an event is
//! a no-op (guarded by event id).

use hashbrown::{HashMap, HashSet};

use crate::common::{epoch_for, ContentHash, Hash256, NetworkId, NodeId, ZERO_HASH};
use crate::event::{
    EventType, KeyDecayData, KeyIssuanceData, LedgerEvent, NetworkMembershipData,
    ReputationUpdateData, ThingReplicationData,
};
use crate::keys::{KeyTransfer, KeyType, KeyVouch};

/// Reputation bounds
pub const REPUTATION_FLOOR: i32 = -1000;
pub const REPUTATION_CEILING: i32 = 10000;

/// Role of a member inside a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberRole {
    Founder,
    Full,
    Pending,
    Observer,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Founder => "FOUNDER",
            Self::Full => "FULL",
            Self::Pending => "PENDING",
            Self::Observer => "OBSERVER",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "FOUNDER" => Some(Self::Founder),
            "FULL" => Some(Self::Full),
            "PENDING" => Some(Self::Pending),
            "OBSERVER" => Some(Self::Observer),
            _ => None,
        }
    }
}

/// Everything the ledger knows about one node
#[derive(Debug, Clone, Default)]
pub struct NodeState {
    pub node_id: NodeId,
    pub joined_at: u64,
    pub is_active: bool,
    pub key_balances: HashMap<KeyType, u32>,
    pub networks: HashSet<NetworkId>,
    pub hosted_things: HashSet<ContentHash>,
    pub reputation_score: i32,
    pub uptime_seconds: u64,
    pub bandwidth_contributed: u64,
    pub pow_solutions: u32,
    pub postake_contributions: u32,
}

impl NodeState {
    pub fn key_balance(&self, key_type: KeyType) -> u32 {
        self.key_balances.get(&key_type).copied().unwrap_or(0)
    }

    pub fn has_key_type(&self, key_type: KeyType, min_count: u32) -> bool {
        self.key_balance(key_type) >= min_count
    }

    pub fn has_any_keys(&self) -> bool {
        self.key_balances.values().any(|&c| c > 0)
    }
}

/// Everything the ledger knows about one network
#[derive(Debug, Clone, Default)]
pub struct NetworkState {
    pub network_id: NetworkId,
    pub thing_hash: ContentHash,
    pub created_at: u64,
    pub is_active: bool,
    pub members: HashSet<NodeId>,
    pub member_roles: HashMap<NodeId, MemberRole>,
}

impl NetworkState {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn has_member(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    pub fn role_of(&self, node: &NodeId) -> Option<MemberRole> {
        self.member_roles.get(node).copied()
    }
}

/// Everything the ledger knows about one Thing
#[derive(Debug, Clone, Default)]
pub struct ThingState {
    pub content_hash: ContentHash,
    pub created_at: u64,
    pub is_available: bool,
    pub hosts: HashSet<NodeId>,
    pub networks: HashSet<NetworkId>,
    pub total_size_bytes: u64,
}

impl ThingState {
    pub fn replication_count(&self) -> u32 {
        self.hosts.len() as u32
    }

    pub fn is_hosted_by(&self, node: &NodeId) -> bool {
        self.hosts.contains(node)
    }
}

/// Point-in-time summary of the projected state
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub timestamp: u64,
    pub epoch: u64,
    pub latest_ledger_hash: Hash256,
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub total_networks: usize,
    pub total_things: usize,
    pub total_keys_issued: u64,
}

/// Folds ledger events into the derived views
#[derive(Default)]
pub struct StateProjector {
    nodes: HashMap<NodeId, NodeState>,
    networks: HashMap<NetworkId, NetworkState>,
    things: HashMap<ContentHash, ThingState>,

    applied: HashSet<Hash256>,
    latest_applied_hash: Hash256,
    total_keys_issued: u64,
}

impl StateProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all derived state and replay the given events
    pub fn rebuild(&mut self, events: &[LedgerEvent]) {
        self.nodes.clear();
        self.networks.clear();
        self.things.clear();
        self.applied.clear();
        self.latest_applied_hash = ZERO_HASH;
        self.total_keys_issued = 0;
        for event in events {
            self.apply(event);
        }
        log::debug!(
            "rebuilt state: {} nodes, {} networks, {} things from {} events",
            self.nodes.len(),
            self.networks.len(),
            self.things.len(),
            events.len()
        );
    }

    /// Apply one event. Idempotent: a previously-applied event id is
    /// ignored. Malformed payloads are logged and skipped; they never
    /// corrupt state.
    pub fn apply(&mut self, event: &LedgerEvent) {
        if !self.applied.insert(event.event_id) {
            return;
        }
        self.latest_applied_hash = event.event_id;

        match event.event_type {
            EventType::NodeJoined => self.apply_node_joined(event),
            EventType::NodeLeft => self.apply_node_left(event),
            EventType::KeyIssued => self.apply_key_issued(event),
            EventType::KeyTransferred => self.apply_key_transferred(event),
            EventType::KeyRevoked | EventType::KeyDecayed => self.apply_key_debited(event),
            EventType::NetworkCreated => self.apply_network_created(event),
            EventType::NetworkMemberAdded => self.apply_network_member_added(event),
            EventType::NetworkMemberRemoved => self.apply_network_member_removed(event),
            EventType::NetworkDisbanded => self.apply_network_disbanded(event),
            EventType::ThingCreated => self.apply_thing_created(event),
            EventType::ThingReplicated => self.apply_thing_replicated(event),
            EventType::ThingRemoved => self.apply_thing_removed(event),
            EventType::ReputationUpdated => self.apply_reputation_updated(event),
            EventType::PowSolutionSubmitted => self.apply_pow_solution(event),
            EventType::PostakeContribution => self.apply_postake_contribution(event),
            EventType::VouchCreated => self.apply_vouch_created(event),
            // Invitations, attestations, and identity events are consumed
            // by their own managers; they carry no projected state
            EventType::NetworkInvitationSent
            | EventType::NetworkInvitationAccepted
            | EventType::AttestationCreated
            | EventType::IdentityCreated
            | EventType::IdentityRotated
            | EventType::IdentityRevoked => {}
        }
    }

    fn node_entry(&mut self, node_id: NodeId) -> &mut NodeState {
        self.nodes.entry(node_id).or_insert_with(|| NodeState {
            node_id,
            ..NodeState::default()
        })
    }

    fn apply_node_joined(&mut self, event: &LedgerEvent) {
        let timestamp = event.timestamp;
        let state = self.node_entry(event.source_node);
        if state.joined_at == 0 {
            state.joined_at = timestamp;
        }
        state.is_active = true;
    }

    fn apply_node_left(&mut self, event: &LedgerEvent) {
        self.node_entry(event.source_node).is_active = false;
    }

    fn apply_key_issued(&mut self, event: &LedgerEvent) {
        let Ok(data) = KeyIssuanceData::from_bytes(&event.payload) else {
            log::warn!("malformed KEY_ISSUED payload from {:?}", event.source_node);
            return;
        };
        let Some(key_type) = KeyType::from_u8(data.key_type) else {
            log::warn!("KEY_ISSUED with unknown key type {}", data.key_type);
            return;
        };
        let count = data.count;
        self.total_keys_issued += count as u64;
        let state = self.node_entry(event.source_node);
        *state.key_balances.entry(key_type).or_insert(0) += count;
    }

    fn apply_key_transferred(&mut self, event: &LedgerEvent) {
        let Ok(transfer) = KeyTransfer::from_bytes(&event.payload) else {
            log::warn!("malformed KEY_TRANSFERRED payload from {:?}", event.source_node);
            return;
        };
        let from = self.node_entry(transfer.from_node);
        let balance = from.key_balances.entry(transfer.key_type).or_insert(0);
        *balance = balance.saturating_sub(1);
        let to = self.node_entry(transfer.to_node);
        *to.key_balances.entry(transfer.key_type).or_insert(0) += 1;
    }

    fn apply_key_debited(&mut self, event: &LedgerEvent) {
        let Ok(data) = KeyDecayData::from_bytes(&event.payload) else {
            log::warn!("malformed key debit payload from {:?}", event.source_node);
            return;
        };
        let Some(key_type) = KeyType::from_u8(data.key_type) else {
            return;
        };
        let state = self.node_entry(event.source_node);
        let balance = state.key_balances.entry(key_type).or_insert(0);
        *balance = balance.saturating_sub(data.count);
    }

    fn apply_network_created(&mut self, event: &LedgerEvent) {
        let Ok(data) = ThingReplicationData::from_bytes(&event.payload) else {
            log::warn!("malformed NETWORK_CREATED payload from {:?}", event.source_node);
            return;
        };
        let network = self
            .networks
            .entry(data.network_id)
            .or_insert_with(NetworkState::default);
        network.network_id = data.network_id;
        network.thing_hash = data.content_hash;
        network.created_at = event.timestamp;
        network.is_active = true;

        self.things
            .entry(data.content_hash)
            .or_insert_with(|| ThingState {
                content_hash: data.content_hash,
                created_at: event.timestamp,
                ..ThingState::default()
            })
            .networks
            .insert(data.network_id);
    }

    fn apply_network_member_added(&mut self, event: &LedgerEvent) {
        let Ok(data) = NetworkMembershipData::from_bytes(&event.payload) else {
            log::warn!("malformed membership payload from {:?}", event.source_node);
            return;
        };
        let Some(role) = MemberRole::from_str(&data.role) else {
            log::warn!("unknown member role {:?}", data.role);
            return;
        };
        if let Some(network) = self.networks.get_mut(&data.network_id) {
            network.members.insert(data.member);
            network.member_roles.insert(data.member, role);
        }
        self.node_entry(data.member).networks.insert(data.network_id);
    }

    fn apply_network_member_removed(&mut self, event: &LedgerEvent) {
        let Ok(data) = NetworkMembershipData::from_bytes(&event.payload) else {
            return;
        };
        if let Some(network) = self.networks.get_mut(&data.network_id) {
            network.members.remove(&data.member);
            network.member_roles.remove(&data.member);
        }
        self.node_entry(data.member).networks.remove(&data.network_id);
    }

    fn apply_network_disbanded(&mut self, event: &LedgerEvent) {
        let Ok(data) = NetworkMembershipData::from_bytes(&event.payload) else {
            return;
        };
        if let Some(network) = self.networks.get_mut(&data.network_id) {
            network.is_active = false;
            for member in network.members.clone() {
                if let Some(node) = self.nodes.get_mut(&member) {
                    node.networks.remove(&data.network_id);
                }
            }
        }
    }

    fn apply_thing_created(&mut self, event: &LedgerEvent) {
        let Ok(data) = ThingReplicationData::from_bytes(&event.payload) else {
            log::warn!("malformed THING_CREATED payload from {:?}", event.source_node);
            return;
        };
        let thing = self
            .things
            .entry(data.content_hash)
            .or_insert_with(ThingState::default);
        thing.content_hash = data.content_hash;
        if thing.created_at == 0 {
            thing.created_at = event.timestamp;
        }
        thing.is_available = true;
        thing.total_size_bytes = data.size_bytes;
        if !data.network_id.is_zero() {
            thing.networks.insert(data.network_id);
        }
    }

    fn apply_thing_replicated(&mut self, event: &LedgerEvent) {
        let Ok(data) = ThingReplicationData::from_bytes(&event.payload) else {
            log::warn!("malformed THING_REPLICATED payload from {:?}", event.source_node);
            return;
        };
        let thing = self
            .things
            .entry(data.content_hash)
            .or_insert_with(|| ThingState {
                content_hash: data.content_hash,
                created_at: event.timestamp,
                ..ThingState::default()
            });
        thing.hosts.insert(data.host);
        thing.is_available = true;
        if thing.total_size_bytes == 0 {
            thing.total_size_bytes = data.size_bytes;
        }
        if !data.network_id.is_zero() {
            thing.networks.insert(data.network_id);
        }
        self.node_entry(data.host).hosted_things.insert(data.content_hash);
    }

    fn apply_thing_removed(&mut self, event: &LedgerEvent) {
        let Ok(data) = ThingReplicationData::from_bytes(&event.payload) else {
            return;
        };
        if let Some(thing) = self.things.get_mut(&data.content_hash) {
            thing.hosts.remove(&data.host);
            if thing.hosts.is_empty() {
                thing.is_available = false;
            }
        }
        self.node_entry(data.host).hosted_things.remove(&data.content_hash);
    }

    fn apply_vouch_created(&mut self, event: &LedgerEvent) {
        let Ok(vouch) = KeyVouch::from_bytes(&event.payload) else {
            log::warn!("malformed VOUCH_CREATED payload from {:?}", event.source_node);
            return;
        };
        // A vouch only counts from the voucher's own chain
        if vouch.voucher != event.source_node {
            return;
        }
        let vouchee = self.node_entry(vouch.vouchee);
        *vouchee.key_balances.entry(vouch.key_type).or_insert(0) += vouch.key_count;
    }

    fn apply_reputation_updated(&mut self, event: &LedgerEvent) {
        let Ok(data) = ReputationUpdateData::from_bytes(&event.payload) else {
            log::warn!("malformed REPUTATION_UPDATED payload from {:?}", event.source_node);
            return;
        };
        let state = self.node_entry(data.subject);
        state.reputation_score = (state.reputation_score.saturating_add(data.score_delta))
            .clamp(REPUTATION_FLOOR, REPUTATION_CEILING);
    }

    fn apply_pow_solution(&mut self, event: &LedgerEvent) {
        self.node_entry(event.source_node).pow_solutions += 1;
    }

    fn apply_postake_contribution(&mut self, event: &LedgerEvent) {
        let state = self.node_entry(event.source_node);
        state.postake_contributions += 1;
        // Payload, when present, carries uptime and bandwidth deltas
        if event.payload.len() >= 16 {
            let uptime = u64::from_le_bytes(event.payload[0..8].try_into().unwrap());
            let bandwidth = u64::from_le_bytes(event.payload[8..16].try_into().unwrap());
            state.uptime_seconds += uptime;
            state.bandwidth_contributed += bandwidth;
        }
    }

    // --- read API ---

    pub fn node_state(&self, node: &NodeId) -> Option<&NodeState> {
        self.nodes.get(node)
    }

    pub fn network_state(&self, network: &NetworkId) -> Option<&NetworkState> {
        self.networks.get(network)
    }

    pub fn thing_state(&self, hash: &ContentHash) -> Option<&ThingState> {
        self.things.get(hash)
    }

    pub fn all_active_nodes(&self) -> Vec<&NodeState> {
        self.nodes.values().filter(|n| n.is_active).collect()
    }

    pub fn all_active_networks(&self) -> Vec<&NetworkState> {
        self.networks.values().filter(|n| n.is_active).collect()
    }

    pub fn all_available_things(&self) -> Vec<&ThingState> {
        self.things.values().filter(|t| t.is_available).collect()
    }

    pub fn nodes_with_key_type(&self, key_type: KeyType, min_count: u32) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.has_key_type(key_type, min_count))
            .map(|n| n.node_id)
            .collect()
    }

    pub fn is_node_active(&self, node: &NodeId) -> bool {
        self.nodes.get(node).map(|n| n.is_active).unwrap_or(false)
    }

    pub fn is_node_in_network(&self, node: &NodeId, network: &NetworkId) -> bool {
        self.networks
            .get(network)
            .map(|n| n.has_member(node))
            .unwrap_or(false)
    }

    pub fn node_key_balance(&self, node: &NodeId, key_type: KeyType) -> u32 {
        self.nodes
            .get(node)
            .map(|n| n.key_balance(key_type))
            .unwrap_or(0)
    }

    pub fn node_reputation(&self, node: &NodeId) -> i32 {
        self.nodes
            .get(node)
            .map(|n| n.reputation_score)
            .unwrap_or(0)
    }

    pub fn snapshot(&self, now: u64) -> StateSnapshot {
        StateSnapshot {
            timestamp: now,
            epoch: epoch_for(now),
            latest_ledger_hash: self.latest_applied_hash,
            total_nodes: self.nodes.len(),
            active_nodes: self.nodes.values().filter(|n| n.is_active).count(),
            total_networks: self.networks.len(),
            total_things: self.things.len(),
            total_keys_issued: self.total_keys_issued,
        }
    }
}
