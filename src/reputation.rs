//! Reputation and the trust graph
//!
//! Reputation is earned by contribution (hosting, routing, uptime) and
//! lost faster than it is gained. Vouching shares risk: a voucher's score
//! moves with the vouchee's behavior. Trust edges form a directed graph
//! that may contain cycles; transitive trust is the best path product over
//! at most three hops, computed on snapshots.

use hashbrown::{HashMap, HashSet};
use std::collections::VecDeque;

use crate::common::NodeId;
use crate::crypto::{self, PublicKeyBytes, SignatureBytes, SigningKeypair};
use crate::error::{Error, Result};
use crate::event::write_string;
use crate::state::{REPUTATION_CEILING, REPUTATION_FLOOR};

/// Actions that move reputation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReputationAction {
    HostThing,
    ContributeBandwidth,
    SubmitPow,
    ProvidePostake,
    VouchSuccessful,
    OfflineProlonged,
    NetworkViolation,
    SpamDetected,
    VouchFailed,
    ContentRemoved,
}

impl ReputationAction {
    /// Score delta for the action. Penalties outweigh rewards.
    pub fn score(&self) -> i32 {
        match self {
            Self::HostThing => 10,
            Self::ContributeBandwidth => 5,
            Self::SubmitPow => 2,
            Self::ProvidePostake => 15,
            Self::VouchSuccessful => 20,
            Self::OfflineProlonged => -10,
            Self::NetworkViolation => -50,
            Self::SpamDetected => -30,
            Self::VouchFailed => -40,
            Self::ContentRemoved => -20,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostThing => "HOST_THING",
            Self::ContributeBandwidth => "CONTRIBUTE_BANDWIDTH",
            Self::SubmitPow => "SUBMIT_POW",
            Self::ProvidePostake => "PROVIDE_POSTAKE",
            Self::VouchSuccessful => "VOUCH_SUCCESSFUL",
            Self::OfflineProlonged => "OFFLINE_PROLONGED",
            Self::NetworkViolation => "NETWORK_VIOLATION",
            Self::SpamDetected => "SPAM_DETECTED",
            Self::VouchFailed => "VOUCH_FAILED",
            Self::ContentRemoved => "CONTENT_REMOVED",
        }
    }
}

/// One entry in a node's recent-events ring
#[derive(Debug, Clone)]
pub struct ReputationEvent {
    pub timestamp: u64,
    pub action: ReputationAction,
    pub score_delta: i32,
    pub score_after: i32,
    pub related_node: Option<NodeId>,
}

/// Ring capacity for recent events
const RECENT_EVENTS_CAP: usize = 100;

/// Detailed reputation breakdown for one node
#[derive(Debug, Clone, Default)]
pub struct ReputationScore {
    pub node_id: NodeId,
    pub total: i32,
    pub hosting: i32,
    pub contribution: i32,
    pub vouching: i32,
    pub penalty: i32,
    pub things_hosted: u32,
    pub bandwidth_contributed: u64,
    pub successful_vouches: u32,
    pub failed_vouches: u32,
    pub violations: u32,
    pub recent_events: VecDeque<ReputationEvent>,
}

impl ReputationScore {
    /// Normalized trust level in `[0.0, 1.0]`
    pub fn trust_level(&self) -> f32 {
        ((self.total - REPUTATION_FLOOR) as f32
            / (REPUTATION_CEILING - REPUTATION_FLOOR) as f32)
            .clamp(0.0, 1.0)
    }

    pub fn is_trustworthy(&self) -> bool {
        self.total >= 100
    }

    pub fn is_suspicious(&self) -> bool {
        self.total < -50
    }
}

/// Signed statement one node makes about another
#[derive(Debug, Clone, PartialEq)]
pub struct Attestation {
    pub attester: NodeId,
    pub subject: NodeId,
    pub score_delta: i32,
    pub statement: String,
    pub timestamp: u64,
    pub expires_at: u64,
    pub signature: SignatureBytes,
}

impl Attestation {
    fn signable_bytes(
        attester: &NodeId,
        subject: &NodeId,
        score_delta: i32,
        statement: &str,
        timestamp: u64,
        expires_at: u64,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(attester.as_bytes());
        out.extend_from_slice(subject.as_bytes());
        out.extend_from_slice(&score_delta.to_le_bytes());
        write_string(&mut out, statement);
        out.extend_from_slice(&timestamp.to_le_bytes());
        out.extend_from_slice(&expires_at.to_le_bytes());
        out
    }

    pub fn create(
        attester_keypair: &SigningKeypair,
        subject: NodeId,
        score_delta: i32,
        statement: &str,
        now: u64,
        ttl_seconds: u64,
    ) -> Result<Self> {
        if !(-100..=100).contains(&score_delta) {
            return Err(Error::InvalidAttestation(
                "score delta must be within [-100, 100]".into(),
            ));
        }
        let attester = attester_keypair.node_id();
        let expires_at = now + ttl_seconds;
        let bytes =
            Self::signable_bytes(&attester, &subject, score_delta, statement, now, expires_at);
        Ok(Self {
            attester,
            subject,
            score_delta,
            statement: statement.to_string(),
            timestamp: now,
            expires_at,
            signature: attester_keypair.sign(&bytes),
        })
    }

    pub fn verify(&self, attester_public_key: &PublicKeyBytes) -> bool {
        let bytes = Self::signable_bytes(
            &self.attester,
            &self.subject,
            self.score_delta,
            &self.statement,
            self.timestamp,
            self.expires_at,
        );
        crypto::verify_signature(attester_public_key, &bytes, &self.signature).is_ok()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn is_vouch(&self) -> bool {
        self.score_delta > 0
    }

    pub fn is_denouncement(&self) -> bool {
        self.score_delta < 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Self::signable_bytes(
            &self.attester,
            &self.subject,
            self.score_delta,
            &self.statement,
            self.timestamp,
            self.expires_at,
        );
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = crate::event::ByteReader::new(bytes);
        let attester = NodeId(reader.read_hash()?);
        let subject = NodeId(reader.read_hash()?);
        let score_delta = reader.read_i32()?;
        let statement = reader.read_string()?;
        let timestamp = reader.read_u64()?;
        let expires_at = reader.read_u64()?;
        let signature: SignatureBytes = reader
            .read_bytes(64)?
            .try_into()
            .map_err(|_| Error::InvalidFormat("bad signature".into()))?;
        Ok(Self {
            attester,
            subject,
            score_delta,
            statement,
            timestamp,
            expires_at,
            signature,
        })
    }
}

/// Directed trust relationship
#[derive(Debug, Clone, Copy)]
pub struct TrustEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub weight: f32,
    pub established_at: u64,
    pub last_updated: u64,
}

/// Directed, possibly cyclic trust graph stored as adjacency maps
#[derive(Default)]
pub struct TrustGraph {
    edges: HashMap<NodeId, HashMap<NodeId, TrustEdge>>,
}

impl TrustGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId, weight: f32, now: u64) {
        let weight = weight.clamp(0.0, 1.0);
        self.edges
            .entry(from)
            .or_default()
            .entry(to)
            .and_modify(|e| {
                e.weight = weight;
                e.last_updated = now;
            })
            .or_insert(TrustEdge {
                from,
                to,
                weight,
                established_at: now,
                last_updated: now,
            });
    }

    pub fn remove_edge(&mut self, from: &NodeId, to: &NodeId) {
        if let Some(targets) = self.edges.get_mut(from) {
            targets.remove(to);
        }
    }

    /// Remove a node and every edge touching it
    pub fn remove_node(&mut self, node: &NodeId) {
        self.edges.remove(node);
        for targets in self.edges.values_mut() {
            targets.remove(node);
        }
    }

    pub fn direct_trust(&self, from: &NodeId, to: &NodeId) -> Option<f32> {
        self.edges.get(from).and_then(|t| t.get(to)).map(|e| e.weight)
    }

    /// Best path product from `from` to `to` within `max_hops`. Trust
    /// diminishes multiplicatively with distance; cycles cannot inflate it
    /// because weights never exceed 1.
    pub fn transitive_trust(&self, from: &NodeId, to: &NodeId, max_hops: u32) -> f32 {
        if from == to {
            return 1.0;
        }
        let mut best = 0.0f32;
        let mut visited = HashSet::new();
        visited.insert(*from);
        self.search(from, to, 1.0, max_hops, &mut visited, &mut best);
        best
    }

    fn search(
        &self,
        current: &NodeId,
        target: &NodeId,
        accumulated: f32,
        hops_left: u32,
        visited: &mut HashSet<NodeId>,
        best: &mut f32,
    ) {
        if hops_left == 0 || accumulated <= *best {
            return;
        }
        let Some(targets) = self.edges.get(current) else {
            return;
        };
        for (next, edge) in targets {
            let trust = accumulated * edge.weight;
            if next == target {
                if trust > *best {
                    *best = trust;
                }
                continue;
            }
            if visited.insert(*next) {
                self.search(next, target, trust, hops_left - 1, visited, best);
                visited.remove(next);
            }
        }
    }

    pub fn trusts(&self, node: &NodeId) -> Vec<NodeId> {
        self.edges
            .get(node)
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn trusted_by(&self, node: &NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|(_, targets)| targets.contains_key(node))
            .map(|(from, _)| *from)
            .collect()
    }

    /// Nodes reachable from `node` over edges of at least `min_trust`
    pub fn trust_community(&self, node: &NodeId, min_trust: f32) -> HashSet<NodeId> {
        let mut community = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(*node);
        community.insert(*node);
        while let Some(current) = queue.pop_front() {
            if let Some(targets) = self.edges.get(&current) {
                for (next, edge) in targets {
                    if edge.weight >= min_trust && community.insert(*next) {
                        queue.push_back(*next);
                    }
                }
            }
        }
        community
    }

    /// Periodic maintenance: edges fade and the weakest are pruned
    pub fn decay_edge_weights(&mut self, factor: f32) {
        for targets in self.edges.values_mut() {
            for edge in targets.values_mut() {
                edge.weight *= factor;
            }
        }
    }

    pub fn prune_weak_edges(&mut self, threshold: f32) {
        for targets in self.edges.values_mut() {
            targets.retain(|_, e| e.weight >= threshold);
        }
        self.edges.retain(|_, targets| !targets.is_empty());
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|t| t.len()).sum()
    }
}

/// Record of a vouch and the stakes it carries
#[derive(Debug, Clone)]
struct VouchStake {
    voucher: NodeId,
    vouchee: NodeId,
    vouchee_reputation_at_vouch: i32,
    still_active: bool,
}

/// Vouchee must gain this much before the voucher is rewarded
const VOUCH_SUCCESS_MARGIN: i32 = 100;
/// Vouchee losing this much burns the voucher
const VOUCH_FAILURE_MARGIN: i32 = 50;

/// Per-epoch multiplicative decay toward zero
const REPUTATION_DECAY_RATE: f32 = 0.99;
const TRUST_EDGE_DECAY_RATE: f32 = 0.95;
const WEAK_EDGE_THRESHOLD: f32 = 0.1;

/// Central reputation bookkeeping
pub struct ReputationManager {
    scores: HashMap<NodeId, ReputationScore>,
    attestations_by_subject: HashMap<NodeId, Vec<Attestation>>,
    vouch_stakes: Vec<VouchStake>,
    trust_graph: TrustGraph,
}

impl Default for ReputationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ReputationManager {
    pub fn new() -> Self {
        Self {
            scores: HashMap::new(),
            attestations_by_subject: HashMap::new(),
            vouch_stakes: Vec::new(),
            trust_graph: TrustGraph::new(),
        }
    }

    fn score_entry(&mut self, node: NodeId) -> &mut ReputationScore {
        self.scores.entry(node).or_insert_with(|| ReputationScore {
            node_id: node,
            ..ReputationScore::default()
        })
    }

    pub fn reputation(&self, node: &NodeId) -> i32 {
        self.scores.get(node).map(|s| s.total).unwrap_or(0)
    }

    pub fn detailed_score(&self, node: &NodeId) -> Option<&ReputationScore> {
        self.scores.get(node)
    }

    /// Record an action and return the applied delta (for the caller to
    /// publish as a REPUTATION_UPDATED event)
    pub fn record_action(
        &mut self,
        node: NodeId,
        action: ReputationAction,
        related_node: Option<NodeId>,
        now: u64,
    ) -> i32 {
        let delta = action.score();
        let score = self.score_entry(node);

        match action {
            ReputationAction::HostThing => {
                score.hosting += delta;
                score.things_hosted += 1;
            }
            ReputationAction::ContributeBandwidth => {
                score.contribution += delta;
                score.bandwidth_contributed += 1;
            }
            ReputationAction::SubmitPow | ReputationAction::ProvidePostake => {
                score.contribution += delta;
            }
            ReputationAction::VouchSuccessful => {
                score.vouching += delta;
                score.successful_vouches += 1;
            }
            ReputationAction::VouchFailed => {
                score.penalty += delta;
                score.failed_vouches += 1;
            }
            ReputationAction::OfflineProlonged
            | ReputationAction::NetworkViolation
            | ReputationAction::SpamDetected
            | ReputationAction::ContentRemoved => {
                score.penalty += delta;
                score.violations += 1;
            }
        }

        score.total = (score.total + delta).clamp(REPUTATION_FLOOR, REPUTATION_CEILING);
        score.recent_events.push_back(ReputationEvent {
            timestamp: now,
            action,
            score_delta: delta,
            score_after: score.total,
            related_node,
        });
        while score.recent_events.len() > RECENT_EVENTS_CAP {
            score.recent_events.pop_front();
        }

        log::debug!(
            "reputation {:?}: {} {delta:+} -> {}",
            node,
            action.as_str(),
            score.total
        );
        delta
    }

    /// Apply a raw delta from a REPUTATION_UPDATED ledger event
    pub fn apply_score_delta(&mut self, node: NodeId, delta: i32) {
        let score = self.score_entry(node);
        score.total = (score.total + delta).clamp(REPUTATION_FLOOR, REPUTATION_CEILING);
    }

    // --- attestations ---

    /// Accept a verified attestation, updating the subject's trust edge.
    /// The attestation's weight maps `[-100, 100]` onto `[0.0, 1.0]`.
    pub fn add_attestation(
        &mut self,
        attestation: Attestation,
        attester_public_key: &PublicKeyBytes,
        now: u64,
    ) -> Result<()> {
        if attestation.is_expired(now) {
            return Err(Error::InvalidAttestation("attestation expired".into()));
        }
        if !attestation.verify(attester_public_key) {
            return Err(Error::InvalidAttestation("bad signature".into()));
        }

        let weight = (attestation.score_delta + 100) as f32 / 200.0;
        self.trust_graph
            .add_edge(attestation.attester, attestation.subject, weight, now);

        self.attestations_by_subject
            .entry(attestation.subject)
            .or_default()
            .push(attestation);
        Ok(())
    }

    pub fn attestations_for(&self, subject: &NodeId) -> &[Attestation] {
        self.attestations_by_subject
            .get(subject)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn cleanup_expired_attestations(&mut self, now: u64) {
        for attestations in self.attestations_by_subject.values_mut() {
            attestations.retain(|a| !a.is_expired(now));
        }
        self.attestations_by_subject.retain(|_, v| !v.is_empty());
    }

    // --- vouching ---

    pub fn can_vouch(&self, voucher: &NodeId) -> bool {
        if self.reputation(voucher) < crate::keys::MIN_REPUTATION_TO_VOUCH {
            return false;
        }
        let active = self
            .vouch_stakes
            .iter()
            .filter(|v| v.voucher == *voucher && v.still_active)
            .count();
        active < crate::keys::MAX_ACTIVE_VOUCHES
    }

    /// Record a vouch stake; the voucher's own score now rides on the
    /// vouchee's behavior
    pub fn vouch_for(&mut self, voucher: NodeId, vouchee: NodeId, now: u64) -> Result<()> {
        if !self.can_vouch(&voucher) {
            return Err(Error::ReputationTooLow {
                score: self.reputation(&voucher),
                required: crate::keys::MIN_REPUTATION_TO_VOUCH,
            });
        }
        let at_vouch = self.reputation(&vouchee);
        self.vouch_stakes.push(VouchStake {
            voucher,
            vouchee,
            vouchee_reputation_at_vouch: at_vouch,
            still_active: true,
        });
        self.trust_graph.add_edge(voucher, vouchee, 0.7, now);
        Ok(())
    }

    /// Settle vouch stakes whose vouchee has moved far enough to judge.
    /// Returns the settled `(voucher, action)` pairs for event emission.
    pub fn update_vouch_impacts(&mut self, now: u64) -> Vec<(NodeId, ReputationAction)> {
        let mut settled = Vec::new();
        let mut outcomes = Vec::new();

        for stake in &mut self.vouch_stakes {
            if !stake.still_active {
                continue;
            }
            let current = self
                .scores
                .get(&stake.vouchee)
                .map(|s| s.total)
                .unwrap_or(0);
            let drift = current - stake.vouchee_reputation_at_vouch;
            if drift >= VOUCH_SUCCESS_MARGIN {
                stake.still_active = false;
                outcomes.push((stake.voucher, ReputationAction::VouchSuccessful));
            } else if drift <= -VOUCH_FAILURE_MARGIN {
                stake.still_active = false;
                outcomes.push((stake.voucher, ReputationAction::VouchFailed));
            }
        }

        for (voucher, action) in outcomes {
            self.record_action(voucher, action, None, now);
            settled.push((voucher, action));
        }
        settled
    }

    // --- trust graph ---

    pub fn trust_graph(&self) -> &TrustGraph {
        &self.trust_graph
    }

    pub fn trust_graph_mut(&mut self) -> &mut TrustGraph {
        &mut self.trust_graph
    }

    // --- rankings & maintenance ---

    pub fn top_reputation(&self, count: usize) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self.scores.values().collect();
        nodes.sort_by(|a, b| b.total.cmp(&a.total).then(a.node_id.cmp(&b.node_id)));
        nodes.into_iter().take(count).map(|s| s.node_id).collect()
    }

    pub fn suspicious_nodes(&self) -> Vec<NodeId> {
        self.scores
            .values()
            .filter(|s| s.is_suspicious())
            .map(|s| s.node_id)
            .collect()
    }

    pub fn count_trustworthy(&self) -> usize {
        self.scores.values().filter(|s| s.is_trustworthy()).count()
    }

    /// Per-epoch decay: scores drift toward zero, trust edges fade, dead
    /// edges are pruned
    pub fn decay(&mut self) {
        for score in self.scores.values_mut() {
            score.total = (score.total as f32 * REPUTATION_DECAY_RATE) as i32;
            score.hosting = (score.hosting as f32 * REPUTATION_DECAY_RATE) as i32;
            score.contribution = (score.contribution as f32 * REPUTATION_DECAY_RATE) as i32;
            score.vouching = (score.vouching as f32 * REPUTATION_DECAY_RATE) as i32;
            score.penalty = (score.penalty as f32 * REPUTATION_DECAY_RATE) as i32;
        }
        self.trust_graph.decay_edge_weights(TRUST_EDGE_DECAY_RATE);
        self.trust_graph.prune_weak_edges(WEAK_EDGE_THRESHOLD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId([byte; 32])
    }

    #[test]
    fn test_action_scores() {
        assert_eq!(ReputationAction::HostThing.score(), 10);
        assert_eq!(ReputationAction::NetworkViolation.score(), -50);
        assert_eq!(ReputationAction::VouchFailed.score(), -40);
    }

    #[test]
    fn test_record_action_updates_components() {
        let mut manager = ReputationManager::new();
        manager.record_action(node(1), ReputationAction::HostThing, None, 100);
        manager.record_action(node(1), ReputationAction::SpamDetected, None, 200);

        let score = manager.detailed_score(&node(1)).unwrap();
        assert_eq!(score.total, -20);
        assert_eq!(score.hosting, 10);
        assert_eq!(score.penalty, -30);
        assert_eq!(score.things_hosted, 1);
        assert_eq!(score.violations, 1);
        assert_eq!(score.recent_events.len(), 2);
    }

    #[test]
    fn test_recent_events_ring_caps_at_100() {
        let mut manager = ReputationManager::new();
        for i in 0..150 {
            manager.record_action(node(1), ReputationAction::SubmitPow, None, i);
        }
        let score = manager.detailed_score(&node(1)).unwrap();
        assert_eq!(score.recent_events.len(), 100);
        // Oldest events were dropped
        assert_eq!(score.recent_events.front().unwrap().timestamp, 50);
    }

    #[test]
    fn test_score_clamping() {
        let mut manager = ReputationManager::new();
        for _ in 0..50 {
            manager.record_action(node(1), ReputationAction::NetworkViolation, None, 0);
        }
        assert_eq!(manager.reputation(&node(1)), REPUTATION_FLOOR);
    }

    #[test]
    fn test_attestation_round_trip() {
        let attester = SigningKeypair::generate();
        let attestation =
            Attestation::create(&attester, node(9), 50, "reliable host", 1000, 3600).unwrap();

        assert!(attestation.verify(&attester.public_key_bytes()));
        assert!(attestation.is_vouch());
        assert!(!attestation.is_expired(2000));
        assert!(attestation.is_expired(4600));
    }

    #[test]
    fn test_attestation_wire_round_trip() {
        let attester = SigningKeypair::generate();
        let attestation =
            Attestation::create(&attester, node(9), -30, "spam source", 1000, 3600).unwrap();

        let decoded = Attestation::from_bytes(&attestation.to_bytes()).unwrap();
        assert_eq!(decoded, attestation);
        assert!(decoded.is_denouncement());
        assert!(decoded.verify(&attester.public_key_bytes()));
    }

    #[test]
    fn test_attestation_delta_bounds() {
        let attester = SigningKeypair::generate();
        assert!(Attestation::create(&attester, node(9), 101, "", 0, 10).is_err());
        assert!(Attestation::create(&attester, node(9), -101, "", 0, 10).is_err());
    }

    #[test]
    fn test_add_attestation_builds_trust_edge() {
        let attester = SigningKeypair::generate();
        let mut manager = ReputationManager::new();
        let attestation =
            Attestation::create(&attester, node(9), 100, "top tier", 1000, 3600).unwrap();
        manager
            .add_attestation(attestation, &attester.public_key_bytes(), 1000)
            .unwrap();

        let trust = manager
            .trust_graph()
            .direct_trust(&attester.node_id(), &node(9))
            .unwrap();
        assert!((trust - 1.0).abs() < f32::EPSILON);
        assert_eq!(manager.attestations_for(&node(9)).len(), 1);
    }

    #[test]
    fn test_expired_attestation_rejected() {
        let attester = SigningKeypair::generate();
        let mut manager = ReputationManager::new();
        let attestation = Attestation::create(&attester, node(9), 10, "", 0, 100).unwrap();
        assert!(manager
            .add_attestation(attestation, &attester.public_key_bytes(), 500)
            .is_err());
    }

    #[test]
    fn test_transitive_trust_path_product() {
        let mut graph = TrustGraph::new();
        graph.add_edge(node(1), node(2), 0.8, 0);
        graph.add_edge(node(2), node(3), 0.5, 0);

        assert_eq!(graph.direct_trust(&node(1), &node(3)), None);
        let transitive = graph.transitive_trust(&node(1), &node(3), 3);
        assert!((transitive - 0.4).abs() < 1e-6);

        // Out of hop range
        assert_eq!(graph.transitive_trust(&node(1), &node(3), 1), 0.0);
    }

    #[test]
    fn test_transitive_trust_picks_best_path() {
        let mut graph = TrustGraph::new();
        // Weak direct chain, strong detour
        graph.add_edge(node(1), node(2), 0.2, 0);
        graph.add_edge(node(2), node(4), 0.2, 0);
        graph.add_edge(node(1), node(3), 0.9, 0);
        graph.add_edge(node(3), node(4), 0.9, 0);

        let trust = graph.transitive_trust(&node(1), &node(4), 3);
        assert!((trust - 0.81).abs() < 1e-6);
    }

    #[test]
    fn test_trust_graph_survives_cycles_and_removal() {
        let mut graph = TrustGraph::new();
        graph.add_edge(node(1), node(2), 0.9, 0);
        graph.add_edge(node(2), node(1), 0.9, 0);
        graph.add_edge(node(2), node(3), 0.9, 0);

        // Cycle must not inflate or hang
        let trust = graph.transitive_trust(&node(1), &node(3), 3);
        assert!((trust - 0.81).abs() < 1e-6);

        graph.remove_node(&node(2));
        assert_eq!(graph.transitive_trust(&node(1), &node(3), 3), 0.0);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_edge_decay_and_pruning() {
        let mut graph = TrustGraph::new();
        graph.add_edge(node(1), node(2), 0.12, 0);
        graph.decay_edge_weights(0.5);
        graph.prune_weak_edges(0.1);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_vouch_requires_reputation() {
        let mut manager = ReputationManager::new();
        assert!(manager.vouch_for(node(1), node(2), 0).is_err());

        for _ in 0..10 {
            manager.record_action(node(1), ReputationAction::ProvidePostake, None, 0);
        }
        assert!(manager.vouch_for(node(1), node(2), 0).is_ok());
    }

    #[test]
    fn test_vouch_failure_burns_voucher() {
        let mut manager = ReputationManager::new();
        for _ in 0..10 {
            manager.record_action(node(1), ReputationAction::ProvidePostake, None, 0);
        }
        manager.vouch_for(node(1), node(2), 0).unwrap();
        let before = manager.reputation(&node(1));

        // Vouchee melts down
        manager.record_action(node(2), ReputationAction::NetworkViolation, None, 10);
        let settled = manager.update_vouch_impacts(20);

        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].1, ReputationAction::VouchFailed);
        assert_eq!(manager.reputation(&node(1)), before - 40);
        // Stake settled; no double jeopardy
        assert!(manager.update_vouch_impacts(30).is_empty());
    }

    #[test]
    fn test_vouch_success_rewards_voucher() {
        let mut manager = ReputationManager::new();
        for _ in 0..10 {
            manager.record_action(node(1), ReputationAction::ProvidePostake, None, 0);
        }
        manager.vouch_for(node(1), node(2), 0).unwrap();

        for _ in 0..10 {
            manager.record_action(node(2), ReputationAction::ProvidePostake, None, 10);
        }
        let settled = manager.update_vouch_impacts(20);
        assert_eq!(settled[0].1, ReputationAction::VouchSuccessful);
    }

    #[test]
    fn test_rankings() {
        let mut manager = ReputationManager::new();
        manager.record_action(node(1), ReputationAction::ProvidePostake, None, 0);
        manager.record_action(node(2), ReputationAction::HostThing, None, 0);
        for _ in 0..3 {
            manager.record_action(node(3), ReputationAction::NetworkViolation, None, 0);
        }

        assert_eq!(manager.top_reputation(1), vec![node(1)]);
        assert_eq!(manager.suspicious_nodes(), vec![node(3)]);
    }

    #[test]
    fn test_decay_drifts_toward_zero() {
        let mut manager = ReputationManager::new();
        for _ in 0..10 {
            manager.record_action(node(1), ReputationAction::ProvidePostake, None, 0);
        }
        let before = manager.reputation(&node(1));
        manager.decay();
        let after = manager.reputation(&node(1));
        assert!(after < before);
        assert!(after > 0);
    }
}
