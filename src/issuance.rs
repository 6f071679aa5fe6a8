//! Hybrid key issuance coordinator
//!
//! Three routes to new keys: pure proof-of-work (the cold-start path, no
//! history required), pure proof-of-contribution (established nodes skip
//! the mining), and hybrid (both, with a bonus multiplier). All routes are
//! rate-limited per node and capped per epoch.

use hashbrown::HashMap;

use crate::common::{epoch_for, Hash256, NodeId};
use crate::error::{Error, Result};
use crate::event::IssuanceMethod;
use crate::keys::KeyType;
use crate::pow::{self, PowConfig, PowSolution};
use crate::state::NodeState;

/// Which issuance route a node should take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceRoute {
    PowOnly,
    PostakeOnly,
    Hybrid,
}

/// Issuance policy knobs
#[derive(Debug, Clone)]
pub struct HybridPolicy {
    /// Minimum contribution score to skip PoW entirely
    pub min_contribution_score: u32,
    /// Bonus multiplier for nodes that present both proofs
    pub hybrid_multiplier: f32,
    /// Relative weight of PoW in hybrid scoring
    pub pow_weight: f32,
    /// Relative weight of contribution in hybrid scoring
    pub postake_weight: f32,
    /// Hard cap on keys per node per epoch
    pub max_keys_per_epoch: u32,
    /// Minimum seconds between issuances per node
    pub min_seconds_between_issuance: u64,
    /// PoW cost parameters for this deployment
    pub pow_config: PowConfig,
}

impl Default for HybridPolicy {
    fn default() -> Self {
        Self {
            min_contribution_score: 100,
            hybrid_multiplier: 1.5,
            pow_weight: 0.4,
            postake_weight: 0.6,
            max_keys_per_epoch: 10,
            min_seconds_between_issuance: 60,
            pow_config: PowConfig::default(),
        }
    }
}

impl HybridPolicy {
    /// The two weights must form a convex combination
    pub fn is_valid(&self) -> bool {
        (self.pow_weight + self.postake_weight - 1.0).abs() < f32::EPSILON
    }
}

/// Record of one successful issuance
#[derive(Debug, Clone)]
pub struct IssuanceRecord {
    pub node_id: NodeId,
    pub route: IssuanceRoute,
    pub method: IssuanceMethod,
    pub key_type: KeyType,
    pub key_count: u32,
    pub proof: Hash256,
    pub issued_at: u64,
    pub epoch: u64,
}

/// Contribution score derived from a node's projected metrics.
///
/// Hours of uptime, hosted Things, and explicit contribution events all
/// count; the weights mirror the reputation deltas for the same actions.
pub fn contribution_score(state: &NodeState) -> u32 {
    let uptime_hours = (state.uptime_seconds / 3600) as u32;
    let bandwidth_mib = (state.bandwidth_contributed / (1024 * 1024)) as u32;
    uptime_hours.saturating_mul(5)
        + bandwidth_mib
        + state.postake_contributions.saturating_mul(15)
        + (state.hosted_things.len() as u32).saturating_mul(10)
        + state.pow_solutions.saturating_mul(2)
}

/// A node with no uptime, no hosted Things, and no routed traffic has no
/// history to stake on
pub fn is_new_node(state: &NodeState) -> bool {
    state.uptime_seconds == 0
        && state.hosted_things.is_empty()
        && state.bandwidth_contributed == 0
}

/// Coordinates all key issuance routes
pub struct HybridCoordinator {
    policy: HybridPolicy,
    issuance_history: HashMap<NodeId, Vec<IssuanceRecord>>,
    last_issuance_time: HashMap<NodeId, u64>,
    epoch_key_counts: HashMap<(NodeId, u64), u32>,

    total_keys_issued: u64,
    pow_issuances: u64,
    postake_issuances: u64,
    hybrid_issuances: u64,
}

impl HybridCoordinator {
    pub fn new(policy: HybridPolicy) -> Result<Self> {
        if !policy.is_valid() {
            return Err(Error::InvalidArgument(
                "pow_weight + postake_weight must equal 1.0".into(),
            ));
        }
        Ok(Self {
            policy,
            issuance_history: HashMap::new(),
            last_issuance_time: HashMap::new(),
            epoch_key_counts: HashMap::new(),
            total_keys_issued: 0,
            pow_issuances: 0,
            postake_issuances: 0,
            hybrid_issuances: 0,
        })
    }

    pub fn policy(&self) -> &HybridPolicy {
        &self.policy
    }

    /// Rate limit and epoch cap shared by every route
    fn check_limits(&self, node: &NodeId, key_count: u32, now: u64) -> Result<()> {
        if key_count == 0 {
            return Err(Error::InvalidArgument("key_count must be positive".into()));
        }
        if let Some(&last) = self.last_issuance_time.get(node) {
            if now.saturating_sub(last) < self.policy.min_seconds_between_issuance {
                return Err(Error::KeyQuotaExceeded(format!(
                    "issuance rate limited, wait {}s",
                    self.policy.min_seconds_between_issuance - now.saturating_sub(last)
                )));
            }
        }
        let epoch = epoch_for(now);
        let issued = self
            .epoch_key_counts
            .get(&(*node, epoch))
            .copied()
            .unwrap_or(0);
        if issued + key_count > self.policy.max_keys_per_epoch {
            return Err(Error::KeyQuotaExceeded(format!(
                "epoch cap reached ({issued}/{} this epoch)",
                self.policy.max_keys_per_epoch
            )));
        }
        Ok(())
    }

    fn record(&mut self, record: IssuanceRecord) -> IssuanceRecord {
        self.total_keys_issued += record.key_count as u64;
        self.last_issuance_time.insert(record.node_id, record.issued_at);
        *self
            .epoch_key_counts
            .entry((record.node_id, record.epoch))
            .or_insert(0) += record.key_count;
        self.issuance_history
            .entry(record.node_id)
            .or_default()
            .push(record.clone());
        record
    }

    /// Issue keys against a proof-of-work solution
    pub fn request_via_pow(
        &mut self,
        node: &NodeState,
        solution: &PowSolution,
        key_type: KeyType,
        key_count: u32,
        now: u64,
    ) -> Result<IssuanceRecord> {
        self.check_limits(&node.node_id, key_count, now)?;
        if solution.node_id != node.node_id {
            return Err(Error::PowInvalidSolution);
        }
        pow::verify(solution, &self.policy.pow_config)?;

        self.pow_issuances += 1;
        log::info!(
            "pow issuance: {key_count} {} key(s) to {:?}",
            key_type.as_str(),
            node.node_id
        );
        Ok(self.record(IssuanceRecord {
            node_id: node.node_id,
            route: IssuanceRoute::PowOnly,
            method: IssuanceMethod::Pow,
            key_type,
            key_count,
            proof: solution.hash,
            issued_at: now,
            epoch: epoch_for(now),
        }))
    }

    /// Issue keys against contribution history alone
    pub fn request_via_postake(
        &mut self,
        node: &NodeState,
        key_type: KeyType,
        key_count: u32,
        now: u64,
    ) -> Result<IssuanceRecord> {
        self.check_limits(&node.node_id, key_count, now)?;
        if is_new_node(node) {
            return Err(Error::PermissionDenied(
                "new nodes must bootstrap via proof-of-work".into(),
            ));
        }
        let score = contribution_score(node);
        if score < self.policy.min_contribution_score {
            return Err(Error::ReputationTooLow {
                score: score as i32,
                required: self.policy.min_contribution_score as i32,
            });
        }

        self.postake_issuances += 1;
        log::info!(
            "postake issuance: {key_count} {} key(s) to {:?} (score {score})",
            key_type.as_str(),
            node.node_id
        );
        Ok(self.record(IssuanceRecord {
            node_id: node.node_id,
            route: IssuanceRoute::PostakeOnly,
            method: IssuanceMethod::Postake,
            key_type,
            key_count,
            proof: [0u8; 32],
            issued_at: now,
            epoch: epoch_for(now),
        }))
    }

    /// Issue keys against both proofs; the granted count gets the hybrid
    /// bonus multiplier (rounded) but still honors the epoch cap
    pub fn request_hybrid(
        &mut self,
        node: &NodeState,
        solution: &PowSolution,
        key_type: KeyType,
        key_count: u32,
        now: u64,
    ) -> Result<IssuanceRecord> {
        let bonus_count = (key_count as f32 * self.policy.hybrid_multiplier).round() as u32;
        self.check_limits(&node.node_id, bonus_count, now)?;
        if solution.node_id != node.node_id {
            return Err(Error::PowInvalidSolution);
        }
        pow::verify(solution, &self.policy.pow_config)?;
        if is_new_node(node) {
            return Err(Error::PermissionDenied(
                "hybrid issuance needs contribution history".into(),
            ));
        }

        self.hybrid_issuances += 1;
        log::info!(
            "hybrid issuance: {bonus_count} {} key(s) to {:?} ({key_count} base)",
            key_type.as_str(),
            node.node_id
        );
        Ok(self.record(IssuanceRecord {
            node_id: node.node_id,
            route: IssuanceRoute::Hybrid,
            method: IssuanceMethod::Pow,
            key_type,
            key_count: bonus_count,
            proof: solution.hash,
            issued_at: now,
            epoch: epoch_for(now),
        }))
    }

    /// Recommend the cheapest viable route for a node
    pub fn recommend(&self, node: &NodeState) -> IssuanceRoute {
        if is_new_node(node) {
            return IssuanceRoute::PowOnly;
        }
        if contribution_score(node) >= self.policy.min_contribution_score {
            IssuanceRoute::Hybrid
        } else {
            IssuanceRoute::PowOnly
        }
    }

    pub fn issuance_history(&self, node: &NodeId) -> &[IssuanceRecord] {
        self.issuance_history
            .get(node)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn keys_issued_in_epoch(&self, node: &NodeId, epoch: u64) -> u32 {
        self.epoch_key_counts
            .get(&(*node, epoch))
            .copied()
            .unwrap_or(0)
    }

    pub fn last_issuance_time(&self, node: &NodeId) -> Option<u64> {
        self.last_issuance_time.get(node).copied()
    }

    pub fn total_keys_issued(&self) -> u64 {
        self.total_keys_issued
    }

    pub fn route_counters(&self) -> (u64, u64, u64) {
        (self.pow_issuances, self.postake_issuances, self.hybrid_issuances)
    }
}
