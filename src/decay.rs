//! Key and Thing decay
//!
//! Unused capability keys evaporate: every epoch the scheduler walks the
//! key inventory and produces decay records for grants that have expired,
//! whose owners have gone dark, or whose owners stopped meeting the
//! performance bar. Identity keys never decay. Things decay too, when
//! their redundancy collapses or nobody has touched them for months.
//!
//! The scheduler only *decides*; applying a decay means emitting a
//! KEY_DECAYED event through the ledger so every node converges on the
//! same balances.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::common::{constants, ContentHash, NodeId};
use crate::keys::{KeyRegistry, KeyType};

/// Why a key or Thing decayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecayReason {
    Inactivity,
    Expiration,
    ResourceShortage,
    PoorPerformance,
    Violation,
}

impl DecayReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactivity => "INACTIVITY",
            Self::Expiration => "EXPIRATION",
            Self::ResourceShortage => "RESOURCE_SHORTAGE",
            Self::PoorPerformance => "POOR_PERFORMANCE",
            Self::Violation => "VIOLATION",
        }
    }
}

/// Per-key-type decay rules
#[derive(Debug, Clone)]
pub struct DecayPolicy {
    /// Grant lifetime without use
    pub max_age_seconds: u64,
    /// Owner inactivity that triggers decay
    pub inactivity_threshold: u64,
    pub requires_activity: bool,
    pub min_actions_per_epoch: u32,
    pub requires_performance: bool,
    pub min_success_rate: f32,
}

impl Default for DecayPolicy {
    fn default() -> Self {
        Self {
            max_age_seconds: constants::KEY_DECAY_PERIOD_SECONDS,
            inactivity_threshold: 7 * 24 * 3600,
            requires_activity: false,
            min_actions_per_epoch: 0,
            requires_performance: false,
            min_success_rate: 0.5,
        }
    }
}

/// Thing cleanup rules
#[derive(Debug, Clone)]
pub struct ThingDecayPolicy {
    pub max_age_seconds: u64,
    pub min_hosts_required: u32,
    pub inactivity_threshold: u64,
}

impl Default for ThingDecayPolicy {
    fn default() -> Self {
        Self {
            max_age_seconds: 90 * 24 * 3600,
            min_hosts_required: 2,
            inactivity_threshold: 30 * 24 * 3600,
        }
    }
}

/// One decided key decay, ready to be applied as a KEY_DECAYED event
#[derive(Debug, Clone, PartialEq)]
pub struct KeyDecayEvent {
    pub node_id: NodeId,
    pub key_type: KeyType,
    pub keys_decayed: u32,
    pub reason: DecayReason,
    pub decayed_at: u64,
    pub epoch: u64,
}

/// One decided Thing decay
#[derive(Debug, Clone)]
pub struct ThingDecayEvent {
    pub content_hash: ContentHash,
    pub hosts_removed: Vec<NodeId>,
    pub reason: DecayReason,
    pub decayed_at: u64,
}

#[derive(Debug, Clone, Default)]
struct NodeActivity {
    last_seen: u64,
    actions_this_epoch: HashMap<KeyType, u32>,
    success_rate: f32,
}

#[derive(Debug, Clone, Default)]
struct ThingActivity {
    created_at: u64,
    last_accessed: u64,
}

/// Decides what decays each epoch
pub struct DecayScheduler {
    key_policies: HashMap<KeyType, DecayPolicy>,
    thing_policy: ThingDecayPolicy,

    node_activity: HashMap<NodeId, NodeActivity>,
    thing_activity: HashMap<ContentHash, ThingActivity>,

    key_decay_history: Vec<KeyDecayEvent>,
    thing_decay_history: Vec<ThingDecayEvent>,
}

impl Default for DecayScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl DecayScheduler {
    pub fn new() -> Self {
        let mut key_policies = HashMap::new();
        // Identity keys are exempt entirely; routing keys decay faster when
        // performance drops
        for key_type in KeyType::ALL {
            let mut policy = DecayPolicy::default();
            if key_type == KeyType::Routing {
                policy.requires_performance = true;
            }
            key_policies.insert(key_type, policy);
        }
        Self {
            key_policies,
            thing_policy: ThingDecayPolicy::default(),
            node_activity: HashMap::new(),
            thing_activity: HashMap::new(),
            key_decay_history: Vec::new(),
            thing_decay_history: Vec::new(),
        }
    }

    pub fn set_key_policy(&mut self, key_type: KeyType, policy: DecayPolicy) {
        self.key_policies.insert(key_type, policy);
    }

    pub fn key_policy(&self, key_type: KeyType) -> &DecayPolicy {
        &self.key_policies[&key_type]
    }

    pub fn set_thing_policy(&mut self, policy: ThingDecayPolicy) {
        self.thing_policy = policy;
    }

    // --- activity feeds ---

    pub fn record_node_activity(&mut self, node: NodeId, now: u64) {
        self.node_activity.entry(node).or_default().last_seen = now;
    }

    pub fn record_key_use(&mut self, node: NodeId, key_type: KeyType, now: u64) {
        let activity = self.node_activity.entry(node).or_default();
        activity.last_seen = now;
        *activity.actions_this_epoch.entry(key_type).or_insert(0) += 1;
    }

    pub fn record_node_success_rate(&mut self, node: NodeId, rate: f32) {
        self.node_activity.entry(node).or_default().success_rate = rate;
    }

    pub fn record_thing_access(&mut self, hash: ContentHash, now: u64) {
        let activity = self.thing_activity.entry(hash).or_default();
        if activity.created_at == 0 {
            activity.created_at = now;
        }
        activity.last_accessed = now;
    }

    // --- decay checks ---

    /// Walk the registry and decide which grants decay right now. The
    /// registry is not modified; decays take effect via ledger events.
    pub fn check_key_decay(
        &mut self,
        registry: &KeyRegistry,
        owners: &[NodeId],
        now: u64,
        epoch: u64,
    ) -> Vec<KeyDecayEvent> {
        let mut decays = Vec::new();

        for owner in owners {
            let activity = self.node_activity.get(owner).cloned().unwrap_or_default();
            for key_type in KeyType::ALL {
                // Identity keys never decay
                if key_type == KeyType::Identity {
                    continue;
                }
                let policy = &self.key_policies[&key_type];
                let grants = registry.grants(owner, key_type);
                if grants.is_empty() {
                    continue;
                }

                let mut reason: Option<DecayReason> = None;
                let mut count = 0u32;

                // Owner dark for a week: the whole type decays
                if activity.last_seen > 0
                    && now.saturating_sub(activity.last_seen) >= policy.inactivity_threshold
                {
                    reason = Some(DecayReason::Inactivity);
                    count = grants.len() as u32;
                } else {
                    // Otherwise individual grants expire by age-without-use
                    let expired = grants
                        .iter()
                        .filter(|g| now.saturating_sub(g.last_used_at) >= policy.max_age_seconds)
                        .count() as u32;
                    if expired > 0 {
                        reason = Some(DecayReason::Expiration);
                        count = expired;
                    } else if policy.requires_performance
                        && activity.success_rate > 0.0
                        && activity.success_rate < policy.min_success_rate
                    {
                        reason = Some(DecayReason::PoorPerformance);
                        count = grants.len() as u32;
                    } else if policy.requires_activity {
                        let actions = activity
                            .actions_this_epoch
                            .get(&key_type)
                            .copied()
                            .unwrap_or(0);
                        if actions < policy.min_actions_per_epoch {
                            reason = Some(DecayReason::Inactivity);
                            count = 1;
                        }
                    }
                }

                if let Some(reason) = reason {
                    let event = KeyDecayEvent {
                        node_id: *owner,
                        key_type,
                        keys_decayed: count,
                        reason,
                        decayed_at: now,
                        epoch,
                    };
                    log::info!(
                        "decay: {count} {} key(s) of {owner:?} ({})",
                        key_type.as_str(),
                        reason.as_str()
                    );
                    self.key_decay_history.push(event.clone());
                    decays.push(event);
                }
            }
        }

        // Per-epoch action counters reset after each check
        for activity in self.node_activity.values_mut() {
            activity.actions_this_epoch.clear();
        }

        decays
    }

    /// Decide which Things should be dropped: stale access or redundancy
    /// below the floor
    pub fn check_thing_decay(
        &mut self,
        things: &[(ContentHash, Vec<NodeId>)],
        now: u64,
    ) -> Vec<ThingDecayEvent> {
        let mut decays = Vec::new();
        for (hash, hosts) in things {
            let activity = self.thing_activity.get(hash).cloned().unwrap_or_default();

            let reason = if (hosts.len() as u32) < self.thing_policy.min_hosts_required {
                Some(DecayReason::ResourceShortage)
            } else if activity.last_accessed > 0
                && now.saturating_sub(activity.last_accessed)
                    >= self.thing_policy.inactivity_threshold
            {
                Some(DecayReason::Inactivity)
            } else if activity.created_at > 0
                && now.saturating_sub(activity.created_at) >= self.thing_policy.max_age_seconds
            {
                Some(DecayReason::Expiration)
            } else {
                None
            };

            if let Some(reason) = reason {
                let event = ThingDecayEvent {
                    content_hash: *hash,
                    hosts_removed: hosts.clone(),
                    reason,
                    decayed_at: now,
                };
                self.thing_decay_history.push(event.clone());
                decays.push(event);
            }
        }
        decays
    }

    pub fn key_decay_history(&self, node: &NodeId) -> Vec<&KeyDecayEvent> {
        self.key_decay_history
            .iter()
            .filter(|e| e.node_id == *node)
            .collect()
    }

    pub fn decay_reason_breakdown(&self) -> HashMap<DecayReason, u32> {
        let mut breakdown = HashMap::new();
        for event in &self.key_decay_history {
            *breakdown.entry(event.reason).or_insert(0) += event.keys_decayed;
        }
        breakdown
    }
}

/// Background thread driving periodic decay checks.
///
/// Calls `tick` once per `period`, polling the shared `running` flag at
/// least once a second so shutdown takes effect within one tick interval.
pub struct DecayRunner {
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl DecayRunner {
    pub fn start<F>(period: Duration, running: Arc<AtomicBool>, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let flag = running.clone();
        let handle = std::thread::spawn(move || {
            log::info!("decay runner started (period {period:?})");
            let mut elapsed = Duration::ZERO;
            while flag.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(250));
                elapsed += Duration::from_millis(250);
                if elapsed >= period {
                    elapsed = Duration::ZERO;
                    tick();
                }
            }
            log::info!("decay runner stopped");
        });
        Self {
            handle: Some(handle),
            running,
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DecayRunner {
    fn drop(&mut self) {
        self.stop();
    }
}
