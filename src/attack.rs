//! Attack prevention
//!
//! Advisory defense layers that feed the access gate and reputation
//! deltas. None of them write to the ledger directly: a blocked request
//! is simply refused, and misbehavior surfaces as reputation events
//! emitted by the caller.

use hashbrown::{HashMap, HashSet};

use crate::common::{Hash256, NodeId};
use crate::crypto::PublicKeyBytes;
use crate::pow::check_difficulty;
use crate::reputation::ReputationAction;

/// Rate limit policy: token bucket plus an hourly hard window
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub max_requests_per_minute: u32,
    pub max_requests_per_hour: u32,
    pub burst_size: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 60,
            max_requests_per_hour: 1000,
            burst_size: 10,
        }
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: u64,
    hour_window_start: u64,
    requests_this_hour: u32,
}

/// Token-bucket rate limiter keyed by node id.
///
/// The bucket holds `burst_size` tokens and refills at
/// `max_requests_per_minute / 60` per second; the hourly window is a hard
/// cap on top.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    buckets: HashMap<NodeId, TokenBucket>,
    total_requests: u64,
    blocked_requests: u64,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            buckets: HashMap::new(),
            total_requests: 0,
            blocked_requests: 0,
        }
    }

    pub fn allow_request(&mut self, id: &NodeId, now: u64) -> bool {
        self.total_requests += 1;
        let policy = &self.policy;
        let bucket = self.buckets.entry(*id).or_insert_with(|| TokenBucket {
            tokens: policy.burst_size as f64,
            last_refill: now,
            hour_window_start: now,
            requests_this_hour: 0,
        });

        // Refill from elapsed time
        let elapsed = now.saturating_sub(bucket.last_refill) as f64;
        let rate_per_second = policy.max_requests_per_minute as f64 / 60.0;
        bucket.tokens =
            (bucket.tokens + elapsed * rate_per_second).min(policy.burst_size as f64);
        bucket.last_refill = now;

        // Hourly window
        if now.saturating_sub(bucket.hour_window_start) >= 3600 {
            bucket.hour_window_start = now;
            bucket.requests_this_hour = 0;
        }
        if bucket.requests_this_hour >= policy.max_requests_per_hour {
            self.blocked_requests += 1;
            return false;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.requests_this_hour += 1;
            true
        } else {
            self.blocked_requests += 1;
            false
        }
    }

    pub fn reset(&mut self, id: &NodeId) {
        self.buckets.remove(id);
    }

    /// Drop buckets idle for an hour
    pub fn cleanup_stale(&mut self, now: u64) {
        self.buckets
            .retain(|_, b| now.saturating_sub(b.last_refill) < 3600);
    }

    pub fn counters(&self) -> (u64, u64) {
        (self.total_requests, self.blocked_requests)
    }
}

/// Sybil defense: new identities must pay for themselves
pub struct SybilDefense {
    min_pow_difficulty: u32,
    activity_log: HashMap<NodeId, u32>,
}

impl SybilDefense {
    pub fn new(min_pow_difficulty: u32) -> Self {
        Self {
            min_pow_difficulty,
            activity_log: HashMap::new(),
        }
    }

    /// A joining identity must present a proof hash meeting the difficulty
    pub fn validate_new_identity(&self, _node_id: &NodeId, pow_proof: &Hash256) -> bool {
        check_difficulty(pow_proof, self.min_pow_difficulty)
    }

    /// Heuristic suspicion score in `[0.0, 1.0]`: very young identities
    /// with few connections look like batch-minted sybils
    pub fn sybil_score(&self, connections: usize, join_time: u64, now: u64) -> f32 {
        let age_hours = now.saturating_sub(join_time) as f32 / 3600.0;
        let age_factor = (1.0 - age_hours / 24.0).clamp(0.0, 1.0);
        let connection_factor = (1.0 - connections as f32 / 10.0).clamp(0.0, 1.0);
        (age_factor * 0.6 + connection_factor * 0.4).clamp(0.0, 1.0)
    }

    pub fn record_activity(&mut self, node_id: NodeId) {
        *self.activity_log.entry(node_id).or_insert(0) += 1;
    }
}

/// Per-IP connection limits with timed blocks
pub struct DdosMitigation {
    max_connections_per_ip: usize,
    ip_connections: HashMap<String, usize>,
    connection_times: HashMap<String, Vec<u64>>,
    blocked_ips: HashMap<String, u64>,
    total_connections: u64,
    blocked_connections: u64,
}

/// Connections per minute across all IPs that reads as an attack
const ATTACK_THRESHOLD_PER_MINUTE: usize = 50;

impl DdosMitigation {
    pub fn new(max_connections_per_ip: usize) -> Self {
        Self {
            max_connections_per_ip,
            ip_connections: HashMap::new(),
            connection_times: HashMap::new(),
            blocked_ips: HashMap::new(),
            total_connections: 0,
            blocked_connections: 0,
        }
    }

    pub fn allow_connection(&mut self, ip: &str, now: u64) -> bool {
        if self.is_blocked(ip, now) {
            self.blocked_connections += 1;
            return false;
        }
        let active = self.ip_connections.get(ip).copied().unwrap_or(0);
        if active >= self.max_connections_per_ip {
            self.blocked_connections += 1;
            log::warn!("connection cap reached for {ip}");
            return false;
        }
        true
    }

    pub fn record_connection(&mut self, ip: &str, now: u64) {
        *self.ip_connections.entry(ip.to_string()).or_insert(0) += 1;
        self.connection_times
            .entry(ip.to_string())
            .or_default()
            .push(now);
        self.total_connections += 1;
    }

    pub fn close_connection(&mut self, ip: &str) {
        if let Some(count) = self.ip_connections.get_mut(ip) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn block_ip(&mut self, ip: &str, duration_seconds: u64, now: u64) {
        log::warn!("blocking {ip} for {duration_seconds}s");
        self.blocked_ips
            .insert(ip.to_string(), now + duration_seconds);
    }

    pub fn is_blocked(&self, ip: &str, now: u64) -> bool {
        self.blocked_ips
            .get(ip)
            .map(|&expiry| now < expiry)
            .unwrap_or(false)
    }

    /// Aggregate connection rate over the last minute reads as an attack
    pub fn detect_attack_pattern(&self, now: u64) -> bool {
        let recent: usize = self
            .connection_times
            .values()
            .map(|times| {
                times
                    .iter()
                    .filter(|&&t| now.saturating_sub(t) < 60)
                    .count()
            })
            .sum();
        recent > ATTACK_THRESHOLD_PER_MINUTE
    }

    /// 0.0 quiet, 1.0 severe
    pub fn threat_level(&self, now: u64) -> f32 {
        let recent: usize = self
            .connection_times
            .values()
            .map(|times| {
                times
                    .iter()
                    .filter(|&&t| now.saturating_sub(t) < 60)
                    .count()
            })
            .sum();
        (recent as f32 / (ATTACK_THRESHOLD_PER_MINUTE as f32 * 2.0)).clamp(0.0, 1.0)
    }

    pub fn cleanup_expired(&mut self, now: u64) {
        self.blocked_ips.retain(|_, &mut expiry| now < expiry);
        for times in self.connection_times.values_mut() {
            times.retain(|&t| now.saturating_sub(t) < 3600);
        }
        self.connection_times.retain(|_, v| !v.is_empty());
    }

    pub fn counters(&self) -> (u64, u64, usize) {
        (
            self.total_connections,
            self.blocked_connections,
            self.blocked_ips.len(),
        )
    }
}

/// Detects identity forks: the same NodeID presenting different keys
#[derive(Default)]
pub struct ForkDetector {
    node_keys: HashMap<NodeId, Vec<PublicKeyBytes>>,
    forked_nodes: HashSet<NodeId>,
}

impl ForkDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_node_key(&mut self, node_id: NodeId, public_key: PublicKeyBytes) {
        let keys = self.node_keys.entry(node_id).or_default();
        if !keys.contains(&public_key) {
            keys.push(public_key);
            if keys.len() > 1 {
                log::error!("identity fork: {node_id:?} has {} distinct keys", keys.len());
                self.forked_nodes.insert(node_id);
            }
        }
    }

    /// True if the claimed key conflicts with one we have seen
    pub fn detect_fork(&mut self, node_id: NodeId, claimed_key: &PublicKeyBytes) -> bool {
        self.record_node_key(node_id, *claimed_key);
        self.forked_nodes.contains(&node_id)
    }

    pub fn detected_forks(&self) -> Vec<NodeId> {
        self.forked_nodes.iter().copied().collect()
    }

    pub fn fork_count(&self) -> usize {
        self.forked_nodes.len()
    }
}

/// Statistics snapshot for monitoring
#[derive(Debug, Clone, Default)]
pub struct AttackStatistics {
    pub total_connections: u64,
    pub blocked_connections: u64,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub blocked_ips: usize,
    pub detected_forks: usize,
    pub threat_level: f32,
}

/// Unified front for all defense layers
pub struct AttackPrevention {
    rate_limiter: RateLimiter,
    sybil_defense: SybilDefense,
    ddos: DdosMitigation,
    fork_detector: ForkDetector,
}

impl AttackPrevention {
    pub fn new(rate_policy: RateLimitPolicy, min_pow_difficulty: u32) -> Self {
        Self {
            rate_limiter: RateLimiter::new(rate_policy),
            sybil_defense: SybilDefense::new(min_pow_difficulty),
            ddos: DdosMitigation::new(10),
            fork_detector: ForkDetector::new(),
        }
    }

    /// Gate an incoming connection. A fork detection also yields the
    /// reputation penalty the caller should publish.
    pub fn validate_connection(
        &mut self,
        ip: &str,
        node_id: NodeId,
        claimed_key: &PublicKeyBytes,
        now: u64,
    ) -> (bool, Option<ReputationAction>) {
        if !self.ddos.allow_connection(ip, now) {
            return (false, None);
        }
        if self.fork_detector.detect_fork(node_id, claimed_key) {
            return (false, Some(ReputationAction::NetworkViolation));
        }
        self.ddos.record_connection(ip, now);
        (true, None)
    }

    pub fn connection_closed(&mut self, ip: &str) {
        self.ddos.close_connection(ip);
    }

    pub fn validate_request(&mut self, node_id: &NodeId, now: u64) -> bool {
        self.rate_limiter.allow_request(node_id, now)
    }

    pub fn validate_new_identity(&self, node_id: &NodeId, pow_proof: &Hash256) -> bool {
        self.sybil_defense.validate_new_identity(node_id, pow_proof)
    }

    pub fn rate_limiter_mut(&mut self) -> &mut RateLimiter {
        &mut self.rate_limiter
    }

    pub fn ddos_mut(&mut self) -> &mut DdosMitigation {
        &mut self.ddos
    }

    pub fn sybil_defense(&self) -> &SybilDefense {
        &self.sybil_defense
    }

    pub fn fork_detector_mut(&mut self) -> &mut ForkDetector {
        &mut self.fork_detector
    }

    pub fn is_under_attack(&self, now: u64) -> bool {
        self.ddos.detect_attack_pattern(now)
    }

    /// Periodic maintenance
    pub fn tick(&mut self, now: u64) {
        self.rate_limiter.cleanup_stale(now);
        self.ddos.cleanup_expired(now);
    }

    pub fn statistics(&self, now: u64) -> AttackStatistics {
        let (total_requests, blocked_requests) = self.rate_limiter.counters();
        let (total_connections, blocked_connections, blocked_ips) = self.ddos.counters();
        AttackStatistics {
            total_connections,
            blocked_connections,
            total_requests,
            blocked_requests,
            blocked_ips,
            detected_forks: self.fork_detector.fork_count(),
            threat_level: self.ddos.threat_level(now),
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
    fn test_rate_limiter_burst_then_refill() {
        let mut limiter = RateLimiter::new(RateLimitPolicy::default());
        let id = node(1);
        let start = 10_000;

        // The first 10 requests pass immediately on the full bucket
        for _ in 0..10 {
            assert!(limiter.allow_request(&id, start));
        }
        // The 11th at the same instant is out of tokens
        assert!(!limiter.allow_request(&id, start));

        // Within the same minute, refill allows about one per second; the
        // 71st request in that minute must fail
        let mut passed = 10;
        for second in 1..60 {
            if limiter.allow_request(&id, start + second) {
                passed += 1;
            }
        }
        assert!(passed <= 70, "no more than 70 requests in the first minute");
        assert!(!limiter.allow_request(&id, start + 59));

        // Over the next minute at least 60 more pass
        let mut next_minute_passed = 0;
        for second in 60..120 {
            if limiter.allow_request(&id, start + second) {
                next_minute_passed += 1;
            }
        }
        assert!(next_minute_passed >= 59);
    }

    #[test]
    fn test_rate_limiter_hourly_cap() {
        let policy = RateLimitPolicy {
            max_requests_per_minute: 60000,
            max_requests_per_hour: 5,
            burst_size: 10,
        };
        let mut limiter = RateLimiter::new(policy);
        let id = node(1);

        for i in 0..5 {
            assert!(limiter.allow_request(&id, 1000 + i));
        }
        assert!(!limiter.allow_request(&id, 1010));
        // Next hour window opens
        assert!(limiter.allow_request(&id, 1000 + 3600));
    }

    #[test]
    fn test_rate_limiter_per_identity() {
        let mut limiter = RateLimiter::new(RateLimitPolicy::default());
        for _ in 0..10 {
            assert!(limiter.allow_request(&node(1), 1000));
        }
        assert!(!limiter.allow_request(&node(1), 1000));
        // A different identity has its own bucket
        assert!(limiter.allow_request(&node(2), 1000));
    }

    #[test]
    fn test_sybil_pow_gate() {
        let defense = SybilDefense::new(8);
        let mut good = [0xFFu8; 32];
        good[31] = 0x00; // 8 trailing zero bits
        let bad = [0xFFu8; 32];

        assert!(defense.validate_new_identity(&node(1), &good));
        assert!(!defense.validate_new_identity(&node(1), &bad));
    }

    #[test]
    fn test_sybil_score_shape() {
        let defense = SybilDefense::new(8);
        let now = 100_000;
        // Fresh node, no connections: highly suspicious
        let fresh = defense.sybil_score(0, now, now);
        // Day-old node with many connections: clean
        let seasoned = defense.sybil_score(20, now - 86_400, now);
        assert!(fresh > 0.9);
        assert!(seasoned < 0.1);
    }

    #[test]
    fn test_ddos_connection_cap() {
        let mut ddos = DdosMitigation::new(3);
        let now = 1000;
        for _ in 0..3 {
            assert!(ddos.allow_connection("10.0.0.1", now));
            ddos.record_connection("10.0.0.1", now);
        }
        assert!(!ddos.allow_connection("10.0.0.1", now));

        // Closing one connection frees a slot
        ddos.close_connection("10.0.0.1");
        assert!(ddos.allow_connection("10.0.0.1", now));
    }

    #[test]
    fn test_ddos_block_with_ttl() {
        let mut ddos = DdosMitigation::new(10);
        ddos.block_ip("10.0.0.2", 300, 1000);

        assert!(!ddos.allow_connection("10.0.0.2", 1100));
        assert!(ddos.is_blocked("10.0.0.2", 1299));
        assert!(!ddos.is_blocked("10.0.0.2", 1300));
        assert!(ddos.allow_connection("10.0.0.2", 1300));

        ddos.cleanup_expired(1300);
        let (_, _, blocked) = ddos.counters();
        assert_eq!(blocked, 0);
    }

    #[test]
    fn test_attack_pattern_detection() {
        let mut ddos = DdosMitigation::new(1000);
        let now = 5000;
        for i in 0..60 {
            ddos.record_connection(&format!("10.0.0.{i}"), now);
        }
        assert!(ddos.detect_attack_pattern(now));
        assert!(ddos.threat_level(now) > 0.5);
        // A minute later the spike has aged out
        assert!(!ddos.detect_attack_pattern(now + 120));
    }

    #[test]
    fn test_fork_detector() {
        let mut detector = ForkDetector::new();
        let key_a = [1u8; 32];
        let key_b = [2u8; 32];

        assert!(!detector.detect_fork(node(1), &key_a));
        // Same key again: consistent
        assert!(!detector.detect_fork(node(1), &key_a));
        // Different key for the same node id: fork
        assert!(detector.detect_fork(node(1), &key_b));
        assert_eq!(detector.detected_forks(), vec![node(1)]);
    }

    #[test]
    fn test_coordinator_fork_yields_penalty() {
        let mut prevention = AttackPrevention::new(RateLimitPolicy::default(), 0);
        let now = 1000;

        let (allowed, penalty) =
            prevention.validate_connection("10.0.0.1", node(1), &[1; 32], now);
        assert!(allowed);
        assert!(penalty.is_none());

        let (allowed, penalty) =
            prevention.validate_connection("10.0.0.2", node(1), &[2; 32], now);
        assert!(!allowed);
        assert_eq!(penalty, Some(ReputationAction::NetworkViolation));

        let stats = prevention.statistics(now);
        assert_eq!(stats.detected_forks, 1);
    }
}
