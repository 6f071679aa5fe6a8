//! State reconciliation
//!
//! When peers disagree about the ledger, the reconciler classifies the
//! conflict and picks a merge strategy:
//!
//! | conflict            | strategy        |
//! |---------------------|-----------------|
//! | hash mismatch       | highest work    |
//! | missing events      | merge both      |
//! | timestamp anomaly   | prefer local    |
//! | epoch fork          | manual review   |
//!
//! With three or more peers available, quorum consensus overrides the
//! table: each peer's `(epoch, hash)` votes and a state adopted by a
//! strict majority wins. "Work" is the count of PoW-method KEY_ISSUED
//! events, the only measure both sides can verify from the wire.

use hashbrown::{HashMap, HashSet};

use crate::common::{constants, Hash256, NodeId};
use crate::event::{EventType, KeyIssuanceData, IssuanceMethod, LedgerEvent};
use crate::ledger::{AppendError, EventLedger};

/// Kinds of divergence between two ledgers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    /// Same epoch, different latest hashes
    HashMismatch,
    /// Divergent long-range histories with no common suffix
    EpochFork,
    /// One side holds events the other lacks
    MissingEvents,
    /// Remote events claim timestamps in the future
    TimestampAnomaly,
}

/// A detected divergence with one peer
#[derive(Debug, Clone)]
pub struct StateConflict {
    pub conflict_type: ConflictType,
    pub epoch: u64,
    pub local_hash: Hash256,
    pub remote_hash: Hash256,
    pub remote_events: Vec<LedgerEvent>,
    pub peer_id: NodeId,
    pub detected_at: u64,
}

/// How to resolve a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    PreferLocal,
    PreferRemote,
    MergeBoth,
    HighestWork,
    QuorumConsensus,
    ManualReview,
}

/// Outcome of a merge attempt
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub success: bool,
    pub strategy_used: MergeStrategy,
    pub events_added: u64,
    pub conflicts_resolved: u64,
    pub final_hash: Hash256,
    pub final_epoch: u64,
    pub error_message: String,
}

/// Count PoW-derived KEY_ISSUED events: the verifiable work measure
pub fn proof_of_work_count(events: &[LedgerEvent]) -> u32 {
    events
        .iter()
        .filter(|e| e.event_type == EventType::KeyIssued)
        .filter_map(|e| KeyIssuanceData::from_bytes(&e.payload).ok())
        .filter(|d| d.method == IssuanceMethod::Pow)
        .count() as u32
}

/// Reconciles divergent ledger states
pub struct StateReconciliation {
    conflicts_detected: u64,
    conflicts_resolved: u64,
    reconciliations: u64,
}

impl Default for StateReconciliation {
    fn default() -> Self {
        Self::new()
    }
}

impl StateReconciliation {
    pub fn new() -> Self {
        Self {
            conflicts_detected: 0,
            conflicts_resolved: 0,
            reconciliations: 0,
        }
    }

    /// Compare our ledger with a peer's advertised state. `None` means no
    /// conflict.
    pub fn detect_conflict(
        &mut self,
        ledger: &EventLedger,
        peer_id: &NodeId,
        peer_epoch: u64,
        peer_hash: &Hash256,
        peer_events: Vec<LedgerEvent>,
        now: u64,
    ) -> Option<StateConflict> {
        let local_hash = ledger.latest_hash();
        if local_hash == *peer_hash {
            return None;
        }

        let conflict_type =
            self.classify(ledger, peer_epoch, &peer_events, now);
        self.conflicts_detected += 1;
        log::warn!(
            "conflict with {peer_id:?} at epoch {peer_epoch}: {conflict_type:?}"
        );
        Some(StateConflict {
            conflict_type,
            epoch: peer_epoch,
            local_hash,
            remote_hash: *peer_hash,
            remote_events: peer_events,
            peer_id: *peer_id,
            detected_at: now,
        })
    }

    fn classify(
        &self,
        ledger: &EventLedger,
        peer_epoch: u64,
        peer_events: &[LedgerEvent],
        now: u64,
    ) -> ConflictType {
        // Future-dated remote events trump every other classification
        let anomaly = peer_events
            .iter()
            .any(|e| e.timestamp > now + constants::MAX_CLOCK_SKEW_SECONDS);
        if anomaly {
            return ConflictType::TimestampAnomaly;
        }

        if peer_events.len() != ledger.event_count() {
            return ConflictType::MissingEvents;
        }

        // Equal counts, different hashes. If the histories share nothing,
        // the divergence is long-range.
        let local_ids: HashSet<Hash256> =
            ledger.all_events().iter().map(|e| e.event_id).collect();
        let shares_history = peer_events.iter().any(|e| local_ids.contains(&e.event_id));
        if !shares_history && !peer_events.is_empty() && !local_ids.is_empty() {
            return ConflictType::EpochFork;
        }
        let _ = peer_epoch;
        ConflictType::HashMismatch
    }

    /// The strategy table
    pub fn choose_strategy(&self, conflict: &StateConflict) -> MergeStrategy {
        match conflict.conflict_type {
            ConflictType::HashMismatch => MergeStrategy::HighestWork,
            ConflictType::MissingEvents => MergeStrategy::MergeBoth,
            ConflictType::TimestampAnomaly => MergeStrategy::PreferLocal,
            ConflictType::EpochFork => MergeStrategy::ManualReview,
        }
    }

    /// Ingest remote events, re-trying until the chains stop advancing.
    /// Out-of-order delivery inside the batch is handled by iterating to a
    /// fixed point; invalid events are dropped.
    fn ingest_remote(&self, ledger: &mut EventLedger, events: &[LedgerEvent]) -> u64 {
        let mut remaining: Vec<&LedgerEvent> = events.iter().collect();
        let mut added = 0u64;
        loop {
            let before = remaining.len();
            remaining.retain(|event| match ledger.append_external((*event).clone()) {
                Ok(()) => {
                    added += 1;
                    false
                }
                Err(AppendError::Duplicate) => false,
                Err(AppendError::ChainBreak) | Err(AppendError::UnknownSource) => true,
                Err(_) => false,
            });
            if remaining.is_empty() || remaining.len() == before {
                break;
            }
        }
        added
    }

    /// Apply a strategy to a conflict
    pub fn resolve_conflict(
        &mut self,
        ledger: &mut EventLedger,
        conflict: &StateConflict,
        strategy: MergeStrategy,
    ) -> MergeResult {
        self.reconciliations += 1;
        let mut result = MergeResult {
            success: true,
            strategy_used: strategy,
            events_added: 0,
            conflicts_resolved: 0,
            final_hash: ledger.latest_hash(),
            final_epoch: ledger.highest_epoch(),
            error_message: String::new(),
        };

        match strategy {
            MergeStrategy::PreferLocal => {
                // Keep our state; nothing to do
            }
            MergeStrategy::PreferRemote | MergeStrategy::QuorumConsensus => {
                result.events_added = self.ingest_remote(ledger, &conflict.remote_events);
            }
            MergeStrategy::MergeBoth => {
                // Union by event id: our events stay, theirs are ingested
                result.events_added = self.ingest_remote(ledger, &conflict.remote_events);
            }
            MergeStrategy::HighestWork => {
                let local_work = proof_of_work_count(ledger.all_events());
                let remote_work = proof_of_work_count(&conflict.remote_events);
                log::info!(
                    "highest-work merge: local {local_work}, remote {remote_work}"
                );
                if remote_work > local_work {
                    result.events_added = self.ingest_remote(ledger, &conflict.remote_events);
                }
                // Otherwise our side is heavier and stands
            }
            MergeStrategy::ManualReview => {
                result.success = false;
                result.error_message = format!(
                    "epoch fork with {:?} at epoch {} requires manual review",
                    conflict.peer_id, conflict.epoch
                );
                log::error!("{}", result.error_message);
            }
        }

        if result.success {
            self.conflicts_resolved += 1;
            result.conflicts_resolved = 1;
        }
        result.final_hash = ledger.latest_hash();
        result.final_epoch = ledger.highest_epoch();
        result
    }

    /// Detect, choose, and resolve in one step
    pub fn auto_reconcile(
        &mut self,
        ledger: &mut EventLedger,
        peer_id: &NodeId,
        peer_epoch: u64,
        peer_hash: &Hash256,
        peer_events: Vec<LedgerEvent>,
        now: u64,
    ) -> Option<MergeResult> {
        let conflict =
            self.detect_conflict(ledger, peer_id, peer_epoch, peer_hash, peer_events, now)?;
        let strategy = self.choose_strategy(&conflict);
        Some(self.resolve_conflict(ledger, &conflict, strategy))
    }

    /// Quorum consensus across three or more peer states: each peer's
    /// `(epoch, hash)` votes, and a strict majority wins. If we are not in
    /// the winning state we adopt the winner's events.
    pub fn reconcile_with_quorum(
        &mut self,
        ledger: &mut EventLedger,
        peer_states: &HashMap<NodeId, (u64, Hash256, Vec<LedgerEvent>)>,
    ) -> MergeResult {
        let mut result = MergeResult {
            success: false,
            strategy_used: MergeStrategy::QuorumConsensus,
            events_added: 0,
            conflicts_resolved: 0,
            final_hash: ledger.latest_hash(),
            final_epoch: ledger.highest_epoch(),
            error_message: String::new(),
        };

        if peer_states.len() < 3 {
            result.error_message = "quorum consensus needs at least 3 peers".into();
            return result;
        }

        // Tally votes per (epoch, hash)
        let mut votes: HashMap<(u64, Hash256), usize> = HashMap::new();
        for (epoch, hash, _) in peer_states.values() {
            *votes.entry((*epoch, *hash)).or_insert(0) += 1;
        }
        let total = peer_states.len();
        let winner = votes
            .iter()
            .find(|(_, &count)| count * 2 > total)
            .map(|((epoch, hash), _)| (*epoch, *hash));

        let Some((win_epoch, win_hash)) = winner else {
            result.error_message = "no majority state among peers".into();
            return result;
        };

        result.success = true;
        self.reconciliations += 1;

        if ledger.latest_hash() == win_hash {
            // We already hold the winning state
            return result;
        }

        // Adopt the diverging events from any peer in the winning state
        if let Some((_, _, events)) = peer_states
            .values()
            .find(|(epoch, hash, _)| *epoch == win_epoch && *hash == win_hash)
        {
            result.events_added = self.ingest_remote(ledger, events);
            self.conflicts_resolved += 1;
            result.conflicts_resolved = 1;
        }
        result.final_hash = ledger.latest_hash();
        result.final_epoch = ledger.highest_epoch();
        result
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.conflicts_detected,
            self.conflicts_resolved,
            self.reconciliations,
        )
    }
}
