//! Append-only event ledger
//!
//! Each node maintains one log of every event it has seen. Events from a
//! single source form a hash chain (`previous_hash` links); chains from
//! different sources are independent and only joined by gossip. The ledger
//! verifies signatures and chain continuity on ingest, indexes events for
//! query, and persists to a count-prefixed binary file.
//!
//! Node public keys are learned from NODE_JOINED events, whose payload is
//! the Ed25519 public key. The key is self-certifying: the source node id
//! must equal `BLAKE3(public_key)`.

use hashbrown::HashMap;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use thiserror::Error;

use crate::common::{constants, now_seconds, Hash256, NodeId, ZERO_HASH};
use crate::crypto::PublicKeyBytes;
use crate::error::{Error as CrateError, Result};
use crate::event::{EventType, LedgerEvent};
use crate::identity::NodeIdentity;

/// Why an external event was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AppendError {
    #[error("event signature invalid")]
    InvalidSignature,
    #[error("previous_hash does not match the source's chain tip")]
    ChainBreak,
    #[error("event timestamp outside clock tolerance")]
    ClockSkew,
    #[error("event already present")]
    Duplicate,
    #[error("no public key known for source node")]
    UnknownSource,
}

/// Summary counters over the ledger contents
#[derive(Debug, Clone, Default)]
pub struct LedgerStatistics {
    pub total_events: usize,
    pub total_nodes: usize,
    pub total_keys_issued: u64,
    pub oldest_event_timestamp: u64,
    pub newest_event_timestamp: u64,
}

/// The append-only, per-source hash-chained event log
pub struct EventLedger {
    identity: Arc<NodeIdentity>,

    // Append-only storage plus lookup index
    events: Vec<LedgerEvent>,
    event_lookup: HashMap<Hash256, usize>,

    // Query indices
    events_by_node: HashMap<NodeId, Vec<usize>>,
    events_by_type: HashMap<EventType, Vec<usize>>,

    // Chain tip per source node; advances only on successful append
    chain_tips: HashMap<NodeId, Hash256>,

    // Public keys learned from NODE_JOINED events
    node_keys: HashMap<NodeId, PublicKeyBytes>,

    // Hash of the most recently appended event (any source)
    latest_hash: Hash256,

    // Subscribers receive every accepted event in append order
    subscribers: Vec<mpsc::Sender<LedgerEvent>>,
}

impl EventLedger {
    pub fn new(identity: Arc<NodeIdentity>) -> Self {
        let mut ledger = Self {
            identity,
            events: Vec::new(),
            event_lookup: HashMap::new(),
            events_by_node: HashMap::new(),
            events_by_type: HashMap::new(),
            chain_tips: HashMap::new(),
            node_keys: HashMap::new(),
            latest_hash: ZERO_HASH,
            subscribers: Vec::new(),
        };
        // Our own key is known from the start
        let id = ledger.identity.node_id();
        let pk = ledger.identity.public_key();
        ledger.node_keys.insert(id, pk);
        ledger
    }

    pub fn local_node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    /// Register a channel that receives every accepted event in order.
    /// Disconnected subscribers are dropped on the next send.
    pub fn subscribe(&mut self) -> mpsc::Receiver<LedgerEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Append a locally-originated event. Never fails after input
    /// validation: the event is signed with our key and extends our chain.
    pub fn append_local(&mut self, event_type: EventType, payload: Vec<u8>) -> Hash256 {
        let previous = self
            .chain_tips
            .get(&self.identity.node_id())
            .copied()
            .unwrap_or(ZERO_HASH);
        let event = LedgerEvent::create(
            event_type,
            payload,
            previous,
            now_seconds(),
            self.identity.keypair(),
        );
        let id = event.event_id;
        self.store(event);
        id
    }

    /// Ingest an event received from gossip.
    ///
    /// Verifies, in order: known source key (learned inline for
    /// NODE_JOINED), duplicate, event id integrity, signature, chain
    /// continuity, and clock skew. Rejected events never mutate state.
    pub fn append_external(&mut self, event: LedgerEvent) -> std::result::Result<(), AppendError> {
        if self.event_lookup.contains_key(&event.event_id) {
            return Err(AppendError::Duplicate);
        }

        if event.compute_hash() != event.event_id {
            return Err(AppendError::InvalidSignature);
        }

        // Resolve the source public key. NODE_JOINED carries it inline and
        // is self-certifying against the node id.
        let public_key: PublicKeyBytes = if event.event_type == EventType::NodeJoined {
            let pk: PublicKeyBytes = event
                .payload
                .as_slice()
                .try_into()
                .map_err(|_| AppendError::InvalidSignature)?;
            if NodeId::from_public_key(&pk) != event.source_node {
                return Err(AppendError::InvalidSignature);
            }
            pk
        } else {
            *self
                .node_keys
                .get(&event.source_node)
                .ok_or(AppendError::UnknownSource)?
        };

        if !event.verify_signature(&public_key) {
            return Err(AppendError::InvalidSignature);
        }

        let expected_previous = self
            .chain_tips
            .get(&event.source_node)
            .copied()
            .unwrap_or(ZERO_HASH);
        if event.previous_hash != expected_previous {
            return Err(AppendError::ChainBreak);
        }

        let now = now_seconds();
        let skew = now.abs_diff(event.timestamp);
        if skew > constants::MAX_CLOCK_SKEW_SECONDS {
            return Err(AppendError::ClockSkew);
        }

        if event.event_type == EventType::NodeJoined {
            self.node_keys.insert(
                event.source_node,
                event.payload.as_slice().try_into().unwrap(),
            );
        }
        self.store(event);
        Ok(())
    }

    /// Store an already-validated event, update indices and tips, notify
    /// subscribers
    fn store(&mut self, event: LedgerEvent) {
        let index = self.events.len();
        self.event_lookup.insert(event.event_id, index);
        self.events_by_node
            .entry(event.source_node)
            .or_default()
            .push(index);
        self.events_by_type
            .entry(event.event_type)
            .or_default()
            .push(index);
        self.chain_tips.insert(event.source_node, event.event_id);
        self.latest_hash = event.event_id;

        log::debug!(
            "ledger +{:?} from {:?} (total {})",
            event.event_type,
            event.source_node,
            index + 1
        );

        // Notify in append order; prune subscribers whose receiver is gone
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());

        self.events.push(event);
    }

    pub fn get(&self, event_id: &Hash256) -> Option<&LedgerEvent> {
        self.event_lookup.get(event_id).map(|&i| &self.events[i])
    }

    pub fn events_by_node(&self, node: &NodeId) -> Vec<&LedgerEvent> {
        self.events_by_node
            .get(node)
            .map(|ids| ids.iter().map(|&i| &self.events[i]).collect())
            .unwrap_or_default()
    }

    pub fn events_by_type(&self, event_type: EventType) -> Vec<&LedgerEvent> {
        self.events_by_type
            .get(&event_type)
            .map(|ids| ids.iter().map(|&i| &self.events[i]).collect())
            .unwrap_or_default()
    }

    pub fn recent(&self, count: usize) -> Vec<&LedgerEvent> {
        let start = self.events.len().saturating_sub(count);
        self.events[start..].iter().collect()
    }

    pub fn all_events(&self) -> &[LedgerEvent] {
        &self.events
    }

    /// Events whose epoch falls in `start..=end`, capped at
    /// [`constants::MAX_SYNC_EVENTS`]
    pub fn events_in_epoch_range(&self, start: u64, end: u64) -> Vec<LedgerEvent> {
        self.events
            .iter()
            .filter(|e| e.epoch >= start && e.epoch <= end)
            .take(constants::MAX_SYNC_EVENTS)
            .cloned()
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn latest_hash(&self) -> Hash256 {
        self.latest_hash
    }

    pub fn chain_tip(&self, node: &NodeId) -> Option<Hash256> {
        self.chain_tips.get(node).copied()
    }

    pub fn public_key_of(&self, node: &NodeId) -> Option<PublicKeyBytes> {
        self.node_keys.get(node).copied()
    }

    /// Highest epoch seen across all stored events
    pub fn highest_epoch(&self) -> u64 {
        self.events.iter().map(|e| e.epoch).max().unwrap_or(0)
    }

    /// Walk every per-source chain and verify hash continuity and event-id
    /// integrity
    pub fn validate_chain(&self) -> bool {
        for (node, indices) in &self.events_by_node {
            let mut previous = ZERO_HASH;
            for &i in indices {
                let event = &self.events[i];
                if event.previous_hash != previous {
                    log::warn!("chain break for {node:?} at event {i}");
                    return false;
                }
                if event.compute_hash() != event.event_id {
                    log::warn!("event id mismatch for {node:?} at event {i}");
                    return false;
                }
                previous = event.event_id;
            }
        }
        true
    }

    pub fn statistics(&self) -> LedgerStatistics {
        let total_keys_issued = self
            .events_by_type
            .get(&EventType::KeyIssued)
            .map(|v| v.len() as u64)
            .unwrap_or(0);
        LedgerStatistics {
            total_events: self.events.len(),
            total_nodes: self.events_by_node.len(),
            total_keys_issued,
            oldest_event_timestamp: self.events.first().map(|e| e.timestamp).unwrap_or(0),
            newest_event_timestamp: self.events.last().map(|e| e.timestamp).unwrap_or(0),
        }
    }

    /// Persist to disk: `u64` event count, then `{u32 size, bytes}` records.
    /// An I/O failure leaves in-memory state authoritative.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.events.len() as u64).to_le_bytes());
        for event in &self.events {
            let bytes = event.to_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&bytes);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, out)
            .map_err(|e| CrateError::StorageWrite(format!("{}: {e}", path.display())))?;
        log::info!("persisted {} events to {}", self.events.len(), path.display());
        Ok(())
    }

    /// Reload a persisted ledger, replaying every record through the index.
    /// Events are restored verbatim; chains were validated on first ingest.
    pub fn load(&mut self, path: &Path) -> Result<usize> {
        let data = std::fs::read(path)
            .map_err(|e| CrateError::StorageRead(format!("{}: {e}", path.display())))?;
        if data.len() < 8 {
            return Err(CrateError::StorageCorrupted("ledger file too short".into()));
        }

        let count = u64::from_le_bytes(data[..8].try_into().unwrap()) as usize;
        let mut offset = 8;
        let mut loaded = 0;

        self.events.clear();
        self.event_lookup.clear();
        self.events_by_node.clear();
        self.events_by_type.clear();
        self.chain_tips.clear();
        self.latest_hash = ZERO_HASH;

        for _ in 0..count {
            if offset + 4 > data.len() {
                return Err(CrateError::StorageCorrupted("truncated record header".into()));
            }
            let size = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            if offset + size > data.len() {
                return Err(CrateError::StorageCorrupted("truncated event record".into()));
            }
            let event = LedgerEvent::from_bytes(&data[offset..offset + size])?;
            offset += size;

            // Re-learn node keys from joined events while replaying
            if event.event_type == EventType::NodeJoined {
                if let Ok(pk) = <PublicKeyBytes>::try_from(event.payload.as_slice()) {
                    self.node_keys.insert(event.source_node, pk);
                }
            }
            self.store(event);
            loaded += 1;
        }

        log::info!("loaded {loaded} events from {}", path.display());
        Ok(loaded)
    }
}
