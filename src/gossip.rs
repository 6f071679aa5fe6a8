//! Gossip-based ledger synchronization
//!
//! Locally-appended events broadcast immediately with push fanout 3;
//! recipients dedupe by event id before ingest. A periodic scheduler
//! closes the gaps broadcast misses: every minute it asks the most
//! advanced peer for the missing epoch range, every ten epochs it
//! broadcasts a checkpoint of `(epoch, latest_hash)`, and every five
//! minutes it validates consistency and prunes stale peer state.
//!
//! The transport is a narrow seam; real sockets live outside the core.

use hashbrown::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::common::{constants, epoch_for, Hash256, NodeId};
use crate::crypto::blake3_hash_parts;
use crate::error::{Error, Result};
use crate::event::{ByteReader, LedgerEvent};
use crate::ledger::{AppendError, EventLedger};

/// Peer sync state untouched for this long is pruned
const SYNC_STATE_TTL_SECONDS: u64 = 300;
/// Seconds between periodic sync attempts
pub const SYNC_INTERVAL_SECONDS: u64 = 60;
/// Epochs between checkpoint broadcasts
pub const CHECKPOINT_INTERVAL_EPOCHS: u64 = 10;
/// Seconds between consistency validations
pub const VALIDATION_INTERVAL_SECONDS: u64 = 300;

/// Top-level gossip message families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GossipType {
    NetworkStateUpdate = 1,
    RevocationUpdate = 2,
}

impl GossipType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::NetworkStateUpdate),
            2 => Some(Self::RevocationUpdate),
            _ => None,
        }
    }
}

/// Envelope for everything on the gossip wire
#[derive(Debug, Clone, PartialEq)]
pub struct GossipMessage {
    pub message_type: GossipType,
    pub message_id: Hash256,
    pub payload: Vec<u8>,
    pub timestamp: u64,
    pub hop_count: u8,
}

impl GossipMessage {
    pub fn new(message_type: GossipType, payload: Vec<u8>, timestamp: u64) -> Self {
        let message_id =
            blake3_hash_parts(&[&[message_type as u8], &payload, &timestamp.to_le_bytes()]);
        Self {
            message_type,
            message_id,
            payload,
            timestamp,
            hop_count: 0,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 32 + 4 + self.payload.len() + 8 + 1);
        out.push(self.message_type as u8);
        out.extend_from_slice(&self.message_id);
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.push(self.hop_count);
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > constants::MAX_MESSAGE_SIZE {
            return Err(Error::InvalidMessage("message exceeds size cap".into()));
        }
        let mut reader = ByteReader::new(bytes);
        let type_byte = reader.read_u8()?;
        let message_type = GossipType::from_u8(type_byte)
            .ok_or_else(|| Error::InvalidMessage(format!("unknown gossip type {type_byte}")))?;
        let message_id = reader.read_hash()?;
        let payload_len = reader.read_u32()? as usize;
        let payload = reader.read_bytes(payload_len)?.to_vec();
        let timestamp = reader.read_u64()?;
        let hop_count = reader.read_u8()?;
        Ok(Self {
            message_type,
            message_id,
            payload,
            timestamp,
            hop_count,
        })
    }
}

/// Ledger sync message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncMessageType {
    EventBroadcast = 1,
    SyncRequest = 2,
    SyncResponse = 3,
    Checkpoint = 4,
}

impl SyncMessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::EventBroadcast),
            2 => Some(Self::SyncRequest),
            3 => Some(Self::SyncResponse),
            4 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

/// Payload of a NETWORK_STATE_UPDATE gossip message
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSyncMessage {
    pub sync_type: SyncMessageType,
    pub start_epoch: u64,
    pub end_epoch: u64,
    pub ledger_hash: Hash256,
    pub events: Vec<LedgerEvent>,
}

impl LedgerSyncMessage {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.sync_type as u8);
        out.extend_from_slice(&self.start_epoch.to_le_bytes());
        out.extend_from_slice(&self.end_epoch.to_le_bytes());
        out.extend_from_slice(&self.ledger_hash);
        out.extend_from_slice(&(self.events.len() as u32).to_le_bytes());
        for event in &self.events {
            let bytes = event.to_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&bytes);
        }
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let type_byte = reader.read_u8()?;
        let sync_type = SyncMessageType::from_u8(type_byte)
            .ok_or_else(|| Error::InvalidMessage(format!("unknown sync type {type_byte}")))?;
        let start_epoch = reader.read_u64()?;
        let end_epoch = reader.read_u64()?;
        let ledger_hash = reader.read_hash()?;
        let count = reader.read_u32()? as usize;
        if count > constants::MAX_SYNC_EVENTS {
            return Err(Error::InvalidMessage(format!(
                "sync message carries {count} events (cap {})",
                constants::MAX_SYNC_EVENTS
            )));
        }
        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            let size = reader.read_u32()? as usize;
            let event_bytes = reader.read_bytes(size)?;
            events.push(LedgerEvent::from_bytes(event_bytes)?);
        }
        Ok(Self {
            sync_type,
            start_epoch,
            end_epoch,
            ledger_hash,
            events,
        })
    }
}

/// Synchronization progress with one peer
#[derive(Debug, Clone)]
pub struct SyncState {
    pub peer_id: NodeId,
    pub last_synced_epoch: u64,
    pub last_known_hash: Hash256,
    pub last_sync_time: u64,
}

/// Transport seam: delivery of gossip messages to peers. Real deployments
/// put sockets behind this; tests use the in-memory implementation.
pub trait GossipTransport: Send {
    /// Send to one peer
    fn send(&self, to: &NodeId, message: &GossipMessage) -> Result<()>;
    /// Push to `fanout` random peers; returns how many were reached
    fn broadcast(&self, message: &GossipMessage, fanout: usize) -> usize;
    /// Currently known peers
    fn peers(&self) -> Vec<NodeId>;
}

/// In-memory transport delivering into per-peer inboxes
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    inboxes: Arc<Mutex<HashMap<NodeId, Vec<GossipMessage>>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_peer(&self, peer: NodeId) {
        self.inboxes.lock().unwrap().entry(peer).or_default();
    }

    pub fn drain_inbox(&self, peer: &NodeId) -> Vec<GossipMessage> {
        self.inboxes
            .lock()
            .unwrap()
            .get_mut(peer)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

impl GossipTransport for InMemoryTransport {
    fn send(&self, to: &NodeId, message: &GossipMessage) -> Result<()> {
        let mut inboxes = self.inboxes.lock().unwrap();
        let inbox = inboxes
            .get_mut(to)
            .ok_or_else(|| Error::PeerNotFound(to.to_hex()))?;
        inbox.push(message.clone());
        Ok(())
    }

    fn broadcast(&self, message: &GossipMessage, fanout: usize) -> usize {
        let mut inboxes = self.inboxes.lock().unwrap();
        let mut sent = 0;
        for inbox in inboxes.values_mut().take(fanout) {
            inbox.push(message.clone());
            sent += 1;
        }
        sent
    }

    fn peers(&self) -> Vec<NodeId> {
        self.inboxes.lock().unwrap().keys().copied().collect()
    }
}

/// Bridges the ledger to the gossip layer
pub struct LedgerGossipBridge {
    ledger: Arc<Mutex<EventLedger>>,
    transport: Box<dyn GossipTransport>,

    peer_sync_states: HashMap<NodeId, SyncState>,
    seen_event_ids: HashSet<Hash256>,

    events_received: u64,
    events_sent: u64,
    sync_requests: u64,
}

impl LedgerGossipBridge {
    pub fn new(ledger: Arc<Mutex<EventLedger>>, transport: Box<dyn GossipTransport>) -> Self {
        Self {
            ledger,
            transport,
            peer_sync_states: HashMap::new(),
            seen_event_ids: HashSet::new(),
            events_received: 0,
            events_sent: 0,
            sync_requests: 0,
        }
    }

    fn wrap(&self, sync: &LedgerSyncMessage, now: u64) -> GossipMessage {
        GossipMessage::new(GossipType::NetworkStateUpdate, sync.serialize(), now)
    }

    /// Broadcast a freshly appended local event (hop count 0, fanout 3)
    pub fn broadcast_event(&mut self, event: &LedgerEvent, now: u64) {
        self.seen_event_ids.insert(event.event_id);
        let sync = LedgerSyncMessage {
            sync_type: SyncMessageType::EventBroadcast,
            start_epoch: event.epoch,
            end_epoch: event.epoch,
            ledger_hash: event.event_id,
            events: vec![event.clone()],
        };
        let sent = self
            .transport
            .broadcast(&self.wrap(&sync, now), constants::GOSSIP_FANOUT);
        self.events_sent += sent as u64;
    }

    /// Broadcast our `(epoch, latest_hash)` checkpoint
    pub fn broadcast_checkpoint(&mut self, now: u64) {
        let (epoch, hash) = {
            let ledger = self.ledger.lock().unwrap();
            (ledger.highest_epoch(), ledger.latest_hash())
        };
        let sync = LedgerSyncMessage {
            sync_type: SyncMessageType::Checkpoint,
            start_epoch: epoch,
            end_epoch: epoch,
            ledger_hash: hash,
            events: Vec::new(),
        };
        self.transport
            .broadcast(&self.wrap(&sync, now), constants::GOSSIP_FANOUT);
        log::debug!("broadcast checkpoint at epoch {epoch}");
    }

    /// Ask a peer for the events in `start..=end`
    pub fn request_sync(&mut self, peer: &NodeId, start_epoch: u64, end_epoch: u64, now: u64) {
        let sync = LedgerSyncMessage {
            sync_type: SyncMessageType::SyncRequest,
            start_epoch,
            end_epoch,
            ledger_hash: self.ledger.lock().unwrap().latest_hash(),
            events: Vec::new(),
        };
        if self.transport.send(peer, &self.wrap(&sync, now)).is_ok() {
            self.sync_requests += 1;
            log::info!("sync request to {peer:?}: epochs {start_epoch}..={end_epoch}");
        }
    }

    /// Dispatch an inbound gossip message of the ledger family
    pub fn handle_gossip_message(&mut self, source: &NodeId, message: &GossipMessage, now: u64) {
        if message.message_type != GossipType::NetworkStateUpdate {
            return;
        }
        let sync = match LedgerSyncMessage::deserialize(&message.payload) {
            Ok(sync) => sync,
            Err(e) => {
                log::warn!("undecodable sync message from {source:?}: {e}");
                return;
            }
        };
        match sync.sync_type {
            SyncMessageType::EventBroadcast | SyncMessageType::SyncResponse => {
                self.ingest_events(source, sync.events, now);
            }
            SyncMessageType::SyncRequest => {
                self.answer_sync_request(source, sync.start_epoch, sync.end_epoch, now);
            }
            SyncMessageType::Checkpoint => {
                self.update_peer_sync_state(source, sync.end_epoch, sync.ledger_hash, now);
            }
        }
    }

    fn ingest_events(&mut self, source: &NodeId, events: Vec<LedgerEvent>, now: u64) {
        let mut ledger = self.ledger.lock().unwrap();
        let mut needs_resync = false;
        for event in events {
            // Dedupe before touching the ledger
            if !self.seen_event_ids.insert(event.event_id) {
                continue;
            }
            match ledger.append_external(event) {
                Ok(()) => self.events_received += 1,
                Err(AppendError::Duplicate) => {}
                Err(AppendError::ChainBreak) | Err(AppendError::UnknownSource) => {
                    // We are missing this source's earlier events; schedule
                    // a catch-up with the sender
                    needs_resync = true;
                }
                Err(e) => {
                    log::warn!("dropping event from {source:?}: {e}");
                }
            }
        }
        let local_epoch = ledger.highest_epoch();
        drop(ledger);

        if needs_resync {
            self.request_sync(source, local_epoch.saturating_sub(1), local_epoch + 1, now);
        }
    }

    fn answer_sync_request(&mut self, peer: &NodeId, start: u64, end: u64, now: u64) {
        let (events, hash) = {
            let ledger = self.ledger.lock().unwrap();
            (ledger.events_in_epoch_range(start, end), ledger.latest_hash())
        };
        log::debug!(
            "answering sync request from {peer:?}: {} events for {start}..={end}",
            events.len()
        );
        let count = events.len() as u64;
        let sync = LedgerSyncMessage {
            sync_type: SyncMessageType::SyncResponse,
            start_epoch: start,
            end_epoch: end,
            ledger_hash: hash,
            events,
        };
        if self.transport.send(peer, &self.wrap(&sync, now)).is_ok() {
            self.events_sent += count;
        }
    }

    fn update_peer_sync_state(&mut self, peer: &NodeId, epoch: u64, hash: Hash256, now: u64) {
        self.peer_sync_states.insert(
            *peer,
            SyncState {
                peer_id: *peer,
                last_synced_epoch: epoch,
                last_known_hash: hash,
                last_sync_time: now,
            },
        );
    }

    /// Find the most advanced peer and request the epochs we are missing
    pub fn sync_with_network(&mut self, now: u64) {
        let local_epoch = self.ledger.lock().unwrap().highest_epoch();
        let best = self
            .peer_sync_states
            .values()
            .filter(|s| s.last_synced_epoch > local_epoch)
            .max_by_key(|s| s.last_synced_epoch)
            .map(|s| (s.peer_id, s.last_synced_epoch));
        if let Some((peer, peer_epoch)) = best {
            self.request_sync(&peer, local_epoch + 1, peer_epoch, now);
        }
    }

    /// Peers that disagree with us at our current epoch. The
    /// reconciliation engine decides what to do about them.
    pub fn divergent_peers(&self) -> Vec<(NodeId, u64, Hash256)> {
        let ledger = self.ledger.lock().unwrap();
        let local_epoch = ledger.highest_epoch();
        let local_hash = ledger.latest_hash();
        drop(ledger);

        self.peer_sync_states
            .values()
            .filter(|s| s.last_synced_epoch == local_epoch && s.last_known_hash != local_hash)
            .map(|s| (s.peer_id, s.last_synced_epoch, s.last_known_hash))
            .collect()
    }

    /// Drop peer sync state we have not heard from recently
    pub fn cleanup_sync_state(&mut self, now: u64) {
        self.peer_sync_states
            .retain(|_, s| now.saturating_sub(s.last_sync_time) < SYNC_STATE_TTL_SECONDS);
    }

    pub fn peer_sync_state(&self, peer: &NodeId) -> Option<&SyncState> {
        self.peer_sync_states.get(peer)
    }

    pub fn synced_peer_count(&self) -> usize {
        self.peer_sync_states.len()
    }

    pub fn counters(&self) -> (u64, u64, u64) {
        (self.events_received, self.events_sent, self.sync_requests)
    }
}

/// Drives the periodic sync duties from a single tick entry point
pub struct SyncScheduler {
    last_sync_time: u64,
    last_checkpoint_epoch: u64,
    last_validation_time: u64,
}

impl Default for SyncScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncScheduler {
    pub fn new() -> Self {
        Self {
            last_sync_time: 0,
            last_checkpoint_epoch: 0,
            last_validation_time: 0,
        }
    }

    /// Run whichever periodic duties are due at `now`
    pub fn tick(&mut self, bridge: &mut LedgerGossipBridge, now: u64) {
        if now.saturating_sub(self.last_sync_time) >= SYNC_INTERVAL_SECONDS {
            self.last_sync_time = now;
            bridge.sync_with_network(now);
        }

        let epoch = epoch_for(now);
        if epoch.saturating_sub(self.last_checkpoint_epoch) >= CHECKPOINT_INTERVAL_EPOCHS {
            self.last_checkpoint_epoch = epoch;
            bridge.broadcast_checkpoint(now);
        }

        if now.saturating_sub(self.last_validation_time) >= VALIDATION_INTERVAL_SECONDS {
            self.last_validation_time = now;
            let divergent = bridge.divergent_peers();
            if !divergent.is_empty() {
                log::warn!("{} peer(s) divergent at our epoch", divergent.len());
            }
            bridge.cleanup_sync_state(now);
        }
    }
}
