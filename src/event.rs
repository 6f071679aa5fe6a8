//! Ledger events and their wire format
//!
//! Events are the atomic unit of state: every node/key/network/content
//! lifecycle fact is one signed, hash-chained event. The on-wire layout is
//! fixed and little-endian:
//!
//! ```text
//! event_id         [32]     BLAKE3(rest-without-signature)
//! event_type       [1]      u8 enum
//! source_node      [32]
//! timestamp        [8]      u64 seconds
//! epoch            [8]      u64
//! previous_hash    [32]
//! payload_len      [4]      u32
//! payload          [payload_len]
//! signature        [64]
//! ```
//!
//! The event id commits to every field except itself and the signature;
//! the signature covers the id and everything before it.

use crate::common::{epoch_for, Hash256, NetworkId, NodeId, ContentHash, ZERO_HASH};
use crate::crypto::{self, PublicKeyBytes, SignatureBytes, SigningKeypair};
use crate::error::{Error, Result};

/// Fixed header size: everything except payload and signature
const EVENT_HEADER_SIZE: usize = 32 + 1 + 32 + 8 + 8 + 32 + 4;
const SIGNATURE_SIZE: usize = 64;

/// How a key issuance was earned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IssuanceMethod {
    Pow = 1,
    Postake = 2,
    Vouched = 3,
    Transferred = 4,
}

impl IssuanceMethod {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Pow),
            2 => Some(Self::Postake),
            3 => Some(Self::Vouched),
            4 => Some(Self::Transferred),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pow => "pow",
            Self::Postake => "postake",
            Self::Vouched => "vouched",
            Self::Transferred => "transferred",
        }
    }
}

/// Every event type the ledger tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum EventType {
    NodeJoined = 1,
    NodeLeft = 2,

    KeyIssued = 10,
    KeyTransferred = 11,
    KeyRevoked = 12,
    KeyDecayed = 13,

    NetworkCreated = 20,
    NetworkInvitationSent = 21,
    NetworkInvitationAccepted = 22,
    NetworkMemberAdded = 23,
    NetworkMemberRemoved = 24,
    NetworkDisbanded = 25,

    ThingCreated = 30,
    ThingReplicated = 31,
    ThingRemoved = 32,

    ReputationUpdated = 40,
    AttestationCreated = 41,
    VouchCreated = 42,

    PowSolutionSubmitted = 50,
    PostakeContribution = 51,

    IdentityCreated = 60,
    IdentityRotated = 61,
    IdentityRevoked = 62,
}

impl EventType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::NodeJoined),
            2 => Some(Self::NodeLeft),
            10 => Some(Self::KeyIssued),
            11 => Some(Self::KeyTransferred),
            12 => Some(Self::KeyRevoked),
            13 => Some(Self::KeyDecayed),
            20 => Some(Self::NetworkCreated),
            21 => Some(Self::NetworkInvitationSent),
            22 => Some(Self::NetworkInvitationAccepted),
            23 => Some(Self::NetworkMemberAdded),
            24 => Some(Self::NetworkMemberRemoved),
            25 => Some(Self::NetworkDisbanded),
            30 => Some(Self::ThingCreated),
            31 => Some(Self::ThingReplicated),
            32 => Some(Self::ThingRemoved),
            40 => Some(Self::ReputationUpdated),
            41 => Some(Self::AttestationCreated),
            42 => Some(Self::VouchCreated),
            50 => Some(Self::PowSolutionSubmitted),
            51 => Some(Self::PostakeContribution),
            60 => Some(Self::IdentityCreated),
            61 => Some(Self::IdentityRotated),
            62 => Some(Self::IdentityRevoked),
            _ => None,
        }
    }
}

/// A single event in the append-only ledger
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEvent {
    pub event_id: Hash256,
    pub event_type: EventType,
    pub source_node: NodeId,
    pub timestamp: u64,
    pub epoch: u64,
    pub previous_hash: Hash256,
    pub payload: Vec<u8>,
    pub signature: SignatureBytes,
}

impl LedgerEvent {
    /// Build, hash, and sign a new event at the head of `keypair`'s chain
    pub fn create(
        event_type: EventType,
        payload: Vec<u8>,
        previous_hash: Hash256,
        timestamp: u64,
        keypair: &SigningKeypair,
    ) -> Self {
        let mut event = LedgerEvent {
            event_id: ZERO_HASH,
            event_type,
            source_node: keypair.node_id(),
            timestamp,
            epoch: epoch_for(timestamp),
            previous_hash,
            payload,
            signature: [0u8; 64],
        };
        event.event_id = event.compute_hash();
        event.signature = keypair.sign(&event.signable_bytes());
        event
    }

    /// Bytes committed to by the event id: every field except the id itself
    /// and the signature
    fn hashable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(EVENT_HEADER_SIZE - 32 + self.payload.len());
        out.push(self.event_type as u8);
        out.extend_from_slice(self.source_node.as_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.epoch.to_le_bytes());
        out.extend_from_slice(&self.previous_hash);
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Bytes covered by the signature: the full event minus the signature
    fn signable_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(EVENT_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.event_id);
        out.extend_from_slice(&self.hashable_bytes());
        out
    }

    /// Recompute the event id from the current field values
    pub fn compute_hash(&self) -> Hash256 {
        crypto::blake3_hash(&self.hashable_bytes())
    }

    /// Verify the signature under the claimed source node's public key
    pub fn verify_signature(&self, public_key: &PublicKeyBytes) -> bool {
        crypto::verify_signature(public_key, &self.signable_bytes(), &self.signature).is_ok()
    }

    /// Full wire encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(EVENT_HEADER_SIZE + self.payload.len() + SIGNATURE_SIZE);
        out.extend_from_slice(&self.event_id);
        out.extend_from_slice(&self.hashable_bytes());
        out.extend_from_slice(&self.signature);
        out
    }

    /// Decode from the wire; rejects truncated or type-invalid input
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < EVENT_HEADER_SIZE + SIGNATURE_SIZE {
            return Err(Error::InvalidFormat("event too short".into()));
        }
        let mut reader = ByteReader::new(bytes);

        let event_id = reader.read_hash()?;
        let type_byte = reader.read_u8()?;
        let event_type = EventType::from_u8(type_byte)
            .ok_or_else(|| Error::InvalidFormat(format!("unknown event type {type_byte}")))?;
        let source_node = NodeId(reader.read_hash()?);
        let timestamp = reader.read_u64()?;
        let epoch = reader.read_u64()?;
        let previous_hash = reader.read_hash()?;
        let payload_len = reader.read_u32()? as usize;
        let payload = reader.read_bytes(payload_len)?.to_vec();
        let signature: SignatureBytes = reader
            .read_bytes(SIGNATURE_SIZE)?
            .try_into()
            .map_err(|_| Error::InvalidFormat("bad signature length".into()))?;

        Ok(LedgerEvent {
            event_id,
            event_type,
            source_node,
            timestamp,
            epoch,
            previous_hash,
            payload,
            signature,
        })
    }
}

/// Cursor over a byte slice with bounds-checked reads
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.offset + len > self.data.len() {
            return Err(Error::InvalidFormat("unexpected end of input".into()));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self.read_bytes(4)?.try_into().unwrap();
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let bytes: [u8; 4] = self.read_bytes(4)?.try_into().unwrap();
        Ok(i32::from_le_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes: [u8; 8] = self.read_bytes(8)?.try_into().unwrap();
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_hash(&mut self) -> Result<Hash256> {
        Ok(self.read_bytes(32)?.try_into().unwrap())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::InvalidFormat("invalid utf-8 string".into()))
    }
}

pub(crate) fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Payload of KEY_ISSUED events
#[derive(Debug, Clone, PartialEq)]
pub struct KeyIssuanceData {
    pub key_type: u8,
    pub count: u32,
    pub method: IssuanceMethod,
    pub proof: Hash256,
}

impl KeyIssuanceData {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 4 + 1 + 32);
        out.push(self.key_type);
        out.extend_from_slice(&self.count.to_le_bytes());
        out.push(self.method as u8);
        out.extend_from_slice(&self.proof);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let key_type = reader.read_u8()?;
        let count = reader.read_u32()?;
        let method_byte = reader.read_u8()?;
        let method = IssuanceMethod::from_u8(method_byte)
            .ok_or_else(|| Error::InvalidFormat(format!("unknown issuance method {method_byte}")))?;
        let proof = reader.read_hash()?;
        Ok(Self { key_type, count, method, proof })
    }
}

/// Payload of KEY_DECAYED and KEY_REVOKED events
#[derive(Debug, Clone, PartialEq)]
pub struct KeyDecayData {
    pub key_type: u8,
    pub count: u32,
    pub reason: String,
}

impl KeyDecayData {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.key_type);
        out.extend_from_slice(&self.count.to_le_bytes());
        write_string(&mut out, &self.reason);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        Ok(Self {
            key_type: reader.read_u8()?,
            count: reader.read_u32()?,
            reason: reader.read_string()?,
        })
    }
}

/// Payload of network membership events
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkMembershipData {
    pub network_id: NetworkId,
    pub member: NodeId,
    pub role: String,
}

impl NetworkMembershipData {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.network_id.as_bytes());
        out.extend_from_slice(self.member.as_bytes());
        write_string(&mut out, &self.role);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        Ok(Self {
            network_id: NetworkId(reader.read_hash()?),
            member: NodeId(reader.read_hash()?),
            role: reader.read_string()?,
        })
    }
}

/// Payload of THING_CREATED / THING_REPLICATED / THING_REMOVED events
#[derive(Debug, Clone, PartialEq)]
pub struct ThingReplicationData {
    pub content_hash: ContentHash,
    pub network_id: NetworkId,
    pub host: NodeId,
    pub size_bytes: u64,
}

impl ThingReplicationData {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 32 + 32 + 8);
        out.extend_from_slice(self.content_hash.as_bytes());
        out.extend_from_slice(self.network_id.as_bytes());
        out.extend_from_slice(self.host.as_bytes());
        out.extend_from_slice(&self.size_bytes.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        Ok(Self {
            content_hash: ContentHash(reader.read_hash()?),
            network_id: NetworkId(reader.read_hash()?),
            host: NodeId(reader.read_hash()?),
            size_bytes: reader.read_u64()?,
        })
    }
}

/// Payload of REPUTATION_UPDATED events
#[derive(Debug, Clone, PartialEq)]
pub struct ReputationUpdateData {
    pub subject: NodeId,
    pub score_delta: i32,
    pub reason: String,
    pub evidence: Hash256,
}

impl ReputationUpdateData {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.subject.as_bytes());
        out.extend_from_slice(&self.score_delta.to_le_bytes());
        write_string(&mut out, &self.reason);
        out.extend_from_slice(&self.evidence);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        Ok(Self {
            subject: NodeId(reader.read_hash()?),
            score_delta: reader.read_i32()?,
            reason: reader.read_string()?,
            evidence: reader.read_hash()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> (LedgerEvent, SigningKeypair) {
        let keypair = SigningKeypair::generate();
        let event = LedgerEvent::create(
            EventType::NodeJoined,
            keypair.node_id().as_bytes().to_vec(),
            ZERO_HASH,
            1_700_000_000,
            &keypair,
        );
        (event, keypair)
    }

    #[test]
    fn test_event_id_matches_hash() {
        let (event, _) = sample_event();
        assert_eq!(event.event_id, event.compute_hash());
    }

    #[test]
    fn test_epoch_derived_from_timestamp() {
        let (event, _) = sample_event();
        assert_eq!(event.epoch, 1_700_000_000 / 600);
    }

    #[test]
    fn test_signature_verifies() {
        let (event, keypair) = sample_event();
        assert!(event.verify_signature(&keypair.public_key_bytes()));
    }

    #[test]
    fn test_tampered_payload_breaks_signature() {
        let (mut event, keypair) = sample_event();
        event.payload[0] ^= 0x01;
        assert!(!event.verify_signature(&keypair.public_key_bytes()));
        assert_ne!(event.event_id, event.compute_hash());
    }

    #[test]
    fn test_wire_round_trip() {
        let (event, _) = sample_event();
        let bytes = event.to_bytes();
        let decoded = LedgerEvent::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_wire_layout_is_fixed() {
        let (event, _) = sample_event();
        let bytes = event.to_bytes();
        // event_id at [0..32], type byte at [32]
        assert_eq!(&bytes[0..32], &event.event_id);
        assert_eq!(bytes[32], EventType::NodeJoined as u8);
        // timestamp is little-endian at [65..73]
        assert_eq!(&bytes[65..73], &1_700_000_000u64.to_le_bytes());
    }

    #[test]
    fn test_truncated_input_rejected() {
        let (event, _) = sample_event();
        let bytes = event.to_bytes();
        assert!(LedgerEvent::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(LedgerEvent::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let (event, _) = sample_event();
        let mut bytes = event.to_bytes();
        bytes[32] = 255;
        assert!(LedgerEvent::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_key_issuance_payload_round_trip() {
        let data = KeyIssuanceData {
            key_type: 4,
            count: 2,
            method: IssuanceMethod::Pow,
            proof: [9u8; 32],
        };
        assert_eq!(KeyIssuanceData::from_bytes(&data.to_bytes()).unwrap(), data);
    }

    #[test]
    fn test_membership_payload_round_trip() {
        let data = NetworkMembershipData {
            network_id: NetworkId([1u8; 32]),
            member: NodeId([2u8; 32]),
            role: "FOUNDER".into(),
        };
        assert_eq!(
            NetworkMembershipData::from_bytes(&data.to_bytes()).unwrap(),
            data
        );
    }

    #[test]
    fn test_replication_payload_round_trip() {
        let data = ThingReplicationData {
            content_hash: ContentHash([3u8; 32]),
            network_id: NetworkId([4u8; 32]),
            host: NodeId([5u8; 32]),
            size_bytes: 1234,
        };
        assert_eq!(
            ThingReplicationData::from_bytes(&data.to_bytes()).unwrap(),
            data
        );
    }

    #[test]
    fn test_reputation_payload_round_trip() {
        let data = ReputationUpdateData {
            subject: NodeId([6u8; 32]),
            score_delta: -50,
            reason: "network violation".into(),
            evidence: [7u8; 32],
        };
        assert_eq!(
            ReputationUpdateData::from_bytes(&data.to_bytes()).unwrap(),
            data
        );
    }
}
