//! Error taxonomy
//!
//! Deep layers return these errors upward with `?`. Boundary loops (decay
//! runner, sync scheduler, replication workers) catch, log, and continue:
//! one failing event never crashes a loop.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // Generic
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("out of range: {0}")]
    OutOfRange(String),

    // Cryptography
    #[error("signature creation failed: {0}")]
    SignatureFailed(String),
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid secret key")]
    InvalidSecretKey,

    // Network
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("network timeout: {0}")]
    NetworkTimeout(String),
    #[error("peer disconnected")]
    Disconnected,
    #[error("invalid network message: {0}")]
    InvalidMessage(String),
    #[error("peer not found: {0}")]
    PeerNotFound(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // Storage
    #[error("not found in storage: {0}")]
    StorageNotFound(String),
    #[error("storage read failed: {0}")]
    StorageRead(String),
    #[error("storage write failed: {0}")]
    StorageWrite(String),
    #[error("storage corrupted: {0}")]
    StorageCorrupted(String),
    #[error("storage quota exceeded")]
    QuotaExceeded,

    // Protocol
    #[error("invalid protocol message: {0}")]
    ProtocolInvalidMessage(String),
    #[error("protocol version mismatch")]
    VersionMismatch,
    #[error("authentication failed")]
    AuthFailed,
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // Proof of work
    #[error("proof of work below required difficulty")]
    PowInsufficientDifficulty,
    #[error("invalid proof of work solution")]
    PowInvalidSolution,
    #[error("proof of work timed out")]
    PowTimeout,

    // Ledger
    #[error("invalid ledger event: {0}")]
    LedgerInvalidEvent(String),
    #[error("ledger fork detected for node {0}")]
    LedgerForkDetected(String),
    #[error("ledger conflict: {0}")]
    LedgerConflict(String),

    // Thing
    #[error("thing not found: {0}")]
    ThingNotFound(String),
    #[error("thing exceeds size limit ({size} > {limit} bytes)")]
    ThingSizeLimitExceeded { size: usize, limit: usize },
    #[error("thing hash mismatch")]
    ThingInvalidHash,

    // Keys
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("key expired")]
    KeyExpired,
    #[error("key does not grant this permission")]
    KeyInvalidPermission,
    #[error("key quota exceeded: {0}")]
    KeyQuotaExceeded(String),

    // Reputation
    #[error("reputation too low ({score} < {required})")]
    ReputationTooLow { score: i32, required: i32 },
    #[error("invalid attestation: {0}")]
    InvalidAttestation(String),

    // Serialization
    #[error("serialization failed: {0}")]
    SerializationFailed(String),
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
