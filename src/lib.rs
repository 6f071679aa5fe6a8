//! # Cashew - Permissioned Peer-to-Peer Content Hosting
//!
//! Cashew hosts immutable content blobs ("Things") inside small,
//! invitation-only replica clusters ("Networks"). Participation is gated
//! by non-transferable capability keys earned through proof-of-work and
//! proof-of-contribution; keys decay when unused and can be revoked.
//! Every lifecycle fact is a signed, hash-chained event in a per-node
//! append-only ledger, propagated over gossip; each node derives its
//! operational state by folding the log.
//!
//! ## Core Components
//!
//! - **EventLedger**: signed, per-source hash-chained append-only log
//! - **StateProjector**: folds events into node/network/thing state
//! - **KeyRegistry / HybridCoordinator**: key inventory and PoW/PoStake issuance
//! - **ReputationManager / TrustGraph**: scores, attestations, transitive trust
//! - **Network / ReplicationCoordinator**: replica clusters, quorum health, jobs
//! - **LedgerGossipBridge / StateReconciliation**: sync, checkpoints, merges
//! - **ContentStore / ContentRenderer**: content-addressed blobs, LRU cache
//! - **AccessControl / RevocationManager**: capabilities, tokens, revocations
//!
//! ## Usage
//!
//! Construct a [`node::CashewNode`] with a gossip transport and a storage
//! backend, `bootstrap()` it, and drive it either through its public
//! operations or by calling `start()` to run the background loops.
//!
//! ```no_run
//! use cashew::config::NodeConfig;
//! use cashew::gossip::InMemoryTransport;
//! use cashew::identity::NodeIdentity;
//! use cashew::node::CashewNode;
//! use cashew::storage::MemoryBackend;
//! use std::sync::Arc;
//!
//! let config = NodeConfig::default();
//! let identity = NodeIdentity::generate();
//! let node = Arc::new(
//!     CashewNode::new(
//!         config,
//!         identity,
//!         Box::new(InMemoryTransport::new()),
//!         Box::new(MemoryBackend::new()),
//!     )
//!     .unwrap(),
//! );
//! node.bootstrap();
//! node.start();
//! ```

pub mod access;
pub mod attack;
pub mod common;
pub mod config;
pub mod crypto;
pub mod decay;
pub mod error;
pub mod event;
pub mod gossip;
pub mod human;
pub mod identity;
pub mod issuance;
pub mod keys;
pub mod ledger;
pub mod network;
pub mod node;
pub mod pow;
pub mod reconcile;
pub mod renderer;
pub mod replication;
pub mod reputation;
pub mod revocation;
pub mod sanitize;
pub mod state;
pub mod storage;

// Re-export the types most callers need
pub use access::{AccessDecision, AccessRequest, Capability, CapabilityToken};
pub use common::{ContentHash, HumanId, NetworkId, NodeId};
pub use error::{Error, Result};
pub use event::{EventType, LedgerEvent};
pub use identity::NodeIdentity;
pub use keys::KeyType;
pub use node::CashewNode;
pub use state::{MemberRole, NetworkState, NodeState, ThingState};
