//! Node orchestrator
//!
//! Wires the subsystems into one running node: the ledger feeds the
//! projector through a subscription channel, local actions append events
//! and broadcast them over gossip, and background loops (sync scheduler,
//! decay runner, replication promotion) cooperate with a shared running
//! flag. Locks are acquired in declaration order — ledger, then
//! projector, then registries — and never nested the other way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::access::{AccessControl, AccessDecision, AccessRequest, Capability, CapabilityToken};
use crate::common::{current_epoch, now_seconds, ContentHash, Hash256, NetworkId, NodeId};
use crate::config::NodeConfig;
use crate::decay::{DecayScheduler, KeyDecayEvent};
use crate::error::{Error, Result};
use crate::event::{
    EventType, KeyDecayData, KeyIssuanceData, LedgerEvent, NetworkMembershipData,
    ReputationUpdateData, ThingReplicationData,
};
use crate::gossip::{GossipTransport, LedgerGossipBridge, SyncScheduler};
use crate::identity::NodeIdentity;
use crate::issuance::{HybridCoordinator, HybridPolicy, IssuanceRecord};
use crate::keys::{KeyRegistry, KeyType};
use crate::ledger::EventLedger;
use crate::network::{Network, NetworkInvitation, NetworkMember, NetworkRegistry};
use crate::pow::{PowConfig, PowSolution};
use crate::renderer::{ContentRenderer, FetchCallback, RenderResult, RendererConfig};
use crate::replication::{
    verify_replica, ReplicationCoordinator, ReplicationRequest, PRIORITY_URGENT,
};
use crate::reputation::{Attestation, ReputationAction, ReputationManager};
use crate::revocation::{RevocationManager, RevocationReason, TokenRevocation};
use crate::state::{MemberRole, StateProjector};
use crate::storage::{ContentBackend, ContentStore};

/// A running Cashew node
pub struct CashewNode {
    identity: Arc<NodeIdentity>,
    config: NodeConfig,

    ledger: Arc<Mutex<EventLedger>>,
    projector: Arc<Mutex<StateProjector>>,
    key_registry: Arc<Mutex<KeyRegistry>>,
    network_registry: Arc<Mutex<NetworkRegistry>>,
    reputation: Arc<Mutex<ReputationManager>>,
    issuance: Arc<Mutex<HybridCoordinator>>,
    replication: Arc<Mutex<ReplicationCoordinator>>,
    revocations: Arc<Mutex<RevocationManager>>,
    decay: Arc<Mutex<DecayScheduler>>,
    content: Arc<Mutex<ContentStore>>,
    renderer: Arc<ContentRenderer>,
    bridge: Arc<Mutex<LedgerGossipBridge>>,
    access: AccessControl,

    /// Events accepted by the ledger, pending projection
    events_rx: Mutex<Receiver<LedgerEvent>>,

    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CashewNode {
    pub fn new(
        config: NodeConfig,
        identity: NodeIdentity,
        transport: Box<dyn GossipTransport>,
        content_backend: Box<dyn ContentBackend>,
    ) -> Result<Self> {
        let identity = Arc::new(identity);
        let mut ledger = EventLedger::new(identity.clone());
        let events_rx = ledger.subscribe();
        let ledger = Arc::new(Mutex::new(ledger));

        let pow_config = PowConfig {
            difficulty: config.pow_difficulty,
            memory_cost: config.pow_memory_cost,
            ..PowConfig::default()
        };
        let issuance_policy = HybridPolicy {
            pow_config,
            ..HybridPolicy::default()
        };

        let bridge = LedgerGossipBridge::new(ledger.clone(), transport);

        // The renderer's miss path reads the local content store; peer
        // fetch plugs in at the same seam once a transport carries blobs
        let content = Arc::new(Mutex::new(ContentStore::new(content_backend)));
        let fetch_store = content.clone();
        let fetch: FetchCallback =
            Box::new(move |hash| fetch_store.lock().unwrap().get(hash).ok().flatten());
        let renderer_config = RendererConfig {
            max_cache_bytes: config.cache_max_bytes,
            max_cached_items: config.cache_max_items,
            ..RendererConfig::default()
        };
        let renderer = Arc::new(ContentRenderer::new(renderer_config, fetch));

        Ok(Self {
            identity,
            access: AccessControl::new(pow_config),
            ledger,
            projector: Arc::new(Mutex::new(StateProjector::new())),
            key_registry: Arc::new(Mutex::new(KeyRegistry::new())),
            network_registry: Arc::new(Mutex::new(NetworkRegistry::new())),
            reputation: Arc::new(Mutex::new(ReputationManager::new())),
            issuance: Arc::new(Mutex::new(HybridCoordinator::new(issuance_policy)?)),
            replication: Arc::new(Mutex::new(ReplicationCoordinator::new())),
            revocations: Arc::new(Mutex::new(RevocationManager::new())),
            decay: Arc::new(Mutex::new(DecayScheduler::new())),
            content,
            renderer,
            bridge: Arc::new(Mutex::new(bridge)),
            events_rx: Mutex::new(events_rx),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Drain accepted ledger events into the derived views. Called after
    /// every local append and from the worker loop for gossiped events.
    pub fn pump_events(&self) {
        let rx = self.events_rx.lock().unwrap();
        let mut projector = self.projector.lock().unwrap();
        while let Ok(event) = rx.try_recv() {
            projector.apply(&event);
        }
    }

    /// Append a local event, project it, and broadcast it
    fn publish(&self, event_type: EventType, payload: Vec<u8>) -> Hash256 {
        let now = now_seconds();
        let event = {
            let mut ledger = self.ledger.lock().unwrap();
            let id = ledger.append_local(event_type, payload);
            ledger.get(&id).cloned()
        };
        self.pump_events();
        if let Some(event) = event {
            self.bridge.lock().unwrap().broadcast_event(&event, now);
            event.event_id
        } else {
            // append_local stores unconditionally; the id always resolves
            unreachable!("freshly appended event missing from ledger")
        }
    }

    /// Announce this node to the network (NODE_JOINED carries our key)
    pub fn bootstrap(&self) -> Hash256 {
        log::info!("bootstrapping node {}", self.node_id());
        self.publish(EventType::NodeJoined, self.identity.public_key().to_vec())
    }

    /// Leave gracefully
    pub fn announce_leave(&self) -> Hash256 {
        self.publish(EventType::NodeLeft, vec![])
    }

    // --- access ---

    pub fn check_access(&self, request: &AccessRequest) -> AccessDecision {
        let projector = self.projector.lock().unwrap();
        self.access.check_access(request, &projector)
    }

    pub fn issue_token(&self, capability: Capability, context: Vec<u8>) -> CapabilityToken {
        self.access
            .issue_token(self.identity.keypair(), capability, context, now_seconds())
    }

    pub fn verify_token(&self, token: &CapabilityToken) -> Result<()> {
        let holder_key = self
            .ledger
            .lock()
            .unwrap()
            .public_key_of(&token.node_id)
            .ok_or_else(|| Error::PeerNotFound(token.node_id.to_hex()))?;
        let revocations = self.revocations.lock().unwrap();
        self.access
            .verify_token(token, &holder_key, &revocations, now_seconds())
    }

    /// Revoke a capability and gossip the revocation
    pub fn revoke_capability(
        &self,
        node: NodeId,
        capability: Capability,
        reason: RevocationReason,
        context: Vec<u8>,
    ) -> TokenRevocation {
        self.revocations.lock().unwrap().revoke_token(
            self.identity.keypair(),
            node,
            capability,
            reason,
            context,
            now_seconds(),
        )
    }

    // --- keys ---

    /// Request keys against a mined PoW solution; emits KEY_ISSUED and
    /// POW_SOLUTION_SUBMITTED on success
    pub fn request_keys_via_pow(
        &self,
        solution: &PowSolution,
        key_type: KeyType,
        count: u32,
    ) -> Result<IssuanceRecord> {
        let now = now_seconds();
        let node_state = self
            .projector
            .lock()
            .unwrap()
            .node_state(&self.node_id())
            .cloned()
            .ok_or_else(|| Error::PermissionDenied("node has not joined".into()))?;

        let record = self.issuance.lock().unwrap().request_via_pow(
            &node_state,
            solution,
            key_type,
            count,
            now,
        )?;

        self.apply_issuance(&record, now);
        self.publish(EventType::PowSolutionSubmitted, solution.hash.to_vec());
        Ok(record)
    }

    /// Request keys on contribution history alone
    pub fn request_keys_via_postake(
        &self,
        key_type: KeyType,
        count: u32,
    ) -> Result<IssuanceRecord> {
        let now = now_seconds();
        let node_state = self
            .projector
            .lock()
            .unwrap()
            .node_state(&self.node_id())
            .cloned()
            .ok_or_else(|| Error::PermissionDenied("node has not joined".into()))?;

        let record = self
            .issuance
            .lock()
            .unwrap()
            .request_via_postake(&node_state, key_type, count, now)?;
        self.apply_issuance(&record, now);
        Ok(record)
    }

    fn apply_issuance(&self, record: &IssuanceRecord, now: u64) {
        self.key_registry.lock().unwrap().add_keys(
            record.node_id,
            record.key_type,
            record.key_count,
            record.method,
            now,
        );
        let data = KeyIssuanceData {
            key_type: record.key_type as u8,
            count: record.key_count,
            method: record.method,
            proof: record.proof,
        };
        self.publish(EventType::KeyIssued, data.to_bytes());
    }

    /// Transfer one of our keys to another node (KEY_TRANSFERRED).
    /// Requires holding at least two keys of the type.
    pub fn transfer_key(&self, to: NodeId, key_type: KeyType, reason: &str) -> Result<()> {
        let now = now_seconds();
        let transfer = self.key_registry.lock().unwrap().create_transfer(
            self.identity.keypair(),
            to,
            key_type,
            reason,
            now,
        )?;
        self.key_registry
            .lock()
            .unwrap()
            .execute_transfer(&transfer, &self.identity.public_key())?;
        self.publish(EventType::KeyTransferred, transfer.to_bytes());
        Ok(())
    }

    /// Vouch one key into existence for another node (VOUCH_CREATED).
    /// Requires reputation of at least 100 and a free vouch slot.
    pub fn vouch_for_node(
        &self,
        vouchee: NodeId,
        key_type: KeyType,
        statement: &str,
    ) -> Result<()> {
        let now = now_seconds();
        let epoch = current_epoch();
        let my_reputation = self
            .projector
            .lock()
            .unwrap()
            .node_reputation(&self.node_id());
        let vouch = self.key_registry.lock().unwrap().create_vouch(
            self.identity.keypair(),
            vouchee,
            key_type,
            1,
            statement,
            my_reputation,
            now,
            epoch,
        )?;
        self.key_registry
            .lock()
            .unwrap()
            .execute_vouch(&vouch, &self.identity.public_key(), epoch)?;
        self.publish(EventType::VouchCreated, vouch.to_bytes());
        Ok(())
    }

    /// Publish a signed statement about another node
    /// (ATTESTATION_CREATED); it also updates the local trust graph
    pub fn attest(&self, subject: NodeId, score_delta: i32, statement: &str) -> Result<()> {
        let now = now_seconds();
        let attestation = Attestation::create(
            self.identity.keypair(),
            subject,
            score_delta,
            statement,
            now,
            30 * 24 * 3600,
        )?;
        self.reputation.lock().unwrap().add_attestation(
            attestation.clone(),
            &self.identity.public_key(),
            now,
        )?;
        self.publish(EventType::AttestationCreated, attestation.to_bytes());
        Ok(())
    }

    // --- things ---

    /// Store a blob and announce it (THING_CREATED + THING_REPLICATED).
    /// Requires the HOST_THINGS capability.
    pub fn create_thing(&self, data: &[u8]) -> Result<ContentHash> {
        let decision =
            self.check_access(&AccessRequest::new(self.node_id(), Capability::HostThings));
        if !decision.granted {
            return Err(Error::PermissionDenied(decision.reason));
        }

        let hash = self.content.lock().unwrap().put(data)?;
        self.key_registry
            .lock()
            .unwrap()
            .mark_used(&self.node_id(), KeyType::Service, now_seconds());

        let payload = ThingReplicationData {
            content_hash: hash,
            network_id: NetworkId([0u8; 32]),
            host: self.node_id(),
            size_bytes: data.len() as u64,
        };
        self.publish(EventType::ThingCreated, payload.to_bytes());
        self.publish(EventType::ThingReplicated, payload.to_bytes());
        self.record_reputation(self.node_id(), ReputationAction::HostThing, "hosted a thing");
        Ok(hash)
    }

    /// Serve a Thing through the renderer cache, optionally as an
    /// inclusive byte range
    pub fn render_thing(
        &self,
        hash: &ContentHash,
        range: Option<(usize, usize)>,
    ) -> Result<RenderResult> {
        self.renderer.render(hash, range, now_seconds())
    }

    /// Execute one replication transfer: verify the fetched bytes, store
    /// them, and announce the new replica
    pub fn complete_replication(
        &self,
        request: &ReplicationRequest,
        fetched: &[u8],
    ) -> Result<()> {
        let now = now_seconds();
        {
            let mut replication = self.replication.lock().unwrap();
            replication.mark_verifying(request, fetched.len() as u64);
        }

        match verify_replica(fetched, &request.thing_hash) {
            Ok(()) => {
                self.content
                    .lock()
                    .unwrap()
                    .put_verified(&request.thing_hash, fetched)?;
                self.replication
                    .lock()
                    .unwrap()
                    .mark_completed(request, true, "", now);

                let payload = ThingReplicationData {
                    content_hash: request.thing_hash,
                    network_id: request.network_id,
                    host: self.node_id(),
                    size_bytes: fetched.len() as u64,
                };
                self.publish(EventType::ThingReplicated, payload.to_bytes());
                Ok(())
            }
            Err(e) => {
                self.replication.lock().unwrap().mark_completed(
                    request,
                    false,
                    "hash mismatch",
                    now,
                );
                Err(e)
            }
        }
    }

    // --- networks ---

    /// Create a network for a Thing we host; we become its founder
    pub fn create_network(&self, thing_hash: ContentHash) -> Result<NetworkId> {
        let now = now_seconds();
        let network_id = {
            let mut registry = self.network_registry.lock().unwrap();
            let network_id = registry.create_network(thing_hash, now);
            let network = registry.network_mut(&network_id).unwrap();
            let mut founder = NetworkMember::new(
                self.node_id(),
                self.identity.public_key(),
                MemberRole::Founder,
                now,
            );
            founder.has_complete_replica = self.content.lock().unwrap().has(&thing_hash);
            network.add_member(founder);
            network_id
        };

        let created = ThingReplicationData {
            content_hash: thing_hash,
            network_id,
            host: self.node_id(),
            size_bytes: 0,
        };
        self.publish(EventType::NetworkCreated, created.to_bytes());

        let membership = NetworkMembershipData {
            network_id,
            member: self.node_id(),
            role: MemberRole::Founder.as_str().to_string(),
        };
        self.publish(EventType::NetworkMemberAdded, membership.to_bytes());
        Ok(network_id)
    }

    /// Invite a node into one of our networks
    pub fn invite_to_network(
        &self,
        network_id: &NetworkId,
        invitee: NodeId,
        role: MemberRole,
    ) -> Result<NetworkInvitation> {
        let now = now_seconds();
        let invitation = {
            let mut registry = self.network_registry.lock().unwrap();
            let network = registry
                .network_mut(network_id)
                .ok_or_else(|| Error::PeerNotFound(network_id.to_hex()))?;
            network.create_invitation(self.identity.keypair(), invitee, role, now)?
        };

        let membership = NetworkMembershipData {
            network_id: *network_id,
            member: invitee,
            role: role.as_str().to_string(),
        };
        self.publish(EventType::NetworkInvitationSent, membership.to_bytes());
        Ok(invitation)
    }

    /// Accept a verified invitation on behalf of the invitee (used by the
    /// network owner when the acceptance arrives)
    pub fn admit_member(
        &self,
        invitation: &NetworkInvitation,
        invitee_public_key: [u8; 32],
    ) -> Result<()> {
        let now = now_seconds();
        {
            let mut registry = self.network_registry.lock().unwrap();
            let network = registry
                .network_mut(&invitation.network_id)
                .ok_or_else(|| Error::PeerNotFound(invitation.network_id.to_hex()))?;
            network.accept_invitation(invitation, invitee_public_key, now)?;
        }

        let membership = NetworkMembershipData {
            network_id: invitation.network_id,
            member: invitation.invitee_id,
            role: invitation.proposed_role.as_str().to_string(),
        };
        self.publish(EventType::NetworkInvitationAccepted, membership.to_bytes());
        self.publish(EventType::NetworkMemberAdded, membership.to_bytes());
        Ok(())
    }

    // --- reputation ---

    fn record_reputation(&self, subject: NodeId, action: ReputationAction, reason: &str) {
        let delta = self
            .reputation
            .lock()
            .unwrap()
            .record_action(subject, action, None, now_seconds());
        let payload = ReputationUpdateData {
            subject,
            score_delta: delta,
            reason: reason.to_string(),
            evidence: [0u8; 32],
        };
        self.publish(EventType::ReputationUpdated, payload.to_bytes());
    }

    // --- periodic duties ---

    /// One pass of the decay check: emits KEY_DECAYED events and debits
    /// the registry
    pub fn decay_tick(&self) -> Vec<KeyDecayEvent> {
        let now = now_seconds();
        let epoch = current_epoch();
        let owners: Vec<NodeId> = self
            .projector
            .lock()
            .unwrap()
            .all_active_nodes()
            .iter()
            .map(|n| n.node_id)
            .collect();

        let decays = {
            let registry = self.key_registry.lock().unwrap();
            let mut decay = self.decay.lock().unwrap();
            decay.check_key_decay(&registry, &owners, now, epoch)
        };

        for event in &decays {
            // Only the key owner can append to its own chain; remote
            // owners emit their own decay events
            if event.node_id != self.node_id() {
                continue;
            }
            self.key_registry.lock().unwrap().remove_keys(
                &event.node_id,
                event.key_type,
                event.keys_decayed,
            );
            let payload = KeyDecayData {
                key_type: event.key_type as u8,
                count: event.keys_decayed,
                reason: event.reason.as_str().to_string(),
            };
            self.publish(EventType::KeyDecayed, payload.to_bytes());
        }
        decays
    }

    /// One pass of quorum maintenance: enqueue urgent replication for
    /// under-quorum networks, flag over-quorum members for removal
    pub fn quorum_tick(&self) {
        let now = now_seconds();
        let mut removals: Vec<(NetworkId, NodeId)> = Vec::new();
        {
            let mut networks = self.network_registry.lock().unwrap();
            let mut replication = self.replication.lock().unwrap();
            for network in networks.all_networks_mut() {
                network.cleanup_expired_invitations(now);
                network.observe_health(now);

                if network.should_add_replicas(now) {
                    if let Some(source) = network.select_best_source(now) {
                        // Targets are members without a complete replica
                        let targets: Vec<NodeId> = network
                            .members()
                            .iter()
                            .filter(|m| !m.has_complete_replica)
                            .map(|m| m.node_id)
                            .collect();
                        for target in targets {
                            replication.request_replication(ReplicationRequest {
                                network_id: network.id(),
                                thing_hash: network.thing_hash(),
                                source_node: source,
                                target_node: target,
                                request_timestamp: now,
                                priority: PRIORITY_URGENT,
                            });
                        }
                    }
                }

                if network.should_remove_replicas() {
                    for node in network.select_nodes_for_removal() {
                        removals.push((network.id(), node));
                    }
                }
            }
            for (network_id, node) in &removals {
                if let Some(network) = networks.network_mut(network_id) {
                    network.remove_member(node);
                }
            }
        }
        for (network_id, node) in removals {
            let membership = NetworkMembershipData {
                network_id,
                member: node,
                role: MemberRole::Full.as_str().to_string(),
            };
            self.publish(EventType::NetworkMemberRemoved, membership.to_bytes());
        }
        self.replication.lock().unwrap().cleanup_old_jobs(now);
    }

    // --- lifecycle ---

    /// Spawn the background loops. Each checks `running` every tick and
    /// exits within a second of shutdown.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("starting node {}", self.node_id());

        let mut workers = self.workers.lock().unwrap();

        // Sync worker: pump gossiped events and run the sync scheduler
        {
            let node = Arc::clone(self);
            let running = self.running.clone();
            workers.push(std::thread::spawn(move || {
                let mut scheduler = SyncScheduler::new();
                while running.load(Ordering::Relaxed) {
                    node.pump_events();
                    {
                        let mut bridge = node.bridge.lock().unwrap();
                        scheduler.tick(&mut bridge, now_seconds());
                    }
                    std::thread::sleep(Duration::from_millis(500));
                }
                log::info!("sync worker stopped");
            }));
        }

        // Decay and quorum worker: one pass per decay period
        {
            let node = Arc::clone(self);
            let running = self.running.clone();
            let period = Duration::from_secs(self.config.decay_period_seconds);
            workers.push(std::thread::spawn(move || {
                let mut elapsed = Duration::ZERO;
                while running.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(500));
                    elapsed += Duration::from_millis(500);
                    if elapsed >= period {
                        elapsed = Duration::ZERO;
                        node.decay_tick();
                        node.quorum_tick();
                        node.reputation.lock().unwrap().decay();
                        node.revocations.lock().unwrap().cleanup_expired(now_seconds());
                        node.renderer.cleanup_expired(now_seconds());
                    }
                }
                log::info!("decay worker stopped");
            }));
        }
    }

    /// Stop the background loops and persist state
    pub fn shutdown(&self) -> Result<()> {
        log::info!("shutting down node {}", self.node_id());
        self.running.store(false, Ordering::SeqCst);
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        self.persist()
    }

    /// Write ledger and networks to disk; in-memory state stays
    /// authoritative if a write fails
    pub fn persist(&self) -> Result<()> {
        self.ledger
            .lock()
            .unwrap()
            .persist(&self.config.ledger_path())?;
        self.network_registry
            .lock()
            .unwrap()
            .save_to_disk(&self.config.networks_path())?;
        Ok(())
    }

    // --- shared handles for collaborators (gateway, tests) ---

    pub fn ledger(&self) -> Arc<Mutex<EventLedger>> {
        self.ledger.clone()
    }

    pub fn projector(&self) -> Arc<Mutex<StateProjector>> {
        self.projector.clone()
    }

    pub fn bridge(&self) -> Arc<Mutex<LedgerGossipBridge>> {
        self.bridge.clone()
    }

    pub fn replication(&self) -> Arc<Mutex<ReplicationCoordinator>> {
        self.replication.clone()
    }

    pub fn content(&self) -> Arc<Mutex<ContentStore>> {
        self.content.clone()
    }

    pub fn renderer(&self) -> Arc<ContentRenderer> {
        self.renderer.clone()
    }

    pub fn networks(&self) -> Arc<Mutex<NetworkRegistry>> {
        self.network_registry.clone()
    }

    pub fn revocations(&self) -> Arc<Mutex<RevocationManager>> {
        self.revocations.clone()
    }

    pub fn reputation(&self) -> Arc<Mutex<ReputationManager>> {
        self.reputation.clone()
    }

    pub fn key_registry(&self) -> Arc<Mutex<KeyRegistry>> {
        self.key_registry.clone()
    }
}

/// Load a network object into this node's registry (used when adopting a
/// network learned from the ledger)
pub fn adopt_network(node: &CashewNode, network: Network) {
    node.network_registry.lock().unwrap().add_network(network);
}
