//! Peer state machine: roles, epochs, Bully election, sequencing, delivery.
//!
//! The engine owns all protocol state and is driven by messages and timer
//! ticks; every input carries an explicit `now_ms` and returns the IO the
//! runtime must perform. Nothing in here touches sockets, disks or clocks,
//! which keeps every election and ordering rule unit-testable.

use std::collections::{BTreeSet, HashSet};
use std::net::{IpAddr, SocketAddr};

use crate::config::{Limits, Timing};
use crate::ids::{Epoch, NodeId, PayloadId, Seq};
use crate::proto::{ControlMessage, OrderRecord, StreamMessage};
use crate::replica::{IngestOutcome, Replica};
use crate::stream::ConnId;

/// Where a control message should go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlTarget {
    /// The peer's own datagram port, via every discovery target address.
    Peer(NodeId),
    /// The shared discovery port, via every discovery target address.
    Discovery,
    /// Unicast reply to a datagram source.
    Addr(SocketAddr),
}

/// IO the runtime performs on the engine's behalf, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    SendControl {
        target: ControlTarget,
        message: ControlMessage,
    },
    /// Leader: send one record to every connected follower.
    BroadcastOrder(OrderRecord),
    /// Leader: unicast on one follower connection (catch-up).
    SendStream {
        conn: ConnId,
        message: StreamMessage,
    },
    /// Follower: send on the bound leader connection.
    SendLeader(StreamMessage),
    ConnectLeader {
        endpoint: SocketAddr,
    },
    DisconnectLeader,
    StartStreamServer,
    StopStreamServer,
    BindDiscovery,
    ReleaseDiscovery,
    /// Must complete durably before any following action runs.
    AppendWal(OrderRecord),
    Deliver(OrderRecord),
}

/// Follower's knowledge of the current leader.
#[derive(Clone, Debug)]
pub struct Binding {
    pub leader_id: NodeId,
    pub endpoint: SocketAddr,
    pub epoch: Epoch,
    pub last_seen_ms: u64,
    pub connected: bool,
    last_connect_ms: Option<u64>,
}

/// Leader-only sequencing state.
#[derive(Debug)]
pub struct Sequencer {
    next_seq: Seq,
    seen_payload_ids: HashSet<PayloadId>,
    conns: BTreeSet<ConnId>,
}

#[derive(Debug)]
pub enum Role {
    Follower { binding: Option<Binding> },
    Campaigning { epoch: Epoch, since_ms: u64 },
    AwaitingCoronation { epoch: Epoch, since_ms: u64 },
    Leader(Sequencer),
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Follower { .. } => "follower",
            Role::Campaigning { .. } => "campaigning",
            Role::AwaitingCoronation { .. } => "awaiting-coronation",
            Role::Leader(_) => "leader",
        }
    }

    fn candidate_epoch(&self) -> Option<Epoch> {
        match self {
            Role::Campaigning { epoch, .. } | Role::AwaitingCoronation { epoch, .. } => {
                Some(*epoch)
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub node_id: NodeId,
    pub cluster: Vec<NodeId>,
    pub stream_port: u16,
    /// Address advertised in discovery replies and coronations.
    pub advertise_ip: IpAddr,
    pub timing: Timing,
    pub limits: Limits,
    /// Jittered startup grace: campaign after being unbound this long.
    pub grace_ms: u64,
}

pub struct Engine {
    cfg: EngineConfig,
    epoch: Epoch,
    role: Role,
    replica: Replica,
    unbound_since_ms: u64,
    last_discovery_ms: Option<u64>,
    last_heartbeat_ms: Option<u64>,
}

impl Engine {
    pub fn new(cfg: EngineConfig, replayed: Vec<OrderRecord>, now_ms: u64) -> Self {
        let epoch = replayed.last().map(|r| r.epoch).unwrap_or(Epoch::ZERO);
        let resend_interval = cfg.timing.resend_interval_ms;
        let replica = Replica::from_records(replayed, &cfg.limits, resend_interval);
        if replica.last_seq() > 0 {
            tracing::info!(
                last_seq = replica.last_seq(),
                %epoch,
                "recovered delivery history from wal"
            );
        }
        Self {
            cfg,
            epoch,
            role: Role::Follower { binding: None },
            replica,
            unbound_since_ms: now_ms,
            last_discovery_ms: None,
            last_heartbeat_ms: None,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.cfg.node_id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn last_seq(&self) -> u64 {
        self.replica.last_seq()
    }

    // ---- datagram control plane ----

    pub fn handle_control(
        &mut self,
        message: ControlMessage,
        src: SocketAddr,
        now_ms: u64,
    ) -> Vec<Action> {
        match message {
            ControlMessage::WhoIsLeader { sender_id, .. } => {
                self.on_who_is_leader(sender_id, src)
            }
            ControlMessage::IAmLeader {
                leader_id,
                leader_stream_port,
                epoch,
                ..
            } => self.on_leader_claim(leader_id, leader_stream_port, epoch, src, now_ms, false),
            ControlMessage::Coordinator {
                leader_id,
                leader_stream_port,
                epoch,
                ..
            } => self.on_leader_claim(leader_id, leader_stream_port, epoch, src, now_ms, true),
            ControlMessage::LeaderAlive {
                leader_id, epoch, ..
            } => self.on_leader_alive(leader_id, epoch, now_ms),
            ControlMessage::Election {
                candidate_id,
                epoch,
            } => self.on_election(candidate_id, epoch, src, now_ms),
            ControlMessage::Answer { responder_id, epoch } => {
                self.on_answer(responder_id, epoch, now_ms)
            }
        }
    }

    fn on_who_is_leader(&self, sender_id: NodeId, src: SocketAddr) -> Vec<Action> {
        if !self.is_leader() {
            return Vec::new();
        }
        tracing::debug!(%sender_id, %src, "answering discovery query");
        vec![Action::SendControl {
            target: ControlTarget::Addr(src),
            message: ControlMessage::IAmLeader {
                leader_id: self.cfg.node_id,
                leader_ip: self.cfg.advertise_ip.to_string(),
                leader_stream_port: self.cfg.stream_port,
                epoch: self.epoch,
                last_seq: self.replica.last_seq(),
            },
        }]
    }

    /// Shared handling for `I_AM_LEADER` and `COORDINATOR`: both announce a
    /// leader with an endpoint. Coronations are accepted at the current
    /// epoch; discovery replies only improve on the existing binding.
    fn on_leader_claim(
        &mut self,
        leader_id: NodeId,
        stream_port: u16,
        claim_epoch: Epoch,
        src: SocketAddr,
        now_ms: u64,
        coronation: bool,
    ) -> Vec<Action> {
        if leader_id == self.cfg.node_id {
            // Our own broadcast looped back.
            return Vec::new();
        }

        // Claims fan out over several broadcast addresses, so duplicates are
        // routine; a copy of the claim we already hold only refreshes the
        // failure detector.
        if let Role::Follower {
            binding: Some(binding),
        } = &mut self.role
            && binding.leader_id == leader_id
            && binding.epoch == claim_epoch
        {
            binding.last_seen_ms = now_ms;
            self.epoch = self.epoch.max(claim_epoch);
            return Vec::new();
        }

        let accept = match &self.role {
            Role::Leader(_) => {
                // Bully tie-break: a higher epoch always wins; at our own
                // epoch only a higher id may take over.
                claim_epoch > self.epoch
                    || (claim_epoch == self.epoch && leader_id > self.cfg.node_id)
            }
            // A campaigner only yields to a leadership at least as new as
            // its own candidacy; an older claim is from a leadership it is
            // actively trying to replace.
            Role::Campaigning { epoch, .. } | Role::AwaitingCoronation { epoch, .. } => {
                claim_epoch >= *epoch
            }
            Role::Follower { binding: None } => claim_epoch >= self.epoch,
            Role::Follower {
                binding: Some(binding),
            } => {
                if coronation {
                    claim_epoch > binding.epoch
                        || (claim_epoch == binding.epoch && leader_id > binding.leader_id)
                } else {
                    // Discovery replies only replace a strictly older binding.
                    claim_epoch > binding.epoch
                }
            }
        };
        if !accept {
            return Vec::new();
        }

        let endpoint = SocketAddr::new(src.ip(), stream_port);
        tracing::info!(
            %leader_id,
            epoch = %claim_epoch,
            %endpoint,
            coronation,
            "adopting leader"
        );
        self.adopt_leader(leader_id, endpoint, claim_epoch, now_ms)
    }

    fn on_leader_alive(&mut self, leader_id: NodeId, epoch: Epoch, now_ms: u64) -> Vec<Action> {
        if leader_id == self.cfg.node_id {
            return Vec::new();
        }

        match &mut self.role {
            Role::Leader(_) => {
                if epoch > self.epoch || (epoch == self.epoch && leader_id > self.cfg.node_id) {
                    // Someone else is legitimately leading; get out of the way
                    // and rediscover (heartbeats carry no endpoint).
                    tracing::warn!(%leader_id, %epoch, "higher leader heartbeat, stepping down");
                    self.epoch = self.epoch.max(epoch);
                    let actions = self.step_down_actions();
                    self.become_unbound(now_ms);
                    return actions;
                }
                Vec::new()
            }
            Role::Follower {
                binding: Some(binding),
            } => {
                if leader_id == binding.leader_id && epoch >= binding.epoch {
                    binding.last_seen_ms = now_ms;
                    binding.epoch = binding.epoch.max(epoch);
                    self.epoch = self.epoch.max(epoch);
                } else if epoch > binding.epoch {
                    // Evidence of a newer leadership we are not bound to.
                    tracing::info!(%leader_id, %epoch, "newer leader heartbeat, rebinding");
                    self.epoch = self.epoch.max(epoch);
                    self.become_unbound(now_ms);
                    return vec![Action::DisconnectLeader];
                }
                Vec::new()
            }
            _ => {
                // Unbound or mid-election: heartbeats alone cannot bind (no
                // endpoint); discovery will find the leader.
                self.epoch = self.epoch.max(epoch);
                Vec::new()
            }
        }
    }

    fn on_election(
        &mut self,
        candidate_id: NodeId,
        election_epoch: Epoch,
        src: SocketAddr,
        now_ms: u64,
    ) -> Vec<Action> {
        if candidate_id >= self.cfg.node_id {
            return Vec::new();
        }

        let mut actions = vec![Action::SendControl {
            target: ControlTarget::Addr(src),
            message: ControlMessage::Answer {
                responder_id: self.cfg.node_id,
                epoch: self.epoch.max(election_epoch),
            },
        }];

        if self.is_leader() && self.higher_peers().is_empty() {
            if election_epoch > self.epoch {
                // Highest id and already leading: re-coronate at an epoch
                // superseding the candidate's instead of tearing anything
                // down.
                self.epoch = self.epoch.next().max(election_epoch);
                tracing::info!(%candidate_id, epoch = %self.epoch, "re-coronating over election");
                actions.extend(self.coordinator_broadcast());
            } else {
                // Stale or duplicate campaign: point the candidate straight
                // at the current coronation.
                actions.push(Action::SendControl {
                    target: ControlTarget::Addr(src),
                    message: ControlMessage::Coordinator {
                        leader_id: self.cfg.node_id,
                        leader_ip: self.cfg.advertise_ip.to_string(),
                        leader_stream_port: self.cfg.stream_port,
                        epoch: self.epoch,
                        last_seq: self.replica.last_seq(),
                    },
                });
            }
            return actions;
        }

        // A lower peer is campaigning; make sure a campaign of our own is
        // running at least at that epoch.
        let already_at = self
            .role
            .candidate_epoch()
            .is_some_and(|epoch| epoch >= election_epoch);
        if !already_at {
            actions.extend(self.start_campaign(now_ms));
        }
        actions
    }

    fn on_answer(&mut self, responder_id: NodeId, epoch: Epoch, now_ms: u64) -> Vec<Action> {
        self.epoch = self.epoch.max(epoch);
        if let Role::Campaigning {
            epoch: candidate, ..
        } = self.role
        {
            if epoch >= candidate {
                tracing::info!(%responder_id, "higher peer answered, awaiting coronation");
                self.role = Role::AwaitingCoronation {
                    epoch: candidate,
                    since_ms: now_ms,
                };
            }
        }
        Vec::new()
    }

    // ---- leader stream plane ----

    pub fn handle_conn_opened(&mut self, conn: ConnId, peer: SocketAddr) -> Vec<Action> {
        if let Role::Leader(sequencer) = &mut self.role {
            sequencer.conns.insert(conn);
            tracing::info!(%conn, %peer, followers = sequencer.conns.len(), "follower connected");
        }
        Vec::new()
    }

    pub fn handle_conn_closed(&mut self, conn: ConnId) -> Vec<Action> {
        if let Role::Leader(sequencer) = &mut self.role
            && sequencer.conns.remove(&conn)
        {
            tracing::info!(%conn, followers = sequencer.conns.len(), "follower disconnected");
        }
        Vec::new()
    }

    pub fn handle_stream_inbound(
        &mut self,
        conn: ConnId,
        message: StreamMessage,
        now_ms: u64,
    ) -> Vec<Action> {
        if !self.is_leader() {
            return Vec::new();
        }
        match message {
            StreamMessage::NewOrder {
                payload_id,
                submitter_id,
                submitted_at_ms,
                body,
            } => self.sequence(payload_id, submitter_id, submitted_at_ms, body, now_ms),
            StreamMessage::ResendRequest { from_seq } => self.serve_catch_up(conn, from_seq),
            StreamMessage::Order(_) => {
                tracing::debug!(%conn, "ignoring ORDER sent to the sequencer");
                Vec::new()
            }
        }
    }

    /// Assign the next sequence number to a first-seen payload, then log,
    /// deliver locally and broadcast, in that order.
    fn sequence(
        &mut self,
        payload_id: PayloadId,
        submitter_id: NodeId,
        submitted_at_ms: u64,
        body: String,
        now_ms: u64,
    ) -> Vec<Action> {
        let epoch = self.epoch;
        let Role::Leader(sequencer) = &mut self.role else {
            return Vec::new();
        };

        if sequencer.seen_payload_ids.contains(&payload_id) {
            tracing::debug!(%payload_id, "duplicate payload dropped");
            return Vec::new();
        }

        let record = OrderRecord {
            epoch,
            seq: sequencer.next_seq,
            payload_id: payload_id.clone(),
            submitter_id,
            submitted_at_ms,
            body,
        };
        sequencer.next_seq = sequencer.next_seq.next();
        sequencer.seen_payload_ids.insert(payload_id);

        tracing::info!(seq = %record.seq, %epoch, submitter = %submitter_id, "sequenced order");

        let mut actions = vec![Action::AppendWal(record.clone())];
        match self.replica.ingest(record.clone(), now_ms) {
            IngestOutcome::Deliver(run) => {
                actions.extend(run.into_iter().map(Action::Deliver));
            }
            outcome => {
                debug_assert!(false, "sequencer delivery must be in order, got {outcome:?}");
            }
        }
        actions.push(Action::BroadcastOrder(record));
        actions
    }

    /// Stream history `[from_seq, next_seq)` on one connection. The runtime
    /// executes these before any later broadcast, so the per-connection
    /// order stays sequence-monotonic.
    fn serve_catch_up(&self, conn: ConnId, from_seq: Seq) -> Vec<Action> {
        let records = self.replica.range_from(from_seq);
        tracing::debug!(%conn, %from_seq, count = records.len(), "serving catch-up");
        records
            .iter()
            .map(|record| Action::SendStream {
                conn,
                message: StreamMessage::Order(record.clone()),
            })
            .collect()
    }

    // ---- follower stream plane ----

    pub fn handle_leader_connected(&mut self, now_ms: u64) -> Vec<Action> {
        let expected = self.replica.expected_seq();
        match &mut self.role {
            Role::Follower {
                binding: Some(binding),
            } => {
                binding.connected = true;
                binding.last_seen_ms = now_ms;
                self.replica.note_resend_sent(now_ms);
                vec![Action::SendLeader(StreamMessage::ResendRequest {
                    from_seq: expected,
                })]
            }
            _ => vec![Action::DisconnectLeader],
        }
    }

    pub fn handle_leader_disconnected(&mut self) -> Vec<Action> {
        if let Role::Follower {
            binding: Some(binding),
        } = &mut self.role
        {
            binding.connected = false;
        }
        Vec::new()
    }

    pub fn handle_leader_stream(&mut self, message: StreamMessage, now_ms: u64) -> Vec<Action> {
        let StreamMessage::Order(record) = message else {
            tracing::debug!("ignoring non-ORDER record from leader");
            return Vec::new();
        };

        if record.epoch < self.epoch {
            tracing::debug!(epoch = %record.epoch, "stale-epoch order discarded");
            return Vec::new();
        }
        if record.epoch > self.epoch {
            // A leadership we never saw crowned: discard and rediscover
            // rather than trusting data from an unvalidated endpoint.
            tracing::info!(epoch = %record.epoch, "order from future epoch, rebinding");
            self.epoch = record.epoch;
            self.become_unbound(now_ms);
            return vec![Action::DisconnectLeader];
        }

        if let Role::Follower {
            binding: Some(binding),
        } = &mut self.role
        {
            binding.last_seen_ms = now_ms;
        }

        match self.replica.ingest(record, now_ms) {
            IngestOutcome::Deliver(run) => {
                let mut actions = Vec::with_capacity(run.len() * 2);
                for record in run {
                    actions.push(Action::AppendWal(record.clone()));
                    actions.push(Action::Deliver(record));
                }
                actions
            }
            IngestOutcome::Buffered { resend_from } => match resend_from {
                Some(from_seq) => {
                    tracing::debug!(%from_seq, "gap detected, requesting retransmission");
                    vec![Action::SendLeader(StreamMessage::ResendRequest { from_seq })]
                }
                None => Vec::new(),
            },
            IngestOutcome::Duplicate => Vec::new(),
        }
    }

    // ---- application sink ----

    pub fn handle_submit(
        &mut self,
        payload_id: PayloadId,
        body: String,
        now_ms: u64,
    ) -> Vec<Action> {
        match &self.role {
            Role::Leader(_) => {
                // The leader is its own client; no loopback connection.
                self.sequence(payload_id, self.cfg.node_id, now_ms, body, now_ms)
            }
            Role::Follower {
                binding: Some(binding),
            } if binding.connected => vec![Action::SendLeader(StreamMessage::NewOrder {
                payload_id,
                submitter_id: self.cfg.node_id,
                submitted_at_ms: now_ms,
                body,
            })],
            _ => {
                tracing::warn!("dropping submission: no leader connection");
                Vec::new()
            }
        }
    }

    // ---- timers ----

    pub fn tick(&mut self, now_ms: u64) -> Vec<Action> {
        let mut actions = match &mut self.role {
            Role::Leader(_) => self.leader_tick(now_ms),
            Role::Follower {
                binding: Some(binding),
            } => {
                if now_ms.saturating_sub(binding.last_seen_ms) > self.cfg.timing.leader_timeout_ms
                {
                    // Failure detector edge.
                    tracing::warn!(
                        leader = %binding.leader_id,
                        "leader timed out, campaigning"
                    );
                    let mut actions = vec![Action::DisconnectLeader];
                    self.role = Role::Follower { binding: None };
                    self.unbound_since_ms = now_ms;
                    actions.extend(self.start_campaign(now_ms));
                    actions
                } else if !binding.connected
                    && binding
                        .last_connect_ms
                        .is_none_or(|last| {
                            now_ms.saturating_sub(last) >= self.cfg.timing.discovery_interval_ms
                        })
                {
                    binding.last_connect_ms = Some(now_ms);
                    vec![Action::ConnectLeader {
                        endpoint: binding.endpoint,
                    }]
                } else {
                    Vec::new()
                }
            }
            Role::Follower { binding: None } => {
                if now_ms.saturating_sub(self.unbound_since_ms) >= self.cfg.grace_ms {
                    self.start_campaign(now_ms)
                } else {
                    self.discovery_tick(now_ms)
                }
            }
            Role::Campaigning { epoch, since_ms } => {
                let epoch = *epoch;
                if now_ms.saturating_sub(*since_ms) >= self.cfg.timing.election_answer_timeout_ms
                {
                    // No higher peer objected.
                    self.promote(epoch, now_ms)
                } else {
                    Vec::new()
                }
            }
            Role::AwaitingCoronation { since_ms, .. } => {
                if now_ms.saturating_sub(*since_ms) >= self.cfg.timing.coordinator_timeout_ms {
                    tracing::info!("coordinator never arrived, restarting campaign");
                    self.start_campaign(now_ms)
                } else {
                    Vec::new()
                }
            }
        };

        if let Role::Follower {
            binding: Some(binding),
        } = &self.role
        {
            if binding.connected
                && let Some(from_seq) = self.replica.due_resend(now_ms)
            {
                actions.push(Action::SendLeader(StreamMessage::ResendRequest { from_seq }));
            }
        }
        actions
    }

    fn leader_tick(&mut self, now_ms: u64) -> Vec<Action> {
        let due = self
            .last_heartbeat_ms
            .is_none_or(|last| now_ms.saturating_sub(last) >= self.cfg.timing.heartbeat_interval_ms);
        if !due {
            return Vec::new();
        }
        self.last_heartbeat_ms = Some(now_ms);

        let heartbeat = ControlMessage::LeaderAlive {
            leader_id: self.cfg.node_id,
            epoch: self.epoch,
            last_seq: self.replica.last_seq(),
        };
        let mut actions = Vec::new();
        for _ in 0..self.cfg.timing.heartbeat_redundancy {
            for peer in self.other_peers() {
                actions.push(Action::SendControl {
                    target: ControlTarget::Peer(peer),
                    message: heartbeat.clone(),
                });
            }
        }
        actions
    }

    fn discovery_tick(&mut self, now_ms: u64) -> Vec<Action> {
        let due = self
            .last_discovery_ms
            .is_none_or(|last| now_ms.saturating_sub(last) >= self.cfg.timing.discovery_interval_ms);
        if !due {
            return Vec::new();
        }
        self.last_discovery_ms = Some(now_ms);
        vec![Action::SendControl {
            target: ControlTarget::Discovery,
            message: ControlMessage::WhoIsLeader {
                sender_id: self.cfg.node_id,
                sender_stream_port: self.cfg.stream_port,
            },
        }]
    }

    // ---- wal failures ----

    /// A peer that cannot persist must not keep its role: a leader that
    /// cannot log must not broadcast, and a follower that cannot log must
    /// not acknowledge progress. Abandon the role and let the cluster
    /// re-elect while the runtime reopens the log.
    pub fn handle_wal_failure(&mut self, now_ms: u64) -> Vec<Action> {
        tracing::error!(role = self.role.name(), "wal append failed, abandoning role");
        let actions = match self.role {
            Role::Leader(_) => self.step_down_actions(),
            _ => vec![Action::DisconnectLeader],
        };
        self.become_unbound(now_ms);
        actions
    }

    // ---- transitions ----

    fn adopt_leader(
        &mut self,
        leader_id: NodeId,
        endpoint: SocketAddr,
        epoch: Epoch,
        now_ms: u64,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.is_leader() {
            actions.extend(self.step_down_actions());
        } else {
            actions.push(Action::DisconnectLeader);
        }

        if epoch > self.epoch {
            // Records buffered under the old leadership may not match the new
            // assignment of those sequence numbers.
            self.replica.clear_pending();
        }
        self.epoch = self.epoch.max(epoch);
        self.role = Role::Follower {
            binding: Some(Binding {
                leader_id,
                endpoint,
                epoch,
                last_seen_ms: now_ms,
                connected: false,
                last_connect_ms: Some(now_ms),
            }),
        };
        actions.push(Action::ConnectLeader { endpoint });
        actions
    }

    fn become_unbound(&mut self, now_ms: u64) {
        self.replica.clear_pending();
        self.role = Role::Follower { binding: None };
        self.unbound_since_ms = now_ms;
        self.last_discovery_ms = None;
    }

    fn step_down_actions(&mut self) -> Vec<Action> {
        vec![Action::StopStreamServer, Action::ReleaseDiscovery]
    }

    fn start_campaign(&mut self, now_ms: u64) -> Vec<Action> {
        let base = self
            .role
            .candidate_epoch()
            .map_or(self.epoch, |candidate| self.epoch.max(candidate));
        let candidate = base.next();

        let mut actions = Vec::new();
        if self.is_leader() {
            actions.extend(self.step_down_actions());
        }

        let higher = self.higher_peers();
        if higher.is_empty() {
            tracing::info!(epoch = %candidate, "no higher peers, promoting directly");
            actions.extend(self.promote(candidate, now_ms));
            return actions;
        }

        tracing::info!(epoch = %candidate, ?higher, "campaign started");
        self.role = Role::Campaigning {
            epoch: candidate,
            since_ms: now_ms,
        };
        for peer in higher {
            actions.push(Action::SendControl {
                target: ControlTarget::Peer(peer),
                message: ControlMessage::Election {
                    candidate_id: self.cfg.node_id,
                    epoch: candidate,
                },
            });
        }
        actions
    }

    fn promote(&mut self, epoch: Epoch, now_ms: u64) -> Vec<Action> {
        self.epoch = epoch;
        // Gap leftovers from the previous leadership would collide with the
        // sequence numbers this peer is about to assign.
        self.replica.clear_pending();
        let seen_payload_ids = self
            .replica
            .history()
            .iter()
            .map(|record| record.payload_id.clone())
            .collect();
        self.role = Role::Leader(Sequencer {
            next_seq: self.replica.expected_seq(),
            seen_payload_ids,
            conns: BTreeSet::new(),
        });
        self.last_heartbeat_ms = Some(now_ms);

        tracing::info!(%epoch, next_seq = %self.replica.expected_seq(), "promoted to leader");

        let mut actions = vec![Action::BindDiscovery, Action::StartStreamServer];
        actions.extend(self.coordinator_broadcast());
        actions
    }

    fn coordinator_broadcast(&self) -> Vec<Action> {
        let message = ControlMessage::Coordinator {
            leader_id: self.cfg.node_id,
            leader_ip: self.cfg.advertise_ip.to_string(),
            leader_stream_port: self.cfg.stream_port,
            epoch: self.epoch,
            last_seq: self.replica.last_seq(),
        };
        self.other_peers()
            .into_iter()
            .map(|peer| Action::SendControl {
                target: ControlTarget::Peer(peer),
                message: message.clone(),
            })
            .collect()
    }

    fn other_peers(&self) -> Vec<NodeId> {
        self.cfg
            .cluster
            .iter()
            .copied()
            .filter(|id| *id != self.cfg.node_id)
            .collect()
    }

    fn higher_peers(&self) -> Vec<NodeId> {
        self.cfg
            .cluster
            .iter()
            .copied()
            .filter(|id| *id > self.cfg.node_id)
            .collect()
    }
}
