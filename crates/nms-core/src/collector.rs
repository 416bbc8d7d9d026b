//! Collector side of NetTask: one responder and one link per agent address.
//!
//! Peers are independent. Each address owns its own [`Responder`], its own
//! sequence state and, once the challenge is confirmed, its own [`Session`];
//! nothing is shared between them. The peer table is ordered by address so
//! `tick` reports expiries in a stable order.
//!
//! The agent sends REQUEST_TASK right behind its REGISTER_CHALLENGE2, so the
//! two can arrive swapped. A peer still in `KeySent` holds on to one sealed
//! datagram and replays it once the challenge is confirmed.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    time::Instant,
};

use bytes::Bytes;
use nms_proto::{
    Datagram, NetTaskBody, NetTaskDatagram, NetTaskKind,
    payloads::{MetricsReport, MetricsRequest, TaskRequest, TaskSpec},
};

use crate::{
    channel::{NetTaskLink, open_body},
    config::LinkConfig,
    env::Environment,
    error::{LinkError, Result},
    handshake::{HandshakeState, Responder},
    session::Session,
};

/// Actions returned by the collector state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorAction {
    /// Send this datagram to `to`
    Send {
        /// Destination agent
        to: SocketAddr,
        /// Datagram to encode and send
        datagram: NetTaskDatagram,
    },

    /// Agent at `peer` confirmed its challenge
    Registered {
        /// Agent address
        peer: SocketAddr,
    },

    /// Agent asked for work and was given `task_id`
    TaskAssigned {
        /// Agent address
        peer: SocketAddr,
        /// Identifier the agent reported
        agent_id: u32,
        /// Task sent back
        task_id: u32,
    },

    /// Agent delivered samples
    MetricsReceived {
        /// Agent address
        peer: SocketAddr,
        /// Identifier the agent reported, if it asked for a task first
        agent_id: Option<u32>,
        /// Decoded report
        report: MetricsReport,
    },

    /// Confirmation did not verify; the peer was dropped
    Rejected {
        /// Agent address
        peer: SocketAddr,
        /// Why verification failed
        reason: String,
    },

    /// Peer state was discarded (timeout or desynchronized session)
    Closed {
        /// Agent address
        peer: SocketAddr,
        /// Why the peer was dropped
        reason: String,
    },
}

/// Collector configuration.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Timeouts and limits applied per peer
    pub link: LinkConfig,
    /// Task handed to agents without a specific assignment
    pub default_task: TaskSpec,
    /// Per-agent task assignments
    pub tasks: HashMap<u32, TaskSpec>,
}

struct Peer {
    responder: Responder,
    // Ephemeral key of the offer that opened this handshake
    offer_key: Bytes,
    session: Option<Session>,
    link: NetTaskLink,
    // Sealed datagram that overtook the confirmation
    early: Option<NetTaskDatagram>,
    agent_id: Option<u32>,
    started: Instant,
    last_inbound: Instant,
}

impl Peer {
    fn state(&self) -> HandshakeState {
        self.responder.state()
    }
}

/// Collector state machine.
pub struct Collector {
    config: CollectorConfig,
    peers: BTreeMap<SocketAddr, Peer>,
}

impl Collector {
    /// Create a collector with no peers
    #[must_use]
    pub fn new(config: CollectorConfig) -> Self {
        Self { config, peers: BTreeMap::new() }
    }

    /// Assign `spec` to `agent_id` for future task requests
    pub fn assign_task(&mut self, agent_id: u32, spec: TaskSpec) {
        self.config.tasks.insert(agent_id, spec);
    }

    /// Handshake state of `peer`, if known
    #[must_use]
    pub fn peer_state(&self, peer: SocketAddr) -> Option<HandshakeState> {
        self.peers.get(&peer).map(Peer::state)
    }

    /// Agent id reported by `peer`, once it asked for a task
    #[must_use]
    pub fn agent_id(&self, peer: SocketAddr) -> Option<u32> {
        self.peers.get(&peer).and_then(|p| p.agent_id)
    }

    /// Session with `peer`, once established
    #[must_use]
    pub fn session(&self, peer: SocketAddr) -> Option<&Session> {
        self.peers.get(&peer).and_then(|p| p.session.as_ref())
    }

    /// Sequence state shared with `peer`
    #[must_use]
    pub fn link(&self, peer: SocketAddr) -> Option<&NetTaskLink> {
        self.peers.get(&peer).map(|p| &p.link)
    }

    /// Number of half-open handshakes
    #[must_use]
    pub fn pending_handshakes(&self) -> usize {
        self.peers.values().filter(|p| p.state() == HandshakeState::KeySent).count()
    }

    /// Addresses with an established session
    pub fn established_peers(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.peers
            .iter()
            .filter(|(_, p)| p.state() == HandshakeState::Established)
            .map(|(addr, _)| *addr)
    }

    /// Process one datagram received from `from`.
    ///
    /// # Errors
    ///
    /// - [`LinkError::Protocol`] for an undecodable datagram
    /// - [`LinkError::TooManyHandshakes`] when the half-open table is full
    /// - [`LinkError::Handshake`] for a key offer that cannot be answered
    /// - [`LinkError::UnknownPeer`] for post-handshake traffic from an
    ///   address with no handshake
    /// - [`LinkError::Crypto`] or [`LinkError::InvalidPayload`] for a sealed
    ///   body that does not open
    /// - [`LinkError::UnexpectedDatagram`] for a kind that does not fit the
    ///   peer's state
    pub fn handle_datagram<E: Environment>(
        &mut self,
        env: &E,
        bytes: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<Vec<CollectorAction>> {
        let datagram = NetTaskDatagram::decode(bytes)?;

        if let NetTaskBody::RequestRegister(offer) = &datagram.body {
            return self.begin_handshake(env, &datagram, offer, from, now);
        }

        let result = self.handle_peer(env, datagram, from, now);
        match result {
            Err(err) if err.is_session_fatal() => {
                tracing::warn!(peer = %from, error = %err, "Discarding peer session");
                self.peers.remove(&from);
                Ok(vec![CollectorAction::Closed { peer: from, reason: err.to_string() }])
            },
            other => other,
        }
    }

    fn begin_handshake<E: Environment>(
        &mut self,
        env: &E,
        datagram: &NetTaskDatagram,
        offer: &nms_proto::KeyOffer,
        from: SocketAddr,
        now: Instant,
    ) -> Result<Vec<CollectorAction>> {
        if self.peers.get(&from).is_some_and(|peer| peer.offer_key == offer.public_key) {
            tracing::trace!(peer = %from, "Dropping repeated key offer");
            return Ok(Vec::new());
        }

        let replacing_pending = self.peer_state(from) == Some(HandshakeState::KeySent);
        let pending = self.pending_handshakes() - usize::from(replacing_pending);
        let limit = self.config.link.max_pending_handshakes;
        if pending >= limit {
            tracing::warn!(peer = %from, limit, "Refusing registration, handshake table full");
            return Err(LinkError::TooManyHandshakes { limit });
        }

        if self.peers.remove(&from).is_some() {
            tracing::debug!(peer = %from, "Restarting registration");
        }

        let mut peer = Peer {
            responder: Responder::new(env, self.config.link.max_decrypt_failures),
            offer_key: offer.public_key.clone(),
            session: None,
            link: NetTaskLink::new(),
            early: None,
            agent_id: None,
            started: now,
            last_inbound: now,
        };

        let challenge = peer.responder.on_offer(env, offer, from).map_err(|err| {
            tracing::warn!(peer = %from, error = %err, "Rejecting key offer");
            err
        })?;
        peer.link.commit(&datagram.header);
        let reply = peer.link.outbound(NetTaskBody::RegisterChallenge(challenge))?;
        self.peers.insert(from, peer);

        tracing::debug!(peer = %from, "Issued registration challenge");
        Ok(vec![CollectorAction::Send { to: from, datagram: reply }])
    }

    fn handle_peer<E: Environment>(
        &mut self,
        env: &E,
        datagram: NetTaskDatagram,
        from: SocketAddr,
        now: Instant,
    ) -> Result<Vec<CollectorAction>> {
        let Some(peer) = self.peers.get_mut(&from) else {
            let kind = datagram.body.kind();
            tracing::warn!(peer = %from, ?kind, "Datagram from unknown peer");
            return Err(LinkError::UnknownPeer(from));
        };

        let delivery = peer.link.classify(&datagram.header);
        if !delivery.is_fresh() {
            tracing::trace!(
                peer = %from,
                sequence = datagram.header.sequence,
                ?delivery,
                "Dropping repeated datagram"
            );
            return Ok(Vec::new());
        }

        let state = peer.state();
        match (&datagram.body, state) {
            (NetTaskBody::RegisterChallenge2(response), HandshakeState::KeySent) => {
                match peer.responder.on_response(response, from) {
                    Ok(session) => {
                        peer.session = Some(session);
                        peer.link.commit(&datagram.header);
                        peer.last_inbound = now;
                        let early = peer.early.take();
                        tracing::debug!(peer = %from, "Agent registered");

                        let mut actions = vec![CollectorAction::Registered { peer: from }];
                        if let Some(early) = early {
                            actions.extend(self.deliver_early(env, early, from, now));
                        }
                        Ok(actions)
                    },
                    Err(err) => {
                        tracing::warn!(peer = %from, error = %err, "Challenge confirmation failed");
                        self.peers.remove(&from);
                        Ok(vec![CollectorAction::Rejected { peer: from, reason: err.to_string() }])
                    },
                }
            },
            (
                NetTaskBody::RequestTask(_) | NetTaskBody::ResponseMetrics(_),
                HandshakeState::KeySent,
            ) => {
                tracing::trace!(
                    peer = %from,
                    kind = ?datagram.body.kind(),
                    "Holding sealed datagram until the challenge is confirmed"
                );
                peer.early = Some(datagram.clone());
                Ok(Vec::new())
            },
            (NetTaskBody::RequestTask(_), HandshakeState::Established) => {
                let session = established(peer, state)?;
                let request: TaskRequest = open_body(session, &datagram, "task request")?;
                peer.link.commit(&datagram.header);
                peer.agent_id = Some(request.agent_id);
                peer.last_inbound = now;

                let spec = self
                    .config
                    .tasks
                    .get(&request.agent_id)
                    .unwrap_or(&self.config.default_task);
                let session = peer
                    .session
                    .as_ref()
                    .ok_or(LinkError::InvalidState { state, operation: "use session" })?;
                let reply =
                    peer.link.outbound_sealed(session, env, NetTaskKind::ResponseTask, spec)?;

                tracing::debug!(
                    peer = %from,
                    agent_id = request.agent_id,
                    task_id = spec.task_id,
                    "Assigned task"
                );
                Ok(vec![
                    CollectorAction::Send { to: from, datagram: reply },
                    CollectorAction::TaskAssigned {
                        peer: from,
                        agent_id: request.agent_id,
                        task_id: spec.task_id,
                    },
                ])
            },
            (NetTaskBody::ResponseMetrics(_), HandshakeState::Established) => {
                let session = established(peer, state)?;
                let report: MetricsReport = open_body(session, &datagram, "metrics report")?;
                peer.link.commit(&datagram.header);
                peer.last_inbound = now;

                tracing::debug!(
                    peer = %from,
                    task_id = report.task_id,
                    samples = report.samples.len(),
                    "Received metrics"
                );
                Ok(vec![CollectorAction::MetricsReceived {
                    peer: from,
                    agent_id: peer.agent_id,
                    report,
                }])
            },
            (body, state) => {
                tracing::warn!(peer = %from, kind = ?body.kind(), ?state, "Unexpected datagram");
                Err(LinkError::UnexpectedDatagram {
                    state,
                    family: NetTaskDatagram::FAMILY,
                    tag: body.kind().to_u32(),
                })
            },
        }
    }

    /// Ask the agent at `peer` for the samples of a task.
    ///
    /// # Errors
    ///
    /// - [`LinkError::UnknownPeer`] for an address with no handshake
    /// - [`LinkError::InvalidState`] before its session is established
    pub fn request_metrics<E: Environment>(
        &mut self,
        env: &E,
        peer: SocketAddr,
        request: &MetricsRequest,
    ) -> Result<Vec<CollectorAction>> {
        let entry = self.peers.get_mut(&peer).ok_or(LinkError::UnknownPeer(peer))?;
        let state = entry.state();
        if state != HandshakeState::Established {
            return Err(LinkError::InvalidState { state, operation: "request metrics" });
        }

        let session = entry
            .session
            .as_ref()
            .ok_or(LinkError::InvalidState { state, operation: "use session" })?;
        match entry.link.outbound_sealed(session, env, NetTaskKind::RequestMetrics, request) {
            Ok(datagram) => Ok(vec![CollectorAction::Send { to: peer, datagram }]),
            Err(err) if err.is_session_fatal() => {
                tracing::warn!(peer = %peer, error = %err, "Discarding peer session");
                self.peers.remove(&peer);
                Ok(vec![CollectorAction::Closed { peer, reason: err.to_string() }])
            },
            Err(err) => Err(err),
        }
    }

    fn deliver_early<E: Environment>(
        &mut self,
        env: &E,
        early: NetTaskDatagram,
        from: SocketAddr,
        now: Instant,
    ) -> Vec<CollectorAction> {
        match self.handle_peer(env, early, from, now) {
            Ok(actions) => actions,
            Err(err) if err.is_session_fatal() => {
                tracing::warn!(peer = %from, error = %err, "Discarding peer session");
                self.peers.remove(&from);
                vec![CollectorAction::Closed { peer: from, reason: err.to_string() }]
            },
            Err(err) => {
                tracing::warn!(peer = %from, error = %err, "Dropping held datagram");
                Vec::new()
            },
        }
    }

    /// Drop half-open handshakes and idle sessions that ran out of time.
    pub fn tick(&mut self, now: Instant) -> Vec<CollectorAction> {
        let link = &self.config.link;
        let mut expired = Vec::new();

        for (addr, peer) in &self.peers {
            let err = match peer.state() {
                HandshakeState::Established => {
                    let elapsed = now.duration_since(peer.last_inbound);
                    (elapsed > link.idle_timeout).then_some(LinkError::IdleTimeout { elapsed })
                },
                _ => {
                    let elapsed = now.duration_since(peer.started);
                    (elapsed > link.handshake_timeout)
                        .then_some(LinkError::HandshakeTimeout { elapsed })
                },
            };
            if let Some(err) = err {
                expired.push((*addr, err));
            }
        }

        expired
            .into_iter()
            .map(|(peer, err)| {
                tracing::debug!(peer = %peer, error = %err, "Expiring peer");
                self.peers.remove(&peer);
                CollectorAction::Closed { peer, reason: err.to_string() }
            })
            .collect()
    }
}

fn established(peer: &mut Peer, state: HandshakeState) -> Result<&mut Session> {
    peer.session.as_mut().ok_or(LinkError::InvalidState { state, operation: "use session" })
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .field("pending_handshakes", &self.pending_handshakes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, time::Duration};

    use bytes::Bytes;
    use nms_proto::{KeyOffer, NetTaskHeader, payloads::AlertConditions};

    use super::*;
    use crate::{env::SystemEnv, handshake::Initiator};

    fn agent_addr(last: u8) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(10, 0, 0, last), 40_000))
    }

    fn task(task_id: u32) -> TaskSpec {
        TaskSpec {
            task_id,
            frequency_secs: 60,
            device_metrics: vec![nms_proto::MetricKind::CpuUsage],
            link_probes: vec![],
            alert_conditions: AlertConditions::default(),
        }
    }

    fn collector(max_pending: usize) -> Collector {
        Collector::new(CollectorConfig {
            link: LinkConfig { max_pending_handshakes: max_pending, ..LinkConfig::default() },
            default_task: task(1),
            tasks: HashMap::new(),
        })
    }

    fn encode(sequence: u32, body: NetTaskBody) -> Bytes {
        NetTaskDatagram::new(NetTaskHeader { sequence, acknowledgement: 0 }, body).encode().unwrap()
    }

    fn offer() -> (Initiator, Bytes) {
        let mut initiator = Initiator::new(&SystemEnv, 3);
        let offer = initiator.offer().unwrap();
        (initiator, encode(1, NetTaskBody::RequestRegister(offer)))
    }

    fn reply(actions: &[CollectorAction]) -> &NetTaskDatagram {
        match &actions[0] {
            CollectorAction::Send { datagram, .. } => datagram,
            other => panic!("expected Send, got {:?}", other),
        }
    }

    /// Offer from `from` and answer the challenge. Returns the agent's link,
    /// its session and the confirmation, not yet delivered.
    fn answer_challenge(
        collector: &mut Collector,
        from: SocketAddr,
        now: Instant,
    ) -> (NetTaskLink, Session, NetTaskDatagram) {
        let mut initiator = Initiator::new(&SystemEnv, 3);
        let mut link = NetTaskLink::new();
        let offer = initiator.offer().unwrap();
        let offer = link.outbound(NetTaskBody::RequestRegister(offer)).unwrap();

        let actions =
            collector.handle_datagram(&SystemEnv, &offer.encode().unwrap(), from, now).unwrap();
        let challenge = reply(&actions).clone();
        link.commit(&challenge.header);
        let NetTaskBody::RegisterChallenge(body) = &challenge.body else {
            panic!("expected REGISTER_CHALLENGE");
        };

        let collector_addr = SocketAddr::from(([10, 0, 0, 1], 9000));
        let (response, session) = initiator.on_challenge(body, from, collector_addr).unwrap();
        let confirmation = link.outbound(NetTaskBody::RegisterChallenge2(response)).unwrap();
        (link, session, confirmation)
    }

    fn deliver(
        collector: &mut Collector,
        datagram: &NetTaskDatagram,
        from: SocketAddr,
        now: Instant,
    ) -> Result<Vec<CollectorAction>> {
        collector.handle_datagram(&SystemEnv, &datagram.encode().unwrap(), from, now)
    }

    #[test]
    fn offer_is_answered_with_bound_challenge() {
        let now = Instant::now();
        let mut collector = collector(8);
        let (_, bytes) = offer();

        let actions = collector.handle_datagram(&SystemEnv, &bytes, agent_addr(2), now).unwrap();
        let datagram = reply(&actions);

        assert_eq!(datagram.kind(), NetTaskKind::RegisterChallenge);
        assert_eq!(datagram.header, NetTaskHeader { sequence: 1, acknowledgement: 1 });
        assert_eq!(collector.peer_state(agent_addr(2)), Some(HandshakeState::KeySent));
        assert_eq!(collector.pending_handshakes(), 1);
    }

    #[test]
    fn repeated_offer_is_not_a_restart() {
        let now = Instant::now();
        let mut collector = collector(8);
        let (_, bytes) = offer();

        let first = collector.handle_datagram(&SystemEnv, &bytes, agent_addr(2), now).unwrap();
        let challenge = reply(&first).clone();

        let repeated = collector.handle_datagram(&SystemEnv, &bytes, agent_addr(2), now).unwrap();
        assert!(repeated.is_empty());

        // A fresh key from the same address does restart
        let (_, bytes) = offer();
        let second = collector.handle_datagram(&SystemEnv, &bytes, agent_addr(2), now).unwrap();
        assert_ne!(reply(&second).body, challenge.body);
        assert_eq!(collector.pending_handshakes(), 1);
    }

    #[test]
    fn half_open_handshakes_are_bounded() {
        let now = Instant::now();
        let mut collector = collector(2);

        for last in 1..=2 {
            let (_, bytes) = offer();
            collector.handle_datagram(&SystemEnv, &bytes, agent_addr(last), now).unwrap();
        }

        let (_, bytes) = offer();
        assert_eq!(
            collector.handle_datagram(&SystemEnv, &bytes, agent_addr(3), now),
            Err(LinkError::TooManyHandshakes { limit: 2 })
        );

        // A peer restarting its own handshake does not count twice
        let (_, bytes) = offer();
        assert!(collector.handle_datagram(&SystemEnv, &bytes, agent_addr(1), now).is_ok());
    }

    #[test]
    fn confirmation_from_wrong_address_is_rejected() {
        let now = Instant::now();
        let mut collector = collector(8);
        let (mut initiator, bytes) = offer();

        let actions = collector.handle_datagram(&SystemEnv, &bytes, agent_addr(2), now).unwrap();
        let NetTaskBody::RegisterChallenge(challenge) = &reply(&actions).body else {
            panic!("expected REGISTER_CHALLENGE");
        };
        // Agent confirms over an address the collector never challenged
        let collector_addr = SocketAddr::from(([10, 0, 0, 1], 9000));
        let (response, _) =
            initiator.on_challenge(challenge, agent_addr(9), collector_addr).unwrap();

        let actions = collector
            .handle_datagram(
                &SystemEnv,
                &encode(2, NetTaskBody::RegisterChallenge2(response)),
                agent_addr(2),
                now,
            )
            .unwrap();

        assert!(matches!(actions.as_slice(), [CollectorAction::Rejected { .. }]));
        assert_eq!(collector.peer_state(agent_addr(2)), None);
    }

    #[test]
    fn sealed_traffic_from_unknown_peer_is_refused() {
        let now = Instant::now();
        let mut collector = collector(8);
        let body = NetTaskBody::RegisterChallenge2(nms_proto::ChallengeResponse {
            challenge: Bytes::from_static(&[0u8; 32]),
        });

        assert_eq!(
            collector.handle_datagram(&SystemEnv, &encode(2, body), agent_addr(4), now),
            Err(LinkError::UnknownPeer(agent_addr(4)))
        );
    }

    #[test]
    fn stale_handshakes_expire() {
        let now = Instant::now();
        let mut collector = collector(8);
        let (_, bytes) = offer();
        collector.handle_datagram(&SystemEnv, &bytes, agent_addr(2), now).unwrap();

        assert!(collector.tick(now + Duration::from_secs(30)).is_empty());
        let actions = collector.tick(now + Duration::from_secs(31));

        assert!(matches!(
            actions.as_slice(),
            [CollectorAction::Closed { peer, .. }] if *peer == agent_addr(2)
        ));
        assert_eq!(collector.pending_handshakes(), 0);
    }

    #[test]
    fn metrics_need_an_established_peer() {
        let now = Instant::now();
        let mut collector = collector(8);
        let request = MetricsRequest { task_id: 1 };

        assert_eq!(
            collector.request_metrics(&SystemEnv, agent_addr(2), &request),
            Err(LinkError::UnknownPeer(agent_addr(2)))
        );

        let (_, bytes) = offer();
        collector.handle_datagram(&SystemEnv, &bytes, agent_addr(2), now).unwrap();
        assert!(matches!(
            collector.request_metrics(&SystemEnv, agent_addr(2), &request),
            Err(LinkError::InvalidState { state: HandshakeState::KeySent, .. })
        ));
    }

    #[test]
    fn malformed_offer_is_not_kept() {
        let now = Instant::now();
        let mut collector = collector(8);
        let offer = KeyOffer { public_key: Bytes::from_static(&[1u8; 7]) };
        let bytes = encode(1, NetTaskBody::RequestRegister(offer));

        assert!(matches!(
            collector.handle_datagram(&SystemEnv, &bytes, agent_addr(2), now),
            Err(LinkError::Handshake(_))
        ));
        assert_eq!(collector.peer_state(agent_addr(2)), None);
    }

    #[test]
    fn task_request_ahead_of_confirmation_is_answered_once_registered() {
        let now = Instant::now();
        let mut collector = collector(8);
        let (mut link, session, confirmation) =
            answer_challenge(&mut collector, agent_addr(2), now);
        let request = link
            .outbound_sealed(&session, &SystemEnv, NetTaskKind::RequestTask, &TaskRequest {
                agent_id: 5,
            })
            .unwrap();

        assert!(deliver(&mut collector, &request, agent_addr(2), now).unwrap().is_empty());
        assert_eq!(collector.peer_state(agent_addr(2)), Some(HandshakeState::KeySent));

        let actions = deliver(&mut collector, &confirmation, agent_addr(2), now).unwrap();
        assert!(
            matches!(
                actions.as_slice(),
                [
                    CollectorAction::Registered { .. },
                    CollectorAction::Send { datagram, .. },
                    CollectorAction::TaskAssigned { agent_id: 5, task_id: 1, .. },
                ] if datagram.kind() == NetTaskKind::ResponseTask
            ),
            "{actions:?}"
        );
        assert_eq!(collector.agent_id(agent_addr(2)), Some(5));
        assert_eq!(collector.link(agent_addr(2)).unwrap().acknowledgement(), 3);

        // The held datagram was consumed
        assert!(deliver(&mut collector, &request, agent_addr(2), now).unwrap().is_empty());
    }

    #[test]
    fn metrics_under_a_rewritten_header_are_refused() {
        let now = Instant::now();
        let mut collector = collector(8);
        let (mut link, session, confirmation) =
            answer_challenge(&mut collector, agent_addr(2), now);
        deliver(&mut collector, &confirmation, agent_addr(2), now).unwrap();

        let report = MetricsReport { task_id: 1, timestamp_ms: 10, samples: vec![] };
        let genuine = link
            .outbound_sealed(&session, &SystemEnv, NetTaskKind::ResponseMetrics, &report)
            .unwrap();
        let actions = deliver(&mut collector, &genuine, agent_addr(2), now).unwrap();
        assert!(matches!(actions.as_slice(), [CollectorAction::MetricsReceived { .. }]));
        assert_eq!(collector.link(agent_addr(2)).unwrap().acknowledgement(), 3);

        // Same body replayed under a new sequence number, and pushed far ahead
        for sequence in [4, 1_000_000] {
            let mut forged = genuine.clone();
            forged.header.sequence = sequence;
            assert!(matches!(
                deliver(&mut collector, &forged, agent_addr(2), now),
                Err(LinkError::Crypto(_))
            ));
            assert_eq!(collector.link(agent_addr(2)).unwrap().acknowledgement(), 3);
        }

        let next = link
            .outbound_sealed(&session, &SystemEnv, NetTaskKind::ResponseMetrics, &report)
            .unwrap();
        assert_eq!(next.header.sequence, 4);
        let actions = deliver(&mut collector, &next, agent_addr(2), now).unwrap();
        assert!(matches!(actions.as_slice(), [CollectorAction::MetricsReceived { .. }]));
        assert_eq!(collector.link(agent_addr(2)).unwrap().acknowledgement(), 4);
    }

    #[test]
    fn forged_acknowledgement_does_not_reach_the_send_side() {
        let now = Instant::now();
        let mut collector = collector(8);
        let (mut link, session, confirmation) =
            answer_challenge(&mut collector, agent_addr(2), now);
        deliver(&mut collector, &confirmation, agent_addr(2), now).unwrap();
        let request = MetricsRequest { task_id: 1 };
        collector.request_metrics(&SystemEnv, agent_addr(2), &request).unwrap();
        let unacked = collector.link(agent_addr(2)).unwrap().unacked();

        let report = MetricsReport { task_id: 1, timestamp_ms: 10, samples: vec![] };
        let mut forged = link
            .outbound_sealed(&session, &SystemEnv, NetTaskKind::ResponseMetrics, &report)
            .unwrap();
        forged.header.acknowledgement = 2;

        assert!(deliver(&mut collector, &forged, agent_addr(2), now).is_err());
        assert_eq!(collector.link(agent_addr(2)).unwrap().unacked(), unacked);
    }
}
