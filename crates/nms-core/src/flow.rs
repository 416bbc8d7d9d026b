//! Netflow peer: the HELLO_THERE / GENERAL_KENOBI / THE_NEGOTIATOR exchange
//! followed by sealed text messages.
//!
//! One [`FlowPeer`] talks to exactly one remote address, in either role.
//!
//! ```text
//! initiator                          responder
//!   connect ──── HELLO_THERE ────────>
//!           <─── GENERAL_KENOBI ─────
//!           ──── THE_NEGOTIATOR ────> Established
//!           <─── MESSAGE ──────────── send_message
//! Established
//! ```
//!
//! KYS tears the peer down from either side at any point. It carries no
//! authentication, so it only ever discards state and never creates any.
//!
//! A handshake step that fails puts the peer back in `Init` with fresh key
//! material: a responder waits for a new HELLO_THERE, an initiator may
//! [`connect`](FlowPeer::connect) again.

use std::{net::SocketAddr, time::Instant};

use nms_proto::{Datagram, NetflowDatagram};

use crate::{
    channel::{open_message, seal_message},
    config::LinkConfig,
    env::Environment,
    error::{LinkError, Result},
    handshake::{HandshakeState, Initiator, Responder},
    session::Session,
};

/// Actions returned by the Netflow peer state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowAction {
    /// Send this datagram to the peer
    Send(NetflowDatagram),

    /// Handshake completed on this side
    Established,

    /// Peer sent a text message
    Message(String),

    /// Peer state was discarded
    Close {
        /// Reason for closing
        reason: String,
    },
}

/// Which half of the handshake this side runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowRole {
    /// Says hello first
    Initiator,
    /// Answers hello
    Responder,
}

#[derive(Debug)]
enum Role {
    Initiator(Initiator),
    Responder(Responder),
}

/// Netflow peer state machine.
#[derive(Debug)]
pub struct FlowPeer {
    role: Role,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    config: LinkConfig,
    session: Option<Session>,
    closed: bool,
    started: Instant,
    last_inbound: Instant,
}

impl FlowPeer {
    /// Peer that will send HELLO_THERE to `peer_addr`.
    ///
    /// `local_addr` is this side's address as the peer sees it.
    pub fn initiator<E: Environment>(
        env: &E,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        config: LinkConfig,
        now: Instant,
    ) -> Self {
        let role = Role::Initiator(Initiator::new(env, config.max_decrypt_failures));
        Self::with_role(role, local_addr, peer_addr, config, now)
    }

    /// Peer that waits for HELLO_THERE from `peer_addr`.
    pub fn responder<E: Environment>(
        env: &E,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        config: LinkConfig,
        now: Instant,
    ) -> Self {
        let role = Role::Responder(Responder::new(env, config.max_decrypt_failures));
        Self::with_role(role, local_addr, peer_addr, config, now)
    }

    fn with_role(
        role: Role,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        config: LinkConfig,
        now: Instant,
    ) -> Self {
        Self {
            role,
            local_addr,
            peer_addr,
            config,
            session: None,
            closed: false,
            started: now,
            last_inbound: now,
        }
    }

    /// Role this side plays
    #[must_use]
    pub fn role(&self) -> FlowRole {
        match self.role {
            Role::Initiator(_) => FlowRole::Initiator,
            Role::Responder(_) => FlowRole::Responder,
        }
    }

    /// Handshake state
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        match &self.role {
            Role::Initiator(initiator) => initiator.state(),
            Role::Responder(responder) => responder.state(),
        }
    }

    /// Remote address
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// True after KYS, a timeout or a desynchronized session
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current session, if keys have been agreed
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Initiator: send HELLO_THERE.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidState`] on a responder, after close, or
    /// once the hello was sent.
    pub fn connect(&mut self, now: Instant) -> Result<Vec<FlowAction>> {
        let state = self.state();
        let initiator = match (&mut self.role, self.closed) {
            (Role::Initiator(initiator), false) => initiator,
            _ => return Err(LinkError::InvalidState { state, operation: "say hello" }),
        };

        let offer = initiator.offer()?;
        self.started = now;
        self.last_inbound = now;

        tracing::debug!(peer = %self.peer_addr, "Sending hello");
        Ok(vec![FlowAction::Send(NetflowDatagram::HelloThere(offer))])
    }

    /// Process one datagram received from `from`.
    ///
    /// # Errors
    ///
    /// - [`LinkError::Protocol`] for an undecodable datagram
    /// - [`LinkError::UnknownPeer`] if `from` is not the peer
    /// - [`LinkError::Handshake`] for a failed key exchange step; the peer
    ///   is back in `Init`
    /// - [`LinkError::Crypto`] or [`LinkError::InvalidPayload`] for a message
    ///   that does not open
    /// - [`LinkError::UnexpectedDatagram`] for a kind that does not fit the
    ///   role and state
    pub fn handle_datagram<E: Environment>(
        &mut self,
        env: &E,
        bytes: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<Vec<FlowAction>> {
        let datagram = NetflowDatagram::decode(bytes)?;

        if from != self.peer_addr {
            tracing::warn!(peer = %self.peer_addr, from = %from, "Datagram from unknown peer");
            return Err(LinkError::UnknownPeer(from));
        }

        if matches!(datagram, NetflowDatagram::Kys) {
            tracing::debug!(peer = %from, state = ?self.state(), "Peer tore down the session");
            self.close();
            return Ok(vec![FlowAction::Close { reason: "peer sent KYS".to_string() }]);
        }

        let state = self.state();
        if self.closed {
            return Err(LinkError::InvalidState { state, operation: "receive after close" });
        }

        let result = self.handle_inner(env, datagram, now);
        match result {
            Err(err) if err.is_session_fatal() => {
                tracing::warn!(peer = %self.peer_addr, error = %err, "Discarding session");
                self.close();
                Ok(vec![FlowAction::Close { reason: err.to_string() }])
            },
            Err(err) if self.state() == HandshakeState::Failed => {
                tracing::debug!(peer = %self.peer_addr, error = %err, "Restarting handshake");
                self.restart(env, now);
                Err(err)
            },
            other => other,
        }
    }

    /// Back to `Init` in the same role with a fresh key pair.
    fn restart<E: Environment>(&mut self, env: &E, now: Instant) {
        let max_failures = self.config.max_decrypt_failures;
        self.role = match self.role {
            Role::Initiator(_) => Role::Initiator(Initiator::new(env, max_failures)),
            Role::Responder(_) => Role::Responder(Responder::new(env, max_failures)),
        };
        self.session = None;
        self.started = now;
        self.last_inbound = now;
    }

    fn handle_inner<E: Environment>(
        &mut self,
        env: &E,
        datagram: NetflowDatagram,
        now: Instant,
    ) -> Result<Vec<FlowAction>> {
        let state = self.state();
        match (&mut self.role, datagram) {
            (Role::Responder(responder), NetflowDatagram::HelloThere(offer)) => {
                let challenge = responder.on_offer(env, &offer, self.peer_addr)?;
                self.started = now;
                self.last_inbound = now;
                tracing::debug!(peer = %self.peer_addr, "Answering hello");
                Ok(vec![FlowAction::Send(NetflowDatagram::GeneralKenobi(challenge))])
            },
            (Role::Initiator(initiator), NetflowDatagram::GeneralKenobi(challenge)) => {
                let (response, session) =
                    initiator.on_challenge(&challenge, self.local_addr, self.peer_addr)?;
                self.session = Some(session);
                self.last_inbound = now;
                tracing::debug!(peer = %self.peer_addr, "Answered challenge");
                Ok(vec![FlowAction::Send(NetflowDatagram::TheNegotiator(response))])
            },
            (Role::Responder(responder), NetflowDatagram::TheNegotiator(response)) => {
                let peer = self.peer_addr;
                let session = responder.on_response(&response, peer).map_err(|err| {
                    tracing::warn!(peer = %peer, error = %err, "Challenge confirmation failed");
                    err
                })?;
                self.session = Some(session);
                self.last_inbound = now;
                tracing::debug!(peer = %self.peer_addr, "Session established");
                Ok(vec![FlowAction::Established])
            },
            (role, NetflowDatagram::Message(sealed)) => {
                let session = self
                    .session
                    .as_mut()
                    .ok_or(LinkError::InvalidState { state, operation: "open message" })?;
                let text = open_message(session, &sealed)?;
                self.last_inbound = now;

                let mut actions = Vec::with_capacity(2);
                if let Role::Initiator(initiator) = role {
                    if initiator.state() == HandshakeState::ChallengeResponded {
                        initiator.mark_established()?;
                        tracing::debug!(peer = %self.peer_addr, "Session established");
                        actions.push(FlowAction::Established);
                    }
                }
                actions.push(FlowAction::Message(text));
                Ok(actions)
            },
            (_, datagram) => {
                tracing::warn!(
                    peer = %self.peer_addr,
                    kind = ?datagram.kind(),
                    ?state,
                    "Unexpected datagram"
                );
                Err(LinkError::UnexpectedDatagram {
                    state,
                    family: NetflowDatagram::FAMILY,
                    tag: datagram.kind().to_u32(),
                })
            },
        }
    }

    /// Seal `text` as a MESSAGE.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidState`] before keys are agreed or after
    /// close.
    pub fn send_message<E: Environment>(
        &mut self,
        env: &E,
        text: &str,
    ) -> Result<Vec<FlowAction>> {
        let state = self.state();
        let session = match (&self.session, self.closed) {
            (Some(session), false) => session,
            _ => return Err(LinkError::InvalidState { state, operation: "send message" }),
        };
        Ok(vec![FlowAction::Send(seal_message(session, env, text)?)])
    }

    /// Send KYS and discard all state.
    pub fn teardown(&mut self) -> Vec<FlowAction> {
        tracing::debug!(peer = %self.peer_addr, "Tearing down session");
        self.close();
        vec![
            FlowAction::Send(NetflowDatagram::Kys),
            FlowAction::Close { reason: "local teardown".to_string() },
        ]
    }

    /// Check handshake and idle timeouts.
    pub fn tick(&mut self, now: Instant) -> Vec<FlowAction> {
        if self.closed {
            return Vec::new();
        }

        let timeout = match self.state() {
            HandshakeState::KeySent | HandshakeState::ChallengeResponded => {
                let elapsed = now.duration_since(self.started);
                (elapsed > self.config.handshake_timeout)
                    .then_some(LinkError::HandshakeTimeout { elapsed })
            },
            HandshakeState::Established => {
                let elapsed = now.duration_since(self.last_inbound);
                (elapsed > self.config.idle_timeout).then_some(LinkError::IdleTimeout { elapsed })
            },
            HandshakeState::Init | HandshakeState::Failed => None,
        };

        match timeout {
            Some(err) => {
                tracing::debug!(peer = %self.peer_addr, error = %err, "Closing session");
                self.close();
                vec![FlowAction::Close { reason: err.to_string() }]
            },
            None => Vec::new(),
        }
    }

    fn close(&mut self) {
        self.session = None;
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, time::Duration};

    use super::*;
    use crate::{env::SystemEnv, error::HandshakeError};

    fn alice() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(10, 1, 0, 1), 5000))
    }

    fn bob() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(10, 1, 0, 2), 5000))
    }

    fn pair(now: Instant) -> (FlowPeer, FlowPeer) {
        (
            FlowPeer::initiator(&SystemEnv, alice(), bob(), LinkConfig::default(), now),
            FlowPeer::responder(&SystemEnv, bob(), alice(), LinkConfig::default(), now),
        )
    }

    /// Deliver every `Send` in `actions` to `to`, returning its actions
    fn deliver(
        actions: Vec<FlowAction>,
        to: &mut FlowPeer,
        from: SocketAddr,
        now: Instant,
    ) -> Vec<FlowAction> {
        let mut out = Vec::new();
        for action in actions {
            if let FlowAction::Send(datagram) = action {
                let bytes = datagram.encode().unwrap();
                out.extend(to.handle_datagram(&SystemEnv, &bytes, from, now).unwrap());
            }
        }
        out
    }

    #[test]
    fn full_exchange_then_messages() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);

        let hello = a.connect(now).unwrap();
        let kenobi = deliver(hello, &mut b, alice(), now);
        let negotiator = deliver(kenobi, &mut a, bob(), now);
        assert_eq!(a.state(), HandshakeState::ChallengeResponded);

        let established = deliver(negotiator, &mut b, alice(), now);
        assert_eq!(established, vec![FlowAction::Established]);
        assert_eq!(b.state(), HandshakeState::Established);

        let message = b.send_message(&SystemEnv, "hello there").unwrap();
        let received = deliver(message, &mut a, bob(), now);
        assert_eq!(
            received,
            vec![FlowAction::Established, FlowAction::Message("hello there".to_string())]
        );
        assert_eq!(a.state(), HandshakeState::Established);
        assert_eq!(a.session().unwrap().secret(), b.session().unwrap().secret());

        let reply = a.send_message(&SystemEnv, "general kenobi").unwrap();
        assert_eq!(
            deliver(reply, &mut b, alice(), now),
            vec![FlowAction::Message("general kenobi".to_string())]
        );
    }

    #[test]
    fn kys_discards_session_at_any_state() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);

        let hello = a.connect(now).unwrap();
        deliver(hello, &mut b, alice(), now);

        let kys = NetflowDatagram::Kys.encode().unwrap();
        let actions = b.handle_datagram(&SystemEnv, &kys, alice(), now).unwrap();
        assert!(matches!(actions.as_slice(), [FlowAction::Close { .. }]));
        assert!(b.is_closed());
        assert!(b.session().is_none());
        assert!(matches!(
            b.send_message(&SystemEnv, "too late"),
            Err(LinkError::InvalidState { .. })
        ));
    }

    #[test]
    fn teardown_emits_kys() {
        let now = Instant::now();
        let (mut a, _) = pair(now);
        a.connect(now).unwrap();

        let actions = a.teardown();
        assert_eq!(actions[0], FlowAction::Send(NetflowDatagram::Kys));
        assert!(a.is_closed());
    }

    #[test]
    fn responder_cannot_say_hello() {
        let now = Instant::now();
        let (_, mut b) = pair(now);
        assert!(matches!(b.connect(now), Err(LinkError::InvalidState { .. })));
    }

    #[test]
    fn hello_to_initiator_is_unexpected() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        let hello = a.connect(now).unwrap();

        // Reflect the hello back at its sender
        let FlowAction::Send(datagram) = &hello[0] else { panic!("expected send") };
        let bytes = datagram.encode().unwrap();
        assert!(matches!(
            a.handle_datagram(&SystemEnv, &bytes, bob(), now),
            Err(LinkError::UnexpectedDatagram { tag: 1, .. })
        ));
        assert!(b.handle_datagram(&SystemEnv, &bytes, alice(), now).is_ok());
    }

    #[test]
    fn handshake_times_out() {
        let now = Instant::now();
        let (mut a, _) = pair(now);
        a.connect(now).unwrap();

        assert!(a.tick(now + Duration::from_secs(10)).is_empty());
        let actions = a.tick(now + Duration::from_secs(31));
        assert!(matches!(actions.as_slice(), [FlowAction::Close { .. }]));
        assert!(a.is_closed());
    }

    #[test]
    fn responder_accepts_a_new_hello_after_a_failed_confirmation() {
        let now = Instant::now();
        let (_, mut b) = pair(now);

        // Confirms over the wrong local address, so the challenge does not verify
        let mut confused =
            FlowPeer::initiator(&SystemEnv, bob(), bob(), LinkConfig::default(), now);
        let hello = confused.connect(now).unwrap();
        let kenobi = deliver(hello, &mut b, alice(), now);
        let negotiator = deliver(kenobi, &mut confused, bob(), now);
        let FlowAction::Send(datagram) = &negotiator[0] else { panic!("expected send") };

        let result = b.handle_datagram(&SystemEnv, &datagram.encode().unwrap(), alice(), now);
        assert!(
            matches!(result, Err(LinkError::Handshake(HandshakeError::ConfirmationFailed))),
            "{result:?}"
        );
        assert_eq!(b.state(), HandshakeState::Init);
        assert!(!b.is_closed());
        assert!(b.session().is_none());

        let (mut a, _) = pair(now);
        let hello = a.connect(now).unwrap();
        let kenobi = deliver(hello, &mut b, alice(), now);
        let negotiator = deliver(kenobi, &mut a, bob(), now);
        assert_eq!(deliver(negotiator, &mut b, alice(), now), vec![FlowAction::Established]);
        assert_eq!(a.session().unwrap().secret(), b.session().unwrap().secret());
    }

    #[test]
    fn initiator_can_reconnect_after_a_bad_challenge() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        a.connect(now).unwrap();

        let bogus = NetflowDatagram::GeneralKenobi(nms_proto::KeyChallenge {
            public_key: bytes::Bytes::from_static(&[7u8; 5]),
            challenge: bytes::Bytes::from_static(&[0u8; 32]),
            salt: bytes::Bytes::from_static(&[0u8; 16]),
        });
        assert!(matches!(
            a.handle_datagram(&SystemEnv, &bogus.encode().unwrap(), bob(), now),
            Err(LinkError::Handshake(_))
        ));
        assert_eq!(a.state(), HandshakeState::Init);

        let hello = a.connect(now).unwrap();
        let kenobi = deliver(hello, &mut b, alice(), now);
        let negotiator = deliver(kenobi, &mut a, bob(), now);
        assert_eq!(deliver(negotiator, &mut b, alice(), now), vec![FlowAction::Established]);
    }

    #[test]
    fn stray_hello_does_not_disturb_an_established_responder() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        let hello = a.connect(now).unwrap();
        let FlowAction::Send(first_hello) = hello[0].clone() else { panic!("expected send") };
        let kenobi = deliver(hello, &mut b, alice(), now);
        let negotiator = deliver(kenobi, &mut a, bob(), now);
        deliver(negotiator, &mut b, alice(), now);

        assert!(matches!(
            b.handle_datagram(&SystemEnv, &first_hello.encode().unwrap(), alice(), now),
            Err(LinkError::Handshake(HandshakeError::InvalidState { .. }))
        ));
        assert_eq!(b.state(), HandshakeState::Established);
        assert!(b.session().is_some());
    }
}
