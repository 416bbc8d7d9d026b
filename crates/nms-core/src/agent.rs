//! Agent side of NetTask: registration, task pickup and metric reporting.
//!
//! # Architecture: Action-Based State Machine
//!
//! - Methods take the current time and an [`Environment`] for randomness
//! - Methods return `Vec<AgentAction>` for the driver to execute
//! - Nothing here touches a socket
//!
//! # Lifecycle
//!
//! ```text
//! register ──> REQUEST_REGISTER
//!              REGISTER_CHALLENGE ──> REGISTER_CHALLENGE2 + REQUEST_TASK
//!              RESPONSE_TASK ──> Established, TaskAssigned
//!              REQUEST_METRICS ──> MetricsRequested
//! send_metrics ──> RESPONSE_METRICS
//! ```
//!
//! A handshake that does not finish within `handshake_timeout`, an
//! established link with no inbound traffic for `idle_timeout`, a
//! desynchronized session or an exhausted sequence space all reset the agent
//! to `Init` and emit [`AgentAction::Close`]; the driver re-registers.

use std::{net::SocketAddr, time::Instant};

use nms_proto::{
    Datagram, NetTaskBody, NetTaskDatagram, NetTaskKind,
    payloads::{MetricsReport, MetricsRequest, TaskRequest, TaskSpec},
};

use crate::{
    channel::{NetTaskLink, open_body},
    config::LinkConfig,
    env::Environment,
    error::{LinkError, Result},
    handshake::{HandshakeState, Initiator},
    session::Session,
};

/// Actions returned by the agent state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentAction {
    /// Send this datagram to the collector
    Send(NetTaskDatagram),

    /// Collector assigned (or re-assigned) a task
    TaskAssigned(TaskSpec),

    /// Collector wants the samples of a task
    MetricsRequested(MetricsRequest),

    /// Session is gone; the driver should register again
    Close {
        /// Reason for closing the session
        reason: String,
    },
}

/// Identity of an agent and where it talks to.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identifier the agent was provisioned with
    pub agent_id: u32,
    /// Collector address
    pub collector: SocketAddr,
    /// This agent's address as the collector sees it; the challenge
    /// confirmation is bound to it
    pub local_addr: SocketAddr,
    /// Timeouts and limits
    pub link: LinkConfig,
}

/// Agent state machine.
#[derive(Debug)]
pub struct Agent {
    config: AgentConfig,
    initiator: Option<Initiator>,
    session: Option<Session>,
    link: NetTaskLink,
    task: Option<TaskSpec>,
    handshake_started: Instant,
    last_inbound: Instant,
}

impl Agent {
    /// Create an agent in `Init`
    pub fn new(config: AgentConfig, now: Instant) -> Self {
        Self {
            config,
            initiator: None,
            session: None,
            link: NetTaskLink::new(),
            task: None,
            handshake_started: now,
            last_inbound: now,
        }
    }

    /// Handshake state; `Init` before [`Agent::register`]
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.initiator.as_ref().map_or(HandshakeState::Init, Initiator::state)
    }

    /// Provisioned agent identifier
    #[must_use]
    pub fn agent_id(&self) -> u32 {
        self.config.agent_id
    }

    /// Task most recently assigned by the collector
    #[must_use]
    pub fn task(&self) -> Option<&TaskSpec> {
        self.task.as_ref()
    }

    /// Current session, once the challenge has been answered
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Sequence state towards the collector
    #[must_use]
    pub fn link(&self) -> &NetTaskLink {
        &self.link
    }

    /// Start (or restart after a failure) the registration handshake.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidState`] while a handshake is in flight or
    /// a session is established.
    pub fn register<E: Environment>(&mut self, env: &E, now: Instant) -> Result<Vec<AgentAction>> {
        let state = self.state();
        if !matches!(state, HandshakeState::Init | HandshakeState::Failed) {
            return Err(LinkError::InvalidState { state, operation: "register" });
        }

        self.reset();
        let mut initiator = Initiator::new(env, self.config.link.max_decrypt_failures);
        let offer = initiator.offer()?;
        self.initiator = Some(initiator);
        self.handshake_started = now;
        self.last_inbound = now;

        tracing::debug!(
            agent_id = self.config.agent_id,
            collector = %self.config.collector,
            "Sending registration request"
        );

        let datagram = self.link.outbound(NetTaskBody::RequestRegister(offer))?;
        Ok(vec![AgentAction::Send(datagram)])
    }

    /// Process one datagram received from `from`.
    ///
    /// Duplicate and stale sequence numbers are dropped without actions.
    ///
    /// # Errors
    ///
    /// - [`LinkError::Protocol`] for an undecodable datagram
    /// - [`LinkError::UnknownPeer`] if `from` is not the collector
    /// - [`LinkError::Handshake`] if the challenge cannot be answered; the
    ///   agent is then `Failed` and may register again
    /// - [`LinkError::Crypto`] or [`LinkError::InvalidPayload`] for a sealed
    ///   body that does not open
    /// - [`LinkError::UnexpectedDatagram`] for a kind the agent never
    ///   receives or that does not fit the current state
    pub fn handle_datagram<E: Environment>(
        &mut self,
        env: &E,
        bytes: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<Vec<AgentAction>> {
        let datagram = NetTaskDatagram::decode(bytes)?;

        if from != self.config.collector {
            tracing::warn!(agent_id = self.config.agent_id, from = %from, "Datagram from unknown peer");
            return Err(LinkError::UnknownPeer(from));
        }

        let result = self.handle_inner(env, datagram, now);
        self.close_if_fatal(result)
    }

    fn handle_inner<E: Environment>(
        &mut self,
        env: &E,
        datagram: NetTaskDatagram,
        now: Instant,
    ) -> Result<Vec<AgentAction>> {
        let delivery = self.link.classify(&datagram.header);
        if !delivery.is_fresh() {
            tracing::trace!(
                agent_id = self.config.agent_id,
                sequence = datagram.header.sequence,
                ?delivery,
                "Dropping repeated datagram"
            );
            return Ok(Vec::new());
        }

        let state = self.state();
        match (&datagram.body, state) {
            (NetTaskBody::RegisterChallenge(challenge), HandshakeState::KeySent) => {
                let initiator = self
                    .initiator
                    .as_mut()
                    .ok_or(LinkError::InvalidState { state, operation: "answer challenge" })?;
                let (response, session) = initiator.on_challenge(
                    challenge,
                    self.config.local_addr,
                    self.config.collector,
                )?;
                self.link.commit(&datagram.header);
                self.last_inbound = now;

                let confirmation = self.link.outbound(NetTaskBody::RegisterChallenge2(response))?;
                let request = TaskRequest { agent_id: self.config.agent_id };
                let task_request =
                    self.link.outbound_sealed(&session, env, NetTaskKind::RequestTask, &request)?;
                self.session = Some(session);

                tracing::debug!(agent_id = self.config.agent_id, "Answered registration challenge");

                Ok(vec![AgentAction::Send(confirmation), AgentAction::Send(task_request)])
            },
            (NetTaskBody::ResponseTask(_), HandshakeState::ChallengeResponded)
            | (NetTaskBody::ResponseTask(_), HandshakeState::Established) => {
                let spec: TaskSpec = self.open(&datagram, "task spec")?;
                self.authenticated(now)?;

                tracing::debug!(
                    agent_id = self.config.agent_id,
                    task_id = spec.task_id,
                    frequency_secs = spec.frequency_secs,
                    "Task assigned"
                );

                self.task = Some(spec.clone());
                Ok(vec![AgentAction::TaskAssigned(spec)])
            },
            (NetTaskBody::RequestMetrics(_), HandshakeState::ChallengeResponded)
            | (NetTaskBody::RequestMetrics(_), HandshakeState::Established) => {
                let request: MetricsRequest = self.open(&datagram, "metrics request")?;
                self.authenticated(now)?;
                Ok(vec![AgentAction::MetricsRequested(request)])
            },
            (body, state) => {
                tracing::warn!(
                    agent_id = self.config.agent_id,
                    kind = ?body.kind(),
                    ?state,
                    "Unexpected datagram"
                );
                Err(LinkError::UnexpectedDatagram {
                    state,
                    family: NetTaskDatagram::FAMILY,
                    tag: body.kind().to_u32(),
                })
            },
        }
    }

    /// Open a sealed datagram and commit its header to the link.
    fn open<T: serde::de::DeserializeOwned>(
        &mut self,
        datagram: &NetTaskDatagram,
        expected: &'static str,
    ) -> Result<T> {
        let state = self.state();
        let session = self
            .session
            .as_mut()
            .ok_or(LinkError::InvalidState { state, operation: "open sealed payload" })?;
        let payload = open_body(session, datagram, expected)?;
        self.link.commit(&datagram.header);
        Ok(payload)
    }

    fn authenticated(&mut self, now: Instant) -> Result<()> {
        self.last_inbound = now;
        if let Some(initiator) = self.initiator.as_mut() {
            if initiator.state() == HandshakeState::ChallengeResponded {
                tracing::debug!(agent_id = self.config.agent_id, "Registration established");
            }
            initiator.mark_established()?;
        }
        Ok(())
    }

    /// Seal a metrics report as RESPONSE_METRICS.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidState`] before the challenge has been
    /// answered.
    pub fn send_metrics<E: Environment>(
        &mut self,
        env: &E,
        report: &MetricsReport,
    ) -> Result<Vec<AgentAction>> {
        let state = self.state();
        let session = self
            .session
            .as_ref()
            .ok_or(LinkError::InvalidState { state, operation: "send metrics" })?;

        let result = self
            .link
            .outbound_sealed(session, env, NetTaskKind::ResponseMetrics, report)
            .map(|datagram| vec![AgentAction::Send(datagram)]);
        self.close_if_fatal(result)
    }

    /// Check timeouts.
    ///
    /// Returns [`AgentAction::Close`] and resets to `Init` when the handshake
    /// or the idle timer has run out.
    pub fn tick(&mut self, now: Instant) -> Vec<AgentAction> {
        let timeout = match self.state() {
            HandshakeState::KeySent | HandshakeState::ChallengeResponded => {
                let elapsed = now.duration_since(self.handshake_started);
                (elapsed > self.config.link.handshake_timeout)
                    .then_some(LinkError::HandshakeTimeout { elapsed })
            },
            HandshakeState::Established => {
                let elapsed = now.duration_since(self.last_inbound);
                (elapsed > self.config.link.idle_timeout)
                    .then_some(LinkError::IdleTimeout { elapsed })
            },
            HandshakeState::Init | HandshakeState::Failed => None,
        };

        match timeout {
            Some(err) => {
                tracing::debug!(agent_id = self.config.agent_id, error = %err, "Closing session");
                self.reset();
                vec![AgentAction::Close { reason: err.to_string() }]
            },
            None => Vec::new(),
        }
    }

    fn close_if_fatal(&mut self, result: Result<Vec<AgentAction>>) -> Result<Vec<AgentAction>> {
        match result {
            Err(err) if err.is_session_fatal() => {
                tracing::warn!(agent_id = self.config.agent_id, error = %err, "Discarding session");
                self.reset();
                Ok(vec![AgentAction::Close { reason: err.to_string() }])
            },
            other => other,
        }
    }

    fn reset(&mut self) {
        self.initiator = None;
        self.session = None;
        self.link = NetTaskLink::new();
        self.task = None;
    }
}
