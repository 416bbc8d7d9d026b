//! Async drivers that run endpoints over a transport.
//!
//! The state machines in nms-core return actions and never block. A driver
//! owns one endpoint and one transport, feeds it inbound datagrams and
//! periodic ticks, and executes what comes back: datagrams go on the wire,
//! events land in a summary the caller inspects once the run is over.
//!
//! Drivers take any [`Environment`] and any transport, so the same loop runs
//! against turmoil in tests and against tokio sockets in a deployment.

use std::{
    collections::{BTreeMap, VecDeque},
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use nms_core::{
    Agent, AgentAction, AgentConfig, AlertAction, AlertDesk, Collector, CollectorAction,
    CollectorConfig, HandshakeState, LinkError,
    alert::{encode_alert, raise_alert},
    env::Environment,
    transport::{DatagramTransport, StreamTransport},
};
use nms_proto::{
    Datagram,
    payloads::{AlertNotice, MetricSample, MetricsReport, MetricsRequest, TaskSpec},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};

/// Pacing shared by every driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// How often endpoints are ticked for timeouts
    pub tick_interval: Duration,
    /// How often a collector asks each registered agent for metrics
    pub poll_interval: Duration,
    /// Receive buffer size
    pub max_datagram: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            poll_interval: Duration::from_secs(5),
            max_datagram: 64 * 1024,
        }
    }
}

/// Source of readings for an assigned task.
pub trait Sampler: Send {
    /// Take one reading of every metric `task` names.
    fn sample(&mut self, task: &TaskSpec) -> Vec<MetricSample>;
}

/// Reports the same value for every metric.
#[derive(Debug, Clone, Copy)]
pub struct ConstantSampler(pub u64);

impl Sampler for ConstantSampler {
    fn sample(&mut self, task: &TaskSpec) -> Vec<MetricSample> {
        let device = task
            .device_metrics
            .iter()
            .map(|&metric| MetricSample { metric, value: self.0, target: None });
        let links = task.link_probes.iter().map(|probe| MetricSample {
            metric: probe.metric,
            value: self.0,
            target: Some(probe.target.clone()),
        });
        device.chain(links).collect()
    }
}

/// What an agent did during a run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentSummary {
    /// Handshake state when the run ended
    pub state: Option<HandshakeState>,
    /// Task held when the run ended
    pub task: Option<TaskSpec>,
    /// Registrations started, first one included
    pub registrations: u32,
    /// RESPONSE_METRICS datagrams sent
    pub reports_sent: u32,
    /// Readings that crossed a threshold
    pub alerts_raised: u32,
    /// Reasons the session was closed
    pub closes: Vec<String>,
}

enum Wake {
    Datagram(io::Result<(usize, SocketAddr)>),
    Tick,
}

/// Runs an [`Agent`] over a datagram transport.
pub struct AgentDriver<E, T, S> {
    env: E,
    transport: T,
    agent: Agent,
    collector: SocketAddr,
    sampler: S,
    config: DriverConfig,
    alerts: Option<mpsc::UnboundedSender<AlertNotice>>,
    started: Instant,
    summary: AgentSummary,
}

impl<E, T, S> AgentDriver<E, T, S>
where
    E: Environment<Instant = Instant>,
    T: DatagramTransport,
    S: Sampler,
{
    /// Driver for a fresh agent
    pub fn new(
        env: E,
        transport: T,
        agent: AgentConfig,
        sampler: S,
        config: DriverConfig,
    ) -> Self {
        let started = env.now();
        let collector = agent.collector;
        Self {
            env,
            transport,
            agent: Agent::new(agent, started),
            collector,
            sampler,
            config,
            alerts: None,
            started,
            summary: AgentSummary::default(),
        }
    }

    /// Forward every threshold breach to `alerts`.
    pub fn with_alerts(mut self, alerts: mpsc::UnboundedSender<AlertNotice>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Register, then serve the collector until `duration` has passed.
    ///
    /// A closed session is re-registered on the next tick.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the transport fails.
    pub async fn run_for(mut self, duration: Duration) -> io::Result<AgentSummary> {
        let deadline = self.env.now() + duration;
        let mut buf = vec![0u8; self.config.max_datagram];

        self.register().await?;
        while self.env.now() < deadline {
            let wake = tokio::select! {
                received = self.transport.recv_from(&mut buf) => Wake::Datagram(received),
                () = self.env.sleep(self.config.tick_interval) => Wake::Tick,
            };

            let now = self.env.now();
            match wake {
                Wake::Datagram(received) => {
                    let (len, from) = received?;
                    match self.agent.handle_datagram(&self.env, &buf[..len], from, now) {
                        Ok(actions) => self.perform(actions).await?,
                        Err(err) => tracing::warn!(
                            agent_id = self.agent.agent_id(),
                            from = %from,
                            error = %err,
                            "Dropping datagram"
                        ),
                    }
                },
                Wake::Tick => {
                    let actions = self.agent.tick(now);
                    self.perform(actions).await?;
                    if matches!(self.agent.state(), HandshakeState::Init | HandshakeState::Failed) {
                        self.register().await?;
                    }
                },
            }
        }

        self.summary.state = Some(self.agent.state());
        self.summary.task = self.agent.task().cloned();
        Ok(self.summary)
    }

    async fn register(&mut self) -> io::Result<()> {
        let now = self.env.now();
        let actions = self.agent.register(&self.env, now).map_err(io::Error::from)?;
        self.summary.registrations += 1;
        tracing::debug!(
            agent_id = self.agent.agent_id(),
            attempt = self.summary.registrations,
            "Registering"
        );
        self.perform(actions).await
    }

    async fn perform(&mut self, actions: Vec<AgentAction>) -> io::Result<()> {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                AgentAction::Send(datagram) => {
                    let bytes = datagram.encode().map_err(LinkError::from)?;
                    self.transport.send_to(&bytes, self.collector).await?;
                },
                AgentAction::TaskAssigned(task) => {
                    tracing::info!(
                        agent_id = self.agent.agent_id(),
                        task_id = task.task_id,
                        frequency_secs = task.frequency_secs,
                        "Task assigned"
                    );
                },
                AgentAction::MetricsRequested(request) => {
                    queue.extend(self.answer(&request));
                },
                AgentAction::Close { reason } => {
                    tracing::warn!(agent_id = self.agent.agent_id(), %reason, "Session closed");
                    self.summary.closes.push(reason);
                },
            }
        }
        Ok(())
    }

    fn answer(&mut self, request: &MetricsRequest) -> Vec<AgentAction> {
        let Some(task) = self.agent.task().filter(|t| t.task_id == request.task_id) else {
            tracing::warn!(
                agent_id = self.agent.agent_id(),
                task_id = request.task_id,
                "Metrics requested for a task this agent does not run"
            );
            return Vec::new();
        };

        let timestamp_ms =
            u64::try_from((self.env.now() - self.started).as_millis()).unwrap_or(u64::MAX);
        let samples = self.sampler.sample(task);

        for sample in &samples {
            if let Some(notice) = task.alert_conditions.breach(sample, timestamp_ms) {
                self.summary.alerts_raised += 1;
                if let Some(alerts) = &self.alerts {
                    // Receiver gone means nobody forwards alerts any more
                    let _ = alerts.send(notice);
                }
            }
        }

        let report = MetricsReport { task_id: request.task_id, timestamp_ms, samples };
        match self.agent.send_metrics(&self.env, &report) {
            Ok(actions) => {
                self.summary.reports_sent += 1;
                actions
            },
            Err(err) => {
                tracing::warn!(agent_id = self.agent.agent_id(), error = %err, "Cannot report");
                Vec::new()
            },
        }
    }
}

/// One metrics report as the collector received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedReport {
    /// Sender address
    pub peer: SocketAddr,
    /// Agent id the sender registered with, if it asked for a task
    pub agent_id: Option<u32>,
    /// The report
    pub report: MetricsReport,
}

/// What a collector did during a run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectorSummary {
    /// Successful registrations
    pub registrations: u32,
    /// Tasks handed out
    pub tasks_assigned: u32,
    /// Reports in arrival order
    pub reports: Vec<ReceivedReport>,
    /// Registrations refused after a failed confirmation
    pub rejected: u32,
    /// Sessions discarded, with the reason
    pub closed: Vec<(SocketAddr, String)>,
    /// Peers with an established session when the run ended
    pub established: Vec<SocketAddr>,
}

/// Runs a [`Collector`] over a datagram transport.
pub struct CollectorDriver<E, T> {
    env: E,
    transport: T,
    collector: Collector,
    config: DriverConfig,
    // Established peers and the task each runs
    polling: BTreeMap<SocketAddr, u32>,
    summary: CollectorSummary,
}

impl<E, T> CollectorDriver<E, T>
where
    E: Environment<Instant = Instant>,
    T: DatagramTransport,
{
    /// Driver for a collector with no peers
    pub fn new(env: E, transport: T, collector: CollectorConfig, config: DriverConfig) -> Self {
        Self {
            env,
            transport,
            collector: Collector::new(collector),
            config,
            polling: BTreeMap::new(),
            summary: CollectorSummary::default(),
        }
    }

    /// Serve agents until `duration` has passed, polling each registered
    /// agent for metrics every `poll_interval`.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the transport fails.
    pub async fn run_for(mut self, duration: Duration) -> io::Result<CollectorSummary> {
        let deadline = self.env.now() + duration;
        let mut last_poll = self.env.now();
        let mut buf = vec![0u8; self.config.max_datagram];

        while self.env.now() < deadline {
            let wake = tokio::select! {
                received = self.transport.recv_from(&mut buf) => Wake::Datagram(received),
                () = self.env.sleep(self.config.tick_interval) => Wake::Tick,
            };

            let now = self.env.now();
            match wake {
                Wake::Datagram(received) => {
                    let (len, from) = received?;
                    match self.collector.handle_datagram(&self.env, &buf[..len], from, now) {
                        Ok(actions) => self.perform(actions).await?,
                        Err(err) => {
                            tracing::warn!(peer = %from, error = %err, "Dropping datagram");
                        },
                    }
                },
                Wake::Tick => {
                    let actions = self.collector.tick(now);
                    self.perform(actions).await?;

                    if now - last_poll >= self.config.poll_interval {
                        last_poll = now;
                        self.poll().await?;
                    }
                },
            }
        }

        self.summary.established = self.collector.established_peers().collect();
        Ok(self.summary)
    }

    async fn poll(&mut self) -> io::Result<()> {
        let targets: Vec<_> = self.polling.iter().map(|(&peer, &task)| (peer, task)).collect();
        for (peer, task_id) in targets {
            let request = MetricsRequest { task_id };
            match self.collector.request_metrics(&self.env, peer, &request) {
                Ok(actions) => self.perform(actions).await?,
                Err(err) => {
                    tracing::warn!(peer = %peer, error = %err, "Cannot poll agent");
                    self.polling.remove(&peer);
                },
            }
        }
        Ok(())
    }

    async fn perform(&mut self, actions: Vec<CollectorAction>) -> io::Result<()> {
        for action in actions {
            match action {
                CollectorAction::Send { to, datagram } => {
                    let bytes = datagram.encode().map_err(LinkError::from)?;
                    self.transport.send_to(&bytes, to).await?;
                },
                CollectorAction::Registered { peer } => {
                    tracing::info!(peer = %peer, "Agent registered");
                    self.summary.registrations += 1;
                },
                CollectorAction::TaskAssigned { peer, agent_id, task_id } => {
                    tracing::info!(peer = %peer, agent_id, task_id, "Task assigned");
                    self.summary.tasks_assigned += 1;
                    self.polling.insert(peer, task_id);
                },
                CollectorAction::MetricsReceived { peer, agent_id, report } => {
                    tracing::debug!(
                        peer = %peer,
                        ?agent_id,
                        samples = report.samples.len(),
                        "Metrics received"
                    );
                    self.summary.reports.push(ReceivedReport { peer, agent_id, report });
                },
                CollectorAction::Rejected { peer, reason } => {
                    tracing::warn!(peer = %peer, %reason, "Registration rejected");
                    self.summary.rejected += 1;
                    self.polling.remove(&peer);
                },
                CollectorAction::Closed { peer, reason } => {
                    tracing::warn!(peer = %peer, %reason, "Session closed");
                    self.polling.remove(&peer);
                    self.summary.closed.push((peer, reason));
                },
            }
        }
        Ok(())
    }
}

/// Send every alert from `alerts` to the collector over one stream and wait
/// for each acknowledgement.
///
/// Returns the number of acknowledgements once `alerts` is closed.
///
/// # Errors
///
/// Returns `io::Error` if the connection fails, the collector hangs up
/// before acknowledging, or the stream carries something other than
/// AlertFlow.
pub async fn forward_alerts<S: StreamTransport>(
    transport: &S,
    collector: SocketAddr,
    agent_id: u32,
    mut alerts: mpsc::UnboundedReceiver<AlertNotice>,
) -> io::Result<u64> {
    let (mut send, mut recv) = transport.connect(collector).await?;
    let mut desk = AlertDesk::new();
    let mut buf = [0u8; 1024];

    while let Some(notice) = alerts.recv().await {
        let request = raise_alert(agent_id, &notice)?;
        send.write_all(&encode_alert(&request)?).await?;

        let acknowledged = desk.acks_received() + 1;
        while desk.acks_received() < acknowledged {
            let len = recv.read(&mut buf).await?;
            if len == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            desk.handle(&buf[..len])?;
        }
        tracing::debug!(agent_id, metric = ?notice.metric, "Alert acknowledged");
    }

    send.shutdown().await?;
    Ok(desk.acks_received())
}

/// Accept one alert stream and acknowledge everything on it until the
/// agent hangs up.
///
/// Returns each alert in arrival order.
///
/// # Errors
///
/// Returns `io::Error` if accepting or writing fails, or the stream carries
/// something other than AlertFlow.
pub async fn serve_alerts<S: StreamTransport>(
    transport: &S,
) -> io::Result<Vec<(u32, Option<AlertNotice>)>> {
    let (mut send, mut recv, peer) = transport.accept().await?;
    let mut desk = AlertDesk::new();
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        let len = recv.read(&mut buf).await?;
        if len == 0 {
            break;
        }

        for action in desk.handle(&buf[..len])? {
            match action {
                AlertAction::Send(response) => send.write_all(&encode_alert(&response)?).await?,
                AlertAction::Alert { agent_id, notice } => {
                    tracing::info!(peer = %peer, agent_id, ?notice, "Alert received");
                    received.push((agent_id, notice));
                },
                AlertAction::Acknowledged { agent_id } => {
                    tracing::warn!(peer = %peer, agent_id, "Unexpected acknowledgement from agent");
                },
            }
        }
    }

    if desk.buffered() > 0 {
        tracing::warn!(peer = %peer, bytes = desk.buffered(), "Alert stream ended mid-datagram");
    }
    Ok(received)
}
