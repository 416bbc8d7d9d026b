//! World state for scenario execution.
//!
//! One agent and one collector joined by an in-memory wire. Every datagram
//! is encoded, optionally duplicated, and decoded on the other side; the
//! world records what each endpoint surfaced so oracles can check it.

use std::{
    collections::VecDeque,
    net::{Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use nms_core::{
    Agent, AgentAction, AgentConfig, Collector, CollectorAction, CollectorConfig, HandshakeState,
};
use nms_proto::{
    Datagram,
    payloads::{MetricsReport, MetricsRequest},
};

use crate::{
    driver::{ConstantSampler, Sampler},
    sim_env::SimEnv,
};

/// Value every sampled metric reports in scenarios.
pub const SAMPLE_VALUE: u64 = 1_234;

/// Address the scenario agent sends from.
pub fn agent_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::new(192, 168, 0, 2), 40_000))
}

/// Address the scenario collector listens on.
pub fn collector_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::new(192, 168, 0, 1), 9000))
}

enum Wire {
    ToCollector(Vec<u8>),
    ToAgent(Vec<u8>),
}

/// One agent, one collector and everything they said.
pub struct World {
    env: SimEnv,
    now: Instant,
    agent: Agent,
    collector: Collector,
    duplicate: bool,
    wire: VecDeque<Wire>,
    agent_events: Vec<AgentAction>,
    collector_events: Vec<CollectorAction>,
    datagrams_to_collector: usize,
    datagrams_to_agent: usize,
    errors: Vec<String>,
}

impl World {
    pub(crate) fn new(
        env: SimEnv,
        agent: AgentConfig,
        collector: CollectorConfig,
        duplicate: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            env,
            now,
            agent: Agent::new(agent, now),
            collector: Collector::new(collector),
            duplicate,
            wire: VecDeque::new(),
            agent_events: Vec::new(),
            collector_events: Vec::new(),
            datagrams_to_collector: 0,
            datagrams_to_agent: 0,
            errors: Vec::new(),
        }
    }

    /// The agent
    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// The collector
    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    /// Non-datagram actions the agent returned, in order
    pub fn agent_events(&self) -> &[AgentAction] {
        &self.agent_events
    }

    /// Non-datagram actions the collector returned, in order
    pub fn collector_events(&self) -> &[CollectorAction] {
        &self.collector_events
    }

    /// Datagrams handed to the collector, duplicates included
    pub fn datagrams_to_collector(&self) -> usize {
        self.datagrams_to_collector
    }

    /// Datagrams handed to the agent, duplicates included
    pub fn datagrams_to_agent(&self) -> usize {
        self.datagrams_to_agent
    }

    /// Errors either endpoint returned while handling traffic
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Both ends hold an established session.
    pub fn all_established(&self) -> bool {
        self.agent.state() == HandshakeState::Established
            && self.collector.peer_state(agent_addr()) == Some(HandshakeState::Established)
    }

    /// Both ends derived the same shared secret.
    pub fn secrets_match(&self) -> bool {
        match (self.agent.session(), self.collector.session(agent_addr())) {
            (Some(agent), Some(collector)) => agent.secret() == collector.secret(),
            _ => false,
        }
    }

    /// Reports the collector surfaced, in arrival order
    pub fn reports(&self) -> Vec<&MetricsReport> {
        self.collector_events
            .iter()
            .filter_map(|event| match event {
                CollectorAction::MetricsReceived { report, .. } => Some(report),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn register(&mut self) -> Result<(), String> {
        let actions = self
            .agent
            .register(&self.env, self.now)
            .map_err(|e| format!("agent register failed: {e}"))?;
        self.from_agent(actions);
        self.pump();
        Ok(())
    }

    pub(crate) fn poll_metrics(&mut self) -> Result<(), String> {
        let task_id = self
            .agent
            .task()
            .map(|task| task.task_id)
            .ok_or_else(|| "agent has no task to poll".to_string())?;
        let actions = self
            .collector
            .request_metrics(&self.env, agent_addr(), &MetricsRequest { task_id })
            .map_err(|e| format!("collector request_metrics failed: {e}"))?;
        self.from_collector(actions);
        self.pump();
        Ok(())
    }

    pub(crate) fn advance(&mut self, duration: Duration) {
        self.now += duration;
        let actions = self.agent.tick(self.now);
        self.from_agent(actions);
        let actions = self.collector.tick(self.now);
        self.from_collector(actions);
        self.pump();
    }

    fn from_agent(&mut self, actions: Vec<AgentAction>) {
        for action in actions {
            match action {
                AgentAction::Send(datagram) => match datagram.encode() {
                    Ok(bytes) => self.wire.push_back(Wire::ToCollector(bytes.to_vec())),
                    Err(err) => self.errors.push(format!("agent encode: {err}")),
                },
                AgentAction::MetricsRequested(request) => {
                    self.agent_events.push(AgentAction::MetricsRequested(request.clone()));
                    self.answer(&request);
                },
                other => self.agent_events.push(other),
            }
        }
    }

    fn answer(&mut self, request: &MetricsRequest) {
        let Some(task) = self.agent.task() else {
            self.errors.push("metrics requested before a task".to_string());
            return;
        };

        let report = MetricsReport {
            task_id: request.task_id,
            timestamp_ms: 0,
            samples: ConstantSampler(SAMPLE_VALUE).sample(task),
        };
        match self.agent.send_metrics(&self.env, &report) {
            Ok(actions) => self.from_agent(actions),
            Err(err) => self.errors.push(format!("agent send_metrics: {err}")),
        }
    }

    fn from_collector(&mut self, actions: Vec<CollectorAction>) {
        for action in actions {
            match action {
                CollectorAction::Send { datagram, .. } => match datagram.encode() {
                    Ok(bytes) => self.wire.push_back(Wire::ToAgent(bytes.to_vec())),
                    Err(err) => self.errors.push(format!("collector encode: {err}")),
                },
                other => self.collector_events.push(other),
            }
        }
    }

    fn pump(&mut self) {
        while let Some(next) = self.wire.pop_front() {
            let copies = if self.duplicate { 2 } else { 1 };
            for _ in 0..copies {
                match &next {
                    Wire::ToCollector(bytes) => {
                        self.datagrams_to_collector += 1;
                        let result =
                            self.collector.handle_datagram(&self.env, bytes, agent_addr(), self.now);
                        match result {
                            Ok(actions) => self.from_collector(actions),
                            Err(err) => self.errors.push(format!("collector: {err}")),
                        }
                    },
                    Wire::ToAgent(bytes) => {
                        self.datagrams_to_agent += 1;
                        let result =
                            self.agent.handle_datagram(&self.env, bytes, collector_addr(), self.now);
                        match result {
                            Ok(actions) => self.from_agent(actions),
                            Err(err) => self.errors.push(format!("agent: {err}")),
                        }
                    },
                }
            }
        }
    }
}
