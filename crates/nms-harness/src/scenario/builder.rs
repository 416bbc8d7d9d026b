//! Scenario builder API.

use std::time::Duration;

use nms_core::{AgentConfig, CollectorConfig, LinkConfig};
use nms_proto::{
    MetricKind,
    payloads::{AlertConditions, TaskSpec, Threshold},
};

use crate::{
    scenario::{OracleFn, World, agent_addr, collector_addr},
    sim_env::SimEnv,
};

/// Agent id used unless the agent config is replaced.
pub const SCENARIO_AGENT_ID: u32 = 7;

/// Scenario builder.
///
/// Configure both endpoints, pick what happens after registration, then
/// attach an oracle to get something runnable.
pub struct Scenario {
    seed: u64,
    agent_config: AgentConfig,
    collector_config: CollectorConfig,
    metrics_rounds: u32,
    duplicate: bool,
    time_advance: Option<Duration>,
}

impl Scenario {
    /// Scenario with default links, seed 0 and a CPU/RAM task.
    pub fn new() -> Self {
        Self {
            seed: 0,
            agent_config: AgentConfig {
                agent_id: SCENARIO_AGENT_ID,
                collector: collector_addr(),
                local_addr: agent_addr(),
                link: LinkConfig::default(),
            },
            collector_config: CollectorConfig {
                link: LinkConfig::default(),
                default_task: default_task(),
                tasks: Default::default(),
            },
            metrics_rounds: 0,
            duplicate: false,
            time_advance: None,
        }
    }

    /// Seed for every key, salt and nonce drawn during the run.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Replace the agent configuration.
    pub fn with_agent_config(mut self, config: AgentConfig) -> Self {
        self.agent_config = config;
        self
    }

    /// Replace the collector configuration.
    pub fn with_collector_config(mut self, config: CollectorConfig) -> Self {
        self.collector_config = config;
        self
    }

    /// After registration, poll the agent for metrics `rounds` times.
    pub fn with_metrics_rounds(mut self, rounds: u32) -> Self {
        self.metrics_rounds = rounds;
        self
    }

    /// Deliver every datagram twice.
    pub fn with_duplication(mut self) -> Self {
        self.duplicate = true;
        self
    }

    /// Advance virtual time once everything else has run, then tick both
    /// endpoints.
    pub fn with_time_advance(mut self, duration: Duration) -> Self {
        self.time_advance = Some(duration);
        self
    }

    /// Attach the oracle. There is no way to run a scenario without one.
    pub fn oracle(self, oracle: OracleFn) -> RunnableScenario {
        RunnableScenario { scenario: self, oracle }
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new()
    }
}

fn default_task() -> TaskSpec {
    TaskSpec {
        task_id: 1,
        frequency_secs: 30,
        device_metrics: vec![MetricKind::CpuUsage, MetricKind::RamUsage],
        link_probes: Vec::new(),
        alert_conditions: AlertConditions {
            thresholds: vec![Threshold { metric: MetricKind::CpuUsage, limit: 9_000 }],
        },
    }
}

/// A scenario with an oracle attached.
pub struct RunnableScenario {
    scenario: Scenario,
    oracle: OracleFn,
}

impl RunnableScenario {
    /// Execute the scenario.
    ///
    /// 1. Agent registers; the wire is pumped until quiet
    /// 2. Collector polls for metrics, once per round
    /// 3. Time advances and both endpoints tick, if configured
    /// 4. The oracle inspects the world
    ///
    /// # Errors
    ///
    /// Returns the first step or oracle failure as a message.
    pub fn run(self) -> Result<(), String> {
        let Scenario {
            seed,
            agent_config,
            collector_config,
            metrics_rounds,
            duplicate,
            time_advance,
        } = self.scenario;

        let mut world =
            World::new(SimEnv::with_seed(seed), agent_config, collector_config, duplicate);

        world.register()?;
        for _ in 0..metrics_rounds {
            world.poll_metrics()?;
        }
        if let Some(advance) = time_advance {
            world.advance(advance);
        }

        (self.oracle)(&world)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_requires_oracle() {
        let _scenario = Scenario::new().oracle(Box::new(|_world| Ok(())));
    }

    #[test]
    fn oracle_failure_is_reported() {
        let result = Scenario::new().oracle(Box::new(|_| Err("nope".to_string()))).run();
        assert_eq!(result, Err("nope".to_string()));
    }

    #[test]
    fn default_scenario_registers() {
        Scenario::new()
            .oracle(Box::new(|world| {
                assert!(world.all_established());
                assert_eq!(world.agent().task(), Some(&default_task()));
                Ok(())
            }))
            .run()
            .expect("scenario should succeed");
    }
}
