//! Scenario testing framework.
//!
//! A scenario wires one agent to one collector over an in-memory wire,
//! registers, optionally polls metrics and advances time, then hands the
//! resulting [`World`] to a mandatory oracle.

mod builder;
pub mod oracle;
mod world;

pub use builder::{RunnableScenario, SCENARIO_AGENT_ID, Scenario};
pub use oracle::OracleFn;
pub use world::{SAMPLE_VALUE, World, agent_addr, collector_addr};
