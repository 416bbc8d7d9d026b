//! Deterministic simulation harness for the monitoring fleet protocol.
//!
//! Provides a seeded [`SimEnv`], turmoil-backed transports, async drivers
//! that run agents and collectors over any transport, and an in-memory
//! scenario framework with oracle checks.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod driver;
pub mod scenario;
pub mod sim_env;
pub mod sim_transport;

pub use driver::{
    AgentDriver, AgentSummary, CollectorDriver, CollectorSummary, ConstantSampler, DriverConfig,
    ReceivedReport, Sampler, forward_alerts, serve_alerts,
};
pub use sim_env::SimEnv;
pub use sim_transport::{SimDatagramTransport, SimStreamTransport};
