//! Task assignment payloads.
//!
//! An agent asks for work with [`TaskRequest`] right after registering; the
//! collector answers with the [`TaskSpec`] describing what to sample, how
//! often, and which readings are urgent enough to raise an alert.

use serde::{Deserialize, Serialize};

use super::{AlertNotice, MetricKind, MetricSample};

/// Sealed inside REQUEST_TASK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Identifier the agent was provisioned with
    pub agent_id: u32,
}

/// Sealed inside RESPONSE_TASK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Collector-assigned task identifier
    pub task_id: u32,
    /// Sampling period in seconds
    pub frequency_secs: u32,
    /// Local device quantities to sample every period
    pub device_metrics: Vec<MetricKind>,
    /// Link measurements against remote targets
    pub link_probes: Vec<LinkProbe>,
    /// Readings that must be reported immediately over AlertFlow
    pub alert_conditions: AlertConditions,
}

impl TaskSpec {
    /// Every metric the task samples, device metrics first.
    pub fn metrics(&self) -> impl Iterator<Item = MetricKind> + '_ {
        self.device_metrics.iter().copied().chain(self.link_probes.iter().map(|p| p.metric))
    }
}

/// One link measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkProbe {
    /// Which link quantity to measure
    pub metric: MetricKind,
    /// Host or address to measure against
    pub target: String,
    /// Measurement duration in seconds
    pub duration_secs: u16,
}

/// Alert thresholds attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertConditions {
    /// A sample above any of these triggers an alert
    pub thresholds: Vec<Threshold>,
}

/// Upper bound for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threshold {
    /// Metric the bound applies to
    pub metric: MetricKind,
    /// Largest acceptable value, in the metric's unit
    pub limit: u64,
}

impl AlertConditions {
    /// Check a sample against the thresholds.
    ///
    /// Returns the notice to raise for the first threshold the sample
    /// exceeds, or `None` if it is within bounds.
    #[must_use]
    pub fn breach(&self, sample: &MetricSample, timestamp_ms: u64) -> Option<AlertNotice> {
        self.thresholds
            .iter()
            .find(|t| t.metric == sample.metric && sample.value > t.limit)
            .map(|t| AlertNotice {
                metric: sample.metric,
                value: sample.value,
                threshold: t.limit,
                timestamp_ms,
            })
    }
}
