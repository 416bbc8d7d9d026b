//! Metric exchange payloads.

use serde::{Deserialize, Serialize};

use super::MetricKind;

/// Sealed inside REQUEST_METRICS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRequest {
    /// Task whose samples are wanted
    pub task_id: u32,
}

/// Sealed inside RESPONSE_METRICS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsReport {
    /// Task the samples belong to
    pub task_id: u32,
    /// Unix milliseconds at which sampling finished
    pub timestamp_ms: u64,
    /// Readings, in the order the task lists its metrics
    pub samples: Vec<MetricSample>,
}

/// One reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSample {
    /// What was measured
    pub metric: MetricKind,
    /// Value in the metric's unit
    pub value: u64,
    /// Remote target for link metrics
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target: Option<String>,
}
