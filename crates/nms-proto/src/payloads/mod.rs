//! CBOR-encoded application payloads.
//!
//! These are the plaintexts sealed inside NetTask datagrams and the optional
//! body of an alert. The framing layer never parses them; only the endpoint
//! that owns the session does, after opening the sealed payload.

pub mod alert;
pub mod metrics;
pub mod task;

pub use alert::AlertNotice;
pub use metrics::{MetricSample, MetricsReport, MetricsRequest};
pub use task::{AlertConditions, LinkProbe, TaskRequest, TaskSpec, Threshold};
use serde::{Serialize, de::DeserializeOwned};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::errors::{ProtocolError, Result};

/// Quantity an agent can sample.
///
/// Serialized as its `u8` discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum MetricKind {
    /// CPU usage, hundredths of a percent
    CpuUsage = 1,
    /// Memory usage, hundredths of a percent
    RamUsage = 2,
    /// Packets per second on an interface
    InterfacePps = 3,
    /// Link bandwidth, bits per second
    Bandwidth = 4,
    /// Link jitter, microseconds
    Jitter = 5,
    /// Packet loss, hundredths of a percent
    PacketLoss = 6,
    /// Round-trip latency, microseconds
    Latency = 7,
}

impl MetricKind {
    /// True for quantities measured against a remote target
    #[must_use]
    pub const fn is_link_metric(self) -> bool {
        matches!(self, Self::Bandwidth | Self::Jitter | Self::PacketLoss | Self::Latency)
    }
}

/// Serialize `value` as CBOR.
///
/// # Errors
///
/// Returns [`ProtocolError::CborEncode`] if serialization fails.
pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a CBOR value.
///
/// # Errors
///
/// Returns [`ProtocolError::CborDecode`] for malformed input or a shape that
/// does not match `T`.
pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}
