//! Alert body payload.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{MetricKind, decode_cbor, encode_cbor};
use crate::{
    alertflow::{AlertDatagram, AlertKind},
    errors::Result,
};

/// CBOR body of a REQUEST_ALERT: the reading that crossed a threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertNotice {
    /// Metric that crossed its threshold
    pub metric: MetricKind,
    /// Observed value
    pub value: u64,
    /// Threshold that was exceeded
    pub threshold: u64,
    /// Unix milliseconds of the observation
    pub timestamp_ms: u64,
}

impl AlertNotice {
    /// Wrap the notice in a REQUEST_ALERT for `agent_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::CborEncode`](crate::ProtocolError::CborEncode)
    /// if serialization fails.
    pub fn into_datagram(&self, agent_id: u32) -> Result<AlertDatagram> {
        Ok(AlertDatagram {
            agent_id,
            kind: AlertKind::RequestAlert,
            body: Bytes::from(encode_cbor(self)?),
        })
    }

    /// Decode the notice carried by an alert datagram.
    ///
    /// Returns `Ok(None)` for a base-form datagram with no body.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::CborDecode`](crate::ProtocolError::CborDecode)
    /// for a body that is not a notice.
    pub fn from_datagram(datagram: &AlertDatagram) -> Result<Option<Self>> {
        if datagram.body.is_empty() {
            return Ok(None);
        }
        decode_cbor(&datagram.body).map(Some)
    }
}
