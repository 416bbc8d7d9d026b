//! AlertFlow exchange over an ordered byte stream.
//!
//! Alerts skip the handshake entirely: the stream they ride on provides
//! ordering and integrity, so each datagram is framed but not sealed. Both
//! ends of a stream own an [`AlertDesk`] fed with whatever bytes the socket
//! returns. The collector's desk answers every REQUEST_ALERT with a
//! RESPONSE_ALERT for the same agent id; the agent's desk turns those
//! responses into acknowledgements.

use nms_proto::{
    AlertDatagram, AlertFrameBuffer, AlertKind, Datagram, payloads::AlertNotice,
};

use crate::error::{LinkError, Result};

/// Actions returned by an alert desk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertAction {
    /// Write this datagram to the stream
    Send(AlertDatagram),

    /// An agent raised an alert; `notice` is `None` for a base-form alert
    /// without a body
    Alert {
        /// Agent that raised it
        agent_id: u32,
        /// Decoded reading, when present
        notice: Option<AlertNotice>,
    },

    /// The collector acknowledged an alert from `agent_id`
    Acknowledged {
        /// Agent the acknowledgement is for
        agent_id: u32,
    },
}

/// Build the REQUEST_ALERT for `notice`.
///
/// # Errors
///
/// Returns [`LinkError::Protocol`] if the notice cannot be CBOR-encoded.
pub fn raise_alert(agent_id: u32, notice: &AlertNotice) -> Result<AlertDatagram> {
    tracing::debug!(
        agent_id,
        metric = ?notice.metric,
        value = notice.value,
        threshold = notice.threshold,
        "Raising alert"
    );
    Ok(notice.into_datagram(agent_id)?)
}

/// One end of an alert stream.
#[derive(Debug, Default)]
pub struct AlertDesk {
    buffer: AlertFrameBuffer,
    alerts_received: u64,
    acks_received: u64,
}

impl AlertDesk {
    /// Desk with an empty reassembly buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts received over the desk's lifetime
    #[must_use]
    pub fn alerts_received(&self) -> u64 {
        self.alerts_received
    }

    /// Acknowledgements received over the desk's lifetime
    #[must_use]
    pub fn acks_received(&self) -> u64 {
        self.acks_received
    }

    /// Bytes held back waiting for the rest of a datagram
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed bytes read from the stream.
    ///
    /// # Errors
    ///
    /// - [`LinkError::Protocol`] when the stream carries something that is
    ///   not AlertFlow; the stream cannot be resynchronized and should be
    ///   closed
    /// - [`LinkError::InvalidPayload`] for an alert body that is not a
    ///   notice
    pub fn handle(&mut self, bytes: &[u8]) -> Result<Vec<AlertAction>> {
        let datagrams = self.buffer.push(bytes).map_err(|err| {
            tracing::warn!(error = %err, "Alert stream corrupted");
            LinkError::from(err)
        })?;

        let mut actions = Vec::with_capacity(datagrams.len() * 2);
        for datagram in datagrams {
            match datagram.kind() {
                AlertKind::RequestAlert => {
                    let notice = AlertNotice::from_datagram(&datagram)
                        .map_err(|_| LinkError::InvalidPayload { expected: "alert notice" })?;
                    self.alerts_received += 1;

                    tracing::debug!(agent_id = datagram.agent_id, ?notice, "Alert received");
                    actions.push(AlertAction::Send(AlertDatagram::empty(
                        datagram.agent_id,
                        AlertKind::ResponseAlert,
                    )));
                    actions.push(AlertAction::Alert { agent_id: datagram.agent_id, notice });
                },
                AlertKind::ResponseAlert => {
                    self.acks_received += 1;
                    actions.push(AlertAction::Acknowledged { agent_id: datagram.agent_id });
                },
            }
        }
        Ok(actions)
    }
}

/// Encode an alert datagram for the stream.
///
/// # Errors
///
/// Returns [`LinkError::Protocol`] for a body above the AlertFlow limit.
pub fn encode_alert(datagram: &AlertDatagram) -> Result<bytes::Bytes> {
    Ok(datagram.encode()?)
}
