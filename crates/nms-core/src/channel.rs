//! NetTask sequencing plus payload sealing under a session.
//!
//! [`NetTaskLink`] numbers every NetTask datagram in both directions,
//! handshake datagrams included, so it exists before any session does. The
//! sealing helpers take a [`Session`] by reference, which keeps "no sealed
//! datagram without a session" a compile-time fact.
//!
//! A sealed NetTask body authenticates the whole cleartext header, sequence
//! and acknowledgement included. Receivers [`classify`](NetTaskLink::classify)
//! a header, open the body, and only then [`commit`](NetTaskLink::commit)
//! the header to the link.

use nms_proto::{
    NetTaskBody, NetTaskDatagram, NetTaskHeader, NetTaskKind, NetflowDatagram, SealedPayload,
    VERSION,
    netflow::NETFLOW_SIGNATURE,
    nettask::NETTASK_SIGNATURE,
    payloads::{decode_cbor, encode_cbor},
};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    env::Environment,
    error::{LinkError, Result, SequenceError},
    sequence::{Delivery, ReceiveWindow, SendSequence},
    session::{Session, associated_data},
};

/// Length of the NetTask associated data
pub const NETTASK_AAD_LEN: usize = 20;

/// `signature ‖ version ‖ sequence ‖ acknowledgement ‖ type tag`, big-endian,
/// as laid out on the wire.
#[must_use]
pub fn nettask_associated_data(
    header: &NetTaskHeader,
    kind: NetTaskKind,
) -> [u8; NETTASK_AAD_LEN] {
    let mut aad = [0u8; NETTASK_AAD_LEN];
    aad[..4].copy_from_slice(&NETTASK_SIGNATURE);
    aad[4..8].copy_from_slice(&VERSION.to_be_bytes());
    aad[8..12].copy_from_slice(&header.sequence.to_be_bytes());
    aad[12..16].copy_from_slice(&header.acknowledgement.to_be_bytes());
    aad[16..].copy_from_slice(&kind.to_u32().to_be_bytes());
    aad
}

/// Both sequence directions of one NetTask peer.
#[derive(Debug, Clone, Default)]
pub struct NetTaskLink {
    send: SendSequence,
    receive: ReceiveWindow,
}

impl NetTaskLink {
    /// Fresh link; nothing sent or received
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_header(&mut self) -> std::result::Result<NetTaskHeader, SequenceError> {
        Ok(NetTaskHeader { sequence: self.send.next()?, acknowledgement: self.receive.highest() })
    }

    /// Stamp a handshake `body` with the next sequence number and the
    /// current acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`SequenceError::Exhausted`] once the sequence space is used
    /// up.
    pub fn outbound(
        &mut self,
        body: NetTaskBody,
    ) -> std::result::Result<NetTaskDatagram, SequenceError> {
        Ok(NetTaskDatagram::new(self.next_header()?, body))
    }

    /// CBOR-encode `payload` and seal it as a `kind` datagram under the next
    /// header.
    ///
    /// # Errors
    ///
    /// - [`LinkError::InvalidPayload`] for a handshake kind
    /// - [`LinkError::Protocol`] if CBOR encoding fails
    /// - [`LinkError::Sequence`] once the sequence space is used up
    /// - [`LinkError::Crypto`] if sealing fails
    pub fn outbound_sealed<E: Environment, T: Serialize>(
        &mut self,
        session: &Session,
        env: &E,
        kind: NetTaskKind,
        payload: &T,
    ) -> Result<NetTaskDatagram> {
        if !kind.is_sealed() {
            return Err(LinkError::InvalidPayload { expected: "sealed nettask kind" });
        }

        let plaintext = encode_cbor(payload)?;
        let header = self.next_header()?;
        let sealed = session.seal(env, &nettask_associated_data(&header, kind), &plaintext)?;
        let body = NetTaskBody::sealed(kind, sealed)
            .ok_or(LinkError::InvalidPayload { expected: "sealed nettask kind" })?;
        Ok(NetTaskDatagram::new(header, body))
    }

    /// Classify an inbound header without recording it. Only
    /// [`Delivery::Fresh`] datagrams should be processed further.
    #[must_use]
    pub fn classify(&self, header: &NetTaskHeader) -> Delivery {
        self.receive.classify(header.sequence)
    }

    /// Record an inbound header once its datagram has been accepted: the
    /// sequence number enters the window and the acknowledgement is folded
    /// into the send side. Headers that are not fresh are ignored.
    pub fn commit(&mut self, header: &NetTaskHeader) {
        if self.classify(header).is_fresh() {
            self.receive.commit(header.sequence);
            self.send.acknowledge(header.acknowledgement);
        }
    }

    /// Highest sequence number received from the peer
    #[must_use]
    pub fn acknowledgement(&self) -> u32 {
        self.receive.highest()
    }

    /// Last sequence number we sent
    #[must_use]
    pub fn last_sent(&self) -> u32 {
        self.send.last_sent()
    }

    /// Datagrams sent that the peer has not acknowledged
    #[must_use]
    pub fn unacked(&self) -> u32 {
        self.send.unacked()
    }
}

/// Open the sealed body of `datagram` against its header and CBOR-decode it
/// as `T`.
///
/// # Errors
///
/// - [`LinkError::Crypto`] if authentication fails, including for a header
///   rewritten in flight
/// - [`LinkError::InvalidPayload`] for a handshake body or a plaintext that
///   is not a `T`
pub fn open_body<T: DeserializeOwned>(
    session: &mut Session,
    datagram: &NetTaskDatagram,
    expected: &'static str,
) -> Result<T> {
    let body = &datagram.body;
    let sealed = body.sealed_payload().ok_or(LinkError::InvalidPayload { expected })?;
    let aad = nettask_associated_data(&datagram.header, body.kind());
    let plaintext = session.open(&aad, sealed)?;
    decode_cbor(&plaintext).map_err(|_| LinkError::InvalidPayload { expected })
}

/// Seal a free-form text message as a Netflow MESSAGE.
///
/// # Errors
///
/// Returns [`LinkError::Crypto`] if sealing fails.
pub fn seal_message<E: Environment>(
    session: &Session,
    env: &E,
    text: &str,
) -> Result<NetflowDatagram> {
    let aad = associated_data(NETFLOW_SIGNATURE, nms_proto::NetflowKind::Message.to_u32());
    let sealed = session.seal(env, &aad, text.as_bytes())?;
    Ok(NetflowDatagram::Message(sealed))
}

/// Open a Netflow MESSAGE payload as UTF-8 text.
///
/// # Errors
///
/// - [`LinkError::Crypto`] if authentication fails
/// - [`LinkError::InvalidPayload`] if the plaintext is not UTF-8
pub fn open_message(session: &mut Session, sealed: &SealedPayload) -> Result<String> {
    let aad = associated_data(NETFLOW_SIGNATURE, nms_proto::NetflowKind::Message.to_u32());
    let plaintext = session.open(&aad, sealed)?;
    String::from_utf8(plaintext).map_err(|_| LinkError::InvalidPayload { expected: "utf-8 text" })
}
