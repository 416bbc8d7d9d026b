//! AlertFlow family: unencrypted urgent notifications over a stream.
//!
//! ```text
//! "ALRT" │ version u32 │ agentId u32 │ type u32 │ payloadSize u32 │ body
//! ```
//!
//! There is no handshake dependency. The body is raw bytes (empty in the
//! base form, a CBOR [`AlertNotice`](crate::payloads::AlertNotice) when an
//! agent reports what tripped). Because alerts travel over an ordered byte
//! stream, [`AlertFrameBuffer`] reassembles whole datagrams from arbitrary
//! read boundaries.

use bytes::{Bytes, BytesMut};

use crate::{
    codec::{ByteReader, ByteWriter, prefix_len},
    errors::{ProtocolError, Result},
    framing::{Datagram, Signature, VERSION, expect_available, expect_within, read_version},
};

/// Leading bytes of every AlertFlow datagram.
pub const ALERT_SIGNATURE: Signature = *b"ALRT";

/// Fixed header size, signature included.
pub const ALERT_HEADER_LEN: usize = 20;

/// Largest body accepted on an alert stream (1 MiB).
pub const MAX_ALERT_BODY: usize = 1 << 20;

/// AlertFlow type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AlertKind {
    /// Agent raises an alert
    RequestAlert = 1,
    /// Collector acknowledges it
    ResponseAlert = 2,
}

impl AlertKind {
    /// Raw tag value
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    /// Parse a raw tag, `None` if unknown.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::RequestAlert),
            2 => Some(Self::ResponseAlert),
            _ => None,
        }
    }
}

/// One AlertFlow datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertDatagram {
    /// Agent the alert concerns
    pub agent_id: u32,
    /// REQUEST_ALERT or RESPONSE_ALERT
    pub kind: AlertKind,
    /// Raw body, possibly empty
    pub body: Bytes,
}

impl AlertDatagram {
    /// Base-form datagram with no body.
    #[must_use]
    pub fn empty(agent_id: u32, kind: AlertKind) -> Self {
        Self { agent_id, kind, body: Bytes::new() }
    }
}

impl Datagram for AlertDatagram {
    const FAMILY: &'static str = "alertflow";
    const SIGNATURE: Signature = ALERT_SIGNATURE;
    const MAX_SIZE: usize = ALERT_HEADER_LEN + MAX_ALERT_BODY;

    type Kind = AlertKind;

    fn kind(&self) -> AlertKind {
        self.kind
    }

    fn write_datagram<'a>(&'a self, writer: &mut ByteWriter<'a>) -> Result<()> {
        let payload_size = prefix_len(self.body.len())?;

        writer
            .write_bytes(&ALERT_SIGNATURE)
            .write(VERSION)
            .write(self.agent_id)
            .write(self.kind.to_u32())
            .write(payload_size)
            .write_bytes(&self.body);
        Ok(())
    }

    fn read_datagram(reader: &mut ByteReader<'_>) -> Result<Self> {
        let header = AlertHeader::read(reader)?;
        expect_available(header.payload_size, reader)?;

        let body = Bytes::copy_from_slice(reader.read_bytes(header.payload_size as usize)?);
        Ok(Self { agent_id: header.agent_id, kind: header.kind, body })
    }
}

/// Fixed header fields after the signature.
#[derive(Debug, Clone, Copy)]
struct AlertHeader {
    agent_id: u32,
    kind: AlertKind,
    payload_size: u32,
}

impl AlertHeader {
    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        read_version(reader)?;
        let agent_id = reader.read::<u32>()?;
        let tag = reader.read::<u32>()?;
        let payload_size = reader.read::<u32>()?;

        let kind = AlertKind::from_u32(tag)
            .ok_or(ProtocolError::UnknownType { family: AlertDatagram::FAMILY, tag })?;
        expect_within(payload_size as usize, MAX_ALERT_BODY)?;

        Ok(Self { agent_id, kind, payload_size })
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForBody { total: usize },
}

/// Reassembles alert datagrams from an ordered byte stream.
///
/// Bytes are appended with [`push`](Self::push), which returns every
/// datagram completed so far and keeps any partial tail for the next call.
/// A framing error means the stream is out of sync; the owner should close
/// it.
#[derive(Debug)]
pub struct AlertFrameBuffer {
    buffer: BytesMut,
    state: State,
}

impl AlertFrameBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: BytesMut::with_capacity(4 * 1024), state: State::WaitingForHeader }
    }

    /// Append `data` and extract every complete datagram.
    ///
    /// # Errors
    ///
    /// Returns a framing error when a header names another family, an
    /// unsupported version, an unknown type or an oversized body.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<AlertDatagram>> {
        self.buffer.extend_from_slice(data);

        let mut datagrams = Vec::new();
        while let Some(datagram) = self.try_extract_one()? {
            datagrams.push(datagram);
        }
        Ok(datagrams)
    }

    /// Bytes held for an incomplete datagram
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when no partial datagram is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn try_extract_one(&mut self) -> Result<Option<AlertDatagram>> {
        let total = match self.state {
            State::WaitingForHeader => {
                if self.buffer.len() < ALERT_HEADER_LEN {
                    return Ok(None);
                }

                let mut reader = ByteReader::new(&self.buffer[..ALERT_HEADER_LEN]);
                let found = reader.read_array::<4>()?;
                if found != ALERT_SIGNATURE {
                    return Err(ProtocolError::SignatureMismatch {
                        expected: ALERT_SIGNATURE,
                        found,
                    });
                }
                let header = AlertHeader::read(&mut reader)?;

                let total = ALERT_HEADER_LEN + header.payload_size as usize;
                self.state = State::WaitingForBody { total };
                total
            },
            State::WaitingForBody { total } => total,
        };

        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame = self.buffer.split_to(total).freeze();
        self.state = State::WaitingForHeader;
        AlertDatagram::decode(&frame).map(Some)
    }
}

impl Default for AlertFrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
