//! NetTask family: agent registration, task delivery and metric exchange.
//!
//! ```text
//! "NTSK" │ version │ sequenceNumber │ acknowledgementNumber │ type │ payloadSize │ body
//!          u32       u32              u32                     u32    u32
//! ```
//!
//! Registration bodies are the shared key-exchange bodies; every
//! post-handshake kind carries exactly one sealed payload.

use crate::{
    codec::{ByteReader, ByteWriter, prefix_len},
    errors::{ProtocolError, Result},
    framing::{
        Datagram, MAX_UDP_DATAGRAM, Signature, VERSION, expect_available, expect_consumed,
        read_version,
    },
    handshake::{ChallengeResponse, KeyChallenge, KeyOffer},
    sealed::SealedPayload,
};

/// Leading bytes of every NetTask datagram.
pub const NETTASK_SIGNATURE: Signature = *b"NTSK";

/// Fixed header size, signature included.
pub const NETTASK_HEADER_LEN: usize = 24;

/// NetTask type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NetTaskKind {
    /// Agent offers its public key
    RequestRegister = 1,
    /// Collector answers with key, challenge and salt
    RegisterChallenge = 2,
    /// Agent confirms the shared secret
    RegisterChallenge2 = 3,
    /// Agent asks for its task
    RequestTask = 4,
    /// Collector asks for a metrics report
    RequestMetrics = 5,
    /// Collector delivers a task
    ResponseTask = 6,
    /// Agent delivers a metrics report
    ResponseMetrics = 7,
}

impl NetTaskKind {
    /// Raw tag value
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    /// Parse a raw tag, `None` if unknown.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::RequestRegister),
            2 => Some(Self::RegisterChallenge),
            3 => Some(Self::RegisterChallenge2),
            4 => Some(Self::RequestTask),
            5 => Some(Self::RequestMetrics),
            6 => Some(Self::ResponseTask),
            7 => Some(Self::ResponseMetrics),
            _ => None,
        }
    }

    /// True for kinds whose body is a sealed payload
    #[must_use]
    pub const fn is_sealed(self) -> bool {
        matches!(
            self,
            Self::RequestTask | Self::RequestMetrics | Self::ResponseTask | Self::ResponseMetrics
        )
    }
}

/// Sequencing fields common to every NetTask datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetTaskHeader {
    /// Sender's sequence number for this datagram
    pub sequence: u32,
    /// Highest sequence number the sender has received from its peer
    pub acknowledgement: u32,
}

/// Typed NetTask body, selected by the type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetTaskBody {
    /// REQUEST_REGISTER
    RequestRegister(KeyOffer),
    /// REGISTER_CHALLENGE
    RegisterChallenge(KeyChallenge),
    /// REGISTER_CHALLENGE2
    RegisterChallenge2(ChallengeResponse),
    /// REQUEST_TASK
    RequestTask(SealedPayload),
    /// REQUEST_METRICS
    RequestMetrics(SealedPayload),
    /// RESPONSE_TASK
    ResponseTask(SealedPayload),
    /// RESPONSE_METRICS
    ResponseMetrics(SealedPayload),
}

impl NetTaskBody {
    /// Type tag of the body
    #[must_use]
    pub const fn kind(&self) -> NetTaskKind {
        match self {
            Self::RequestRegister(_) => NetTaskKind::RequestRegister,
            Self::RegisterChallenge(_) => NetTaskKind::RegisterChallenge,
            Self::RegisterChallenge2(_) => NetTaskKind::RegisterChallenge2,
            Self::RequestTask(_) => NetTaskKind::RequestTask,
            Self::RequestMetrics(_) => NetTaskKind::RequestMetrics,
            Self::ResponseTask(_) => NetTaskKind::ResponseTask,
            Self::ResponseMetrics(_) => NetTaskKind::ResponseMetrics,
        }
    }

    /// Wrap a sealed payload in the body of `kind`.
    ///
    /// Returns `None` for handshake kinds, which do not carry sealed data.
    #[must_use]
    pub fn sealed(kind: NetTaskKind, payload: SealedPayload) -> Option<Self> {
        match kind {
            NetTaskKind::RequestTask => Some(Self::RequestTask(payload)),
            NetTaskKind::RequestMetrics => Some(Self::RequestMetrics(payload)),
            NetTaskKind::ResponseTask => Some(Self::ResponseTask(payload)),
            NetTaskKind::ResponseMetrics => Some(Self::ResponseMetrics(payload)),
            NetTaskKind::RequestRegister
            | NetTaskKind::RegisterChallenge
            | NetTaskKind::RegisterChallenge2 => None,
        }
    }

    /// Sealed payload carried by a post-handshake body
    #[must_use]
    pub fn sealed_payload(&self) -> Option<&SealedPayload> {
        match self {
            Self::RequestTask(sealed)
            | Self::RequestMetrics(sealed)
            | Self::ResponseTask(sealed)
            | Self::ResponseMetrics(sealed) => Some(sealed),
            Self::RequestRegister(_) | Self::RegisterChallenge(_) | Self::RegisterChallenge2(_) => {
                None
            },
        }
    }

    /// Body size on the wire
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::RequestRegister(offer) => offer.encoded_len(),
            Self::RegisterChallenge(challenge) => challenge.encoded_len(),
            Self::RegisterChallenge2(response) => response.encoded_len(),
            Self::RequestTask(sealed)
            | Self::RequestMetrics(sealed)
            | Self::ResponseTask(sealed)
            | Self::ResponseMetrics(sealed) => sealed.encoded_len(),
        }
    }

    fn write<'a>(&'a self, writer: &mut ByteWriter<'a>) -> Result<()> {
        match self {
            Self::RequestRegister(offer) => offer.write(writer),
            Self::RegisterChallenge(challenge) => challenge.write(writer),
            Self::RegisterChallenge2(response) => response.write(writer),
            Self::RequestTask(sealed)
            | Self::RequestMetrics(sealed)
            | Self::ResponseTask(sealed)
            | Self::ResponseMetrics(sealed) => sealed.write(writer),
        }
    }

    fn read(kind: NetTaskKind, reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(match kind {
            NetTaskKind::RequestRegister => Self::RequestRegister(KeyOffer::read(reader)?),
            NetTaskKind::RegisterChallenge => Self::RegisterChallenge(KeyChallenge::read(reader)?),
            NetTaskKind::RegisterChallenge2 => {
                Self::RegisterChallenge2(ChallengeResponse::read(reader)?)
            },
            NetTaskKind::RequestTask => Self::RequestTask(SealedPayload::read(reader)?),
            NetTaskKind::RequestMetrics => Self::RequestMetrics(SealedPayload::read(reader)?),
            NetTaskKind::ResponseTask => Self::ResponseTask(SealedPayload::read(reader)?),
            NetTaskKind::ResponseMetrics => Self::ResponseMetrics(SealedPayload::read(reader)?),
        })
    }
}

/// One NetTask datagram: sequencing header plus typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetTaskDatagram {
    /// Sequence and acknowledgement numbers
    pub header: NetTaskHeader,
    /// Body selected by the type tag
    pub body: NetTaskBody,
}

impl NetTaskDatagram {
    /// Create a datagram from its parts.
    #[must_use]
    pub fn new(header: NetTaskHeader, body: NetTaskBody) -> Self {
        Self { header, body }
    }
}

impl Datagram for NetTaskDatagram {
    const FAMILY: &'static str = "nettask";
    const SIGNATURE: Signature = NETTASK_SIGNATURE;
    const MAX_SIZE: usize = MAX_UDP_DATAGRAM;

    type Kind = NetTaskKind;

    fn kind(&self) -> NetTaskKind {
        self.body.kind()
    }

    fn write_datagram<'a>(&'a self, writer: &mut ByteWriter<'a>) -> Result<()> {
        let payload_size = prefix_len(self.body.encoded_len())?;

        writer
            .write_bytes(&NETTASK_SIGNATURE)
            .write(VERSION)
            .write(self.header.sequence)
            .write(self.header.acknowledgement)
            .write(self.kind().to_u32())
            .write(payload_size);

        self.body.write(writer)
    }

    fn read_datagram(reader: &mut ByteReader<'_>) -> Result<Self> {
        read_version(reader)?;

        let sequence = reader.read::<u32>()?;
        let acknowledgement = reader.read::<u32>()?;
        let tag = reader.read::<u32>()?;
        let declared = reader.read::<u32>()?;

        let kind = NetTaskKind::from_u32(tag)
            .ok_or(ProtocolError::UnknownType { family: Self::FAMILY, tag })?;
        expect_available(declared, reader)?;

        let body_start = reader.offset();
        let body = NetTaskBody::read(kind, reader)?;
        expect_consumed(declared, body_start, reader)?;

        Ok(Self { header: NetTaskHeader { sequence, acknowledgement }, body })
    }
}
