//! Netflow family: peer-to-peer key exchange and free-form secure messages.
//!
//! ```text
//! "NFLW" │ version u32 │ type u32 │ payloadSize u32 │ body
//! "NFLW" │ version u32 │ type u32                          (KYS)
//! ```
//!
//! KYS is the minimal teardown datagram and ends after its type tag.

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

/// Leading bytes of every Netflow datagram.
pub const NETFLOW_SIGNATURE: Signature = *b"NFLW";

/// Netflow type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NetflowKind {
    /// Initiator's public key
    HelloThere = 1,
    /// Responder's public key, challenge and salt
    GeneralKenobi = 2,
    /// Initiator's confirmation
    TheNegotiator = 3,
    /// Sealed text message
    Message = 4,
    /// Unilateral teardown
    Kys = 5,
}

impl NetflowKind {
    /// Raw tag value
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    /// Parse a raw tag, `None` if unknown.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::HelloThere),
            2 => Some(Self::GeneralKenobi),
            3 => Some(Self::TheNegotiator),
            4 => Some(Self::Message),
            5 => Some(Self::Kys),
            _ => None,
        }
    }
}

/// One Netflow datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetflowDatagram {
    /// HELLO_THERE
    HelloThere(KeyOffer),
    /// GENERAL_KENOBI
    GeneralKenobi(KeyChallenge),
    /// THE_NEGOTIATOR
    TheNegotiator(ChallengeResponse),
    /// MESSAGE
    Message(SealedPayload),
    /// KYS
    Kys,
}

impl NetflowDatagram {
    fn body_len(&self) -> usize {
        match self {
            Self::HelloThere(offer) => offer.encoded_len(),
            Self::GeneralKenobi(challenge) => challenge.encoded_len(),
            Self::TheNegotiator(response) => response.encoded_len(),
            Self::Message(sealed) => sealed.encoded_len(),
            Self::Kys => 0,
        }
    }
}

impl Datagram for NetflowDatagram {
    const FAMILY: &'static str = "netflow";
    const SIGNATURE: Signature = NETFLOW_SIGNATURE;
    const MAX_SIZE: usize = MAX_UDP_DATAGRAM;

    type Kind = NetflowKind;

    fn kind(&self) -> NetflowKind {
        match self {
            Self::HelloThere(_) => NetflowKind::HelloThere,
            Self::GeneralKenobi(_) => NetflowKind::GeneralKenobi,
            Self::TheNegotiator(_) => NetflowKind::TheNegotiator,
            Self::Message(_) => NetflowKind::Message,
            Self::Kys => NetflowKind::Kys,
        }
    }

    fn write_datagram<'a>(&'a self, writer: &mut ByteWriter<'a>) -> Result<()> {
        writer.write_bytes(&NETFLOW_SIGNATURE).write(VERSION).write(self.kind().to_u32());

        if matches!(self, Self::Kys) {
            return Ok(());
        }

        let body_len = prefix_len(self.body_len())?;
        writer.write(body_len);

        match self {
            Self::HelloThere(offer) => offer.write(writer),
            Self::GeneralKenobi(challenge) => challenge.write(writer),
            Self::TheNegotiator(response) => response.write(writer),
            Self::Message(sealed) => sealed.write(writer),
            Self::Kys => Ok(()),
        }
    }

    fn read_datagram(reader: &mut ByteReader<'_>) -> Result<Self> {
        read_version(reader)?;

        let tag = reader.read::<u32>()?;
        let kind = NetflowKind::from_u32(tag)
            .ok_or(ProtocolError::UnknownType { family: Self::FAMILY, tag })?;

        if kind == NetflowKind::Kys {
            return Ok(Self::Kys);
        }

        let declared = reader.read::<u32>()?;
        expect_available(declared, reader)?;
        let body_start = reader.offset();

        let datagram = match kind {
            NetflowKind::HelloThere => Self::HelloThere(KeyOffer::read(reader)?),
            NetflowKind::GeneralKenobi => Self::GeneralKenobi(KeyChallenge::read(reader)?),
            NetflowKind::TheNegotiator => Self::TheNegotiator(ChallengeResponse::read(reader)?),
            NetflowKind::Message => Self::Message(SealedPayload::read(reader)?),
            NetflowKind::Kys => Self::Kys,
        };

        expect_consumed(declared, body_start, reader)?;
        Ok(datagram)
    }
}
