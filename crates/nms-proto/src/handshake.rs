//! Key-exchange bodies shared by the Netflow and NetTask families.
//!
//! Both families run the same three-step exchange under different type tags:
//!
//! | Step | Netflow | NetTask | Body |
//! |---|---|---|---|
//! | 1 | HELLO_THERE | REQUEST_REGISTER | [`KeyOffer`] |
//! | 2 | GENERAL_KENOBI | REGISTER_CHALLENGE | [`KeyChallenge`] |
//! | 3 | THE_NEGOTIATOR | REGISTER_CHALLENGE2 | [`ChallengeResponse`] |
//!
//! The framing layer treats keys, challenges and salts as opaque byte blobs;
//! their structure belongs to the key-exchange logic.

use bytes::Bytes;

use crate::{
    codec::{ByteReader, ByteWriter, prefixed_size},
    errors::Result,
    framing::read_owned,
};

/// Initiator's ephemeral public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOffer {
    /// Encoded public key
    pub public_key: Bytes,
}

impl KeyOffer {
    /// Body size on the wire
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        prefixed_size(self.public_key.len())
    }

    pub(crate) fn write<'a>(&'a self, writer: &mut ByteWriter<'a>) -> Result<()> {
        writer.write_prefixed(&self.public_key)?;
        Ok(())
    }

    pub(crate) fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self { public_key: read_owned(reader)? })
    }
}

/// Responder's public key, its address-bound challenge and the key salt.
///
/// Wire order: `(len, public_key), (len, challenge), (len, salt)`.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyChallenge {
    /// Encoded responder public key
    pub public_key: Bytes,
    /// Challenge bound to the initiator's address
    pub challenge: Bytes,
    /// Salt for the session key schedule
    pub salt: Bytes,
}

impl KeyChallenge {
    /// Body size on the wire
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        prefixed_size(self.public_key.len())
            + prefixed_size(self.challenge.len())
            + prefixed_size(self.salt.len())
    }

    pub(crate) fn write<'a>(&'a self, writer: &mut ByteWriter<'a>) -> Result<()> {
        writer.write_prefixed(&self.public_key)?;
        writer.write_prefixed(&self.challenge)?;
        writer.write_prefixed(&self.salt)?;
        Ok(())
    }

    pub(crate) fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let public_key = read_owned(reader)?;
        let challenge = read_owned(reader)?;
        let salt = read_owned(reader)?;
        Ok(Self { public_key, challenge, salt })
    }
}

impl std::fmt::Debug for KeyChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyChallenge")
            .field("public_key", &format!("<{} bytes>", self.public_key.len()))
            .field("challenge", &format!("<redacted {} bytes>", self.challenge.len()))
            .field("salt", &format!("<{} bytes>", self.salt.len()))
            .finish()
    }
}

/// Initiator's confirmation that it derived the same secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ChallengeResponse {
    /// Confirmation value re-derived from the challenge
    pub challenge: Bytes,
}

impl ChallengeResponse {
    /// Body size on the wire
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        prefixed_size(self.challenge.len())
    }

    pub(crate) fn write<'a>(&'a self, writer: &mut ByteWriter<'a>) -> Result<()> {
        writer.write_prefixed(&self.challenge)?;
        Ok(())
    }

    pub(crate) fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self { challenge: read_owned(reader)? })
    }
}

impl std::fmt::Debug for ChallengeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeResponse")
            .field("challenge", &format!("<redacted {} bytes>", self.challenge.len()))
            .finish()
    }
}
