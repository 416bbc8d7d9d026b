//! Opaque encrypted payload carried by secure datagrams.
//!
//! The framing layer only knows that a sealed payload is
//! `nonce(12) ‖ ciphertext ‖ tag(16)` inside one length-prefixed field. It
//! never sees plaintext; sealing and opening live with the session that owns
//! the key.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    codec::{ByteReader, ByteWriter, prefixed_size},
    errors::{ProtocolError, Result},
};

/// Encrypted application data, as it travels on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedPayload(Bytes);

impl SealedPayload {
    /// AEAD nonce length
    pub const NONCE_LEN: usize = 12;

    /// AEAD authentication tag length
    pub const TAG_LEN: usize = 16;

    /// Smallest well-formed sealed payload (empty plaintext)
    pub const MIN_LEN: usize = Self::NONCE_LEN + Self::TAG_LEN;

    /// Assemble a sealed payload from a nonce and `ciphertext ‖ tag`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::SealedTooShort`] if `ciphertext` cannot hold a
    /// tag.
    pub fn from_parts(nonce: [u8; Self::NONCE_LEN], ciphertext: &[u8]) -> Result<Self> {
        if ciphertext.len() < Self::TAG_LEN {
            return Err(ProtocolError::SealedTooShort {
                len: Self::NONCE_LEN + ciphertext.len(),
                min: Self::MIN_LEN,
            });
        }

        let mut buf = BytesMut::with_capacity(Self::NONCE_LEN + ciphertext.len());
        buf.put_slice(&nonce);
        buf.put_slice(ciphertext);
        Ok(Self(buf.freeze()))
    }

    /// Wrap bytes already laid out as `nonce ‖ ciphertext ‖ tag`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::SealedTooShort`] below [`Self::MIN_LEN`].
    pub fn from_wire(bytes: Bytes) -> Result<Self> {
        if bytes.len() < Self::MIN_LEN {
            return Err(ProtocolError::SealedTooShort { len: bytes.len(), min: Self::MIN_LEN });
        }
        Ok(Self(bytes))
    }

    /// Nonce the payload was sealed under
    #[must_use]
    pub fn nonce(&self) -> &[u8] {
        &self.0[..Self::NONCE_LEN]
    }

    /// Ciphertext followed by the authentication tag
    #[must_use]
    pub fn ciphertext(&self) -> &[u8] {
        &self.0[Self::NONCE_LEN..]
    }

    /// Full wire representation
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Wire length without the length prefix
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; a sealed payload carries at least a nonce and a tag
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bytes occupied inside a datagram body, prefix included
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        prefixed_size(self.0.len())
    }

    /// Append as one `(u32 length, bytes)` field.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FieldTooLong`] for absurd lengths.
    pub fn write<'a>(&'a self, writer: &mut ByteWriter<'a>) -> Result<()> {
        writer.write_prefixed(&self.0)?;
        Ok(())
    }

    /// Read one `(u32 length, bytes)` field as a sealed payload.
    ///
    /// # Errors
    ///
    /// Returns a framing error for a truncated field or one too short to be
    /// a sealed payload.
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Self::from_wire(Bytes::copy_from_slice(reader.read_prefixed()?))
    }
}

impl std::fmt::Debug for SealedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedPayload").field("len", &self.0.len()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_are_laid_out_nonce_first() {
        let sealed = SealedPayload::from_parts([7u8; 12], &[9u8; 20]).unwrap();

        assert_eq!(sealed.nonce(), &[7u8; 12]);
        assert_eq!(sealed.ciphertext(), &[9u8; 20]);
        assert_eq!(sealed.encoded_len(), 4 + 32);
    }

    #[test]
    fn rejects_payload_without_room_for_tag() {
        let err = SealedPayload::from_wire(Bytes::from_static(&[0u8; 27])).unwrap_err();
        assert_eq!(err, ProtocolError::SealedTooShort { len: 27, min: 28 });
    }

    #[test]
    fn short_field_on_the_wire_is_rejected() {
        let mut writer = ByteWriter::new();
        writer.write_prefixed(&[1, 2, 3]).unwrap();
        let bytes = writer.finish();

        let mut reader = ByteReader::new(&bytes);
        assert!(matches!(SealedPayload::read(&mut reader), Err(ProtocolError::SealedTooShort { .. })));
    }
}
