//! Layout convention shared by the Netflow, NetTask and AlertFlow families.
//!
//! ```text
//! ┌───────────┬─────────┬──────────────────────┬───────────────────────────┐
//! │ signature │ version │ family header fields │ body: (u32 len, bytes)... │
//! │  4 bytes  │   u32   │  type, payloadSize…  │  in a per-type order      │
//! └───────────┴─────────┴──────────────────────┴───────────────────────────┘
//! ```
//!
//! Decoding is two-phase. [`verify_signature`] consumes exactly four bytes and
//! says whether they name the expected family; only then does
//! [`Datagram::read_datagram`] consume the family header and body. Families
//! never interchange: a NetTask reader rejects a Netflow datagram at the
//! signature and reads nothing further.

use bytes::Bytes;

use crate::{
    codec::{ByteReader, ByteWriter},
    errors::{ProtocolError, Result},
};

/// Four ASCII bytes that open every datagram of a family.
pub type Signature = [u8; 4];

/// Protocol version spoken by every family.
pub const VERSION: u32 = 1;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_UDP_DATAGRAM: usize = 65_507;

/// Consume four bytes and compare them with `expected`.
///
/// Returns `false` on mismatch and also when fewer than four bytes remain;
/// this function never fails. Callers must discard the datagram on `false`.
pub fn verify_signature(reader: &mut ByteReader<'_>, expected: Signature) -> bool {
    match reader.read_array::<4>() {
        Ok(found) => found == expected,
        Err(_) => false,
    }
}

/// Read and check the version field.
///
/// # Errors
///
/// Returns [`ProtocolError::UnsupportedVersion`] for anything other than
/// [`VERSION`]; a mismatch aborts decoding.
pub fn read_version(reader: &mut ByteReader<'_>) -> Result<()> {
    match reader.read::<u32>()? {
        VERSION => Ok(()),
        other => Err(ProtocolError::UnsupportedVersion(other)),
    }
}

/// Check that a typed body consumed exactly the declared payload size.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadSizeMismatch`] otherwise.
pub fn expect_consumed(declared: u32, body_start: usize, reader: &ByteReader<'_>) -> Result<()> {
    let actual = reader.offset() - body_start;
    if actual == declared as usize {
        Ok(())
    } else {
        Err(ProtocolError::PayloadSizeMismatch { declared: declared as usize, actual })
    }
}

/// Check a declared payload size against the bytes actually present.
///
/// # Errors
///
/// Returns [`ProtocolError::Truncated`] if the header promises more than the
/// buffer holds.
pub fn expect_available(declared: u32, reader: &ByteReader<'_>) -> Result<()> {
    if declared as usize > reader.remaining() {
        return Err(ProtocolError::Truncated {
            offset: reader.offset(),
            needed: declared as usize,
            available: reader.remaining(),
        });
    }
    Ok(())
}

/// Reject datagrams larger than the family allows.
///
/// # Errors
///
/// Returns [`ProtocolError::DatagramTooLarge`].
pub fn expect_within(size: usize, max: usize) -> Result<()> {
    if size > max {
        return Err(ProtocolError::DatagramTooLarge { size, max });
    }
    Ok(())
}

/// Capability set shared by the three datagram families.
///
/// Each family is a tagged union selected by its type tag; the trait only
/// fixes the signature handling so `decode` behaves identically everywhere.
pub trait Datagram: Sized {
    /// Family name used in errors
    const FAMILY: &'static str;

    /// Magic bytes identifying the family
    const SIGNATURE: Signature;

    /// Largest encoded datagram accepted by the family
    const MAX_SIZE: usize;

    /// Type discriminant of the family
    type Kind: Copy + Eq + std::fmt::Debug;

    /// Type tag of this datagram
    fn kind(&self) -> Self::Kind;

    /// Append the datagram, signature included, to `writer`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable field cannot be length-prefixed.
    fn write_datagram<'a>(&'a self, writer: &mut ByteWriter<'a>) -> Result<()>;

    /// Phase two of decoding: everything after the signature.
    ///
    /// # Errors
    ///
    /// Returns a framing error for truncated input, an unsupported version,
    /// an unknown type tag or an inconsistent payload size.
    fn read_datagram(reader: &mut ByteReader<'_>) -> Result<Self>;

    /// Serialize into one contiguous buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::DatagramTooLarge`] past [`Self::MAX_SIZE`].
    fn encode(&self) -> Result<Bytes> {
        let mut writer = ByteWriter::new();
        self.write_datagram(&mut writer)?;
        expect_within(writer.len(), Self::MAX_SIZE)?;
        Ok(writer.finish())
    }

    /// Verify the signature, then decode the rest.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::SignatureMismatch`] before reading anything
    /// else when the leading bytes name another family.
    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        if !verify_signature(&mut reader, Self::SIGNATURE) {
            let mut found = [0u8; 4];
            let prefix = bytes.len().min(4);
            found[..prefix].copy_from_slice(&bytes[..prefix]);
            return Err(ProtocolError::SignatureMismatch { expected: Self::SIGNATURE, found });
        }
        Self::read_datagram(&mut reader)
    }
}

/// Decode a length-prefixed field into an owned buffer.
pub(crate) fn read_owned(reader: &mut ByteReader<'_>) -> Result<Bytes> {
    reader.read_prefixed().map(Bytes::copy_from_slice)
}
