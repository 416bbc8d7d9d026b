//! Error types for the fleet wire format.
//!
//! Every decoding failure is returned as a value. Nothing in this crate logs;
//! the caller owning the connection decides what to report and whether the
//! datagram is simply dropped.

use thiserror::Error;

/// Framing-level errors raised while encoding or decoding a datagram.
///
/// All variants are fatal to the single datagram being processed and never
/// to the connection that carried it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A read would run past the end of the buffer
    #[error("truncated datagram: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        /// Offset at which the read started
        offset: usize,
        /// Bytes the read required
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// The leading 4 bytes do not name the expected protocol family
    #[error("signature mismatch: expected {expected:?}, found {found:?}")]
    SignatureMismatch {
        /// Signature of the family the caller asked for
        expected: [u8; 4],
        /// Bytes actually present at the start of the datagram
        found: [u8; 4],
    },

    /// Datagram announces a protocol version this build does not speak
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    /// Type tag is not defined for the family
    #[error("unknown {family} datagram type: {tag}")]
    UnknownType {
        /// Family name
        family: &'static str,
        /// Tag found on the wire
        tag: u32,
    },

    /// Declared payload size disagrees with the body that was parsed
    #[error("payload size mismatch: header declares {declared} bytes, body used {actual}")]
    PayloadSizeMismatch {
        /// Size written in the fixed header
        declared: usize,
        /// Bytes consumed by the typed body
        actual: usize,
    },

    /// A variable-length field cannot be described by a `u32` length prefix
    #[error("field too long for a u32 length prefix: {len} bytes")]
    FieldTooLong {
        /// Length of the offending field
        len: usize,
    },

    /// Sealed payload cannot hold a nonce and an authentication tag
    #[error("sealed payload too short: {len} bytes, need at least {min}")]
    SealedTooShort {
        /// Length found on the wire
        len: usize,
        /// Nonce plus tag length
        min: usize,
    },

    /// Encoded datagram exceeds the family's size limit
    #[error("datagram too large: {size} bytes exceeds maximum {max}")]
    DatagramTooLarge {
        /// Encoded size
        size: usize,
        /// Family limit
        max: usize,
    },

    /// Failed to encode an application payload as CBOR
    #[error("failed to encode CBOR: {0}")]
    CborEncode(String),

    /// Failed to decode an application payload from CBOR
    #[error("failed to decode CBOR: {0}")]
    CborDecode(String),
}

/// Convenient Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
