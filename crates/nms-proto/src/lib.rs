//! # Fleet Protocol: Wire Format
//!
//! Binary framing for the monitoring fleet protocol spoken between agents and
//! the collector.
//!
//! ## Families
//!
//! Three datagram families share one layout convention and never interchange
//! on the wire:
//!
//! - [`NetflowDatagram`] (`"NFLW"`): peer key exchange and sealed messages.
//! - [`NetTaskDatagram`] (`"NTSK"`): agent registration, task delivery and
//!   metric exchange over UDP, with per-direction sequence numbers.
//! - [`AlertDatagram`] (`"ALRT"`): unencrypted alerts over a TCP stream.
//!
//! ## Implementation Notes
//!
//! - **Big-endian, typed widths**: every integer is written at its declared
//!   width by [`ByteWriter`] and read back by [`ByteReader`]. Variable-length
//!   fields are always `(u32 length, raw bytes)`.
//!
//! - **Two-phase decode**: [`Datagram::decode`] verifies the 4-byte signature
//!   before any other read and rejects foreign families immediately.
//!
//! - **Hard failures**: a version mismatch, unknown type tag or inconsistent
//!   `payloadSize` aborts decoding with a [`ProtocolError`]. Nothing here logs.
//!
//! - **Opaque ciphertext**: sealed payloads are carried as
//!   [`SealedPayload`]; plaintext and keys never reach this crate.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alertflow;
pub mod codec;
pub mod errors;
pub mod framing;
pub mod handshake;
pub mod netflow;
pub mod nettask;
pub mod payloads;
pub mod sealed;

pub use alertflow::{AlertDatagram, AlertFrameBuffer, AlertKind};
pub use codec::{ByteReader, ByteWriter};
pub use errors::{ProtocolError, Result};
pub use framing::{Datagram, Signature, VERSION, verify_signature};
pub use handshake::{ChallengeResponse, KeyChallenge, KeyOffer};
pub use netflow::{NetflowDatagram, NetflowKind};
pub use nettask::{NetTaskBody, NetTaskDatagram, NetTaskHeader, NetTaskKind};
pub use payloads::MetricKind;
pub use sealed::SealedPayload;
