//! Error types for the fleet protocol core.
//!
//! One enum per layer:
//!
//! - [`HandshakeError`]: key agreement and challenge confirmation
//! - [`CryptoError`]: sealing and opening payloads under a session
//! - [`SequenceError`]: per-direction sequence numbering
//! - [`LinkError`]: what an endpoint reports to its driver, wrapping the
//!   above plus framing, state and transport failures
//!
//! Every [`LinkError`] maps onto one [`ErrorClass`], which tells the owner of
//! the connection what the failure costs: a framing error drops one
//! datagram, a handshake error restarts the exchange, a crypto error drops
//! one message until the session is declared desynchronized.

use std::{fmt, io, net::SocketAddr, time::Duration};

use nms_proto::ProtocolError;
use thiserror::Error;

use crate::handshake::HandshakeState;

/// Failures of the key exchange.
///
/// All variants are fatal to the handshake attempt. None of them may lead to
/// an established session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Peer sent a public key of the wrong length
    #[error("malformed public key: {len} bytes, expected 32")]
    MalformedPublicKey {
        /// Length received
        len: usize,
    },

    /// Key agreement with a low-order point yields a predictable secret
    #[error("key agreement produced a non-contributory secret")]
    NonContributory,

    /// Challenge or confirmation of the wrong length
    #[error("malformed challenge: {len} bytes, expected 32")]
    MalformedChallenge {
        /// Length received
        len: usize,
    },

    /// Confirmation does not match the secret and the claimed address
    #[error("challenge confirmation failed")]
    ConfirmationFailed,

    /// Confirmation arrived from an address other than the one challenged
    #[error("challenge bound to {bound}, confirmation claimed from {claimed}")]
    AddressMismatch {
        /// Address the challenge was issued for
        bound: SocketAddr,
        /// Address the confirmation came from
        claimed: SocketAddr,
    },

    /// Step not valid in the current handshake state
    #[error("cannot {operation} in handshake state {state:?}")]
    InvalidState {
        /// State when the step was attempted
        state: HandshakeState,
        /// Step that was attempted
        operation: &'static str,
    },

    /// Key schedule could not produce the requested output
    #[error("key derivation failed")]
    KeyDerivation,
}

/// Failures of authenticated encryption under a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("failed to seal payload")]
    SealFailed,

    /// Authentication tag did not verify; ciphertext, nonce or AAD altered
    #[error("failed to open payload: authentication failed")]
    OpenFailed,

    /// Too many consecutive open failures; the session must be discarded
    #[error("session desynchronized after {failures} consecutive decryption failures")]
    Desynchronized {
        /// Consecutive failures observed
        failures: u32,
    },
}

/// Failures of sequence numbering.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceError {
    /// The send counter reached `u32::MAX`; numbers never wrap
    #[error("sequence numbers exhausted; session must be renegotiated")]
    Exhausted,
}

/// Coarse classification of a [`LinkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed datagram; drop it, keep the connection
    Framing,
    /// Failed key exchange; restart from INIT or tear down
    Handshake,
    /// Failed encryption or decryption; drop the message
    Crypto,
    /// Operation or datagram not valid in the current state
    State,
    /// Transport failure or timeout
    Transport,
}

/// Errors an endpoint reports to its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Datagram could not be decoded
    Protocol(ProtocolError),

    /// Key exchange failed
    Handshake(HandshakeError),

    /// Payload could not be sealed or opened
    Crypto(CryptoError),

    /// Sequence space exhausted
    Sequence(SequenceError),

    /// Operation attempted in the wrong state
    InvalidState {
        /// State when the operation was attempted
        state: HandshakeState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Datagram kind not expected in the current state
    UnexpectedDatagram {
        /// State when the datagram arrived
        state: HandshakeState,
        /// Family of the datagram
        family: &'static str,
        /// Type tag of the datagram
        tag: u32,
    },

    /// Datagram from a peer with no handshake in progress
    UnknownPeer(SocketAddr),

    /// Responder already holds its limit of half-open handshakes
    TooManyHandshakes {
        /// Configured limit
        limit: usize,
    },

    /// Decrypted payload is not the expected application message
    InvalidPayload {
        /// Payload type that was expected
        expected: &'static str,
    },

    /// Handshake did not complete within the timeout
    HandshakeTimeout {
        /// How long we waited
        elapsed: Duration,
    },

    /// No inbound traffic for longer than the idle timeout
    IdleTimeout {
        /// How long the link was idle
        elapsed: Duration,
    },

    /// Underlying transport error
    Transport(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(err) => write!(f, "protocol error: {}", err),
            Self::Handshake(err) => write!(f, "handshake error: {}", err),
            Self::Crypto(err) => write!(f, "crypto error: {}", err),
            Self::Sequence(err) => write!(f, "sequence error: {}", err),
            Self::InvalidState { state, operation } => {
                write!(f, "invalid state transition: cannot {} from {:?}", operation, state)
            },
            Self::UnexpectedDatagram { state, family, tag } => {
                write!(f, "unexpected {} datagram: type {} in state {:?}", family, tag, state)
            },
            Self::UnknownPeer(addr) => write!(f, "no handshake in progress with {}", addr),
            Self::TooManyHandshakes { limit } => {
                write!(f, "too many pending handshakes (limit {})", limit)
            },
            Self::InvalidPayload { expected } => write!(f, "invalid payload: expected {}", expected),
            Self::HandshakeTimeout { elapsed } => write!(f, "handshake timeout after {:?}", elapsed),
            Self::IdleTimeout { elapsed } => write!(f, "idle timeout after {:?}", elapsed),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for LinkError {}

impl LinkError {
    /// Which layer of the taxonomy the error belongs to.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Protocol(_) => ErrorClass::Framing,
            Self::Handshake(_) | Self::TooManyHandshakes { .. } => ErrorClass::Handshake,
            Self::Crypto(_) | Self::InvalidPayload { .. } => ErrorClass::Crypto,
            Self::Sequence(_)
            | Self::InvalidState { .. }
            | Self::UnexpectedDatagram { .. }
            | Self::UnknownPeer(_) => ErrorClass::State,
            Self::HandshakeTimeout { .. } | Self::IdleTimeout { .. } | Self::Transport(_) => {
                ErrorClass::Transport
            },
        }
    }

    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Timeouts and a full handshake table clear up on their own. Protocol
    /// violations and failed authentication never do.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout { .. } | Self::IdleTimeout { .. } | Self::TooManyHandshakes { .. }
        )
    }

    /// True if the session this error arose in must be discarded.
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::Desynchronized { .. })
                | Self::Sequence(SequenceError::Exhausted)
                | Self::IdleTimeout { .. }
        )
    }
}

impl From<ProtocolError> for LinkError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl From<HandshakeError> for LinkError {
    fn from(err: HandshakeError) -> Self {
        Self::Handshake(err)
    }
}

impl From<CryptoError> for LinkError {
    fn from(err: CryptoError) -> Self {
        Self::Crypto(err)
    }
}

impl From<SequenceError> for LinkError {
    fn from(err: SequenceError) -> Self {
        Self::Sequence(err)
    }
}

/// Convert io::Error to LinkError (for transport errors)
impl From<io::Error> for LinkError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Boundary conversion for async I/O APIs.
impl From<LinkError> for io::Error {
    fn from(err: LinkError) -> Self {
        let kind = match err.class() {
            ErrorClass::Framing | ErrorClass::Crypto | ErrorClass::State => {
                io::ErrorKind::InvalidData
            },
            ErrorClass::Handshake => io::ErrorKind::PermissionDenied,
            ErrorClass::Transport => match err {
                LinkError::HandshakeTimeout { .. } | LinkError::IdleTimeout { .. } => {
                    io::ErrorKind::TimedOut
                },
                _ => io::ErrorKind::Other,
            },
        };
        io::Error::new(kind, err.to_string())
    }
}

/// Convenient Result type alias for endpoint operations
pub type Result<T> = std::result::Result<T, LinkError>;
