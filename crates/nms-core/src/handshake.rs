//! ECDHE key exchange with an address-bound challenge.
//!
//! Both Netflow and NetTask run the same three-step exchange; only the
//! datagram kinds differ. The two halves live here as pure state machines
//! that consume and produce the handshake bodies from `nms_proto::handshake`.
//!
//! # State Machine (initiator)
//!
//! ```text
//! ┌──────┐ offer ┌─────────┐ on_challenge ┌────────────────────┐ authenticated ┌─────────────┐
//! │ Init │──────>│ KeySent │─────────────>│ ChallengeResponded │──────────────>│ Established │
//! └──────┘       └─────────┘              └────────────────────┘   traffic     └─────────────┘
//!                     │ malformed / bad key
//!                     ↓
//!                ┌────────┐
//!                │ Failed │
//!                └────────┘
//! ```
//!
//! The responder goes `Init → KeySent` when it answers an offer and
//! `KeySent → Established` (or `Failed`) when it checks the confirmation.
//! A failed handshake never yields a [`Session`].

use std::net::SocketAddr;

use bytes::Bytes;
use nms_proto::{ChallengeResponse, KeyChallenge, KeyOffer};

use crate::{
    crypto::{CHALLENGE_LEN, CHALLENGE_NONCE_LEN, KeyPair, PUBLIC_KEY_LEN, SALT_LEN, SessionKeys},
    env::Environment,
    error::HandshakeError,
    session::Session,
};

/// Handshake progress of one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Nothing sent or received yet
    Init,
    /// Initiator: offer sent. Responder: challenge sent.
    KeySent,
    /// Initiator: confirmation sent, awaiting first authenticated traffic
    ChallengeResponded,
    /// Session keys agreed and confirmed
    Established,
    /// Attempt aborted; start over with a fresh handshake
    Failed,
}

/// Initiating side (agent, or the Netflow peer that says hello first).
#[derive(Debug)]
pub struct Initiator {
    state: HandshakeState,
    keys: KeyPair,
    max_decrypt_failures: u32,
}

impl Initiator {
    /// Create an initiator with a fresh ephemeral key pair.
    pub fn new<E: Environment>(env: &E, max_decrypt_failures: u32) -> Self {
        Self { state: HandshakeState::Init, keys: KeyPair::generate(env), max_decrypt_failures }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Produce the key offer. `Init → KeySent`.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::InvalidState`] unless in `Init`.
    pub fn offer(&mut self) -> Result<KeyOffer, HandshakeError> {
        self.expect(HandshakeState::Init, "send key offer")?;
        self.state = HandshakeState::KeySent;
        Ok(KeyOffer { public_key: Bytes::copy_from_slice(&self.keys.public_bytes()) })
    }

    /// Answer the responder's challenge. `KeySent → ChallengeResponded`.
    ///
    /// `own_address` is this side's address as the responder sees it; the
    /// confirmation is bound to it. The returned session is usable at once,
    /// but the handshake only counts as established after
    /// [`Initiator::mark_established`].
    ///
    /// # Errors
    ///
    /// Any failure moves the handshake to `Failed`:
    /// - [`HandshakeError::InvalidState`] unless in `KeySent`
    /// - [`HandshakeError::MalformedPublicKey`] or
    ///   [`HandshakeError::NonContributory`] for a bad responder key
    /// - [`HandshakeError::MalformedChallenge`] for a challenge of the wrong
    ///   length
    pub fn on_challenge(
        &mut self,
        challenge: &KeyChallenge,
        own_address: SocketAddr,
        peer: SocketAddr,
    ) -> Result<(ChallengeResponse, Session), HandshakeError> {
        self.expect(HandshakeState::KeySent, "answer challenge")?;

        let result = self.confirm(challenge, own_address, peer);
        self.state = match result {
            Ok(_) => HandshakeState::ChallengeResponded,
            Err(_) => HandshakeState::Failed,
        };
        result
    }

    fn confirm(
        &self,
        challenge: &KeyChallenge,
        own_address: SocketAddr,
        peer: SocketAddr,
    ) -> Result<(ChallengeResponse, Session), HandshakeError> {
        let local_public = self.keys.public_bytes();
        let peer_public = public_key_array(&challenge.public_key)?;

        let shared = self.keys.agree(&peer_public)?;
        let keys = SessionKeys::derive(&shared, &challenge.salt, &local_public, &peer_public)?;
        let confirmation = keys.confirm_challenge(&challenge.challenge, own_address)?;

        let session = Session::new(
            keys,
            peer,
            local_public,
            peer_public,
            challenge.salt.to_vec(),
            self.max_decrypt_failures,
        );
        Ok((ChallengeResponse { challenge: Bytes::copy_from_slice(&confirmation) }, session))
    }

    /// First authenticated traffic arrived. `ChallengeResponded →
    /// Established`.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::InvalidState`] unless in
    /// `ChallengeResponded` or already `Established`.
    pub fn mark_established(&mut self) -> Result<(), HandshakeError> {
        if self.state == HandshakeState::Established {
            return Ok(());
        }
        self.expect(HandshakeState::ChallengeResponded, "mark established")?;
        self.state = HandshakeState::Established;
        Ok(())
    }

    fn expect(&self, state: HandshakeState, operation: &'static str) -> Result<(), HandshakeError> {
        if self.state == state {
            Ok(())
        } else {
            Err(HandshakeError::InvalidState { state: self.state, operation })
        }
    }
}

/// Challenge issued to one initiator, kept until its confirmation arrives.
struct PendingChallenge {
    keys: SessionKeys,
    challenge: [u8; CHALLENGE_LEN],
    bound: SocketAddr,
    salt: [u8; SALT_LEN],
    initiator_public: [u8; PUBLIC_KEY_LEN],
}

/// Responding side (collector, or the Netflow peer that answers hello).
pub struct Responder {
    state: HandshakeState,
    keys: KeyPair,
    pending: Option<PendingChallenge>,
    max_decrypt_failures: u32,
}

impl Responder {
    /// Create a responder with a fresh ephemeral key pair.
    pub fn new<E: Environment>(env: &E, max_decrypt_failures: u32) -> Self {
        Self {
            state: HandshakeState::Init,
            keys: KeyPair::generate(env),
            pending: None,
            max_decrypt_failures,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Answer a key offer from `peer`. `Init → KeySent`.
    ///
    /// Draws a fresh salt and challenge nonce from `env`, runs the key
    /// schedule and binds the challenge to `peer`.
    ///
    /// # Errors
    ///
    /// Any failure moves the handshake to `Failed`:
    /// - [`HandshakeError::InvalidState`] unless in `Init`
    /// - [`HandshakeError::MalformedPublicKey`] or
    ///   [`HandshakeError::NonContributory`] for a bad initiator key
    pub fn on_offer<E: Environment>(
        &mut self,
        env: &E,
        offer: &KeyOffer,
        peer: SocketAddr,
    ) -> Result<KeyChallenge, HandshakeError> {
        if self.state != HandshakeState::Init {
            return Err(HandshakeError::InvalidState {
                state: self.state,
                operation: "answer key offer",
            });
        }

        match self.challenge(env, offer, peer) {
            Ok((pending, reply)) => {
                self.pending = Some(pending);
                self.state = HandshakeState::KeySent;
                Ok(reply)
            },
            Err(err) => {
                self.state = HandshakeState::Failed;
                Err(err)
            },
        }
    }

    fn challenge<E: Environment>(
        &self,
        env: &E,
        offer: &KeyOffer,
        peer: SocketAddr,
    ) -> Result<(PendingChallenge, KeyChallenge), HandshakeError> {
        let initiator_public = public_key_array(&offer.public_key)?;
        let responder_public = self.keys.public_bytes();

        let shared = self.keys.agree(&initiator_public)?;
        let salt: [u8; SALT_LEN] = env.random_array();
        let keys = SessionKeys::derive(&shared, &salt, &initiator_public, &responder_public)?;

        let nonce: [u8; CHALLENGE_NONCE_LEN] = env.random_array();
        let challenge = keys.issue_challenge(peer, &nonce)?;

        let reply = KeyChallenge {
            public_key: Bytes::copy_from_slice(&responder_public),
            challenge: Bytes::copy_from_slice(&challenge),
            salt: Bytes::copy_from_slice(&salt),
        };
        Ok((PendingChallenge { keys, challenge, bound: peer, salt, initiator_public }, reply))
    }

    /// Check the initiator's confirmation. `KeySent → Established`.
    ///
    /// `claimed` is the source address the confirmation arrived from. It must
    /// equal the address the challenge was bound to, and the confirmation
    /// must re-derive over it.
    ///
    /// # Errors
    ///
    /// Any failure moves the handshake to `Failed` and discards the pending
    /// key material:
    /// - [`HandshakeError::InvalidState`] unless in `KeySent`
    /// - [`HandshakeError::AddressMismatch`] for a different source address
    /// - [`HandshakeError::MalformedChallenge`] or
    ///   [`HandshakeError::ConfirmationFailed`] for a bad confirmation
    pub fn on_response(
        &mut self,
        response: &ChallengeResponse,
        claimed: SocketAddr,
    ) -> Result<Session, HandshakeError> {
        let pending = match (self.state, self.pending.take()) {
            (HandshakeState::KeySent, Some(pending)) => pending,
            (state, _) => {
                return Err(HandshakeError::InvalidState { state, operation: "verify confirmation" });
            },
        };

        if pending.bound != claimed {
            self.state = HandshakeState::Failed;
            return Err(HandshakeError::AddressMismatch { bound: pending.bound, claimed });
        }

        if let Err(err) =
            pending.keys.verify_confirmation(&pending.challenge, claimed, &response.challenge)
        {
            self.state = HandshakeState::Failed;
            return Err(err);
        }

        self.state = HandshakeState::Established;
        let PendingChallenge { keys, bound, salt, initiator_public, .. } = pending;
        Ok(Session::new(
            keys,
            bound,
            self.keys.public_bytes(),
            initiator_public,
            salt.to_vec(),
            self.max_decrypt_failures,
        ))
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("state", &self.state)
            .field("bound", &self.pending.as_ref().map(|p| p.bound))
            .finish_non_exhaustive()
    }
}

fn public_key_array(bytes: &[u8]) -> Result<[u8; PUBLIC_KEY_LEN], HandshakeError> {
    bytes.try_into().map_err(|_| HandshakeError::MalformedPublicKey { len: bytes.len() })
}
