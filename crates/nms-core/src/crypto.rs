//! Cryptographic primitives behind the handshake and the session.
//!
//! - Key agreement: X25519 with ephemeral keys seeded from the
//!   [`Environment`]
//! - Key schedule: HKDF-SHA256 over the DH output, salted by the responder,
//!   with both public keys in the info string
//! - Challenge and confirmation: HMAC-SHA256 under the confirmation key,
//!   bound to socket addresses
//!
//! ```text
//! okm       = HKDF(salt, dh, "nms key schedule v1" ‖ pub_i ‖ pub_r)[..64]
//! enc_key   = okm[..32]
//! confirm   = okm[32..]
//! challenge = HMAC(confirm, "challenge" ‖ addr(initiator) ‖ nonce16)
//! response  = HMAC(confirm, "confirm" ‖ challenge ‖ addr(initiator))
//! ```
//!
//! The responder only accepts a response that re-derives against the
//! address the challenge was issued to. A transcript captured from one peer
//! therefore cannot be replayed from another address.

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use nms_proto::ByteWriter;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{env::Environment, error::HandshakeError};

type HmacSha256 = Hmac<Sha256>;

/// X25519 public key length
pub const PUBLIC_KEY_LEN: usize = 32;

/// Challenge and confirmation length (HMAC-SHA256 output)
pub const CHALLENGE_LEN: usize = 32;

/// Key-schedule salt length chosen by the responder
pub const SALT_LEN: usize = 16;

/// Fresh randomness mixed into every challenge
pub const CHALLENGE_NONCE_LEN: usize = 16;

const KEY_SCHEDULE_LABEL: &[u8] = b"nms key schedule v1";
const CHALLENGE_LABEL: &[u8] = b"challenge";
const CONFIRM_LABEL: &[u8] = b"confirm";

/// Ephemeral X25519 key pair.
///
/// The secret half is zeroized on drop.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a key pair from environment randomness.
    pub fn generate<E: Environment>(env: &E) -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        env.random_bytes(&mut seed[..]);

        let secret = StaticSecret::from(*seed);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key bytes as sent on the wire
    #[must_use]
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// Agree on a shared secret with `peer_public`.
    ///
    /// # Errors
    ///
    /// - [`HandshakeError::MalformedPublicKey`] unless `peer_public` is 32
    ///   bytes
    /// - [`HandshakeError::NonContributory`] for a low-order peer key
    pub fn agree(&self, peer_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, HandshakeError> {
        let peer = parse_public_key(peer_public)?;
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(HandshakeError::NonContributory);
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.as_bytes())
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Interpret wire bytes as an X25519 public key.
///
/// # Errors
///
/// Returns [`HandshakeError::MalformedPublicKey`] unless exactly 32 bytes.
pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, HandshakeError> {
    let raw: [u8; PUBLIC_KEY_LEN] =
        bytes.try_into().map_err(|_| HandshakeError::MalformedPublicKey { len: bytes.len() })?;
    Ok(PublicKey::from(raw))
}

/// Output of the key schedule.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    shared_secret: [u8; 32],
    enc_key: [u8; 32],
    confirm_key: [u8; 32],
}

impl SessionKeys {
    /// Run the key schedule.
    ///
    /// Both sides call this with the same argument order, so the initiator
    /// and responder public keys are always in initiator-first position.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::KeyDerivation`] if HKDF rejects the output
    /// length.
    pub fn derive(
        shared_secret: &[u8; 32],
        salt: &[u8],
        initiator_public: &[u8],
        responder_public: &[u8],
    ) -> Result<Self, HandshakeError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);

        let mut okm = Zeroizing::new([0u8; 64]);
        hk.expand_multi_info(
            &[KEY_SCHEDULE_LABEL, initiator_public, responder_public],
            &mut okm[..],
        )
        .map_err(|_| HandshakeError::KeyDerivation)?;

        let mut keys =
            Self { shared_secret: *shared_secret, enc_key: [0u8; 32], confirm_key: [0u8; 32] };
        keys.enc_key.copy_from_slice(&okm[..32]);
        keys.confirm_key.copy_from_slice(&okm[32..]);
        Ok(keys)
    }

    /// Raw DH output the keys were derived from
    #[must_use]
    pub fn shared_secret(&self) -> &[u8; 32] {
        &self.shared_secret
    }

    /// AEAD key
    #[must_use]
    pub fn enc_key(&self) -> &[u8; 32] {
        &self.enc_key
    }

    fn mac(&self) -> Result<HmacSha256, HandshakeError> {
        <HmacSha256 as Mac>::new_from_slice(&self.confirm_key)
            .map_err(|_| HandshakeError::KeyDerivation)
    }

    /// Responder: challenge bound to the initiator's address.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::KeyDerivation`] if the MAC cannot be keyed.
    pub fn issue_challenge(
        &self,
        initiator: SocketAddr,
        nonce: &[u8; CHALLENGE_NONCE_LEN],
    ) -> Result<[u8; CHALLENGE_LEN], HandshakeError> {
        let mut mac = self.mac()?;
        mac.update(CHALLENGE_LABEL);
        mac.update(&encode_address(initiator));
        mac.update(nonce);
        Ok(to_array(&mac.finalize().into_bytes()))
    }

    /// Initiator: confirmation of `challenge` over its own address.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::MalformedChallenge`] for a challenge of the
    /// wrong length.
    pub fn confirm_challenge(
        &self,
        challenge: &[u8],
        own_address: SocketAddr,
    ) -> Result<[u8; CHALLENGE_LEN], HandshakeError> {
        if challenge.len() != CHALLENGE_LEN {
            return Err(HandshakeError::MalformedChallenge { len: challenge.len() });
        }

        let mac = self.confirmation_mac(challenge, own_address)?;
        Ok(to_array(&mac.finalize().into_bytes()))
    }

    /// Responder: check a confirmation claimed from `claimed`.
    ///
    /// The comparison is constant-time.
    ///
    /// # Errors
    ///
    /// - [`HandshakeError::MalformedChallenge`] for a confirmation of the
    ///   wrong length
    /// - [`HandshakeError::ConfirmationFailed`] if it does not re-derive
    pub fn verify_confirmation(
        &self,
        challenge: &[u8],
        claimed: SocketAddr,
        confirmation: &[u8],
    ) -> Result<(), HandshakeError> {
        if confirmation.len() != CHALLENGE_LEN {
            return Err(HandshakeError::MalformedChallenge { len: confirmation.len() });
        }

        self.confirmation_mac(challenge, claimed)?
            .verify_slice(confirmation)
            .map_err(|_| HandshakeError::ConfirmationFailed)
    }

    fn confirmation_mac(
        &self,
        challenge: &[u8],
        address: SocketAddr,
    ) -> Result<HmacSha256, HandshakeError> {
        let mut mac = self.mac()?;
        mac.update(CONFIRM_LABEL);
        mac.update(challenge);
        mac.update(&encode_address(address));
        Ok(mac)
    }
}

fn to_array(tag: &[u8]) -> [u8; CHALLENGE_LEN] {
    let mut out = [0u8; CHALLENGE_LEN];
    out.copy_from_slice(tag);
    out
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

/// Address encoding used inside challenges: `u8 family ‖ octets ‖ u16 port`.
///
/// IPv4-mapped IPv6 addresses are encoded as IPv4 so dual-stack sockets
/// agree with plain IPv4 peers.
#[must_use]
pub fn encode_address(address: SocketAddr) -> Bytes {
    let mut writer = ByteWriter::new();

    let ip = match address.ip() {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    };

    match ip {
        IpAddr::V4(v4) => {
            writer.write(4u8).write(u32::from(v4));
        },
        IpAddr::V6(v6) => {
            let octets = u128::from(v6).to_be_bytes();
            writer.write(6u8).write_shared(Bytes::copy_from_slice(&octets));
        },
    }
    writer.write(address.port());
    writer.finish()
}
