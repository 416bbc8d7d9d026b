//! Established session: authenticated encryption under the derived key.
//!
//! A [`Session`] exists only as the product of a completed key exchange, and
//! sealed datagrams can only be built or opened through one. That is how the
//! rule "no secure datagram without a session" is enforced: there is no other
//! constructor for the key material.
//!
//! Payloads are sealed with AES-256-GCM under a fresh random 96-bit nonce.
//! The caller supplies the associated data: every cleartext header field that
//! must not be rewritten in flight. Netflow uses [`associated_data`]
//! (`signature ‖ type tag`); NetTask extends it with the version, sequence and
//! acknowledgement numbers.

use std::net::SocketAddr;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use nms_proto::{SealedPayload, Signature};

use crate::{
    crypto::{PUBLIC_KEY_LEN, SessionKeys},
    env::Environment,
    error::CryptoError,
};

/// Shared secret and peer identity resulting from a completed handshake.
pub struct Session {
    keys: SessionKeys,
    cipher: Aes256Gcm,
    peer: SocketAddr,
    local_public: [u8; PUBLIC_KEY_LEN],
    peer_public: [u8; PUBLIC_KEY_LEN],
    salt: Vec<u8>,
    consecutive_failures: u32,
    max_failures: u32,
}

impl Session {
    pub(crate) fn new(
        keys: SessionKeys,
        peer: SocketAddr,
        local_public: [u8; PUBLIC_KEY_LEN],
        peer_public: [u8; PUBLIC_KEY_LEN],
        salt: Vec<u8>,
        max_failures: u32,
    ) -> Self {
        let cipher = Aes256Gcm::new(keys.enc_key().into());
        Self {
            keys,
            cipher,
            peer,
            local_public,
            peer_public,
            salt,
            consecutive_failures: 0,
            max_failures,
        }
    }

    /// Peer this session was negotiated with
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Shared DH secret; identical on both sides of an honest handshake
    #[must_use]
    pub fn secret(&self) -> &[u8; 32] {
        self.keys.shared_secret()
    }

    /// Our public key
    #[must_use]
    pub fn local_public(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.local_public
    }

    /// Peer's public key
    #[must_use]
    pub fn peer_public(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.peer_public
    }

    /// Salt the key schedule was run with
    #[must_use]
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// True once the consecutive failure limit has been reached
    #[must_use]
    pub fn is_desynchronized(&self) -> bool {
        self.consecutive_failures >= self.max_failures
    }

    /// Encrypt `plaintext`, authenticating `aad` alongside it.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SealFailed`] if the cipher rejects the input.
    pub fn seal<E: Environment>(
        &self,
        env: &E,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<SealedPayload, CryptoError> {
        let nonce: [u8; SealedPayload::NONCE_LEN] = env.random_array();

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::SealFailed)?;

        SealedPayload::from_parts(nonce, &ciphertext).map_err(|_| CryptoError::SealFailed)
    }

    /// Decrypt a sealed payload whose header serializes to `aad`.
    ///
    /// A success resets the failure counter.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::OpenFailed`] if authentication fails
    /// - [`CryptoError::Desynchronized`] when that failure reaches the
    ///   configured limit, or for any call after it was reached
    pub fn open(&mut self, aad: &[u8], sealed: &SealedPayload) -> Result<Vec<u8>, CryptoError> {
        if self.is_desynchronized() {
            return Err(CryptoError::Desynchronized { failures: self.consecutive_failures });
        }

        let result = self
            .cipher
            .decrypt(Nonce::from_slice(sealed.nonce()), Payload { msg: sealed.ciphertext(), aad });

        match result {
            Ok(plaintext) => {
                self.consecutive_failures = 0;
                Ok(plaintext)
            },
            Err(_) => {
                self.consecutive_failures += 1;
                if self.is_desynchronized() {
                    Err(CryptoError::Desynchronized { failures: self.consecutive_failures })
                } else {
                    Err(CryptoError::OpenFailed)
                }
            },
        }
    }
}

/// `signature ‖ type tag`, big-endian.
#[must_use]
pub fn associated_data(signature: Signature, tag: u32) -> [u8; 8] {
    let mut aad = [0u8; 8];
    aad[..4].copy_from_slice(&signature);
    aad[4..].copy_from_slice(&tag.to_be_bytes());
    aad
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::{crypto::KeyPair, env::SystemEnv};

    fn session_pair(max_failures: u32) -> (Session, Session) {
        let env = SystemEnv;
        let a = KeyPair::generate(&env);
        let b = KeyPair::generate(&env);
        let salt = vec![1u8; 16];
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);

        let keys_a = SessionKeys::derive(
            &a.agree(&b.public_bytes()).unwrap(),
            &salt,
            &a.public_bytes(),
            &b.public_bytes(),
        )
        .unwrap();
        let keys_b = SessionKeys::derive(
            &b.agree(&a.public_bytes()).unwrap(),
            &salt,
            &a.public_bytes(),
            &b.public_bytes(),
        )
        .unwrap();

        (
            Session::new(keys_a, addr, a.public_bytes(), b.public_bytes(), salt.clone(), max_failures),
            Session::new(keys_b, addr, b.public_bytes(), a.public_bytes(), salt, max_failures),
        )
    }

    const TASK: [u8; 8] = *b"NTSK\0\0\0\x04";

    #[test]
    fn sealed_text_opens_on_the_other_side() {
        let (sender, mut receiver) = session_pair(3);
        let sealed = sender.seal(&SystemEnv, &TASK, b"frequency=60").unwrap();

        assert_eq!(sealed.len(), 12 + 12 + 16);
        assert_eq!(receiver.open(&TASK, &sealed).unwrap(), b"frequency=60");
    }

    #[test]
    fn associated_data_is_signature_then_tag() {
        assert_eq!(associated_data(*b"NTSK", 4), TASK);
    }

    #[test]
    fn nonces_are_fresh_per_message() {
        let (sender, _) = session_pair(3);
        let aad = associated_data(*b"NFLW", 4);
        let first = sender.seal(&SystemEnv, &aad, b"same").unwrap();
        let second = sender.seal(&SystemEnv, &aad, b"same").unwrap();

        assert_ne!(first.nonce(), second.nonce());
        assert_ne!(first, second);
    }

    #[test]
    fn associated_data_is_authenticated() {
        let (sender, mut receiver) = session_pair(3);
        let sealed = sender.seal(&SystemEnv, &TASK, b"task").unwrap();

        assert_eq!(
            receiver.open(&associated_data(*b"NTSK", 7), &sealed),
            Err(CryptoError::OpenFailed)
        );
        assert_eq!(
            receiver.open(&associated_data(*b"NFLW", 4), &sealed),
            Err(CryptoError::OpenFailed)
        );
        assert_eq!(receiver.open(b"", &sealed), Err(CryptoError::OpenFailed));
    }

    #[test]
    fn repeated_failures_desynchronize() {
        let (sender, mut receiver) = session_pair(3);
        let sealed = sender.seal(&SystemEnv, &TASK, b"metrics").unwrap();
        let mut forged = sealed.as_bytes().to_vec();
        forged[20] ^= 0x01;
        let forged = SealedPayload::from_wire(forged.into()).unwrap();

        assert_eq!(receiver.open(&TASK, &forged), Err(CryptoError::OpenFailed));
        assert_eq!(receiver.open(&TASK, &forged), Err(CryptoError::OpenFailed));
        assert_eq!(receiver.open(&TASK, &forged), Err(CryptoError::Desynchronized { failures: 3 }));
        assert!(receiver.is_desynchronized());

        let genuine = sender.seal(&SystemEnv, &TASK, b"metrics").unwrap();
        assert!(matches!(receiver.open(&TASK, &genuine), Err(CryptoError::Desynchronized { .. })));
    }

    #[test]
    fn success_resets_the_failure_count() {
        let (sender, mut receiver) = session_pair(2);
        let genuine = sender.seal(&SystemEnv, &TASK, b"ok").unwrap();
        let mut forged = genuine.as_bytes().to_vec();
        forged[0] ^= 0xFF;
        let forged = SealedPayload::from_wire(forged.into()).unwrap();

        assert_eq!(receiver.open(&TASK, &forged), Err(CryptoError::OpenFailed));
        assert!(receiver.open(&TASK, &genuine).is_ok());
        assert_eq!(receiver.open(&TASK, &forged), Err(CryptoError::OpenFailed));
        assert!(!receiver.is_desynchronized());
    }
}
