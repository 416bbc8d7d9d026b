//! Environment abstraction for deterministic testing.
//!
//! Endpoint state machines never read the clock or the OS entropy pool on
//! their own. Time is passed in as a parameter and randomness (ephemeral
//! keys, salts, challenge nonces, AEAD nonces) comes from an [`Environment`],
//! so a seeded environment replays a whole fleet run byte for byte.
//!
//! Two implementations exist:
//!
//! 1. [`SystemEnv`] (here): real clock, OS entropy
//! 2. `SimEnv` (nms-harness): turmoil virtual time, seeded ChaCha20
//!
//! # Invariants
//!
//! - Monotonicity: `env.now()` never goes backwards
//! - Determinism: given the same seed, `random_bytes()` yields the same
//!   sequence
//! - Isolation: implementations share no global state

use std::time::Duration;

use rand::{RngCore, rngs::OsRng};

/// Abstract environment providing time, randomness, and async sleeping.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// 1. Time monotonicity: `now()` never goes backwards
/// 2. RNG quality: `random_bytes()` draws from a cryptographically secure
///    source outside simulation, since it seeds key material
pub trait Environment: Clone + Send + Sync + 'static {
    /// Point in time; comparable and subtractable for timeout logic.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Returns the current time.
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only drivers sleep. State machines report deadlines through `tick`
    /// instead.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random fixed-size array.
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }
}

/// Production environment: system clock, tokio sleep and OS entropy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        OsRng.fill_bytes(buffer);
    }
}
