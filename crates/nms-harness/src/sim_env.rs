//! Turmoil-backed environment with a seeded RNG.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use nms_core::env::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Simulation environment: turmoil's virtual clock plus ChaCha20 randomness.
///
/// Every ephemeral key, salt, challenge nonce and AEAD nonce an endpoint
/// draws comes from here, so two runs with the same seed put the same bytes
/// on the simulated wire.
///
/// Clones share one RNG stream. Give each simulated host its own `SimEnv`
/// (for example `SimEnv::with_seed(base + host_index)`) when the order in
/// which hosts are polled should not matter.
///
/// # Panics
///
/// `sleep()` must run inside a turmoil host or a tokio runtime.
#[derive(Clone)]
pub struct SimEnv {
    // Turmoil runs hosts on one thread, the lock never contends
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl SimEnv {
    /// Environment seeded with 0
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment seeded with `seed`
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))) }
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv").finish_non_exhaustive()
    }
}

impl Environment for SimEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now().into()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn random_bytes(&self, dest: &mut [u8]) {
        self.rng
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .fill_bytes(dest);
    }
}
