//! Link configuration shared by every endpoint.

use std::time::Duration;

/// Timeouts and resource bounds for one endpoint.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Time allowed to go from the first key offer to an established session
    pub handshake_timeout: Duration,
    /// Established session is dropped after this long without inbound traffic
    pub idle_timeout: Duration,
    /// Upper bound on half-open handshakes a responder keeps at once
    pub max_pending_handshakes: usize,
    /// Consecutive decryption failures after which a session is discarded
    pub max_decrypt_failures: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            max_pending_handshakes: 1024,
            max_decrypt_failures: 3,
        }
    }
}
