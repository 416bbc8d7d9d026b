//! Fleet protocol core logic
//!
//! Pure state machines for the monitoring fleet: key exchange, sessions,
//! sequence tracking and the four endpoints that drive them. Nothing in this
//! crate opens a socket or reads the clock on its own.
//!
//! # Architecture
//!
//! ```text
//!      ┌────────────────────────────────┐
//!      │ nms-core                       │
//!      │ - Handshake / session          │
//!      │ - Agent, Collector, FlowPeer   │
//!      │ - AlertDesk                    │
//!      └────────────────────────────────┘
//!         ↓                        ↓
//! ┌──────────────────┐  ┌──────────────────┐
//! │ nms-harness      │  │ tokio transports │
//! │ (Turmoil)        │  │ (transport.rs)   │
//! │ - Virtual time   │  │ - Real sockets   │
//! │ - Seeded RNG     │  │ - System clock   │
//! │ - Fault inject   │  │ - OS entropy     │
//! └──────────────────┘  └──────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - No I/O in state machines: endpoints return actions, drivers perform
//!   them
//! - Environment trait: randomness (keys, salts, nonces) comes from an
//!   [`env::Environment`], time is passed in
//! - No sealed payload without a [`session::Session`], and no session
//!   without a verified challenge
//!
//! # Modules
//!
//! - [`crypto`]: X25519, HKDF key schedule, address-bound challenges
//! - [`handshake`]: initiator and responder state machines
//! - [`session`]: AES-256-GCM sealing with desync detection
//! - [`sequence`]: per-direction numbering and the receive window
//! - [`channel`]: NetTask numbering plus typed payload sealing
//! - [`agent`], [`collector`]: the NetTask endpoints
//! - [`flow`]: the Netflow peer
//! - [`alert`]: AlertFlow over a stream
//! - [`transport`]: datagram and stream transport traits

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod agent;
pub mod alert;
pub mod channel;
pub mod collector;
pub mod config;
pub mod crypto;
pub mod env;
pub mod error;
pub mod flow;
pub mod handshake;
pub mod sequence;
pub mod session;
pub mod transport;

pub use agent::{Agent, AgentAction, AgentConfig};
pub use alert::{AlertAction, AlertDesk, raise_alert};
pub use collector::{Collector, CollectorAction, CollectorConfig};
pub use config::LinkConfig;
pub use env::{Environment, SystemEnv};
pub use error::{CryptoError, ErrorClass, HandshakeError, LinkError, Result, SequenceError};
pub use flow::{FlowAction, FlowPeer, FlowRole};
pub use handshake::{HandshakeState, Initiator, Responder};
pub use session::Session;

#[cfg(test)]
pub(crate) mod testing {
    use std::net::{Ipv4Addr, SocketAddr};

    use crate::{
        env::SystemEnv,
        handshake::{Initiator, Responder},
        session::Session,
    };

    /// Run an honest handshake and return `(initiator, responder)` sessions
    pub(crate) fn session_pair() -> (Session, Session) {
        let env = SystemEnv;
        let initiator_addr = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 2), 40_000));
        let responder_addr = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 9000));

        let mut initiator = Initiator::new(&env, 3);
        let mut responder = Responder::new(&env, 3);

        let offer = initiator.offer().unwrap();
        let challenge = responder.on_offer(&env, &offer, initiator_addr).unwrap();
        let (response, initiator_session) =
            initiator.on_challenge(&challenge, initiator_addr, responder_addr).unwrap();
        let responder_session = responder.on_response(&response, initiator_addr).unwrap();

        (initiator_session, responder_session)
    }
}
