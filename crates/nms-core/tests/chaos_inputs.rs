//! Hostile input never panics an endpoint
//!
//! Random bytes, truncated datagrams, replayed traffic and rewritten headers
//! are fed to every endpoint in every state. Errors are fine; panics and
//! silently corrupted state are not.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use nms_core::{
    Agent, AgentAction, AgentConfig, AlertDesk, Collector, CollectorAction, CollectorConfig,
    FlowPeer, HandshakeState, LinkConfig, channel::NetTaskLink, env::Environment,
    sequence::Delivery,
};
use nms_proto::{
    Datagram, KeyOffer, NetTaskBody, NetTaskDatagram, NetTaskHeader, SealedPayload,
    payloads::{AlertConditions, MetricsReport, TaskSpec},
};
use proptest::prelude::*;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

#[derive(Clone)]
struct TestEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl TestEnv {
    fn new(seed: u64) -> Self {
        Self { rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))) }
    }
}

impl Environment for TestEnv {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        Instant::now()
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap().fill_bytes(buffer);
    }
}

fn collector_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 9000))
}

fn agent_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::new(10, 0, 0, 2), 40_000))
}

fn collector() -> Collector {
    Collector::new(CollectorConfig {
        link: LinkConfig::default(),
        default_task: TaskSpec {
            task_id: 1,
            frequency_secs: 60,
            device_metrics: Vec::new(),
            link_probes: Vec::new(),
            alert_conditions: AlertConditions::default(),
        },
        tasks: Default::default(),
    })
}

fn agent(now: Instant) -> Agent {
    Agent::new(
        AgentConfig {
            agent_id: 1,
            collector: collector_addr(),
            local_addr: agent_addr(),
            link: LinkConfig::default(),
        },
        now,
    )
}

/// Run registration to completion between a fresh agent and collector.
fn establish(env: &TestEnv, now: Instant) -> (Agent, Collector) {
    let mut agent = agent(now);
    let mut collector = collector();

    let mut to_collector = agent.register(env, now).unwrap();
    while !to_collector.is_empty() {
        let mut to_agent = Vec::new();
        for action in to_collector {
            let AgentAction::Send(datagram) = action else { continue };
            let bytes = datagram.encode().unwrap();
            for action in collector.handle_datagram(env, &bytes, agent_addr(), now).unwrap() {
                if let CollectorAction::Send { datagram, .. } = action {
                    to_agent.push(datagram);
                }
            }
        }

        to_collector = Vec::new();
        for datagram in to_agent {
            let bytes = datagram.encode().unwrap();
            to_collector.extend(agent.handle_datagram(env, &bytes, collector_addr(), now).unwrap());
        }
    }

    assert_eq!(agent.state(), HandshakeState::Established);
    assert_eq!(collector.peer_state(agent_addr()), Some(HandshakeState::Established));
    (agent, collector)
}

/// Valid NetTask framing around arbitrary body bytes.
fn framed_nettask() -> impl Strategy<Value = Vec<u8>> {
    (1u32..=7, any::<u32>(), any::<u32>(), prop::collection::vec(any::<u8>(), 0..128)).prop_map(
        |(tag, sequence, ack, body)| {
            let mut bytes = b"NTSK".to_vec();
            bytes.extend_from_slice(&1u32.to_be_bytes());
            bytes.extend_from_slice(&sequence.to_be_bytes());
            bytes.extend_from_slice(&ack.to_be_bytes());
            bytes.extend_from_slice(&tag.to_be_bytes());
            bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
            bytes.extend_from_slice(&body);
            bytes
        },
    )
}

#[test]
fn prop_collector_survives_random_input() {
    proptest!(|(
        seed in any::<u64>(),
        inputs in prop::collection::vec(
            prop_oneof![prop::collection::vec(any::<u8>(), 0..256), framed_nettask()],
            1..32,
        ),
    )| {
        let env = TestEnv::new(seed);
        let now = Instant::now();
        let mut collector = collector();

        for bytes in &inputs {
            let _ = collector.handle_datagram(&env, bytes, agent_addr(), now);
        }

        // Garbage can at most open a handshake, never finish one
        prop_assert_eq!(collector.established_peers().count(), 0);
        prop_assert!(collector.pending_handshakes() <= 1);
    });
}

#[test]
fn prop_agent_survives_random_input() {
    proptest!(|(
        seed in any::<u64>(),
        inputs in prop::collection::vec(
            prop_oneof![prop::collection::vec(any::<u8>(), 0..256), framed_nettask()],
            1..32,
        ),
    )| {
        let env = TestEnv::new(seed);
        let now = Instant::now();
        let mut agent = agent(now);
        agent.register(&env, now).unwrap();

        for bytes in &inputs {
            let _ = agent.handle_datagram(&env, bytes, collector_addr(), now);
        }

        prop_assert_ne!(agent.state(), HandshakeState::Established);
        prop_assert!(agent.task().is_none());
    });
}

#[test]
fn prop_flow_peers_survive_random_input() {
    proptest!(|(seed in any::<u64>(), inputs in prop::collection::vec(
        prop::collection::vec(any::<u8>(), 0..256),
        1..32,
    ))| {
        let env = TestEnv::new(seed);
        let now = Instant::now();
        let mut initiator =
            FlowPeer::initiator(&env, agent_addr(), collector_addr(), LinkConfig::default(), now);
        let mut responder =
            FlowPeer::responder(&env, collector_addr(), agent_addr(), LinkConfig::default(), now);
        initiator.connect(now).unwrap();

        for bytes in &inputs {
            let _ = initiator.handle_datagram(&env, bytes, collector_addr(), now);
            let _ = responder.handle_datagram(&env, bytes, agent_addr(), now);
        }

        prop_assert_ne!(initiator.state(), HandshakeState::Established);
        prop_assert_ne!(responder.state(), HandshakeState::Established);
    });
}

#[test]
fn prop_alert_desk_survives_random_input() {
    let chunk = prop::collection::vec(any::<u8>(), 0..64);
    proptest!(|(chunks in prop::collection::vec(chunk, 1..16))| {
        let mut desk = AlertDesk::new();
        for chunk in &chunks {
            if desk.handle(chunk).is_err() {
                break;
            }
        }
    });
}

#[test]
fn prop_link_numbers_outbound_contiguously() {
    proptest!(|(count in 1usize..500)| {
        let mut link = NetTaskLink::new();
        let offer = KeyOffer { public_key: bytes::Bytes::from_static(&[1u8; 32]) };

        for expected in 1..=count as u32 {
            let datagram = link.outbound(NetTaskBody::RequestRegister(offer.clone())).unwrap();
            prop_assert_eq!(datagram.header.sequence, expected);
        }
        prop_assert_eq!(link.last_sent(), count as u32);
    });
}

#[test]
fn prop_duplicates_are_identified() {
    proptest!(|(
        sequences in prop::collection::vec(1u32..200, 1..200),
    )| {
        let mut link = NetTaskLink::new();
        let mut seen = std::collections::HashSet::new();
        let mut highest = 0u32;

        for sequence in sequences {
            let header = NetTaskHeader { sequence, acknowledgement: 0 };
            let delivery = link.classify(&header);
            link.commit(&header);
            let in_window = highest <= 64 || sequence >= highest - 64;

            if seen.contains(&sequence) {
                prop_assert!(!delivery.is_fresh(), "replayed {} was accepted", sequence);
            } else if in_window {
                prop_assert!(delivery.is_fresh(), "new {} was rejected", sequence);
            } else {
                prop_assert_eq!(delivery, Delivery::Stale);
            }

            if delivery.is_fresh() {
                seen.insert(sequence);
                highest = highest.max(sequence);
            }
            prop_assert_eq!(link.acknowledgement(), highest);
        }
    });
}

#[test]
fn replayed_handshake_traffic_is_ignored() {
    let env = TestEnv::new(9);
    let now = Instant::now();
    let mut collector = collector();
    let mut agent = agent(now);

    let actions = agent.register(&env, now).unwrap();
    let AgentAction::Send(register) = &actions[0] else {
        panic!("expected REQUEST_REGISTER");
    };
    let register = register.encode().unwrap();
    collector.handle_datagram(&env, &register, agent_addr(), now).unwrap();

    // A later datagram with a sequence the collector already holds is dropped
    let replay = NetTaskDatagram::new(
        NetTaskHeader { sequence: 0, acknowledgement: 0 },
        NetTaskBody::RequestTask(SealedPayload::from_parts([0; 12], &[0; 16]).unwrap()),
    );
    let actions =
        collector.handle_datagram(&env, &replay.encode().unwrap(), agent_addr(), now).unwrap();
    assert!(actions.is_empty());
    assert_eq!(collector.peer_state(agent_addr()), Some(HandshakeState::KeySent));
}

#[test]
fn prop_rewritten_nettask_headers_never_authenticate() {
    proptest!(|(seed in any::<u64>(), sequence_delta in any::<u32>(), ack_delta in any::<u32>())| {
        prop_assume!(sequence_delta != 0 || ack_delta != 0);
        let env = TestEnv::new(seed);
        let now = Instant::now();
        let (mut agent, mut collector) = establish(&env, now);

        let report = MetricsReport { task_id: 1, timestamp_ms: 5, samples: Vec::new() };
        let actions = agent.send_metrics(&env, &report).unwrap();
        let [AgentAction::Send(genuine)] = actions.as_slice() else {
            panic!("expected RESPONSE_METRICS, got {actions:?}");
        };

        let link = collector.link(agent_addr()).unwrap();
        let (acknowledgement, unacked) = (link.acknowledgement(), link.unacked());

        let mut forged = genuine.clone();
        forged.header.sequence = forged.header.sequence.wrapping_add(sequence_delta);
        forged.header.acknowledgement = forged.header.acknowledgement.wrapping_add(ack_delta);
        let result =
            collector.handle_datagram(&env, &forged.encode().unwrap(), agent_addr(), now);

        prop_assert!(
            !matches!(result.as_deref(), Ok([CollectorAction::MetricsReceived { .. }])),
            "rewritten header was accepted: {:?}",
            forged.header
        );
        let link = collector.link(agent_addr()).unwrap();
        prop_assert_eq!(link.acknowledgement(), acknowledgement);
        prop_assert_eq!(link.unacked(), unacked);

        // The untouched datagram still goes through
        let actions =
            collector.handle_datagram(&env, &genuine.encode().unwrap(), agent_addr(), now).unwrap();
        prop_assert!(
            matches!(actions.as_slice(), [CollectorAction::MetricsReceived { .. }]),
            "genuine datagram was refused: {:?}",
            actions
        );
    });
}
