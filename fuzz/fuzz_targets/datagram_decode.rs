//! Arbitrary bytes through every decoder.
//!
//! Decoding must never panic, and whatever decodes must survive a
//! re-encode unchanged. The alert stream buffer gets the same bytes split
//! at an input-chosen point.

#![no_main]

use libfuzzer_sys::fuzz_target;
use nms_proto::{
    AlertDatagram, AlertFrameBuffer, Datagram, NetTaskDatagram, NetflowDatagram,
    payloads::{MetricsReport, TaskSpec, decode_cbor},
};

fn check<D: Datagram + PartialEq + std::fmt::Debug>(data: &[u8]) {
    if let Ok(datagram) = D::decode(data) {
        let encoded = datagram.encode().expect("decoded datagram must re-encode");
        let again = D::decode(&encoded).expect("re-encoded datagram must decode");
        assert_eq!(datagram, again);
    }
}

fuzz_target!(|data: &[u8]| {
    check::<NetflowDatagram>(data);
    check::<NetTaskDatagram>(data);
    check::<AlertDatagram>(data);

    let _ = decode_cbor::<TaskSpec>(data);
    let _ = decode_cbor::<MetricsReport>(data);

    let split = data.first().map_or(0, |&b| usize::from(b)).min(data.len());
    let mut buffer = AlertFrameBuffer::new();
    let mut decoded = 0usize;
    for chunk in [&data[..split], &data[split..]] {
        match buffer.push(chunk) {
            Ok(datagrams) => decoded += datagrams.len(),
            Err(_) => return,
        }
    }
    assert!(decoded <= data.len());
});
