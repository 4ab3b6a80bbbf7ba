mod common;

use common::*;
use meshcord::meshtastic::resync::{LineState, SerialFrameResynchronizer, MAX_WINDOW};
use meshcord::meshtastic::{decode, DecodedEnvelope, RawFrame};

#[test]
fn garbage_prefix_resynchronizes_to_same_packet() {
    let frame = text_frame(0x12345678, 42, "Hello");
    let direct = decode(&RawFrame::new("RadioA", frame.clone())).expect("direct decode");

    let mut r = SerialFrameResynchronizer::new();
    r.push(&[0x0f, 0x0f, 0x0f]);
    r.push(&frame);
    let recovered = r.next_envelope(LineState::Idle).expect("recovered");

    assert_eq!(recovered, direct);
    assert_eq!(r.dropped_bytes(), 3);
    assert_eq!(r.buffered(), 0, "consumed N + frame length bytes");
}

#[test]
fn trailing_bytes_stay_buffered_for_next_frame() {
    let first = text_frame(1, 1, "one");
    let second = text_frame(1, 2, "two");
    let mut r = SerialFrameResynchronizer::new();
    r.push(&first);
    r.push(&second[..4]);

    let env = r.next_envelope(LineState::Receiving).expect("first frame");
    assert!(matches!(env, DecodedEnvelope::Packet(ref p) if p.sequence_id == 1));
    assert_eq!(r.buffered(), 4);
    assert!(r.next_envelope(LineState::Receiving).is_none());

    r.push(&second[4..]);
    let env = r.next_envelope(LineState::Receiving).expect("second frame");
    assert!(matches!(env, DecodedEnvelope::Packet(ref p) if p.sequence_id == 2));
}

#[test]
fn identity_envelopes_are_found_too() {
    let mut r = SerialFrameResynchronizer::new();
    r.push(&[0x0f; 5]);
    r.push(&node_directory_frame(0xAABBCCDD, "Alice", "Alice Long"));
    let envs = r.drain(LineState::Idle);
    assert_eq!(envs.len(), 1);
    assert!(matches!(envs[0], DecodedEnvelope::NodeDirectory(ref n) if n.short_label == "Alice"));
}

#[test]
fn long_garbage_run_is_walked_without_idle() {
    let mut r = SerialFrameResynchronizer::new();
    r.push(&vec![0x0f; MAX_WINDOW * 2]);
    r.push(&text_frame(7, 7, "finally"));
    // Garbage beyond a full window is dropped while still receiving; the
    // remainder waits for the idle signal.
    assert!(r.next_envelope(LineState::Receiving).is_none());
    let env = r.next_envelope(LineState::Idle).expect("frame after garbage");
    assert!(matches!(env, DecodedEnvelope::Packet(ref p) if p.source_node_id == 7));
    assert_eq!(r.dropped_bytes(), (MAX_WINDOW * 2) as u64);
}

#[test]
fn frame_longer_than_two_hundred_bytes_is_recovered_whole() {
    let frame = text_frame(0x12345678, 42, &"x".repeat(200));
    assert!(frame.len() > 200);
    assert!(frame.len() <= MAX_WINDOW);

    let mut r = SerialFrameResynchronizer::new();
    r.push(&[0x0f, 0x0f]);
    r.push(&frame);
    let envs = r.drain(LineState::Idle);

    assert_eq!(envs.len(), 1);
    let DecodedEnvelope::Packet(ref p) = envs[0] else {
        panic!("packet expected, got {:?}", envs[0]);
    };
    assert_eq!(p.sequence_id, 42);
    assert_eq!(p.data.as_ref().map(|d| d.payload.len()), Some(200));
    assert_eq!(r.dropped_bytes(), 2);
    assert_eq!(r.buffered(), 0);
}
