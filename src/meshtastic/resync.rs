//! Envelope recovery from an unframed serial byte stream.
//!
//! The serial API gives no delimiter or length prefix, so envelopes are found
//! by window search: starting at offset 0, decode windows of increasing length
//! (`MIN_FRAME_LEN..=MAX_WINDOW`); the first window that yields a usable
//! envelope is consumed. When none does, exactly one leading byte is dropped
//! and the search repeats, which walks past arbitrary garbage.
//!
//! A buffer shorter than `MAX_WINDOW` may simply hold a frame that has not
//! finished arriving, so bytes are only dropped once every window could be
//! tried or the caller reports the line as idle.

use bytes::{Buf, BytesMut};
use log::debug;

use super::{decode_bytes, DecodedEnvelope};

pub const MIN_FRAME_LEN: usize = 2;
/// Largest encoded `FromRadio` the firmware emits.
pub const MAX_WINDOW: usize = 512;

/// What the last read from the link looked like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    /// Bytes arrived on the last read; more may follow.
    Receiving,
    /// The last read timed out without data; the buffer is all there is.
    Idle,
}

#[derive(Debug, Default)]
pub struct SerialFrameResynchronizer {
    buf: BytesMut,
    dropped: u64,
}

impl SerialFrameResynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes discarded while resynchronising.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped
    }

    /// Discard any partial frame (disconnect, shutdown).
    pub fn reset(&mut self) {
        if !self.buf.is_empty() {
            debug!("serial: discarding {} buffered bytes", self.buf.len());
        }
        self.buf.clear();
    }

    /// Extract the next envelope from the buffer, if one can be found yet.
    pub fn next_envelope(&mut self, line: LineState) -> Option<DecodedEnvelope> {
        let mut skipped = 0usize;
        loop {
            if self.buf.len() < MIN_FRAME_LEN {
                if line == LineState::Idle && !self.buf.is_empty() {
                    skipped += self.buf.len();
                    self.buf.clear();
                }
                self.note_skipped(skipped);
                return None;
            }
            let limit = self.buf.len().min(MAX_WINDOW);
            for end in MIN_FRAME_LEN..=limit {
                match decode_bytes(&self.buf[..end]) {
                    Some(DecodedEnvelope::Unrecognized) | None => continue,
                    Some(env) => {
                        self.buf.advance(end);
                        self.note_skipped(skipped);
                        return Some(env);
                    }
                }
            }
            if self.buf.len() >= MAX_WINDOW || line == LineState::Idle {
                self.buf.advance(1);
                skipped += 1;
                continue;
            }
            self.note_skipped(skipped);
            return None;
        }
    }

    /// Every envelope currently extractable, in stream order.
    pub fn drain(&mut self, line: LineState) -> Vec<DecodedEnvelope> {
        let mut out = Vec::new();
        while let Some(env) = self.next_envelope(line) {
            out.push(env);
        }
        out
    }

    fn note_skipped(&mut self, skipped: usize) {
        if skipped > 0 {
            self.dropped += skipped as u64;
            debug!("serial: skipped {} unframed bytes", skipped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshtastic::test_frames::text_frame;

    #[test]
    fn garbage_prefix_is_skipped() {
        let mut r = SerialFrameResynchronizer::new();
        r.push(&[0x0f; 7]);
        r.push(&text_frame(0x11, 1, "after garbage"));
        // Short buffer while bytes are still arriving: nothing is dropped yet.
        assert!(r.next_envelope(LineState::Receiving).is_none());
        assert_eq!(r.dropped_bytes(), 0);
        let env = r.next_envelope(LineState::Idle).expect("frame");
        assert!(matches!(env, DecodedEnvelope::Packet(ref p) if p.source_node_id == 0x11));
        assert_eq!(r.dropped_bytes(), 7);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn partial_frame_waits_for_remaining_bytes() {
        let frame = text_frame(0x22, 2, "split across reads");
        let (head, tail) = frame.split_at(frame.len() / 2);
        let mut r = SerialFrameResynchronizer::new();
        r.push(head);
        assert!(r.next_envelope(LineState::Receiving).is_none());
        assert_eq!(r.buffered(), head.len());
        r.push(tail);
        assert!(r.next_envelope(LineState::Receiving).is_some());
        assert_eq!(r.dropped_bytes(), 0);
    }

    #[test]
    fn back_to_back_frames_come_out_in_order() {
        let mut r = SerialFrameResynchronizer::new();
        r.push(&text_frame(1, 10, "first"));
        r.push(&text_frame(1, 11, "second"));
        let ids: Vec<u32> = r
            .drain(LineState::Receiving)
            .into_iter()
            .filter_map(|e| match e {
                DecodedEnvelope::Packet(p) => Some(p.sequence_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![10, 11]);
    }

    #[test]
    fn idle_line_flushes_undecodable_tail() {
        let mut r = SerialFrameResynchronizer::new();
        r.push(&[0x0f; 12]);
        assert!(r.next_envelope(LineState::Receiving).is_none());
        assert_eq!(r.buffered(), 12);
        assert!(r.next_envelope(LineState::Idle).is_none());
        assert_eq!(r.buffered(), 0);
        assert_eq!(r.dropped_bytes(), 12);
    }

    #[test]
    fn full_window_of_garbage_is_consumed_without_idle() {
        let mut r = SerialFrameResynchronizer::new();
        r.push(&[0x0f; MAX_WINDOW + 5]);
        assert!(r.next_envelope(LineState::Receiving).is_none());
        assert!(r.buffered() < MAX_WINDOW);
    }

    #[test]
    fn reset_discards_partial_data() {
        let mut r = SerialFrameResynchronizer::new();
        r.push(&text_frame(3, 3, "x")[..4]);
        r.reset();
        assert_eq!(r.buffered(), 0);
    }
}
