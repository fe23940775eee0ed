// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Input streams: arrival sequencing, windowed buffering, NACK bitmaps and
//! fragment reassembly.

use std::collections::HashMap;

use tracing::warn;

use crate::config::RELIABLE_STREAM_DEPTH;
use crate::message::InputMessage;
use crate::types::SeqNum;

// ---------------------------------------------------------------------------
// None input stream
// ---------------------------------------------------------------------------

/// Stream 0x00: stateless, every message is admitted.
#[derive(Debug, Default)]
pub struct NoneInputStream;

impl NoneInputStream {
    #[must_use]
    pub fn next_message(&self, _seq: SeqNum) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Best-effort input stream
// ---------------------------------------------------------------------------

/// Streams 0x01..=0x7F: admit only messages newer than the last one seen.
#[derive(Debug, Default)]
pub struct BestEffortInputStream {
    last_received: SeqNum,
}

impl BestEffortInputStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `seq` iff it is strictly newer than anything received so far.
    pub fn next_message(&mut self, seq: SeqNum) -> bool {
        if self.last_received.precedes(seq) {
            self.last_received = seq;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.last_received = SeqNum::ZERO;
    }
}

// ---------------------------------------------------------------------------
// Reliable input stream
// ---------------------------------------------------------------------------

/// Outcome of offering a message to a reliable input stream.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamAdmit {
    /// The message is next in sequence: process it now.
    Deliver,
    /// Out of order but inside the window: buffered for later `pop_next`.
    Buffered,
    /// Stale duplicate or beyond the window: dropped silently.
    Dropped,
}

/// Fragment reassembly state. The explicit enum makes the illegal
/// "empty buffer but available" state unrepresentable.
#[derive(Debug, Default)]
enum FragmentAssembly {
    #[default]
    Idle,
    Reassembling(Vec<u8>),
    Complete(Vec<u8>),
}

/// Streams 0x80..=0xFF: sliding-window buffering with in-order delivery.
///
/// Invariant: `last_handled <= last_announced <= last_handled + DEPTH`,
/// and `messages` only holds sequence numbers in
/// `(last_handled, last_handled + DEPTH]`.
#[derive(Debug, Default)]
pub struct ReliableInputStream {
    last_handled: SeqNum,
    last_announced: SeqNum,
    messages: HashMap<u16, InputMessage>,
    fragments: FragmentAssembly,
}

impl ReliableInputStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an arriving message.
    pub fn receive(&mut self, seq: SeqNum, message: InputMessage) -> StreamAdmit {
        if seq == self.last_handled.next() {
            self.last_handled = seq;
            if self.last_announced.precedes(seq) {
                self.last_announced = seq;
            }
            // A stale buffered copy of this sequence must not pop later.
            self.messages.remove(&seq.raw());
            StreamAdmit::Deliver
        } else if self.last_handled.precedes(seq)
            && seq
                .distance_to(self.last_handled + RELIABLE_STREAM_DEPTH)
                .is_some()
        {
            if self.last_announced.precedes(seq) {
                self.last_announced = seq;
            }
            self.messages.entry(seq.raw()).or_insert(message);
            StreamAdmit::Buffered
        } else {
            StreamAdmit::Dropped
        }
    }

    /// Pop the next in-sequence buffered message, if the gap has healed.
    pub fn pop_next(&mut self) -> Option<InputMessage> {
        let next = self.last_handled.next();
        let message = self.messages.remove(&next.raw())?;
        self.last_handled = next;
        Some(message)
    }

    /// Apply a peer HEARTBEAT announcing `(first_available, last_available)`.
    ///
    /// A `first_available` past our next expected sequence means the peer
    /// discarded earlier messages; they are unrecoverable, so delivery jumps
    /// to `first_available`.
    pub fn update_from_heartbeat(&mut self, first_available: SeqNum, last_available: SeqNum) {
        if self.last_handled.next().precedes(first_available) {
            self.last_handled = SeqNum(first_available.raw().wrapping_sub(1));
            let last_handled = self.last_handled;
            self.messages
                .retain(|&raw, _| last_handled.precedes(SeqNum(raw)));
        }
        if self.last_announced.precedes(last_available) {
            self.last_announced = last_available;
        }
    }

    /// The sequence number the peer should (re)send next.
    #[must_use]
    pub fn first_unacked(&self) -> SeqNum {
        self.last_handled.next()
    }

    /// 16-bit NACK bitmap: bit `i` covers `last_handled + i + 1` and is set
    /// iff that sequence was announced but is not buffered. Low byte spans
    /// offsets +1..+8, high byte +9..+16.
    #[must_use]
    pub fn nack_bitmap(&self) -> u16 {
        let mut bitmap = 0u16;
        for i in 0..16u16 {
            let seq = self.last_handled + (i + 1);
            let announced =
                seq == self.last_announced || seq.precedes(self.last_announced);
            if announced && !self.messages.contains_key(&seq.raw()) {
                bitmap |= 1 << i;
            }
        }
        bitmap
    }

    /// Highest announced sequence number.
    #[must_use]
    pub fn last_announced(&self) -> SeqNum {
        self.last_announced
    }

    /// Whether anything is missing between delivery and announcement.
    #[must_use]
    pub fn has_gaps(&self) -> bool {
        self.last_handled.precedes(self.last_announced)
    }

    /// Append one fragment. The first fragment contributes the transport
    /// message header; each fragment contributes its raw submessage payload.
    pub fn push_fragment(&mut self, message: &InputMessage, payload: &[u8], last: bool) {
        let buf = match std::mem::take(&mut self.fragments) {
            FragmentAssembly::Idle => {
                let mut buf =
                    Vec::with_capacity(message.raw_header().len() + payload.len());
                buf.extend_from_slice(message.raw_header());
                buf
            }
            FragmentAssembly::Reassembling(buf) => buf,
            FragmentAssembly::Complete(buf) => {
                // A completed reassembly was never popped; the stray
                // fragment cannot belong to it.
                warn!("fragment arrived while a reassembled message is pending; dropped");
                self.fragments = FragmentAssembly::Complete(buf);
                return;
            }
        };
        let mut buf = buf;
        buf.extend_from_slice(payload);
        self.fragments = if last {
            FragmentAssembly::Complete(buf)
        } else {
            FragmentAssembly::Reassembling(buf)
        };
    }

    /// Take the reassembled message once the terminal fragment has arrived.
    pub fn pop_fragment(&mut self) -> Option<InputMessage> {
        match std::mem::take(&mut self.fragments) {
            FragmentAssembly::Complete(buf) => match InputMessage::parse(&buf) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!("reassembled fragment message unparseable: {e}");
                    None
                }
            },
            other => {
                self.fragments = other;
                None
            }
        }
    }

    /// Drop all window and fragment state.
    pub fn reset(&mut self) {
        self.last_handled = SeqNum::ZERO;
        self.last_announced = SeqNum::ZERO;
        self.messages.clear();
        self.fragments = FragmentAssembly::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OutputMessage;
    use crate::protocol::{HeartbeatPayload, MessageHeader, Submessage};

    fn msg(seq: u16) -> InputMessage {
        let header = MessageHeader {
            session_id: 0x81,
            stream_id: 0x80,
            sequence_nr: SeqNum(seq),
            client_key: None,
        };
        let mut out = OutputMessage::new(header, 512);
        out.push_submessage(
            &Submessage::Heartbeat(HeartbeatPayload {
                first_unacked_seq_num: SeqNum(1),
                last_unacked_seq_num: SeqNum(1),
                stream_id: 0x80,
            }),
            0,
        )
        .expect("push");
        InputMessage::parse(out.as_bytes()).expect("parse")
    }

    #[test]
    fn test_none_stream_always_admits() {
        let s = NoneInputStream;
        assert!(s.next_message(SeqNum(0)));
        assert!(s.next_message(SeqNum(0)));
        assert!(s.next_message(SeqNum(999)));
    }

    #[test]
    fn test_best_effort_drops_stale() {
        let mut s = BestEffortInputStream::new();
        assert!(s.next_message(SeqNum(1)));
        assert!(s.next_message(SeqNum(5)));
        assert!(!s.next_message(SeqNum(3)));
        assert!(!s.next_message(SeqNum(5)));
        assert!(s.next_message(SeqNum(6)));
    }

    #[test]
    fn test_reliable_in_order_delivery() {
        let mut s = ReliableInputStream::new();
        assert_eq!(s.receive(SeqNum(1), msg(1)), StreamAdmit::Deliver);
        assert_eq!(s.receive(SeqNum(2), msg(2)), StreamAdmit::Deliver);
        assert_eq!(s.first_unacked(), SeqNum(3));
    }

    #[test]
    fn test_reliable_buffers_out_of_order() {
        let mut s = ReliableInputStream::new();
        assert_eq!(s.receive(SeqNum(3), msg(3)), StreamAdmit::Buffered);
        assert_eq!(s.receive(SeqNum(2), msg(2)), StreamAdmit::Buffered);
        assert!(s.pop_next().is_none());
        assert_eq!(s.receive(SeqNum(1), msg(1)), StreamAdmit::Deliver);
        // Gap healed: 2 then 3 pop in order.
        assert!(s.pop_next().is_some());
        assert!(s.pop_next().is_some());
        assert!(s.pop_next().is_none());
        assert_eq!(s.first_unacked(), SeqNum(4));
    }

    #[test]
    fn test_reliable_drops_duplicates_and_stale() {
        let mut s = ReliableInputStream::new();
        assert_eq!(s.receive(SeqNum(1), msg(1)), StreamAdmit::Deliver);
        assert_eq!(s.receive(SeqNum(1), msg(1)), StreamAdmit::Dropped);
        // Duplicate of a buffered message is absorbed, not doubled.
        assert_eq!(s.receive(SeqNum(3), msg(3)), StreamAdmit::Buffered);
        assert_eq!(s.receive(SeqNum(3), msg(3)), StreamAdmit::Buffered);
        assert_eq!(s.receive(SeqNum(2), msg(2)), StreamAdmit::Deliver);
        assert!(s.pop_next().is_some());
        assert!(s.pop_next().is_none());
    }

    #[test]
    fn test_reliable_rejects_beyond_window() {
        let mut s = ReliableInputStream::new();
        let beyond = SeqNum(RELIABLE_STREAM_DEPTH + 1);
        assert_eq!(s.receive(beyond, msg(beyond.raw())), StreamAdmit::Dropped);
        let edge = SeqNum(RELIABLE_STREAM_DEPTH);
        assert_eq!(s.receive(edge, msg(edge.raw())), StreamAdmit::Buffered);
    }

    // Seqs 1..10 arrive with 4 and 7 dropped, then retransmitted.
    #[test]
    fn test_drop_recovery_scenario() {
        let mut s = ReliableInputStream::new();
        for seq in 1u16..=10 {
            if seq == 4 || seq == 7 {
                continue;
            }
            s.receive(SeqNum(seq), msg(seq));
        }
        assert_eq!(s.first_unacked(), SeqNum(4));
        assert_eq!(s.last_announced(), SeqNum(10));
        // Bits 0 (seq 4) and 3 (seq 7) set.
        assert_eq!(s.nack_bitmap(), 0b0000_0000_0000_1001);

        // Peer retransmits 4 and 7.
        assert_eq!(s.receive(SeqNum(4), msg(4)), StreamAdmit::Deliver);
        while s.pop_next().is_some() {}
        assert_eq!(s.first_unacked(), SeqNum(7));
        assert_eq!(s.receive(SeqNum(7), msg(7)), StreamAdmit::Deliver);
        while s.pop_next().is_some() {}
        assert_eq!(s.first_unacked(), SeqNum(11));
        assert_eq!(s.nack_bitmap(), 0);
    }

    // Bit i is set iff the sequence was announced and is absent.
    #[test]
    fn test_nack_bitmap_high_byte() {
        let mut s = ReliableInputStream::new();
        // Announce up to 12 via a buffered message at 12.
        s.receive(SeqNum(12), msg(12));
        let bitmap = s.nack_bitmap();
        // Seqs 1..=11 missing -> bits 0..=10 set except none buffered;
        // seq 12 buffered -> bit 11 clear; beyond 12 unannounced.
        assert_eq!(bitmap, 0b0000_0111_1111_1111);
    }

    #[test]
    fn test_heartbeat_jump_discards_unrecoverable() {
        let mut s = ReliableInputStream::new();
        s.receive(SeqNum(2), msg(2));
        // Peer has discarded 1..4; window now starts at 5.
        s.update_from_heartbeat(SeqNum(5), SeqNum(9));
        assert_eq!(s.first_unacked(), SeqNum(5));
        assert_eq!(s.last_announced(), SeqNum(9));
        // Buffered seq 2 was purged; nothing pops until 5 arrives.
        assert!(s.pop_next().is_none());
        assert_eq!(s.receive(SeqNum(5), msg(5)), StreamAdmit::Deliver);
        // Nothing below the jump target is ever delivered.
        assert!(s.pop_next().is_none());
    }

    #[test]
    fn test_heartbeat_within_window_only_announces() {
        let mut s = ReliableInputStream::new();
        s.receive(SeqNum(1), msg(1));
        s.update_from_heartbeat(SeqNum(1), SeqNum(8));
        assert_eq!(s.first_unacked(), SeqNum(2));
        assert_eq!(s.last_announced(), SeqNum(8));
        assert_eq!(s.nack_bitmap(), 0b0111_1111);
    }

    #[test]
    fn test_fragment_reassembly() {
        let mut s = ReliableInputStream::new();
        let carrier = msg(1);
        s.push_fragment(&carrier, &[1, 2, 3], false);
        assert!(s.pop_fragment().is_none());
        s.push_fragment(&carrier, &[4, 5, 6], true);
        let reassembled = s.pop_fragment().expect("complete message");
        // Carrier header followed by the concatenated fragment payloads.
        assert_eq!(reassembled.len(), carrier.raw_header().len() + 6);
        assert_eq!(reassembled.raw_header(), carrier.raw_header());
        // State reset after pop.
        assert!(s.pop_fragment().is_none());
    }

    #[test]
    fn test_fragment_while_complete_dropped() {
        let mut s = ReliableInputStream::new();
        let carrier = msg(1);
        s.push_fragment(&carrier, &[1, 2], true);
        // Reassembly complete but not popped: stray fragment is discarded.
        s.push_fragment(&carrier, &[9, 9], false);
        let popped = s.pop_fragment().expect("complete message");
        assert_eq!(popped.len(), carrier.raw_header().len() + 2);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut s = ReliableInputStream::new();
        s.receive(SeqNum(1), msg(1));
        s.receive(SeqNum(3), msg(3));
        s.push_fragment(&msg(2), &[1], false);
        s.reset();
        assert_eq!(s.first_unacked(), SeqNum(1));
        assert_eq!(s.nack_bitmap(), 0);
        assert!(s.pop_next().is_none());
        assert!(s.pop_fragment().is_none());
    }

    // Random bounded reorderings with duplicates still deliver exactly
    // once, in order.
    #[test]
    fn test_exactly_once_in_order_under_reordering() {
        use proptest::prelude::*;
        let mut runner = proptest::test_runner::TestRunner::default();
        runner
            .run(
                &proptest::collection::vec(1u16..=40, 0..200),
                |arrivals| {
                    let mut s = ReliableInputStream::new();
                    let mut delivered: Vec<u16> = Vec::new();
                    for seq in arrivals {
                        match s.receive(SeqNum(seq), msg(seq)) {
                            StreamAdmit::Deliver => {
                                delivered.push(seq);
                                while let Some(m) = s.pop_next() {
                                    delivered.push(m.header().sequence_nr.raw());
                                }
                            }
                            StreamAdmit::Buffered | StreamAdmit::Dropped => {}
                        }
                    }
                    // Strictly increasing by one from 1.
                    for (i, seq) in delivered.iter().enumerate() {
                        prop_assert_eq!(*seq as usize, i + 1);
                    }
                    Ok(())
                },
            )
            .expect("property");
    }
}
