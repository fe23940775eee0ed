// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Output streams: sequence assignment, retransmit buffering, heartbeat
//! pacing and outbound fragmentation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::{HEARTBEAT_PERIOD, MAX_HEARTBEAT_PERIOD, RELIABLE_STREAM_DEPTH};
use crate::error::ProtocolError;
use crate::message::OutputMessage;
use crate::protocol::{
    HeartbeatPayload, MessageHeader, Submessage, FLAG_LAST_FRAGMENT, FLAG_LITTLE_ENDIANNESS,
    SUBMESSAGE_HEADER_SIZE, SUBMSG_FRAGMENT,
};
use crate::types::SeqNum;

// ---------------------------------------------------------------------------
// None / best-effort output streams
// ---------------------------------------------------------------------------

/// Stream 0x00: stateless sender; every message goes out with sequence 0.
#[derive(Debug, Default)]
pub struct NoneOutputStream;

impl NoneOutputStream {
    /// Stamp and serialize; nothing is retained.
    #[must_use]
    pub fn push(&self, mut message: OutputMessage) -> Vec<u8> {
        message.set_sequence_nr(SeqNum::ZERO);
        message.into_bytes()
    }
}

/// Streams 0x01..=0x7F: monotonically numbered, never retransmitted.
#[derive(Debug, Default)]
pub struct BestEffortOutputStream {
    next_seq: SeqNum,
}

impl BestEffortOutputStream {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_seq: SeqNum(1),
        }
    }

    #[must_use]
    pub fn push(&mut self, mut message: OutputMessage) -> Vec<u8> {
        let seq = self.next_seq;
        self.next_seq = seq.next();
        message.set_sequence_nr(seq);
        message.into_bytes()
    }

    pub fn reset(&mut self) {
        self.next_seq = SeqNum(1);
    }
}

// ---------------------------------------------------------------------------
// Reliable output stream
// ---------------------------------------------------------------------------

/// Failure pushing onto a reliable output stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The retransmit window holds `RELIABLE_STREAM_DEPTH` unacknowledged
    /// messages; surfaced to the client as ERR_RESOURCES.
    #[error("reliable window full")]
    WindowFull,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// What an ACKNACK asks the sender to do.
#[derive(Debug, Default)]
pub struct AcknackOutcome {
    /// Serialized messages to put back on the wire, oldest first.
    pub retransmit: Vec<Vec<u8>>,
    /// Requested sequences that have been evicted from the window. The
    /// session answers with a fresh heartbeat so the peer jumps forward.
    pub gaps: Vec<SeqNum>,
}

/// Streams 0x80..=0xFF: windowed sender with NACK-driven retransmission.
#[derive(Debug)]
pub struct ReliableOutputStream {
    next_seq: SeqNum,
    /// Serialized messages awaiting acknowledgement, keyed by raw sequence.
    sent_buffer: HashMap<u16, Vec<u8>>,
    heartbeat_interval: Duration,
    last_heartbeat: Option<Instant>,
}

impl Default for ReliableOutputStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableOutputStream {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_seq: SeqNum(1),
            sent_buffer: HashMap::new(),
            heartbeat_interval: HEARTBEAT_PERIOD,
            last_heartbeat: None,
        }
    }

    /// Assign the next sequence number, serialize, retain for
    /// retransmission and hand the bytes back for egress.
    pub fn push(&mut self, mut message: OutputMessage) -> Result<Vec<u8>, SendError> {
        if self.sent_buffer.len() >= usize::from(RELIABLE_STREAM_DEPTH) {
            return Err(SendError::WindowFull);
        }
        let seq = self.next_seq;
        self.next_seq = seq.next();
        message.set_sequence_nr(seq);
        let bytes = message.into_bytes();
        self.sent_buffer.insert(seq.raw(), bytes.clone());
        Ok(bytes)
    }

    /// Split an oversized submessage payload into FRAGMENT submessages,
    /// each in its own message with its own sequence number; only the last
    /// carries `LAST_FRAGMENT`. `payload` is the serialized submessage unit
    /// (subheader + payload) being transported.
    pub fn push_fragmented(
        &mut self,
        header: MessageHeader,
        payload: &[u8],
        mtu: usize,
    ) -> Result<Vec<Vec<u8>>, SendError> {
        let chunk = mtu
            .saturating_sub(header.size() + SUBMESSAGE_HEADER_SIZE)
            .max(1);
        let nfrags = payload.len().div_ceil(chunk);
        if self.sent_buffer.len() + nfrags > usize::from(RELIABLE_STREAM_DEPTH) {
            return Err(SendError::WindowFull);
        }
        let mut out = Vec::with_capacity(nfrags);
        for (i, piece) in payload.chunks(chunk).enumerate() {
            let last = i + 1 == nfrags;
            let mut message = OutputMessage::new(header, mtu);
            let flags = if last {
                FLAG_LITTLE_ENDIANNESS | FLAG_LAST_FRAGMENT
            } else {
                FLAG_LITTLE_ENDIANNESS
            };
            message.push_raw(SUBMSG_FRAGMENT, flags, piece)?;
            out.push(self.push(message)?);
        }
        Ok(out)
    }

    /// Apply a peer ACKNACK: prune acknowledged entries, collect
    /// retransmissions for the set bits, report evicted sequences.
    pub fn on_acknack(&mut self, first_unacked: SeqNum, bitmap: u16) -> AcknackOutcome {
        self.sent_buffer
            .retain(|&raw, _| !SeqNum(raw).precedes(first_unacked));
        // Progress from the peer resets the heartbeat backoff.
        self.heartbeat_interval = HEARTBEAT_PERIOD;

        let mut outcome = AcknackOutcome::default();
        let mut requested: Vec<SeqNum> = (0..16u16)
            .filter(|i| bitmap & (1 << i) != 0)
            .map(|i| first_unacked + i)
            .collect();
        requested.sort_by_key(|s| s.raw().wrapping_sub(first_unacked.raw()));
        for seq in requested {
            if !seq.precedes(self.next_seq) {
                // Never sent; a stale or corrupt bitmap.
                continue;
            }
            match self.sent_buffer.get(&seq.raw()) {
                Some(bytes) => outcome.retransmit.push(bytes.clone()),
                None => outcome.gaps.push(seq),
            }
        }
        outcome
    }

    /// Emit a heartbeat if unacknowledged data is pending and the current
    /// interval has elapsed. Each emission doubles the interval up to the
    /// ceiling; an acknack resets it.
    pub fn heartbeat_due(&mut self, now: Instant, stream_id: u8) -> Option<HeartbeatPayload> {
        if self.sent_buffer.is_empty() {
            self.last_heartbeat = None;
            return None;
        }
        if let Some(last) = self.last_heartbeat {
            if now.duration_since(last) < self.heartbeat_interval {
                return None;
            }
        }
        self.last_heartbeat = Some(now);
        self.heartbeat_interval = (self.heartbeat_interval * 2).min(MAX_HEARTBEAT_PERIOD);
        Some(self.heartbeat(stream_id))
    }

    /// Current window announcement, regardless of pacing.
    #[must_use]
    pub fn heartbeat(&self, stream_id: u8) -> HeartbeatPayload {
        HeartbeatPayload {
            first_unacked_seq_num: self.first_unacked(),
            last_unacked_seq_num: SeqNum(self.next_seq.raw().wrapping_sub(1)),
            stream_id,
        }
    }

    /// Oldest unacknowledged sequence, or `next_seq` when all is acked.
    #[must_use]
    pub fn first_unacked(&self) -> SeqNum {
        self.sent_buffer
            .keys()
            .map(|&raw| SeqNum(raw))
            .min_by(|a, b| {
                if a.precedes(*b) {
                    std::cmp::Ordering::Less
                } else if b.precedes(*a) {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .unwrap_or(self.next_seq)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.sent_buffer.len()
    }

    pub fn reset(&mut self) {
        self.next_seq = SeqNum(1);
        self.sent_buffer.clear();
        self.heartbeat_interval = HEARTBEAT_PERIOD;
        self.last_heartbeat = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{StatusCode, StatusPayload};
    use crate::types::ObjectId;

    fn header() -> MessageHeader {
        MessageHeader {
            session_id: 0x81,
            stream_id: 0x80,
            sequence_nr: SeqNum::ZERO,
            client_key: None,
        }
    }

    fn status_message() -> OutputMessage {
        let mut m = OutputMessage::new(header(), 512);
        m.push_submessage(
            &Submessage::Status(StatusPayload {
                request_id: 1,
                object_id: ObjectId(0x0011),
                status: StatusCode::Ok,
            }),
            0,
        )
        .expect("push");
        m
    }

    #[test]
    fn test_sequences_assigned_from_one() {
        let mut s = ReliableOutputStream::new();
        let first = s.push(status_message()).expect("send");
        let second = s.push(status_message()).expect("send");
        assert_eq!(u16::from_le_bytes([first[2], first[3]]), 1);
        assert_eq!(u16::from_le_bytes([second[2], second[3]]), 2);
        assert_eq!(s.pending(), 2);
    }

    #[test]
    fn test_window_full_rejected() {
        let mut s = ReliableOutputStream::new();
        for _ in 0..RELIABLE_STREAM_DEPTH {
            s.push(status_message()).expect("send");
        }
        assert_eq!(s.push(status_message()), Err(SendError::WindowFull));
    }

    #[test]
    fn test_acknack_prunes_and_retransmits() {
        let mut s = ReliableOutputStream::new();
        for _ in 0..5 {
            s.push(status_message()).expect("send");
        }
        // Peer has 1..3 but misses 4 and 5 (bits 0 and 1 from first=4).
        let outcome = s.on_acknack(SeqNum(4), 0b0000_0011);
        assert_eq!(s.pending(), 2);
        assert_eq!(outcome.retransmit.len(), 2);
        assert!(outcome.gaps.is_empty());
        let seqs: Vec<u16> = outcome
            .retransmit
            .iter()
            .map(|b| u16::from_le_bytes([b[2], b[3]]))
            .collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn test_acknack_evicted_reports_gap() {
        let mut s = ReliableOutputStream::new();
        for _ in 0..3 {
            s.push(status_message()).expect("send");
        }
        // Everything acked.
        let outcome = s.on_acknack(SeqNum(4), 0);
        assert_eq!(s.pending(), 0);
        assert!(outcome.retransmit.is_empty());
        // A later acknack asking for pruned seq 2 yields a gap.
        let outcome = s.on_acknack(SeqNum(2), 0b0000_0001);
        assert!(outcome.retransmit.is_empty());
        assert_eq!(outcome.gaps, vec![SeqNum(2)]);
    }

    #[test]
    fn test_acknack_ignores_unsent_bits() {
        let mut s = ReliableOutputStream::new();
        s.push(status_message()).expect("send");
        // Bits far past next_seq are noise.
        let outcome = s.on_acknack(SeqNum(1), 0b1111_1111_1111_1110);
        assert!(outcome.retransmit.is_empty());
        assert!(outcome.gaps.is_empty());
    }

    #[test]
    fn test_heartbeat_pacing_and_backoff() {
        let mut s = ReliableOutputStream::new();
        let t0 = Instant::now();
        // Nothing pending: no heartbeat.
        assert!(s.heartbeat_due(t0, 0x80).is_none());

        s.push(status_message()).expect("send");
        let hb = s.heartbeat_due(t0, 0x80).expect("due immediately");
        assert_eq!(hb.first_unacked_seq_num, SeqNum(1));
        assert_eq!(hb.last_unacked_seq_num, SeqNum(1));

        // Not yet: base interval is 200ms, doubled after first emission.
        assert!(s.heartbeat_due(t0 + Duration::from_millis(100), 0x80).is_none());
        assert!(s
            .heartbeat_due(t0 + Duration::from_millis(450), 0x80)
            .is_some());

        // Acknack resets the backoff.
        s.push(status_message()).expect("send");
        s.on_acknack(SeqNum(2), 0);
        assert!(s
            .heartbeat_due(t0 + Duration::from_millis(700), 0x80)
            .is_some());
    }

    #[test]
    fn test_fragmentation_splits_and_flags_last() {
        let mut s = ReliableOutputStream::new();
        let hdr = header();
        let mtu = 64;
        let payload = vec![0xAB; 150];
        let frames = s.push_fragmented(hdr, &payload, mtu).expect("fragment");
        // chunk = 64 - 4 - 4 = 56 -> ceil(150/56) = 3 fragments.
        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert!(frame.len() <= mtu);
            assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), (i + 1) as u16);
            let flags = frame[hdr.size() + 1];
            if i == frames.len() - 1 {
                assert_ne!(flags & FLAG_LAST_FRAGMENT, 0);
            } else {
                assert_eq!(flags & FLAG_LAST_FRAGMENT, 0);
            }
        }
        assert_eq!(s.pending(), 3);
    }

    #[test]
    fn test_fragmentation_window_check_upfront() {
        let mut s = ReliableOutputStream::new();
        for _ in 0..RELIABLE_STREAM_DEPTH - 1 {
            s.push(status_message()).expect("send");
        }
        // Two fragments needed, one slot free.
        let err = s.push_fragmented(header(), &[0u8; 100], 64);
        assert_eq!(err, Err(SendError::WindowFull));
        assert_eq!(s.pending(), usize::from(RELIABLE_STREAM_DEPTH) - 1);
    }

    #[test]
    fn test_first_unacked_wraps() {
        let mut s = ReliableOutputStream::new();
        s.next_seq = SeqNum(0xFFFF);
        s.push(status_message()).expect("send");
        s.push(status_message()).expect("send");
        // Buffer holds 0xFFFF and 0x0000; oldest is 0xFFFF.
        assert_eq!(s.first_unacked(), SeqNum(0xFFFF));
    }
}
