// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-client session: routes messages through the stream matching their
//! stream id, builds outbound messages under the negotiated MTU, and
//! surfaces the reliability control traffic (heartbeats, acknacks).
//!
//! Streams are created lazily. Each reliable stream sits behind its own
//! lock; the maps are only locked long enough to clone the stream handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::message::{InputMessage, OutputMessage};
use crate::protocol::{
    AcknackPayload, HeartbeatPayload, MessageHeader, Submessage, SubmessageHeader,
    SESSION_ID_WITH_KEY_BOUND, SUBMESSAGE_HEADER_SIZE,
};
use crate::stream::{
    BestEffortInputStream, BestEffortOutputStream, NoneInputStream, NoneOutputStream,
    ReliableInputStream, ReliableOutputStream, SendError, StreamAdmit,
};
use crate::types::{ClientKey, SeqNum, StreamKind};

/// Identity negotiated at CREATE_CLIENT time.
#[derive(Debug, Clone, Copy)]
pub struct SessionInfo {
    pub client_key: ClientKey,
    pub session_id: u8,
    pub mtu: usize,
}

/// All stream state for one client.
pub struct Session {
    info: SessionInfo,
    none_in: NoneInputStream,
    none_out: NoneOutputStream,
    best_effort_in: Mutex<HashMap<u8, BestEffortInputStream>>,
    best_effort_out: Mutex<HashMap<u8, BestEffortOutputStream>>,
    reliable_in: Mutex<HashMap<u8, Arc<Mutex<ReliableInputStream>>>>,
    reliable_out: Mutex<HashMap<u8, Arc<Mutex<ReliableOutputStream>>>>,
}

impl Session {
    #[must_use]
    pub fn new(info: SessionInfo) -> Self {
        Self {
            info,
            none_in: NoneInputStream,
            none_out: NoneOutputStream,
            best_effort_in: Mutex::new(HashMap::new()),
            best_effort_out: Mutex::new(HashMap::new()),
            reliable_in: Mutex::new(HashMap::new()),
            reliable_out: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        self.info
    }

    /// Header template for outbound messages on `stream_id`; the sequence
    /// number is assigned by the output stream at push time.
    #[must_use]
    pub fn output_header(&self, stream_id: u8) -> MessageHeader {
        MessageHeader {
            session_id: self.info.session_id,
            stream_id,
            sequence_nr: SeqNum::ZERO,
            client_key: (self.info.session_id < SESSION_ID_WITH_KEY_BOUND)
                .then_some(self.info.client_key),
        }
    }

    fn reliable_in(&self, stream_id: u8) -> Arc<Mutex<ReliableInputStream>> {
        Arc::clone(
            self.reliable_in
                .lock()
                .entry(stream_id)
                .or_insert_with(|| Arc::new(Mutex::new(ReliableInputStream::new()))),
        )
    }

    fn reliable_out(&self, stream_id: u8) -> Arc<Mutex<ReliableOutputStream>> {
        Arc::clone(
            self.reliable_out
                .lock()
                .entry(stream_id)
                .or_insert_with(|| Arc::new(Mutex::new(ReliableOutputStream::new()))),
        )
    }

    // -----------------------------------------------------------------------
    // Input side
    // -----------------------------------------------------------------------

    /// Offer an arriving message to its stream. `Deliver` means the caller
    /// processes it now (and should then drain `pop_input_message`).
    pub fn admit(&self, message: &InputMessage) -> StreamAdmit {
        let header = message.header();
        let seq = header.sequence_nr;
        match StreamKind::of(header.stream_id) {
            StreamKind::None => {
                let _ = self.none_in.next_message(seq);
                StreamAdmit::Deliver
            }
            StreamKind::BestEffort => {
                let mut map = self.best_effort_in.lock();
                let stream = map.entry(header.stream_id).or_default();
                if stream.next_message(seq) {
                    StreamAdmit::Deliver
                } else {
                    StreamAdmit::Dropped
                }
            }
            StreamKind::Reliable => {
                let stream = self.reliable_in(header.stream_id);
                let mut stream = stream.lock();
                stream.receive(seq, message.clone())
            }
        }
    }

    /// Drain the next in-order buffered message of a reliable stream.
    pub fn pop_input_message(&self, stream_id: u8) -> Option<InputMessage> {
        if StreamKind::of(stream_id) != StreamKind::Reliable {
            return None;
        }
        self.reliable_in(stream_id).lock().pop_next()
    }

    /// Feed a FRAGMENT submessage into the stream's reassembly buffer.
    pub fn push_fragment(
        &self,
        message: &InputMessage,
        subheader: &SubmessageHeader,
        payload: &[u8],
    ) {
        let stream_id = message.header().stream_id;
        if StreamKind::of(stream_id) != StreamKind::Reliable {
            return;
        }
        let stream = self.reliable_in(stream_id);
        let mut stream = stream.lock();
        stream.push_fragment(message, payload, subheader.is_last_fragment());
    }

    /// Take a completed fragment reassembly, if any.
    pub fn pop_fragment(&self, stream_id: u8) -> Option<InputMessage> {
        if StreamKind::of(stream_id) != StreamKind::Reliable {
            return None;
        }
        self.reliable_in(stream_id).lock().pop_fragment()
    }

    /// Apply a peer heartbeat and produce the acknack answer.
    pub fn on_heartbeat(&self, payload: &HeartbeatPayload) -> AcknackPayload {
        let stream = self.reliable_in(payload.stream_id);
        let mut stream = stream.lock();
        stream.update_from_heartbeat(payload.first_unacked_seq_num, payload.last_unacked_seq_num);
        AcknackPayload {
            first_unacked_seq_num: stream.first_unacked(),
            nack_bitmap: stream.nack_bitmap(),
            stream_id: payload.stream_id,
        }
    }

    /// Current receiver window announcement for a reliable stream.
    pub fn acknack_for(&self, stream_id: u8) -> AcknackPayload {
        let stream = self.reliable_in(stream_id);
        let stream = stream.lock();
        AcknackPayload {
            first_unacked_seq_num: stream.first_unacked(),
            nack_bitmap: stream.nack_bitmap(),
            stream_id,
        }
    }

    // -----------------------------------------------------------------------
    // Output side
    // -----------------------------------------------------------------------

    /// Serialize one submessage onto `stream_id`, fragmenting on reliable
    /// streams when it exceeds the session MTU. Returns the wire messages
    /// to hand to egress, in order.
    pub fn push_output_submessage(
        &self,
        stream_id: u8,
        submsg: &Submessage,
        extra_flags: u8,
    ) -> Result<Vec<Vec<u8>>, SendError> {
        let header = self.output_header(stream_id);
        let mut message = OutputMessage::new(header, self.info.mtu);
        match message.push_submessage(submsg, extra_flags) {
            Ok(()) => {}
            Err(_) if StreamKind::of(stream_id) == StreamKind::Reliable => {
                // Oversized: serialize the submessage unit and fragment it.
                let (payload, flags) = crate::protocol::serialize_payload(submsg);
                let mut unit = Vec::with_capacity(SUBMESSAGE_HEADER_SIZE + payload.len());
                SubmessageHeader {
                    submessage_id: submsg.id(),
                    flags: flags | extra_flags,
                    length: payload.len() as u16,
                }
                .write_to(&mut unit);
                unit.extend_from_slice(&payload);
                let stream = self.reliable_out(stream_id);
                let mut stream = stream.lock();
                return stream.push_fragmented(header, &unit, self.info.mtu);
            }
            Err(e) => return Err(e.into()),
        }
        match StreamKind::of(stream_id) {
            StreamKind::None => Ok(vec![self.none_out.push(message)]),
            StreamKind::BestEffort => {
                let mut map = self.best_effort_out.lock();
                let stream = map
                    .entry(stream_id)
                    .or_insert_with(BestEffortOutputStream::new);
                Ok(vec![stream.push(message)])
            }
            StreamKind::Reliable => {
                let stream = self.reliable_out(stream_id);
                let mut stream = stream.lock();
                Ok(vec![stream.push(message)?])
            }
        }
    }

    /// Apply a peer acknack to the addressed reliable output stream.
    /// Returns `(retransmissions, heartbeat-on-gap)`.
    pub fn on_acknack(&self, payload: &AcknackPayload) -> (Vec<Vec<u8>>, Option<HeartbeatPayload>) {
        let stream = self.reliable_out(payload.stream_id);
        let mut stream = stream.lock();
        let outcome = stream.on_acknack(payload.first_unacked_seq_num, payload.nack_bitmap);
        let heartbeat = (!outcome.gaps.is_empty()).then(|| stream.heartbeat(payload.stream_id));
        (outcome.retransmit, heartbeat)
    }

    /// Collect heartbeats due across every reliable output stream.
    pub fn heartbeats_due(&self, now: Instant) -> Vec<HeartbeatPayload> {
        let streams: Vec<(u8, Arc<Mutex<ReliableOutputStream>>)> = self
            .reliable_out
            .lock()
            .iter()
            .map(|(&id, s)| (id, Arc::clone(s)))
            .collect();
        streams
            .into_iter()
            .filter_map(|(id, stream)| stream.lock().heartbeat_due(now, id))
            .collect()
    }

    /// RESET: drop every stream's state.
    pub fn reset(&self) {
        for stream in self.best_effort_in.lock().values_mut() {
            stream.reset();
        }
        for stream in self.best_effort_out.lock().values_mut() {
            stream.reset();
        }
        for stream in self.reliable_in.lock().values() {
            stream.lock().reset();
        }
        for stream in self.reliable_out.lock().values() {
            stream.lock().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{StatusCode, StatusPayload};
    use crate::types::ObjectId;

    fn session() -> Session {
        Session::new(SessionInfo {
            client_key: ClientKey(0xAABBCCDD),
            session_id: 0x81,
            mtu: 128,
        })
    }

    fn input(stream_id: u8, seq: u16) -> InputMessage {
        let header = MessageHeader {
            session_id: 0x81,
            stream_id,
            sequence_nr: SeqNum(seq),
            client_key: None,
        };
        let mut out = OutputMessage::new(header, 512);
        out.push_submessage(
            &Submessage::Status(StatusPayload {
                request_id: 0,
                object_id: ObjectId(0),
                status: StatusCode::Ok,
            }),
            0,
        )
        .expect("push");
        InputMessage::parse(out.as_bytes()).expect("parse")
    }

    fn status_submessage() -> Submessage {
        Submessage::Status(StatusPayload {
            request_id: 7,
            object_id: ObjectId(0x0011),
            status: StatusCode::Ok,
        })
    }

    #[test]
    fn test_none_stream_always_delivers() {
        let s = session();
        assert_eq!(s.admit(&input(0x00, 0)), StreamAdmit::Deliver);
        assert_eq!(s.admit(&input(0x00, 0)), StreamAdmit::Deliver);
    }

    #[test]
    fn test_best_effort_routing() {
        let s = session();
        assert_eq!(s.admit(&input(0x01, 1)), StreamAdmit::Deliver);
        assert_eq!(s.admit(&input(0x01, 1)), StreamAdmit::Dropped);
        // Stream ids are independent.
        assert_eq!(s.admit(&input(0x02, 1)), StreamAdmit::Deliver);
    }

    #[test]
    fn test_reliable_routing_and_drain() {
        let s = session();
        assert_eq!(s.admit(&input(0x80, 2)), StreamAdmit::Buffered);
        assert_eq!(s.admit(&input(0x80, 1)), StreamAdmit::Deliver);
        assert!(s.pop_input_message(0x80).is_some());
        assert!(s.pop_input_message(0x80).is_none());
    }

    #[test]
    fn test_heartbeat_answered_with_acknack() {
        let s = session();
        s.admit(&input(0x80, 1));
        s.admit(&input(0x80, 3));
        let ack = s.on_heartbeat(&HeartbeatPayload {
            first_unacked_seq_num: SeqNum(1),
            last_unacked_seq_num: SeqNum(3),
            stream_id: 0x80,
        });
        assert_eq!(ack.first_unacked_seq_num, SeqNum(2));
        assert_eq!(ack.nack_bitmap, 0b01);
        assert_eq!(ack.stream_id, 0x80);
    }

    #[test]
    fn test_output_sequencing_per_stream() {
        let s = session();
        let a = s
            .push_output_submessage(0x80, &status_submessage(), 0)
            .expect("send");
        let b = s
            .push_output_submessage(0x80, &status_submessage(), 0)
            .expect("send");
        assert_eq!(u16::from_le_bytes([a[0][2], a[0][3]]), 1);
        assert_eq!(u16::from_le_bytes([b[0][2], b[0][3]]), 2);
        // A different reliable stream numbers independently.
        let c = s
            .push_output_submessage(0x81, &status_submessage(), 0)
            .expect("send");
        assert_eq!(u16::from_le_bytes([c[0][2], c[0][3]]), 1);
    }

    #[test]
    fn test_oversized_submessage_fragments() {
        let s = session();
        let big = Submessage::Data(crate::protocol::DataPayload {
            request_id: 1,
            object_id: ObjectId(0x0126),
            data: vec![0x55; 300],
        });
        let frames = s
            .push_output_submessage(0x80, &big, 0)
            .expect("fragmented send");
        assert!(frames.len() > 1);
        for frame in &frames {
            assert!(frame.len() <= 128);
        }
    }

    #[test]
    fn test_acknack_retransmit_roundtrip() {
        let s = session();
        s.push_output_submessage(0x80, &status_submessage(), 0)
            .expect("send");
        s.push_output_submessage(0x80, &status_submessage(), 0)
            .expect("send");
        // Peer misses seq 1.
        let (retransmit, heartbeat) = s.on_acknack(&AcknackPayload {
            first_unacked_seq_num: SeqNum(1),
            nack_bitmap: 0b01,
            stream_id: 0x80,
        });
        assert_eq!(retransmit.len(), 1);
        assert!(heartbeat.is_none());
        // Peer asks for an evicted sequence: answered with a heartbeat.
        let (_, _) = s.on_acknack(&AcknackPayload {
            first_unacked_seq_num: SeqNum(3),
            nack_bitmap: 0,
            stream_id: 0x80,
        });
        let (retransmit, heartbeat) = s.on_acknack(&AcknackPayload {
            first_unacked_seq_num: SeqNum(1),
            nack_bitmap: 0b01,
            stream_id: 0x80,
        });
        assert!(retransmit.is_empty());
        assert!(heartbeat.is_some());
    }

    #[test]
    fn test_reset_restarts_sequencing() {
        let s = session();
        s.push_output_submessage(0x80, &status_submessage(), 0)
            .expect("send");
        s.admit(&input(0x80, 1));
        s.reset();
        let a = s
            .push_output_submessage(0x80, &status_submessage(), 0)
            .expect("send");
        assert_eq!(u16::from_le_bytes([a[0][2], a[0][3]]), 1);
        assert_eq!(s.admit(&input(0x80, 1)), StreamAdmit::Deliver);
    }

    #[test]
    fn test_output_header_key_presence() {
        let with_key = Session::new(SessionInfo {
            client_key: ClientKey(1),
            session_id: 0x01,
            mtu: 64,
        });
        assert!(with_key.output_header(0x80).client_key.is_some());
        let without = session();
        assert!(without.output_header(0x80).client_key.is_none());
    }
}
