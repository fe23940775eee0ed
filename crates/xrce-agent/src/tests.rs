// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Crate-level scenario tests: full client/agent exchanges through the
// processor, with the in-process broker as middleware.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver};

use crate::config::AgentConfig;
use crate::context::AgentContext;
use crate::message::{InputMessage, OutputMessage};
use crate::middleware::{CedMiddleware, DataNotification, Middleware, ReaderPool};
use crate::processor::{ClientMap, Processor, ServerEvent};
use crate::protocol::*;
use crate::transport::{InputPacket, OutputPacket};
use crate::types::{ClientKey, ObjectId, ObjectKind, SeqNum};

const KEY: ClientKey = ClientKey(0xAABBCCDD);
const SESSION: u8 = 0x81;
const STREAM: u8 = 0x80;
const MTU: u16 = 512;
const SOURCE: u32 = 1;

struct Harness {
    processor: Processor<u32>,
    middleware: Arc<CedMiddleware>,
    notifications: Receiver<DataNotification>,
    next_seq: u16,
}

impl Harness {
    fn new() -> Self {
        let middleware = Arc::new(CedMiddleware::new());
        let bridge: Arc<dyn Middleware> = middleware.clone();
        let context = Arc::new(AgentContext::new(AgentConfig::default(), bridge));
        let (tx, notifications) = channel::unbounded();
        let reader_pool = Arc::new(ReaderPool::new(
            context.middleware().clone(),
            Duration::from_millis(20),
            Arc::new(move |n| {
                let _ = tx.send(n);
            }),
        ));
        let processor = Processor::new(context, Arc::new(ClientMap::new()), reader_pool, Locator::None);
        Self {
            processor,
            middleware,
            notifications,
            next_seq: 1,
        }
    }

    /// Feed one message from the client; collect the reply packets.
    fn send(&self, header: MessageHeader, submsgs: &[(Submessage, u8)]) -> Vec<OutputPacket<u32>> {
        let mut message = OutputMessage::new(header, usize::from(MTU));
        for (submsg, extra_flags) in submsgs {
            message
                .push_submessage(submsg, *extra_flags)
                .expect("build message");
        }
        self.processor.process(ServerEvent::Packet(InputPacket {
            source: SOURCE,
            bytes: message.into_bytes(),
        }))
    }

    /// Feed one submessage on the reliable stream with the next sequence.
    fn send_reliable(&mut self, submsg: Submessage, extra_flags: u8) -> Vec<OutputPacket<u32>> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.send(
            MessageHeader {
                session_id: SESSION,
                stream_id: STREAM,
                sequence_nr: SeqNum(seq),
                client_key: None,
            },
            &[(submsg, extra_flags)],
        )
    }

    fn connect(&mut self) {
        let replies = self.send(
            MessageHeader {
                session_id: SESSION_ID_NONE_WITH_CLIENT_KEY,
                stream_id: 0,
                sequence_nr: SeqNum::ZERO,
                client_key: Some(KEY),
            },
            &[(
                Submessage::CreateClient(CreateClientPayload {
                    client_key: KEY,
                    session_id: SESSION,
                    mtu: MTU,
                }),
                0,
            )],
        );
        let submsgs = submessages_of(&replies[0]);
        match &submsgs[0] {
            Submessage::StatusAgent(status) => {
                assert_eq!(status.status, StatusCode::Ok);
                assert_eq!(status.session_id, SESSION);
            }
            other => panic!("expected STATUS_AGENT, got {other:?}"),
        }
    }
}

fn submessages_of(packet: &OutputPacket<u32>) -> Vec<Submessage> {
    let message = InputMessage::parse(&packet.bytes).expect("parse reply");
    message
        .submessages()
        .map(|item| {
            let (subheader, payload) = item.expect("submessage");
            parse_payload(&subheader, payload).expect("payload")
        })
        .collect()
}

fn first_status(replies: &[OutputPacket<u32>]) -> StatusPayload {
    for packet in replies {
        for submsg in submessages_of(packet) {
            if let Submessage::Status(status) = submsg {
                return status;
            }
        }
    }
    panic!("no STATUS in replies");
}

fn participant_create(id: u16, reference: &str) -> Submessage {
    Submessage::Create(CreatePayload {
        request_id: 7,
        object_id: ObjectId(id),
        variant: ObjectVariant {
            kind: ObjectKind::Participant,
            domain_id: 0,
            parent_id: ObjectId(0),
            representation: Representation::Ref(reference.to_string()),
        },
    })
}

// ---------------------------------------------------------------------------
// S1: create/delete participant by reference, full matrix.
// ---------------------------------------------------------------------------
#[test]
fn test_s1_participant_lifecycle() {
    let mut h = Harness::new();
    h.connect();
    let id = 0x0011;

    let status = first_status(&h.send_reliable(participant_create(id, "default_xrce_participant"), 0));
    assert_eq!(status.status, StatusCode::Ok);
    assert_eq!(status.object_id, ObjectId(id));
    assert_eq!(status.request_id, 7);

    // Same create again: ALREADY_EXISTS.
    let status = first_status(&h.send_reliable(participant_create(id, "default_xrce_participant"), 0));
    assert_eq!(status.status, StatusCode::ErrAlreadyExists);

    // REUSE with the same representation: OK_MATCHED.
    let status = first_status(&h.send_reliable(
        participant_create(id, "default_xrce_participant"),
        FLAG_REUSE,
    ));
    assert_eq!(status.status, StatusCode::OkMatched);

    // REUSE with a different reference: MISMATCH.
    let status = first_status(&h.send_reliable(participant_create(id, "other_participant"), FLAG_REUSE));
    assert_eq!(status.status, StatusCode::ErrMismatch);

    // REPLACE: OK.
    let status = first_status(&h.send_reliable(participant_create(id, "other_participant"), FLAG_REPLACE));
    assert_eq!(status.status, StatusCode::Ok);

    // DELETE: OK, then UNKNOWN_REFERENCE.
    let delete = Submessage::Delete(DeletePayload {
        request_id: 8,
        object_id: ObjectId(id),
    });
    let status = first_status(&h.send_reliable(delete.clone(), 0));
    assert_eq!(status.status, StatusCode::Ok);
    let status = first_status(&h.send_reliable(delete, 0));
    assert_eq!(status.status, StatusCode::ErrUnknownReference);
}

// ---------------------------------------------------------------------------
// S2: reliable delivery with drops, heartbeat-driven recovery.
// ---------------------------------------------------------------------------
#[test]
fn test_s2_heartbeat_acknack_recovery() {
    let mut h = Harness::new();
    h.connect();

    // Seq 1 establishes the participant; seqs 2..4 arrive but 2 is lost,
    // so 3 and 4 are buffered and unprocessed.
    let create = h.send_reliable(participant_create(0x0011, "p"), 0);
    assert_eq!(first_status(&create).status, StatusCode::Ok);

    h.next_seq = 3; // drop seq 2
    let replies = h.send_reliable(participant_create(0x0021, "p"), 0);
    assert!(replies.is_empty(), "buffered message must not be processed");
    let replies = h.send_reliable(participant_create(0x0031, "p"), 0);
    assert!(replies.is_empty());

    // Client heartbeat: it has sent 1..=4. Agent answers with an ACKNACK
    // naming seq 2 as the only gap.
    let replies = h.send(
        MessageHeader {
            session_id: SESSION,
            stream_id: 0,
            sequence_nr: SeqNum::ZERO,
            client_key: None,
        },
        &[(
            Submessage::Heartbeat(HeartbeatPayload {
                first_unacked_seq_num: SeqNum(1),
                last_unacked_seq_num: SeqNum(4),
                stream_id: STREAM,
            }),
            0,
        )],
    );
    let acknack = submessages_of(&replies[0])
        .into_iter()
        .find_map(|s| match s {
            Submessage::Acknack(a) => Some(a),
            _ => None,
        })
        .expect("acknack");
    assert_eq!(acknack.first_unacked_seq_num, SeqNum(2));
    assert_eq!(acknack.nack_bitmap, 0b01);
    assert_eq!(acknack.stream_id, STREAM);

    // Retransmission of seq 2 releases 2, 3 and 4 in order.
    let replies = h.send(
        MessageHeader {
            session_id: SESSION,
            stream_id: STREAM,
            sequence_nr: SeqNum(2),
            client_key: None,
        },
        &[(participant_create(0x0041, "p"), 0)],
    );
    let statuses: Vec<StatusPayload> = replies
        .iter()
        .flat_map(|p| submessages_of(p))
        .filter_map(|s| match s {
            Submessage::Status(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(statuses.len(), 3);
    assert_eq!(statuses[0].object_id, ObjectId(0x0041));
    assert_eq!(statuses[1].object_id, ObjectId(0x0021));
    assert_eq!(statuses[2].object_id, ObjectId(0x0031));
    assert!(statuses.iter().all(|s| s.status == StatusCode::Ok));
}

// ---------------------------------------------------------------------------
// S3: fragmented WRITE_DATA reassembled into one logical message.
// ---------------------------------------------------------------------------
#[test]
fn test_s3_fragmented_write() {
    let mut h = Harness::new();
    h.connect();

    for (id, submsg) in [
        (0x0011, participant_create(0x0011, "p")),
        (
            0x0013,
            Submessage::Create(CreatePayload {
                request_id: 1,
                object_id: ObjectId(0x0013),
                variant: ObjectVariant {
                    kind: ObjectKind::Publisher,
                    domain_id: 0,
                    parent_id: ObjectId(0x0011),
                    representation: Representation::Xml(String::new()),
                },
            }),
        ),
        (
            0x0015,
            Submessage::Create(CreatePayload {
                request_id: 2,
                object_id: ObjectId(0x0015),
                variant: ObjectVariant {
                    kind: ObjectKind::DataWriter,
                    domain_id: 0,
                    parent_id: ObjectId(0x0013),
                    representation: Representation::Ref("rt/big".to_string()),
                },
            }),
        ),
        (
            0x0014,
            Submessage::Create(CreatePayload {
                request_id: 3,
                object_id: ObjectId(0x0014),
                variant: ObjectVariant {
                    kind: ObjectKind::Subscriber,
                    domain_id: 0,
                    parent_id: ObjectId(0x0011),
                    representation: Representation::Xml(String::new()),
                },
            }),
        ),
        (
            0x0016,
            Submessage::Create(CreatePayload {
                request_id: 4,
                object_id: ObjectId(0x0016),
                variant: ObjectVariant {
                    kind: ObjectKind::DataReader,
                    domain_id: 0,
                    parent_id: ObjectId(0x0014),
                    representation: Representation::Ref("rt/big".to_string()),
                },
            }),
        ),
    ] {
        let status = first_status(&h.send_reliable(submsg, 0));
        assert_eq!(status.status, StatusCode::Ok, "creating 0x{id:04X}");
    }

    // A 2000-byte sample cannot ride in one 512-byte message: serialize
    // the WRITE_DATA unit and slice it into FRAGMENT submessages.
    let sample: Vec<u8> = (0..2000u16).map(|i| i as u8).collect();
    let write = Submessage::WriteData(WriteDataPayload {
        request_id: 9,
        object_id: ObjectId(0x0015),
        data: sample.clone(),
    });
    let (payload, flags) = serialize_payload(&write);
    let mut unit = Vec::new();
    SubmessageHeader {
        submessage_id: write.id(),
        flags,
        length: payload.len() as u16,
    }
    .write_to(&mut unit);
    unit.extend_from_slice(&payload);

    let chunk = 500;
    let nfrags = unit.len().div_ceil(chunk);
    for (i, piece) in unit.chunks(chunk).enumerate() {
        let last = i + 1 == nfrags;
        let extra = if last { FLAG_LAST_FRAGMENT } else { 0 };
        let seq = h.next_seq;
        h.next_seq += 1;
        let mut message = OutputMessage::new(
            MessageHeader {
                session_id: SESSION,
                stream_id: STREAM,
                sequence_nr: SeqNum(seq),
                client_key: None,
            },
            usize::from(MTU),
        );
        message
            .push_raw(SUBMSG_FRAGMENT, FLAG_LITTLE_ENDIANNESS | extra, piece)
            .expect("fragment");
        let replies = h.processor.process(ServerEvent::Packet(InputPacket {
            source: SOURCE,
            bytes: message.into_bytes(),
        }));
        // Write completion produces no STATUS; nothing should come back.
        assert!(replies.iter().all(|p| !submessages_of(p)
            .iter()
            .any(|s| matches!(s, Submessage::Status(st) if !st.status.is_ok()))));
    }

    // The reassembled write reached the broker intact.
    let delivered = h
        .middleware
        .read_data(KEY, ObjectId(0x0016), Duration::from_millis(100))
        .expect("read")
        .expect("sample");
    assert_eq!(delivered.len(), 2000);
    assert_eq!(delivered, sample);
}

// ---------------------------------------------------------------------------
// Read path: READ_DATA -> async DATA delivery.
// ---------------------------------------------------------------------------
#[test]
fn test_read_data_delivers_asynchronously() {
    let mut h = Harness::new();
    h.connect();
    for submsg in [
        participant_create(0x0011, "p"),
        Submessage::Create(CreatePayload {
            request_id: 1,
            object_id: ObjectId(0x0014),
            variant: ObjectVariant {
                kind: ObjectKind::Subscriber,
                domain_id: 0,
                parent_id: ObjectId(0x0011),
                representation: Representation::Xml(String::new()),
            },
        }),
        Submessage::Create(CreatePayload {
            request_id: 2,
            object_id: ObjectId(0x0016),
            variant: ObjectVariant {
                kind: ObjectKind::DataReader,
                domain_id: 0,
                parent_id: ObjectId(0x0014),
                representation: Representation::Ref("rt/sensor".to_string()),
            },
        }),
        Submessage::Create(CreatePayload {
            request_id: 3,
            object_id: ObjectId(0x0013),
            variant: ObjectVariant {
                kind: ObjectKind::Publisher,
                domain_id: 0,
                parent_id: ObjectId(0x0011),
                representation: Representation::Xml(String::new()),
            },
        }),
        Submessage::Create(CreatePayload {
            request_id: 4,
            object_id: ObjectId(0x0015),
            variant: ObjectVariant {
                kind: ObjectKind::DataWriter,
                domain_id: 0,
                parent_id: ObjectId(0x0013),
                representation: Representation::Ref("rt/sensor".to_string()),
            },
        }),
    ] {
        assert!(first_status(&h.send_reliable(submsg, 0)).status.is_ok());
    }

    // Register a pending read, then publish.
    let replies = h.send_reliable(
        Submessage::ReadData(ReadDataPayload {
            request_id: 42,
            object_id: ObjectId(0x0016),
            max_samples: 1,
            max_elapsed_time_ms: 1000,
        }),
        0,
    );
    assert_eq!(first_status(&replies).status, StatusCode::Ok);

    let replies = h.send_reliable(
        Submessage::WriteData(WriteDataPayload {
            request_id: 43,
            object_id: ObjectId(0x0015),
            data: b"reading 21.5C".to_vec(),
        }),
        0,
    );
    assert!(replies.is_empty(), "successful write is unacknowledged");

    // The reader worker hands the sample back through the notification
    // channel; processing it yields the DATA packet.
    let notification = h
        .notifications
        .recv_timeout(Duration::from_secs(1))
        .expect("notification");
    let packets = h.processor.process(ServerEvent::ReaderData(notification));
    let data = packets
        .iter()
        .flat_map(|p| submessages_of(p))
        .find_map(|s| match s {
            Submessage::Data(d) => Some(d),
            _ => None,
        })
        .expect("DATA submessage");
    assert_eq!(data.request_id, 42);
    assert_eq!(data.object_id, ObjectId(0x0016));
    assert_eq!(data.data, b"reading 21.5C");
}

// ---------------------------------------------------------------------------
// Control plane odds and ends.
// ---------------------------------------------------------------------------

#[test]
fn test_get_info_answered_anonymously() {
    let h = Harness::new();
    let replies = h.send(
        MessageHeader {
            session_id: SESSION_ID_NONE_WITHOUT_CLIENT_KEY,
            stream_id: 0,
            sequence_nr: SeqNum::ZERO,
            client_key: None,
        },
        &[(
            Submessage::GetInfo(GetInfoPayload {
                info_mask: INFO_ACTIVITY,
            }),
            0,
        )],
    );
    let info = submessages_of(&replies[0])
        .into_iter()
        .find_map(|s| match s {
            Submessage::Info(i) => Some(i),
            _ => None,
        })
        .expect("INFO");
    assert_eq!(info.availability, 1);
}

#[test]
fn test_timestamp_reply() {
    let mut h = Harness::new();
    h.connect();
    let replies = h.send_reliable(
        Submessage::Timestamp(TimestampPayload {
            transmit_sec: 1_700_000_000,
            transmit_nsec: 42,
        }),
        0,
    );
    let reply = replies
        .iter()
        .flat_map(|p| submessages_of(p))
        .find_map(|s| match s {
            Submessage::TimestampReply(r) => Some(r),
            _ => None,
        })
        .expect("TIMESTAMP_REPLY");
    assert_eq!(reply.transmit_sec, 1_700_000_000);
    assert_eq!(reply.transmit_nsec, 42);
    assert!(reply.receive_sec > 0);
}

#[test]
fn test_reset_restarts_streams() {
    let mut h = Harness::new();
    h.connect();
    assert!(first_status(&h.send_reliable(participant_create(0x0011, "p"), 0))
        .status
        .is_ok());

    let replies = h.send_reliable(Submessage::Reset, 0);
    assert!(replies.is_empty());

    // Stream state is gone: sequence numbering restarts at 1.
    h.next_seq = 1;
    let status = first_status(&h.send_reliable(participant_create(0x0021, "p"), 0));
    assert_eq!(status.status, StatusCode::Ok);
}

#[test]
fn test_unknown_client_traffic_dropped() {
    let h = Harness::new();
    let replies = h.send(
        MessageHeader {
            session_id: SESSION,
            stream_id: STREAM,
            sequence_nr: SeqNum(1),
            client_key: None,
        },
        &[(participant_create(0x0011, "p"), 0)],
    );
    assert!(replies.is_empty());
}

#[test]
fn test_write_to_missing_writer_reports_unknown_reference() {
    let mut h = Harness::new();
    h.connect();
    let replies = h.send_reliable(
        Submessage::WriteData(WriteDataPayload {
            request_id: 5,
            object_id: ObjectId(0x0015),
            data: vec![1, 2, 3],
        }),
        0,
    );
    assert_eq!(
        first_status(&replies).status,
        StatusCode::ErrUnknownReference
    );
}

#[test]
fn test_garbage_packet_dropped() {
    let h = Harness::new();
    let replies = h.processor.process(ServerEvent::Packet(InputPacket {
        source: SOURCE,
        bytes: vec![0xFF, 0x01],
    }));
    assert!(replies.is_empty());
}
