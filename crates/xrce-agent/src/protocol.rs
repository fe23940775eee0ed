// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! XRCE wire format: message header, submessage framing, typed payloads.
//!
//! All parsing is safe: malformed input returns `Err`, never panics.
//!
//! # Layout
//!
//! ```text
//! +-----------+-----------+----------------+=================+
//! | session_id| stream_id | sequence_nr LE | [client_key BE] |  header
//! +-----------+-----------+----------------+=================+
//! | submsg_id | flags     | length         | payload ...     |  x N, 4-aligned
//! +-----------+-----------+----------------+-----------------+
//! ```
//!
//! The client key is present iff `session_id < 0x80`. Submessage headers
//! start on 4-byte boundaries; the pad bytes between submessages are zero.
//! Integer fields inside subheaders and payloads follow the endianness bit
//! of the submessage flags; the agent always emits little-endian.

use crate::error::ProtocolError;
use crate::types::{ClientKey, ObjectId, ObjectKind, SeqNum};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Message header size without client key.
pub const MESSAGE_HEADER_SIZE: usize = 4;

/// Message header size with client key (session_id < 0x80).
pub const MESSAGE_HEADER_SIZE_WITH_KEY: usize = 8;

/// Submessage header size.
pub const SUBMESSAGE_HEADER_SIZE: usize = 4;

/// Session ids below this carry the client key in every message header.
pub const SESSION_ID_WITH_KEY_BOUND: u8 = 0x80;

/// Anonymous session id used before CREATE_CLIENT completes (key present).
pub const SESSION_ID_NONE_WITH_CLIENT_KEY: u8 = 0x00;

/// Anonymous session id without client key (discovery traffic).
pub const SESSION_ID_NONE_WITHOUT_CLIENT_KEY: u8 = 0x80;

/// The four magic bytes opening a CREATE_CLIENT payload.
pub const XRCE_COOKIE: [u8; 4] = *b"XRCE";

/// Protocol version advertised and accepted (major.minor).
pub const XRCE_VERSION: [u8; 2] = [0x01, 0x00];

// Submessage ids.
pub const SUBMSG_CREATE_CLIENT: u8 = 0;
pub const SUBMSG_CREATE: u8 = 1;
pub const SUBMSG_GET_INFO: u8 = 2;
pub const SUBMSG_DELETE: u8 = 3;
pub const SUBMSG_STATUS_AGENT: u8 = 4;
pub const SUBMSG_STATUS: u8 = 5;
pub const SUBMSG_INFO: u8 = 6;
pub const SUBMSG_WRITE_DATA: u8 = 7;
pub const SUBMSG_READ_DATA: u8 = 8;
pub const SUBMSG_DATA: u8 = 9;
pub const SUBMSG_ACKNACK: u8 = 10;
pub const SUBMSG_HEARTBEAT: u8 = 11;
pub const SUBMSG_RESET: u8 = 12;
pub const SUBMSG_FRAGMENT: u8 = 13;
pub const SUBMSG_TIMESTAMP: u8 = 14;
pub const SUBMSG_TIMESTAMP_REPLY: u8 = 15;

// Submessage flag bits.
pub const FLAG_LITTLE_ENDIANNESS: u8 = 0x01;
pub const FLAG_REUSE: u8 = 0x02;
pub const FLAG_REPLACE: u8 = 0x04;
pub const FLAG_LAST_FRAGMENT: u8 = 0x80;

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Result status surfaced to clients in STATUS / STATUS_AGENT submessages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0x00,
    OkMatched = 0x01,
    ErrDds = 0x80,
    ErrMismatch = 0x81,
    ErrAlreadyExists = 0x82,
    ErrDenied = 0x83,
    ErrUnknownReference = 0x84,
    ErrInvalidData = 0x85,
    ErrIncompatible = 0x86,
    ErrResources = 0x87,
}

impl StatusCode {
    pub fn from_u8(v: u8) -> Result<Self, ProtocolError> {
        match v {
            0x00 => Ok(Self::Ok),
            0x01 => Ok(Self::OkMatched),
            0x80 => Ok(Self::ErrDds),
            0x81 => Ok(Self::ErrMismatch),
            0x82 => Ok(Self::ErrAlreadyExists),
            0x83 => Ok(Self::ErrDenied),
            0x84 => Ok(Self::ErrUnknownReference),
            0x85 => Ok(Self::ErrInvalidData),
            0x86 => Ok(Self::ErrIncompatible),
            0x87 => Ok(Self::ErrResources),
            other => Err(ProtocolError::UnknownStatusCode(other)),
        }
    }

    #[inline]
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creation and lookup succeeded (OK or OK_MATCHED).
    #[inline]
    #[must_use]
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok | Self::OkMatched)
    }
}

// ---------------------------------------------------------------------------
// Endianness-aware cursor
// ---------------------------------------------------------------------------

/// Read cursor over a payload slice, honoring the submessage endianness bit.
#[derive(Debug)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    little_endian: bool,
}

impl<'a> Cursor<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8], little_endian: bool) -> Self {
        Self {
            buf,
            pos: 0,
            little_endian,
        }
    }

    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        if self.remaining() < 1 {
            return Err(ProtocolError::BufferTooShort);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        if self.remaining() < 2 {
            return Err(ProtocolError::BufferTooShort);
        }
        let b = [self.buf[self.pos], self.buf[self.pos + 1]];
        self.pos += 2;
        Ok(if self.little_endian {
            u16::from_le_bytes(b)
        } else {
            u16::from_be_bytes(b)
        })
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        if self.remaining() < 4 {
            return Err(ProtocolError::BufferTooShort);
        }
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(if self.little_endian {
            u32::from_le_bytes(b)
        } else {
            u32::from_be_bytes(b)
        })
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::BufferTooShort);
        }
        let s = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(s)
    }

    /// Everything not yet consumed.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }

    /// Length-prefixed UTF-8 string: `[len u16][bytes]`.
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidString)
    }
}

/// Append helpers for building payloads. Always little-endian.
#[derive(Debug, Default)]
pub struct Builder {
    buf: Vec<u8>,
}

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

// ---------------------------------------------------------------------------
// Message header
// ---------------------------------------------------------------------------

/// Top-level message header. The client key travels in every message of
/// sessions with id below 0x80.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub session_id: u8,
    pub stream_id: u8,
    pub sequence_nr: SeqNum,
    pub client_key: Option<ClientKey>,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::BufferTooShort);
        }
        let session_id = buf[0];
        let client_key = if session_id < SESSION_ID_WITH_KEY_BOUND {
            if buf.len() < MESSAGE_HEADER_SIZE_WITH_KEY {
                return Err(ProtocolError::BufferTooShort);
            }
            Some(ClientKey::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]))
        } else {
            None
        };
        Ok(Self {
            session_id,
            stream_id: buf[1],
            sequence_nr: SeqNum(u16::from_le_bytes([buf[2], buf[3]])),
            client_key,
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.session_id);
        buf.push(self.stream_id);
        buf.extend_from_slice(&self.sequence_nr.raw().to_le_bytes());
        if self.session_id < SESSION_ID_WITH_KEY_BOUND {
            let key = self.client_key.unwrap_or(ClientKey(0));
            buf.extend_from_slice(&key.to_be_bytes());
        }
    }

    /// Serialized size: 4 or 8 bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        if self.session_id < SESSION_ID_WITH_KEY_BOUND {
            MESSAGE_HEADER_SIZE_WITH_KEY
        } else {
            MESSAGE_HEADER_SIZE
        }
    }
}

// ---------------------------------------------------------------------------
// Submessage header
// ---------------------------------------------------------------------------

/// Submessage header: id, flags, payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmessageHeader {
    pub submessage_id: u8,
    pub flags: u8,
    pub length: u16,
}

impl SubmessageHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < SUBMESSAGE_HEADER_SIZE {
            return Err(ProtocolError::BufferTooShort);
        }
        let flags = buf[1];
        let b = [buf[2], buf[3]];
        let length = if flags & FLAG_LITTLE_ENDIANNESS != 0 {
            u16::from_le_bytes(b)
        } else {
            u16::from_be_bytes(b)
        };
        Ok(Self {
            submessage_id: buf[0],
            flags,
            length,
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.submessage_id);
        buf.push(self.flags);
        buf.extend_from_slice(&self.length.to_le_bytes());
    }

    #[inline]
    #[must_use]
    pub fn is_little_endian(&self) -> bool {
        self.flags & FLAG_LITTLE_ENDIANNESS != 0
    }

    #[inline]
    #[must_use]
    pub fn is_last_fragment(&self) -> bool {
        self.flags & FLAG_LAST_FRAGMENT != 0
    }
}

// ---------------------------------------------------------------------------
// Entity representations
// ---------------------------------------------------------------------------

/// How a CREATE payload describes the entity to the middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Representation {
    /// Reference to a profile known to the middleware.
    Ref(String),
    /// Inline XML description.
    Xml(String),
}

const REPR_BY_REFERENCE: u8 = 0x01;
const REPR_AS_XML_STRING: u8 = 0x02;

impl Representation {
    pub fn parse(c: &mut Cursor<'_>) -> Result<Self, ProtocolError> {
        match c.read_u8()? {
            REPR_BY_REFERENCE => Ok(Self::Ref(c.read_string()?)),
            REPR_AS_XML_STRING => Ok(Self::Xml(c.read_string()?)),
            other => Err(ProtocolError::UnknownObjectKind(other)),
        }
    }

    pub fn write_to(&self, b: &mut Builder) {
        match self {
            Self::Ref(s) => {
                b.u8(REPR_BY_REFERENCE).string(s);
            }
            Self::Xml(s) => {
                b.u8(REPR_AS_XML_STRING).string(s);
            }
        }
    }

    /// The representation text, format-agnostic.
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Ref(s) | Self::Xml(s) => s,
        }
    }
}

/// The entity description inside a CREATE submessage: kind discriminator,
/// parent linkage and the middleware-facing representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectVariant {
    pub kind: ObjectKind,
    /// Domain id; participants only.
    pub domain_id: i16,
    /// Parent object (participant for topics/pubs/subs, publisher for
    /// writers, subscriber for readers). Zero for participants.
    pub parent_id: ObjectId,
    pub representation: Representation,
}

impl ObjectVariant {
    pub fn parse(c: &mut Cursor<'_>) -> Result<Self, ProtocolError> {
        let kind_raw = c.read_u8()?;
        let kind =
            ObjectKind::from_nibble(kind_raw).ok_or(ProtocolError::UnknownObjectKind(kind_raw))?;
        let domain_id = c.read_u16()? as i16;
        let parent_id = ObjectId(c.read_u16()?);
        let representation = Representation::parse(c)?;
        Ok(Self {
            kind,
            domain_id,
            parent_id,
            representation,
        })
    }

    pub fn write_to(&self, b: &mut Builder) {
        b.u8(self.kind.as_u8());
        b.u16(self.domain_id as u16);
        b.u16(self.parent_id.raw());
        self.representation.write_to(b);
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// CREATE_CLIENT: cookie, version, key, session id and negotiated MTU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateClientPayload {
    pub client_key: ClientKey,
    pub session_id: u8,
    pub mtu: u16,
}

/// CREATE: request id, target object id and the entity description.
/// Creation flags (reuse/replace) travel in the subheader flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePayload {
    pub request_id: u16,
    pub object_id: ObjectId,
    pub variant: ObjectVariant,
}

/// DELETE: request id and target object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletePayload {
    pub request_id: u16,
    pub object_id: ObjectId,
}

/// GET_INFO: which info sections the prober wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetInfoPayload {
    pub info_mask: u32,
}

/// GET_INFO mask bit: activity (availability + address).
pub const INFO_ACTIVITY: u32 = 0x02;

/// Transport locator carried in INFO activity replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locator {
    None,
    Udp4 { addr: [u8; 4], port: u16 },
    Udp6 { addr: [u8; 16], port: u16 },
}

impl Locator {
    pub fn parse(c: &mut Cursor<'_>) -> Result<Self, ProtocolError> {
        match c.read_u8()? {
            0 => Ok(Self::None),
            1 => {
                let mut addr = [0u8; 4];
                addr.copy_from_slice(c.read_bytes(4)?);
                let port = c.read_u16()?;
                Ok(Self::Udp4 { addr, port })
            }
            2 => {
                let mut addr = [0u8; 16];
                addr.copy_from_slice(c.read_bytes(16)?);
                let port = c.read_u16()?;
                Ok(Self::Udp6 { addr, port })
            }
            other => Err(ProtocolError::UnknownObjectKind(other)),
        }
    }

    pub fn write_to(&self, b: &mut Builder) {
        match self {
            Self::None => {
                b.u8(0);
            }
            Self::Udp4 { addr, port } => {
                b.u8(1).bytes(addr).u16(*port);
            }
            Self::Udp6 { addr, port } => {
                b.u8(2).bytes(addr).u16(*port);
            }
        }
    }
}

/// INFO: agent activity (availability flag + reachable locator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPayload {
    pub availability: i16,
    pub locator: Locator,
    pub version: String,
}

/// STATUS_AGENT: reply to CREATE_CLIENT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusAgentPayload {
    pub status: StatusCode,
    pub session_id: u8,
    pub mtu: u16,
}

/// STATUS: reply to CREATE / DELETE / WRITE_DATA / READ_DATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPayload {
    pub request_id: u16,
    pub object_id: ObjectId,
    pub status: StatusCode,
}

/// WRITE_DATA: serialized sample for a data writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteDataPayload {
    pub request_id: u16,
    pub object_id: ObjectId,
    pub data: Vec<u8>,
}

/// READ_DATA: pending-read registration on a data reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadDataPayload {
    pub request_id: u16,
    pub object_id: ObjectId,
    /// 0 means "one sample".
    pub max_samples: u16,
    /// Overall delivery window in milliseconds; 0 means a single poll.
    pub max_elapsed_time_ms: u32,
}

/// DATA: sample delivered to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub request_id: u16,
    pub object_id: ObjectId,
    pub data: Vec<u8>,
}

/// ACKNACK: receiver window state for a reliable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcknackPayload {
    pub first_unacked_seq_num: SeqNum,
    /// Bit `i` covers `first_unacked_seq_num + i`; set means missing.
    /// Low byte spans offsets 0..8, high byte 8..16.
    pub nack_bitmap: u16,
    /// Stream this acknack refers to (may differ from the carrying stream).
    pub stream_id: u8,
}

/// HEARTBEAT: sender window state for a reliable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub first_unacked_seq_num: SeqNum,
    pub last_unacked_seq_num: SeqNum,
    pub stream_id: u8,
}

/// TIMESTAMP: client transmit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampPayload {
    pub transmit_sec: i32,
    pub transmit_nsec: u32,
}

/// TIMESTAMP_REPLY: echo plus agent receive/transmit times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampReplyPayload {
    pub transmit_sec: i32,
    pub transmit_nsec: u32,
    pub receive_sec: i32,
    pub receive_nsec: u32,
    pub originate_sec: i32,
    pub originate_nsec: u32,
}

// ---------------------------------------------------------------------------
// Submessage enum
// ---------------------------------------------------------------------------

/// A decoded submessage. FRAGMENT payloads stay raw: reassembly happens in
/// the reliable input stream, which re-parses the synthesized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submessage {
    CreateClient(CreateClientPayload),
    Create(CreatePayload),
    GetInfo(GetInfoPayload),
    Delete(DeletePayload),
    StatusAgent(StatusAgentPayload),
    Status(StatusPayload),
    Info(InfoPayload),
    WriteData(WriteDataPayload),
    ReadData(ReadDataPayload),
    Data(DataPayload),
    Acknack(AcknackPayload),
    Heartbeat(HeartbeatPayload),
    Reset,
    Fragment(Vec<u8>),
    Timestamp(TimestampPayload),
    TimestampReply(TimestampReplyPayload),
}

impl Submessage {
    #[must_use]
    pub fn id(&self) -> u8 {
        match self {
            Self::CreateClient(_) => SUBMSG_CREATE_CLIENT,
            Self::Create(_) => SUBMSG_CREATE,
            Self::GetInfo(_) => SUBMSG_GET_INFO,
            Self::Delete(_) => SUBMSG_DELETE,
            Self::StatusAgent(_) => SUBMSG_STATUS_AGENT,
            Self::Status(_) => SUBMSG_STATUS,
            Self::Info(_) => SUBMSG_INFO,
            Self::WriteData(_) => SUBMSG_WRITE_DATA,
            Self::ReadData(_) => SUBMSG_READ_DATA,
            Self::Data(_) => SUBMSG_DATA,
            Self::Acknack(_) => SUBMSG_ACKNACK,
            Self::Heartbeat(_) => SUBMSG_HEARTBEAT,
            Self::Reset => SUBMSG_RESET,
            Self::Fragment(_) => SUBMSG_FRAGMENT,
            Self::Timestamp(_) => SUBMSG_TIMESTAMP,
            Self::TimestampReply(_) => SUBMSG_TIMESTAMP_REPLY,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

/// Parse the payload of one submessage, given its header.
pub fn parse_payload(
    subheader: &SubmessageHeader,
    payload: &[u8],
) -> Result<Submessage, ProtocolError> {
    let mut c = Cursor::new(payload, subheader.is_little_endian());
    match subheader.submessage_id {
        SUBMSG_CREATE_CLIENT => {
            let cookie = c.read_bytes(4)?;
            if cookie != XRCE_COOKIE {
                return Err(ProtocolError::PayloadLengthMismatch);
            }
            let _version = c.read_bytes(2)?;
            let _vendor = c.read_bytes(2)?;
            let mut key = [0u8; 4];
            key.copy_from_slice(c.read_bytes(4)?);
            let session_id = c.read_u8()?;
            let mtu = c.read_u16()?;
            Ok(Submessage::CreateClient(CreateClientPayload {
                client_key: ClientKey::from_be_bytes(key),
                session_id,
                mtu,
            }))
        }
        SUBMSG_CREATE => {
            let request_id = c.read_u16()?;
            let object_id = ObjectId(c.read_u16()?);
            let variant = ObjectVariant::parse(&mut c)?;
            Ok(Submessage::Create(CreatePayload {
                request_id,
                object_id,
                variant,
            }))
        }
        SUBMSG_GET_INFO => Ok(Submessage::GetInfo(GetInfoPayload {
            info_mask: c.read_u32()?,
        })),
        SUBMSG_DELETE => Ok(Submessage::Delete(DeletePayload {
            request_id: c.read_u16()?,
            object_id: ObjectId(c.read_u16()?),
        })),
        SUBMSG_STATUS_AGENT => {
            let status = StatusCode::from_u8(c.read_u8()?)?;
            let session_id = c.read_u8()?;
            let mtu = c.read_u16()?;
            Ok(Submessage::StatusAgent(StatusAgentPayload {
                status,
                session_id,
                mtu,
            }))
        }
        SUBMSG_STATUS => {
            let request_id = c.read_u16()?;
            let object_id = ObjectId(c.read_u16()?);
            let status = StatusCode::from_u8(c.read_u8()?)?;
            Ok(Submessage::Status(StatusPayload {
                request_id,
                object_id,
                status,
            }))
        }
        SUBMSG_INFO => {
            let availability = c.read_u16()? as i16;
            let locator = Locator::parse(&mut c)?;
            let version = c.read_string()?;
            Ok(Submessage::Info(InfoPayload {
                availability,
                locator,
                version,
            }))
        }
        SUBMSG_WRITE_DATA => {
            let request_id = c.read_u16()?;
            let object_id = ObjectId(c.read_u16()?);
            let data = c.read_rest().to_vec();
            Ok(Submessage::WriteData(WriteDataPayload {
                request_id,
                object_id,
                data,
            }))
        }
        SUBMSG_READ_DATA => Ok(Submessage::ReadData(ReadDataPayload {
            request_id: c.read_u16()?,
            object_id: ObjectId(c.read_u16()?),
            max_samples: c.read_u16()?,
            max_elapsed_time_ms: c.read_u32()?,
        })),
        SUBMSG_DATA => {
            let request_id = c.read_u16()?;
            let object_id = ObjectId(c.read_u16()?);
            let data = c.read_rest().to_vec();
            Ok(Submessage::Data(DataPayload {
                request_id,
                object_id,
                data,
            }))
        }
        SUBMSG_ACKNACK => Ok(Submessage::Acknack(AcknackPayload {
            first_unacked_seq_num: SeqNum(c.read_u16()?),
            nack_bitmap: c.read_u16()?,
            stream_id: c.read_u8()?,
        })),
        SUBMSG_HEARTBEAT => Ok(Submessage::Heartbeat(HeartbeatPayload {
            first_unacked_seq_num: SeqNum(c.read_u16()?),
            last_unacked_seq_num: SeqNum(c.read_u16()?),
            stream_id: c.read_u8()?,
        })),
        SUBMSG_RESET => Ok(Submessage::Reset),
        SUBMSG_FRAGMENT => Ok(Submessage::Fragment(payload.to_vec())),
        SUBMSG_TIMESTAMP => Ok(Submessage::Timestamp(TimestampPayload {
            transmit_sec: c.read_i32()?,
            transmit_nsec: c.read_u32()?,
        })),
        SUBMSG_TIMESTAMP_REPLY => Ok(Submessage::TimestampReply(TimestampReplyPayload {
            transmit_sec: c.read_i32()?,
            transmit_nsec: c.read_u32()?,
            receive_sec: c.read_i32()?,
            receive_nsec: c.read_u32()?,
            originate_sec: c.read_i32()?,
            originate_nsec: c.read_u32()?,
        })),
        other => Err(ProtocolError::UnknownSubmessageId(other)),
    }
}

// ---------------------------------------------------------------------------
// Payload serialization
// ---------------------------------------------------------------------------

/// Serialize a submessage payload (without its subheader). The returned
/// flags carry the endianness bit plus any payload-specific bits.
#[must_use]
pub fn serialize_payload(submsg: &Submessage) -> (Vec<u8>, u8) {
    let mut b = Builder::new();
    match submsg {
        Submessage::CreateClient(p) => {
            b.bytes(&XRCE_COOKIE).bytes(&XRCE_VERSION).bytes(&[0, 0]);
            b.bytes(&p.client_key.to_be_bytes());
            b.u8(p.session_id).u16(p.mtu);
        }
        Submessage::Create(p) => {
            b.u16(p.request_id).u16(p.object_id.raw());
            p.variant.write_to(&mut b);
        }
        Submessage::GetInfo(p) => {
            b.u32(p.info_mask);
        }
        Submessage::Delete(p) => {
            b.u16(p.request_id).u16(p.object_id.raw());
        }
        Submessage::StatusAgent(p) => {
            b.u8(p.status.as_u8()).u8(p.session_id).u16(p.mtu);
        }
        Submessage::Status(p) => {
            b.u16(p.request_id)
                .u16(p.object_id.raw())
                .u8(p.status.as_u8());
        }
        Submessage::Info(p) => {
            b.u16(p.availability as u16);
            p.locator.write_to(&mut b);
            b.string(&p.version);
        }
        Submessage::WriteData(p) => {
            b.u16(p.request_id).u16(p.object_id.raw()).bytes(&p.data);
        }
        Submessage::ReadData(p) => {
            b.u16(p.request_id)
                .u16(p.object_id.raw())
                .u16(p.max_samples)
                .u32(p.max_elapsed_time_ms);
        }
        Submessage::Data(p) => {
            b.u16(p.request_id).u16(p.object_id.raw()).bytes(&p.data);
        }
        Submessage::Acknack(p) => {
            b.u16(p.first_unacked_seq_num.raw())
                .u16(p.nack_bitmap)
                .u8(p.stream_id);
        }
        Submessage::Heartbeat(p) => {
            b.u16(p.first_unacked_seq_num.raw())
                .u16(p.last_unacked_seq_num.raw())
                .u8(p.stream_id);
        }
        Submessage::Reset => {}
        Submessage::Fragment(data) => {
            // FLAG_LAST_FRAGMENT is set by the output stream, not here.
            b.bytes(data);
        }
        Submessage::Timestamp(p) => {
            b.i32(p.transmit_sec).u32(p.transmit_nsec);
        }
        Submessage::TimestampReply(p) => {
            b.i32(p.transmit_sec).u32(p.transmit_nsec);
            b.i32(p.receive_sec).u32(p.receive_nsec);
            b.i32(p.originate_sec).u32(p.originate_nsec);
        }
    }
    (b.finish(), FLAG_LITTLE_ENDIANNESS)
}
