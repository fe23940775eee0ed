// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Owned message buffers with submessage cursors.
//!
//! An [`InputMessage`] wraps one received XRCE message; its iterator walks
//! the submessages, re-aligning to 4-byte boundaries between them. An
//! [`OutputMessage`] accumulates submessages under an MTU bound, padding
//! between entries so every subheader starts aligned.

use crate::error::ProtocolError;
use crate::protocol::{
    serialize_payload, MessageHeader, SubmessageHeader, Submessage, SUBMESSAGE_HEADER_SIZE,
};
use crate::types::SeqNum;

/// Round `n` up to the next multiple of 4.
#[inline]
#[must_use]
pub fn align4(n: usize) -> usize {
    (n + 3) & !3
}

// ---------------------------------------------------------------------------
// InputMessage
// ---------------------------------------------------------------------------

/// A received message: owned bytes plus the parsed header.
#[derive(Debug, Clone)]
pub struct InputMessage {
    buf: Vec<u8>,
    header: MessageHeader,
}

impl InputMessage {
    /// Parse the message header; the submessages are walked lazily.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let header = MessageHeader::parse(bytes)?;
        Ok(Self {
            buf: bytes.to_vec(),
            header,
        })
    }

    /// Rebuild a message from a raw header slice plus reassembled payload
    /// bytes (fragment reassembly path).
    pub fn from_parts(raw_header: &[u8], payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = Vec::with_capacity(raw_header.len() + payload.len());
        buf.extend_from_slice(raw_header);
        buf.extend_from_slice(payload);
        Self::parse(&buf)
    }

    #[inline]
    #[must_use]
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// The serialized header bytes (4 or 8 depending on session id).
    #[must_use]
    pub fn raw_header(&self) -> &[u8] {
        &self.buf[..self.header.size()]
    }

    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Iterate over `(subheader, raw payload)` pairs.
    #[must_use]
    pub fn submessages(&self) -> SubmessageIter<'_> {
        SubmessageIter {
            buf: &self.buf,
            offset: self.header.size(),
        }
    }
}

/// Walks the submessages of an [`InputMessage`].
#[derive(Debug)]
pub struct SubmessageIter<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for SubmessageIter<'a> {
    type Item = Result<(SubmessageHeader, &'a [u8]), ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        // Align to the next 4-byte boundary relative to the buffer start.
        let aligned = align4(self.offset);
        if aligned >= self.buf.len() {
            return None;
        }
        self.offset = aligned;

        let subheader = match SubmessageHeader::parse(&self.buf[self.offset..]) {
            Ok(h) => h,
            Err(e) => {
                self.offset = self.buf.len();
                return Some(Err(e));
            }
        };
        let payload_start = self.offset + SUBMESSAGE_HEADER_SIZE;
        let payload_end = payload_start + subheader.length as usize;
        if payload_end > self.buf.len() {
            self.offset = self.buf.len();
            return Some(Err(ProtocolError::BufferTooShort));
        }
        self.offset = payload_end;
        Some(Ok((subheader, &self.buf[payload_start..payload_end])))
    }
}

// ---------------------------------------------------------------------------
// OutputMessage
// ---------------------------------------------------------------------------

/// An outbound message under construction: header plus submessages, bounded
/// by the session MTU.
#[derive(Debug, Clone)]
pub struct OutputMessage {
    buf: Vec<u8>,
    mtu: usize,
}

impl OutputMessage {
    #[must_use]
    pub fn new(header: MessageHeader, mtu: usize) -> Self {
        let mut buf = Vec::with_capacity(64);
        header.write_to(&mut buf);
        Self { buf, mtu }
    }

    /// Whether a payload of `payload_len` bytes still fits under the MTU,
    /// including the subheader and alignment padding.
    #[must_use]
    pub fn fits(&self, payload_len: usize) -> bool {
        align4(self.buf.len()) + SUBMESSAGE_HEADER_SIZE + payload_len <= self.mtu
    }

    /// Append a submessage, padding to a 4-byte boundary first.
    /// `extra_flags` is OR-ed onto the serializer's flags (reuse/replace,
    /// LAST_FRAGMENT).
    pub fn push_submessage(
        &mut self,
        submsg: &Submessage,
        extra_flags: u8,
    ) -> Result<(), ProtocolError> {
        let (payload, flags) = serialize_payload(submsg);
        self.push_raw(submsg.id(), flags | extra_flags, &payload)
    }

    /// Append a pre-serialized payload under a fresh subheader.
    pub fn push_raw(&mut self, id: u8, flags: u8, payload: &[u8]) -> Result<(), ProtocolError> {
        let aligned = align4(self.buf.len());
        if aligned + SUBMESSAGE_HEADER_SIZE + payload.len() > self.mtu {
            return Err(ProtocolError::MtuExceeded(self.mtu));
        }
        self.buf.resize(aligned, 0);
        let subheader = SubmessageHeader {
            submessage_id: id,
            flags,
            length: payload.len() as u16,
        };
        subheader.write_to(&mut self.buf);
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    /// Patch the sequence number in the already-written header. The
    /// reliable output stream assigns the final sequence at send time.
    pub fn set_sequence_nr(&mut self, seq: SeqNum) {
        let b = seq.raw().to_le_bytes();
        self.buf[2] = b[0];
        self.buf[3] = b[1];
    }

    /// `true` once at least one submessage has been appended.
    #[must_use]
    pub fn has_submessages(&self) -> bool {
        let header_len = MessageHeader::parse(&self.buf).map(|h| h.size()).unwrap_or(0);
        self.buf.len() > header_len
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}
