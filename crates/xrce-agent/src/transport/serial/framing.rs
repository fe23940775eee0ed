// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Octet-stuffed serial framing with CRC-16.
//!
//! # Wire format
//!
//! ```text
//! BEGIN | src | dst | stuffed payload | CRC16 LE | BEGIN
//! ```
//!
//! `BEGIN = 0x7E`, `ESC = 0x7D`; any 0x7E/0x7D after the opening flag is
//! sent as `ESC, byte ^ 0x20`. The CRC (CRC-16/CCITT-FALSE) covers
//! `src | dst | unstuffed payload` and is itself subject to stuffing.
//!
//! The decoder is a byte-at-a-time state machine `{Idle, Payload, Escaped}`
//! that survives read timeouts mid-frame and resynchronizes on the next
//! flag after corruption. The accumulator is capped; a flagless stream can
//! never buffer without bound.

use tracing::trace;

use crate::error::FramingError;

/// Frame delimiter.
pub const BEGIN_FLAG: u8 = 0x7E;

/// Escape prefix.
pub const ESC_FLAG: u8 = 0x7D;

/// XOR mask applied to escaped bytes.
const ESC_XOR: u8 = 0x20;

/// src + dst + CRC16: the smallest body a frame can carry.
const MIN_FRAME_BODY: usize = 4;

// ---------------------------------------------------------------------------
// CRC-16/CCITT-FALSE
// ---------------------------------------------------------------------------

const CRC_POLY: u16 = 0x1021;
const CRC_INIT: u16 = 0xFFFF;

const CRC_TABLE: [u16; 256] = {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut j = 0;
        while j < 8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ CRC_POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Fold one byte into a running CRC.
#[inline]
#[must_use]
pub fn crc16_update(crc: u16, byte: u8) -> u16 {
    (crc << 8) ^ CRC_TABLE[usize::from((crc >> 8) as u8 ^ byte)]
}

/// CRC-16/CCITT-FALSE over a whole buffer.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(CRC_INIT, |crc, &b| crc16_update(crc, b))
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

fn push_stuffed(out: &mut Vec<u8>, byte: u8) {
    if byte == BEGIN_FLAG || byte == ESC_FLAG {
        out.push(ESC_FLAG);
        out.push(byte ^ ESC_XOR);
    } else {
        out.push(byte);
    }
}

/// Encode one frame, stuffing everything between the flags.
#[must_use]
pub fn encode_frame(src: u8, dst: u8, payload: &[u8]) -> Vec<u8> {
    let mut crc = CRC_INIT;
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.push(BEGIN_FLAG);
    for &byte in [src, dst].iter().chain(payload) {
        crc = crc16_update(crc, byte);
        push_stuffed(&mut out, byte);
    }
    for byte in crc.to_le_bytes() {
        push_stuffed(&mut out, byte);
    }
    out.push(BEGIN_FLAG);
    out
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// A validated frame addressed to this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub src: u8,
    pub dst: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    /// Discarding until a flag.
    Idle,
    /// Accumulating unstuffed bytes.
    Payload,
    /// The byte after an ESC.
    Escaped,
}

/// Byte-at-a-time frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecoderState,
    accumulator: Vec<u8>,
    /// Accumulator bound: MTU plus addresses and CRC.
    capacity: usize,
    /// Frames for other destinations are dropped unless promiscuous.
    local_addr: u8,
}

impl FrameDecoder {
    #[must_use]
    pub fn new(local_addr: u8, mtu: usize) -> Self {
        Self {
            state: DecoderState::Idle,
            accumulator: Vec::with_capacity(mtu + MIN_FRAME_BODY),
            capacity: mtu + MIN_FRAME_BODY,
            local_addr,
        }
    }

    /// Feed one received byte; yields a frame when one completes.
    pub fn feed(&mut self, byte: u8) -> Result<Option<Frame>, FramingError> {
        match self.state {
            DecoderState::Idle => {
                if byte == BEGIN_FLAG {
                    self.accumulator.clear();
                    self.state = DecoderState::Payload;
                }
                Ok(None)
            }
            DecoderState::Payload => match byte {
                ESC_FLAG => {
                    self.state = DecoderState::Escaped;
                    Ok(None)
                }
                BEGIN_FLAG => self.close_frame(),
                other => self.accumulate(other),
            },
            DecoderState::Escaped => {
                self.state = DecoderState::Payload;
                self.accumulate(byte ^ ESC_XOR)
            }
        }
    }

    /// Feed a buffer; collect every completed frame, skipping bad ones.
    pub fn feed_slice(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        for &byte in bytes {
            match self.feed(byte) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => {}
                Err(e) => trace!("frame dropped: {e}"),
            }
        }
        frames
    }

    fn accumulate(&mut self, byte: u8) -> Result<Option<Frame>, FramingError> {
        if self.accumulator.len() >= self.capacity {
            // Flagless garbage; dump it and hunt for the next flag.
            let len = self.accumulator.len();
            self.accumulator.clear();
            self.state = DecoderState::Idle;
            return Err(FramingError::Overflow(len));
        }
        self.accumulator.push(byte);
        Ok(None)
    }

    fn close_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        if self.accumulator.is_empty() {
            // Back-to-back flags (previous closer doubling as our opener).
            return Ok(None);
        }
        if self.accumulator.len() < MIN_FRAME_BODY {
            // Runt; treat this flag as a fresh opener.
            self.accumulator.clear();
            return Ok(None);
        }
        let body = std::mem::take(&mut self.accumulator);
        // Stay in Payload: the closing flag opens the next frame.
        let crc_at = body.len() - 2;
        let got = u16::from_le_bytes([body[crc_at], body[crc_at + 1]]);
        let expected = crc16(&body[..crc_at]);
        if got != expected {
            return Err(FramingError::CrcMismatch { expected, got });
        }
        let (src, dst) = (body[0], body[1]);
        if dst != self.local_addr {
            return Err(FramingError::WrongDestination(dst));
        }
        Ok(Some(Frame {
            src,
            dst,
            payload: body[2..crc_at].to_vec(),
        }))
    }

    /// Drop any partial frame (link reset).
    pub fn reset(&mut self) {
        self.state = DecoderState::Idle;
        self.accumulator.clear();
    }
}
