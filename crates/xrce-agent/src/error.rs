// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types, layered the way errors propagate: protocol errors stop at
//! the submessage boundary, transport errors at the packet boundary, agent
//! errors at the worker boundary.

use thiserror::Error;

use crate::types::ObjectId;

/// Errors produced while parsing or building XRCE wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("buffer too short")]
    BufferTooShort,
    #[error("unknown submessage id: 0x{0:02x}")]
    UnknownSubmessageId(u8),
    #[error("unknown object kind: 0x{0:02x}")]
    UnknownObjectKind(u8),
    #[error("unknown status code: 0x{0:02x}")]
    UnknownStatusCode(u8),
    #[error("payload length mismatch")]
    PayloadLengthMismatch,
    #[error("invalid utf-8 in representation string")]
    InvalidString,
    #[error("message exceeds negotiated mtu ({0} bytes)")]
    MtuExceeded(usize),
}

/// Errors surfaced by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport initialization failed: {0}")]
    Init(String),
    #[error("connection pool full ({0} slots)")]
    PoolFull(usize),
    #[error("peer not connected")]
    NotConnected,
    #[error("transport shut down")]
    Shutdown,
}

/// Errors from the serial framing codec. Local-only: a bad frame is
/// dropped and logged, never surfaced to the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("crc mismatch (expected 0x{expected:04x}, got 0x{got:04x})")]
    CrcMismatch { expected: u16, got: u16 },
    #[error("frame exceeds mtu ({0} bytes)")]
    Overflow(usize),
    #[error("frame addressed to another device (dst 0x{0:02x})")]
    WrongDestination(u8),
}

/// Errors from the middleware capability layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MiddlewareError {
    #[error("entity rejected by middleware: {0}")]
    Denied(String),
    #[error("unknown entity {0}")]
    UnknownEntity(ObjectId),
    #[error("middleware operation timed out")]
    Timeout,
    #[error("no middleware backend available for kind '{0}'")]
    NoBackend(String),
}

/// Top-level agent errors. These stop a server, not a packet.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Middleware(#[from] MiddlewareError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("server already running")]
    AlreadyRunning,
}
