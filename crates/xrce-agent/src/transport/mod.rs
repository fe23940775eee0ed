// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport abstraction and concrete transports.
//!
//! A transport assembles complete XRCE messages from its medium (one
//! datagram, one length-prefixed TCP message, one CRC-valid serial frame)
//! and hands `(source, bytes)` pairs to the server's receiver thread.
//! Implementations are shared between the receiver and sender threads, so
//! both primitives take `&self` and synchronize internally.

pub mod discovery;
#[cfg(unix)]
pub mod serial;
pub mod tcp;
pub mod udp;

use std::fmt::Display;
use std::hash::Hash;

use crate::error::TransportError;

/// Identifies the remote peer of one message, per transport.
pub trait EndPoint: Clone + PartialEq + Eq + Hash + Display + Send + Sync + 'static {}

impl<T> EndPoint for T where T: Clone + PartialEq + Eq + Hash + Display + Send + Sync + 'static {}

/// One complete inbound message and where it came from.
#[derive(Debug, Clone)]
pub struct InputPacket<E> {
    pub source: E,
    pub bytes: Vec<u8>,
}

/// One complete outbound message and where it goes.
#[derive(Debug, Clone)]
pub struct OutputPacket<E> {
    pub destination: E,
    pub bytes: Vec<u8>,
}

/// Timeout convention for `recv_message`: milliseconds, `-1` blocks
/// forever, `0` polls.
pub type TimeoutMs = i32;

/// A server-side transport instance.
pub trait Transport: Send + Sync + 'static {
    type Endpoint: EndPoint;

    /// Block up to `timeout` for one complete message. `Ok(None)` on
    /// timeout; `Err(TransportError::Shutdown)` once `shutdown` was called.
    fn recv_message(
        &self,
        timeout: TimeoutMs,
    ) -> Result<Option<InputPacket<Self::Endpoint>>, TransportError>;

    /// Transmit one complete message.
    fn send_message(&self, packet: &OutputPacket<Self::Endpoint>) -> Result<(), TransportError>;

    /// The MTU a single message must fit in.
    fn mtu(&self) -> usize;

    /// Unblock pending reads and refuse further traffic. Idempotent.
    fn shutdown(&self);
}
