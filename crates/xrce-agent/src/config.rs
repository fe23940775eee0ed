// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent configuration: protocol constants and the runtime config struct.

use std::time::Duration;

use crate::error::AgentError;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// Reliable stream window depth: how many messages past `last_handled` a
/// reliable input stream will buffer, and how many unacknowledged messages
/// a reliable output stream will hold.
pub const RELIABLE_STREAM_DEPTH: u16 = 16;

/// Base heartbeat period for reliable output streams.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_millis(200);

/// Heartbeat backoff ceiling.
pub const MAX_HEARTBEAT_PERIOD: Duration = Duration::from_millis(1000);

/// Maximum simultaneously connected TCP peers.
pub const TCP_MAX_CONNECTIONS: usize = 100;

/// Serial transport MTU (frame payload bound, also the framing accumulator cap).
pub const SERIAL_TRANSPORT_MTU: usize = 512;

/// UDP transport MTU: one datagram carries one complete XRCE message.
pub const UDP_TRANSPORT_MTU: usize = 1400;

/// TCP transport MTU (bounded by the u16 length prefix).
pub const TCP_TRANSPORT_MTU: usize = u16::MAX as usize;

/// Default XRCE agent discovery port.
pub const DISCOVERY_PORT: u16 = 7400;

/// XRCE discovery multicast group.
pub const DISCOVERY_MULTICAST_ADDR: &str = "239.255.0.2";

/// Default capacity of the ingress and egress packet queues.
pub const SCHEDULER_CAPACITY: usize = 512;

// ---------------------------------------------------------------------------
// Runtime configuration
// ---------------------------------------------------------------------------

/// Which middleware backend bridges client intent into the pub/sub network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareKind {
    /// In-process broker: samples never leave the agent.
    Ced,
    /// External DDS backend registered through the library API.
    Dds,
}

impl MiddlewareKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Ced => "ced",
            Self::Dds => "dds",
        }
    }
}

/// Runtime configuration, validated before a server starts.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Middleware backend selection.
    pub middleware: MiddlewareKind,
    /// How long a client may stay silent before its proxy is reaped.
    pub client_dead_time: Duration,
    /// Per-operation timeout for middleware writes and entity creation.
    pub middleware_op_timeout: Duration,
    /// Capacity of the ingress and egress queues.
    pub queue_capacity: usize,
    /// Optional path of a references file handed to the middleware.
    pub refs_path: Option<String>,
    /// Hard cap on simultaneously connected clients.
    pub max_clients: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            middleware: MiddlewareKind::Ced,
            client_dead_time: Duration::from_secs(30),
            middleware_op_timeout: Duration::from_millis(100),
            queue_capacity: SCHEDULER_CAPACITY,
            refs_path: None,
            max_clients: 128,
        }
    }
}

impl AgentConfig {
    /// Validate the configuration. Returns `Ok(())` if usable.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.queue_capacity == 0 {
            return Err(AgentError::Config("queue_capacity must be > 0".into()));
        }
        if self.max_clients == 0 {
            return Err(AgentError::Config("max_clients must be > 0".into()));
        }
        if self.client_dead_time.is_zero() {
            return Err(AgentError::Config("client_dead_time must be > 0".into()));
        }
        if self.middleware_op_timeout.is_zero() {
            return Err(AgentError::Config(
                "middleware_op_timeout must be > 0".into(),
            ));
        }
        Ok(())
    }
}
