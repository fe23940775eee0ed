// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery: a multicast GET_INFO responder, plus the optional prober
//! that looks for other agents on the LAN.
//!
//! The responder is a degenerate server: receive a GET_INFO datagram,
//! answer with an INFO carrying the agent's transport address. The prober
//! is its client-side mirror: multicast a GET_INFO once a second and
//! remember who answered.

use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::config::{DISCOVERY_MULTICAST_ADDR, DISCOVERY_PORT, UDP_TRANSPORT_MTU};
use crate::error::TransportError;
use crate::message::{InputMessage, OutputMessage};
use crate::protocol::{
    parse_payload, GetInfoPayload, InfoPayload, Locator, MessageHeader, Submessage,
    INFO_ACTIVITY, SESSION_ID_NONE_WITHOUT_CLIENT_KEY, SUBMSG_GET_INFO, SUBMSG_INFO,
};
use crate::types::SeqNum;

fn multicast_group() -> Ipv4Addr {
    DISCOVERY_MULTICAST_ADDR
        .parse()
        .unwrap_or(Ipv4Addr::new(239, 255, 0, 2))
}

fn anonymous_header() -> MessageHeader {
    MessageHeader {
        session_id: SESSION_ID_NONE_WITHOUT_CLIENT_KEY,
        stream_id: 0,
        sequence_nr: SeqNum::ZERO,
        client_key: None,
    }
}

fn bind_multicast(port: u16) -> Result<Socket, TransportError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket
        .bind(&SocketAddr::from(([0, 0, 0, 0], port)).into())
        .map_err(|e| TransportError::Init(format!("discovery bind :{port}: {e}")))?;
    socket
        .join_multicast_v4(&multicast_group(), &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| TransportError::Init(format!("join multicast: {e}")))?;
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;
    Ok(socket)
}

fn is_get_info(bytes: &[u8]) -> bool {
    let Ok(message) = InputMessage::parse(bytes) else {
        return false;
    };
    message
        .submessages()
        .flatten()
        .any(|(subheader, _)| subheader.submessage_id == SUBMSG_GET_INFO)
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Answers GET_INFO probes with the agent's reachable locator.
pub struct DiscoveryServer {
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryServer {
    /// Listen on `port` (the standard agent discovery port by default) and
    /// advertise `locator`.
    pub fn run(port: u16, locator: Locator) -> Result<Self, TransportError> {
        let socket = bind_multicast(port)?;
        let running = Arc::new(AtomicBool::new(true));
        let worker = {
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("xrce-discovery".into())
                .spawn(move || responder_loop(&socket, locator, &running))
                .map_err(|e| TransportError::Init(format!("spawn discovery: {e}")))?
        };
        info!(port, "discovery responder running");
        Ok(Self {
            running,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stop the responder thread. Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            if let Some(handle) = self.worker.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for DiscoveryServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn responder_loop(socket: &Socket, locator: Locator, running: &AtomicBool) {
    let mut buf = [0u8; UDP_TRANSPORT_MTU];
    while running.load(Ordering::Acquire) {
        let uninit =
            unsafe { &mut *(&mut buf[..] as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let (n, peer) = match socket.recv_from(uninit) {
            Ok(pair) => pair,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("discovery receive error: {e}");
                continue;
            }
        };
        if !is_get_info(&buf[..n]) {
            continue;
        }
        let mut reply = OutputMessage::new(anonymous_header(), UDP_TRANSPORT_MTU);
        let info = Submessage::Info(InfoPayload {
            availability: 1,
            locator,
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        if reply.push_submessage(&info, 0).is_ok() {
            if let Err(e) = socket.send_to(reply.as_bytes(), &peer) {
                debug!("discovery reply failed: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Prober (P2P)
// ---------------------------------------------------------------------------

/// A remote agent that answered a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAgent {
    pub from: SocketAddr,
    pub locator: Locator,
    pub version: String,
}

/// Multicasts GET_INFO probes and collects INFO answers.
pub struct AgentDiscoverer {
    running: Arc<AtomicBool>,
    agents: Arc<Mutex<Vec<DiscoveredAgent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AgentDiscoverer {
    /// Probe from `local_port`, targeting the discovery multicast group.
    pub fn run(local_port: u16) -> Result<Self, TransportError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket
            .bind(&SocketAddr::from(([0, 0, 0, 0], local_port)).into())
            .map_err(|e| TransportError::Init(format!("p2p bind :{local_port}: {e}")))?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        let running = Arc::new(AtomicBool::new(true));
        let agents = Arc::new(Mutex::new(Vec::new()));
        let worker = {
            let running = Arc::clone(&running);
            let agents = Arc::clone(&agents);
            std::thread::Builder::new()
                .name("xrce-p2p-discoverer".into())
                .spawn(move || prober_loop(&socket, &running, &agents))
                .map_err(|e| TransportError::Init(format!("spawn discoverer: {e}")))?
        };
        info!(local_port, "agent discoverer running");
        Ok(Self {
            running,
            agents,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Agents heard from so far.
    #[must_use]
    pub fn agents(&self) -> Vec<DiscoveredAgent> {
        self.agents.lock().clone()
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            if let Some(handle) = self.worker.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for AgentDiscoverer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn prober_loop(socket: &Socket, running: &AtomicBool, agents: &Mutex<Vec<DiscoveredAgent>>) {
    let target = SocketAddrV4::new(multicast_group(), DISCOVERY_PORT);
    let mut probe = OutputMessage::new(anonymous_header(), UDP_TRANSPORT_MTU);
    if probe
        .push_submessage(
            &Submessage::GetInfo(GetInfoPayload {
                info_mask: INFO_ACTIVITY,
            }),
            0,
        )
        .is_err()
    {
        return;
    }
    let probe = probe.into_bytes();
    let mut buf = [0u8; UDP_TRANSPORT_MTU];

    while running.load(Ordering::Acquire) {
        if let Err(e) = socket.send_to(&probe, &SocketAddr::from(target).into()) {
            debug!("probe send failed: {e}");
        }
        // Collect answers for roughly a second, then probe again.
        for _ in 0..10 {
            if !running.load(Ordering::Acquire) {
                return;
            }
            let uninit =
                unsafe { &mut *(&mut buf[..] as *mut [u8] as *mut [MaybeUninit<u8>]) };
            let (n, peer) = match socket.recv_from(uninit) {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            let Some(peer) = peer.as_socket() else {
                continue;
            };
            let Ok(message) = InputMessage::parse(&buf[..n]) else {
                continue;
            };
            for item in message.submessages().flatten() {
                let (subheader, payload) = item;
                if subheader.submessage_id != SUBMSG_INFO {
                    continue;
                }
                if let Ok(Submessage::Info(info)) = parse_payload(&subheader, payload) {
                    let agent = DiscoveredAgent {
                        from: peer,
                        locator: info.locator,
                        version: info.version,
                    };
                    let mut agents = agents.lock();
                    if !agents.contains(&agent) {
                        info!(agent = %agent.from, "remote agent discovered");
                        agents.push(agent);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_info_detection() {
        let mut probe = OutputMessage::new(anonymous_header(), 128);
        probe
            .push_submessage(
                &Submessage::GetInfo(GetInfoPayload {
                    info_mask: INFO_ACTIVITY,
                }),
                0,
            )
            .expect("push");
        assert!(is_get_info(probe.as_bytes()));
        assert!(!is_get_info(b"\x80\x00\x00\x00"));
        assert!(!is_get_info(b""));
    }

    #[test]
    fn test_responder_lifecycle() {
        // Port 0 cannot be multicast-probed portably; just exercise
        // run/stop against an ephemeral port.
        match DiscoveryServer::run(0, Locator::None) {
            Ok(server) => {
                server.stop();
                server.stop();
            }
            Err(TransportError::Init(_)) => {
                // Multicast may be unavailable in sandboxed environments.
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
