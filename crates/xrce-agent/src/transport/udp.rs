// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP transport: one datagram carries one complete XRCE message. The
//! source `IP:port` pair identifies the client endpoint.

use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::UDP_TRANSPORT_MTU;
use crate::error::TransportError;

use super::{InputPacket, OutputPacket, TimeoutMs, Transport};

/// UDP server socket, IPv4 or IPv6.
pub struct UdpTransport {
    socket: Socket,
    stopping: AtomicBool,
}

impl UdpTransport {
    /// Bind `0.0.0.0:<port>`.
    pub fn bind_v4(port: u16) -> Result<Self, TransportError> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        Self::bind(addr, Domain::IPV4)
    }

    /// Bind `[::]:<port>`.
    pub fn bind_v6(port: u16) -> Result<Self, TransportError> {
        let addr: SocketAddr = (std::net::Ipv6Addr::UNSPECIFIED, port).into();
        Self::bind(addr, Domain::IPV6)
    }

    fn bind(addr: SocketAddr, domain: Domain) -> Result<Self, TransportError> {
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket
            .bind(&addr.into())
            .map_err(|e| TransportError::Init(format!("bind {addr}: {e}")))?;
        Ok(Self {
            socket,
            stopping: AtomicBool::new(false),
        })
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| TransportError::Init("no local socket address".into()))
    }
}

impl Transport for UdpTransport {
    type Endpoint = SocketAddr;

    fn recv_message(
        &self,
        timeout: TimeoutMs,
    ) -> Result<Option<InputPacket<SocketAddr>>, TransportError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        let timeout = match timeout {
            t if t < 0 => None,
            0 => Some(Duration::from_millis(1)),
            t => Some(Duration::from_millis(t as u64)),
        };
        self.socket.set_read_timeout(timeout)?;

        let mut buf = [0u8; UDP_TRANSPORT_MTU];
        // socket2 reads into MaybeUninit; the buffer is zero-initialized.
        let uninit =
            unsafe { &mut *(&mut buf[..] as *mut [u8] as *mut [MaybeUninit<u8>]) };
        match self.socket.recv_from(uninit) {
            Ok((n, addr)) => {
                if self.stopping.load(Ordering::Acquire) {
                    return Err(TransportError::Shutdown);
                }
                let source = addr
                    .as_socket()
                    .ok_or_else(|| TransportError::Init("invalid peer address".into()))?;
                Ok(Some(InputPacket {
                    source,
                    bytes: buf[..n].to_vec(),
                }))
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if self.stopping.load(Ordering::Acquire) {
                    Err(TransportError::Shutdown)
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send_message(&self, packet: &OutputPacket<SocketAddr>) -> Result<(), TransportError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        self.socket
            .send_to(&packet.bytes, &packet.destination.into())?;
        Ok(())
    }

    fn mtu(&self) -> usize {
        UDP_TRANSPORT_MTU
    }

    fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
    }
}
