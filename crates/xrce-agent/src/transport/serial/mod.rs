// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Serial transports: framed streams over raw byte pipes.
//!
//! [`SerialTransport`] serves one device (or a pseudo-terminal master);
//! [`MultiSerialTransport`] supervises a set of devices with hot-plug
//! recovery.

pub mod device;
pub mod framing;
pub mod multi;

pub use multi::MultiSerialTransport;

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::SERIAL_TRANSPORT_MTU;
use crate::error::TransportError;

use super::{InputPacket, OutputPacket, TimeoutMs, Transport};
use framing::{encode_frame, FrameDecoder};

/// Address of the agent on a serial link.
pub const SERIAL_AGENT_ADDR: u8 = 0x00;

/// A peer on a serial link, identified by its frame source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SerialEndPoint(pub u8);

impl fmt::Display for SerialEndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "serial:0x{:02X}", self.0)
    }
}

struct SerialIo {
    fd: RawFd,
    decoder: FrameDecoder,
    /// Frames decoded past the one being returned.
    pending: Vec<framing::Frame>,
}

/// Framed transport over a single serial device or pty master.
pub struct SerialTransport {
    io: Mutex<SerialIo>,
    write_lock: Mutex<()>,
    local_addr: u8,
    stopping: AtomicBool,
    /// Slave path when serving a pseudo-terminal.
    pty_path: Option<String>,
}

impl SerialTransport {
    /// Open a serial device at `baud`.
    pub fn open(path: &str, baud: u32) -> Result<Self, TransportError> {
        let fd = device::open_serial(path, baud)?;
        info!(device = path, baud, "serial port running");
        Ok(Self::from_fd(fd, SERIAL_AGENT_ADDR, None))
    }

    /// Create a pseudo-terminal and serve its master side. The slave path
    /// (for clients) is available via [`SerialTransport::pty_path`].
    pub fn open_pty() -> Result<Self, TransportError> {
        let (master, path) = device::open_pty()?;
        info!(device = %path, "pseudo-terminal running");
        Ok(Self::from_fd(master, SERIAL_AGENT_ADDR, Some(path)))
    }

    fn from_fd(fd: RawFd, local_addr: u8, pty_path: Option<String>) -> Self {
        Self {
            io: Mutex::new(SerialIo {
                fd,
                decoder: FrameDecoder::new(local_addr, SERIAL_TRANSPORT_MTU),
                pending: Vec::new(),
            }),
            write_lock: Mutex::new(()),
            local_addr,
            stopping: AtomicBool::new(false),
            pty_path,
        }
    }

    /// The client-facing device path when serving a pseudo-terminal.
    #[must_use]
    pub fn pty_path(&self) -> Option<&str> {
        self.pty_path.as_deref()
    }
}

impl Transport for SerialTransport {
    type Endpoint = SerialEndPoint;

    fn recv_message(
        &self,
        timeout: TimeoutMs,
    ) -> Result<Option<InputPacket<SerialEndPoint>>, TransportError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        let mut io = self.io.lock();
        if let Some(frame) = take_pending(&mut io.pending) {
            return Ok(Some(InputPacket {
                source: SerialEndPoint(frame.src),
                bytes: frame.payload,
            }));
        }
        if !device::wait_readable(io.fd, timeout)? {
            return Ok(None);
        }
        let mut buf = [0u8; SERIAL_TRANSPORT_MTU];
        let n = device::read_fd(io.fd, &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        let mut frames = io.decoder.feed_slice(&buf[..n]);
        if frames.is_empty() {
            // Mid-frame; state persists for the next read.
            return Ok(None);
        }
        let first = frames.remove(0);
        io.pending.extend(frames);
        debug!(src = first.src, len = first.payload.len(), "serial frame received");
        Ok(Some(InputPacket {
            source: SerialEndPoint(first.src),
            bytes: first.payload,
        }))
    }

    fn send_message(&self, packet: &OutputPacket<SerialEndPoint>) -> Result<(), TransportError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        let wire = encode_frame(self.local_addr, packet.destination.0, &packet.bytes);
        let fd = self.io.lock().fd;
        let _guard = self.write_lock.lock();
        device::write_all_fd(fd, &wire)?;
        Ok(())
    }

    fn mtu(&self) -> usize {
        SERIAL_TRANSPORT_MTU
    }

    fn shutdown(&self) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            device::close_fd(self.io.lock().fd);
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn take_pending(pending: &mut Vec<framing::Frame>) -> Option<framing::Frame> {
    if pending.is_empty() {
        None
    } else {
        Some(pending.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pty_frame_roundtrip() {
        let transport = SerialTransport::open_pty().expect("pty");
        let slave_path = transport.pty_path().expect("slave path").to_string();
        let slave = device::open_serial(&slave_path, 115_200).expect("open slave");

        // Client -> agent.
        let wire = encode_frame(0x01, SERIAL_AGENT_ADDR, b"create client");
        device::write_all_fd(slave, &wire).expect("write");
        let packet = transport
            .recv_message(1000)
            .expect("recv")
            .expect("frame");
        assert_eq!(packet.source, SerialEndPoint(0x01));
        assert_eq!(packet.bytes, b"create client");

        // Agent -> client.
        transport
            .send_message(&OutputPacket {
                destination: SerialEndPoint(0x01),
                bytes: b"status ok".to_vec(),
            })
            .expect("send");
        let mut decoder = FrameDecoder::new(0x01, SERIAL_TRANSPORT_MTU);
        let mut collected = Vec::new();
        while collected.is_empty() {
            assert!(device::wait_readable(slave, 1000).expect("poll"));
            let mut buf = [0u8; 256];
            let n = device::read_fd(slave, &mut buf).expect("read");
            collected = decoder.feed_slice(&buf[..n]);
        }
        assert_eq!(collected[0].payload, b"status ok");
        assert_eq!(collected[0].src, SERIAL_AGENT_ADDR);

        device::close_fd(slave);
    }

    #[test]
    fn test_recv_timeout() {
        let transport = SerialTransport::open_pty().expect("pty");
        assert!(transport.recv_message(20).expect("recv").is_none());
    }

    #[test]
    fn test_two_frames_one_read() {
        let transport = SerialTransport::open_pty().expect("pty");
        let slave_path = transport.pty_path().expect("slave path").to_string();
        let slave = device::open_serial(&slave_path, 115_200).expect("open slave");

        let mut wire = encode_frame(0x01, SERIAL_AGENT_ADDR, b"first");
        wire.extend_from_slice(&encode_frame(0x02, SERIAL_AGENT_ADDR, b"second"));
        device::write_all_fd(slave, &wire).expect("write");

        let a = transport.recv_message(1000).expect("recv").expect("frame");
        assert_eq!(a.bytes, b"first");
        // The second frame may arrive in the same read (pending queue) or
        // the next one.
        let b = transport.recv_message(1000).expect("recv").expect("frame");
        assert_eq!(b.bytes, b"second");
        assert_eq!(b.source, SerialEndPoint(0x02));

        device::close_fd(slave);
    }
}
