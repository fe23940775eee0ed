// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP transport: messages framed by a 2-byte little-endian length prefix.
//!
//! Each connection runs a small state machine that survives partial reads:
//!
//! ```text
//! BufferEmpty -> SizeIncomplete -> SizeRead -> MessageIncomplete -> MessageAvailable
//! ```
//!
//! A fixed pool of `TCP_MAX_CONNECTIONS` slots holds active peers; new
//! accepts take a free slot or are refused, and slots recycle on
//! disconnect.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{TCP_MAX_CONNECTIONS, TCP_TRANSPORT_MTU};
use crate::error::TransportError;

use super::{InputPacket, OutputPacket, TimeoutMs, Transport};

/// Length prefix size.
pub const TCP_SIZE_PREFIX: usize = 2;

/// Read-side state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpBufferState {
    BufferEmpty,
    SizeIncomplete,
    SizeRead,
    MessageIncomplete,
    MessageAvailable,
}

/// Incremental reader for length-prefixed messages.
#[derive(Debug)]
pub struct TcpInputBuffer {
    state: TcpBufferState,
    size_bytes: [u8; TCP_SIZE_PREFIX],
    size_read: usize,
    msg_size: usize,
    body: Vec<u8>,
    body_read: usize,
}

impl Default for TcpInputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpInputBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: TcpBufferState::BufferEmpty,
            size_bytes: [0; TCP_SIZE_PREFIX],
            size_read: 0,
            msg_size: 0,
            body: Vec::new(),
            body_read: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> TcpBufferState {
        self.state
    }

    /// Message length once the prefix is complete.
    #[inline]
    #[must_use]
    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    /// Advance the state machine with whatever the stream yields.
    ///
    /// - `Ok(Some(msg))`: a complete message.
    /// - `Ok(None)`: would block; call again on the next readable event.
    /// - `Err`: connection-fatal (including clean EOF).
    pub fn consume<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.state {
                TcpBufferState::BufferEmpty | TcpBufferState::SizeIncomplete => {
                    match reader.read(&mut self.size_bytes[self.size_read..]) {
                        Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                        Ok(n) => {
                            self.size_read += n;
                            if self.size_read < TCP_SIZE_PREFIX {
                                self.state = TcpBufferState::SizeIncomplete;
                                continue;
                            }
                            self.msg_size =
                                usize::from(u16::from_le_bytes(self.size_bytes));
                            self.state = TcpBufferState::SizeRead;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            if self.size_read > 0 {
                                self.state = TcpBufferState::SizeIncomplete;
                            }
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                TcpBufferState::SizeRead => {
                    if self.msg_size == 0 {
                        // Zero-length keep-alive; restart.
                        self.restart();
                        continue;
                    }
                    self.body = vec![0u8; self.msg_size];
                    self.body_read = 0;
                    self.state = TcpBufferState::MessageIncomplete;
                }
                TcpBufferState::MessageIncomplete => {
                    match reader.read(&mut self.body[self.body_read..]) {
                        Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                        Ok(n) => {
                            self.body_read += n;
                            if self.body_read == self.msg_size {
                                self.state = TcpBufferState::MessageAvailable;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                TcpBufferState::MessageAvailable => {
                    let message = std::mem::take(&mut self.body);
                    self.restart();
                    return Ok(Some(message));
                }
            }
        }
    }

    fn restart(&mut self) {
        self.state = TcpBufferState::BufferEmpty;
        self.size_read = 0;
        self.msg_size = 0;
        self.body_read = 0;
    }
}

/// Frame a message for the wire: `[len u16 LE][bytes]`.
#[must_use]
pub fn encode_frame(message: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(TCP_SIZE_PREFIX + message.len());
    framed.extend_from_slice(&(message.len() as u16).to_le_bytes());
    framed.extend_from_slice(message);
    framed
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: TcpInputBuffer,
}

struct Pool {
    slots: Vec<Option<Connection>>,
    free: VecDeque<usize>,
    /// Round-robin cursor so one chatty peer cannot starve the rest.
    next_poll: usize,
}

impl Pool {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).collect(),
            next_poll: 0,
        }
    }

    fn close(&mut self, index: usize) {
        if let Some(conn) = self.slots[index].take() {
            debug!(peer = %conn.peer, "tcp connection closed");
            self.free.push_back(index);
        }
    }
}

/// TCP server transport.
pub struct TcpTransport {
    listener: TcpListener,
    pool: Mutex<Pool>,
    stopping: AtomicBool,
}

impl TcpTransport {
    /// Bind `0.0.0.0:<port>`.
    pub fn bind_v4(port: u16) -> Result<Self, TransportError> {
        Self::bind(SocketAddr::from(([0, 0, 0, 0], port)))
    }

    /// Bind `[::]:<port>`.
    pub fn bind_v6(port: u16) -> Result<Self, TransportError> {
        Self::bind(SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, port)))
    }

    fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| TransportError::Init(format!("bind {addr}: {e}")))?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            pool: Mutex::new(Pool::new(TCP_MAX_CONNECTIONS)),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept pending connections into free slots; refuse when full.
    fn accept_new(&self, pool: &mut Pool) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => match pool.free.pop_front() {
                    Some(index) => {
                        if let Err(e) = stream.set_nonblocking(true) {
                            warn!(%peer, "set_nonblocking failed: {e}");
                            continue;
                        }
                        let _ = stream.set_nodelay(true);
                        debug!(%peer, "tcp connection accepted");
                        pool.slots[index] = Some(Connection {
                            stream,
                            peer,
                            buffer: TcpInputBuffer::new(),
                        });
                    }
                    None => {
                        warn!(%peer, "connection pool full ({TCP_MAX_CONNECTIONS}), peer refused");
                        drop(stream);
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accept error: {e}");
                    return;
                }
            }
        }
    }

    /// One pass over every live connection, starting at the round-robin
    /// cursor. Returns the first complete message found.
    fn poll_connections(&self, pool: &mut Pool) -> Option<InputPacket<SocketAddr>> {
        let capacity = pool.slots.len();
        for step in 0..capacity {
            let index = (pool.next_poll + step) % capacity;
            let Some(conn) = pool.slots[index].as_mut() else {
                continue;
            };
            match conn.buffer.consume(&mut conn.stream) {
                Ok(Some(bytes)) => {
                    let source = conn.peer;
                    pool.next_poll = (index + 1) % capacity;
                    return Some(InputPacket { source, bytes });
                }
                Ok(None) => {}
                Err(e) => {
                    if e.kind() != io::ErrorKind::UnexpectedEof {
                        debug!(peer = %conn.peer, "tcp read error: {e}");
                    }
                    pool.close(index);
                }
            }
        }
        None
    }
}

impl Transport for TcpTransport {
    type Endpoint = SocketAddr;

    fn recv_message(
        &self,
        timeout: TimeoutMs,
    ) -> Result<Option<InputPacket<SocketAddr>>, TransportError> {
        let deadline = match timeout {
            t if t < 0 => None,
            t => Some(Instant::now() + Duration::from_millis(t as u64)),
        };
        loop {
            if self.stopping.load(Ordering::Acquire) {
                return Err(TransportError::Shutdown);
            }
            {
                let mut pool = self.pool.lock();
                self.accept_new(&mut pool);
                if let Some(packet) = self.poll_connections(&mut pool) {
                    return Ok(Some(packet));
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn send_message(&self, packet: &OutputPacket<SocketAddr>) -> Result<(), TransportError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        let framed = encode_frame(&packet.bytes);
        let mut pool = self.pool.lock();
        let slot = pool
            .slots
            .iter_mut()
            .position(|s| s.as_ref().is_some_and(|c| c.peer == packet.destination));
        match slot {
            Some(index) => {
                let conn = pool.slots[index]
                    .as_mut()
                    .ok_or(TransportError::NotConnected)?;
                match conn.stream.write_all(&framed) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        pool.close(index);
                        Err(e.into())
                    }
                }
            }
            None => Err(TransportError::NotConnected),
        }
    }

    fn mtu(&self) -> usize {
        TCP_TRANSPORT_MTU
    }

    fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        let mut pool = self.pool.lock();
        for index in 0..pool.slots.len() {
            pool.close(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that hands out preloaded chunks, then WouldBlock.
    struct ChunkReader {
        chunks: VecDeque<Vec<u8>>,
    }

    impl ChunkReader {
        fn new(chunks: &[&[u8]]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| c.to_vec()).collect(),
            }
        }
    }

    impl Read for ChunkReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.front_mut() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    chunk.drain(..n);
                    if chunk.is_empty() {
                        self.chunks.pop_front();
                    }
                    Ok(n)
                }
            }
        }
    }

    // A message whose length prefix and body arrive one byte at a time.
    #[test]
    fn test_partial_reads_walk_the_states() {
        let message = vec![0x5A; 100];
        let framed = encode_frame(&message);

        let mut buffer = TcpInputBuffer::new();
        assert_eq!(buffer.state(), TcpBufferState::BufferEmpty);

        // First read: one size byte.
        let mut r = ChunkReader::new(&[&framed[0..1]]);
        assert!(buffer.consume(&mut r).expect("consume").is_none());
        assert_eq!(buffer.state(), TcpBufferState::SizeIncomplete);

        // Second read: size complete, body pending.
        let mut r = ChunkReader::new(&[&framed[1..2]]);
        assert!(buffer.consume(&mut r).expect("consume").is_none());
        assert_eq!(buffer.state(), TcpBufferState::MessageIncomplete);
        assert_eq!(buffer.msg_size(), 100);

        // Third read: the whole body. MessageAvailable is consumed
        // internally and the decoded message comes back.
        let mut r = ChunkReader::new(&[&framed[2..]]);
        let decoded = buffer.consume(&mut r).expect("consume").expect("message");
        assert_eq!(decoded, message);
        assert_eq!(buffer.state(), TcpBufferState::BufferEmpty);
    }

    #[test]
    fn test_two_messages_back_to_back() {
        let mut wire = encode_frame(b"first");
        wire.extend_from_slice(&encode_frame(b"second"));
        let mut buffer = TcpInputBuffer::new();
        let mut r = ChunkReader::new(&[&wire]);
        assert_eq!(
            buffer.consume(&mut r).expect("consume").expect("msg"),
            b"first"
        );
        assert_eq!(
            buffer.consume(&mut r).expect("consume").expect("msg"),
            b"second"
        );
        assert!(buffer.consume(&mut r).expect("consume").is_none());
    }

    #[test]
    fn test_eof_is_fatal() {
        struct Eof;
        impl Read for Eof {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
        }
        let mut buffer = TcpInputBuffer::new();
        assert!(buffer.consume(&mut Eof).is_err());
    }

    #[test]
    fn test_zero_length_frame_skipped() {
        let mut wire = encode_frame(b"");
        wire.extend_from_slice(&encode_frame(b"real"));
        let mut buffer = TcpInputBuffer::new();
        let mut r = ChunkReader::new(&[&wire]);
        assert_eq!(
            buffer.consume(&mut r).expect("consume").expect("msg"),
            b"real"
        );
    }

    #[test]
    fn test_transport_roundtrip() {
        let transport = TcpTransport::bind_v4(0).expect("bind");
        let addr = transport.local_addr().expect("addr");
        let target: SocketAddr = format!("127.0.0.1:{}", addr.port()).parse().expect("addr");

        let mut client = TcpStream::connect(target).expect("connect");
        client.write_all(&encode_frame(b"hello agent")).expect("send");

        let packet = transport
            .recv_message(2000)
            .expect("recv")
            .expect("message");
        assert_eq!(packet.bytes, b"hello agent");

        transport
            .send_message(&OutputPacket {
                destination: packet.source,
                bytes: b"hello client".to_vec(),
            })
            .expect("send");

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let mut reply = vec![0u8; 64];
        let mut got = 0;
        while got < 2 + 12 {
            let n = client.read(&mut reply[got..]).expect("read");
            assert!(n > 0);
            got += n;
        }
        assert_eq!(&reply[..2], &(12u16).to_le_bytes());
        assert_eq!(&reply[2..14], b"hello client");
    }

    #[test]
    fn test_send_to_unknown_peer() {
        let transport = TcpTransport::bind_v4(0).expect("bind");
        let err = transport.send_message(&OutputPacket {
            destination: "127.0.0.1:9".parse().expect("addr"),
            bytes: vec![1],
        });
        assert!(matches!(err, Err(TransportError::NotConnected)));
    }

    #[test]
    fn test_disconnect_recycles_slot() {
        let transport = TcpTransport::bind_v4(0).expect("bind");
        let addr = transport.local_addr().expect("addr");
        let target: SocketAddr = format!("127.0.0.1:{}", addr.port()).parse().expect("addr");
        {
            let mut c = TcpStream::connect(target).expect("connect");
            c.write_all(&encode_frame(b"x")).expect("send");
            let packet = transport.recv_message(2000).expect("recv").expect("msg");
            assert_eq!(packet.bytes, b"x");
        }
        // Peer hung up; next poll notices EOF and frees the slot.
        let _ = transport.recv_message(50);
        let pool = transport.pool.lock();
        assert_eq!(pool.free.len(), TCP_MAX_CONNECTIONS);
    }
}
