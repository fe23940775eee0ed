// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multi-serial supervision: serve several devices at once, reopening
//! them as they come and go.
//!
//! A background supervisor probes the wait list with `access(2)` every
//! 10 ms; devices that open successfully are configured and joined to the
//! active poll set. An I/O error on an active device sends its path back
//! to the wait list. When every device has failed the supervisor is
//! simply probing the full original list again, which is the reinit path.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::SERIAL_TRANSPORT_MTU;
use crate::error::TransportError;

use super::super::{InputPacket, OutputPacket, TimeoutMs, Transport};
use super::device;
use super::framing::{encode_frame, Frame, FrameDecoder};
use super::{SerialEndPoint, SERIAL_AGENT_ADDR};

/// Supervisor probe cadence for unavailable devices.
const REOPEN_PERIOD: Duration = Duration::from_millis(10);

struct ActiveDevice {
    path: String,
    decoder: FrameDecoder,
}

struct State {
    /// Device paths waiting to be (re)opened.
    waiting: Vec<String>,
    /// Open devices by fd.
    active: HashMap<RawFd, ActiveDevice>,
    /// Which fd last carried each peer address, for reply routing.
    routes: HashMap<u8, RawFd>,
    /// Decoded frames not yet handed to the server.
    pending: Vec<Frame>,
}

struct Shared {
    state: Mutex<State>,
    baud: u32,
    local_addr: u8,
    running: AtomicBool,
}

impl Shared {
    /// Close a failed fd and return its device to the wait list.
    fn handle_error(&self, fd: RawFd) {
        let mut state = self.state.lock();
        if let Some(dev) = state.active.remove(&fd) {
            warn!(device = %dev.path, fd, "serial device error, returning to wait list");
            device::close_fd(fd);
            state.routes.retain(|_, &mut route| route != fd);
            state.waiting.push(dev.path);
        }
    }
}

/// Transport over a supervised set of serial devices.
pub struct MultiSerialTransport {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl MultiSerialTransport {
    /// Start supervising `devices`. Succeeds even when none open yet; the
    /// supervisor keeps trying in the background.
    pub fn open(devices: Vec<String>, baud: u32) -> Result<Arc<Self>, TransportError> {
        if devices.is_empty() {
            return Err(TransportError::Init("no serial devices given".into()));
        }
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                waiting: devices,
                active: HashMap::new(),
                routes: HashMap::new(),
                pending: Vec::new(),
            }),
            baud,
            local_addr: SERIAL_AGENT_ADDR,
            running: AtomicBool::new(true),
        });
        let supervisor = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("xrce-serial-supervisor".into())
                .spawn(move || supervisor_loop(&shared))
                .map_err(|e| TransportError::Init(format!("spawn supervisor: {e}")))?
        };
        Ok(Arc::new(Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        }))
    }

    /// Number of currently open devices.
    #[must_use]
    pub fn active_devices(&self) -> usize {
        self.shared.state.lock().active.len()
    }
}

fn supervisor_loop(shared: &Shared) {
    while shared.running.load(Ordering::Acquire) {
        {
            let mut state = shared.state.lock();
            let mut still_waiting = Vec::new();
            for path in std::mem::take(&mut state.waiting) {
                if !device::device_accessible(&path) {
                    // EACCES/EBUSY/missing: keep probing.
                    still_waiting.push(path);
                    continue;
                }
                match device::open_serial(&path, shared.baud) {
                    Ok(fd) => {
                        info!(device = %path, fd, "serial port running");
                        state.active.insert(
                            fd,
                            ActiveDevice {
                                path,
                                decoder: FrameDecoder::new(
                                    shared.local_addr,
                                    SERIAL_TRANSPORT_MTU,
                                ),
                            },
                        );
                    }
                    Err(e) => {
                        debug!(device = %path, "open failed, will retry: {e}");
                        still_waiting.push(path);
                    }
                }
            }
            state.waiting = still_waiting;
        }
        std::thread::sleep(REOPEN_PERIOD);
    }
}

impl Transport for MultiSerialTransport {
    type Endpoint = SerialEndPoint;

    fn recv_message(
        &self,
        timeout: TimeoutMs,
    ) -> Result<Option<InputPacket<SerialEndPoint>>, TransportError> {
        let shared = &self.shared;
        if !shared.running.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }

        // Drain previously decoded frames first.
        {
            let mut state = shared.state.lock();
            if !state.pending.is_empty() {
                let frame = state.pending.remove(0);
                return Ok(Some(InputPacket {
                    source: SerialEndPoint(frame.src),
                    bytes: frame.payload,
                }));
            }
        }

        let fds: Vec<RawFd> = shared.state.lock().active.keys().copied().collect();
        if fds.is_empty() {
            // Nothing open yet; give the supervisor room to work.
            std::thread::sleep(Duration::from_millis(timeout.clamp(0, 100) as u64));
            return Ok(None);
        }

        let mut poll_fds: Vec<libc::pollfd> = fds
            .iter()
            .map(|&fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        // SAFETY: poll_fds is a valid array for the duration of the call.
        let rv = unsafe {
            libc::poll(
                poll_fds.as_mut_ptr(),
                poll_fds.len() as libc::nfds_t,
                timeout,
            )
        };
        if rv < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(e.into());
        }
        if rv == 0 {
            return Ok(None);
        }

        for poll_fd in &poll_fds {
            if poll_fd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                shared.handle_error(poll_fd.fd);
                continue;
            }
            if poll_fd.revents & libc::POLLIN == 0 {
                continue;
            }
            let mut buf = [0u8; SERIAL_TRANSPORT_MTU];
            let n = match device::read_fd(poll_fd.fd, &mut buf) {
                Ok(0) => {
                    shared.handle_error(poll_fd.fd);
                    continue;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(fd = poll_fd.fd, "serial read error: {e}");
                    shared.handle_error(poll_fd.fd);
                    continue;
                }
            };
            let mut state = shared.state.lock();
            let Some(dev) = state.active.get_mut(&poll_fd.fd) else {
                continue;
            };
            let frames = dev.decoder.feed_slice(&buf[..n]);
            for frame in &frames {
                state.routes.insert(frame.src, poll_fd.fd);
            }
            state.pending.extend(frames);
            if !state.pending.is_empty() {
                let frame = state.pending.remove(0);
                return Ok(Some(InputPacket {
                    source: SerialEndPoint(frame.src),
                    bytes: frame.payload,
                }));
            }
        }
        Ok(None)
    }

    fn send_message(&self, packet: &OutputPacket<SerialEndPoint>) -> Result<(), TransportError> {
        let shared = &self.shared;
        if !shared.running.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        let fd = {
            let state = shared.state.lock();
            state
                .routes
                .get(&packet.destination.0)
                .copied()
                .or_else(|| state.active.keys().next().copied())
                .ok_or(TransportError::NotConnected)?
        };
        let wire = encode_frame(shared.local_addr, packet.destination.0, &packet.bytes);
        if let Err(e) = device::write_all_fd(fd, &wire) {
            shared.handle_error(fd);
            return Err(e.into());
        }
        Ok(())
    }

    fn mtu(&self) -> usize {
        SERIAL_TRANSPORT_MTU
    }

    fn shutdown(&self) {
        let shared = &self.shared;
        if shared.running.swap(false, Ordering::AcqRel) {
            if let Some(handle) = self.supervisor.lock().take() {
                let _ = handle.join();
            }
            let mut state = shared.state.lock();
            for (&fd, dev) in &state.active {
                debug!(device = %dev.path, "closing serial device");
                device::close_fd(fd);
            }
            state.active.clear();
            state.routes.clear();
        }
    }
}

impl Drop for MultiSerialTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
