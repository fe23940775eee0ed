// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Raw serial device plumbing: open, termios configuration, poll-driven
//! reads, pseudo-terminal creation.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::error::TransportError;

/// Map a numeric baud rate onto the termios speed constant.
fn baud_constant(baud: u32) -> Option<libc::speed_t> {
    let speed = match baud {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        _ => return None,
    };
    Some(speed)
}

/// `access(2)` probe: is the device present and read/writable?
#[must_use]
pub fn device_accessible(path: &str) -> bool {
    let Ok(cpath) = CString::new(path) else {
        return false;
    };
    // SAFETY: cpath is a valid NUL-terminated string.
    unsafe { libc::access(cpath.as_ptr(), libc::W_OK | libc::R_OK) == 0 }
}

/// Open a serial device and configure raw 8N1 termios at `baud`.
pub fn open_serial(path: &str, baud: u32) -> Result<RawFd, TransportError> {
    let speed = baud_constant(baud)
        .ok_or_else(|| TransportError::Init(format!("unsupported baud rate {baud}")))?;
    let cpath = CString::new(path)
        .map_err(|_| TransportError::Init(format!("bad device path {path:?}")))?;

    // SAFETY: plain libc calls on a path we own; fd validity is checked.
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_NOCTTY) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }

    if let Err(e) = configure_termios(fd, speed) {
        // SAFETY: fd came from open above.
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

fn configure_termios(fd: RawFd, speed: libc::speed_t) -> Result<(), TransportError> {
    // SAFETY: zeroed termios is a valid argument for tcgetattr to fill.
    unsafe {
        let mut attrs: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut attrs) != 0 {
            return Err(io::Error::last_os_error().into());
        }
        libc::cfmakeraw(&mut attrs);
        // Read returns as soon as one byte arrives; timeouts come from poll.
        attrs.c_cc[libc::VMIN] = 1;
        attrs.c_cc[libc::VTIME] = 0;
        if libc::cfsetispeed(&mut attrs, speed) != 0
            || libc::cfsetospeed(&mut attrs, speed) != 0
        {
            return Err(io::Error::last_os_error().into());
        }
        if libc::tcsetattr(fd, libc::TCSANOW, &attrs) != 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Wait for `fd` to become readable. `Ok(true)` when readable, `Ok(false)`
/// on timeout, `Err` on poll failure or error/hangup conditions.
pub fn wait_readable(fd: RawFd, timeout_ms: i32) -> Result<bool, TransportError> {
    let mut poll_fd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: poll_fd outlives the call; nfds is 1.
    let rv = unsafe { libc::poll(&mut poll_fd, 1, timeout_ms) };
    if rv < 0 {
        let e = io::Error::last_os_error();
        if e.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(e.into());
    }
    if rv == 0 {
        return Ok(false);
    }
    if poll_fd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
    }
    Ok(poll_fd.revents & libc::POLLIN != 0)
}

/// Read what is available, up to `buf.len()`.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for buf.len() writable bytes.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Write the whole buffer.
pub fn write_all_fd(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        // SAFETY: buf is valid for buf.len() readable bytes.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// Close a device fd.
pub fn close_fd(fd: RawFd) {
    // SAFETY: fd was opened by this module; double-close is the caller's
    // responsibility to avoid.
    unsafe { libc::close(fd) };
}

/// Create a pseudo-terminal pair; returns the master fd and the slave
/// device path clients should open.
pub fn open_pty() -> Result<(RawFd, String), TransportError> {
    // SAFETY: standard posix_openpt/grantpt/unlockpt sequence.
    unsafe {
        let master = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
        if master < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if libc::grantpt(master) != 0 || libc::unlockpt(master) != 0 {
            let e = io::Error::last_os_error();
            libc::close(master);
            return Err(e.into());
        }
        let mut name = [0 as libc::c_char; 128];
        if libc::ptsname_r(master, name.as_mut_ptr(), name.len()) != 0 {
            let e = io::Error::last_os_error();
            libc::close(master);
            return Err(e.into());
        }
        let path = std::ffi::CStr::from_ptr(name.as_ptr())
            .to_string_lossy()
            .into_owned();
        Ok((master, path))
    }
}

/// Convenience: does the path look like a character device we could serve?
#[must_use]
pub fn looks_like_device(path: &str) -> bool {
    Path::new(path).exists()
}
