//! Non-blocking TCP socket device.
//!
//! [`Socket`] layers TCP semantics over a [`Device`]: connect/bind/listen/
//! accept plus thin `recv`/`send` wrappers that maintain per-connection byte
//! counters.  Everything is written for non-blocking reactor use: a connect
//! still in progress is success (completion shows up as writability), an
//! `accept` with nothing pending is not an error, and reads/writes surface
//! `WouldBlock` untouched.

pub mod addr;
pub mod tls;

pub use addr::{Anonymized, IpAddress};
pub use tls::TlsSocket;

use std::ffi::CStr;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, warn};

use crate::device::{Device, DeviceError, Mode, Pollable};

/// Socket-level failure conditions.
///
/// Transient conditions (`EAGAIN`, connect-in-progress) are deliberately not
/// represented here: they travel as `WouldBlock` I/O errors or as `Ok`
/// results per the non-blocking contract.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("address resolution failed for {host}:{port}")]
    AddrInfo { host: String, port: u16 },

    #[error("socket allocation failed: {0}")]
    Allocation(#[source] io::Error),

    #[error("enabling address reuse failed: {0}")]
    ReuseAddr(#[source] io::Error),

    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),

    #[error("listen failed: {0}")]
    Listen(#[source] io::Error),

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("connection timed out")]
    Timeout,

    #[error("socket is not open")]
    InvalidSocket,

    #[error("address family does not match the operation")]
    InvalidAddress,

    #[error("invalid device: {0}")]
    Device(#[from] DeviceError),

    #[error("TLS failure: {0}")]
    Tls(String),
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct SocketFlags: u16 {
        const REUSE_ADDR   = 0x0001;
        const NON_BLOCKING = 0x0002;
        const RESOLVE_NAME = 0x0004;
        const NO_DELAY     = 0x0008;
        /// TLS handshake still pending on an accepted connection.
        const IN_ACCEPT    = 0x0100;
    }
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(any(target_os = "macos", target_os = "ios"))]
const SEND_FLAGS: libc::c_int = 0;

/// A TCP socket device.
#[derive(Debug)]
pub struct Socket {
    dev: Device,
    hostname: String,
    addr: IpAddress,
    port: u16,
    flags: SocketFlags,
    bytes_sent: u64,
    bytes_received: u64,
    io_timeout: Option<Duration>,
}

impl Socket {
    pub fn new() -> Self {
        Socket {
            dev: Device::new(),
            hostname: "localhost".to_string(),
            addr: IpAddress::default(),
            port: 0,
            flags: SocketFlags::empty(),
            bytes_sent: 0,
            bytes_received: 0,
            io_timeout: None,
        }
    }

    /// Wraps an already connected descriptor.
    pub fn from_raw_fd(fd: RawFd, hostname: &str, port: u16) -> Self {
        let mut sock = Socket::new();
        sock.dev = Device::from_raw_fd(fd);
        sock.hostname = hostname.to_string();
        sock.port = port;
        sock
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> IpAddress {
        self.addr
    }

    /// Bytes received since creation.
    pub fn rx(&self) -> u64 {
        self.bytes_received
    }

    /// Bytes sent since creation.
    pub fn tx(&self) -> u64 {
        self.bytes_sent
    }

    pub fn is_nonblocking(&self) -> bool {
        self.flags.contains(SocketFlags::NON_BLOCKING)
    }

    /// Whether a pending TLS accept has completed (always true for plain
    /// sockets).
    pub fn is_accepted(&self) -> bool {
        !self.flags.contains(SocketFlags::IN_ACCEPT)
    }

    /// Requests `SO_REUSEADDR` for subsequent binds.
    pub fn set_reuse_addr(&mut self, reuse: bool) {
        self.flags.set(SocketFlags::REUSE_ADDR, reuse);
    }

    /// Requests `TCP_NODELAY` for subsequent connects and accepts.
    pub fn set_no_delay(&mut self, no_delay: bool) {
        self.flags.set(SocketFlags::NO_DELAY, no_delay);
    }

    /// Enables reverse name resolution for accepted peers.  Off by default:
    /// a reverse lookup per accept can slow a busy server down noticeably.
    pub fn set_resolve_hostnames(&mut self, resolve: bool) {
        self.flags.set(SocketFlags::RESOLVE_NAME, resolve);
    }

    /// Sets the non-blocking flag, applying it immediately when a
    /// descriptor exists and at allocation time otherwise.
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), DeviceError> {
        self.flags.set(SocketFlags::NON_BLOCKING, nonblocking);
        if !self.dev.is_valid() {
            return Ok(());
        }
        self.dev.set_nonblocking(nonblocking)
    }

    /// Sets `SO_RCVTIMEO`/`SO_SNDTIMEO`.  Only meaningful on blocking
    /// sockets; the reactor path uses per-device timeouts instead.
    pub fn set_socket_timeout(&mut self, timeout: Option<Duration>) -> Result<(), SocketError> {
        self.io_timeout = timeout;
        if self.dev.is_valid() {
            self.apply_socket_timeout(timeout)?;
        }
        Ok(())
    }

    fn apply_socket_timeout(&self, timeout: Option<Duration>) -> Result<(), SocketError> {
        let tv = match timeout {
            Some(timeout) => libc::timeval {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_usec: timeout.subsec_micros() as libc::suseconds_t,
            },
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        for opt in [libc::SO_RCVTIMEO, libc::SO_SNDTIMEO] {
            // Safety: tv is a valid timeval for the duration of the call.
            let rc = unsafe {
                libc::setsockopt(
                    self.dev.fd(),
                    libc::SOL_SOCKET,
                    opt,
                    &tv as *const libc::timeval as *const libc::c_void,
                    std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(SocketError::Device(DeviceError::Os(
                    io::Error::last_os_error(),
                )));
            }
        }
        Ok(())
    }

    /// Connects to an IPv4 peer.  A connect still in progress on a
    /// non-blocking socket is success; completion is observed later as
    /// writability in the reactor.
    pub fn connect(&mut self, hostname: &str, port: u16) -> Result<(), SocketError> {
        self.connect_family(hostname, port, false)
    }

    /// Connects to an IPv6 peer.
    pub fn connect_v6(&mut self, hostname: &str, port: u16) -> Result<(), SocketError> {
        self.connect_family(hostname, port, true)
    }

    fn connect_family(&mut self, hostname: &str, port: u16, v6: bool) -> Result<(), SocketError> {
        if self.dev.is_valid() {
            warn!("closing stale socket");
            self.close();
        }
        self.dev.set_mode(Mode::empty());

        let target = resolve(hostname, port, v6)?;
        let family = if v6 { libc::AF_INET6 } else { libc::AF_INET };

        // Safety: plain socket allocation.
        let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            debug!("connect {hostname}:{port}: {err}");
            return Err(SocketError::Allocation(err));
        }
        self.dev.adopt_fd(fd);
        disable_sigpipe(fd);

        if self.flags.contains(SocketFlags::NO_DELAY) {
            set_no_delay(fd);
        }
        if let Err(e) = self
            .dev
            .set_nonblocking(self.flags.contains(SocketFlags::NON_BLOCKING))
        {
            debug!("connect {hostname}:{port}: {e}");
        }
        if self.io_timeout.is_some() {
            if let Err(e) = self.apply_socket_timeout(self.io_timeout) {
                self.close();
                return Err(e);
            }
        }

        let (storage, len) = sockaddr_of(&target);
        // Safety: storage holds a valid sockaddr of length len.
        let rc = unsafe {
            libc::connect(
                fd,
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                debug!("connect {hostname}:{port}: {err}");
                self.close();
                return Err(if err.raw_os_error() == Some(libc::ETIMEDOUT) {
                    SocketError::Timeout
                } else {
                    SocketError::Connect(err)
                });
            }
        }

        self.hostname = hostname.to_string();
        self.port = port;
        self.addr = IpAddress::from(target.ip());
        Ok(())
    }

    /// Binds an IPv4 listener address.  Requesting port 0 binds an
    /// ephemeral port; `port()` reports the OS-assigned value afterwards.
    pub fn bind(&mut self, ip: IpAddress, port: u16) -> Result<(), SocketError> {
        self.bind_family(ip, port, false)
    }

    /// Binds an IPv6 listener address.
    pub fn bind_v6(&mut self, ip: IpAddress, port: u16) -> Result<(), SocketError> {
        self.bind_family(ip, port, true)
    }

    fn bind_family(&mut self, ip: IpAddress, port: u16, v6: bool) -> Result<(), SocketError> {
        self.port = port;
        let family = if v6 { libc::AF_INET6 } else { libc::AF_INET };

        // Safety: plain socket allocation.
        let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, libc::IPPROTO_TCP) };
        if fd < 0 {
            return Err(SocketError::Allocation(io::Error::last_os_error()));
        }
        self.dev.adopt_fd(fd);
        disable_sigpipe(fd);

        if self.flags.contains(SocketFlags::REUSE_ADDR) {
            let arg: libc::c_int = 1;
            // Safety: arg is a valid int for the duration of the call.
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_REUSEADDR,
                    &arg as *const libc::c_int as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(SocketError::ReuseAddr(io::Error::last_os_error()));
            }
        }

        if let Err(e) = self
            .dev
            .set_nonblocking(self.flags.contains(SocketFlags::NON_BLOCKING))
        {
            debug!("bind {ip}:{port}: {e}");
        }

        let target = match (v6, ip) {
            (false, IpAddress::V4(octets)) => {
                SocketAddr::from((std::net::Ipv4Addr::from(octets), port))
            }
            (false, IpAddress::V6(_)) => return Err(SocketError::InvalidAddress),
            (true, ip) => SocketAddr::from((std::net::Ipv6Addr::from(ip.to_v6_octets()), port)),
        };
        let (storage, len) = sockaddr_of(&target);

        // Safety: storage holds a valid sockaddr of length len.
        let rc = unsafe {
            libc::bind(
                fd,
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if rc == -1 {
            debug!("bind: {}", io::Error::last_os_error());
            self.close();
            return Err(SocketError::Bind(io::Error::last_os_error()));
        }

        // Read back the OS-assigned port when 0 was requested.
        let mut assigned: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut assigned_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // Safety: assigned is valid storage for the kernel to fill in.
        let rc = unsafe {
            libc::getsockname(
                fd,
                &mut assigned as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut assigned_len,
            )
        };
        if rc != 0 {
            debug!("getsockname: {}", io::Error::last_os_error());
            self.close();
            return Err(SocketError::Bind(io::Error::last_os_error()));
        }
        if let Some((_, assigned_port)) = addr_of_storage(&assigned) {
            self.port = assigned_port;
        }

        self.addr = ip;
        Ok(())
    }

    /// Starts listening for connections.
    pub fn listen(&mut self, backlog: i32) -> Result<(), SocketError> {
        if !self.dev.is_valid() {
            return Err(SocketError::InvalidSocket);
        }
        // Safety: fd is a valid bound socket.
        if unsafe { libc::listen(self.dev.fd(), backlog) } == -1 {
            return Err(SocketError::Listen(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Accepts one pending connection.  `Ok(None)` means nothing is pending
    /// right now, which is the normal case under non-blocking edge-triggered
    /// operation and intentionally not logged.  The listener's NoDelay and
    /// name-resolution settings carry over to the accepted socket.
    pub fn accept(&mut self) -> Result<Option<Socket>, SocketError> {
        if !self.dev.is_valid() {
            return Err(SocketError::InvalidSocket);
        }

        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // Safety: storage is valid for the kernel to fill in.
        let fd = unsafe {
            libc::accept(
                self.dev.fd(),
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            debug!("accept: {err}");
            return Err(SocketError::Accept(err));
        }

        let mut sock = Socket::new();
        sock.dev.adopt_fd(fd);

        if let Some((addr, port)) = addr_of_storage(&storage) {
            sock.addr = addr;
            sock.port = port;
        }
        if self.flags.contains(SocketFlags::RESOLVE_NAME) {
            sock.flags |= SocketFlags::RESOLVE_NAME;
            if let Some(name) = reverse_lookup(&storage, len) {
                sock.hostname = name;
            }
        }
        if self.flags.contains(SocketFlags::NO_DELAY) {
            sock.flags |= SocketFlags::NO_DELAY;
            set_no_delay(fd);
        }

        Ok(Some(sock))
    }

    /// Convenience text write.
    pub fn send(&mut self, text: &str) -> io::Result<usize> {
        self.write(text.as_bytes())
    }

    /// Half-closes both directions without releasing the descriptor.
    pub fn shutdown(&mut self) {
        if !self.dev.is_valid() {
            return;
        }
        // Safety: fd is a valid socket.
        unsafe {
            libc::shutdown(self.dev.fd(), libc::SHUT_RDWR);
        }
    }

    /// Closes the descriptor and marks the device closed.
    pub fn close(&mut self) {
        self.dev.close();
        self.flags.remove(SocketFlags::IN_ACCEPT);
    }
}

impl Default for Socket {
    fn default() -> Self {
        Socket::new()
    }
}

impl Pollable for Socket {
    fn device(&self) -> &Device {
        &self.dev
    }

    fn device_mut(&mut self) -> &mut Device {
        &mut self.dev
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = recv_raw(self.dev.fd(), buf)?;
        self.bytes_received += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = send_raw(self.dev.fd(), buf)?;
        self.bytes_sent += n as u64;
        Ok(n)
    }

    fn close(&mut self) {
        Socket::close(self);
    }
}

// ── Raw call helpers ──────────────────────────────────────────────────────────

pub(crate) fn recv_raw(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // Safety: buf is valid writable memory of the stated length.
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub(crate) fn send_raw(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // Safety: buf is valid readable memory of the stated length.
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            SEND_FLAGS,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn set_no_delay(fd: RawFd) {
    let flag: libc::c_int = 1;
    // Safety: flag is a valid int for the duration of the call.
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &flag as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn disable_sigpipe(fd: RawFd) {
    let flag: libc::c_int = 1;
    // Safety: flag is a valid int for the duration of the call.
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &flag as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn disable_sigpipe(_fd: RawFd) {}

/// Resolves via the system resolver and picks the first address of the
/// requested family.
fn resolve(hostname: &str, port: u16, v6: bool) -> Result<SocketAddr, SocketError> {
    let addrs = (hostname, port).to_socket_addrs().map_err(|e| {
        debug!("resolve {hostname}:{port}: {e}");
        SocketError::AddrInfo {
            host: hostname.to_string(),
            port,
        }
    })?;
    addrs
        .into_iter()
        .find(|addr| addr.is_ipv6() == v6)
        .ok_or(SocketError::AddrInfo {
            host: hostname.to_string(),
            port,
        })
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // Safety: sockaddr structs are plain old data; unset fields stay zero.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
            // Safety: sockaddr_storage is large and aligned enough for any
            // sockaddr variant.
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
            // Safety: as above.
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

fn addr_of_storage(storage: &libc::sockaddr_storage) -> Option<(IpAddress, u16)> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            // Safety: the kernel filled in a sockaddr_in for AF_INET.
            let sin =
                unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
            Some((
                IpAddress::V4(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            ))
        }
        libc::AF_INET6 => {
            // Safety: the kernel filled in a sockaddr_in6 for AF_INET6.
            let sin6 = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
            };
            Some((
                IpAddress::V6(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
            ))
        }
        _ => None,
    }
}

fn reverse_lookup(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<String> {
    let mut buf = [0 as libc::c_char; 512];
    // Safety: buf is valid for the stated length; storage holds the peer
    // address as filled in by accept.
    let rc = unsafe {
        libc::getnameinfo(
            storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
            buf.as_mut_ptr(),
            buf.len() as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            0,
        )
    };
    if rc != 0 {
        return None;
    }
    // Safety: getnameinfo null-terminates on success.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port_reports_assignment() {
        let mut sock = Socket::new();
        sock.set_reuse_addr(true);
        sock.bind("127.0.0.1".parse().expect("parse failed"), 0)
            .expect("bind failed");
        assert_ne!(sock.port(), 0);
        assert_eq!(sock.address().to_string(), "127.0.0.1");
    }

    #[test]
    fn test_accept_without_client_is_not_an_error() {
        let mut sock = Socket::new();
        sock.set_reuse_addr(true);
        sock.set_nonblocking(true).expect("nonblocking failed");
        sock.bind("127.0.0.1".parse().expect("parse failed"), 0)
            .expect("bind failed");
        sock.listen(4).expect("listen failed");
        assert!(sock.accept().expect("accept errored").is_none());
    }

    #[test]
    fn test_listen_on_closed_socket_fails() {
        let mut sock = Socket::new();
        assert!(matches!(sock.listen(4), Err(SocketError::InvalidSocket)));
    }

    #[test]
    fn test_loopback_data_counts_bytes() {
        let mut listener = Socket::new();
        listener.set_reuse_addr(true);
        listener
            .bind("127.0.0.1".parse().expect("parse failed"), 0)
            .expect("bind failed");
        listener.listen(4).expect("listen failed");

        let mut client = Socket::new();
        client
            .connect("127.0.0.1", listener.port())
            .expect("connect failed");

        let mut accepted = listener
            .accept()
            .expect("accept errored")
            .expect("no pending connection");

        let sent = client.write(b"ping").expect("write failed");
        assert_eq!(sent, 4);
        assert_eq!(client.tx(), 4);

        let mut buf = [0u8; 16];
        let received = accepted.read(&mut buf).expect("read failed");
        assert_eq!(&buf[..received], b"ping");
        assert_eq!(accepted.rx(), 4);
    }
}
