//! The `Device` descriptor wrapper and the `Pollable` seam.
//!
//! A [`Device`] owns one OS descriptor together with the reactor-facing state
//! attached to it: the desired interest mask and an optional per-device
//! timeout.  Socket types embed a `Device` and expose it through the
//! [`Pollable`] trait, which is what [`DeviceGroup`](crate::DeviceGroup)
//! operates on.
//!
//! Mutators on `Device` are plain state changes.  While a device is appended
//! to a group, the group synchronises kernel registration with this state
//! when the mutable borrow obtained from
//! [`DeviceGroup::get_mut`](crate::DeviceGroup::get_mut) is released, so
//! repeated or redundant changes cost nothing.

use std::io;
use std::os::fd::RawFd;

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Desired readiness interest of a device.  Empty means idle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mode: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        /// The device has been shut down; the group deregisters it on sync.
        const CLOSED = 0x80;
    }
}

/// Errors raised by descriptor-level operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device has no descriptor (never opened, closed, or taken).
    #[error("invalid device: no descriptor")]
    Invalid,

    /// The underlying descriptor operation failed.
    #[error("descriptor operation failed: {0}")]
    Os(#[from] io::Error),
}

/// One OS descriptor plus its reactor bookkeeping.
#[derive(Debug)]
pub struct Device {
    fd: RawFd,
    mode: Mode,
    /// Timeout in milliseconds; negative disables the timeout.
    timeout: i64,
}

impl Device {
    /// Creates a detached device without a descriptor.
    pub fn new() -> Self {
        Device {
            fd: -1,
            mode: Mode::empty(),
            timeout: -1,
        }
    }

    /// Wraps an existing descriptor.  The device takes ownership and closes
    /// it on [`Device::close`] or drop unless [`Device::take_fd`] is called.
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Device {
            fd,
            mode: Mode::empty(),
            timeout: -1,
        }
    }

    /// Whether the device currently owns a descriptor.
    pub fn is_valid(&self) -> bool {
        self.fd != -1
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Returns the descriptor and leaves the device invalid.  Used to
    /// re-parent a descriptor into another wrapper.
    pub fn take_fd(&mut self) -> RawFd {
        std::mem::replace(&mut self.fd, -1)
    }

    /// Installs a freshly allocated descriptor, closing any previous one.
    /// Mode and timeout are left untouched.
    pub fn adopt_fd(&mut self, fd: RawFd) {
        if self.fd != -1 {
            // Safety: the old descriptor was owned by this device.
            unsafe {
                libc::close(self.fd);
            }
        }
        self.fd = fd;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Replaces the interest mask.  No-op if unchanged.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn add_mode(&mut self, mode: Mode) {
        self.set_mode(self.mode | mode);
    }

    pub fn remove_mode(&mut self, mode: Mode) {
        self.set_mode(self.mode - mode);
    }

    /// Timeout in milliseconds; negative means none.
    pub fn timeout(&self) -> i64 {
        self.timeout
    }

    /// Sets the per-device timeout in milliseconds.  Any negative value
    /// disables the timeout (the device leaves the group's timeout queue on
    /// the next sync); a non-negative value re-arms it from scratch.
    pub fn set_timeout(&mut self, milliseconds: i64) {
        self.timeout = milliseconds;
    }

    /// Toggles the OS non-blocking flag on the descriptor.
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), DeviceError> {
        if !self.is_valid() {
            return Err(DeviceError::Invalid);
        }

        // Safety: fd is a valid open descriptor owned by this device.
        unsafe {
            let flags = libc::fcntl(self.fd, libc::F_GETFL, 0);
            if flags == -1 {
                return Err(io::Error::last_os_error().into());
            }
            let flags = if nonblocking {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            };
            if libc::fcntl(self.fd, libc::F_SETFL, flags) == -1 {
                return Err(io::Error::last_os_error().into());
            }
        }

        Ok(())
    }

    /// Closes the descriptor and marks the device closed.  Safe to call
    /// repeatedly.
    pub fn close(&mut self) {
        if self.fd != -1 {
            let fd = std::mem::replace(&mut self.fd, -1);
            // Safety: fd was owned by this device and is closed exactly once.
            unsafe {
                libc::close(fd);
            }
        }
        self.mode = Mode::CLOSED;
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::new()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.fd != -1 {
            // Safety: sole owner of the descriptor.
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// The seam between concrete device types and the reactor.
///
/// `read` and `write` follow `std::io` conventions: `Ok(0)` is end of
/// stream, `ErrorKind::WouldBlock` means "retry after the reactor reports
/// readiness".  Implementations adjust their device's mode when the
/// underlying engine needs a different readiness condition next (the TLS
/// socket does this during its handshake).
pub trait Pollable {
    fn device(&self) -> &Device;
    fn device_mut(&mut self) -> &mut Device;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn close(&mut self) {
        self.device_mut().close();
    }
}

impl<P: Pollable + ?Sized> Pollable for Box<P> {
    fn device(&self) -> &Device {
        (**self).device()
    }

    fn device_mut(&mut self) -> &mut Device {
        (**self).device_mut()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_device_is_invalid_and_idle() {
        let dev = Device::new();
        assert!(!dev.is_valid());
        assert_eq!(dev.mode(), Mode::empty());
        assert_eq!(dev.timeout(), -1);
    }

    #[test]
    fn test_mode_arithmetic() {
        let mut dev = Device::new();
        dev.add_mode(Mode::READ);
        dev.add_mode(Mode::WRITE);
        assert_eq!(dev.mode(), Mode::READ | Mode::WRITE);
        dev.remove_mode(Mode::READ);
        assert_eq!(dev.mode(), Mode::WRITE);
    }

    #[test]
    fn test_set_nonblocking_on_invalid_device_fails() {
        let mut dev = Device::new();
        assert!(matches!(
            dev.set_nonblocking(true),
            Err(DeviceError::Invalid)
        ));
    }

    #[test]
    fn test_take_fd_leaves_device_invalid() {
        let mut fds = [0; 2];
        // Safety: plain pipe creation into a stack array.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut dev = Device::from_raw_fd(fds[0]);
        assert!(dev.is_valid());

        let taken = dev.take_fd();
        assert_eq!(taken, fds[0]);
        assert!(!dev.is_valid());

        unsafe {
            libc::close(taken);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_close_marks_device_closed() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut dev = Device::from_raw_fd(fds[0]);
        dev.set_mode(Mode::READ);
        dev.close();
        assert!(!dev.is_valid());
        assert_eq!(dev.mode(), Mode::CLOSED);
        unsafe {
            libc::close(fds[1]);
        }
    }
}
