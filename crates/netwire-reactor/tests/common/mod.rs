//! Shared test device: a pipe read end with an owned write end.

use std::io;

use netwire_reactor::{Device, Mode, Pollable};

/// A readable device backed by an anonymous pipe.  Writing to
/// [`PipeDevice::feed`] makes the read end ready.
pub struct PipeDevice {
    dev: Device,
    write_end: Device,
}

impl PipeDevice {
    pub fn new() -> Self {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut dev = Device::from_raw_fd(fds[0]);
        dev.set_mode(Mode::READ);
        dev.set_nonblocking(true).expect("nonblocking failed");
        PipeDevice {
            dev,
            write_end: Device::from_raw_fd(fds[1]),
        }
    }

    pub fn with_timeout(ms: i64) -> Self {
        let mut pipe = Self::new();
        pipe.dev.set_timeout(ms);
        pipe
    }

    /// Makes the device readable.
    pub fn feed(&self, data: &[u8]) {
        let n = unsafe {
            libc::write(
                self.write_end.fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
            )
        };
        assert_eq!(n, data.len() as isize);
    }
}

impl Pollable for PipeDevice {
    fn device(&self) -> &Device {
        &self.dev
    }

    fn device_mut(&mut self) -> &mut Device {
        &mut self.dev
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(
                self.dev.fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}
