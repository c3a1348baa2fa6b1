//! Linux backend: `epoll` multiplexer, `eventfd` interrupt channel,
//! `timerfd` group timer.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use super::{PollEvent, Token, EVENT_BATCH, TOKEN_TIMER};
use crate::device::Mode;

/// The kernel multiplexer handle.
#[derive(Debug)]
pub(crate) struct Poller {
    epfd: OwnedFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        // Safety: plain syscall; ownership of the new descriptor is taken
        // immediately.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn interest_bits(mode: Mode, edge: bool) -> u32 {
        let mut events = (libc::EPOLLPRI | libc::EPOLLRDHUP) as u32;
        if edge {
            events |= libc::EPOLLET as u32;
        }
        if mode.contains(Mode::READ) {
            events |= libc::EPOLLIN as u32;
        }
        if mode.contains(Mode::WRITE) {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: Token) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        // Safety: epfd and fd are valid descriptors; ev outlives the call.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Registers a descriptor with the given interest.
    pub fn add(&self, fd: RawFd, token: Token, mode: Mode, edge: bool) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Self::interest_bits(mode, edge), token)
    }

    /// Updates the interest of a registered descriptor.  The previously
    /// registered mode is irrelevant on epoll; the kqueue backend needs it.
    pub fn modify(
        &self,
        fd: RawFd,
        token: Token,
        _old: Mode,
        new: Mode,
        edge: bool,
    ) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Self::interest_bits(new, edge), token)
    }

    /// Removes a descriptor from the multiplexer.
    pub fn delete(&self, fd: RawFd, _old: Mode) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Blocks until events arrive or `timeout_ms` elapses (negative waits
    /// forever).  Fills `events` with at most one batch.
    pub fn wait(&self, events: &mut Vec<PollEvent>, timeout_ms: i64) -> io::Result<usize> {
        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; EVENT_BATCH];
        let timeout = if timeout_ms < 0 {
            -1
        } else {
            timeout_ms.min(i64::from(i32::MAX)) as i32
        };

        // Safety: raw buffer is valid for EVENT_BATCH entries.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                raw.as_mut_ptr(),
                EVENT_BATCH as i32,
                timeout,
            )
        };
        if n == -1 {
            return Err(io::Error::last_os_error());
        }

        events.clear();
        for ev in &raw[..n as usize] {
            let bits = ev.events;
            events.push(PollEvent {
                token: ev.u64,
                readable: bits & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                error: bits & (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0,
            });
        }
        Ok(n as usize)
    }

    /// Arms the group timer: a `timerfd` registered under [`TOKEN_TIMER`].
    pub fn set_timer(&self, interval_ms: u64, one_shot: bool) -> io::Result<TimerHandle> {
        // A zero it_value would disarm the timerfd entirely.
        let interval_ms = interval_ms.max(1);
        let spec_value = libc::timespec {
            tv_sec: (interval_ms / 1000) as libc::time_t,
            tv_nsec: ((interval_ms % 1000) * 1_000_000) as libc::c_long,
        };
        let spec = libc::itimerspec {
            it_interval: if one_shot {
                libc::timespec { tv_sec: 0, tv_nsec: 0 }
            } else {
                spec_value
            },
            it_value: spec_value,
        };

        // Safety: plain syscalls; the descriptor is owned on success.
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let timer = TimerHandle {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };

        let rc = unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }

        self.ctl(
            libc::EPOLL_CTL_ADD,
            fd,
            (libc::EPOLLIN | libc::EPOLLET) as u32,
            TOKEN_TIMER,
        )?;
        Ok(timer)
    }

    /// Disarms the group timer.  The descriptor itself closes with the
    /// handle.
    pub fn clear_timer(&self, timer: &TimerHandle) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, timer.fd.as_raw_fd(), 0, 0)
    }
}

/// The armed group timer.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    fd: OwnedFd,
}

impl TimerHandle {
    /// Consumes the accumulated expiration count so the descriptor stops
    /// polling readable.
    pub fn drain(&self) {
        let mut expirations = 0u64;
        loop {
            // Safety: reads into a local of the documented 8-byte size.
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    &mut expirations as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if n == -1 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break;
        }
    }
}

/// Wake-up channel for `wait()`, backed by an `eventfd`.
///
/// The kernel maintains an atomic counter: concurrent signals coalesce and a
/// single drain consumes them all, so any number of `signal()` calls wakes
/// the reactor exactly once per drain.  Clones share the descriptor, which
/// stays open as long as any clone lives.
#[derive(Debug, Clone)]
pub(crate) struct InterruptChannel {
    fd: Arc<OwnedFd>,
}

impl InterruptChannel {
    pub fn new() -> io::Result<Self> {
        // Safety: plain syscall; ownership taken on success.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(InterruptChannel {
            fd: Arc::new(unsafe { OwnedFd::from_raw_fd(fd) }),
        })
    }

    /// The descriptor to register for read readiness.
    pub fn read_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Thread-safe wake-up: adds one to the eventfd counter.
    pub fn signal(&self) -> io::Result<()> {
        let value = 1u64;
        // Safety: writes the documented 8-byte quantity.
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Resets the counter.  One read suffices: the kernel hands over the
    /// whole accumulated value.
    pub fn drain(&self) {
        let mut value = 0u64;
        loop {
            // Safety: reads into a local of the documented 8-byte size.
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    &mut value as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if n == -1 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break;
        }
    }
}
