//! BSD/macOS backend: `kqueue` multiplexer with per-filter registration,
//! a self-pipe interrupt channel, and an `EVFILT_TIMER` group timer.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use super::{PollEvent, Token, EVENT_BATCH, TOKEN_TIMER};
use crate::device::Mode;

/// Identifier of the group timer event (kqueue timers have no descriptor).
const TIMER_IDENT: libc::uintptr_t = 0;

/// The kernel multiplexer handle.
#[derive(Debug)]
pub(crate) struct Poller {
    kq: OwnedFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        // Safety: plain syscalls; ownership of the queue descriptor is taken
        // immediately.
        let fd = unsafe { libc::kqueue() };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let kq = unsafe { OwnedFd::from_raw_fd(fd) };
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        Ok(Poller { kq })
    }

    fn kevent(ident: libc::uintptr_t, filter: i16, flags: u16, data: i64, token: Token) -> libc::kevent {
        // Safety: kevent is plain old data; unused fields stay zero.
        let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
        ev.ident = ident;
        ev.filter = filter as _;
        ev.flags = flags as _;
        ev.data = data as _;
        ev.udata = token as *mut libc::c_void;
        ev
    }

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        // Safety: the change list is valid for its length; no events are
        // received here.
        let rc = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as _,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Registers a descriptor: one kernel filter per requested direction.
    pub fn add(&self, fd: RawFd, token: Token, mode: Mode, edge: bool) -> io::Result<()> {
        self.modify(fd, token, Mode::empty(), mode, edge)
    }

    /// Diffs the previously registered mode against the new one, adding and
    /// deleting filters as needed.
    pub fn modify(
        &self,
        fd: RawFd,
        token: Token,
        old: Mode,
        new: Mode,
        edge: bool,
    ) -> io::Result<()> {
        let base = if edge { libc::EV_CLEAR } else { 0 };
        let mut changes: Vec<libc::kevent> = Vec::with_capacity(2);

        if new.contains(Mode::READ) && !old.contains(Mode::READ) {
            changes.push(Self::kevent(
                fd as libc::uintptr_t,
                libc::EVFILT_READ as i16,
                (libc::EV_ADD | base) as u16,
                0,
                token,
            ));
        } else if !new.contains(Mode::READ) && old.contains(Mode::READ) {
            changes.push(Self::kevent(
                fd as libc::uintptr_t,
                libc::EVFILT_READ as i16,
                libc::EV_DELETE as u16,
                0,
                token,
            ));
        }

        if new.contains(Mode::WRITE) && !old.contains(Mode::WRITE) {
            changes.push(Self::kevent(
                fd as libc::uintptr_t,
                libc::EVFILT_WRITE as i16,
                (libc::EV_ADD | base) as u16,
                0,
                token,
            ));
        } else if !new.contains(Mode::WRITE) && old.contains(Mode::WRITE) {
            changes.push(Self::kevent(
                fd as libc::uintptr_t,
                libc::EVFILT_WRITE as i16,
                libc::EV_DELETE as u16,
                0,
                token,
            ));
        }

        self.apply(&changes)
    }

    /// Removes whatever filters were registered for the descriptor.  Filter
    /// removal for a direction that was never armed fails per-event, which
    /// is expected and ignored by passing only the armed directions.
    pub fn delete(&self, fd: RawFd, old: Mode) -> io::Result<()> {
        let mut changes: Vec<libc::kevent> = Vec::with_capacity(2);
        if old.contains(Mode::READ) {
            changes.push(Self::kevent(
                fd as libc::uintptr_t,
                libc::EVFILT_READ as i16,
                libc::EV_DELETE as u16,
                0,
                0,
            ));
        }
        if old.contains(Mode::WRITE) {
            changes.push(Self::kevent(
                fd as libc::uintptr_t,
                libc::EVFILT_WRITE as i16,
                libc::EV_DELETE as u16,
                0,
                0,
            ));
        }
        self.apply(&changes)
    }

    /// Blocks until events arrive or `timeout_ms` elapses (negative waits
    /// forever).  Fills `events` with at most one batch.
    pub fn wait(&self, events: &mut Vec<PollEvent>, timeout_ms: i64) -> io::Result<usize> {
        // Safety: zeroed kevent structs are valid receive slots.
        let mut raw: [libc::kevent; EVENT_BATCH] = unsafe { std::mem::zeroed() };

        let ts;
        let ts_ptr = if timeout_ms < 0 {
            std::ptr::null()
        } else {
            ts = libc::timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            };
            &ts as *const libc::timespec
        };

        // Safety: the receive buffer is valid for EVENT_BATCH entries.
        let n = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                std::ptr::null(),
                0,
                raw.as_mut_ptr(),
                EVENT_BATCH as _,
                ts_ptr,
            )
        };
        if n == -1 {
            return Err(io::Error::last_os_error());
        }

        events.clear();
        for ev in &raw[..n as usize] {
            events.push(PollEvent {
                token: ev.udata as Token,
                readable: i32::from(ev.filter) == libc::EVFILT_READ as i32,
                writable: i32::from(ev.filter) == libc::EVFILT_WRITE as i32,
                error: u32::from(ev.flags) & (libc::EV_ERROR | libc::EV_EOF) as u32 != 0,
            });
        }
        Ok(n as usize)
    }

    /// Arms the group timer via `EVFILT_TIMER` (millisecond units).
    pub fn set_timer(&self, interval_ms: u64, one_shot: bool) -> io::Result<TimerHandle> {
        let mut flags = libc::EV_ADD;
        if one_shot {
            flags |= libc::EV_ONESHOT;
        }
        let change = Self::kevent(
            TIMER_IDENT,
            libc::EVFILT_TIMER as i16,
            flags as u16,
            interval_ms.max(1) as i64,
            TOKEN_TIMER,
        );
        self.apply(&[change])?;
        Ok(TimerHandle {})
    }

    /// Disarms the group timer.
    pub fn clear_timer(&self, _timer: &TimerHandle) -> io::Result<()> {
        let change = Self::kevent(
            TIMER_IDENT,
            libc::EVFILT_TIMER as i16,
            libc::EV_DELETE as u16,
            0,
            0,
        );
        self.apply(&[change])
    }
}

/// The armed group timer.  kqueue timers have no descriptor to drain.
#[derive(Debug)]
pub(crate) struct TimerHandle {}

impl TimerHandle {
    pub fn drain(&self) {}
}

/// Wake-up channel for `wait()`, backed by a non-blocking self-pipe.
///
/// Concurrent signals fill the pipe at worst; a full pipe already guarantees
/// a pending wake-up, so `signal()` treats `EAGAIN` as success.  Clones
/// share both descriptors.
#[derive(Debug, Clone)]
pub(crate) struct InterruptChannel {
    inner: Arc<Pipe>,
}

#[derive(Debug)]
struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl InterruptChannel {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0; 2];
        // Safety: plain pipe creation; both descriptors are owned on success.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let pipe = Pipe {
            read: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            write: unsafe { OwnedFd::from_raw_fd(fds[1]) },
        };
        for fd in [fds[0], fds[1]] {
            unsafe {
                libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(InterruptChannel {
            inner: Arc::new(pipe),
        })
    }

    /// The descriptor to register for read readiness.
    pub fn read_fd(&self) -> RawFd {
        self.inner.read.as_raw_fd()
    }

    /// Thread-safe wake-up: one byte into the pipe.
    pub fn signal(&self) -> io::Result<()> {
        let byte = 1u8;
        // Safety: writes one byte from a local.
        let n = unsafe {
            libc::write(
                self.inner.write.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
        if n == 1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            // Pipe full: a wake-up is already pending.
            return Ok(());
        }
        Err(err)
    }

    /// Empties the pipe.
    pub fn drain(&self) {
        let mut buf = [0u8; 16];
        loop {
            // Safety: reads into a local buffer of the stated size.
            let n = unsafe {
                libc::read(
                    self.inner.read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n == -1 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            if n < buf.len() as isize {
                break;
            }
        }
    }
}
