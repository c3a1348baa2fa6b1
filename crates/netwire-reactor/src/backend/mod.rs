//! Kernel readiness multiplexer, selected at build time.
//!
//! Both implementations expose the same `Poller`/`InterruptChannel`/
//! `TimerHandle` surface so that `DeviceGroup` contains no platform
//! conditionals: `epoll` on Linux/Android, `kqueue` on the BSDs and macOS.
//! Registration carries an opaque 64-bit token that comes back in each
//! event; two reserved values mark the interrupt channel and the timer.

/// Size of one kernel event batch; `next()` consumes it one entry at a time.
pub(crate) const EVENT_BATCH: usize = 10;

/// Opaque registration token delivered back with each kernel event.
pub(crate) type Token = u64;

/// Token of the interrupt channel's read side.
pub(crate) const TOKEN_INTERRUPT: Token = u64::MAX;

/// Token of the group timer.
pub(crate) const TOKEN_TIMER: Token = u64::MAX - 1;

/// One kernel readiness event, normalised across backends.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Error or hangup condition (`EPOLLERR|EPOLLHUP|EPOLLRDHUP`,
    /// `EV_ERROR|EV_EOF`).
    pub error: bool,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use epoll::{InterruptChannel, Poller, TimerHandle};

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) use kqueue::{InterruptChannel, Poller, TimerHandle};
