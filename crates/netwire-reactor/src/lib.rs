//! # netwire-reactor
//!
//! A single-threaded, non-blocking socket reactor built directly on
//! `epoll`/`kqueue`, plus the TCP and TLS socket devices that run on it.
//!
//! The pieces, leaf to root:
//!
//! - **[`Device`]** – wraps one OS descriptor with its desired interest mask
//!   and an optional timeout.
//! - **[`Socket`] / [`TlsSocket`]** – TCP semantics over a `Device`; the TLS
//!   variant drives its handshake incrementally through the event loop.
//! - **[`DeviceGroup`]** – the reactor: owns the kernel multiplexer, an
//!   interrupt channel, an optional timer, and a time-sorted timeout queue;
//!   `wait()`/`next()` deliver one ready or timed-out device at a time.
//!
//! # Threading
//!
//! Exactly one thread drives a group: `wait()` → handle → `next()` → … →
//! `wait()`.  Every device operation belongs to that thread.  The one
//! documented exception is [`Interrupter::interrupt`], which may be called
//! from anywhere to force an early return from a blocked `wait()`, e.g. to
//! hand over freshly created devices or to request shutdown.
//!
//! # Example
//!
//! ```no_run
//! use netwire_reactor::{DeviceGroup, Mode, Pollable, Socket};
//!
//! let mut listener = Socket::new();
//! listener.set_reuse_addr(true);
//! listener.bind("127.0.0.1".parse().unwrap(), 8080).unwrap();
//! listener.listen(64).unwrap();
//! listener.set_nonblocking(true).unwrap();
//! listener.device_mut().set_mode(Mode::READ);
//!
//! let mut group: DeviceGroup<Socket> = DeviceGroup::new();
//! let listener_id = group.append(listener).ok().unwrap();
//!
//! while let Some(event) = group.wait() {
//!     if event.id == listener_id && event.readable {
//!         // accept and append the new connection…
//!     }
//! }
//! ```

mod backend;
pub mod device;
pub mod group;
pub mod socket;

pub use device::{Device, DeviceError, Mode, Pollable};
pub use group::{DeviceGroup, DeviceId, DeviceRef, Event, Interrupter, TriggerMode};
pub use socket::tls::{client_config, client_config_with_roots, server_config};
pub use socket::{Anonymized, IpAddress, Socket, SocketError, TlsSocket};
