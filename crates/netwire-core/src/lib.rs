//! # netwire-core
//!
//! Pure protocol logic for netwire: the WebSocket frame codec and the
//! upgrade-handshake accept-key computation.
//!
//! This crate performs no I/O and has zero dependencies on OS APIs or
//! sockets.  The transport side (the epoll/kqueue reactor, TCP and TLS
//! sockets) lives in `netwire-reactor`; session code feeds bytes read from a
//! socket into a [`Frame`] until a complete logical frame is available, and
//! writes encoder output back out.
//!
//! - **`frame`** – The resumable frame decoder and the unmasked frame
//!   encoder.  Frames follow the RFC 6455 wire format subset documented in
//!   the module.
//! - **`handshake`** – The `Sec-WebSocket-Accept` digest used when switching
//!   an HTTP connection to the frame transport.  HTTP request semantics
//!   (routing, headers, cookies) are deliberately not handled here.

pub mod frame;
pub mod handshake;

pub use frame::codec::{
    encode_close, encode_frame, encode_frame_header, Frame, FrameError,
};
pub use frame::status::{CloseStatus, FrameKind};
pub use handshake::{accept_key, WEBSOCKET_GUID};
