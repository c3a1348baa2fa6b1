//! Per-connection session state machine.
//!
//! A session starts in the upgrade phase: request bytes are buffered until
//! the header block is complete, the `Sec-WebSocket-Key` is answered with a
//! `101 Switching Protocols` response, and any surplus bytes carry over
//! into the frame phase.  Established sessions echo text and binary frames,
//! answer pings with pongs, and answer a close frame with a close frame
//! before asking the caller to drop the connection.
//!
//! The session itself performs no I/O: the reactor loop feeds it received
//! bytes via [`Session::on_data`] and drains [`Session::pending`] into the
//! socket whenever it is writable.

use netwire_core::{accept_key, encode_close, encode_frame, Frame, FrameError, FrameKind};
use thiserror::Error;
use tracing::debug;

/// Largest tolerated upgrade-request header block.
const MAX_REQUEST_SIZE: usize = 16 * 1024;

/// Close status sent when the peer's close frame carried none.
const STATUS_NORMAL: u16 = 1000;

/// Conditions that end a session.  The caller flushes whatever response is
/// still pending, then closes the connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed upgrade request")]
    BadRequest,

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    Upgrading,
    Established,
}

pub struct Session {
    phase: Phase,
    /// Received bytes not yet consumed by the current phase.
    inbuf: Vec<u8>,
    /// Bytes waiting to be written to the socket.
    outbuf: Vec<u8>,
    frame: Frame,
    closing: bool,
}

impl Session {
    pub fn new(max_payload: u64) -> Self {
        let mut frame = Frame::new();
        frame.set_max_payload_size(max_payload);
        Session {
            phase: Phase::Upgrading,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            frame,
            closing: false,
        }
    }

    /// Bytes queued for sending.
    pub fn pending(&self) -> &[u8] {
        &self.outbuf
    }

    /// Marks `n` queued bytes as written.
    pub fn consume(&mut self, n: usize) {
        self.outbuf.drain(..n);
    }

    /// Whether the session wants the connection closed once `pending` has
    /// drained.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Processes freshly received bytes, queueing any response bytes.
    ///
    /// # Errors
    ///
    /// A [`SessionError`] means the connection is unusable; flush and close.
    pub fn on_data(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.inbuf.extend_from_slice(data);
        if self.phase == Phase::Upgrading {
            if !self.try_upgrade()? {
                return Ok(());
            }
        }
        self.decode_frames()
    }

    /// Attempts the upgrade handshake; true once the request was answered.
    fn try_upgrade(&mut self) -> Result<bool, SessionError> {
        let Some(header_end) = find_header_end(&self.inbuf) else {
            if self.inbuf.len() > MAX_REQUEST_SIZE {
                return Err(SessionError::BadRequest);
            }
            return Ok(false);
        };

        let header = &self.inbuf[..header_end];
        let header_text = std::str::from_utf8(header).map_err(|_| SessionError::BadRequest)?;

        if !header_text.starts_with("GET ") {
            self.outbuf
                .extend_from_slice(b"HTTP/1.1 400 Bad Request\r\n\r\n");
            return Err(SessionError::BadRequest);
        }
        let Some(key) = header_value(header_text, "sec-websocket-key") else {
            self.outbuf
                .extend_from_slice(b"HTTP/1.1 400 Bad Request\r\n\r\n");
            return Err(SessionError::BadRequest);
        };

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(key)
        );
        self.outbuf.extend_from_slice(response.as_bytes());
        self.inbuf.drain(..header_end + 4);
        self.phase = Phase::Established;
        debug!("session upgraded to frame transport");
        Ok(true)
    }

    /// Decodes and answers every complete frame buffered so far.
    fn decode_frames(&mut self) -> Result<(), SessionError> {
        while !self.inbuf.is_empty() && !self.closing {
            let consumed = self.frame.feed(&self.inbuf)?;
            self.inbuf.drain(..consumed);
            if !self.frame.is_finished() {
                break;
            }

            match self.frame.kind {
                FrameKind::Text | FrameKind::Binary => {
                    self.outbuf
                        .extend_from_slice(&encode_frame(self.frame.kind, &self.frame.data));
                }
                FrameKind::Ping => {
                    self.outbuf
                        .extend_from_slice(&encode_frame(FrameKind::Pong, &self.frame.data));
                }
                FrameKind::Pong | FrameKind::Continuation => {}
                FrameKind::Close => {
                    let status = self.frame.status.unwrap_or(STATUS_NORMAL);
                    self.outbuf.extend_from_slice(&encode_close(status, b""));
                    self.closing = true;
                }
            }
            self.frame.reset();
        }
        Ok(())
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Case-insensitive lookup of one header value in a raw request block.
fn header_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    for line in header.split("\r\n").skip(1) {
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        if field.trim().eq_ignore_ascii_case(name) {
            return Some(value.trim());
        }
    }
    None
}
