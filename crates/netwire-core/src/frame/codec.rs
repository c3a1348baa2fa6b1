//! Streaming WebSocket frame decoder and encoder.
//!
//! Wire format (RFC 6455 subset):
//! ```text
//! byte0: FIN(1) RSV(3, ignored) OPCODE(4)
//! byte1: MASK(1) PAYLOAD_LEN(7)
//!   PAYLOAD_LEN == 126: 2 bytes extended length (network order)
//!   PAYLOAD_LEN == 127: 8 bytes extended length (network order)
//!   MASK set: 4 bytes masking key
//! payload: PAYLOAD_LEN bytes, XORed with the repeating 4-byte key if masked
//! ```
//! A close frame (opcode 0x8) with a payload of at least two bytes carries a
//! network-order status code in those two bytes; the remainder is the UTF-8
//! close reason.
//!
//! The decoder is resumable: [`Frame::feed`] accepts arbitrary chunk
//! boundaries (one byte at a time is fine) and picks up where the previous
//! call left off.  One [`Frame`] is reused per logical frame: once
//! [`Frame::is_finished`] reports true, the caller consumes the fields and
//! calls [`Frame::reset`] before decoding the next frame.

use thiserror::Error;
use tracing::debug;

use crate::frame::status::FrameKind;

/// Errors produced while decoding a frame.
///
/// Both are protocol errors: the connection is unusable afterwards and the
/// caller is expected to close it.  No partial recovery is attempted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The opcode nibble of the control byte is not a recognized value.
    #[error("invalid frame control byte: 0x{0:02X}")]
    InvalidOpcode(u8),

    /// The declared payload length exceeds the configured maximum.  Raised
    /// before any payload buffer is allocated.
    #[error("declared payload of {length} bytes exceeds limit of {limit}")]
    PayloadTooLarge { length: u64, limit: u64 },
}

/// Decoder position within a frame.
///
/// The original continuation-passing cursor is modelled as an explicit state
/// enum; `feed` dispatches on it after each completed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// FIN + opcode byte.
    Control,
    /// Mask bit + 7-bit length.
    Len,
    /// 16-bit extended length.
    Len16,
    /// 64-bit extended length.
    Len64,
    /// 4-byte masking key.
    Mask,
    /// 2-byte close status code.
    Status,
    /// Payload bytes.
    Payload,
}

/// A single WebSocket frame, decoded incrementally.
#[derive(Debug)]
pub struct Frame {
    /// Opcode of the current frame.
    pub kind: FrameKind,
    /// FIN bit: whether this fragment completes the message.
    pub final_fragment: bool,
    /// Payload length in bytes.  For close frames carrying a status code the
    /// two status bytes are excluded, so this is the length of `data`.
    pub payload_length: u64,
    /// Whether the payload was masked on the wire.
    pub masked: bool,
    /// The masking key, valid when `masked` is set.
    pub mask: [u8; 4],
    /// The unmasked payload.  For close frames this is the close reason.
    pub data: Vec<u8>,
    /// Close status code, present on close frames with payload length >= 2.
    pub status: Option<u16>,

    max_payload_size: u64,
    finished: bool,
    step: Step,
    /// Bytes still missing for the current step.
    need: usize,
    /// Bytes already accumulated for the current step (scratch offset).
    filled: usize,
    scratch: [u8; 8],
    /// Offset of the payload within the masked region; non-zero when the
    /// status bytes of a close frame already consumed part of the key cycle.
    mask_offset: usize,
}

impl Frame {
    pub fn new() -> Self {
        let mut frame = Frame {
            kind: FrameKind::Continuation,
            final_fragment: false,
            payload_length: 0,
            masked: false,
            mask: [0; 4],
            data: Vec::new(),
            status: None,
            max_payload_size: 0,
            finished: false,
            step: Step::Control,
            need: 0,
            filled: 0,
            scratch: [0; 8],
            mask_offset: 0,
        };
        frame.reset();
        frame
    }

    /// Caps the accepted payload length.  Zero (the default) disables the
    /// limit.  A frame declaring a larger payload fails in [`Frame::feed`]
    /// before the payload buffer is allocated.
    pub fn set_max_payload_size(&mut self, size: u64) {
        self.max_payload_size = size;
    }

    /// Whether a complete logical frame has been decoded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Prepares the frame for decoding the next logical frame.
    pub fn reset(&mut self) {
        self.final_fragment = false;
        self.payload_length = 0;
        self.masked = false;
        self.mask = [0; 4];
        self.data = Vec::new();
        self.status = None;
        self.finished = false;
        self.mask_offset = 0;
        self.enter(Step::Control, 1);
    }

    /// Consumes bytes from `input`, advancing the decode state machine.
    ///
    /// Returns the number of bytes consumed, which is less than `input.len()`
    /// when the frame completed mid-buffer (the caller owns the surplus, it
    /// usually belongs to the next frame).  May be called any number of times
    /// with partial data.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] on an invalid opcode or an oversized declared
    /// payload; the decoder state is unusable afterwards until `reset`.
    pub fn feed(&mut self, input: &[u8]) -> Result<usize, FrameError> {
        let mut consumed = 0;

        while consumed < input.len() && self.need > 0 {
            let take = self.need.min(input.len() - consumed);
            let chunk = &input[consumed..consumed + take];

            if self.step == Step::Payload {
                self.data.extend_from_slice(chunk);
            } else {
                self.scratch[self.filled..self.filled + take].copy_from_slice(chunk);
            }

            consumed += take;
            self.filled += take;
            self.need -= take;

            if self.need == 0 {
                self.advance()?;
            }
        }

        Ok(consumed)
    }

    fn enter(&mut self, step: Step, need: usize) {
        self.step = step;
        self.need = need;
        self.filled = 0;
    }

    /// Interprets the just-completed field and selects the next step.
    fn advance(&mut self) -> Result<(), FrameError> {
        match self.step {
            Step::Control => {
                let control = self.scratch[0];
                let opcode = control & 0x0F;
                self.kind = FrameKind::try_from(opcode).map_err(|()| {
                    debug!("invalid frame control byte: 0x{opcode:02X}");
                    FrameError::InvalidOpcode(opcode)
                })?;
                self.final_fragment = control & 0x80 != 0;
                self.enter(Step::Len, 1);
                Ok(())
            }
            Step::Len => {
                let byte = self.scratch[0];
                self.masked = byte & 0x80 != 0;
                match byte & 0x7F {
                    126 => {
                        self.enter(Step::Len16, 2);
                        Ok(())
                    }
                    127 => {
                        self.enter(Step::Len64, 8);
                        Ok(())
                    }
                    direct => {
                        self.payload_length = u64::from(direct);
                        self.after_length()
                    }
                }
            }
            Step::Len16 => {
                self.payload_length =
                    u64::from(u16::from_be_bytes([self.scratch[0], self.scratch[1]]));
                self.after_length()
            }
            Step::Len64 => {
                self.payload_length = u64::from_be_bytes(self.scratch);
                self.after_length()
            }
            Step::Mask => {
                self.mask.copy_from_slice(&self.scratch[..4]);
                self.begin_data()
            }
            Step::Status => {
                let mut raw = [self.scratch[0], self.scratch[1]];
                if self.masked {
                    raw[0] ^= self.mask[0];
                    raw[1] ^= self.mask[1];
                }
                self.status = Some(u16::from_be_bytes(raw));
                self.begin_payload(2)
            }
            Step::Payload => {
                if self.masked {
                    unmask(&mut self.data, self.mask, self.mask_offset);
                }
                self.finished = true;
                Ok(())
            }
        }
    }

    /// Entered once the full payload length is known.
    fn after_length(&mut self) -> Result<(), FrameError> {
        if self.masked {
            self.enter(Step::Mask, 4);
            Ok(())
        } else {
            self.begin_data()
        }
    }

    /// Entered once length and mask are available; splits off the close
    /// status sub-frame before the payload proper.
    fn begin_data(&mut self) -> Result<(), FrameError> {
        // The status code of a close frame is optional on the wire.
        if self.kind == FrameKind::Close && self.payload_length >= 2 {
            self.payload_length -= 2;
            self.enter(Step::Status, 2);
            return Ok(());
        }
        self.begin_payload(0)
    }

    fn begin_payload(&mut self, mask_offset: usize) -> Result<(), FrameError> {
        if self.payload_length == 0 {
            self.finished = true;
            return Ok(());
        }

        if self.max_payload_size != 0 && self.payload_length > self.max_payload_size {
            debug!(
                "payload limit exceeded: {} > {}",
                self.payload_length, self.max_payload_size
            );
            return Err(FrameError::PayloadTooLarge {
                length: self.payload_length,
                limit: self.max_payload_size,
            });
        }

        self.mask_offset = mask_offset;
        self.data = Vec::with_capacity(self.payload_length as usize);
        self.enter(Step::Payload, self.payload_length as usize);
        Ok(())
    }
}

impl Default for Frame {
    fn default() -> Self {
        Frame::new()
    }
}

/// Reverses the sender's masking: whole 4-byte words first, then the 0–3
/// byte remainder.  `offset` rotates the key for payloads that do not start
/// at the beginning of the key cycle (close reasons after the status bytes).
fn unmask(data: &mut [u8], mask: [u8; 4], offset: usize) {
    let mut key = [0u8; 4];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = mask[(i + offset) & 3];
    }
    let word = u32::from_ne_bytes(key);

    let mut chunks = data.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let value = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&value.to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Builds the frame header for a payload of `payload_len` bytes, selecting
/// the 2-, 4-, or 10-byte header form.  A close status code, when supplied,
/// becomes the first two bytes of the logical payload and extends the length
/// computation accordingly; the caller appends only the reason text.
///
/// The FIN bit is always set and masking is never applied: frames produced
/// here travel server → client, which the protocol requires to be unmasked.
pub fn encode_frame_header(kind: FrameKind, payload_len: u64, status: Option<u16>) -> Vec<u8> {
    let mut length = payload_len;
    if status.is_some() {
        length += 2;
    }

    let mut header = Vec::with_capacity(12);
    header.push(0x80 | kind as u8);

    if length <= 125 {
        header.push(length as u8);
    } else if length <= 65535 {
        header.push(126);
        header.extend_from_slice(&(length as u16).to_be_bytes());
    } else {
        header.push(127);
        header.extend_from_slice(&length.to_be_bytes());
    }

    if let Some(code) = status {
        header.extend_from_slice(&code.to_be_bytes());
    }

    header
}

/// Encodes a complete unmasked frame: header followed by `payload`.
pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = encode_frame_header(kind, payload.len() as u64, None);
    buf.extend_from_slice(payload);
    buf
}

/// Encodes a close frame carrying `status` and an optional UTF-8 reason.
pub fn encode_close(status: u16, reason: &[u8]) -> Vec<u8> {
    let mut buf = encode_frame_header(FrameKind::Close, reason.len() as u64, Some(status));
    buf.extend_from_slice(reason);
    buf
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::status::CloseStatus;

    /// Feeds the whole buffer in one call and asserts the frame completed.
    fn decode_one(bytes: &[u8]) -> Frame {
        let mut frame = Frame::new();
        let consumed = frame.feed(bytes).expect("decode failed");
        assert_eq!(consumed, bytes.len());
        assert!(frame.is_finished());
        frame
    }

    /// Applies the client-side masking transform to an encoded frame,
    /// producing what a conforming client would put on the wire.
    fn masked_wire_frame(kind: FrameKind, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(0x80 | kind as u8);
        if payload.len() <= 125 {
            buf.push(0x80 | payload.len() as u8);
        } else if payload.len() <= 65535 {
            buf.push(0x80 | 126);
            buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            buf.push(0x80 | 127);
            buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        buf.extend_from_slice(&mask);
        for (i, byte) in payload.iter().enumerate() {
            buf.push(byte ^ mask[i & 3]);
        }
        buf
    }

    #[test]
    fn test_round_trip_boundary_sizes() {
        // Crosses every header-form boundary: 1/3/9-byte length encodings.
        for size in [0usize, 1, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let wire = encode_frame(FrameKind::Binary, &payload);
            let frame = decode_one(&wire);
            assert_eq!(frame.kind, FrameKind::Binary);
            assert!(frame.final_fragment);
            assert!(!frame.masked);
            assert_eq!(frame.payload_length, size as u64);
            assert_eq!(frame.data, payload, "payload mismatch at size {size}");
        }
    }

    #[test]
    fn test_split_feed_equals_single_feed() {
        let payload: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
        let wire = encode_frame(FrameKind::Text, &payload);

        for split in 1..wire.len() {
            let mut frame = Frame::new();
            let mut fed = 0;
            for chunk in wire.chunks(split) {
                fed += frame.feed(chunk).expect("split decode failed");
            }
            assert_eq!(fed, wire.len());
            assert!(frame.is_finished(), "not finished at split {split}");
            assert_eq!(frame.kind, FrameKind::Text);
            assert_eq!(frame.payload_length, 300);
            assert_eq!(frame.data, payload);
        }
    }

    #[test]
    fn test_three_call_scenario() {
        // A 300-byte binary frame delivered in three uneven calls; only the
        // final call completes the frame.
        let payload = vec![0x5Au8; 300];
        let wire = encode_frame(FrameKind::Binary, &payload);
        assert_eq!(wire.len(), 4 + 300);

        let mut frame = Frame::new();
        let mut offset = 0;
        for chunk_len in [1usize, 200, wire.len() - 201] {
            assert!(!frame.is_finished());
            offset += frame.feed(&wire[offset..offset + chunk_len]).expect("decode failed");
        }
        assert_eq!(offset, wire.len());
        assert!(frame.is_finished());
        assert_eq!(frame.kind, FrameKind::Binary);
        assert_eq!(frame.data.len(), 300);
    }

    #[test]
    fn test_masked_payload_is_unmasked() {
        let mask = [0xDE, 0xAD, 0xBE, 0xEF];
        // Lengths 0..=7 cover every remainder case of the word loop.
        for len in 0usize..8 {
            let payload: Vec<u8> = (0..len as u8).collect();
            let wire = masked_wire_frame(FrameKind::Binary, &payload, mask);
            let frame = decode_one(&wire);
            assert!(frame.masked);
            assert_eq!(frame.mask, mask);
            assert_eq!(frame.data, payload, "unmask mismatch at length {len}");
        }
    }

    #[test]
    fn test_masking_is_idempotent() {
        let mask = [0x11, 0x22, 0x33, 0x44];
        for len in 0usize..8 {
            let original: Vec<u8> = (0..len as u8).map(|b| b.wrapping_mul(37)).collect();
            let mut data = original.clone();
            unmask(&mut data, mask, 0);
            unmask(&mut data, mask, 0);
            assert_eq!(data, original);
        }
    }

    #[test]
    fn test_close_frame_extracts_status_and_reason() {
        let wire = encode_close(1000, b"bye");
        let frame = decode_one(&wire);
        assert_eq!(frame.kind, FrameKind::Close);
        assert_eq!(frame.status, Some(1000));
        assert_eq!(CloseStatus::from_u16(1000), Some(CloseStatus::Normal));
        assert_eq!(frame.payload_length, 3);
        assert_eq!(frame.data, b"bye");
    }

    #[test]
    fn test_close_frame_without_status() {
        let wire = encode_frame(FrameKind::Close, &[]);
        let frame = decode_one(&wire);
        assert_eq!(frame.status, None);
        assert!(frame.data.is_empty());
    }

    #[test]
    fn test_masked_close_frame_unmasks_status_and_reason() {
        let mask = [0xA1, 0xB2, 0xC3, 0xD4];
        let mut payload = 1002u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"protocol error");
        let wire = masked_wire_frame(FrameKind::Close, &payload, mask);
        let frame = decode_one(&wire);
        assert_eq!(frame.status, Some(1002));
        assert_eq!(frame.data, b"protocol error");
        assert_eq!(frame.payload_length, 14);
    }

    #[test]
    fn test_unknown_close_code_is_carried() {
        let wire = encode_close(4999, b"");
        let frame = decode_one(&wire);
        assert_eq!(frame.status, Some(4999));
        assert_eq!(CloseStatus::from_u16(4999), None);
    }

    #[test]
    fn test_invalid_opcode_is_rejected() {
        let mut frame = Frame::new();
        assert_eq!(frame.feed(&[0x83, 0x00]), Err(FrameError::InvalidOpcode(0x03)));
    }

    #[test]
    fn test_oversized_payload_rejected_before_body() {
        let mut frame = Frame::new();
        frame.set_max_payload_size(16);

        // 2-byte header declaring 100 bytes, followed by payload the decoder
        // must never touch.
        let mut wire = vec![0x82, 100];
        wire.extend_from_slice(&[0u8; 100]);

        let result = frame.feed(&wire);
        assert_eq!(
            result,
            Err(FrameError::PayloadTooLarge { length: 100, limit: 16 })
        );
        assert!(frame.data.is_empty());
    }

    #[test]
    fn test_oversized_extended_payload_rejected() {
        let mut frame = Frame::new();
        frame.set_max_payload_size(1024);

        let wire = encode_frame_header(FrameKind::Binary, 70_000, None);
        let result = frame.feed(&wire);
        assert_eq!(
            result,
            Err(FrameError::PayloadTooLarge { length: 70_000, limit: 1024 })
        );
    }

    #[test]
    fn test_feed_stops_at_frame_boundary() {
        let mut wire = encode_frame(FrameKind::Binary, b"abc");
        let trailing = encode_frame(FrameKind::Ping, &[]);
        wire.extend_from_slice(&trailing);

        let mut frame = Frame::new();
        let consumed = frame.feed(&wire).expect("decode failed");
        assert_eq!(consumed, wire.len() - trailing.len());
        assert!(frame.is_finished());

        // The same object decodes the next frame after a reset.
        frame.reset();
        let consumed = frame.feed(&wire[consumed..]).expect("decode failed");
        assert_eq!(consumed, trailing.len());
        assert_eq!(frame.kind, FrameKind::Ping);
    }

    #[test]
    fn test_encode_header_forms() {
        assert_eq!(encode_frame_header(FrameKind::Binary, 125, None).len(), 2);
        assert_eq!(encode_frame_header(FrameKind::Binary, 126, None).len(), 4);
        assert_eq!(encode_frame_header(FrameKind::Binary, 65535, None).len(), 4);
        assert_eq!(encode_frame_header(FrameKind::Binary, 65536, None).len(), 10);
        // The status code counts towards the length: 124 + 2 = 126 forces
        // the extended form, plus the two status bytes themselves.
        assert_eq!(encode_frame_header(FrameKind::Close, 124, Some(1000)).len(), 6);
    }

    #[test]
    fn test_fin_bit_reflected_in_final_fragment() {
        let mut wire = encode_frame(FrameKind::Text, b"x");
        wire[0] &= 0x7F; // clear FIN
        let frame = decode_one(&wire);
        assert!(!frame.final_fragment);
        assert_eq!(frame.kind, FrameKind::Text);
    }
}
