//! WebSocket frame module containing opcode/status types and the codec.

pub mod codec;
pub mod status;

pub use codec::{encode_close, encode_frame, encode_frame_header, Frame, FrameError};
pub use status::{CloseStatus, FrameKind};
