//! Integration tests for the frame codec public API.
//!
//! These exercise the decoder the way session code uses it: a single `Frame`
//! object reused across a byte stream carrying several frames, fed in
//! arbitrary chunks with `reset()` between logical frames.

use netwire_core::{
    accept_key, encode_close, encode_frame, CloseStatus, Frame, FrameKind,
};

/// Splits `stream` into `chunk` sized pieces and decodes every frame in it.
fn decode_stream(stream: &[u8], chunk: usize) -> Vec<(FrameKind, Vec<u8>, Option<u16>)> {
    let mut frame = Frame::new();
    let mut frames = Vec::new();
    let mut pending: Vec<u8> = Vec::new();

    for piece in stream.chunks(chunk) {
        pending.extend_from_slice(piece);
        loop {
            let consumed = frame.feed(&pending).expect("decode must succeed");
            pending.drain(..consumed);
            if frame.is_finished() {
                frames.push((frame.kind, frame.data.clone(), frame.status));
                frame.reset();
            } else {
                break;
            }
        }
    }

    assert!(pending.is_empty(), "stream must not end mid-frame");
    frames
}

#[test]
fn test_multi_frame_stream_survives_any_chunking() {
    let mut stream = Vec::new();
    stream.extend_from_slice(&encode_frame(FrameKind::Text, b"hello"));
    stream.extend_from_slice(&encode_frame(FrameKind::Binary, &vec![7u8; 200]));
    stream.extend_from_slice(&encode_frame(FrameKind::Ping, b""));
    stream.extend_from_slice(&encode_close(1001, b"going away"));

    for chunk in [1usize, 2, 3, 7, 64, stream.len()] {
        let frames = decode_stream(&stream, chunk);
        assert_eq!(frames.len(), 4, "chunk size {chunk}");
        assert_eq!(frames[0], (FrameKind::Text, b"hello".to_vec(), None));
        assert_eq!(frames[1].0, FrameKind::Binary);
        assert_eq!(frames[1].1.len(), 200);
        assert_eq!(frames[2], (FrameKind::Ping, Vec::new(), None));
        assert_eq!(frames[3].0, FrameKind::Close);
        assert_eq!(frames[3].1, b"going away".to_vec());
        assert_eq!(frames[3].2, Some(1001));
        assert_eq!(
            frames[3].2.and_then(CloseStatus::from_u16),
            Some(CloseStatus::GoingAway)
        );
    }
}

#[test]
fn test_large_frame_round_trip() {
    // Forces the 64-bit length form through the whole public path.
    let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
    let wire = encode_frame(FrameKind::Binary, &payload);

    let mut frame = Frame::new();
    let consumed = frame.feed(&wire).expect("decode must succeed");
    assert_eq!(consumed, wire.len());
    assert!(frame.is_finished());
    assert_eq!(frame.payload_length, 70_000);
    assert_eq!(frame.data, payload);
}

#[test]
fn test_upgrade_accept_key_matches_rfc_vector() {
    assert_eq!(
        accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
        "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );
}
