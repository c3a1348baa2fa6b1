//! Criterion benchmarks for the WebSocket frame codec.
//!
//! Measures encode and decode throughput at payload sizes around each
//! header-form boundary, plus the cost of byte-at-a-time resumable feeding.
//!
//! Run with:
//! ```bash
//! cargo bench --package netwire-core --bench frame_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use netwire_core::{encode_frame, Frame, FrameKind};

const SIZES: &[usize] = &[16, 125, 1024, 65535, 262144];

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for &size in SIZES {
        let payload = vec![0xA5u8; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| encode_frame(FrameKind::Binary, black_box(payload)));
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for &size in SIZES {
        let wire = encode_frame(FrameKind::Binary, &vec![0xA5u8; size]);
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            b.iter(|| {
                let mut frame = Frame::new();
                frame.feed(black_box(wire)).expect("decode failed");
                assert!(frame.is_finished());
            });
        });
    }
    group.finish();
}

fn bench_decode_byte_at_a_time(c: &mut Criterion) {
    let wire = encode_frame(FrameKind::Binary, &vec![0xA5u8; 1024]);
    c.bench_function("decode_byte_at_a_time_1k", |b| {
        b.iter(|| {
            let mut frame = Frame::new();
            for byte in black_box(&wire) {
                frame.feed(std::slice::from_ref(byte)).expect("decode failed");
            }
            assert!(frame.is_finished());
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_decode_byte_at_a_time);
criterion_main!(benches);
