//! Frame codec benchmarks
//!
//! Run with: `cargo bench --bench relay_benchmarks`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use relaymux_core::codec::{FrameDecoder, encode_length_prefixed};
use relaymux_core::{Frame, MAX_PAYLOAD_SIZE, PeerId};

fn data_frame(size: usize) -> Frame {
    Frame::Data {
        peer_id: PeerId::new("bench-peer").unwrap(),
        payload: vec![0xAA; size],
    }
}

/// Benchmark frame encoding with length prefix
fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [64, 1024, 16 * 1024, MAX_PAYLOAD_SIZE] {
        let frame = data_frame(size);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| black_box(encode_length_prefixed(black_box(frame)).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark decoding a single datagram frame
fn bench_frame_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [64, 1024, 16 * 1024, MAX_PAYLOAD_SIZE] {
        let bytes = data_frame(size).to_bytes().unwrap();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &bytes, |b, bytes| {
            b.iter(|| black_box(Frame::from_bytes(black_box(bytes)).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark stream reassembly of many small frames fed in odd-sized chunks
fn bench_stream_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_reassembly");

    let mut wire = Vec::new();
    for _ in 0..256 {
        wire.extend(encode_length_prefixed(&data_frame(512)).unwrap());
    }
    group.throughput(Throughput::Bytes(wire.len() as u64));

    for chunk in [97, 1500, 16 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &wire, |b, wire| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new();
                let mut frames = 0usize;
                for piece in wire.chunks(chunk) {
                    decoder.extend(piece);
                    while let Some(frame) = decoder.decode_next().unwrap() {
                        black_box(frame);
                        frames += 1;
                    }
                }
                assert_eq!(frames, 256);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_stream_reassembly
);
criterion_main!(benches);
