//! Codec benchmarks for scribble-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use scribble_protocol::{codec, Frame, Point, StrokeStyle};

fn stroke() -> Frame {
    Frame::Stroke {
        board: "bench:board".into(),
        sequence: 1_000_000,
        from: Point::new(120.5, 64.25),
        to: Point::new(121.75, 66.0),
        style: Some(StrokeStyle::new("#1e90ff", 3.0)),
    }
}

fn bench_encode_stroke(c: &mut Criterion) {
    let frame = stroke();
    let size = codec::encode(&frame).unwrap().len();

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(size as u64));
    group.bench_function("stroke", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

fn bench_decode_stroke(c: &mut Criterion) {
    let encoded = codec::encode(&stroke()).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("stroke", |b| b.iter(|| codec::decode(black_box(&encoded))));
    group.finish();
}

fn bench_draw_roundtrip(c: &mut Criterion) {
    let frame = Frame::draw_with_ack(7, Point::new(-3.5, 8.0), Point::new(4.0, 9.5), None);

    c.bench_function("roundtrip_draw", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_stroke,
    bench_decode_stroke,
    bench_draw_roundtrip
);
criterion_main!(benches);
