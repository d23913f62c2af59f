use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use gridrpc_core::frame;
use gridrpc_core::message::{RemoteMethod, RequestHeader, SUPPORTED_FEATURES};

fn header() -> RequestHeader {
    RequestHeader {
        call_id: 42,
        method: RemoteMethod::new("EchoService", "Echo"),
        required_features: SUPPORTED_FEATURES,
        timeout_ms: 5000,
        sidecar_lens: Vec::new(),
    }
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");
    for size in [16usize, 1024, 64 * 1024] {
        let body = vec![0xABu8; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &body, |b, body| {
            let header = header();
            b.iter(|| frame::encode_frame(black_box(&header), black_box(body), &[]).unwrap());
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");
    for size in [16usize, 1024, 64 * 1024] {
        let body = vec![0xABu8; size];
        let encoded = frame::encode_frame(&header(), &body, &[]).unwrap();
        // Strip the length prefix, as the transfer layer does.
        let payload = encoded.slice(4..);
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                let (header_buf, rest) = frame::split_transfer(black_box(payload.clone())).unwrap();
                let decoded: RequestHeader = frame::decode_header(&header_buf).unwrap();
                let (body, _) = frame::split_sidecars(rest, &decoded.sidecar_lens).unwrap();
                black_box(body);
            });
        });
    }
    group.finish();
}

fn bench_sidecar_split(c: &mut Criterion) {
    let sidecars = vec![Bytes::from(vec![1u8; 4096]), Bytes::from(vec![2u8; 4096])];
    let mut header = header();
    header.sidecar_lens = sidecars.iter().map(|s| s.len() as u32).collect();
    let encoded = frame::encode_frame(&header, b"body", &sidecars).unwrap();
    let payload = encoded.slice(4..);

    c.bench_function("frame_sidecar_split", |b| {
        b.iter(|| {
            let (header_buf, rest) = frame::split_transfer(black_box(payload.clone())).unwrap();
            let decoded: RequestHeader = frame::decode_header(&header_buf).unwrap();
            let (_, sidecars) = frame::split_sidecars(rest, &decoded.sidecar_lens).unwrap();
            black_box(sidecars);
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_sidecar_split);
criterion_main!(benches);
