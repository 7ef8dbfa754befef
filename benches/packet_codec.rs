//! Packet codec benchmarks.
//!
//! Run with: `cargo bench --bench packet_codec`
//!
//! Targets:
//! - Checksum: >10 GB/s on MTU-sized frames
//! - Decode: <50ns per frame
//! - Encode TCP/UDP: <200ns per MTU-sized frame

use std::net::SocketAddrV4;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tun_interceptor::packet::checksum::checksum;
use tun_interceptor::packet::tcp_flags::{ACK, PSH, SYN};
use tun_interceptor::packet::{
    decode, encode_tcp_segment, encode_udp_datagram, SegmentSpec, SynOptions, TcpHeader, UdpHeader,
};

// ============================================================================
// Helper Functions
// ============================================================================

fn client() -> SocketAddrV4 {
    "192.168.1.5:40000".parse().expect("valid address")
}

fn intercept() -> SocketAddrV4 {
    "10.0.0.1:443".parse().expect("valid address")
}

fn generate_test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

fn tcp_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 65_535];
    let len = encode_tcp_segment(
        &mut out,
        &SegmentSpec {
            src: client(),
            dst: intercept(),
            ident: 1,
            seq: 1000,
            ack: 1,
            flags: PSH | ACK,
            window: 64240,
            options: None,
            payload,
        },
    )
    .expect("encode");
    out.truncate(len);
    out
}

fn udp_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 65_535];
    let len = encode_udp_datagram(&mut out, client(), intercept(), 1, payload).expect("encode");
    out.truncate(len);
    out
}

// ============================================================================
// Checksum
// ============================================================================

fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");

    for size in [64usize, 576, 1500, 9000] {
        let data = generate_test_data(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| black_box(checksum(black_box(data), 0)));
        });
    }

    group.finish();
}

// ============================================================================
// Decode
// ============================================================================

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    let tcp = tcp_frame(&generate_test_data(1400));
    let udp = udp_frame(&generate_test_data(512));

    group.bench_function("ipv4_tcp", |b| {
        b.iter(|| {
            let l3 = decode(black_box(&tcp)).expect("decode");
            black_box(TcpHeader::new_checked(l3.payload).expect("tcp").seq_number())
        });
    });

    group.bench_function("ipv4_udp", |b| {
        b.iter(|| {
            let l3 = decode(black_box(&udp)).expect("decode");
            black_box(UdpHeader::new_checked(l3.payload).expect("udp").payload().len())
        });
    });

    group.bench_function("tcp_verify_checksum", |b| {
        let l3 = decode(&tcp).expect("decode");
        let header = TcpHeader::new_checked(l3.payload).expect("tcp");
        b.iter(|| black_box(header.is_checksum_valid(l3.src, l3.dst)));
    });

    group.finish();
}

// ============================================================================
// Encode
// ============================================================================

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let mut out = vec![0u8; 65_535];

    group.bench_function("tcp_syn_ack", |b| {
        let options = SynOptions {
            mss: 1460,
            window_scale: Some(7),
            ..SynOptions::default()
        };
        b.iter(|| {
            let spec = SegmentSpec {
                src: intercept(),
                dst: client(),
                ident: 7,
                seq: 0,
                ack: 1001,
                flags: SYN | ACK,
                window: 0xFFFF,
                options: Some(&options),
                payload: &[],
            };
            black_box(encode_tcp_segment(&mut out, &spec).expect("encode"))
        });
    });

    for size in [0usize, 536, 1400] {
        let payload = generate_test_data(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("tcp_data", size), &payload, |b, payload| {
            b.iter(|| {
                let spec = SegmentSpec {
                    src: intercept(),
                    dst: client(),
                    ident: 7,
                    seq: 1,
                    ack: 1001,
                    flags: PSH | ACK,
                    window: 0xFFFF,
                    options: None,
                    payload,
                };
                black_box(encode_tcp_segment(&mut out, &spec).expect("encode"))
            });
        });
        group.bench_with_input(BenchmarkId::new("udp", size), &payload, |b, payload| {
            b.iter(|| {
                black_box(
                    encode_udp_datagram(&mut out, intercept(), client(), 7, payload)
                        .expect("encode"),
                )
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_checksum, bench_decode, bench_encode);
criterion_main!(benches);
