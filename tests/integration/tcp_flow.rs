//! TCP flows through the interceptor against loopback upstreams

use std::sync::Arc;
use std::time::Duration;

use tun_interceptor::packet::tcp_flags::{ACK, FIN, PSH, SYN};
use tun_interceptor::packet::SynOptions;
use tun_interceptor::{Config, DirectDialer, Interceptor, NoopRoutes, Service, StaticResolver};

use super::common::*;

const CLIENT: &str = "192.168.1.5:4321";
const INTERCEPT: &str = "10.0.0.1:80";
const CLIENT_ISN: u32 = 5000;

async fn start(upstream: std::net::SocketAddr, mtu: u16) -> (Interceptor, DeviceHandle, Arc<CountingDialer>) {
    let mut config = Config::default();
    config.tun.mtu = mtu;
    config.tcp.linger_ms = 500;

    let mut direct = DirectDialer::new().with_connect_timeout(Duration::from_secs(2));
    direct.add_upstream("web".into(), upstream);
    let dialer = CountingDialer::new(direct);

    let mut resolver = StaticResolver::new();
    resolver.insert("web".into(), [format!("tcp:{INTERCEPT}").parse().unwrap()]);

    let interceptor = Interceptor::new(config, dialer.clone(), Arc::new(NoopRoutes));
    interceptor
        .intercept(&Service::new("web", "Web"), &resolver)
        .unwrap();
    let (device, handle) = mock_device();
    interceptor.start(device).unwrap();
    (interceptor, handle, dialer)
}

fn segment(seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    tcp_frame(addr(CLIENT), addr(INTERCEPT), seq, ack, flags, 64240, None, payload)
}

/// Complete the handshake; returns the SYN-ACK
async fn handshake(device: &mut DeviceHandle) -> Segment {
    let opts = SynOptions {
        mss: 1460,
        window_scale: Some(7),
        ..SynOptions::default()
    };
    device
        .inject(tcp_frame(
            addr(CLIENT),
            addr(INTERCEPT),
            CLIENT_ISN,
            0,
            SYN,
            64240,
            Some(&opts),
            &[],
        ))
        .await;
    let syn_ack = parse_segment(&device.recv().await);
    device
        .inject(segment(CLIENT_ISN + 1, syn_ack.seq + 1, ACK, &[]))
        .await;
    syn_ack
}

#[tokio::test]
async fn test_tcp_echo_round_trip() {
    let upstream = spawn_tcp_echo().await;
    let (interceptor, mut device, dialer) = start(upstream, 1500).await;

    let syn_ack = handshake(&mut device).await;
    assert_eq!(syn_ack.flags, SYN | ACK);
    assert_eq!(syn_ack.src, addr(INTERCEPT));
    assert_eq!(syn_ack.dst, addr(CLIENT));
    assert_eq!(syn_ack.seq, 1);
    assert_eq!(syn_ack.ack, CLIENT_ISN + 1);
    assert_eq!(dialer.calls(), 1);

    device
        .inject(segment(CLIENT_ISN + 1, 2, PSH | ACK, b"hello"))
        .await;
    let ack = parse_segment(&device.recv().await);
    assert_eq!(ack.flags, ACK);
    assert_eq!(ack.ack, CLIENT_ISN + 6);

    let echo = parse_segment(&device.recv().await);
    assert_eq!(echo.payload, b"hello");
    assert_eq!(echo.seq, 2);
    device.inject(segment(CLIENT_ISN + 6, 7, ACK, &[])).await;

    // Client closes; the echo server follows with its own close
    device.inject(segment(CLIENT_ISN + 6, 7, FIN | ACK, &[])).await;
    let fin_ack = parse_segment(&device.recv().await);
    assert_eq!(fin_ack.ack, CLIENT_ISN + 7);
    let fin = parse_segment(&device.recv().await);
    assert_eq!(fin.flags, FIN | ACK);
    assert_eq!(fin.seq, 7);

    device.inject(segment(CLIENT_ISN + 7, 8, ACK, &[])).await;
    eventually(|| interceptor.stats().tcp_flows == 0).await;

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_upstream_data_is_segmented_by_mss() {
    let greeting: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let upstream = spawn_tcp_greeter(greeting.clone()).await;
    // MTU 1440 leaves 1400 bytes of payload per segment
    let (interceptor, mut device, _) = start(upstream, 1440).await;

    let syn_ack = handshake(&mut device).await;
    assert_eq!(syn_ack.seq, 1);

    let mut received = Vec::new();
    let mut next_seq = 2u32;
    while received.len() < greeting.len() {
        let seg = parse_segment(&device.recv().await);
        assert!(seg.payload.len() <= 1400, "segment exceeds MSS");
        assert_eq!(seg.seq, next_seq);
        next_seq += seg.payload.len() as u32;
        received.extend_from_slice(&seg.payload);
        device
            .inject(segment(CLIENT_ISN + 1, next_seq, ACK, &[]))
            .await;
    }
    assert_eq!(received, greeting);
    assert_eq!(next_seq, 3002);

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_dial_failure_sends_nothing() {
    let upstream = closed_port().await;
    let (interceptor, mut device, dialer) = start(upstream, 1500).await;

    device
        .inject(segment(CLIENT_ISN, 0, SYN, &[]))
        .await;
    assert!(device.is_silent(Duration::from_millis(500)).await);
    eventually(|| interceptor.stats().tcp_flows == 0).await;
    assert_eq!(dialer.calls(), 1);

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_segment_without_flow_is_dropped() {
    let upstream = spawn_tcp_echo().await;
    let (interceptor, mut device, dialer) = start(upstream, 1500).await;

    device
        .inject(segment(CLIENT_ISN + 1, 1, ACK, b"stray"))
        .await;
    assert!(device.is_silent(Duration::from_millis(200)).await);
    assert_eq!(dialer.calls(), 0);
    assert_eq!(interceptor.stats().tcp_flows, 0);

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn test_tcp_stop_closes_flows() {
    let upstream = spawn_tcp_echo().await;
    let (interceptor, mut device, _) = start(upstream, 1500).await;

    handshake(&mut device).await;
    eventually(|| interceptor.stats().tcp_flows == 1).await;

    interceptor.stop().await.unwrap();
    let fin = parse_segment(&device.recv().await);
    assert_eq!(fin.flags, FIN | ACK);
    assert_eq!(interceptor.stats().tcp_flows, 0);
}
