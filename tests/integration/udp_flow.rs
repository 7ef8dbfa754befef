//! UDP flows through the interceptor against a loopback echo server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tun_interceptor::config::LimitAction;
use tun_interceptor::{Config, DirectDialer, Interceptor, NoopRoutes, Service, StaticResolver};

use super::common::*;

const CLIENT_A: &str = "192.168.1.5:5000";
const CLIENT_B: &str = "192.168.1.6:5001";
const INTERCEPT: &str = "10.0.0.53:53";

async fn start(
    upstream: SocketAddr,
    config: Config,
) -> (Interceptor, DeviceHandle, Arc<CountingDialer>) {
    let mut direct = DirectDialer::new().with_connect_timeout(Duration::from_secs(2));
    direct.add_upstream("dns".into(), upstream);
    let dialer = CountingDialer::new(direct);

    let mut resolver = StaticResolver::new();
    resolver.insert("dns".into(), [format!("udp:{INTERCEPT}").parse().unwrap()]);

    let interceptor = Interceptor::new(config, dialer.clone(), Arc::new(NoopRoutes));
    interceptor
        .intercept(&Service::new("dns", "DNS"), &resolver)
        .unwrap();
    let (device, handle) = mock_device();
    interceptor.start(device).unwrap();
    (interceptor, handle, dialer)
}

async fn wait_for_connections(interceptor: &Interceptor, count: usize) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if interceptor.udp_connections().await.unwrap().len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {count} UDP connections");
}

async fn echo(device: &mut DeviceHandle, client: &str, payload: &[u8]) {
    device
        .inject(udp_frame(addr(client), addr(INTERCEPT), payload))
        .await;
    let (src, dst, reply) = parse_datagram(&device.recv().await);
    assert_eq!(src, addr(INTERCEPT));
    assert_eq!(dst, addr(client));
    assert_eq!(reply, payload);
}

#[tokio::test]
async fn test_udp_echo_round_trip() {
    let upstream = spawn_udp_echo().await;
    let (interceptor, mut device, dialer) = start(upstream, Config::default()).await;

    echo(&mut device, CLIENT_A, b"query-1").await;
    echo(&mut device, CLIENT_A, b"query-2").await;
    assert_eq!(dialer.calls(), 1);

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_connection_per_client() {
    let upstream = spawn_udp_echo().await;
    let (interceptor, mut device, dialer) = start(upstream, Config::default()).await;

    echo(&mut device, CLIENT_A, b"from a").await;
    echo(&mut device, CLIENT_B, b"from b").await;
    assert_eq!(dialer.calls(), 2);

    let mut keys = interceptor.udp_connections().await.unwrap();
    keys.sort_by_key(|k| k.client);
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0].client, addr(CLIENT_A));
    assert_eq!(keys[1].client, addr(CLIENT_B));

    interceptor.stop().await.unwrap();
    assert!(interceptor.udp_connections().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_udp_limit_denies_new_clients() {
    let upstream = spawn_udp_echo().await;
    let mut config = Config::default();
    config.udp.max_connections = 1;
    config.udp.on_limit = LimitAction::Deny;
    let (interceptor, mut device, dialer) = start(upstream, config).await;

    echo(&mut device, CLIENT_A, b"first").await;
    device
        .inject(udp_frame(addr(CLIENT_B), addr(INTERCEPT), b"second"))
        .await;
    assert!(device.is_silent(Duration::from_millis(300)).await);
    assert_eq!(dialer.calls(), 1);

    let keys = interceptor.udp_connections().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].client, addr(CLIENT_A));

    // The admitted client keeps working
    echo(&mut device, CLIENT_A, b"again").await;

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_limit_evicts_least_recently_used() {
    let upstream = spawn_udp_echo().await;
    let mut config = Config::default();
    config.udp.max_connections = 1;
    config.udp.on_limit = LimitAction::DropLru;
    let (interceptor, mut device, dialer) = start(upstream, config).await;

    echo(&mut device, CLIENT_A, b"first").await;
    echo(&mut device, CLIENT_B, b"second").await;
    assert_eq!(dialer.calls(), 2);

    let keys = interceptor.udp_connections().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].client, addr(CLIENT_B));

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_idle_connection_expires() {
    let upstream = spawn_udp_echo().await;
    let mut config = Config::default();
    config.udp.idle_timeout_secs = 1;
    config.udp.poll_interval_secs = 1;
    let (interceptor, mut device, dialer) = start(upstream, config).await;

    echo(&mut device, CLIENT_A, b"ping").await;
    wait_for_connections(&interceptor, 1).await;
    wait_for_connections(&interceptor, 0).await;

    // A new datagram reopens the flow
    echo(&mut device, CLIENT_A, b"ping").await;
    assert_eq!(dialer.calls(), 2);

    interceptor.stop().await.unwrap();
}

#[tokio::test]
async fn test_udp_unregistered_address_is_ignored() {
    let upstream = spawn_udp_echo().await;
    let (interceptor, mut device, dialer) = start(upstream, Config::default()).await;

    device
        .inject(udp_frame(addr(CLIENT_A), addr("10.0.0.99:53"), b"nobody"))
        .await;
    assert!(device.is_silent(Duration::from_millis(300)).await);
    assert_eq!(dialer.calls(), 0);
    assert!(interceptor.udp_connections().await.unwrap().is_empty());

    interceptor.stop().await.unwrap();
}
