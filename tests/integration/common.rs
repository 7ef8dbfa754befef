//! Shared fixtures: a packet-oriented fake TUN device, frame builders and
//! loopback upstream servers.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

use tun_interceptor::packet::{
    self, encode_tcp_segment, encode_udp_datagram, SegmentSpec, SynOptions, TcpHeader, UdpHeader,
};
use tun_interceptor::{BoxedStream, ClientInfo, DialError, Dialer, DirectDialer, ServiceId};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn addr(s: &str) -> SocketAddrV4 {
    s.parse().expect("valid address")
}

// ============================================================================
// Fake TUN device
// ============================================================================

/// One frame per read and per write, like a TUN file descriptor
pub struct MockDevice {
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// Client side of a [`MockDevice`]
pub struct DeviceHandle {
    inject: mpsc::Sender<Vec<u8>>,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub fn mock_device() -> (MockDevice, DeviceHandle) {
    let (inject, inbound) = mpsc::channel(256);
    let (outbound, frames) = mpsc::unbounded_channel();
    (MockDevice { inbound, outbound }, DeviceHandle { inject, frames })
}

impl AsyncRead for MockDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().inbound.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                let n = frame.len().min(buf.remaining());
                buf.put_slice(&frame[..n]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockDevice {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.outbound.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl DeviceHandle {
    pub async fn inject(&self, frame: Vec<u8>) {
        self.inject.send(frame).await.expect("device closed");
    }

    /// Next frame written by the interceptor
    pub async fn recv(&mut self) -> Vec<u8> {
        tokio::time::timeout(RECV_TIMEOUT, self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("device closed")
    }

    /// `true` if nothing is written within `wait`
    pub async fn is_silent(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.frames.recv()).await.is_err()
    }
}

// ============================================================================
// Frames
// ============================================================================

#[allow(clippy::too_many_arguments)]
pub fn tcp_frame(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    options: Option<&SynOptions>,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = vec![0u8; 65_535];
    let len = encode_tcp_segment(
        &mut out,
        &SegmentSpec {
            src,
            dst,
            ident: 0,
            seq,
            ack,
            flags,
            window,
            options,
            payload,
        },
    )
    .expect("encode segment");
    out.truncate(len);
    out
}

pub fn udp_frame(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 65_535];
    let len = encode_udp_datagram(&mut out, src, dst, 0, payload).expect("encode datagram");
    out.truncate(len);
    out
}

/// TCP segment written by the interceptor
#[derive(Debug, Clone)]
pub struct Segment {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub options: Vec<u8>,
    pub payload: Vec<u8>,
}

pub fn parse_segment(frame: &[u8]) -> Segment {
    let l3 = packet::decode(frame).expect("valid IPv4");
    let tcp = TcpHeader::new_checked(l3.payload).expect("valid TCP");
    assert!(tcp.is_checksum_valid(l3.src, l3.dst));
    Segment {
        src: SocketAddrV4::new(l3.src, tcp.src_port()),
        dst: SocketAddrV4::new(l3.dst, tcp.dst_port()),
        seq: tcp.seq_number(),
        ack: tcp.ack_number(),
        flags: tcp.flags(),
        options: tcp.options().to_vec(),
        payload: tcp.payload().to_vec(),
    }
}

pub fn parse_datagram(frame: &[u8]) -> (SocketAddrV4, SocketAddrV4, Vec<u8>) {
    let l3 = packet::decode(frame).expect("valid IPv4");
    let udp = UdpHeader::new_checked(l3.payload).expect("valid UDP");
    assert!(udp.is_checksum_valid(l3.src, l3.dst));
    (
        SocketAddrV4::new(l3.src, udp.src_port()),
        SocketAddrV4::new(l3.dst, udp.dst_port()),
        udp.payload().to_vec(),
    )
}

// ============================================================================
// Upstreams
// ============================================================================

/// TCP server echoing every connection until EOF, then closing
pub async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let local = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = stream.shutdown().await;
            });
        }
    });
    local
}

/// TCP server that sends `greeting` as soon as a client connects
pub async fn spawn_tcp_greeter(greeting: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let local = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let greeting = greeting.clone();
            tokio::spawn(async move {
                let _ = stream.write_all(&greeting).await;
                // Hold the connection until the client goes away
                let mut buf = [0u8; 1024];
                while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });
    local
}

/// UDP server echoing every datagram
pub async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let local = socket.local_addr().expect("local addr");
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    local
}

/// Address nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("local addr")
}

// ============================================================================
// Dialer
// ============================================================================

/// [`DirectDialer`] that counts dials
pub struct CountingDialer {
    inner: DirectDialer,
    calls: AtomicUsize,
}

impl CountingDialer {
    pub fn new(inner: DirectDialer) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for CountingDialer {
    async fn dial(&self, service_id: &ServiceId, client: &ClientInfo) -> Result<BoxedStream, DialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(service_id, client).await
    }
}

/// Poll `cond` until it holds or five seconds pass
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
