//! Shared helpers for unit tests

use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Notify};

use crate::device::FrameSink;
use crate::dial::{BoxedStream, ClientInfo, Dialer};
use crate::error::DialError;
use crate::flow::InboundPacket;
use crate::io::PacketBufferPool;
use crate::packet::{self, SegmentSpec, SynOptions, TcpHeader, UdpHeader};
use crate::registry::ServiceId;

pub fn addr(s: &str) -> SocketAddrV4 {
    s.parse().unwrap()
}

/// Records every frame written to it
#[derive(Default)]
pub struct CaptureSink {
    frames: Mutex<Vec<Vec<u8>>>,
    written: Notify,
    /// Accept at most this many bytes per frame when set
    short_write: Option<usize>,
}

impl CaptureSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sink that reports at most `limit` bytes written per frame
    pub fn short(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            short_write: Some(limit),
            ..Self::default()
        })
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }

    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock())
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Wait until at least `count` frames have been captured
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.written.notified();
            if self.len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl FrameSink for CaptureSink {
    async fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        self.frames.lock().push(frame.to_vec());
        self.written.notify_waiters();
        Ok(self.short_write.map_or(frame.len(), |n| n.min(frame.len())))
    }
}

/// Decoded view of a captured TCP frame
#[derive(Debug, Clone)]
pub struct SentSegment {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub options: Vec<u8>,
    pub payload: Vec<u8>,
}

pub fn parse_segment(frame: &[u8]) -> SentSegment {
    let l3 = packet::decode(frame).unwrap();
    let tcp = TcpHeader::new_checked(l3.payload).unwrap();
    assert!(tcp.is_checksum_valid(l3.src, l3.dst), "bad TCP checksum");
    SentSegment {
        src: SocketAddrV4::new(l3.src, tcp.src_port()),
        dst: SocketAddrV4::new(l3.dst, tcp.dst_port()),
        seq: tcp.seq_number(),
        ack: tcp.ack_number(),
        flags: tcp.flags(),
        window: tcp.window(),
        options: tcp.options().to_vec(),
        payload: tcp.payload().to_vec(),
    }
}

pub fn parse_datagram(frame: &[u8]) -> (SocketAddrV4, SocketAddrV4, Vec<u8>) {
    let l3 = packet::decode(frame).unwrap();
    let udp = UdpHeader::new_checked(l3.payload).unwrap();
    assert!(udp.is_checksum_valid(l3.src, l3.dst), "bad UDP checksum");
    (
        SocketAddrV4::new(l3.src, udp.src_port()),
        SocketAddrV4::new(l3.dst, udp.dst_port()),
        udp.payload().to_vec(),
    )
}

/// Builds client-side frames into pooled buffers
pub struct PacketFactory {
    pool: PacketBufferPool,
}

impl PacketFactory {
    pub fn new() -> Self {
        Self {
            pool: PacketBufferPool::new(64, 2048),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn tcp(
        &self,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        seq: u32,
        ack: u32,
        flags: u8,
        window: u16,
        options: Option<&SynOptions>,
        payload: &[u8],
    ) -> InboundPacket {
        let mut buf = self.pool.try_acquire().unwrap();
        let len = packet::encode_tcp_segment(
            buf.as_mut_full(),
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
        .unwrap();
        buf.set_len(len);
        InboundPacket::from_frame(buf).unwrap()
    }

    pub fn udp(&self, src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> InboundPacket {
        let mut buf = self.pool.try_acquire().unwrap();
        let len = packet::encode_udp_datagram(buf.as_mut_full(), src, dst, 0, payload).unwrap();
        buf.set_len(len);
        InboundPacket::from_frame(buf).unwrap()
    }
}

/// Dialer handing out in-memory duplex streams.
///
/// The far ends are kept per service so tests can play the upstream.
#[derive(Default)]
pub struct MockDialer {
    calls: AtomicUsize,
    far_ends: Mutex<HashMap<ServiceId, Vec<DuplexStream>>>,
    pub fail: bool,
}

impl MockDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Take the upstream end of the oldest dialed stream for `service`
    pub fn take_far_end(&self, service: &str) -> Option<DuplexStream> {
        let mut far_ends = self.far_ends.lock();
        let ends = far_ends.get_mut(service)?;
        (!ends.is_empty()).then(|| ends.remove(0))
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, service_id: &ServiceId, _client: &ClientInfo) -> Result<BoxedStream, DialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DialError::connect_failed(
                "127.0.0.1:1".parse().unwrap(),
                "refused",
            ));
        }
        let (near, far) = tokio::io::duplex(64 * 1024);
        self.far_ends
            .lock()
            .entry(service_id.clone())
            .or_default()
            .push(far);
        Ok(Box::new(near))
    }
}

/// TUN stand-in: one frame per read and per write
pub struct MockDevice {
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// Test side of a [`MockDevice`]
pub struct DeviceHandle {
    pub inject: mpsc::Sender<Vec<u8>>,
    pub frames: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MockDevice {
    pub fn new() -> (Self, DeviceHandle) {
        let (inject, inbound) = mpsc::channel(64);
        let (outbound, frames) = mpsc::unbounded_channel();
        (Self { inbound, outbound }, DeviceHandle { inject, frames })
    }
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

/// Encode a client TCP frame
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
    let mut out = vec![0u8; 2048];
    let len = packet::encode_tcp_segment(
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
    .unwrap();
    out.truncate(len);
    out
}

/// Encode a client UDP frame
pub fn udp_frame(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 2048];
    let len = packet::encode_udp_datagram(&mut out, src, dst, 0, payload).unwrap();
    out.truncate(len);
    out
}
