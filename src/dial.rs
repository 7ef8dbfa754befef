//! Upstream dialing
//!
//! A [`Dialer`] turns a service id into a duplex byte stream. The bridge task
//! of every new flow dials once, then relays bytes between the stream and the
//! virtual connection.
//!
//! [`DirectDialer`] connects straight to a configured socket address: a TCP
//! stream for TCP services and a connected UDP socket, wrapped in
//! [`UdpStream`], for UDP services.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use crate::error::DialError;
use crate::flow::{FlowKey, Protocol};
use crate::registry::ServiceId;

/// Default connect timeout for [`DirectDialer`]
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte stream returned by a dialer
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

/// Boxed dial result
pub type BoxedStream = Box<dyn DuplexStream>;

/// Client side of a flow being dialed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub protocol: Protocol,
    pub flow: FlowKey,
}

/// Obtains the upstream stream for a new flow
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `service_id` on behalf of `client`
    async fn dial(&self, service_id: &ServiceId, client: &ClientInfo) -> Result<BoxedStream, DialError>;
}

/// Dialer connecting directly to configured upstream addresses
#[derive(Debug, Default)]
pub struct DirectDialer {
    upstreams: HashMap<ServiceId, SocketAddr>,
    connect_timeout: Option<Duration>,
}

impl DirectDialer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect timeout (default 10s)
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = Some(connect_timeout);
        self
    }

    /// Add or replace the upstream of a service.
    ///
    /// The same address is dialed over TCP or UDP depending on the flow.
    pub fn add_upstream(&mut self, service_id: ServiceId, addr: SocketAddr) {
        self.upstreams.insert(service_id, addr);
    }

    /// Configured upstream of a service
    #[must_use]
    pub fn upstream(&self, service_id: &str) -> Option<SocketAddr> {
        self.upstreams.get(service_id).copied()
    }

    fn timeout(&self) -> Duration {
        self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    async fn dial_tcp(&self, addr: SocketAddr) -> Result<BoxedStream, DialError> {
        let connect_timeout = self.timeout();
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                // Best-effort: proxied streams carry interactive traffic
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream))
            }
            Ok(Err(e)) => Err(DialError::connect_failed(addr, e.to_string())),
            Err(_) => Err(timeout_error(addr, connect_timeout)),
        }
    }

    async fn dial_udp(&self, addr: SocketAddr) -> Result<BoxedStream, DialError> {
        let bind: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        let connect_timeout = self.timeout();
        match timeout(connect_timeout, socket.connect(addr)).await {
            Ok(Ok(())) => Ok(Box::new(UdpStream::new(socket))),
            Ok(Err(e)) => Err(DialError::connect_failed(addr, e.to_string())),
            Err(_) => Err(timeout_error(addr, connect_timeout)),
        }
    }
}

fn timeout_error(addr: SocketAddr, after: Duration) -> DialError {
    DialError::Timeout {
        addr,
        timeout_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, service_id: &ServiceId, client: &ClientInfo) -> Result<BoxedStream, DialError> {
        let upstream = self
            .upstream(service_id)
            .ok_or_else(|| DialError::unknown_service(service_id.to_string()))?;
        debug!(
            service = %service_id,
            client = %client.flow.client,
            %upstream,
            protocol = %client.protocol,
            "Dialing upstream"
        );
        match client.protocol {
            Protocol::Tcp => self.dial_tcp(upstream).await,
            Protocol::Udp => self.dial_udp(upstream).await,
        }
    }
}

/// Connected UDP socket exposed as a byte stream.
///
/// Each `poll_write` sends one datagram and each `poll_read` receives one;
/// a datagram larger than the read buffer is truncated. Shutdown is a no-op.
#[derive(Debug)]
pub struct UdpStream {
    socket: UdpSocket,
}

impl UdpStream {
    /// Wrap a socket already connected to its peer
    #[must_use]
    pub const fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
