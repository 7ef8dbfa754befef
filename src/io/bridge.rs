//! Relay between a virtual connection and a dialed stream
//!
//! Every flow gets one bridge task. Once the upstream is dialed, [`relay`]
//! copies both directions concurrently:
//!
//! ```text
//!   VirtualStream::read ──► upstream write   (client_to_upstream)
//!   VirtualStream::write ◄── upstream read   (upstream_to_client)
//! ```
//!
//! Reaching EOF on one side half-closes the other: EOF from the client shuts
//! down the upstream write half, EOF from the upstream calls
//! [`VirtualStream::close_write`]. After the client's EOF the connection keeps
//! being drained so acknowledgments for upstream data are still consumed.
//! The relay ends when both directions are done, or as soon as the virtual
//! connection is closed.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::dial::BoxedStream;
use crate::error::Result;

/// Relay buffer size per direction
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Byte-stream face of a TCP or UDP virtual connection
#[async_trait]
pub trait VirtualStream: Send + Sync {
    /// Read client bytes; `Ok(0)` is end-of-stream
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Send bytes to the client
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Signal that no more bytes will be written
    async fn close_write(&self) -> Result<()>;

    /// Close the connection and wake every waiter
    async fn close(&self);

    /// Consume inbound control traffic once `read` has returned EOF.
    ///
    /// Returns when nothing more will arrive.
    async fn drain(&self) {}

    /// Resolves once the connection has been closed
    async fn closed(&self);
}

/// Result of a relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyResult {
    /// Bytes transferred from client to upstream
    pub client_to_upstream: u64,
    /// Bytes transferred from upstream to client
    pub upstream_to_client: u64,
}

impl CopyResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

/// Copy bytes between `conn` and `stream` until both directions finish or
/// the connection is closed.
pub async fn relay<C>(conn: &C, stream: BoxedStream) -> CopyResult
where
    C: VirtualStream + ?Sized,
{
    let (mut upstream_read, mut upstream_write) = tokio::io::split(stream);
    let upstream_done = CancellationToken::new();

    let mut client_to_upstream_bytes = 0u64;
    let client_to_upstream = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = match conn.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Client read ended: {}", e);
                    break;
                }
            };
            if let Err(e) = upstream_write.write_all(&buf[..n]).await {
                debug!("Upstream write failed: {}", e);
                break;
            }
            client_to_upstream_bytes += n as u64;
            trace!(bytes = n, "client -> upstream");
        }
        if let Err(e) = upstream_write.shutdown().await {
            debug!("Upstream shutdown failed: {}", e);
        }
        tokio::select! {
            () = conn.drain() => {}
            () = upstream_done.cancelled() => {}
        }
    };

    let mut upstream_to_client_bytes = 0u64;
    let upstream_to_client = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = match upstream_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Upstream read ended: {}", e);
                    break;
                }
            };
            if let Err(e) = conn.write(&buf[..n]).await {
                debug!("Client write failed: {}", e);
                break;
            }
            upstream_to_client_bytes += n as u64;
            trace!(bytes = n, "upstream -> client");
        }
        if let Err(e) = conn.close_write().await {
            debug!("close_write failed: {}", e);
        }
        upstream_done.cancel();
    };

    tokio::select! {
        () = async { tokio::join!(client_to_upstream, upstream_to_client); } => {}
        () = conn.closed() => {
            debug!("Connection closed during relay");
        }
    }

    CopyResult {
        client_to_upstream: client_to_upstream_bytes,
        upstream_to_client: upstream_to_client_bytes,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::io::duplex;
    use tokio::sync::{mpsc, Mutex};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::error::InterceptError;

    /// In-memory virtual connection: reads come from `inbound`, writes go to `outbound`
    struct ChannelStream {
        inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        write_closed: AtomicBool,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl VirtualStream for ChannelStream {
        async fn read(&self, buf: &mut [u8]) -> Result<usize> {
            let mut rx = self.inbound.lock().await;
            tokio::select! {
                () = self.cancel.cancelled() => Ok(0),
                chunk = rx.recv() => match chunk {
                    Some(chunk) => {
                        buf[..chunk.len()].copy_from_slice(&chunk);
                        Ok(chunk.len())
                    }
                    None => Ok(0),
                },
            }
        }

        async fn write(&self, buf: &[u8]) -> Result<usize> {
            self.outbound
                .send(buf.to_vec())
                .map_err(|_| InterceptError::Closed)?;
            Ok(buf.len())
        }

        async fn close_write(&self) -> Result<()> {
            self.write_closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) {
            self.cancel.cancel();
        }

        async fn closed(&self) {
            self.cancel.cancelled().await;
        }
    }

    fn channel_stream() -> (
        ChannelStream,
        mpsc::Sender<Vec<u8>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let stream = ChannelStream {
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
            write_closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        };
        (stream, in_tx, out_rx)
    }

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (conn, client_tx, mut client_rx) = channel_stream();
        let (upstream, mut far_end) = duplex(1024);

        let far = tokio::spawn(async move {
            let mut buf = [0u8; 5];
            far_end.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            far_end.write_all(b"world!").await.unwrap();
            far_end.shutdown().await.unwrap();
            // Client EOF reaches the far end as EOF
            let mut rest = Vec::new();
            far_end.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        });

        client_tx.send(b"hello".to_vec()).await.unwrap();
        drop(client_tx);

        let result = relay(&conn, Box::new(upstream)).await;
        far.await.unwrap();

        assert_eq!(result.client_to_upstream, 5);
        assert_eq!(result.upstream_to_client, 6);
        assert_eq!(result.total(), 11);
        assert_eq!(client_rx.recv().await.unwrap(), b"world!");
        assert!(conn.write_closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_relay_stops_on_close() {
        let (conn, _client_tx, _client_rx) = channel_stream();
        // Far end stays open and silent
        let (upstream, _far_end) = duplex(64);

        let cancel = conn.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let result = relay(&conn, Box::new(upstream)).await;
        assert_eq!(result, CopyResult::default());
    }

    #[test]
    fn test_copy_result_total() {
        let result = CopyResult {
            client_to_upstream: 100,
            upstream_to_client: 200,
        };
        assert_eq!(result.total(), 300);
    }
}
