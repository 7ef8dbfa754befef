//! UDP virtual connection
//!
//! Pairs a client address with an intercept address. Datagrams from the
//! client are queued by the manager via [`UdpVirtualConnection::accept`] and
//! read by the bridge; replies are written back as IPv4/UDP frames.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::device::FrameSink;
use crate::error::{InterceptError, Result};
use crate::flow::{FlowKey, InboundPacket};
use crate::io::{PacketBufferPool, VirtualStream};
use crate::packet::{encode_udp_datagram, MAX_UDP_PAYLOAD};

struct ReadHalf {
    rx: mpsc::Receiver<InboundPacket>,
    leftover: Option<InboundPacket>,
}

/// Client/intercept pair seen as one connection
pub struct UdpVirtualConnection {
    key: FlowKey,
    epoch: Instant,
    /// Milliseconds since `epoch`
    last_used: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
    tx: mpsc::Sender<InboundPacket>,
    reader: Mutex<ReadHalf>,
    tx_pool: PacketBufferPool,
    sink: Arc<dyn FrameSink>,
}

impl std::fmt::Debug for UdpVirtualConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpVirtualConnection")
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl UdpVirtualConnection {
    /// `tx_pool` buffers must hold a full IPv4 datagram
    pub fn new(
        key: FlowKey,
        queue_depth: usize,
        tx_pool: PacketBufferPool,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        Self {
            key,
            epoch: Instant::now(),
            last_used: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tx,
            reader: Mutex::new(ReadHalf { rx, leftover: None }),
            tx_pool,
            sink,
        }
    }

    #[must_use]
    pub const fn key(&self) -> FlowKey {
        self.key
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Last time a datagram passed in either direction
    #[must_use]
    pub fn last_used(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_used.load(Ordering::Relaxed))
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_used.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Queue a client datagram; `packet` must select the payload.
    ///
    /// Returns `false` if the datagram was dropped because the queue is full
    /// or the connection is closed.
    pub fn accept(&self, packet: InboundPacket) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.tx.try_send(packet) {
            Ok(()) => {
                self.touch();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(flow = %self.key, "UDP queue full, dropping datagram");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Read the next client payload, carrying over what does not fit.
    ///
    /// Returns `Ok(0)` once the connection is closed.
    ///
    /// # Errors
    ///
    /// Currently infallible.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut reader = self.reader.lock().await;
        loop {
            if let Some(mut pending) = reader.leftover.take() {
                let n = pending.len().min(buf.len());
                buf[..n].copy_from_slice(&pending.data()[..n]);
                pending.advance(n);
                if !pending.is_empty() {
                    reader.leftover = Some(pending);
                }
                return Ok(n);
            }

            let packet = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(0),
                packet = reader.rx.recv() => packet,
            };
            match packet {
                // Zero-length reads mean end-of-stream
                Some(packet) if packet.is_empty() => {
                    trace!(flow = %self.key, "Skipping empty datagram");
                }
                Some(packet) => reader.leftover = Some(packet),
                None => return Ok(0),
            }
        }
    }

    /// Send `payload` to the client, split into datagrams of at most
    /// [`MAX_UDP_PAYLOAD`] bytes.
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::Closed` if the connection is closed, or
    /// `InterceptError::Io` if the device write fails.
    pub async fn write(&self, payload: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(InterceptError::Closed);
        }
        for chunk in payload.chunks(MAX_UDP_PAYLOAD) {
            let Some(mut buf) = self.tx_pool.acquire().await else {
                return Err(InterceptError::Closed);
            };
            let len = encode_udp_datagram(
                buf.as_mut_full(),
                self.key.intercept,
                self.key.client,
                rand::random(),
                chunk,
            )?;
            buf.set_len(len);

            let written = self.sink.write_frame(&buf).await?;
            if written != len {
                let err = InterceptError::ShortWrite {
                    written,
                    expected: len,
                };
                warn!(flow = %self.key, "{}", err);
            }
            trace!(flow = %self.key, len = chunk.len(), "Datagram sent");
        }
        self.touch();
        Ok(payload.len())
    }

    /// Close the connection; later calls do nothing
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        debug!(flow = %self.key, "UDP connection closed");
    }
}

#[async_trait]
impl VirtualStream for UdpVirtualConnection {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        Self::read(self, buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        Self::write(self, buf).await
    }

    // Datagrams have no half-close
    async fn close_write(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {
        Self::close(self);
    }

    async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}
