//! Userspace TCP endpoint for one intercepted flow
//!
//! The client's kernel runs a full TCP stack; this side only does enough to
//! terminate it: handshake, in-order data, ACKs, window waits and the close
//! handshakes. Segments are assumed to arrive in order and are never
//! retransmitted by us.
//!
//! # Sequence numbers
//!
//! Our initial sequence number is zero. `snd_una` counts the sequence space
//! consumed so far, so the next segment carries `snd_una + 1`. All arithmetic
//! wraps on `u32`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::state::TcpState;
use super::TcpSettings;
use crate::device::FrameSink;
use crate::error::{InterceptError, Result};
use crate::flow::{FlowKey, InboundPacket};
use crate::io::{PacketBufferPool, VirtualStream};
use crate::packet::{
    encode_tcp_segment, parse_syn_options, tcp_flags, SegmentSpec, SynOptions, TcpHeader,
};

/// Window scale shift we advertise when the client offers scaling
pub const LOCAL_WINDOW_SCALE: u8 = 7;

/// Outcome of processing one client segment
#[derive(Debug)]
pub enum Received {
    /// Segment carried payload; the packet is narrowed to it
    Data(InboundPacket),
    /// Control-only segment
    Control,
    /// Connection is closed
    Eof,
}

/// Transmission control block
#[derive(Debug, Clone, Copy)]
struct ControlBlock {
    state: TcpState,
    /// Sequence space consumed by us
    snd_una: u32,
    /// Next sequence number expected from the client
    snd_ack_num: u32,
    /// Highest acknowledgment received from the client
    rcv_ack_num: u32,
    /// Last window advertised by the client, unscaled
    rcv_adv: u16,
    /// Shift applied to `rcv_adv`
    rcv_wnd_scale: u8,
    /// Client offered window scaling in its SYN
    window_scaling: bool,
    /// Negotiated MSS
    mss: u16,
}

impl ControlBlock {
    fn new(mss: u16) -> Self {
        Self {
            state: TcpState::Listen,
            snd_una: 0,
            snd_ack_num: 0,
            rcv_ack_num: 0,
            rcv_adv: 0,
            rcv_wnd_scale: 0,
            window_scaling: false,
            mss,
        }
    }

    /// Client window in bytes
    fn send_window(&self) -> u32 {
        u32::from(self.rcv_adv) << self.rcv_wnd_scale
    }

    /// Whether `len` more bytes fit in the client window
    fn fits(&self, len: u32) -> bool {
        self.snd_una
            .wrapping_add(len)
            .wrapping_sub(self.rcv_ack_num)
            <= self.send_window()
    }
}

/// Read-only copy of the control block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnSnapshot {
    pub state: TcpState,
    pub snd_una: u32,
    pub snd_ack_num: u32,
    pub rcv_ack_num: u32,
    pub rcv_adv: u16,
    pub rcv_wnd_scale: u8,
    pub mss: u16,
}

impl From<&ControlBlock> for ConnSnapshot {
    fn from(cb: &ControlBlock) -> Self {
        Self {
            state: cb.state,
            snd_una: cb.snd_una,
            snd_ack_num: cb.snd_ack_num,
            rcv_ack_num: cb.rcv_ack_num,
            rcv_adv: cb.rcv_adv,
            rcv_wnd_scale: cb.rcv_wnd_scale,
            mss: cb.mss,
        }
    }
}

struct ReadHalf {
    rx: mpsc::Receiver<InboundPacket>,
    /// Payload not yet handed to a reader
    leftover: Option<InboundPacket>,
}

/// Virtual TCP connection terminating one client flow
pub struct TcpVirtualConnection {
    key: FlowKey,
    /// MSS derived from our MTU
    local_mss: u16,
    cb: Mutex<ControlBlock>,
    reader: Mutex<ReadHalf>,
    /// Woken whenever the client acknowledges data
    window: Notify,
    cancel: CancellationToken,
    tx_pool: PacketBufferPool,
    sink: Arc<dyn FrameSink>,
}

impl std::fmt::Debug for TcpVirtualConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpVirtualConnection")
            .field("key", &self.key)
            .field("local_mss", &self.local_mss)
            .field("closed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn seq_len(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl TcpVirtualConnection {
    /// Create a connection in `Listen` fed by `rx`
    pub fn new(
        key: FlowKey,
        rx: mpsc::Receiver<InboundPacket>,
        sink: Arc<dyn FrameSink>,
        settings: &TcpSettings,
    ) -> Self {
        let local_mss = settings.mss();
        Self {
            key,
            local_mss,
            cb: Mutex::new(ControlBlock::new(local_mss)),
            reader: Mutex::new(ReadHalf { rx, leftover: None }),
            window: Notify::new(),
            cancel: CancellationToken::new(),
            tx_pool: PacketBufferPool::new(settings.tx_buffers, usize::from(settings.mtu)),
            sink,
        }
    }

    #[must_use]
    pub const fn key(&self) -> FlowKey {
        self.key
    }

    pub async fn state(&self) -> TcpState {
        self.cb.lock().await.state
    }

    pub async fn snapshot(&self) -> ConnSnapshot {
        ConnSnapshot::from(&*self.cb.lock().await)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one client segment through the state machine.
    ///
    /// `packet` must select a whole TCP segment.
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::Decode` if the segment is malformed.
    pub async fn process_segment(&self, mut packet: InboundPacket) -> Result<Received> {
        let (flags, seq, ack, window, offset, options) = {
            let tcp = TcpHeader::new_checked(packet.data())?;
            let options = tcp
                .has_flags(tcp_flags::SYN)
                .then(|| parse_syn_options(tcp.options(), tcp.has_flags(tcp_flags::ACK)));
            (
                tcp.flags(),
                tcp.seq_number(),
                tcp.ack_number(),
                tcp.window(),
                tcp.data_offset(),
                options,
            )
        };
        let payload_len = packet.len().saturating_sub(offset);
        let has = |f: u8| flags & f == f;

        let mut cb = self.cb.lock().await;
        debug!(
            client = %self.key.client,
            state = %cb.state,
            flags = format_args!("{flags:#04x}"),
            seq,
            ack,
            len = payload_len,
            "Segment received"
        );

        cb.rcv_adv = window;
        if has(tcp_flags::ACK) {
            cb.rcv_ack_num = ack;
        }
        if has(tcp_flags::SYN) {
            cb.snd_ack_num = seq.wrapping_add(1);
        }

        let mut deliver = false;
        match cb.state {
            TcpState::Listen if has(tcp_flags::SYN) => {
                let peer = options.unwrap_or_default();
                cb.mss = self.local_mss.min(peer.mss);
                if let Some(shift) = peer.window_scale {
                    cb.rcv_wnd_scale = shift;
                    cb.window_scaling = true;
                }
                self.transmit(&mut cb, &[], tcp_flags::SYN | tcp_flags::ACK)
                    .await;
                cb.state = TcpState::SynReceived;
            }
            TcpState::SynReceived if has(tcp_flags::ACK) => {
                cb.state = TcpState::Established;
                deliver = self
                    .receive(&mut cb, payload_len, has(tcp_flags::FIN))
                    .await;
            }
            TcpState::Established => {
                deliver = self
                    .receive(&mut cb, payload_len, has(tcp_flags::FIN))
                    .await;
            }
            TcpState::FinWait1 => {
                deliver = self.consume(&mut cb, payload_len, has(tcp_flags::FIN));
                if payload_len > 0 || has(tcp_flags::FIN) {
                    self.transmit(&mut cb, &[], tcp_flags::ACK).await;
                }
                if has(tcp_flags::FIN | tcp_flags::ACK) {
                    cb.state = TcpState::TimeWait;
                } else if has(tcp_flags::FIN) {
                    cb.state = TcpState::Closing;
                } else if has(tcp_flags::ACK) {
                    cb.state = TcpState::FinWait2;
                }
            }
            TcpState::FinWait2 => {
                deliver = self.consume(&mut cb, payload_len, has(tcp_flags::FIN));
                self.transmit(&mut cb, &[], tcp_flags::ACK).await;
                if has(tcp_flags::FIN) {
                    cb.state = TcpState::TimeWait;
                }
            }
            // Only acknowledgments for our data are expected now
            TcpState::CloseWait => {}
            TcpState::Closing if has(tcp_flags::ACK) => cb.state = TcpState::TimeWait,
            TcpState::LastAck if has(tcp_flags::ACK) => cb.state = TcpState::Closed,
            // Retransmitted FIN: our ACK was lost
            TcpState::TimeWait if has(tcp_flags::FIN) => {
                self.transmit(&mut cb, &[], tcp_flags::ACK).await;
            }
            TcpState::Closed => return Ok(Received::Eof),
            state => {
                debug!(client = %self.key.client, %state, "Ignoring unexpected segment");
            }
        }

        // Window, acknowledgment or state may have changed
        self.window.notify_waiters();
        if cb.state == TcpState::Closed {
            return Ok(Received::Eof);
        }
        drop(cb);

        if deliver {
            packet.narrow(offset, offset + payload_len);
            Ok(Received::Data(packet))
        } else {
            Ok(Received::Control)
        }
    }

    /// Account for payload and FIN in `Established`, acknowledging both
    async fn receive(&self, cb: &mut ControlBlock, len: usize, fin: bool) -> bool {
        let deliver = self.consume(cb, len, fin);
        if fin {
            cb.state = TcpState::CloseWait;
        }
        if len > 0 || fin {
            self.transmit(cb, &[], tcp_flags::ACK).await;
        }
        deliver
    }

    fn consume(&self, cb: &mut ControlBlock, len: usize, fin: bool) -> bool {
        cb.snd_ack_num = cb.snd_ack_num.wrapping_add(seq_len(len));
        if fin {
            cb.snd_ack_num = cb.snd_ack_num.wrapping_add(1);
        }
        trace!(client = %self.key.client, ack = cb.snd_ack_num, "Receive window advanced");
        len > 0
    }

    /// Build and send one segment, then advance `snd_una`
    async fn transmit(&self, cb: &mut ControlBlock, payload: &[u8], flags: u8) {
        let options = (flags & tcp_flags::SYN != 0).then(|| SynOptions {
            mss: self.local_mss,
            window_scale: cb.window_scaling.then_some(LOCAL_WINDOW_SCALE),
            ..SynOptions::default()
        });

        let Some(mut buf) = self.tx_pool.acquire().await else {
            debug!(client = %self.key.client, "Transmit pool closed");
            return;
        };
        let spec = SegmentSpec {
            src: self.key.intercept,
            dst: self.key.client,
            ident: rand::random(),
            seq: cb.snd_una.wrapping_add(1),
            ack: cb.snd_ack_num,
            flags,
            window: u16::MAX,
            options: options.as_ref(),
            payload,
        };
        let len = match encode_tcp_segment(buf.as_mut_full(), &spec) {
            Ok(len) => len,
            Err(e) => {
                warn!(client = %self.key.client, "Failed to encode segment: {}", e);
                return;
            }
        };
        buf.set_len(len);

        match self.sink.write_frame(&buf).await {
            Ok(written) if written == len => {}
            Ok(written) => {
                let err = InterceptError::ShortWrite {
                    written,
                    expected: len,
                };
                warn!(client = %self.key.client, "{}", err);
            }
            Err(e) => warn!(client = %self.key.client, "Device write failed: {}", e),
        }

        let mut consumed = seq_len(payload.len());
        if flags & (tcp_flags::SYN | tcp_flags::FIN) != 0 {
            consumed = consumed.wrapping_add(1);
        }
        cb.snd_una = cb.snd_una.wrapping_add(consumed);
        trace!(
            client = %self.key.client,
            seq = spec.seq,
            ack = spec.ack,
            flags = format_args!("{flags:#04x}"),
            len = payload.len(),
            "Segment sent"
        );
    }

    /// Read client payload; `Ok(0)` once the client has closed its side
    ///
    /// # Errors
    ///
    /// Never fails today; malformed segments are logged and skipped.
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

            if self.state().await.is_read_closed() {
                return Ok(0);
            }

            let packet = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(0),
                packet = reader.rx.recv() => packet,
            };
            let Some(packet) = packet else {
                return Ok(0);
            };
            match self.process_segment(packet).await {
                Ok(Received::Data(data)) => reader.leftover = Some(data),
                Ok(Received::Control) => {}
                Ok(Received::Eof) => return Ok(0),
                Err(e) => debug!(client = %self.key.client, "Dropping segment: {}", e),
            }
        }
    }

    /// Send `data` to the client in MSS-sized segments.
    ///
    /// Waits while a segment does not fit in the client window. A zero
    /// window drops the segment instead.
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::InvalidConnectionState` if the connection
    /// can no longer send, or `InterceptError::Closed` if it is closed while
    /// waiting. Writes issued before the handshake starts wait for it.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let state = self.wait_handshake().await?;
        if !state.can_write() {
            return Err(InterceptError::InvalidConnectionState { state });
        }

        let mss = usize::from(self.cb.lock().await.mss.max(1));
        for chunk in data.chunks(mss) {
            self.send_chunk(chunk).await?;
        }
        Ok(data.len())
    }

    /// Wait until the client's SYN has been processed.
    ///
    /// The upstream may speak first, before the bridge has read the SYN.
    async fn wait_handshake(&self) -> Result<TcpState> {
        loop {
            let notified = self.window.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.state().await;
            if state != TcpState::Listen {
                return Ok(state);
            }
            tokio::select! {
                () = notified => {}
                () = self.cancel.cancelled() => return Err(InterceptError::Closed),
            }
        }
    }

    async fn send_chunk(&self, chunk: &[u8]) -> Result<()> {
        let len = seq_len(chunk.len());
        loop {
            let notified = self.window.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut cb = self.cb.lock().await;
                if !cb.state.can_write() {
                    return Err(InterceptError::InvalidConnectionState { state: cb.state });
                }
                if cb.rcv_adv == 0 {
                    debug!(client = %self.key.client, len = chunk.len(), "Zero window, dropping chunk");
                    return Ok(());
                }
                if cb.fits(len) {
                    self.transmit(&mut cb, chunk, tcp_flags::ACK).await;
                    return Ok(());
                }
                trace!(
                    client = %self.key.client,
                    window = cb.send_window(),
                    "Waiting for window"
                );
            }

            // Nobody else is draining the inbound queue, so the ACKs we are
            // waiting for have to be processed here
            if let Ok(mut reader) = self.reader.try_lock() {
                if reader.leftover.is_none() {
                    tokio::select! {
                        () = &mut notified => {}
                        () = self.cancel.cancelled() => return Err(InterceptError::Closed),
                        packet = reader.rx.recv() => {
                            let Some(packet) = packet else {
                                return Err(InterceptError::Closed);
                            };
                            self.pump(&mut reader, packet).await;
                        }
                    }
                    continue;
                }
            }

            tokio::select! {
                () = notified => {}
                () = self.cancel.cancelled() => return Err(InterceptError::Closed),
            }
        }
    }

    async fn pump(&self, reader: &mut MutexGuard<'_, ReadHalf>, packet: InboundPacket) {
        match self.process_segment(packet).await {
            Ok(Received::Data(data)) => reader.leftover = Some(data),
            Ok(_) => {}
            Err(e) => debug!(client = %self.key.client, "Dropping segment: {}", e),
        }
    }

    /// Send FIN; no more data will be written
    ///
    /// # Errors
    ///
    /// Currently infallible.
    pub async fn close_write(&self) -> Result<()> {
        let mut cb = self.cb.lock().await;
        let next = match cb.state {
            TcpState::SynReceived | TcpState::Established => TcpState::FinWait1,
            TcpState::CloseWait => TcpState::LastAck,
            _ => return Ok(()),
        };
        self.transmit(&mut cb, &[], tcp_flags::FIN | tcp_flags::ACK)
            .await;
        debug!(client = %self.key.client, from = %cb.state, to = %next, "Write side closed");
        cb.state = next;
        Ok(())
    }

    /// Close both directions and wake every waiter
    pub async fn close(&self) {
        if let Err(e) = self.close_write().await {
            debug!(client = %self.key.client, "close_write failed: {}", e);
        }
        self.cancel.cancel();
        self.window.notify_waiters();
        self.tx_pool.close();
    }

    /// Process client segments until the close handshake finishes, the
    /// connection is closed or the flow's queue ends.
    ///
    /// Payload is discarded; only state, window and acknowledgments matter.
    pub async fn drain(&self) {
        let mut reader = self.reader.lock().await;
        loop {
            if self.state().await.is_finished() {
                break;
            }
            let packet = tokio::select! {
                () = self.cancel.cancelled() => break,
                packet = reader.rx.recv() => packet,
            };
            let Some(packet) = packet else {
                break;
            };
            match self.process_segment(packet).await {
                Ok(Received::Eof) => break,
                Ok(Received::Data(data)) => {
                    trace!(client = %self.key.client, len = data.len(), "Discarding payload after EOF");
                }
                Ok(Received::Control) => {}
                Err(e) => debug!(client = %self.key.client, "Dropping segment: {}", e),
            }
        }
    }

    /// Keep consuming client segments until the close handshake finishes or
    /// `max` elapses
    pub async fn linger(&self, max: Duration) {
        if self.is_closed() {
            return;
        }
        if tokio::time::timeout(max, self.drain()).await.is_err() {
            let state = self.state().await;
            debug!(client = %self.key.client, %state, "Linger timed out");
        }
    }
}

#[async_trait]
impl VirtualStream for TcpVirtualConnection {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        Self::read(self, buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        Self::write(self, buf).await
    }

    async fn close_write(&self) -> Result<()> {
        Self::close_write(self).await
    }

    async fn close(&self) {
        Self::close(self).await;
    }

    async fn drain(&self) {
        Self::drain(self).await;
    }

    async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}
