//! TCP flow dispatch
//!
//! Every TCP segment read off the device passes through
//! [`TcpFlowDispatcher::enqueue`]. Segments of known flows are queued to
//! their connection; a SYN for a registered intercept address creates a new
//! connection and spawns its bridge task:
//!
//! ```text
//! dial upstream ──► relay ──► linger ──► remove flow ──► close
//! ```
//!
//! The upstream is dialed before the SYN is processed, so a failed dial never
//! answers the client.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::conn::TcpVirtualConnection;
use super::TcpSettings;
use crate::device::FrameSink;
use crate::dial::{ClientInfo, Dialer};
use crate::error::Result;
use crate::flow::{FlowKey, InboundPacket, Protocol};
use crate::io::relay;
use crate::packet::{tcp_flags, TcpHeader};
use crate::registry::{ServiceId, ServiceRegistry};

/// Dispatcher counters
#[derive(Debug, Default)]
pub struct TcpDispatcherStats {
    flows_opened: AtomicU64,
    flows_closed: AtomicU64,
    dial_failures: AtomicU64,
    orphan_segments: AtomicU64,
}

impl TcpDispatcherStats {
    pub fn flows_opened(&self) -> u64 {
        self.flows_opened.load(Ordering::Relaxed)
    }

    pub fn flows_closed(&self) -> u64 {
        self.flows_closed.load(Ordering::Relaxed)
    }

    pub fn dial_failures(&self) -> u64 {
        self.dial_failures.load(Ordering::Relaxed)
    }

    /// Segments dropped because no flow existed and they were not a SYN
    pub fn orphan_segments(&self) -> u64 {
        self.orphan_segments.load(Ordering::Relaxed)
    }
}

struct FlowHandle {
    tx: mpsc::Sender<InboundPacket>,
    conn: Arc<TcpVirtualConnection>,
}

type FlowTable = DashMap<FlowKey, FlowHandle>;

/// Routes client segments to their virtual connections
pub struct TcpFlowDispatcher {
    registry: Arc<ServiceRegistry>,
    flows: Arc<FlowTable>,
    dialer: Arc<dyn Dialer>,
    sink: Arc<dyn FrameSink>,
    settings: TcpSettings,
    stats: Arc<TcpDispatcherStats>,
}

impl TcpFlowDispatcher {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        dialer: Arc<dyn Dialer>,
        sink: Arc<dyn FrameSink>,
        settings: TcpSettings,
    ) -> Self {
        Self {
            registry,
            flows: Arc::new(DashMap::new()),
            dialer,
            sink,
            settings,
            stats: Arc::new(TcpDispatcherStats::default()),
        }
    }

    /// Route one segment.
    ///
    /// Returns `Ok(false)` if no service is registered for the destination.
    /// Waits while the flow's queue is full.
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::Decode` if the TCP header is malformed.
    pub async fn enqueue(&self, packet: InboundPacket) -> Result<bool> {
        let (key, syn) = {
            let tcp = TcpHeader::new_checked(packet.data())?;
            let key = FlowKey::new(
                SocketAddrV4::new(packet.src, tcp.src_port()),
                SocketAddrV4::new(packet.dst, tcp.dst_port()),
            );
            let syn = tcp.has_flags(tcp_flags::SYN) && !tcp.has_flags(tcp_flags::ACK);
            (key, syn)
        };

        let Some(service_id) = self.registry.lookup(&key.intercept) else {
            trace!(intercept = %key.intercept, "No TCP service registered");
            return Ok(false);
        };

        let tx = match self.flows.entry(key) {
            Entry::Occupied(entry) => entry.get().tx.clone(),
            Entry::Vacant(entry) => {
                if !syn {
                    self.stats.orphan_segments.fetch_add(1, Ordering::Relaxed);
                    debug!(flow = %key, "Segment for unknown flow, dropping");
                    return Ok(true);
                }
                let (tx, rx) = mpsc::channel(self.settings.queue_depth);
                let conn = Arc::new(TcpVirtualConnection::new(
                    key,
                    rx,
                    Arc::clone(&self.sink),
                    &self.settings,
                ));
                entry.insert(FlowHandle {
                    tx: tx.clone(),
                    conn: Arc::clone(&conn),
                });
                self.stats.flows_opened.fetch_add(1, Ordering::Relaxed);
                self.spawn_bridge(service_id, conn);
                tx
            }
        };

        if tx.send(packet).await.is_err() {
            debug!(flow = %key, "Flow already closed, dropping segment");
        }
        Ok(true)
    }

    fn spawn_bridge(&self, service_id: ServiceId, conn: Arc<TcpVirtualConnection>) {
        let dialer = Arc::clone(&self.dialer);
        let flows = Arc::clone(&self.flows);
        let stats = Arc::clone(&self.stats);
        let linger = self.settings.linger;
        tokio::spawn(async move {
            bridge(service_id, conn, dialer, flows, stats, linger).await;
        });
    }

    /// Number of live flows
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.flows.len()
    }

    /// Connection of `key`, if the flow exists
    #[must_use]
    pub fn connection(&self, key: &FlowKey) -> Option<Arc<TcpVirtualConnection>> {
        self.flows.get(key).map(|handle| Arc::clone(&handle.conn))
    }

    #[must_use]
    pub fn stats(&self) -> &TcpDispatcherStats {
        &self.stats
    }

    /// Close and forget every flow
    pub async fn close_all(&self) {
        let conns: Vec<_> = self
            .flows
            .iter()
            .map(|entry| Arc::clone(&entry.conn))
            .collect();
        self.flows.clear();
        for conn in &conns {
            conn.close().await;
        }
        if !conns.is_empty() {
            info!(count = conns.len(), "Closed all TCP flows");
        }
    }
}

async fn bridge(
    service_id: ServiceId,
    conn: Arc<TcpVirtualConnection>,
    dialer: Arc<dyn Dialer>,
    flows: Arc<FlowTable>,
    stats: Arc<TcpDispatcherStats>,
    linger: Duration,
) {
    let key = conn.key();
    let client = ClientInfo {
        protocol: Protocol::Tcp,
        flow: key,
    };

    match dialer.dial(&service_id, &client).await {
        Ok(stream) => {
            info!(client = %key.client, intercept = %key.intercept, service = %service_id, "TCP flow opened");
            let result = relay(conn.as_ref(), stream).await;
            conn.linger(linger).await;
            info!(
                client = %key.client,
                service = %service_id,
                sent = result.upstream_to_client,
                received = result.client_to_upstream,
                "TCP flow closed"
            );
        }
        Err(e) => {
            stats.dial_failures.fetch_add(1, Ordering::Relaxed);
            warn!(client = %key.client, service = %service_id, "Dial failed: {}", e);
        }
    }

    // A newer flow may already reuse the key
    flows.remove_if(&key, |_, handle| Arc::ptr_eq(&handle.conn, &conn));
    conn.close().await;
    stats.flows_closed.fetch_add(1, Ordering::Relaxed);
}
