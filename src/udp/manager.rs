//! UDP virtual connection manager
//!
//! A single actor task owns the connection table. Everything else talks to
//! it through a [`UdpManagerHandle`]:
//!
//! - `Datagram`: route a client datagram, opening a connection on first use
//! - `Error`: report an ingestion error
//! - `Connections`: list the open flows
//! - `Shutdown`: close every connection and stop
//!
//! A periodic sweep drops connections the expiration policy considers idle.
//! Closed connections are removed lazily when next looked up.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::conn::UdpVirtualConnection;
use super::policy::{
    admission_from_config, expiration_from_config, Admission, ConnExpirationPolicy, NewConnPolicy,
};
use crate::config::UdpConfig;
use crate::device::FrameSink;
use crate::dial::{ClientInfo, Dialer};
use crate::error::{InterceptError, Result};
use crate::flow::{FlowKey, InboundPacket, Protocol};
use crate::io::{relay, PacketBufferPool, MAX_FRAME_SIZE};
use crate::packet::{UdpHeader, UDP_HEADER_LEN};
use crate::registry::{ServiceId, ServiceRegistry};

/// Message for the manager task
#[derive(Debug)]
pub enum ManagerEvent {
    /// Client datagram selecting the whole UDP header and payload
    Datagram(InboundPacket),
    Error(InterceptError),
    Connections(oneshot::Sender<Vec<FlowKey>>),
    Shutdown,
}

/// Manager counters
#[derive(Debug, Default)]
pub struct UdpManagerStats {
    created: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
    denied: AtomicU64,
    unroutable: AtomicU64,
}

impl UdpManagerStats {
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Connections dropped to make room for new ones
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Datagrams refused by the admission policy
    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    /// Datagrams for addresses with no registered service
    pub fn unroutable(&self) -> u64 {
        self.unroutable.load(Ordering::Relaxed)
    }
}

/// Sender side of the manager's event queue
#[derive(Debug, Clone)]
pub struct UdpManagerHandle {
    events: mpsc::Sender<ManagerEvent>,
    stats: Arc<UdpManagerStats>,
}

impl UdpManagerHandle {
    /// Queue an event, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::Closed` if the manager has stopped.
    pub async fn queue_event(&self, event: ManagerEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| InterceptError::Closed)
    }

    /// Queue a client datagram
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::Closed` if the manager has stopped.
    pub async fn queue_datagram(&self, packet: InboundPacket) -> Result<()> {
        self.queue_event(ManagerEvent::Datagram(packet)).await
    }

    /// Report an error to the manager
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::Closed` if the manager has stopped.
    pub async fn queue_error(&self, err: InterceptError) -> Result<()> {
        self.queue_event(ManagerEvent::Error(err)).await
    }

    /// Keys of the open connections
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::Closed` if the manager has stopped.
    pub async fn connection_keys(&self) -> Result<Vec<FlowKey>> {
        let (tx, rx) = oneshot::channel();
        self.queue_event(ManagerEvent::Connections(tx)).await?;
        rx.await.map_err(|_| InterceptError::Closed)
    }

    /// Ask the manager to close everything and stop
    pub async fn shutdown(&self) {
        if self.queue_event(ManagerEvent::Shutdown).await.is_err() {
            debug!("UDP manager already stopped");
        }
    }

    #[must_use]
    pub fn stats(&self) -> &UdpManagerStats {
        &self.stats
    }

    /// Whether the manager task has stopped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Owner of every UDP virtual connection
pub struct UdpManager {
    registry: Arc<ServiceRegistry>,
    dialer: Arc<dyn Dialer>,
    sink: Arc<dyn FrameSink>,
    admission: Box<dyn NewConnPolicy>,
    expiration: Box<dyn ConnExpirationPolicy>,
    conns: HashMap<FlowKey, Arc<UdpVirtualConnection>>,
    tx_pool: PacketBufferPool,
    queue_depth: usize,
    events: mpsc::Receiver<ManagerEvent>,
    stats: Arc<UdpManagerStats>,
}

impl UdpManager {
    /// Create the manager and its handle; policies come from `config`
    pub fn new(
        config: &UdpConfig,
        registry: Arc<ServiceRegistry>,
        dialer: Arc<dyn Dialer>,
        sink: Arc<dyn FrameSink>,
    ) -> (Self, UdpManagerHandle) {
        let (tx, rx) = mpsc::channel(config.event_queue_depth.max(1));
        let stats = Arc::new(UdpManagerStats::default());
        let manager = Self {
            registry,
            dialer,
            sink,
            admission: admission_from_config(config),
            expiration: expiration_from_config(config),
            conns: HashMap::new(),
            tx_pool: PacketBufferPool::new(config.tx_buffers, MAX_FRAME_SIZE),
            queue_depth: config.queue_depth,
            events: rx,
            stats: Arc::clone(&stats),
        };
        let handle = UdpManagerHandle { events: tx, stats };
        (manager, handle)
    }

    /// Replace the admission policy
    #[must_use]
    pub fn with_admission(mut self, policy: Box<dyn NewConnPolicy>) -> Self {
        self.admission = policy;
        self
    }

    /// Replace the expiration policy
    #[must_use]
    pub fn with_expiration(mut self, policy: Box<dyn ConnExpirationPolicy>) -> Self {
        self.expiration = policy;
        self
    }

    /// Process events until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        let period = self.expiration.poll_frequency();
        let mut sweep = interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(poll_secs = period.as_secs(), "UDP manager started");

        loop {
            tokio::select! {
                _ = sweep.tick() => self.drop_expired(Instant::now()),
                event = self.events.recv() => match event {
                    Some(ManagerEvent::Datagram(packet)) => self.handle_datagram(packet),
                    Some(ManagerEvent::Error(e)) => warn!("Ingestion error: {}", e),
                    Some(ManagerEvent::Connections(reply)) => {
                        let _ = reply.send(self.conns.keys().copied().collect());
                    }
                    Some(ManagerEvent::Shutdown) | None => break,
                },
            }
        }

        self.tx_pool.close();
        let count = self.conns.len();
        for (_, conn) in self.conns.drain() {
            conn.close();
        }
        info!(closed = count, "UDP manager stopped");
    }

    fn handle_datagram(&mut self, mut packet: InboundPacket) {
        let (key, payload_end) = match UdpHeader::new_checked(packet.data()) {
            Ok(udp) => (
                FlowKey::new(
                    SocketAddrV4::new(packet.src, udp.src_port()),
                    SocketAddrV4::new(packet.dst, udp.dst_port()),
                ),
                UDP_HEADER_LEN + udp.payload().len(),
            ),
            Err(e) => {
                debug!("Dropping malformed datagram: {}", e);
                return;
            }
        };
        packet.narrow(UDP_HEADER_LEN, payload_end);

        let conn = match self.get_write_queue(&key) {
            Some(conn) => conn,
            None => match self.open(key) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(flow = %key, "Dropping datagram: {}", e);
                    return;
                }
            },
        };
        if conn.accept(packet) {
            trace!(flow = %key, "Datagram queued");
        }
    }

    fn open(&mut self, key: FlowKey) -> Result<Arc<UdpVirtualConnection>> {
        let Some(service_id) = self.registry.lookup(&key.intercept) else {
            self.stats.unroutable.fetch_add(1, Ordering::Relaxed);
            return Err(InterceptError::NoServiceRegistered {
                intercept: key.intercept,
                protocol: Protocol::Udp,
            });
        };
        self.create_write_queue(key, service_id)
    }

    /// Open connection for `key`; closed connections are removed
    pub fn get_write_queue(&mut self, key: &FlowKey) -> Option<Arc<UdpVirtualConnection>> {
        let conn = self.conns.get(key)?;
        if conn.is_closed() {
            self.conns.remove(key);
            return None;
        }
        Some(Arc::clone(conn))
    }

    /// Admit and open a connection for `key`, then spawn its bridge.
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::ConnectionLimitExceeded` if the admission
    /// policy refuses the connection.
    pub fn create_write_queue(
        &mut self,
        key: FlowKey,
        service_id: ServiceId,
    ) -> Result<Arc<UdpVirtualConnection>> {
        // Closed connections no longer hold a slot
        self.conns.retain(|_, conn| !conn.is_closed());
        match self.admission.decide(self.conns.len()) {
            Admission::Allow => {}
            Admission::Deny => {
                self.stats.denied.fetch_add(1, Ordering::Relaxed);
                return Err(InterceptError::ConnectionLimitExceeded {
                    current: self.conns.len(),
                });
            }
            Admission::AllowDropLru => self.drop_lru(),
        }

        let conn = Arc::new(UdpVirtualConnection::new(
            key,
            self.queue_depth,
            self.tx_pool.clone(),
            Arc::clone(&self.sink),
        ));
        self.conns.insert(key, Arc::clone(&conn));
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        info!(client = %key.client, intercept = %key.intercept, service = %service_id, "UDP flow opened");

        let dialer = Arc::clone(&self.dialer);
        let bridge_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            bridge(service_id, bridge_conn, dialer).await;
        });
        Ok(conn)
    }

    /// Close and remove every connection the expiration policy rejects
    pub fn drop_expired(&mut self, now: Instant) {
        let before = self.conns.len();
        let expiration = &self.expiration;
        let stats = &self.stats;
        self.conns.retain(|key, conn| {
            if conn.is_closed() {
                return false;
            }
            if expiration.is_expired(now, conn.last_used()) {
                debug!(flow = %key, "UDP connection expired");
                stats.expired.fetch_add(1, Ordering::Relaxed);
                conn.close();
                return false;
            }
            true
        });
        let dropped = before - self.conns.len();
        if dropped > 0 {
            debug!(dropped, remaining = self.conns.len(), "Expiration sweep");
        }
    }

    /// Close and remove the least recently used connection
    pub fn drop_lru(&mut self) {
        let Some(key) = self
            .conns
            .iter()
            .min_by_key(|(_, conn)| conn.last_used())
            .map(|(key, _)| *key)
        else {
            return;
        };
        if let Some(conn) = self.conns.remove(&key) {
            conn.close();
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
            debug!(flow = %key, "Evicted least recently used UDP connection");
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }
}

async fn bridge(service_id: ServiceId, conn: Arc<UdpVirtualConnection>, dialer: Arc<dyn Dialer>) {
    let key = conn.key();
    let client = ClientInfo {
        protocol: Protocol::Udp,
        flow: key,
    };
    match dialer.dial(&service_id, &client).await {
        Ok(stream) => {
            let result = relay(conn.as_ref(), stream).await;
            info!(
                client = %key.client,
                service = %service_id,
                sent = result.upstream_to_client,
                received = result.client_to_upstream,
                "UDP flow closed"
            );
        }
        Err(e) => warn!(client = %key.client, service = %service_id, "Dial failed: {}", e),
    }
    conn.close();
}
