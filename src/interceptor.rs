//! Packet interception entry point
//!
//! [`Interceptor`] owns the per-protocol registries and, once started, the
//! ingestion loop reading frames off the TUN device:
//!
//! ```text
//! device read ──► decode IPv4 ──┬── TCP ──► TcpFlowDispatcher ──► flow queue
//!                               └── UDP ──► UdpManager events  ──► connection queue
//! ```
//!
//! Frames are read into pooled buffers which travel with the packet until
//! the consumer drops it. Once every buffer is in flight the loop waits,
//! pushing back on the device.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::device::{DeviceWriter, FrameSink};
use crate::dial::Dialer;
use crate::error::{InterceptError, Result};
use crate::flow::{FlowKey, InboundPacket, InterceptAddress, Protocol};
use crate::io::{PacketBuffer, PacketBufferPool};
use crate::packet::{TcpHeader, IPPROTO_TCP, IPPROTO_UDP};
use crate::registry::{ServiceId, ServiceRegistry};
use crate::route::RoutingTable;
use crate::service::{InterceptResolver, Service};
use crate::tcp::{TcpFlowDispatcher, TcpSettings};
use crate::udp::{UdpManager, UdpManagerHandle};

/// Ingestion counters
#[derive(Debug, Default)]
pub struct InterceptorStats {
    packets_read: AtomicU64,
    bytes_read: AtomicU64,
    tcp_packets: AtomicU64,
    udp_packets: AtomicU64,
    decode_errors: AtomicU64,
    unroutable: AtomicU64,
    ignored: AtomicU64,
}

impl InterceptorStats {
    #[must_use]
    pub fn snapshot(&self) -> InterceptorStatsSnapshot {
        InterceptorStatsSnapshot {
            packets_read: self.packets_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            tcp_packets: self.tcp_packets.load(Ordering::Relaxed),
            udp_packets: self.udp_packets.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            tcp_flows: 0,
        }
    }
}

/// Point-in-time copy of [`InterceptorStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InterceptorStatsSnapshot {
    pub packets_read: u64,
    pub bytes_read: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    /// Frames that were not valid IPv4
    pub decode_errors: u64,
    /// TCP segments for addresses without a service
    pub unroutable: u64,
    /// Frames of other transport protocols
    pub ignored: u64,
    /// Live TCP flows
    pub tcp_flows: usize,
}

struct Running {
    cancel: CancellationToken,
    tcp: Arc<TcpFlowDispatcher>,
    udp: UdpManagerHandle,
    ingest: JoinHandle<()>,
    manager: JoinHandle<()>,
}

/// Intercepts service traffic arriving on a TUN device
pub struct Interceptor {
    config: Config,
    dialer: Arc<dyn Dialer>,
    routes: Arc<dyn RoutingTable>,
    tcp_registry: Arc<ServiceRegistry>,
    udp_registry: Arc<ServiceRegistry>,
    /// Addresses installed per service, for route removal
    intercepts: DashMap<ServiceId, Vec<InterceptAddress>>,
    stats: Arc<InterceptorStats>,
    running: Mutex<Option<Running>>,
}

impl Interceptor {
    pub fn new(config: Config, dialer: Arc<dyn Dialer>, routes: Arc<dyn RoutingTable>) -> Self {
        Self {
            config,
            dialer,
            routes,
            tcp_registry: Arc::new(ServiceRegistry::new(Protocol::Tcp)),
            udp_registry: Arc::new(ServiceRegistry::new(Protocol::Udp)),
            intercepts: DashMap::new(),
            stats: Arc::new(InterceptorStats::default()),
            running: Mutex::new(None),
        }
    }

    fn registry(&self, protocol: Protocol) -> &ServiceRegistry {
        match protocol {
            Protocol::Tcp => &self.tcp_registry,
            Protocol::Udp => &self.udp_registry,
        }
    }

    /// Start intercepting `service` on the addresses `resolver` allocates.
    ///
    /// Each address is registered and routed into the TUN device.
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::Resolve` if no address can be allocated, or
    /// `InterceptError::Route` if a route cannot be installed.
    pub fn intercept(
        &self,
        service: &Service,
        resolver: &dyn InterceptResolver,
    ) -> Result<Vec<InterceptAddress>> {
        let addrs = resolver.intercept_addresses(service)?;
        let tun = &self.config.tun;

        for addr in &addrs {
            self.registry(addr.protocol)
                .register(&service.id, addr.socket_addr());
            self.intercepts
                .entry(Arc::clone(&service.id))
                .or_default()
                .push(*addr);
            self.routes.add_route(tun.address, addr.prefix(), &tun.name)?;
        }

        info!(service = %service.name, id = %service.id, addresses = addrs.len(), "Intercepting service");
        Ok(addrs)
    }

    /// Stop intercepting a service.
    ///
    /// Live flows are left to finish. With `remove_route` the routes
    /// installed by [`intercept`](Self::intercept) are removed too.
    ///
    /// # Errors
    ///
    /// Returns the first `InterceptError::Route` hit while removing routes;
    /// every route is still attempted.
    pub fn stop_intercepting(&self, service_id: &str, remove_route: bool) -> Result<()> {
        let tcp = self.tcp_registry.unregister(service_id);
        let udp = self.udp_registry.unregister(service_id);
        let addrs = self
            .intercepts
            .remove(service_id)
            .map(|(_, addrs)| addrs)
            .unwrap_or_default();
        info!(service = %service_id, tcp = tcp.len(), udp = udp.len(), "Stopped intercepting service");

        if !remove_route {
            return Ok(());
        }
        let tun = &self.config.tun;
        let mut first_error = None;
        for addr in &addrs {
            if let Err(e) = self.routes.remove_route(tun.address, addr.prefix(), &tun.name) {
                warn!(service = %service_id, "Failed to remove route: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Start ingesting frames from `device`.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::AlreadyStarted` if already running.
    pub fn start<D>(&self, device: D) -> Result<()>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(InterceptError::AlreadyStarted);
        }

        let (reader, writer) = tokio::io::split(device);
        let sink: Arc<dyn FrameSink> = Arc::new(DeviceWriter::new(writer));

        let tcp = Arc::new(TcpFlowDispatcher::new(
            Arc::clone(&self.tcp_registry),
            Arc::clone(&self.dialer),
            Arc::clone(&sink),
            TcpSettings::from_config(&self.config),
        ));
        let (manager, udp) = UdpManager::new(
            &self.config.udp,
            Arc::clone(&self.udp_registry),
            Arc::clone(&self.dialer),
            sink,
        );
        let manager = tokio::spawn(manager.run());

        let pool = PacketBufferPool::new(
            self.config.tun.read_buffers,
            usize::from(self.config.tun.mtu),
        );
        let cancel = CancellationToken::new();
        let ingest = tokio::spawn(ingest(
            reader,
            pool,
            Arc::clone(&tcp),
            udp.clone(),
            Arc::clone(&self.stats),
            cancel.clone(),
        ));

        info!(
            device = %self.config.tun.name,
            mtu = self.config.tun.mtu,
            buffers = self.config.tun.read_buffers,
            "Interceptor started"
        );
        *running = Some(Running {
            cancel,
            tcp,
            udp,
            ingest,
            manager,
        });
        Ok(())
    }

    /// Stop ingestion and close every flow.
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::NotStarted` if not running.
    pub async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Err(InterceptError::NotStarted);
        };

        running.cancel.cancel();
        if let Err(e) = running.ingest.await {
            warn!("Ingestion task failed: {}", e);
        }
        running.tcp.close_all().await;
        running.udp.shutdown().await;
        if let Err(e) = running.manager.await {
            warn!("UDP manager task failed: {}", e);
        }

        let stats = self.stats();
        info!(
            packets = stats.packets_read,
            tcp = stats.tcp_packets,
            udp = stats.udp_packets,
            decode_errors = stats.decode_errors,
            "Interceptor stopped"
        );
        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    #[must_use]
    pub fn stats(&self) -> InterceptorStatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        if let Some(running) = self.running.lock().as_ref() {
            snapshot.tcp_flows = running.tcp.connection_count();
        }
        snapshot
    }

    /// Open UDP flows; empty when not running
    ///
    /// # Errors
    ///
    /// Returns `InterceptError::Closed` if the UDP manager has stopped.
    pub async fn udp_connections(&self) -> Result<Vec<FlowKey>> {
        let udp = self.running.lock().as_ref().map(|r| r.udp.clone());
        match udp {
            Some(udp) => udp.connection_keys().await,
            None => Ok(Vec::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }
}

async fn ingest<R>(
    mut reader: R,
    pool: PacketBufferPool,
    tcp: Arc<TcpFlowDispatcher>,
    udp: UdpManagerHandle,
    stats: Arc<InterceptorStats>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    debug!("Ingestion loop started");
    loop {
        let buffer = tokio::select! {
            () = cancel.cancelled() => break,
            buffer = pool.acquire() => buffer,
        };
        let Some(mut buffer) = buffer else {
            break;
        };

        let read = tokio::select! {
            () = cancel.cancelled() => break,
            read = reader.read(buffer.as_mut_full()) => read,
        };
        match read {
            Ok(0) => {
                info!("Device closed");
                break;
            }
            Ok(n) => buffer.set_len(n),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Device read failed: {}", e);
                break;
            }
        }
        stats.packets_read.fetch_add(1, Ordering::Relaxed);
        stats.bytes_read.fetch_add(buffer.len() as u64, Ordering::Relaxed);

        match dispatch(buffer, &tcp, &udp, &stats).await {
            Ok(()) => {}
            Err(InterceptError::Closed) => {
                debug!("UDP manager stopped, ending ingestion");
                break;
            }
            Err(e @ InterceptError::NoServiceRegistered { .. }) => trace!("{}", e),
            Err(e) => debug!("Dropping frame: {}", e),
        }
    }
    pool.close();
    debug!("Ingestion loop stopped");
}

async fn dispatch(
    buffer: PacketBuffer,
    tcp: &TcpFlowDispatcher,
    udp: &UdpManagerHandle,
    stats: &InterceptorStats,
) -> Result<()> {
    let packet = InboundPacket::from_frame(buffer).map_err(|e| {
        stats.decode_errors.fetch_add(1, Ordering::Relaxed);
        e
    })?;

    match packet.protocol {
        IPPROTO_TCP => {
            stats.tcp_packets.fetch_add(1, Ordering::Relaxed);
            let intercept = {
                let header = TcpHeader::new_checked(packet.data())?;
                SocketAddrV4::new(packet.dst, header.dst_port())
            };
            if !tcp.enqueue(packet).await? {
                stats.unroutable.fetch_add(1, Ordering::Relaxed);
                return Err(InterceptError::NoServiceRegistered {
                    intercept,
                    protocol: Protocol::Tcp,
                });
            }
        }
        IPPROTO_UDP => {
            stats.udp_packets.fetch_add(1, Ordering::Relaxed);
            udp.queue_datagram(packet).await?;
        }
        other => {
            stats.ignored.fetch_add(1, Ordering::Relaxed);
            trace!(protocol = other, "Ignoring frame");
        }
    }
    Ok(())
}
