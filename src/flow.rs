//! Flow identification and intercept addresses

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::io::PacketBuffer;
use crate::packet::{self, PacketError, IPPROTO_TCP, IPPROTO_UDP};

/// Transport protocol of an intercepted flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// IP protocol number
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Tcp => IPPROTO_TCP,
            Self::Udp => IPPROTO_UDP,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(format!("unknown protocol '{other}'")),
        }
    }
}

/// Identifies one client flow: the client endpoint and the intercept
/// endpoint it is talking to.
///
/// Used as the key of both the TCP flow table and the UDP connection map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Client (source) endpoint
    pub client: SocketAddrV4,
    /// Intercept (destination) endpoint
    pub intercept: SocketAddrV4,
}

impl FlowKey {
    #[must_use]
    pub const fn new(client: SocketAddrV4, intercept: SocketAddrV4) -> Self {
        Self { client, intercept }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.client, self.intercept)
    }
}

/// A synthetic address representing a service inside the virtual network.
///
/// Written as `proto:ip:port` or `proto:ip/prefix:port`, e.g. `tcp:10.0.0.1:80`
/// or `udp:100.64.0.0/24:53`. The prefix selects the route installed for the
/// address; packets match on the host address and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptAddress {
    pub protocol: Protocol,
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
    pub port: u16,
}

impl InterceptAddress {
    /// Host address with a /32 route
    #[must_use]
    pub const fn new(protocol: Protocol, ip: Ipv4Addr, port: u16) -> Self {
        Self {
            protocol,
            ip,
            prefix_len: 32,
            port,
        }
    }

    /// Socket address matched against packet destinations
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }

    /// Route prefix covering this address
    #[must_use]
    pub fn prefix(&self) -> ipnet::Ipv4Net {
        ipnet::Ipv4Net::new(self.ip, self.prefix_len)
            .map_or_else(|_| ipnet::Ipv4Net::from(self.ip), |net| net.trunc())
    }
}

impl fmt::Display for InterceptAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix_len == 32 {
            write!(f, "{}:{}:{}", self.protocol, self.ip, self.port)
        } else {
            write!(f, "{}:{}/{}:{}", self.protocol, self.ip, self.prefix_len, self.port)
        }
    }
}

impl FromStr for InterceptAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, ':');
        let (Some(proto), Some(host), Some(port)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("invalid intercept address '{s}', expected proto:ip:port"));
        };
        let protocol: Protocol = proto.parse()?;
        let (ip, prefix_len) = match host.split_once('/') {
            Some((ip, prefix)) => {
                let prefix_len: u8 = prefix
                    .parse()
                    .map_err(|_| format!("invalid prefix length '{prefix}'"))?;
                if prefix_len > 32 {
                    return Err(format!("invalid prefix length '{prefix}'"));
                }
                (ip, prefix_len)
            }
            None => (host, 32),
        };
        let ip: Ipv4Addr = ip.parse().map_err(|_| format!("invalid IPv4 address '{ip}'"))?;
        let port: u16 = port.parse().map_err(|_| format!("invalid port '{port}'"))?;
        Ok(Self {
            protocol,
            ip,
            prefix_len,
            port,
        })
    }
}

impl Serialize for InterceptAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InterceptAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A frame read off the device, owning its pooled buffer.
///
/// `range` starts out selecting the transport segment inside the frame and
/// is narrowed as headers are consumed. The buffer goes back to the pool
/// when the packet is dropped.
#[derive(Debug)]
pub struct InboundPacket {
    buffer: PacketBuffer,
    /// Source address of the frame
    pub src: Ipv4Addr,
    /// Destination address of the frame
    pub dst: Ipv4Addr,
    /// Transport protocol number
    pub protocol: u8,
    range: Range<usize>,
}

impl InboundPacket {
    /// Decode the IPv4 header of a filled buffer.
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the frame is not a valid IPv4 packet.
    pub fn from_frame(buffer: PacketBuffer) -> Result<Self, PacketError> {
        let (src, dst, protocol, range) = {
            let l3 = packet::decode(&buffer)?;
            let start = l3.header_len;
            (l3.src, l3.dst, l3.protocol, start..start + l3.payload.len())
        };
        Ok(Self {
            buffer,
            src,
            dst,
            protocol,
            range,
        })
    }

    /// Bytes currently selected
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.range.clone()]
    }

    /// Narrow the selection to `start..end`, relative to the current one
    pub fn narrow(&mut self, start: usize, end: usize) {
        let len = self.range.len();
        let end = end.min(len);
        let start = start.min(end);
        let base = self.range.start;
        self.range = base + start..base + end;
    }

    /// Drop the first `n` selected bytes
    pub fn advance(&mut self, n: usize) {
        let len = self.range.len();
        self.narrow(n.min(len), len);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.range.len()
    }
}
